use log::debug;

use crate::{
    address::{VirtAddr, KERN_BASE, PAGE_SIZE},
    modules::{
        filesystem::{FileId, FileSystem},
        persistent_storage::PersistentStorageModule,
    },
    page::{FilePage, Page, PageInitializer, PageKind, PageType, SpaceId},
    vm::Vm,
    vm_error::VmError,
};

impl<F: FileSystem, S: PersistentStorageModule> Vm<F, S> {
    /// The `mmap` system call: maps `length` bytes of `file` starting at
    /// `offset` to `addr`.
    ///
    /// Returns the start of the mapping. Every page gets its own handle to
    /// the file, `file` itself stays with the caller.
    pub fn mmap(
        &self,
        space: SpaceId,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: FileId,
        offset: usize,
    ) -> Result<VirtAddr, VmError> {
        if addr.is_null() || addr.is_kernel() || length == 0 || offset % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        if !addr.is_page_aligned() {
            return Err(VmError::NotPageAligned(addr));
        }
        if self.files.lock().length(file)? == 0 {
            return Err(VmError::InvalidArgument);
        }

        self.do_mmap(space, addr, length, writable, file, offset)
    }

    /// Registers the lazily loaded file-backed pages of a mapping.
    ///
    /// Pages past the end of the file are registered too and read as zero.
    /// The call either registers every page or none.
    pub(crate) fn do_mmap(
        &self,
        space: SpaceId,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: FileId,
        offset: usize,
    ) -> Result<VirtAddr, VmError> {
        if !addr.is_page_aligned() {
            return Err(VmError::NotPageAligned(addr));
        }

        let file_length = self.files.lock().length(file)?;
        if offset >= file_length {
            return Err(VmError::InvalidArgument);
        }

        let page_count = length / PAGE_SIZE + (length % PAGE_SIZE != 0) as usize;
        match addr.checked_add_pages(page_count) {
            Some(end) if end.0 <= KERN_BASE => {}
            _ => return Err(VmError::KernelAddress(VirtAddr(KERN_BASE.max(addr.0)))),
        }

        let mut spaces = self.spaces.lock();
        let aspace = spaces.get_mut(space)?;

        for i in 0..page_count {
            let va = VirtAddr(addr.0 + i * PAGE_SIZE);
            if aspace.spt.contains(va) {
                return Err(VmError::AlreadyMapped(va));
            }
        }

        // one handle per page, taken up front so a failure leaves nothing behind
        let mut handles = Vec::with_capacity(page_count);
        {
            let mut files = self.files.lock();
            for _ in 0..page_count {
                match files.reopen(file) {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        for handle in handles {
                            files.release(handle);
                        }
                        return Err(err);
                    }
                }
            }
        }

        let mut left = length.min(file_length - offset);
        let mut file_offset = offset;
        for (i, handle) in handles.into_iter().enumerate() {
            let va = VirtAddr(addr.0 + i * PAGE_SIZE);
            let data_bytes = left.min(PAGE_SIZE);

            let chunk = FilePage {
                file: Some(handle),
                offset: file_offset,
                data_bytes,
                zero_bytes: PAGE_SIZE - data_bytes,
                is_last: i + 1 == page_count,
            };

            aspace.spt.insert(Page::new_uninit(
                va,
                writable,
                PageType::File,
                PageInitializer::FileChunk(chunk),
            ))?;

            left -= data_bytes;
            file_offset += data_bytes;
        }

        debug!(
            "mmap {:?} at {} ({} pages, offset {})",
            file, addr, page_count, offset
        );
        Ok(addr)
    }

    /// The `munmap` system call: tears down the mapping containing `addr`.
    ///
    /// Walks from the page of `addr` to the last page of its mapping, writing
    /// back dirty pages and dropping their file handles. Afterwards accesses
    /// to the range fault like any unmapped address.
    pub fn munmap(&self, space: SpaceId, addr: VirtAddr) -> Result<(), VmError> {
        let mut spaces = self.spaces.lock();
        let mut pool = self.frames.lock();
        let aspace = spaces.get_mut(space)?;

        let mut va = addr.page_round_down();
        let mut result = Ok(());
        loop {
            let is_last = match aspace.spt.find(va).map(|page| &page.kind) {
                Some(PageKind::File(file_page)) => file_page.is_last,
                Some(PageKind::Uninit {
                    init: PageInitializer::FileChunk(chunk),
                    ..
                }) => chunk.is_last,
                _ => return Err(VmError::InvalidMapping(va)),
            };

            let dirty = aspace.page_table.is_dirty(va);
            if let Some(mut page) = aspace.spt.remove(va) {
                let destroyed = self.destroy_page(&mut page, dirty, &mut pool, space);
                if result.is_ok() {
                    result = destroyed;
                }
            }
            aspace.page_table.clear_page(va);

            if is_last {
                break;
            }
            va = VirtAddr(va.0 + PAGE_SIZE);
        }

        debug!("munmap at {} in {:?}", addr, space);
        result
    }
}
