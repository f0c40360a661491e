use log::{debug, info};
use slab::Slab;
use spin::Mutex;

use crate::{
    address::{VirtAddr, KERN_BASE, PAGE_SIZE, USER_STACK},
    anon::SwapTable,
    fault::FaultInfo,
    file_backed::FileBackend,
    frame_pool::FramePool,
    modules::{filesystem::FileSystem, persistent_storage::PersistentStorageModule},
    page::{Page, PageInfo, PageInitializer, PageType, SegmentLoad, SpaceId},
    page_table::{PageTable, PteFlags},
    supplemental_page_table::SupplementalPageTable,
    vm_config::VmConfig,
    vm_error::VmError,
};

/// Everything the VM subsystem knows about one process
pub(crate) struct AddressSpace {
    pub(crate) spt: SupplementalPageTable,
    pub(crate) page_table: PageTable,

    /// lowest page of the stack region, [`USER_STACK`] while there is no stack
    pub(crate) stack_bottom: VirtAddr,

    /// user stack pointer saved on the last kernel entry
    pub(crate) rsp: VirtAddr,
}

impl AddressSpace {
    fn new() -> Self {
        Self {
            spt: SupplementalPageTable::new(),
            page_table: PageTable::new(),
            stack_bottom: VirtAddr(USER_STACK),
            rsp: VirtAddr(USER_STACK),
        }
    }

    pub(crate) fn stack_pages(&self) -> usize {
        (USER_STACK - self.stack_bottom.0) / PAGE_SIZE
    }
}

pub(crate) struct AddressSpaces {
    spaces: Slab<AddressSpace>,
}

impl AddressSpaces {
    fn new() -> Self {
        Self {
            spaces: Slab::new(),
        }
    }

    pub(crate) fn insert(&mut self, space: AddressSpace) -> SpaceId {
        SpaceId(self.spaces.insert(space))
    }

    pub(crate) fn remove(&mut self, id: SpaceId) -> Result<AddressSpace, VmError> {
        self.spaces
            .try_remove(id.0)
            .ok_or(VmError::NoSuchAddressSpace)
    }

    pub(crate) fn get(&self, id: SpaceId) -> Result<&AddressSpace, VmError> {
        self.spaces.get(id.0).ok_or(VmError::NoSuchAddressSpace)
    }

    pub(crate) fn get_mut(&mut self, id: SpaceId) -> Result<&mut AddressSpace, VmError> {
        self.spaces.get_mut(id.0).ok_or(VmError::NoSuchAddressSpace)
    }
}

/// Counters describing the current state of a [`Vm`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmStats {
    pub live_frames: usize,
    pub free_frames: usize,
    /// frames handed out since start, fresh or recycled
    pub frame_allocations: usize,
    pub evictions: usize,
    /// frames copied to break copy-on-write sharing
    pub cow_copies: usize,
    pub swap_slots_used: usize,
    pub swap_slots: usize,
}

/// The virtual memory subsystem of the kernel.
///
/// All state lives behind spin locks, a `Vm` is shared by reference between
/// the threads that fault or call into it. Locks are only ever taken in the
/// order `fault_lock`, `spaces`, `frames`, then one of `files` or `swap`.
pub struct Vm<F: FileSystem, S: PersistentStorageModule> {
    pub(crate) config: VmConfig,

    /// serializes page fault resolution
    pub(crate) fault_lock: Mutex<()>,
    pub(crate) spaces: Mutex<AddressSpaces>,
    pub(crate) frames: Mutex<FramePool>,
    pub(crate) files: Mutex<FileBackend<F>>,
    pub(crate) swap: Mutex<SwapTable<S>>,
}

impl<F: FileSystem, S: PersistentStorageModule> Vm<F, S> {
    /// Creates the VM subsystem with `config.user_frames` frames of user
    /// memory and a swap area spanning all of `swap_storage`
    pub fn new(config: VmConfig, fs: F, swap_storage: S) -> Self {
        let swap = SwapTable::new(swap_storage);
        info!(
            "vm: {} user frames, {} swap slots, stack limit {} pages",
            config.user_frames,
            swap.slot_count(),
            config.max_stack_pages
        );

        Self {
            config,
            fault_lock: Mutex::new(()),
            spaces: Mutex::new(AddressSpaces::new()),
            frames: Mutex::new(FramePool::new(config.user_frames)),
            files: Mutex::new(FileBackend::new(fs)),
            swap: Mutex::new(swap),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Creates an empty address space
    pub fn create_address_space(&self) -> SpaceId {
        let id = self.spaces.lock().insert(AddressSpace::new());
        debug!("created address space {:?}", id);
        id
    }

    /// Tears down every page of `space`: dirty file pages are written back,
    /// swap slots and frames are freed and file handles are closed.
    ///
    /// Teardown always runs to the end, the first failed write back is
    /// reported afterwards.
    pub fn destroy_address_space(&self, space: SpaceId) -> Result<(), VmError> {
        let mut spaces = self.spaces.lock();
        let mut pool = self.frames.lock();
        let mut removed = spaces.remove(space)?;

        let mut result = Ok(());
        for va in removed.spt.addresses() {
            let dirty = removed.page_table.is_dirty(va);
            if let Some(mut page) = removed.spt.remove(va) {
                let destroyed = self.destroy_page(&mut page, dirty, &mut pool, space);
                if result.is_ok() {
                    result = destroyed;
                }
            }
            removed.page_table.clear_page(va);
        }

        debug!("destroyed address space {:?}", space);
        result
    }

    /// Registers a page at `upage` that is filled by `init` on first access
    pub fn allocate_lazy_page(
        &self,
        space: SpaceId,
        ty: PageType,
        upage: VirtAddr,
        writable: bool,
        init: PageInitializer,
    ) -> Result<(), VmError> {
        if !upage.is_page_aligned() {
            return Err(VmError::NotPageAligned(upage));
        }
        if upage.is_kernel() {
            return Err(VmError::KernelAddress(upage));
        }
        if !init.fits(ty) {
            return Err(VmError::InvalidInitializer);
        }

        let mut spaces = self.spaces.lock();
        spaces
            .get_mut(space)?
            .spt
            .insert(Page::new_uninit(upage, writable, ty, init))?;

        debug!("lazy {:?} page at {} in {:?}", ty, upage, space);
        Ok(())
    }

    /// Makes the page containing `va` resident, loading or swapping in its
    /// content. Resident pages are left alone.
    pub fn materialize(&self, space: SpaceId, va: VirtAddr) -> Result<(), VmError> {
        let _fault_guard = self.fault_lock.lock();
        let mut spaces = self.spaces.lock();
        let mut pool = self.frames.lock();

        let upage = va.page_round_down();
        let page = spaces
            .get(space)?
            .spt
            .find(upage)
            .ok_or(VmError::NotPresent(va))?;
        if page.is_resident() {
            return Ok(());
        }

        self.claim_page(&mut spaces, &mut pool, space, upage)
    }

    /// Records the user stack pointer of a kernel entry, used for stack
    /// growth on faults raised by the kernel itself
    pub fn set_stack_pointer(&self, space: SpaceId, rsp: VirtAddr) -> Result<(), VmError> {
        self.spaces.lock().get_mut(space)?.rsp = rsp;
        Ok(())
    }

    /// Creates the first, resident stack page directly below [`USER_STACK`]
    /// and returns the initial stack pointer
    pub fn setup_stack(&self, space: SpaceId) -> Result<VirtAddr, VmError> {
        let stack_bottom = VirtAddr(USER_STACK - PAGE_SIZE);
        {
            let mut spaces = self.spaces.lock();
            let aspace = spaces.get_mut(space)?;

            let mut page =
                Page::new_uninit(stack_bottom, true, PageType::Anon, PageInitializer::Zero);
            page.is_stack = true;
            aspace.spt.insert(page)?;
            aspace.stack_bottom = stack_bottom;
            aspace.rsp = VirtAddr(USER_STACK);
        }

        self.materialize(space, stack_bottom)?;
        Ok(VirtAddr(USER_STACK))
    }

    /// Registers the lazily loaded pages of one executable segment.
    ///
    /// The first `segment.read_bytes` bytes of the segment come from
    /// `segment.file` at `segment.offset`, the remaining `segment.zero_bytes`
    /// are zero. Every page gets its own handle to the file, `segment.file`
    /// itself stays with the caller.
    pub fn load_segment(
        &self,
        space: SpaceId,
        upage: VirtAddr,
        segment: SegmentLoad,
        writable: bool,
    ) -> Result<(), VmError> {
        let total = segment
            .read_bytes
            .checked_add(segment.zero_bytes)
            .ok_or(VmError::InvalidArgument)?;
        if total % PAGE_SIZE != 0 || segment.offset % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        if !upage.is_page_aligned() {
            return Err(VmError::NotPageAligned(upage));
        }
        match upage.0.checked_add(total) {
            Some(end) if end <= KERN_BASE => {}
            _ => return Err(VmError::KernelAddress(VirtAddr(KERN_BASE.max(upage.0)))),
        }

        let mut read_bytes = segment.read_bytes;
        let mut zero_bytes = segment.zero_bytes;
        let mut offset = segment.offset;
        let mut upage = upage;

        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PAGE_SIZE);
            let page_zero_bytes = PAGE_SIZE - page_read_bytes;

            let file = self.files.lock().reopen(segment.file)?;
            let init = PageInitializer::Segment(SegmentLoad {
                file,
                offset,
                read_bytes: page_read_bytes,
                zero_bytes: page_zero_bytes,
            });

            if let Err(err) = self.allocate_lazy_page(space, PageType::Anon, upage, writable, init) {
                self.files.lock().release(file);
                return Err(err);
            }

            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            offset += PAGE_SIZE;
            upage = upage
                .checked_add_pages(1)
                .ok_or(VmError::InvalidArgument)?;
        }

        Ok(())
    }

    /// Copies `buf.len()` bytes at `va` out of user memory, faulting pages
    /// in as the process itself would
    pub fn read_user(&self, space: SpaceId, va: VirtAddr, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = VirtAddr(va.0 + done);
            let offset = addr.page_offset();
            let count = (PAGE_SIZE - offset).min(buf.len() - done);

            let dest = &mut buf[done..done + count];
            self.access_page(space, addr, false, |frame| {
                dest.copy_from_slice(&frame[offset..offset + count])
            })?;
            done += count;
        }

        Ok(())
    }

    /// Copies `data` into user memory at `va`, faulting pages in and
    /// breaking copy-on-write sharing as the process itself would
    pub fn write_user(&self, space: SpaceId, va: VirtAddr, data: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < data.len() {
            let addr = VirtAddr(va.0 + done);
            let offset = addr.page_offset();
            let count = (PAGE_SIZE - offset).min(data.len() - done);

            let src = &data[done..done + count];
            self.access_page(space, addr, true, |frame| {
                frame[offset..offset + count].copy_from_slice(src)
            })?;
            done += count;
        }

        Ok(())
    }

    /// Runs `access` on the frame mapped at `addr`, taking page faults until
    /// the hardware mapping allows the access. Sets the accessed and dirty
    /// bits like the MMU does.
    fn access_page<R>(
        &self,
        space: SpaceId,
        addr: VirtAddr,
        write: bool,
        access: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, VmError> {
        loop {
            let fault = {
                let mut spaces = self.spaces.lock();
                let aspace = spaces.get_mut(space)?;
                let pte = aspace.page_table.get(addr);

                match pte {
                    Some(pte) if !write || pte.flags.contains(PteFlags::WRITABLE) => {
                        let mut pool = self.frames.lock();
                        aspace.page_table.set_flag(addr, PteFlags::ACCESSED, true);
                        if write {
                            aspace.page_table.set_flag(addr, PteFlags::DIRTY, true);
                        }
                        return Ok(access(pool.bytes_mut(pte.frame)));
                    }
                    pte => FaultInfo {
                        addr,
                        user: true,
                        write,
                        not_present: pte.is_none(),
                        rsp: aspace.rsp,
                    },
                }
            };

            self.try_handle_fault(space, fault)?;
        }
    }

    /// Metadata of the page containing `va`
    pub fn page_info(&self, space: SpaceId, va: VirtAddr) -> Option<PageInfo> {
        let spaces = self.spaces.lock();
        spaces.get(space).ok()?.spt.find(va).map(Page::info)
    }

    /// Hardware mapping bits of the page containing `va`, `None` if unmapped
    pub fn pte_flags(&self, space: SpaceId, va: VirtAddr) -> Option<PteFlags> {
        let spaces = self.spaces.lock();
        spaces
            .get(space)
            .ok()?
            .page_table
            .get(va)
            .map(|pte| pte.flags)
    }

    /// Number of pages sharing the frame of the page containing `va`,
    /// zero if that page is not resident
    pub fn frame_sharers(&self, space: SpaceId, va: VirtAddr) -> usize {
        let spaces = self.spaces.lock();
        let frame = match spaces.get(space).ok().and_then(|aspace| aspace.spt.find(va)) {
            Some(page) => page.frame,
            None => return 0,
        };

        match frame {
            Some(frame) => self.frames.lock().referers(frame).len(),
            None => 0,
        }
    }

    /// Number of pages registered in `space`
    pub fn page_count(&self, space: SpaceId) -> Result<usize, VmError> {
        Ok(self.spaces.lock().get(space)?.spt.len())
    }

    /// Number of pages the stack of `space` spans
    pub fn stack_pages(&self, space: SpaceId) -> Result<usize, VmError> {
        Ok(self.spaces.lock().get(space)?.stack_pages())
    }

    pub fn stats(&self) -> VmStats {
        let pool = self.frames.lock();
        let swap = self.swap.lock();

        VmStats {
            live_frames: pool.live_frames(),
            free_frames: pool.free_frames(),
            frame_allocations: pool.allocations,
            evictions: pool.evictions,
            cow_copies: pool.copies,
            swap_slots_used: swap.used_slots(),
            swap_slots: swap.slot_count(),
        }
    }

    /// Runs `f` on the file system, with the file lock held
    pub fn with_files<R>(&self, f: impl FnOnce(&mut F) -> R) -> R {
        f(&mut self.files.lock().fs)
    }
}
