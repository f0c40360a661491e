use log::{trace, warn};

use crate::{
    anon::{anon_destroy, anon_swap_in, anon_swap_out},
    file_backed::{file_destroy, file_swap_in, file_swap_out},
    frame_pool::FramePool,
    modules::{filesystem::FileSystem, persistent_storage::PersistentStorageModule},
    page::{AnonPage, Page, PageInitializer, PageKind, PageRef, SpaceId},
    vm::Vm,
    vm_error::VmError,
};

impl<F: FileSystem, S: PersistentStorageModule> Vm<F, S> {
    /// Runs the deferred initializer of an uninit page into `frame` and turns
    /// the page into its target type. Other pages are left as they are.
    pub(crate) fn initialize_page(&self, page: &mut Page, frame: &mut [u8]) -> Result<(), VmError> {
        let (target, init) = match page.kind {
            PageKind::Uninit { target, init } => (target, init),
            _ => return Ok(()),
        };
        debug_assert!(init.fits(target));

        page.kind = match init {
            PageInitializer::Zero => {
                frame.fill(0);
                PageKind::Anon(AnonPage::default())
            }
            PageInitializer::Segment(segment) => {
                let mut files = self.files.lock();
                let (data, rest) = frame.split_at_mut(segment.read_bytes);
                files.read_exact_at(segment.file, data, segment.offset)?;
                rest.fill(0);
                files.release(segment.file);
                PageKind::Anon(AnonPage::default())
            }
            // the file driver reads the content on swap in
            PageInitializer::FileChunk(chunk) => PageKind::File(chunk),
        };

        trace!("initialized {} as {:?}", page.va, page.page_type());
        Ok(())
    }

    /// Brings the content of a page from its backing store into `frame`
    pub(crate) fn swap_in_page(&self, page: &mut Page, frame: &mut [u8]) -> Result<(), VmError> {
        match &mut page.kind {
            PageKind::Anon(anon) => anon_swap_in(anon, frame, &self.swap),
            PageKind::File(file_page) => file_swap_in(page.va, file_page, frame, &self.files),
            PageKind::Uninit { .. } => {
                debug_assert!(false, "swap in of uninit page {}", page.va);
                Ok(())
            }
        }
    }

    /// Saves the content of a resident page to its backing store
    pub(crate) fn swap_out_page(&self, page: &mut Page, frame: &[u8], dirty: bool) -> Result<(), VmError> {
        match &mut page.kind {
            PageKind::Anon(anon) => anon_swap_out(anon, frame, &self.swap),
            PageKind::File(file_page) => file_swap_out(page.va, file_page, frame, dirty, &self.files),
            PageKind::Uninit { .. } => {
                debug_assert!(false, "swap out of uninit page {}", page.va);
                Ok(())
            }
        }
    }

    /// Releases everything `page` holds: swap slot, file handle and its
    /// share of the frame. Dirty resident file pages are written back first.
    pub(crate) fn destroy_page(
        &self,
        page: &mut Page,
        dirty: bool,
        pool: &mut FramePool,
        space: SpaceId,
    ) -> Result<(), VmError> {
        let result = {
            let frame = page.frame.map(|frame| pool.bytes(frame));
            match &mut page.kind {
                PageKind::Uninit { init, .. } => {
                    if let Some(file) = init.file() {
                        self.files.lock().release(file);
                    }
                    Ok(())
                }
                PageKind::Anon(anon) => {
                    anon_destroy(anon, &self.swap);
                    Ok(())
                }
                PageKind::File(file_page) => {
                    file_destroy(page.va, file_page, frame, dirty, &self.files)
                }
            }
        };

        if let Some(frame) = page.frame.take() {
            pool.remove_referer(frame, PageRef { space, va: page.va });
        }

        if let Err(err) = &result {
            warn!("destroy of {} in {:?} failed: {}", page.va, space, err);
        }
        result
    }
}
