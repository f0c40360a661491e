/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use log::{debug, trace, warn};

use crate::{
    address::{VirtAddr, PAGE_SIZE, STACK_GROWTH_SLACK, USER_STACK},
    frame_pool::{FrameId, FramePool},
    modules::{filesystem::FileSystem, persistent_storage::PersistentStorageModule},
    page::{Page, PageInitializer, PageKind, PageRef, PageType, SpaceId},
    page_table::PteFlags,
    vm::{AddressSpace, AddressSpaces, Vm},
    vm_error::VmError,
};

/// What the trap handler knows about a page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    /// faulting address
    pub addr: VirtAddr,
    /// raised while running user code
    pub user: bool,
    pub write: bool,
    /// no mapping was present, as opposed to a protection violation
    pub not_present: bool,
    /// user stack pointer of the trap frame, only meaningful for user faults
    pub rsp: VirtAddr,
}

impl<F: FileSystem, S: PersistentStorageModule> Vm<F, S> {
    /// Resolves a page fault in `space`.
    ///
    /// On success the faulting access can be restarted. An error means the
    /// access was illegal and the process has to be terminated with
    /// [`VmError::exit_status`].
    pub fn try_handle_fault(&self, space: SpaceId, fault: FaultInfo) -> Result<(), VmError> {
        let _fault_guard = self.fault_lock.lock();
        let mut spaces = self.spaces.lock();
        let mut pool = self.frames.lock();

        trace!(
            "fault at {} in {:?} ({}, {}, {})",
            fault.addr,
            space,
            if fault.user { "user" } else { "kernel" },
            if fault.write { "write" } else { "read" },
            if fault.not_present { "not present" } else { "protection" },
        );

        let result = self.resolve_fault(&mut spaces, &mut pool, space, &fault);
        if let Err(err) = &result {
            warn!("unresolved fault in {:?}: {}", space, err);
        }
        result
    }

    fn resolve_fault(
        &self,
        spaces: &mut AddressSpaces,
        pool: &mut FramePool,
        space: SpaceId,
        fault: &FaultInfo,
    ) -> Result<(), VmError> {
        let addr = fault.addr;
        if addr.is_kernel() {
            return Err(if fault.user {
                VmError::KernelAddress(addr)
            } else {
                VmError::NotPresent(addr)
            });
        }

        let upage = addr.page_round_down();
        let aspace = spaces.get_mut(space)?;

        // faults raised inside the kernel carry the kernel's stack pointer
        let rsp = if fault.user { fault.rsp } else { aspace.rsp };
        if !aspace.spt.contains(upage) && is_stack_access(aspace, addr, rsp) {
            self.grow_stack(aspace, addr)?;
        }

        let page = aspace.spt.find(upage).ok_or(VmError::NotPresent(addr))?;
        if fault.write && !page.writable {
            return Err(VmError::WriteProtected(addr));
        }

        if page.is_resident() {
            if fault.write && !page.cow_writable {
                return self.break_cow(spaces, pool, space, upage);
            }
            // another thread resolved the same fault first
            return Ok(());
        }

        self.claim_page(spaces, pool, space, upage)
    }

    /// Extends the stack region down to the page of `addr`.
    ///
    /// Only pages are registered here, the faulting one is materialized by
    /// the caller and the others on their first access.
    fn grow_stack(&self, aspace: &mut AddressSpace, addr: VirtAddr) -> Result<(), VmError> {
        let target = addr.page_round_down();
        let new_pages = (aspace.stack_bottom.0 - target.0) / PAGE_SIZE;
        if aspace.stack_pages() + new_pages > self.config.max_stack_pages {
            return Err(VmError::StackOverflow(addr));
        }

        let mut va = aspace.stack_bottom;
        while va > target {
            va = VirtAddr(va.0 - PAGE_SIZE);

            let mut page = Page::new_uninit(va, true, PageType::Anon, PageInitializer::Zero);
            page.is_stack = true;

            if let Err(err) = aspace.spt.insert(page) {
                // something else lives between the stack and the access
                let mut undo = VirtAddr(va.0 + PAGE_SIZE);
                while undo < aspace.stack_bottom {
                    aspace.spt.remove(undo);
                    undo = VirtAddr(undo.0 + PAGE_SIZE);
                }
                return Err(err);
            }
        }

        debug!(
            "stack grown by {} page(s) to {}",
            new_pages, target
        );
        aspace.stack_bottom = target;
        Ok(())
    }

    /// Gives the write-faulting page at `upage` a frame of its own.
    ///
    /// If the frame is still shared its content is copied to a new frame,
    /// a page that is the last referer just gets its write permission back.
    fn break_cow(
        &self,
        spaces: &mut AddressSpaces,
        pool: &mut FramePool,
        space: SpaceId,
        upage: VirtAddr,
    ) -> Result<(), VmError> {
        let page_ref = PageRef { space, va: upage };
        let (old_frame, dirty) = {
            let aspace = spaces.get_mut(space)?;
            let page = aspace
                .spt
                .find_mut(upage)
                .ok_or(VmError::NotPresent(upage))?;

            // a file handle still shared with the other side is split first
            if let PageKind::File(file_page) = &mut page.kind {
                if let Some(file) = file_page.file {
                    let mut files = self.files.lock();
                    if files.is_shared(file) {
                        let own = files.reopen(file)?;
                        files.release(file);
                        file_page.file = Some(own);
                    }
                }
            }

            let frame = page.frame.ok_or(VmError::NotPresent(upage))?;
            (frame, aspace.page_table.is_dirty(upage))
        };

        let frame = if pool.referers(old_frame).len() > 1 {
            let new_frame = self.acquire_frame(spaces, pool, Some(old_frame))?;
            pool.copy_frame(old_frame, new_frame);
            pool.remove_referer(old_frame, page_ref);
            pool.add_referer(new_frame, page_ref);
            new_frame
        } else {
            old_frame
        };

        let aspace = spaces.get_mut(space)?;
        let page = aspace
            .spt
            .find_mut(upage)
            .ok_or(VmError::NotPresent(upage))?;
        page.frame = Some(frame);
        page.cow_writable = true;

        aspace.page_table.set_page(upage, frame, page.map_writable());
        aspace.page_table.set_flag(upage, PteFlags::DIRTY, dirty);

        debug!(
            "cow break of {} in {:?}: {:?} -> {:?}",
            upage, space, old_frame, frame
        );
        Ok(())
    }

    /// Gets a frame for the non-resident page at `upage`, fills it and maps
    /// it. The mapping starts out clean, a read fault leaves it that way.
    pub(crate) fn claim_page(
        &self,
        spaces: &mut AddressSpaces,
        pool: &mut FramePool,
        space: SpaceId,
        upage: VirtAddr,
    ) -> Result<(), VmError> {
        let frame = self.acquire_frame(spaces, pool, None)?;

        match self.fill_frame(spaces, pool, space, upage, frame) {
            Ok(()) => {
                trace!("claimed {:?} for {} in {:?}", frame, upage, space);
                Ok(())
            }
            Err(err) => {
                pool.reclaim(frame);
                Err(err)
            }
        }
    }

    fn fill_frame(
        &self,
        spaces: &mut AddressSpaces,
        pool: &mut FramePool,
        space: SpaceId,
        upage: VirtAddr,
        frame: FrameId,
    ) -> Result<(), VmError> {
        let aspace = spaces.get_mut(space)?;
        let page = aspace
            .spt
            .find_mut(upage)
            .ok_or(VmError::NotPresent(upage))?;

        let bytes = pool.bytes_mut(frame);
        self.initialize_page(page, bytes)?;
        self.swap_in_page(page, bytes)?;

        page.frame = Some(frame);
        page.swapped_out = false;
        page.cow_writable = true;
        pool.add_referer(frame, PageRef { space, va: upage });
        aspace.page_table.set_page(upage, frame, page.map_writable());
        Ok(())
    }
}

/// Is `addr` a push or call just below the current stack?
fn is_stack_access(aspace: &AddressSpace, addr: VirtAddr, rsp: VirtAddr) -> bool {
    addr < aspace.stack_bottom
        && addr.0 < USER_STACK
        && addr.0.saturating_add(STACK_GROWTH_SLACK) >= rsp.0
}
