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

use log::{debug, warn};

use crate::{
    address::VirtAddr,
    frame_pool::FramePool,
    modules::{filesystem::FileSystem, persistent_storage::PersistentStorageModule},
    page::{
        AnonPage, FilePage, Page, PageInitializer, PageKind, PageRef, PageType, SegmentLoad,
        SpaceId,
    },
    page_table::PteFlags,
    vm::{AddressSpaces, Vm},
    vm_error::VmError,
};

impl<F: FileSystem, S: PersistentStorageModule> Vm<F, S> {
    /// Copies every page of `src` into the empty address space `dst`.
    ///
    /// Resident pages are not copied but shared copy-on-write: both sides map
    /// the frame read-only until one of them writes. On error `dst` is left
    /// partially filled and should be destroyed by the caller.
    pub fn duplicate_address_space(&self, src: SpaceId, dst: SpaceId) -> Result<(), VmError> {
        if src == dst {
            return Err(VmError::InvalidArgument);
        }

        let mut spaces = self.spaces.lock();
        let mut pool = self.frames.lock();
        if spaces.get(dst)?.spt.len() != 0 {
            return Err(VmError::InvalidArgument);
        }

        let (addresses, stack_bottom, rsp) = {
            let parent = spaces.get(src)?;
            (parent.spt.addresses(), parent.stack_bottom, parent.rsp)
        };
        {
            let child = spaces.get_mut(dst)?;
            child.stack_bottom = stack_bottom;
            child.rsp = rsp;
        }

        for va in addresses {
            self.duplicate_page(&mut spaces, &mut pool, src, dst, va)?;
        }

        debug!("duplicated {:?} into {:?}", src, dst);
        Ok(())
    }

    /// Creates a child of `parent` holding a copy of all its pages
    pub fn fork(&self, parent: SpaceId) -> Result<SpaceId, VmError> {
        let child = self.create_address_space();

        if let Err(err) = self.duplicate_address_space(parent, child) {
            warn!("fork of {:?} failed: {}", parent, err);
            if let Err(teardown) = self.destroy_address_space(child) {
                warn!("teardown of failed child {:?}: {}", child, teardown);
            }
            return Err(err);
        }

        Ok(child)
    }

    fn duplicate_page(
        &self,
        spaces: &mut AddressSpaces,
        pool: &mut FramePool,
        src: SpaceId,
        dst: SpaceId,
        va: VirtAddr,
    ) -> Result<(), VmError> {
        let parent = spaces.get_mut(src)?;
        let page = parent.spt.find_mut(va).ok_or(VmError::NotPresent(va))?;

        let mut copy = match (page.kind, page.frame) {
            (PageKind::Uninit { target, init }, _) => {
                Page::new_uninit(va, page.writable, target, self.duplicate_initializer(init)?)
            }
            (kind, Some(frame)) => {
                // share the frame, whoever writes first gets a copy
                if let PageKind::File(FilePage {
                    file: Some(file), ..
                }) = kind
                {
                    self.files.lock().share(file);
                }

                page.cow_writable = false;
                let dirty = parent.page_table.is_dirty(va);
                parent.page_table.set_page(va, frame, false);
                parent.page_table.set_flag(va, PteFlags::DIRTY, dirty);

                let mut copy = Page::new(va, page.writable, kind);
                copy.cow_writable = false;
                copy.frame = Some(frame);
                copy
            }
            (PageKind::Anon(anon), None) => {
                let slot = match anon.slot {
                    Some(slot) => Some(self.swap.lock().duplicate_slot(slot)?),
                    None => None,
                };

                let mut copy = Page::new(va, page.writable, PageKind::Anon(AnonPage { slot }));
                copy.swapped_out = page.swapped_out;
                copy
            }
            (PageKind::File(file_page), None) => {
                // reloaded from the file on first access
                let file = match file_page.file {
                    Some(file) => Some(self.files.lock().reopen(file)?),
                    None => None,
                };
                Page::new_uninit(
                    va,
                    page.writable,
                    PageType::File,
                    PageInitializer::FileChunk(FilePage { file, ..file_page }),
                )
            }
        };
        copy.is_stack = page.is_stack;

        let (frame, dirty) = (copy.frame, parent.page_table.is_dirty(va));
        let child = spaces.get_mut(dst)?;
        child.spt.insert(copy)?;

        if let Some(frame) = frame {
            pool.add_referer(frame, PageRef { space: dst, va });
            child.page_table.set_page(va, frame, false);
            child.page_table.set_flag(va, PteFlags::DIRTY, dirty);
        }

        Ok(())
    }

    /// Deep copy of an initializer, with its own file handle
    fn duplicate_initializer(&self, init: PageInitializer) -> Result<PageInitializer, VmError> {
        Ok(match init {
            PageInitializer::Zero => PageInitializer::Zero,
            PageInitializer::Segment(segment) => PageInitializer::Segment(SegmentLoad {
                file: self.files.lock().reopen(segment.file)?,
                ..segment
            }),
            PageInitializer::FileChunk(chunk) => PageInitializer::FileChunk(FilePage {
                file: match chunk.file {
                    Some(file) => Some(self.files.lock().reopen(file)?),
                    None => None,
                },
                ..chunk
            }),
        })
    }
}
