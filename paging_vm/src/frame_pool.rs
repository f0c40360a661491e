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

use std::collections::VecDeque;

use log::{debug, trace};
use slab::Slab;
use smallvec::SmallVec;

use crate::{
    address::PAGE_SIZE,
    modules::{filesystem::FileSystem, persistent_storage::PersistentStorageModule},
    page::PageRef,
    vm::{AddressSpaces, Vm},
    vm_error::VmError,
};

/// Identifies a frame of the [`FramePool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FrameId(pub(crate) usize);

/// The physical pages handed to user processes
struct UserPool {
    pages: Vec<Box<[u8]>>,

    /// free page indices, lowest index on top
    free: Vec<usize>,
}

impl UserPool {
    fn new(page_count: usize) -> Self {
        Self {
            pages: (0..page_count)
                .map(|_| vec![0u8; PAGE_SIZE].into_boxed_slice())
                .collect(),
            free: (0..page_count).rev().collect(),
        }
    }

    fn get_page(&mut self) -> Option<usize> {
        self.free.pop()
    }

    fn free_page(&mut self, kpage: usize) {
        debug_assert!(!self.free.contains(&kpage), "double free of user page {}", kpage);
        self.free.push(kpage);
    }
}

/// One physical page in use by at least one virtual page
pub(crate) struct Frame {
    /// index of the backing page in the user pool
    kpage: usize,

    /// pages that map this frame, more than one only under copy-on-write
    pub(crate) referers: SmallVec<[PageRef; 2]>,
}

/// Registry of all frames in use, and the physical memory behind them.
///
/// `order` lists every live frame from oldest to newest allocation and is
/// the ring eviction victims are taken from.
pub(crate) struct FramePool {
    user_pool: UserPool,
    frames: Slab<Frame>,
    order: VecDeque<FrameId>,

    /// frames handed out, fresh or recycled
    pub(crate) allocations: usize,
    pub(crate) evictions: usize,
    /// frames duplicated to break copy-on-write sharing
    pub(crate) copies: usize,
}

impl FramePool {
    pub(crate) fn new(user_frames: usize) -> Self {
        Self {
            user_pool: UserPool::new(user_frames),
            frames: Slab::with_capacity(user_frames),
            order: VecDeque::with_capacity(user_frames),
            allocations: 0,
            evictions: 0,
            copies: 0,
        }
    }

    /// Takes a frame straight from the user pool, without evicting anything
    pub(crate) fn try_allocate(&mut self) -> Option<FrameId> {
        let kpage = self.user_pool.get_page()?;
        let id = FrameId(self.frames.insert(Frame {
            kpage,
            referers: SmallVec::new(),
        }));

        self.order.push_back(id);
        self.allocations += 1;
        trace!("allocated {:?} (user page {})", id, kpage);
        Some(id)
    }

    /// Oldest frame that is not `exclude`
    pub(crate) fn select_victim(&self, exclude: Option<FrameId>) -> Option<FrameId> {
        self.order
            .iter()
            .copied()
            .find(|frame| Some(*frame) != exclude)
    }

    /// Hands an evicted frame to a new owner.
    ///
    /// The frame keeps its physical page but starts over without referers
    /// and as the newest frame of the registry.
    pub(crate) fn recycle(&mut self, frame: FrameId) {
        debug_assert!(
            self.frames[frame.0].referers.is_empty(),
            "recycled frame still has referers"
        );
        self.frames[frame.0].referers.clear();

        self.order.retain(|item| *item != frame);
        self.order.push_back(frame);
        self.allocations += 1;
        self.evictions += 1;
    }

    pub(crate) fn add_referer(&mut self, frame: FrameId, page: PageRef) {
        let referers = &mut self.frames[frame.0].referers;
        debug_assert!(!referers.contains(&page), "{:?} already refers to {:?}", page, frame);
        referers.push(page);
    }

    /// Detaches `page` from `frame`, reclaiming the frame once nobody refers to it.
    ///
    /// Returns `true` if the frame was reclaimed.
    pub(crate) fn remove_referer(&mut self, frame: FrameId, page: PageRef) -> bool {
        let referers = &mut self.frames[frame.0].referers;
        referers.retain(|item| *item != page);

        if referers.is_empty() {
            self.reclaim(frame);
            true
        } else {
            false
        }
    }

    /// Returns a frame without referers to the user pool
    pub(crate) fn reclaim(&mut self, frame: FrameId) {
        let removed = self.frames.remove(frame.0);
        debug_assert!(removed.referers.is_empty());

        self.order.retain(|item| *item != frame);
        self.user_pool.free_page(removed.kpage);
        trace!("reclaimed {:?}", frame);
    }

    pub(crate) fn referers(&self, frame: FrameId) -> &[PageRef] {
        &self.frames[frame.0].referers
    }

    pub(crate) fn bytes(&self, frame: FrameId) -> &[u8] {
        &self.user_pool.pages[self.frames[frame.0].kpage]
    }

    pub(crate) fn bytes_mut(&mut self, frame: FrameId) -> &mut [u8] {
        &mut self.user_pool.pages[self.frames[frame.0].kpage]
    }

    /// Copies the whole content of `src` into `dst`
    pub(crate) fn copy_frame(&mut self, src: FrameId, dst: FrameId) {
        let src = self.frames[src.0].kpage;
        let dst = self.frames[dst.0].kpage;
        debug_assert_ne!(src, dst);

        if src < dst {
            let (low, high) = self.user_pool.pages.split_at_mut(dst);
            high[0].copy_from_slice(&low[src]);
        } else {
            let (low, high) = self.user_pool.pages.split_at_mut(src);
            low[dst].copy_from_slice(&high[0]);
        }
        self.copies += 1;
    }

    pub(crate) fn live_frames(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn free_frames(&self) -> usize {
        self.user_pool.free.len()
    }
}

impl<F: FileSystem, S: PersistentStorageModule> Vm<F, S> {
    /// Gets a frame for a new owner, evicting the oldest frame other than
    /// `exclude` if the user pool is exhausted.
    ///
    /// Panics if there is no frame to evict.
    pub(crate) fn acquire_frame(
        &self,
        spaces: &mut AddressSpaces,
        pool: &mut FramePool,
        exclude: Option<FrameId>,
    ) -> Result<FrameId, VmError> {
        if let Some(frame) = pool.try_allocate() {
            return Ok(frame);
        }

        let victim = match pool.select_victim(exclude) {
            Some(victim) => victim,
            None => panic!("out of user frames: nothing left to evict"),
        };

        self.evict_frame(spaces, pool, victim)?;
        pool.recycle(victim);
        Ok(victim)
    }

    /// Pushes the content of every page that maps `victim` to its backing
    /// store and unmaps them
    fn evict_frame(
        &self,
        spaces: &mut AddressSpaces,
        pool: &mut FramePool,
        victim: FrameId,
    ) -> Result<(), VmError> {
        let referers: SmallVec<[PageRef; 2]> = pool.referers(victim).iter().copied().collect();
        debug!("evict {:?} with {} referer(s)", victim, referers.len());

        for page_ref in referers {
            let space = spaces.get_mut(page_ref.space)?;
            let dirty = space.page_table.is_dirty(page_ref.va);
            let page = space
                .spt
                .find_mut(page_ref.va)
                .ok_or(VmError::NotPresent(page_ref.va))?;

            self.swap_out_page(page, pool.bytes(victim), dirty)?;
            page.swapped_out = true;
            page.frame = None;
            space.page_table.clear_page(page_ref.va);

            // detach one by one, a failed swap out leaves the rest mapped
            pool.frames[victim.0].referers.retain(|item| *item != page_ref);
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{FrameId, FramePool};
    use crate::{
        address::{VirtAddr, PAGE_SIZE},
        page::{PageRef, SpaceId},
    };

    fn page_ref(va: usize) -> PageRef {
        PageRef {
            space: SpaceId(0),
            va: VirtAddr(va),
        }
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let mut pool = FramePool::new(2);
        let first = pool.try_allocate().unwrap();
        let second = pool.try_allocate().unwrap();
        assert!(pool.try_allocate().is_none());

        assert_eq!(pool.live_frames(), 2);
        assert_eq!(pool.free_frames(), 0);
        assert_eq!(pool.select_victim(None), Some(first));
        assert_eq!(pool.select_victim(Some(first)), Some(second));
    }

    #[test]
    fn test_last_referer_reclaims() {
        let mut pool = FramePool::new(1);
        let frame = pool.try_allocate().unwrap();
        pool.add_referer(frame, page_ref(0x1000));
        pool.add_referer(frame, page_ref(0x2000));

        assert!(!pool.remove_referer(frame, page_ref(0x1000)));
        assert_eq!(pool.referers(frame), &[page_ref(0x2000)]);

        assert!(pool.remove_referer(frame, page_ref(0x2000)));
        assert_eq!(pool.live_frames(), 0);
        assert_eq!(pool.select_victim(None), None);
        assert!(pool.try_allocate().is_some());
    }

    #[test]
    fn test_recycle_moves_to_back() {
        let mut pool = FramePool::new(2);
        let first = pool.try_allocate().unwrap();
        let second = pool.try_allocate().unwrap();

        pool.recycle(first);
        assert_eq!(pool.select_victim(None), Some(second));
        assert!(pool.referers(first).is_empty());
        assert_eq!(pool.allocations, 3);
        assert_eq!(pool.evictions, 1);
    }

    #[test]
    fn test_copy_frame() {
        let mut pool = FramePool::new(3);
        let frames: Vec<FrameId> = (0..3).map(|_| pool.try_allocate().unwrap()).collect();

        pool.bytes_mut(frames[2]).fill(0xAB);
        pool.copy_frame(frames[2], frames[0]);
        assert!(pool.bytes(frames[0]).iter().all(|byte| *byte == 0xAB));

        pool.bytes_mut(frames[0])[PAGE_SIZE - 1] = 1;
        pool.copy_frame(frames[0], frames[1]);
        assert_eq!(pool.bytes(frames[1])[PAGE_SIZE - 1], 1);
        assert_eq!(pool.copies, 2);
    }
}
