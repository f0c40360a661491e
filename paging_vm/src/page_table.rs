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

use bitflags::bitflags;
use hashbrown::HashMap;

use crate::{address::VirtAddr, frame_pool::FrameId};

bitflags! {
    /// Hardware bits of a present page table entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pte {
    pub(crate) frame: FrameId,
    pub(crate) flags: PteFlags,
}

/// The hardware page table of one address space.
///
/// Only present entries are stored, an absent key means any access faults.
#[derive(Default)]
pub(crate) struct PageTable {
    entries: HashMap<VirtAddr, Pte>,
}

impl PageTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Maps the page `upage` to `frame`, replacing any previous mapping
    pub(crate) fn set_page(&mut self, upage: VirtAddr, frame: FrameId, writable: bool) {
        debug_assert!(upage.is_page_aligned());
        let flags = if writable {
            PteFlags::WRITABLE
        } else {
            PteFlags::empty()
        };

        self.entries.insert(upage, Pte { frame, flags });
    }

    /// Removes the mapping of `upage`, returns the entry that was present
    pub(crate) fn clear_page(&mut self, upage: VirtAddr) -> Option<Pte> {
        self.entries.remove(&upage)
    }

    pub(crate) fn get(&self, upage: VirtAddr) -> Option<Pte> {
        self.entries.get(&upage.page_round_down()).copied()
    }

    pub(crate) fn is_dirty(&self, upage: VirtAddr) -> bool {
        self.get(upage)
            .is_some_and(|pte| pte.flags.contains(PteFlags::DIRTY))
    }

    pub(crate) fn set_flag(&mut self, upage: VirtAddr, flag: PteFlags, value: bool) {
        if let Some(pte) = self.entries.get_mut(&upage.page_round_down()) {
            pte.flags.set(flag, value);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{PageTable, PteFlags};
    use crate::{address::VirtAddr, frame_pool::FrameId};

    #[test]
    fn test_flags_follow_mapping() {
        let mut table = PageTable::new();
        let upage = VirtAddr(0x1000);

        table.set_page(upage, FrameId(3), true);
        assert!(!table.is_dirty(upage));

        table.set_flag(VirtAddr(0x1234), PteFlags::DIRTY, true);
        assert!(table.is_dirty(upage));

        // remapping starts with clean bits
        table.set_page(upage, FrameId(4), false);
        let pte = table.get(upage).unwrap();
        assert_eq!(pte.frame, FrameId(4));
        assert!(pte.flags.is_empty());

        assert!(table.clear_page(upage).is_some());
        assert!(table.get(upage).is_none());
        assert!(!table.is_dirty(upage));
    }
}
