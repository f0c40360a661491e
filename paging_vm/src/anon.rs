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

use log::{debug, trace};
use spin::Mutex;

use crate::{
    address::{DISK_SECTOR_SIZE, PAGE_SIZE, SECTORS_PER_SLOT},
    modules::persistent_storage::PersistentStorageModule,
    page::AnonPage,
    util::bit_array::BitArray,
    vm_error::VmError,
};

/// Index of one page-sized slot of the swap disk, slot `n` covers the
/// [`SECTORS_PER_SLOT`] sectors starting at `n * SECTORS_PER_SLOT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SwapSlot(pub(crate) usize);

impl SwapSlot {
    fn sectors(self) -> core::ops::Range<usize> {
        let first = self.0 * SECTORS_PER_SLOT;
        first..first + SECTORS_PER_SLOT
    }
}

/// Occupancy of the swap disk.
///
/// A slot is in use exactly while some swapped out anonymous page points to it.
pub(crate) struct SwapTable<S: PersistentStorageModule> {
    storage: S,
    used: BitArray,
}

impl<S: PersistentStorageModule> SwapTable<S> {
    pub(crate) fn new(storage: S) -> Self {
        // trailing sectors that do not make up a whole slot stay unused
        let slot_count = storage.sector_count() / SECTORS_PER_SLOT;
        debug!(
            "swap disk of {} sectors, {} slots",
            storage.sector_count(),
            slot_count
        );

        Self {
            storage,
            used: BitArray::new(slot_count),
        }
    }

    /// Writes `content` into the lowest free slot.
    ///
    /// Panics if the swap disk is full.
    pub(crate) fn write_slot(&mut self, content: &[u8]) -> Result<SwapSlot, VmError> {
        debug_assert_eq!(content.len(), PAGE_SIZE);
        let slot = match self.used.first_unset() {
            Some(index) => SwapSlot(index),
            None => panic!("swap area exhausted ({} slots)", self.used.len()),
        };

        for (sector, src) in slot.sectors().zip(content.chunks_exact(DISK_SECTOR_SIZE)) {
            self.storage
                .write_sector(sector, src)
                .map_err(|_| VmError::Io)?;
        }
        self.used.set(true, slot.0);
        trace!("swap out to slot {}", slot.0);
        Ok(slot)
    }

    /// Reads `slot` into `dest` without freeing it
    pub(crate) fn read_slot(&mut self, slot: SwapSlot, dest: &mut [u8]) -> Result<(), VmError> {
        debug_assert!(self.used.is_set(slot.0), "read of free swap slot {}", slot.0);
        debug_assert_eq!(dest.len(), PAGE_SIZE);
        for (sector, dest) in slot.sectors().zip(dest.chunks_exact_mut(DISK_SECTOR_SIZE)) {
            self.storage
                .read_sector(sector, dest)
                .map_err(|_| VmError::Io)?;
        }
        Ok(())
    }

    pub(crate) fn free_slot(&mut self, slot: SwapSlot) {
        debug_assert!(self.used.is_set(slot.0), "double free of swap slot {}", slot.0);
        self.used.set(false, slot.0);
    }

    /// Copies the content of `slot` into a new slot
    pub(crate) fn duplicate_slot(&mut self, slot: SwapSlot) -> Result<SwapSlot, VmError> {
        let mut buffer = vec![0u8; PAGE_SIZE];
        self.read_slot(slot, &mut buffer)?;
        self.write_slot(&buffer)
    }

    pub(crate) fn used_slots(&self) -> usize {
        self.used.count_set()
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.used.len()
    }
}

/// Fills `frame` with the content of the page's swap slot and frees the slot.
///
/// A page that never left memory has no slot, its frame is left as is.
pub(crate) fn anon_swap_in<S: PersistentStorageModule>(
    anon: &mut AnonPage,
    frame: &mut [u8],
    swap: &Mutex<SwapTable<S>>,
) -> Result<(), VmError> {
    let slot = match anon.slot {
        Some(slot) => slot,
        None => return Ok(()),
    };

    let mut swap = swap.lock();
    swap.read_slot(slot, frame)?;
    swap.free_slot(slot);
    anon.slot = None;

    trace!("swap in from slot {}", slot.0);
    Ok(())
}

pub(crate) fn anon_swap_out<S: PersistentStorageModule>(
    anon: &mut AnonPage,
    frame: &[u8],
    swap: &Mutex<SwapTable<S>>,
) -> Result<(), VmError> {
    debug_assert!(anon.slot.is_none());
    anon.slot = Some(swap.lock().write_slot(frame)?);
    Ok(())
}

pub(crate) fn anon_destroy<S: PersistentStorageModule>(
    anon: &mut AnonPage,
    swap: &Mutex<SwapTable<S>>,
) {
    if let Some(slot) = anon.slot.take() {
        swap.lock().free_slot(slot);
    }
}
