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

use std::{
    fs::{remove_file, File},
    io::{self, Read, Seek, SeekFrom, Write},
};

use log::{trace, warn};

use super::PersistentStorageModule;
use crate::address::DISK_SECTOR_SIZE;

/// Swap disk backed by a file on the host, sector `n` lives at byte
/// `n * DISK_SECTOR_SIZE` of the file.
///
/// The file is created empty and removed again when the disk is dropped.
pub struct FilePersistentStorageModule {
    /// `None` only while the disk is being dropped
    file: Option<File>,
    path: String,
    sector_count: usize,
}

impl FilePersistentStorageModule {
    /// Creates a zeroed disk of `sector_count` sectors at `path`, replacing
    /// whatever was stored there
    pub fn new(path: String, sector_count: usize) -> io::Result<Self> {
        let len = sector_count
            .checked_mul(DISK_SECTOR_SIZE)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "disk too large"))?;

        let file = File::options()
            .read(true)
            .write(true)
            .truncate(true)
            .create(true)
            .open(&path)?;
        file.set_len(len as u64)?;

        trace!("swap disk {} with {} sectors", path, sector_count);
        Ok(Self {
            file: Some(file),
            path,
            sector_count,
        })
    }

    /// Positions the file at `sector` for a transfer of `len` bytes
    fn seek_sector(&mut self, sector: usize, len: usize) -> Result<&mut File, ()> {
        if sector >= self.sector_count || len != DISK_SECTOR_SIZE {
            return Err(());
        }

        let file = self.file.as_mut().ok_or(())?;
        file.seek(SeekFrom::Start((sector * DISK_SECTOR_SIZE) as u64))
            .map_err(|_| ())?;
        Ok(file)
    }
}

impl PersistentStorageModule for FilePersistentStorageModule {
    fn read_sector(&mut self, sector: usize, dest: &mut [u8]) -> Result<(), ()> {
        self.seek_sector(sector, dest.len())?
            .read_exact(dest)
            .map_err(|_| ())
    }

    fn write_sector(&mut self, sector: usize, src: &[u8]) -> Result<(), ()> {
        self.seek_sector(sector, src.len())?
            .write_all(src)
            .map_err(|_| ())
    }

    fn sector_count(&self) -> usize {
        self.sector_count
    }
}

impl Drop for FilePersistentStorageModule {
    fn drop(&mut self) {
        // closed before it is unlinked
        drop(self.file.take());

        if let Err(err) = remove_file(&self.path) {
            warn!("could not remove swap disk {}: {}", self.path, err);
        }
    }
}
