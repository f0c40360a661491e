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

use hashbrown::HashMap;
use log::trace;
use slab::Slab;

use super::{FileId, FileSystem};

struct OpenFile {
    inode: usize,
}

/// Flat in-memory file system.
///
/// Files are created with fixed contents and never grow, the way the
/// kernel's on-disk file system treats writes past the end.
#[derive(Default)]
pub struct MemFileSystem {
    names: HashMap<String, usize>,
    inodes: Slab<Vec<u8>>,
    handles: Slab<OpenFile>,
}

impl MemFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a file called `name`, returns `false` if it already exists
    pub fn create(&mut self, name: &str, data: Vec<u8>) -> bool {
        if self.names.contains_key(name) {
            return false;
        }

        let inode = self.inodes.insert(data);
        self.names.insert(name.to_string(), inode);
        true
    }

    /// Current contents of the file called `name`
    pub fn contents(&self, name: &str) -> Option<&[u8]> {
        let inode = *self.names.get(name)?;
        self.inodes.get(inode).map(|data| data.as_slice())
    }

    /// Number of handles that are open right now
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn inode_of(&self, file: FileId) -> Result<usize, ()> {
        self.handles.get(file.0).map(|open| open.inode).ok_or(())
    }
}

impl FileSystem for MemFileSystem {
    fn open(&mut self, name: &str) -> Option<FileId> {
        let inode = *self.names.get(name)?;
        let id = FileId(self.handles.insert(OpenFile { inode }));
        trace!("open {} as {:?}", name, id);
        Some(id)
    }

    fn reopen(&mut self, file: FileId) -> Result<FileId, ()> {
        let inode = self.inode_of(file)?;
        let id = FileId(self.handles.insert(OpenFile { inode }));
        trace!("reopen {:?} as {:?}", file, id);
        Ok(id)
    }

    fn read_at(&mut self, file: FileId, dest: &mut [u8], offset: usize) -> Result<usize, ()> {
        let data = &self.inodes[self.inode_of(file)?];
        if offset >= data.len() {
            return Ok(0);
        }

        let count = dest.len().min(data.len() - offset);
        dest[..count].copy_from_slice(&data[offset..offset + count]);
        Ok(count)
    }

    fn write_at(&mut self, file: FileId, src: &[u8], offset: usize) -> Result<usize, ()> {
        let inode = self.inode_of(file)?;
        let data = &mut self.inodes[inode];
        if offset >= data.len() {
            return Ok(0);
        }

        let count = src.len().min(data.len() - offset);
        data[offset..offset + count].copy_from_slice(&src[..count]);
        Ok(count)
    }

    fn length(&self, file: FileId) -> Result<usize, ()> {
        Ok(self.inodes[self.inode_of(file)?].len())
    }

    fn close(&mut self, file: FileId) {
        debug_assert!(self.handles.contains(file.0), "double close of {:?}", file);
        if self.handles.try_remove(file.0).is_some() {
            trace!("close {:?}", file);
        }
    }
}

#[cfg(test)]
mod test {
    use crate::modules::filesystem::{FileSystem, MemFileSystem};

    #[test]
    fn test_reopen_is_independent() {
        let mut fs = MemFileSystem::new();
        assert!(fs.create("a", vec![1, 2, 3, 4]));
        assert!(!fs.create("a", vec![]));

        let first = fs.open("a").unwrap();
        let second = fs.reopen(first).unwrap();
        assert_ne!(first, second);
        assert_eq!(fs.open_handles(), 2);

        fs.close(first);
        assert_eq!(fs.open_handles(), 1);
        assert_eq!(fs.length(second), Ok(4));
        assert_eq!(fs.length(first), Err(()));

        fs.close(second);
        assert_eq!(fs.open_handles(), 0);
    }

    #[test]
    fn test_short_read_and_write() {
        let mut fs = MemFileSystem::new();
        fs.create("data", vec![7; 10]);
        let file = fs.open("data").unwrap();

        let mut buffer = [0u8; 8];
        assert_eq!(fs.read_at(file, &mut buffer, 6), Ok(4));
        assert_eq!(&buffer[..4], &[7; 4]);
        assert_eq!(fs.read_at(file, &mut buffer, 10), Ok(0));

        // writes never grow the file
        assert_eq!(fs.write_at(file, &[9; 8], 6), Ok(4));
        assert_eq!(fs.contents("data").unwrap(), &[7, 7, 7, 7, 7, 7, 9, 9, 9, 9]);
        assert!(fs.open("missing").is_none());
    }
}
