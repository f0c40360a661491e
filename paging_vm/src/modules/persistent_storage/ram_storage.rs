use super::PersistentStorageModule;
use crate::address::DISK_SECTOR_SIZE;

/// Swap disk kept in host memory, useful when no file system is at hand
pub struct RamStorageModule {
    sectors: Vec<[u8; DISK_SECTOR_SIZE]>,
}

impl RamStorageModule {
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: vec![[0; DISK_SECTOR_SIZE]; sector_count],
        }
    }
}

impl PersistentStorageModule for RamStorageModule {
    fn read_sector(&mut self, sector: usize, dest: &mut [u8]) -> Result<(), ()> {
        let src = self.sectors.get(sector).ok_or(())?;
        if dest.len() != src.len() {
            return Err(());
        }

        dest.copy_from_slice(src);
        Ok(())
    }

    fn write_sector(&mut self, sector: usize, src: &[u8]) -> Result<(), ()> {
        let dest = self.sectors.get_mut(sector).ok_or(())?;
        if src.len() != dest.len() {
            return Err(());
        }

        dest.copy_from_slice(src);
        Ok(())
    }

    fn sector_count(&self) -> usize {
        self.sectors.len()
    }
}
