#[cfg(not(no_std))]
mod file_storage;
mod ram_storage;

#[cfg(not(no_std))]
pub use file_storage::FilePersistentStorageModule;
pub use ram_storage::RamStorageModule;

/// Block device the swap area lives on.
///
/// The device is addressed in sectors of [`crate::DISK_SECTOR_SIZE`] bytes,
/// every transfer moves exactly one sector.
pub trait PersistentStorageModule {
    /// Reads sector `sector` into `dest`.
    ///
    /// Fails if `dest` is not one sector long or the sector lies past the end
    /// of the device.
    fn read_sector(&mut self, sector: usize, dest: &mut [u8]) -> Result<(), ()>;

    /// Writes `src` to sector `sector`, same rules as [`Self::read_sector`]
    fn write_sector(&mut self, sector: usize, src: &[u8]) -> Result<(), ()>;

    /// Size of the device in sectors
    fn sector_count(&self) -> usize;
}
