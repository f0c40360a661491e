mod mem_fs;

pub use mem_fs::MemFileSystem;

/// Handle of one open file.
///
/// Each handle has its own lifetime: closing it does not affect other
/// handles to the same file, including ones obtained through [`FileSystem::reopen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub usize);

/// File operations the VM subsystem needs from the file system.
///
/// The VM subsystem only ever calls these with its file lock held, so
/// implementations need not be reentrant.
pub trait FileSystem {
    /// Opens the file called `name`
    fn open(&mut self, name: &str) -> Option<FileId>;

    /// Opens a new, independent handle to the file behind `file`
    fn reopen(&mut self, file: FileId) -> Result<FileId, ()>;

    /// Reads up to `dest.len()` bytes at `offset`, returns the amount read.
    ///
    /// Reading past the end of the file is not an error, it just returns less.
    fn read_at(&mut self, file: FileId, dest: &mut [u8], offset: usize) -> Result<usize, ()>;

    /// Writes up to `src.len()` bytes at `offset`, returns the amount written.
    ///
    /// Files do not grow, bytes past the end of the file are dropped.
    fn write_at(&mut self, file: FileId, src: &[u8], offset: usize) -> Result<usize, ()>;

    /// Size of the file in bytes
    fn length(&self, file: FileId) -> Result<usize, ()>;

    fn close(&mut self, file: FileId);
}
