use hashbrown::HashMap;
use log::{trace, warn};
use spin::Mutex;

use crate::{
    address::VirtAddr,
    modules::filesystem::{FileId, FileSystem},
    page::FilePage,
    vm_error::VmError,
};

/// The file system together with the handles pages share after a fork.
///
/// A handle is normally owned by exactly one page. Duplicating a resident
/// file-backed page hands the same handle to the child, `shares` counts
/// these additional owners so the handle is closed by the last one only.
pub(crate) struct FileBackend<F: FileSystem> {
    pub(crate) fs: F,
    shares: HashMap<FileId, usize>,
}

impl<F: FileSystem> FileBackend<F> {
    pub(crate) fn new(fs: F) -> Self {
        Self {
            fs,
            shares: HashMap::new(),
        }
    }

    /// Registers one more owner of `file`
    pub(crate) fn share(&mut self, file: FileId) {
        *self.shares.entry(file).or_insert(0) += 1;
    }

    pub(crate) fn is_shared(&self, file: FileId) -> bool {
        self.shares.contains_key(&file)
    }

    /// Drops one owner of `file`, closing it if that was the last one
    pub(crate) fn release(&mut self, file: FileId) {
        match self.shares.get_mut(&file) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.shares.remove(&file);
            }
            None => self.fs.close(file),
        }
    }

    pub(crate) fn reopen(&mut self, file: FileId) -> Result<FileId, VmError> {
        self.fs.reopen(file).map_err(|_| VmError::Io)
    }

    pub(crate) fn length(&self, file: FileId) -> Result<usize, VmError> {
        self.fs.length(file).map_err(|_| VmError::Io)
    }

    /// Reads exactly `dest.len()` bytes at `offset`
    pub(crate) fn read_exact_at(
        &mut self,
        file: FileId,
        dest: &mut [u8],
        offset: usize,
    ) -> Result<(), VmError> {
        match self.fs.read_at(file, dest, offset) {
            Ok(read) if read == dest.len() => Ok(()),
            _ => Err(VmError::Io),
        }
    }

    /// Writes all of `src` at `offset`, a short write is an error
    pub(crate) fn write_exact_at(
        &mut self,
        file: FileId,
        src: &[u8],
        offset: usize,
    ) -> Result<(), VmError> {
        match self.fs.write_at(file, src, offset) {
            Ok(written) if written == src.len() => Ok(()),
            _ => Err(VmError::Io),
        }
    }
}

/// Reads the file window of a page into `frame`, zeroing the tail
pub(crate) fn file_swap_in<F: FileSystem>(
    va: VirtAddr,
    file_page: &FilePage,
    frame: &mut [u8],
    files: &Mutex<FileBackend<F>>,
) -> Result<(), VmError> {
    let file = file_page.file.ok_or(VmError::FileUnmapped(va))?;
    let (data, rest) = frame.split_at_mut(file_page.data_bytes);

    files.lock().read_exact_at(file, data, file_page.offset)?;
    rest.fill(0);

    trace!(
        "file page {} loaded {} bytes at offset {}",
        va,
        file_page.data_bytes,
        file_page.offset
    );
    Ok(())
}

/// Writes the page back to its file if it was modified.
///
/// Only the data part of the page is written, the zero tail never reaches
/// the file.
pub(crate) fn file_swap_out<F: FileSystem>(
    va: VirtAddr,
    file_page: &FilePage,
    frame: &[u8],
    dirty: bool,
    files: &Mutex<FileBackend<F>>,
) -> Result<(), VmError> {
    if !dirty {
        return Ok(());
    }

    let file = file_page.file.ok_or(VmError::FileUnmapped(va))?;
    files
        .lock()
        .write_exact_at(file, &frame[..file_page.data_bytes], file_page.offset)?;

    trace!("file page {} wrote back {} bytes", va, file_page.data_bytes);
    Ok(())
}

/// Writes back a resident dirty page and drops the page's file handle.
///
/// The handle is released even if the write back fails.
pub(crate) fn file_destroy<F: FileSystem>(
    va: VirtAddr,
    file_page: &mut FilePage,
    frame: Option<&[u8]>,
    dirty: bool,
    files: &Mutex<FileBackend<F>>,
) -> Result<(), VmError> {
    let result = match frame {
        Some(frame) => file_swap_out(va, file_page, frame, dirty, files),
        None => Ok(()),
    };

    if let Err(err) = &result {
        warn!("lost write back of {}: {}", va, err);
    }

    if let Some(file) = file_page.file.take() {
        files.lock().release(file);
    }

    result
}
