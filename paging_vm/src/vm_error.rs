use core::fmt;

use crate::address::VirtAddr;

/// Reasons a VM operation or a page fault could not be completed.
///
/// Every error that escapes a page fault is fatal for the faulting process
/// (see [`VmError::exit_status`]). Running out of frames with nothing to
/// evict, or running out of swap slots, is fatal for the whole kernel and
/// panics instead of returning an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// user mode touched a kernel address
    KernelAddress(VirtAddr),
    /// write to a page the process mapped read-only
    WriteProtected(VirtAddr),
    /// stack growth would exceed the configured page count
    StackOverflow(VirtAddr),
    /// no page is registered for this address
    NotPresent(VirtAddr),
    /// a page is already registered for this address
    AlreadyMapped(VirtAddr),
    NotPageAligned(VirtAddr),
    /// initializer does not produce a page of the requested type
    InvalidInitializer,
    InvalidArgument,
    /// walk over a mapping hit a page that is not file-backed
    InvalidMapping(VirtAddr),
    /// file-backed page lost its file (already unmapped)
    FileUnmapped(VirtAddr),
    NoSuchAddressSpace,
    /// swap disk or file I/O failed or was short
    Io,
}

impl VmError {
    /// Status the process collaborator passes to `terminate` when this
    /// error escapes a fault or a system call
    pub const fn exit_status(&self) -> i32 {
        -1
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::KernelAddress(va) => write!(f, "user access to kernel address {}", va),
            VmError::WriteProtected(va) => write!(f, "write to read-only page {}", va),
            VmError::StackOverflow(va) => write!(f, "stack limit exceeded at {}", va),
            VmError::NotPresent(va) => write!(f, "no page at {}", va),
            VmError::AlreadyMapped(va) => write!(f, "page {} is already mapped", va),
            VmError::NotPageAligned(va) => write!(f, "address {} is not page aligned", va),
            VmError::InvalidInitializer => write!(f, "initializer does not match page type"),
            VmError::InvalidArgument => write!(f, "invalid argument"),
            VmError::InvalidMapping(va) => write!(f, "page {} is not part of a file mapping", va),
            VmError::FileUnmapped(va) => write!(f, "file behind page {} is gone", va),
            VmError::NoSuchAddressSpace => write!(f, "unknown address space"),
            VmError::Io => write!(f, "backing store I/O failed"),
        }
    }
}

impl std::error::Error for VmError {}
