use core::fmt;

use static_assertions::const_assert_eq;

/// Size of one virtual page and of one physical frame
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`]
pub const PAGE_SHIFT: usize = 12;

/// Sector size of the swap disk
pub const DISK_SECTOR_SIZE: usize = 512;

/// Number of disk sectors that make up one swap slot
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / DISK_SECTOR_SIZE;

/// First kernel virtual address, everything below belongs to user space
pub const KERN_BASE: usize = 0x8004000000;

/// Top of the user stack, the first stack page lies directly below
pub const USER_STACK: usize = 0x47480000;

/// How far below the saved stack pointer an access still counts as a push.
///
/// x86-64 `push` touches `rsp - 8` before moving `rsp`, some prologues touch
/// a little further.
pub const STACK_GROWTH_SLACK: usize = 32;

const_assert_eq!(PAGE_SIZE, 1 << PAGE_SHIFT);
const_assert_eq!(SECTORS_PER_SLOT * DISK_SECTOR_SIZE, PAGE_SIZE);

/// A user or kernel virtual address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Offset of this address inside its page
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    pub const fn page_round_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn is_kernel(self) -> bool {
        self.0 >= KERN_BASE
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `pages` pages above this one, `None` on overflow
    pub fn checked_add_pages(self, pages: usize) -> Option<Self> {
        pages
            .checked_mul(PAGE_SIZE)
            .and_then(|bytes| self.0.checked_add(bytes))
            .map(Self)
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<VirtAddr> for usize {
    fn from(addr: VirtAddr) -> Self {
        addr.0
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
