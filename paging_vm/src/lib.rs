mod address;
mod anon;
mod backing;
mod fault;
mod file_backed;
mod fork;
mod frame_pool;
mod mmap;
mod page;
mod page_table;
mod supplemental_page_table;
mod util;
mod vm;
mod vm_config;
mod vm_error;

#[cfg(test)]
mod test;

pub mod modules;

pub use crate::address::{
    VirtAddr, DISK_SECTOR_SIZE, KERN_BASE, PAGE_SHIFT, PAGE_SIZE, SECTORS_PER_SLOT,
    STACK_GROWTH_SLACK, USER_STACK,
};
pub use crate::fault::FaultInfo;
pub use crate::page::{
    FilePage, PageInfo, PageInitializer, PageState, PageType, SegmentLoad, SpaceId,
};
pub use crate::page_table::PteFlags;
pub use crate::vm::{Vm, VmStats};
pub use vm_config::VmConfig;
pub use vm_error::VmError;
