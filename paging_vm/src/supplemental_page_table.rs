use hashbrown::HashMap;

use crate::{address::VirtAddr, page::Page, vm_error::VmError};

/// Per address space record of every virtual page, resident or not.
///
/// Keys are page-aligned, so every address maps to at most one page.
#[derive(Default)]
pub(crate) struct SupplementalPageTable {
    pages: HashMap<VirtAddr, Page>,
}

impl SupplementalPageTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts `page`, fails if its address is already taken
    pub(crate) fn insert(&mut self, page: Page) -> Result<(), VmError> {
        debug_assert!(page.va.is_page_aligned());
        match self.pages.entry(page.va) {
            hashbrown::hash_map::Entry::Occupied(_) => Err(VmError::AlreadyMapped(page.va)),
            hashbrown::hash_map::Entry::Vacant(entry) => {
                entry.insert(page);
                Ok(())
            }
        }
    }

    /// Page containing `va`
    pub(crate) fn find(&self, va: VirtAddr) -> Option<&Page> {
        self.pages.get(&va.page_round_down())
    }

    pub(crate) fn find_mut(&mut self, va: VirtAddr) -> Option<&mut Page> {
        self.pages.get_mut(&va.page_round_down())
    }

    pub(crate) fn contains(&self, va: VirtAddr) -> bool {
        self.pages.contains_key(&va.page_round_down())
    }

    pub(crate) fn remove(&mut self, va: VirtAddr) -> Option<Page> {
        self.pages.remove(&va.page_round_down())
    }

    /// Addresses of all pages, sorted
    pub(crate) fn addresses(&self) -> Vec<VirtAddr> {
        let mut addresses: Vec<VirtAddr> = self.pages.keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }
}
