use crate::{
    address::{VirtAddr, PAGE_SIZE},
    anon::SwapSlot,
    frame_pool::FrameId,
    modules::filesystem::FileId,
};

/// Identifies one address space of a [`crate::Vm`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpaceId(pub(crate) usize);

/// Names a page from outside its supplemental page table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PageRef {
    pub(crate) space: SpaceId,
    pub(crate) va: VirtAddr,
}

/// What a page turns into once it is materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Heap, stack and executable segments, evicted to swap
    Anon,
    /// Memory mapped file, evicted by writing back to the file
    File,
}

/// Lazy load of one page of an executable segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLoad {
    /// Handle owned by this page only, closed once the page is loaded
    pub file: FileId,
    pub offset: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

/// The window of a file a file-backed page mirrors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePage {
    /// `None` once the mapping was torn down
    pub file: Option<FileId>,
    pub offset: usize,
    /// bytes read from the file, the rest of the page is zero
    pub data_bytes: usize,
    pub zero_bytes: usize,
    /// last page of its mmap run
    pub is_last: bool,
}

/// Work deferred until the first access of a lazily allocated page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageInitializer {
    /// Zero filled anonymous page
    Zero,
    /// Anonymous page whose content is read from an executable
    Segment(SegmentLoad),
    /// File-backed page of an mmap run
    FileChunk(FilePage),
}

impl PageInitializer {
    /// Can this initializer produce a page of type `ty`?
    ///
    /// Data and zero part of a page have to add up to exactly one page.
    pub(crate) fn fits(&self, ty: PageType) -> bool {
        match self {
            PageInitializer::Zero => ty == PageType::Anon,
            PageInitializer::Segment(segment) => {
                ty == PageType::Anon && fills_page(segment.read_bytes, segment.zero_bytes)
            }
            PageInitializer::FileChunk(chunk) => {
                ty == PageType::File && fills_page(chunk.data_bytes, chunk.zero_bytes)
            }
        }
    }

    /// The file handle owned by this initializer, if any
    pub(crate) fn file(&self) -> Option<FileId> {
        match self {
            PageInitializer::Zero => None,
            PageInitializer::Segment(segment) => Some(segment.file),
            PageInitializer::FileChunk(chunk) => chunk.file,
        }
    }
}

fn fills_page(data_bytes: usize, zero_bytes: usize) -> bool {
    data_bytes <= PAGE_SIZE && zero_bytes == PAGE_SIZE - data_bytes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct AnonPage {
    /// Swap slot holding the content while swapped out
    pub(crate) slot: Option<SwapSlot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageKind {
    Uninit {
        target: PageType,
        init: PageInitializer,
    },
    Anon(AnonPage),
    File(FilePage),
}

/// One virtual page of one address space, owned by that space's
/// supplemental page table
#[derive(Debug)]
pub(crate) struct Page {
    pub(crate) va: VirtAddr,
    pub(crate) kind: PageKind,

    /// Permission the process asked for
    pub(crate) writable: bool,

    /// `false` while the frame is shared copy-on-write with another page
    pub(crate) cow_writable: bool,

    /// no frame backs this page, its content lives in a backing store
    pub(crate) swapped_out: bool,

    pub(crate) is_stack: bool,

    /// frame backing this page while resident
    pub(crate) frame: Option<FrameId>,
}

impl Page {
    pub(crate) fn new(va: VirtAddr, writable: bool, kind: PageKind) -> Self {
        Self {
            va,
            kind,
            writable,
            cow_writable: true,
            swapped_out: false,
            is_stack: false,
            frame: None,
        }
    }

    pub(crate) fn new_uninit(
        va: VirtAddr,
        writable: bool,
        target: PageType,
        init: PageInitializer,
    ) -> Self {
        Self::new(va, writable, PageKind::Uninit { target, init })
    }

    /// Type of this page, for uninit pages the type it will become
    pub(crate) fn page_type(&self) -> PageType {
        match self.kind {
            PageKind::Uninit { target, .. } => target,
            PageKind::Anon(_) => PageType::Anon,
            PageKind::File(_) => PageType::File,
        }
    }

    pub(crate) fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Whether the hardware mapping of this page may allow writes
    pub(crate) fn map_writable(&self) -> bool {
        self.writable && self.cow_writable
    }

    pub(crate) fn info(&self) -> PageInfo {
        let (state, swap_slot, file) = match &self.kind {
            PageKind::Uninit { init, .. } => {
                let file = match init {
                    PageInitializer::FileChunk(chunk) => Some(*chunk),
                    _ => None,
                };
                (PageState::Uninit, None, file)
            }
            PageKind::Anon(anon) => (PageState::Anon, anon.slot.map(|slot| slot.0), None),
            PageKind::File(file) => (PageState::File, None, Some(*file)),
        };

        PageInfo {
            va: self.va,
            state,
            page_type: self.page_type(),
            writable: self.writable,
            cow_writable: self.cow_writable,
            swapped_out: self.swapped_out,
            is_stack: self.is_stack,
            resident: self.is_resident(),
            swap_slot,
            file,
        }
    }
}

/// Materialization state of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Uninit,
    Anon,
    File,
}

/// Snapshot of a page's metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub va: VirtAddr,
    pub state: PageState,
    pub page_type: PageType,
    pub writable: bool,
    pub cow_writable: bool,
    pub swapped_out: bool,
    pub is_stack: bool,
    pub resident: bool,
    /// swap slot index, only for swapped out anonymous pages
    pub swap_slot: Option<usize>,
    /// file window of file-backed pages, also before they are materialized
    pub file: Option<FilePage>,
}

#[cfg(test)]
mod test {
    use super::{FilePage, Page, PageInitializer, PageState, PageType, SegmentLoad};
    use crate::{address::VirtAddr, modules::filesystem::FileId};

    #[test]
    fn test_initializer_fits_type() {
        let chunk = PageInitializer::FileChunk(FilePage {
            file: Some(FileId(0)),
            offset: 0,
            data_bytes: 10,
            zero_bytes: 4086,
            is_last: true,
        });
        let segment = PageInitializer::Segment(SegmentLoad {
            file: FileId(1),
            offset: 0,
            read_bytes: 0,
            zero_bytes: 4096,
        });

        assert!(chunk.fits(PageType::File));
        assert!(!chunk.fits(PageType::Anon));
        assert!(segment.fits(PageType::Anon));
        assert!(!PageInitializer::Zero.fits(PageType::File));
        assert_eq!(segment.file(), Some(FileId(1)));

        // more than a page, or data and zeros not adding up to one
        let oversized = PageInitializer::Segment(SegmentLoad {
            file: FileId(1),
            offset: 0,
            read_bytes: 5000,
            zero_bytes: 0,
        });
        let short = PageInitializer::FileChunk(FilePage {
            file: Some(FileId(0)),
            offset: 0,
            data_bytes: 10,
            zero_bytes: 10,
            is_last: true,
        });
        let wrapping = PageInitializer::FileChunk(FilePage {
            file: Some(FileId(0)),
            offset: 0,
            data_bytes: 8000,
            zero_bytes: usize::MAX - 3903,
            is_last: true,
        });
        assert!(!oversized.fits(PageType::Anon));
        assert!(!short.fits(PageType::File));
        assert!(!wrapping.fits(PageType::File));
        assert_eq!(PageInitializer::Zero.file(), None);
    }

    #[test]
    fn test_uninit_page_reports_target_type() {
        let page = Page::new_uninit(VirtAddr(0x4000), false, PageType::Anon, PageInitializer::Zero);
        let info = page.info();

        assert_eq!(info.state, PageState::Uninit);
        assert_eq!(info.page_type, PageType::Anon);
        assert!(info.cow_writable);
        assert!(!info.resident);
        assert!(!page.map_writable());
    }
}
