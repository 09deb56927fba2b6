use bitflags::bitflags;
use std::fmt::{Display, Formatter};
use std::ops::{Index, IndexMut, Range, RangeFrom};

/// Note: 2**12 = 4 KiB, the page size of the emulated address space
pub const PAGE_ADDR_SIZE: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_ADDR_SIZE;
pub const PAGE_ADDR_MASK: usize = PAGE_SIZE - 1;

/// Backing offsets are counted in granules of this many bytes.
pub const GRANULE_SIZE: usize = 512;
pub const GRANULES_PER_PAGE: u32 = (PAGE_SIZE / GRANULE_SIZE) as u32;

/// Backing offsets fit in 23 bits, so a backing store never exceeds 4 GiB.
pub const GRANULE_OFFSET_BITS: u32 = 23;
pub const MAX_GRANULE_OFFSET: u32 = (1 << GRANULE_OFFSET_BITS) - 1;

/// A 32-bit address space holds at most this many pages.
pub const MAX_PAGE_COUNT: usize = 1 << (32 - PAGE_ADDR_SIZE);

bitflags! {
    /// Access rights of a single page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions::empty()
    }
}

impl Display for Permissions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let flag = |p: Permissions, c: char| if self.contains(p) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Permissions::READ, 'r'),
            flag(Permissions::WRITE, 'w'),
            flag(Permissions::EXECUTE, 'x')
        )
    }
}

#[inline]
pub fn page_index(offset: u32) -> u32 {
    offset >> PAGE_ADDR_SIZE
}

#[inline]
pub fn page_offset(offset: u32) -> usize {
    offset as usize & PAGE_ADDR_MASK
}

#[derive(Clone)]
pub struct Page([u8; PAGE_SIZE]);

impl Index<usize> for Page {
    type Output = u8;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl IndexMut<usize> for Page {
    fn index_mut(&mut self, index: usize) -> &mut u8 {
        &mut self.0[index]
    }
}

impl Index<Range<usize>> for Page {
    type Output = [u8];

    fn index(&self, index: Range<usize>) -> &[u8] {
        &self.0[index]
    }
}

impl Index<RangeFrom<usize>> for Page {
    type Output = [u8];

    fn index(&self, index: RangeFrom<usize>) -> &Self::Output {
        &self.0[index]
    }
}

impl IndexMut<Range<usize>> for Page {
    fn index_mut(&mut self, index: Range<usize>) -> &mut [u8] {
        &mut self.0[index]
    }
}

impl IndexMut<RangeFrom<usize>> for Page {
    fn index_mut(&mut self, index: RangeFrom<usize>) -> &mut [u8] {
        &mut self.0[index]
    }
}

impl Page {
    pub fn zeroed() -> Box<Page> {
        Box::new(Page([0; PAGE_SIZE]))
    }

    pub fn clear(&mut self) {
        self.0.fill(0);
    }

    pub fn get_data(&self) -> &[u8; PAGE_SIZE] {
        &self.0
    }

    pub fn get_data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.0
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let used = self.0.iter().filter(|b| **b != 0).count();
        write!(f, "Page {{ non_zero_bytes: {} }}", used)
    }
}

/// Per-page metadata. `backing_offset` points into the original file while
/// `modified` is false and into the scratch store once it is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageEntry {
    /// in granules, valid only when `initialized`
    pub backing_offset: u32,
    pub permissions: Permissions,
    pub modified: bool,
    pub initialized: bool,
    pub resident_slot: Option<u8>,
}

impl PageEntry {
    /// Byte position of this page in whichever store currently backs it.
    pub fn backing_position(&self) -> u64 {
        self.backing_offset as u64 * GRANULE_SIZE as u64
    }
}

/// Flat table with one entry per page of the mapped extent.
#[derive(Debug, Default)]
pub struct PageTable {
    entries: Vec<PageEntry>,
}

impl PageTable {
    pub fn new(page_count: usize) -> Self {
        Self {
            entries: vec![PageEntry::default(); page_count],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, page: u32) -> Option<&PageEntry> {
        self.entries.get(page as usize)
    }

    pub fn get_mut(&mut self, page: u32) -> Option<&mut PageEntry> {
        self.entries.get_mut(page as usize)
    }

    pub fn contains(&self, page: u32) -> bool {
        (page as usize) < self.entries.len()
    }

    /// Size of the mapped extent in bytes.
    pub fn extent(&self) -> u64 {
        self.entries.len() as u64 * PAGE_SIZE as u64
    }
}

impl Index<u32> for PageTable {
    type Output = PageEntry;

    fn index(&self, page: u32) -> &PageEntry {
        &self.entries[page as usize]
    }
}

impl IndexMut<u32> for PageTable {
    fn index_mut(&mut self, page: u32) -> &mut PageEntry {
        &mut self.entries[page as usize]
    }
}

/// One slot of the page cache. A slot without an owner holds no valid data.
#[derive(Debug, Clone)]
pub struct CachedPage {
    pub owner: Option<u32>,
    pub permissions: Permissions,
    pub dirty: bool,
    pub data: Box<Page>,
}

impl Default for CachedPage {
    fn default() -> Self {
        Self::new()
    }
}

impl CachedPage {
    pub fn new() -> Self {
        Self {
            owner: None,
            permissions: Permissions::empty(),
            dirty: false,
            data: Page::zeroed(),
        }
    }

    pub fn invalidate(&mut self) {
        self.owner = None;
        self.permissions = Permissions::empty();
        self.dirty = false;
    }
}
