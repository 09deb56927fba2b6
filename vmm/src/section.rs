//! Translation of a PE32 section layout into a page table.
//!
//! The parser that produces [`ImageHeader`] and [`Section`] lives outside this
//! crate; the mapper only checks that the layout is something the page table
//! can represent and records where every page's content comes from.

use crate::error::{Result, VmmError};
use crate::page::{
    PageTable, Permissions, GRANULE_SIZE, MAX_GRANULE_OFFSET, MAX_PAGE_COUNT, PAGE_SIZE,
};
use bitflags::bitflags;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x14c;
pub const IMAGE_FILE_MACHINE_R3000: u16 = 0x14d;
pub const IMAGE_FILE_MACHINE_I860: u16 = 0x14e;

pub const PE32_MAGIC: u16 = 0x10b;
pub const PE32_PLUS_MAGIC: u16 = 0x20b;

bitflags! {
    /// The subset of section characteristics the mapper looks at.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        const MEM_EXECUTE = 0x2000_0000;
        const MEM_READ = 0x4000_0000;
        const MEM_WRITE = 0x8000_0000;
    }
}

impl SectionFlags {
    pub fn permissions(&self) -> Permissions {
        let mut perms = Permissions::empty();
        if self.contains(SectionFlags::MEM_READ) {
            perms |= Permissions::READ;
        }
        if self.contains(SectionFlags::MEM_WRITE) {
            perms |= Permissions::WRITE;
        }
        if self.contains(SectionFlags::MEM_EXECUTE) {
            perms |= Permissions::EXECUTE;
        }
        perms
    }
}

/// File and optional header fields the address space depends on.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub struct ImageHeader {
    pub machine: u16,
    pub magic: u16,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
}

impl Default for ImageHeader {
    fn default() -> Self {
        Self {
            machine: IMAGE_FILE_MACHINE_I386,
            magic: PE32_MAGIC,
            image_base: 0x400000,
            section_alignment: PAGE_SIZE as u32,
            file_alignment: GRANULE_SIZE as u32,
        }
    }
}

/// One entry of the section table, sizes already aligned by the parser.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct Section {
    pub rva: u32,
    pub virtual_size: u32,
    pub raw_offset: u32,
    pub characteristics: u32,
}

impl Section {
    pub fn flags(&self) -> SectionFlags {
        SectionFlags::from_bits_truncate(self.characteristics)
    }

    pub fn is_zero_init(&self) -> bool {
        self.flags().contains(SectionFlags::CNT_UNINITIALIZED_DATA)
    }

    fn end(&self) -> u64 {
        self.rva as u64 + self.virtual_size as u64
    }
}

fn check_architecture(header: &ImageHeader) -> Result<()> {
    if header.magic == PE32_PLUS_MAGIC {
        debug!("PE32+ emulation not supported");
        return Err(VmmError::UnsupportedArchitecture {
            machine: header.machine,
            magic: header.magic,
        });
    }
    match header.machine {
        IMAGE_FILE_MACHINE_I386 | IMAGE_FILE_MACHINE_R3000 | IMAGE_FILE_MACHINE_I860 => Ok(()),
        _ => {
            debug!("unhandled architecture {:#x}", header.machine);
            Err(VmmError::UnsupportedArchitecture {
                machine: header.machine,
                magic: header.magic,
            })
        }
    }
}

fn check_alignment(header: &ImageHeader) {
    if header.section_alignment < PAGE_SIZE as u32
        && header.file_alignment != header.section_alignment
    {
        warn!(
            "file alignment and section alignment mismatch, mapping probably incorrect: {} != {}",
            header.file_alignment, header.section_alignment
        );
    }
    if header.file_alignment < GRANULE_SIZE as u32 {
        warn!(
            "file alignment too small: {}, mapping will probably be incorrect",
            header.file_alignment
        );
    }
}

/// Every section must start exactly where the previous one ends.
fn check_contiguity(sections: &[Section]) -> Result<()> {
    for (index, pair) in sections.windows(2).enumerate() {
        let expected = pair[0].end();
        if pair[1].rva as u64 != expected {
            debug!("holes / overlapping / virtual disorder (broken executable)");
            return Err(VmmError::MalformedImage {
                index: index + 1,
                rva: pair[1].rva,
                expected,
            });
        }
    }
    Ok(())
}

/// Number of pages needed to reach the end of the last section. Sections are
/// already known to be contiguous.
fn page_count(header: &ImageHeader, sections: &[Section]) -> Result<usize> {
    let end = sections.last().map(Section::end).unwrap_or(0);
    let pages = end.div_ceil(PAGE_SIZE as u64);
    let limit = (1u64 << 32) - header.image_base as u64;
    if pages * PAGE_SIZE as u64 > limit || pages as usize > MAX_PAGE_COUNT {
        debug!("image extent {:#x} exceeds the address space", end);
        return Err(VmmError::OutOfRange { offset: end, limit });
    }
    Ok(pages as usize)
}

fn granule_offset(raw: u64) -> Result<u32> {
    let granule = raw / GRANULE_SIZE as u64;
    if granule > MAX_GRANULE_OFFSET as u64 {
        return Err(VmmError::OutOfRange {
            offset: raw,
            limit: (MAX_GRANULE_OFFSET as u64 + 1) * GRANULE_SIZE as u64,
        });
    }
    Ok(granule as u32)
}

/// Validates the image layout and builds the page table describing it.
pub fn map_sections(header: &ImageHeader, sections: &[Section]) -> Result<PageTable> {
    check_architecture(header)?;
    let first = sections.first().ok_or_else(|| {
        debug!("no sections, nothing to emulate");
        VmmError::NoSections
    })?;
    check_alignment(header);
    check_contiguity(sections)?;

    let mut table = PageTable::new(page_count(header, sections)?);
    let extent = table.extent();

    // headers live in front of the first section, read-only and 1:1 with the file
    let mut page = 0u32;
    while (page as u64) * (PAGE_SIZE as u64) < first.rva as u64 {
        let entry = table.get_mut(page).ok_or(VmmError::OutOfRange {
            offset: page as u64 * PAGE_SIZE as u64,
            limit: extent,
        })?;
        entry.backing_offset = granule_offset(page as u64 * PAGE_SIZE as u64)?;
        entry.permissions = Permissions::READ;
        entry.initialized = true;
        page += 1;
    }

    for section in sections {
        let zero_init = section.is_zero_init();
        let perms = section.flags().permissions();
        let first_page = section.rva as u64 / PAGE_SIZE as u64;
        let last_page = section.end().div_ceil(PAGE_SIZE as u64);

        for (j, page) in (first_page..last_page).enumerate() {
            let entry = u32::try_from(page)
                .ok()
                .and_then(|p| table.get_mut(p))
                .ok_or(VmmError::OutOfRange {
                    offset: page * PAGE_SIZE as u64,
                    limit: extent,
                })?;
            entry.initialized = !zero_init;
            // one page may hold more than one section; offsets only work out
            // when raw data is granule aligned
            if !zero_init {
                entry.backing_offset =
                    granule_offset(section.raw_offset as u64 + (j * PAGE_SIZE) as u64)?;
            }
            entry.permissions |= perms;
        }

        let pages = last_page - first_page;
        debug!(
            "mapped section rva {:08x} - {:08x} -> raw {:08x}{} - {:08x}, va {:08x} - {:08x} [{}]",
            section.rva,
            section.rva as u64 + pages * PAGE_SIZE as u64,
            section.raw_offset,
            if section.raw_offset as usize % GRANULE_SIZE != 0 {
                " (rounded!)"
            } else {
                ""
            },
            section.raw_offset as u64 + pages * PAGE_SIZE as u64,
            header.image_base as u64 + section.rva as u64,
            header.image_base as u64 + section.rva as u64 + pages * PAGE_SIZE as u64,
            perms
        );
    }

    Ok(table)
}
