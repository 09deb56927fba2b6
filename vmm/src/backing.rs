use crate::config::VmmConfig;
use crate::page::{
    Page, PageEntry, GRANULES_PER_PAGE, GRANULE_SIZE, MAX_GRANULE_OFFSET, PAGE_SIZE,
};
use log::{debug, trace, warn};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use tempfile::NamedTempFile;

/// Fill `buf` from `r`, leaving whatever lies past end of file zeroed.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    buf.fill(0);
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Copy-on-write target for pages modified during emulation.
///
/// Page images are placed at granule offsets handed out by a cursor that only
/// moves forward; nothing is ever freed before teardown.
#[derive(Debug)]
pub struct ScratchStore {
    file: NamedTempFile,
    /// next free offset, in granules
    cursor: u32,
}

impl ScratchStore {
    pub fn create(config: &VmmConfig) -> io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix(&config.scratch_prefix)
            .tempfile_in(config.scratch_dir())?;
        debug!("created scratch store {:?}", file.path());
        Ok(Self { file, cursor: 0 })
    }

    /// Reserve room for one page, returning its granule offset.
    pub fn allocate(&mut self) -> io::Result<u32> {
        let offset = self.cursor;
        if offset > MAX_GRANULE_OFFSET + 1 - GRANULES_PER_PAGE {
            return Err(io::Error::new(
                ErrorKind::OutOfMemory,
                "scratch store exceeds backing offset capacity",
            ));
        }
        self.cursor += GRANULES_PER_PAGE;
        Ok(offset)
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn read_page(&mut self, granule: u32, page: &mut Page) -> io::Result<()> {
        let f = self.file.as_file_mut();
        f.seek(SeekFrom::Start(granule as u64 * GRANULE_SIZE as u64))?;
        read_full(f, page.get_data_mut())?;
        Ok(())
    }

    pub fn write_page(&mut self, granule: u32, page: &Page) -> io::Result<()> {
        let f = self.file.as_file_mut();
        f.seek(SeekFrom::Start(granule as u64 * GRANULE_SIZE as u64))?;
        f.write_all(page.get_data())
    }

    /// Truncate and unlink the store.
    pub fn discard(self) -> io::Result<()> {
        self.file.as_file().set_len(0)?;
        self.file.close()
    }
}

/// The two stores a page can live in: the scanned file and the scratch store.
#[derive(Debug)]
pub struct Backing<R> {
    original: R,
    scratch: Option<ScratchStore>,
    config: VmmConfig,
}

impl<R> Backing<R> {
    pub fn new(original: R, config: VmmConfig) -> Self {
        Self {
            original,
            scratch: None,
            config,
        }
    }

    pub fn scratch(&self) -> Option<&ScratchStore> {
        self.scratch.as_ref()
    }

    /// Drop the scratch store, truncating and removing the file.
    pub fn discard_scratch(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            if let Err(e) = scratch.discard() {
                warn!("failed to remove scratch store: {}", e);
            }
        }
    }
}

impl<R: Read + Seek> Backing<R> {
    /// Load the content described by `entry` into `page`.
    pub fn page_in(&mut self, entry: &PageEntry, page: &mut Page) -> io::Result<()> {
        if !entry.initialized {
            page.clear();
            return Ok(());
        }
        if entry.modified {
            let scratch = self.scratch.as_mut().ok_or_else(|| {
                io::Error::new(ErrorKind::NotFound, "page modified but scratch store missing")
            })?;
            return scratch.read_page(entry.backing_offset, page);
        }
        self.original.seek(SeekFrom::Start(entry.backing_position()))?;
        let n = read_full(&mut self.original, page.get_data_mut())?;
        if n < PAGE_SIZE {
            trace!(
                "short read at {:#x}: {} bytes, rest zero filled",
                entry.backing_position(),
                n
            );
        }
        Ok(())
    }

    fn scratch_store(&mut self) -> io::Result<&mut ScratchStore> {
        let scratch = match self.scratch.take() {
            Some(scratch) => scratch,
            None => ScratchStore::create(&self.config)?,
        };
        Ok(self.scratch.insert(scratch))
    }

    /// Persist `page` to the scratch store, moving `entry` there on its first
    /// write-back. On failure the entry keeps pointing at its previous content.
    pub fn page_out(&mut self, entry: &mut PageEntry, page: &Page) -> io::Result<()> {
        let scratch = self.scratch_store()?;
        if entry.modified {
            return scratch.write_page(entry.backing_offset, page);
        }
        let offset = scratch.allocate()?;
        scratch.write_page(offset, page)?;
        entry.backing_offset = offset;
        entry.modified = true;
        entry.initialized = true;
        Ok(())
    }
}
