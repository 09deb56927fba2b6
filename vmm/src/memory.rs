use crate::backing::Backing;
use crate::cache::{CacheStats, PageCache};
use crate::config::VmmConfig;
use crate::error::{Result, VmmError};
use crate::page::{
    page_offset, PageTable, Permissions, GRANULE_SIZE, PAGE_ADDR_SIZE, PAGE_SIZE,
};
use crate::section::{map_sections, ImageHeader, Section};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use std::fmt::{Display, Formatter};
use std::io::{Read, Seek};

/// Intent of a read, data fetch or instruction fetch. Stores always need
/// [`Permissions::WRITE`] and go through [`AddressSpace::write`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Execute,
}

impl Access {
    pub fn required(&self) -> Permissions {
        match self {
            Access::Read => Permissions::READ,
            Access::Execute => Permissions::EXECUTE,
        }
    }
}

/// The emulated address space of one scanned image.
///
/// Addresses handed to the accessors are virtual addresses; the mapped extent
/// starts at the image base and covers every page up to the end of the last
/// section. Contents come from the scanned file until a page is modified and
/// written back, after which they live in a scratch file that is removed when
/// the address space is dropped.
#[derive(Debug)]
pub struct AddressSpace<R> {
    image_base: u32,
    table: PageTable,
    cache: PageCache,
    backing: Backing<R>,
}

impl<R: Read + Seek> AddressSpace<R> {
    /// Map the image with the configuration taken from the environment.
    pub fn new(header: &ImageHeader, sections: &[Section], file: R) -> Result<Self> {
        Self::with_config(header, sections, file, VmmConfig::from_env())
    }

    pub fn with_config(
        header: &ImageHeader,
        sections: &[Section],
        file: R,
        config: VmmConfig,
    ) -> Result<Self> {
        let table = map_sections(header, sections)?;
        debug!(
            "address space at {:#010x}: {} pages, {} sections",
            header.image_base,
            table.len(),
            sections.len()
        );
        Ok(Self {
            image_base: header.image_base,
            table,
            cache: PageCache::new(),
            backing: Backing::new(file, config),
        })
    }

    pub fn image_base(&self) -> u32 {
        self.image_base
    }

    pub fn page_count(&self) -> usize {
        self.table.len()
    }

    /// Size of the mapped extent in bytes.
    pub fn extent(&self) -> u64 {
        self.table.extent()
    }

    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Offset from the image base of `len` bytes at `address`, if all of them
    /// are mapped.
    fn offset_of(&self, address: u32, len: usize) -> Result<u64> {
        let offset = match address.checked_sub(self.image_base) {
            Some(offset) => offset as u64,
            None => {
                return Err(VmmError::OutOfBounds {
                    address: address as u64,
                })
            }
        };
        let end = offset + len.max(1) as u64;
        if end > self.extent() {
            let first_bad = offset.max(self.extent());
            debug!(
                "access {:#010x}+{:#x} out of bounds, extent {:#x}",
                address,
                len,
                self.extent()
            );
            return Err(VmmError::OutOfBounds {
                address: self.image_base as u64 + first_bad,
            });
        }
        Ok(offset)
    }

    /// Pages touched by `len` bytes starting at `offset`.
    fn pages(offset: u64, len: usize) -> std::ops::RangeInclusive<u32> {
        let first = offset >> PAGE_ADDR_SIZE;
        let last = (offset + len.max(1) as u64 - 1) >> PAGE_ADDR_SIZE;
        first as u32..=last as u32
    }

    /// Slot holding `page` for the copy pass. Pages resolved by
    /// `check_access` are normally still resident and are not counted again.
    fn slot_for(&mut self, page: u32) -> Result<usize> {
        match self.cache.lookup(&self.table, page) {
            Some(idx) => Ok(idx),
            None => self.cache.resolve(&mut self.table, &mut self.backing, page),
        }
    }

    /// Fault in every page of the range and check it grants `required`.
    fn check_access(&mut self, address: u32, len: usize, required: Permissions) -> Result<u64> {
        let offset = self.offset_of(address, len)?;
        for page in Self::pages(offset, len) {
            let idx = self.cache.resolve(&mut self.table, &mut self.backing, page)?;
            let actual = self.cache.slot(idx).permissions;
            if !actual.contains(required) {
                let page_va = self.image_base as u64 + ((page as u64) << PAGE_ADDR_SIZE);
                return Err(VmmError::PermissionDenied {
                    address: page_va.max(address as u64) as u32,
                    required,
                    actual,
                });
            }
        }
        Ok(offset)
    }

    /// Copy `buf.len()` bytes at `address` into `buf`, checking `access`
    /// rights on every page touched.
    pub fn read(&mut self, address: u32, buf: &mut [u8], access: Access) -> Result<()> {
        let mut offset = self.check_access(address, buf.len(), access.required())?;
        let mut done = 0;
        while done < buf.len() {
            let page = (offset >> PAGE_ADDR_SIZE) as u32;
            let start = page_offset(offset as u32);
            let n = (PAGE_SIZE - start).min(buf.len() - done);
            let idx = self.slot_for(page)?;
            buf[done..done + n].copy_from_slice(&self.cache.slot(idx).data[start..start + n]);
            done += n;
            offset += n as u64;
        }
        Ok(())
    }

    pub fn read_r(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        self.read(address, buf, Access::Read)
    }

    pub fn read_x(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        self.read(address, buf, Access::Execute)
    }

    pub fn read8(&mut self, address: u32) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_r(address, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read16(&mut self, address: u32) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_r(address, &mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    pub fn read32(&mut self, address: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_r(address, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    /// Store `data` at `address`. Nothing is written unless every page
    /// touched grants write access.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut offset = self.check_access(address, data.len(), Permissions::WRITE)?;
        let mut done = 0;
        while done < data.len() {
            let page = (offset >> PAGE_ADDR_SIZE) as u32;
            let start = page_offset(offset as u32);
            let n = (PAGE_SIZE - start).min(data.len() - done);
            let idx = self.slot_for(page)?;
            let slot = self.cache.slot_mut(idx);
            slot.data[start..start + n].copy_from_slice(&data[done..done + n]);
            slot.dirty = true;
            done += n;
            offset += n as u64;
        }
        Ok(())
    }

    pub fn write8(&mut self, address: u32, value: u8) -> Result<()> {
        self.write(address, &[value])
    }

    pub fn write16(&mut self, address: u32, value: u16) -> Result<()> {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.write(address, &buf)
    }

    pub fn write32(&mut self, address: u32, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write(address, &buf)
    }

    /// Permission bits of the page containing `address`.
    pub fn protection(&self, address: u32) -> Result<Permissions> {
        let offset = self.offset_of(address, 1)?;
        Ok(self.table[(offset >> PAGE_ADDR_SIZE) as u32].permissions)
    }

    /// Replace the permission bits of every page touched by `len` bytes at
    /// `address`. A page nothing was mapped to becomes usable this way, reading
    /// as zeros until written.
    pub fn set_protection(
        &mut self,
        address: u32,
        len: usize,
        permissions: Permissions,
    ) -> Result<()> {
        let offset = self.offset_of(address, len)?;
        for page in Self::pages(offset, len) {
            self.table[page].permissions = permissions;
            self.cache.update_permissions(&self.table, page, permissions);
        }
        debug!("protection {:#010x}+{:#x} set to {}", address, len, permissions);
        Ok(())
    }

    /// Write back every dirty resident page to the scratch store.
    pub fn flush(&mut self) {
        self.cache.flush(&mut self.table, &mut self.backing);
    }

    /// Flush and drop the resident working set.
    pub fn invalidate_cache(&mut self) {
        self.cache.invalidate(&mut self.table, &mut self.backing);
    }

    /// Tear down the address space, removing the scratch store.
    pub fn destroy(mut self) {
        self.backing.discard_scratch();
    }
}

impl<R> AddressSpace<R> {
    pub fn usage(&self) -> String {
        let resident = self.cache.resident() * PAGE_SIZE;
        let scratch = self
            .backing
            .scratch()
            .map(|s| s.cursor() as usize * GRANULE_SIZE)
            .unwrap_or(0);
        format!(
            "{} KiB resident, {} KiB in scratch store",
            resident >> 10,
            scratch >> 10
        )
    }
}

impl<R> Drop for AddressSpace<R> {
    fn drop(&mut self) {
        self.backing.discard_scratch();
    }
}

impl<R> Display for AddressSpace<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AddressSpace {{ base: {:#010x}, pages: {}, {}, {} }}",
            self.image_base,
            self.table.len(),
            self.usage(),
            self.cache.stats()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::SectionFlags;
    use std::io::Cursor;

    fn rw() -> u32 {
        (SectionFlags::MEM_READ | SectionFlags::MEM_WRITE).bits()
    }

    fn space(pages: u32) -> (tempfile::TempDir, AddressSpace<Cursor<Vec<u8>>>) {
        let dir = tempfile::tempdir().unwrap();
        let config = VmmConfig::default().with_scratch_dir(dir.path());
        let sections = [Section {
            rva: 0x1000,
            virtual_size: pages * PAGE_SIZE as u32,
            raw_offset: 0x1000,
            characteristics: rw(),
        }];
        let file = Cursor::new(vec![0u8; (pages as usize + 1) * PAGE_SIZE]);
        let vm =
            AddressSpace::with_config(&ImageHeader::default(), &sections, file, config).unwrap();
        (dir, vm)
    }

    #[test]
    fn test_below_image_base_is_out_of_bounds() {
        let (_dir, mut vm) = space(1);
        assert!(matches!(
            vm.read8(0x3fffff),
            Err(VmmError::OutOfBounds { address: 0x3fffff })
        ));
    }

    #[test]
    fn test_access_straddling_the_end_is_out_of_bounds() {
        let (_dir, mut vm) = space(1);
        let end = 0x400000 + vm.extent() as u32;
        assert!(vm.read16(end - 2).is_ok());
        assert!(matches!(
            vm.read32(end - 2),
            Err(VmmError::OutOfBounds { .. })
        ));
        assert!(matches!(
            vm.write8(end, 1),
            Err(VmmError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_value_across_page_boundary() {
        let (_dir, mut vm) = space(2);
        vm.write32(0x401ffe, 0xdeadbeef).unwrap();
        assert_eq!(vm.read32(0x401ffe).unwrap(), 0xdeadbeef);
        assert_eq!(vm.read16(0x402000).unwrap(), 0xdead);
    }

    #[test]
    fn test_denied_write_across_boundary_changes_nothing() {
        let (_dir, mut vm) = space(2);
        vm.write32(0x401ffc, 0x11223344).unwrap();
        vm.set_protection(0x402000, 1, Permissions::READ).unwrap();

        let err = vm.write32(0x401ffe, 0xffffffff).unwrap_err();
        assert!(matches!(
            err,
            VmmError::PermissionDenied {
                address: 0x402000,
                ..
            }
        ));
        assert_eq!(vm.read32(0x401ffc).unwrap(), 0x11223344);
        assert_eq!(vm.read16(0x402000).unwrap(), 0);
    }

    #[test]
    fn test_set_protection_updates_resident_page() {
        let (_dir, mut vm) = space(1);
        vm.write8(0x401000, 5).unwrap();
        vm.set_protection(0x401000, 0x1000, Permissions::READ).unwrap();
        assert!(matches!(
            vm.write8(0x401000, 6),
            Err(VmmError::PermissionDenied { .. })
        ));
        assert_eq!(vm.read8(0x401000).unwrap(), 5);
    }

    #[test]
    fn test_execute_needs_execute_bit() {
        let (_dir, mut vm) = space(1);
        let mut buf = [0u8; 4];
        assert!(vm.read_r(0x401000, &mut buf).is_ok());
        assert!(matches!(
            vm.read_x(0x401000, &mut buf),
            Err(VmmError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn test_read_intent_maps_to_permission() {
        assert_eq!(Access::Read.required(), Permissions::READ);
        assert_eq!(Access::Execute.required(), Permissions::EXECUTE);
    }

    #[test]
    fn test_each_access_counts_once() {
        let (_dir, mut vm) = space(2);
        vm.read8(0x401000).unwrap();
        // page 1 faulted, page 2 came along with it
        assert_eq!(vm.stats().faults, 2);
        assert_eq!(vm.stats().hits, 0);

        vm.read8(0x401000).unwrap();
        assert_eq!(vm.stats().hits, 1);

        vm.read16(0x401fff).unwrap();
        assert_eq!(vm.stats().hits, 3);

        vm.write32(0x401ffe, 7).unwrap();
        assert_eq!(vm.stats().hits, 5);
        assert_eq!(vm.stats().faults, 2);
    }

    #[test]
    fn test_usage_reports_scratch_growth() {
        let (_dir, mut vm) = space(1);
        vm.write8(0x401000, 1).unwrap();
        vm.flush();
        assert_eq!(vm.usage(), "4 KiB resident, 4 KiB in scratch store");
        assert!(vm.to_string().contains("write-backs: 1"));
    }
}
