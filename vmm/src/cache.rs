//! Bounded working set of resident pages.
//!
//! A fixed arena of [`CACHE_SLOTS`] buffers is refilled in round-robin order:
//! the victim of a fault is always the slot after the last one filled, no
//! matter how recently it was used. Ground truth stays in the page table and
//! the backing stores, so the whole cache may be dropped at any time once
//! dirty slots are written back.

use crate::backing::Backing;
use crate::error::{Result, VmmError};
use crate::page::{CachedPage, PageTable, Permissions, PAGE_SIZE};
use log::{trace, warn};
use std::fmt::{Display, Formatter};
use std::io::{Read, Seek};

pub const CACHE_SLOTS: usize = 15;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// resolutions served by the fast path or by a resident slot
    pub hits: u64,
    pub faults: u64,
    pub evictions: u64,
    pub write_backs: u64,
    pub write_back_failures: u64,
}

impl Display for CacheStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "hits: {}, faults: {}, evictions: {}, write-backs: {} ({} failed)",
            self.hits, self.faults, self.evictions, self.write_backs, self.write_back_failures
        )
    }
}

#[derive(Debug)]
pub struct PageCache {
    slots: Vec<CachedPage>,
    next_victim: usize,
    // page number and slot of the last resolved page, saves a table lookup
    // on repeated access to the same page
    last_used: Option<(u32, usize)>,
    stats: CacheStats,
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PageCache {
    pub fn new() -> Self {
        Self {
            slots: (0..CACHE_SLOTS).map(|_| CachedPage::new()).collect(),
            next_victim: 0,
            last_used: None,
            stats: CacheStats::default(),
        }
    }

    pub fn slot(&self, idx: usize) -> &CachedPage {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut CachedPage {
        &mut self.slots[idx]
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of slots currently holding a page.
    pub fn resident(&self) -> usize {
        self.slots.iter().filter(|s| s.owner.is_some()).count()
    }

    /// Slot holding `page` if it is resident. Not counted in the stats.
    pub fn lookup(&self, table: &PageTable, page: u32) -> Option<usize> {
        table
            .get(page)
            .and_then(|e| e.resident_slot)
            .map(|idx| idx as usize)
    }

    /// Find or fault in `page`, returning the slot holding it.
    ///
    /// On a fault the following page is brought in as well, so that a value
    /// straddling the page boundary can be served without a second fault.
    pub fn resolve<R: Read + Seek>(
        &mut self,
        table: &mut PageTable,
        backing: &mut Backing<R>,
        page: u32,
    ) -> Result<usize> {
        if let Some((last_page, idx)) = self.last_used {
            if last_page == page {
                self.stats.hits += 1;
                return Ok(idx);
            }
        }

        let entry = table.get(page).ok_or(VmmError::OutOfBounds {
            address: page as u64 * PAGE_SIZE as u64,
        })?;
        if let Some(idx) = entry.resident_slot {
            let idx = idx as usize;
            self.stats.hits += 1;
            self.last_used = Some((page, idx));
            return Ok(idx);
        }

        let idx = self.fault_in(table, backing, page)?;
        let next = page + 1;
        if table.get(next).is_some_and(|e| e.resident_slot.is_none()) {
            if let Err(e) = self.fault_in(table, backing, next) {
                warn!("prefetch of page {:#x} failed: {}", next, e);
            }
        }
        self.last_used = Some((page, idx));
        Ok(idx)
    }

    fn fault_in<R: Read + Seek>(
        &mut self,
        table: &mut PageTable,
        backing: &mut Backing<R>,
        page: u32,
    ) -> Result<usize> {
        let idx = self.next_victim;
        self.next_victim = (idx + 1) % CACHE_SLOTS;
        self.evict(table, backing, idx);

        let entry = table[page];
        let slot = &mut self.slots[idx];
        if let Err(e) = backing.page_in(&entry, &mut slot.data) {
            warn!(
                "page in of {:#x} failed at {:#x}: {}",
                page,
                entry.backing_position(),
                e
            );
            slot.invalidate();
            return Err(e.into());
        }
        slot.owner = Some(page);
        slot.permissions = entry.permissions;
        slot.dirty = false;
        table[page].resident_slot = Some(idx as u8);
        self.stats.faults += 1;
        trace!("page {:#x} -> slot {}", page, idx);
        Ok(idx)
    }

    /// Empty slot `idx`, writing it back first when dirty.
    fn evict<R: Read + Seek>(&mut self, table: &mut PageTable, backing: &mut Backing<R>, idx: usize) {
        if let Some(owner) = self.slots[idx].owner {
            self.stats.evictions += 1;
            if self.slots[idx].dirty {
                self.write_back(table, backing, idx);
            }
            if let Some(entry) = table.get_mut(owner) {
                entry.resident_slot = None;
            }
            trace!("evicted page {:#x} from slot {}", owner, idx);
        }
        if self.last_used.is_some_and(|(_, last)| last == idx) {
            self.last_used = None;
        }
        self.slots[idx].invalidate();
    }

    /// Persist a dirty slot. Failures are logged and the write is dropped.
    fn write_back<R: Read + Seek>(
        &mut self,
        table: &mut PageTable,
        backing: &mut Backing<R>,
        idx: usize,
    ) {
        let slot = &mut self.slots[idx];
        let Some(entry) = slot.owner.and_then(|owner| table.get_mut(owner)) else {
            return;
        };
        match backing.page_out(entry, &slot.data) {
            Ok(()) => {
                self.stats.write_backs += 1;
                trace!(
                    "wrote back page {:#x} to scratch granule {:#x}",
                    slot.owner.unwrap_or_default(),
                    entry.backing_offset
                );
            }
            Err(e) => {
                self.stats.write_back_failures += 1;
                warn!(
                    "write-back of page {:#x} failed, dropping write: {}",
                    slot.owner.unwrap_or_default(),
                    e
                );
            }
        }
        slot.dirty = false;
    }

    /// Write back every dirty slot, keeping the pages resident.
    pub fn flush<R: Read + Seek>(&mut self, table: &mut PageTable, backing: &mut Backing<R>) {
        for idx in 0..CACHE_SLOTS {
            if self.slots[idx].owner.is_some() && self.slots[idx].dirty {
                self.write_back(table, backing, idx);
            }
        }
    }

    /// Write back and drop the whole working set.
    pub fn invalidate<R: Read + Seek>(&mut self, table: &mut PageTable, backing: &mut Backing<R>) {
        for idx in 0..CACHE_SLOTS {
            self.evict(table, backing, idx);
        }
        self.next_victim = 0;
    }

    /// Keep the snapshot of a resident page in step with the page table.
    pub fn update_permissions(&mut self, table: &PageTable, page: u32, permissions: Permissions) {
        if let Some(idx) = table.get(page).and_then(|e| e.resident_slot) {
            self.slots[idx as usize].permissions = permissions;
        }
    }
}
