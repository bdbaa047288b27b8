// SPDX-License-Identifier: MIT

//! Write-back cache of fixed-size metadata tables (L2 slices and refcount
//! blocks), keyed by on-disk offset.
//!
//! Slots are addressed by index rather than pointers into the backing
//! buffer; a `get`/`get_empty` pins a slot and every pin is balanced by
//! exactly one `put`. The two caches of an image are managed together in
//! [`Caches`] because flushing one may first require flushing the other
//! (the L2 cache must not reach disk before the refcount blocks it relies
//! on).

use crate::error::{BlockError, BlockResult};
use crate::io;
use crate::node::Child;

/// Which of the two metadata caches an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    L2,
    Refblock,
}

#[derive(Debug, Clone, Copy, Default)]
struct CacheEntry {
    /// Disk offset of the cached table; 0 marks the slot empty.
    offset: u64,
    lru_counter: u64,
    ref_count: u32,
    dirty: bool,
}

/// One cache: a flat slot array plus a contiguous payload buffer.
pub struct MetaCache {
    entries: Vec<CacheEntry>,
    table_size: usize,
    buf: Vec<u8>,
    lru_counter: u64,
    depends: Option<CacheKind>,
    depends_on_flush: bool,
}

impl MetaCache {
    pub fn new(num_tables: usize, table_size: usize) -> Self {
        Self {
            entries: vec![CacheEntry::default(); num_tables],
            table_size,
            buf: vec![0u8; num_tables * table_size],
            lru_counter: 0,
            depends: None,
            depends_on_flush: false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn table(&self, slot: usize) -> &[u8] {
        &self.buf[slot * self.table_size..(slot + 1) * self.table_size]
    }

    #[inline]
    pub fn table_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.buf[slot * self.table_size..(slot + 1) * self.table_size]
    }

    /// Finds `offset` in the cache; on a miss, also picks the eviction
    /// victim (least recently used unpinned slot).
    fn lookup(&self, offset: u64) -> (Option<usize>, Option<usize>) {
        let size = self.entries.len();
        let start = (offset as usize / self.table_size * 4) % size;
        let mut min_lru: u64 = u64::MAX;
        let mut victim = None;

        let mut i = start;
        loop {
            let t = &self.entries[i];
            if t.offset == offset {
                return (Some(i), None);
            }
            if t.ref_count == 0 && t.lru_counter < min_lru {
                min_lru = t.lru_counter;
                victim = Some(i);
            }
            i += 1;
            if i == size {
                i = 0;
            }
            if i == start {
                break;
            }
        }
        (None, victim)
    }

    fn pin(&mut self, slot: usize) {
        self.entries[slot].ref_count += 1;
    }

    /// Releases a pin; the slot joins the LRU order once unreferenced.
    pub fn put(&mut self, slot: usize) {
        let e = &mut self.entries[slot];
        assert!(e.ref_count > 0, "cache put without a matching get");
        e.ref_count -= 1;
        if e.ref_count == 0 {
            self.lru_counter += 1;
            self.entries[slot].lru_counter = self.lru_counter;
        }
    }

    pub fn mark_dirty(&mut self, slot: usize) {
        self.entries[slot].dirty = true;
    }

    /// Drops a slot whose backing cluster became garbage, without flushing.
    pub fn discard_slot(&mut self, slot: usize) {
        let e = &mut self.entries[slot];
        assert!(e.ref_count == 0, "discarding a pinned cache slot");
        e.offset = 0;
        e.lru_counter = 0;
        e.dirty = false;
    }

    /// Slot currently caching the table at `offset`, pinned or not.
    pub fn lookup_offset(&self, offset: u64) -> Option<usize> {
        if offset == 0 {
            // 0 marks empty slots, never a cached table.
            return None;
        }
        self.entries.iter().position(|e| e.offset == offset)
    }

    /// Copies the table bytes of `from` into `to` (both slots of this
    /// cache).
    pub fn copy_table(&mut self, from: usize, to: usize) {
        let ts = self.table_size;
        self.buf.copy_within(from * ts..(from + 1) * ts, to * ts);
    }

    /// Raw write-back of one slot, without dependency resolution.
    fn write_back_slot(&mut self, file: &Child, slot: usize) -> BlockResult {
        let e = self.entries[slot];
        if !e.dirty || e.offset == 0 {
            return Ok(());
        }
        io::pwrite(file, e.offset, self.table(slot))?;
        self.entries[slot].dirty = false;
        Ok(())
    }
}

/// The paired caches of one image, with inter-cache flush dependencies.
pub struct Caches {
    pub l2: MetaCache,
    pub refblock: MetaCache,
}

fn is_enospc(e: &BlockError) -> bool {
    matches!(e, BlockError::Io(io) if io.kind() == std::io::ErrorKind::StorageFull)
}

impl Caches {
    pub fn new(l2_tables: usize, refblock_tables: usize, table_size: usize) -> Self {
        Self {
            l2: MetaCache::new(l2_tables, table_size),
            refblock: MetaCache::new(refblock_tables, table_size),
        }
    }

    #[inline]
    pub fn cache(&self, kind: CacheKind) -> &MetaCache {
        match kind {
            CacheKind::L2 => &self.l2,
            CacheKind::Refblock => &self.refblock,
        }
    }

    #[inline]
    pub fn cache_mut(&mut self, kind: CacheKind) -> &mut MetaCache {
        match kind {
            CacheKind::L2 => &mut self.l2,
            CacheKind::Refblock => &mut self.refblock,
        }
    }

    /// Loads the table at `offset`, reading it from disk on a miss.
    pub fn get(&mut self, file: &Child, kind: CacheKind, offset: u64) -> BlockResult<usize> {
        self.do_get(file, kind, offset, true)
    }

    /// Like [`Caches::get`] but leaves the slot contents untouched; for
    /// tables about to be initialised in memory.
    pub fn get_empty(&mut self, file: &Child, kind: CacheKind, offset: u64) -> BlockResult<usize> {
        self.do_get(file, kind, offset, false)
    }

    fn do_get(
        &mut self,
        file: &Child,
        kind: CacheKind,
        offset: u64,
        read_from_disk: bool,
    ) -> BlockResult<usize> {
        let (hit, victim) = self.cache(kind).lookup(offset);
        if let Some(slot) = hit {
            self.cache_mut(kind).pin(slot);
            return Ok(slot);
        }

        let Some(slot) = victim else {
            unreachable!("metadata cache exhausted: every slot is pinned");
        };
        self.entry_flush(file, kind, slot)?;

        let c = self.cache_mut(kind);
        c.entries[slot].offset = 0;
        if read_from_disk {
            io::pread(file, offset, c.table_mut(slot))?;
        }
        let c = self.cache_mut(kind);
        c.entries[slot].offset = offset;
        c.pin(slot);
        Ok(slot)
    }

    pub fn put(&mut self, kind: CacheKind, slot: usize) {
        self.cache_mut(kind).put(slot);
    }

    pub fn mark_dirty(&mut self, kind: CacheKind, slot: usize) {
        self.cache_mut(kind).mark_dirty(slot);
    }

    /// Flushes one slot, resolving the cache's dependency first.
    pub fn entry_flush(&mut self, file: &Child, kind: CacheKind, slot: usize) -> BlockResult {
        {
            let e = self.cache(kind).entries[slot];
            if !e.dirty || e.offset == 0 {
                return Ok(());
            }
        }
        if let Some(dep) = self.cache(kind).depends {
            self.flush(file, dep)?;
            let c = self.cache_mut(kind);
            c.depends = None;
            c.depends_on_flush = false;
        } else if self.cache(kind).depends_on_flush {
            io::flush(file.node())?;
            self.cache_mut(kind).depends_on_flush = false;
        }
        self.cache_mut(kind).write_back_slot(file, slot)
    }

    /// Writes back every dirty slot. Errors keep the dirty bit so the next
    /// flush retries; a full disk is not sticky.
    pub fn write_back(&mut self, file: &Child, kind: CacheKind) -> BlockResult {
        let mut ret = Ok(());
        for slot in 0..self.cache(kind).len() {
            if let Err(e) = self.entry_flush(file, kind, slot) {
                if !is_enospc(&e) {
                    ret = Err(e);
                }
            }
        }
        ret
    }

    /// Write-back plus a flush of the underlying file.
    pub fn flush(&mut self, file: &Child, kind: CacheKind) -> BlockResult {
        let res = self.write_back(file, kind);
        if res.is_ok() {
            io::flush(file.node())?;
        }
        res
    }

    /// Records that `kind` must not reach disk before `dep` has been
    /// flushed. A cache carries at most one dependency; conflicting ones
    /// are resolved by flushing first.
    pub fn set_dependency(&mut self, file: &Child, kind: CacheKind, dep: CacheKind) -> BlockResult {
        if let Some(dd) = self.cache(dep).depends {
            self.flush(file, dd)?;
            let c = self.cache_mut(dep);
            c.depends = None;
            c.depends_on_flush = false;
        }
        if let Some(cd) = self.cache(kind).depends {
            if cd != dep {
                self.flush(file, cd)?;
                let c = self.cache_mut(kind);
                c.depends = None;
                c.depends_on_flush = false;
            }
        }
        self.cache_mut(kind).depends = Some(dep);
        Ok(())
    }

    /// The file itself must be flushed before the next dirty write-back.
    pub fn depends_on_flush(&mut self, kind: CacheKind) {
        self.cache_mut(kind).depends_on_flush = true;
    }

    pub fn lookup_offset(&self, kind: CacheKind, offset: u64) -> Option<usize> {
        self.cache(kind).lookup_offset(offset)
    }

    pub fn discard_slot(&mut self, kind: CacheKind, slot: usize) {
        self.cache_mut(kind).discard_slot(slot);
    }

    pub fn copy_table(&mut self, kind: CacheKind, from: usize, to: usize) {
        self.cache_mut(kind).copy_table(from, to);
    }

    #[inline]
    pub fn table(&self, kind: CacheKind, slot: usize) -> &[u8] {
        self.cache(kind).table(slot)
    }

    #[inline]
    pub fn table_mut(&mut self, kind: CacheKind, slot: usize) -> &mut [u8] {
        self.cache_mut(kind).table_mut(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{OpenFlags, Perm};
    use crate::raw::Raw;
    use tempfile::TempDir;

    const TS: usize = 512;

    fn file_child(dir: &TempDir) -> Child {
        let path = dir.path().join("cache.img");
        let path = path.to_str().unwrap();
        Raw::create(path).unwrap();
        Child::new(Raw::open(path, OpenFlags::RDWR).unwrap(), Perm::ALL)
    }

    #[test]
    fn test_hit_and_pin_balance() {
        let dir = TempDir::new().unwrap();
        let file = file_child(&dir);
        let mut caches = Caches::new(4, 4, TS);

        let a = caches.get_empty(&file, CacheKind::L2, 512).unwrap();
        caches.table_mut(CacheKind::L2, a)[0] = 7;
        caches.put(CacheKind::L2, a);

        let b = caches.get(&file, CacheKind::L2, 512).unwrap();
        assert_eq!(a, b);
        assert_eq!(caches.table(CacheKind::L2, b)[0], 7);
        caches.put(CacheKind::L2, b);
    }

    #[test]
    fn test_eviction_writes_back_dirty() {
        let dir = TempDir::new().unwrap();
        let file = file_child(&dir);
        let mut caches = Caches::new(1, 1, TS);

        let a = caches.get_empty(&file, CacheKind::L2, 512).unwrap();
        caches.table_mut(CacheKind::L2, a).fill(0xAB);
        caches.mark_dirty(CacheKind::L2, a);
        caches.put(CacheKind::L2, a);

        // The single slot is reused; the dirty table must hit the disk.
        let b = caches.get_empty(&file, CacheKind::L2, 1024).unwrap();
        caches.put(CacheKind::L2, b);

        let mut out = [0u8; TS];
        io::pread(&file, 512, &mut out).unwrap();
        assert_eq!(out, [0xAB; TS]);
    }

    #[test]
    fn test_flush_dependency_order() {
        let dir = TempDir::new().unwrap();
        let file = file_child(&dir);
        let mut caches = Caches::new(2, 2, TS);

        let rb = caches.get_empty(&file, CacheKind::Refblock, 1024).unwrap();
        caches.table_mut(CacheKind::Refblock, rb).fill(0x11);
        caches.mark_dirty(CacheKind::Refblock, rb);
        caches.put(CacheKind::Refblock, rb);

        let l2 = caches.get_empty(&file, CacheKind::L2, 2048).unwrap();
        caches.table_mut(CacheKind::L2, l2).fill(0x22);
        caches.mark_dirty(CacheKind::L2, l2);
        caches.put(CacheKind::L2, l2);

        caches
            .set_dependency(&file, CacheKind::L2, CacheKind::Refblock)
            .unwrap();

        // Flushing only the L2 cache must push the refcount block first.
        caches.write_back(&file, CacheKind::L2).unwrap();

        let mut out = [0u8; TS];
        io::pread(&file, 1024, &mut out).unwrap();
        assert_eq!(out, [0x11; TS]);
        io::pread(&file, 2048, &mut out).unwrap();
        assert_eq!(out, [0x22; TS]);
    }

    #[test]
    fn test_discard_slot() {
        let dir = TempDir::new().unwrap();
        let file = file_child(&dir);
        let mut caches = Caches::new(2, 2, TS);

        let a = caches.get_empty(&file, CacheKind::L2, 512).unwrap();
        caches.table_mut(CacheKind::L2, a).fill(0xEE);
        caches.mark_dirty(CacheKind::L2, a);
        caches.put(CacheKind::L2, a);

        let slot = caches.lookup_offset(CacheKind::L2, 512).unwrap();
        caches.discard_slot(CacheKind::L2, slot);

        // Nothing reaches the disk for a discarded slot.
        caches.write_back(&file, CacheKind::L2).unwrap();
        assert_eq!(io::getlength(file.node()).unwrap(), 0);
    }
}
