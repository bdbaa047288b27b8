// SPDX-License-Identifier: MIT

//! Refcount engine: the two-level refcount structure, cluster allocation,
//! lazy refcount-table growth and discard coalescing.

use rcowio::be::{load_u16_be, load_u64_be, store_u16_be, store_u64_be};
use rcowio::bits::round_up;

use crate::cache::CacheKind;
use crate::consts::*;
use crate::error::{BlockError, BlockResult};
use crate::io;
use crate::qcow2::{DiscardType, MetaState, Qcow2};

/// A pending host-range discard, merged with its neighbours before being
/// issued.
#[derive(Debug, Clone, Copy)]
pub struct DiscardRegion {
    pub offset: u64,
    pub bytes: u64,
}

impl Qcow2 {
    /// Refcount of one host cluster; clusters beyond the refcount structure
    /// count as free.
    pub(crate) fn get_refcount(&self, st: &mut MetaState, cluster_index: u64) -> BlockResult<u16> {
        let l = self.layout();
        let table_index = (cluster_index >> l.refcount_block_bits) as usize;
        if table_index >= st.refcount_table.len() {
            return Ok(0);
        }
        let block_offset = st.refcount_table[table_index] & REFT_OFFSET_MASK;
        if block_offset == 0 {
            return Ok(0);
        }
        if l.offset_into_cluster(block_offset) > 0 {
            return Err(BlockError::CorruptImage("misaligned refcount block"));
        }

        let slot = st.caches.get(&self.file, CacheKind::Refblock, block_offset)?;
        let block_index = (cluster_index & (l.refcount_block_size - 1)) as usize;
        let refcount = load_u16_be(st.caches.table(CacheKind::Refblock, slot), block_index);
        st.caches.put(CacheKind::Refblock, slot);
        Ok(refcount)
    }

    /// Whether two host offsets are covered by the same refcount block.
    fn in_same_refcount_block(&self, offset_a: u64, offset_b: u64) -> bool {
        let l = self.layout();
        let shift = l.cluster_bits + l.refcount_block_bits;
        (offset_a >> shift) == (offset_b >> shift)
    }

    /// Loads (allocating if needed) the refcount block covering
    /// `cluster_index`. Returns a pinned cache slot plus an `again` marker:
    /// the refcount structure itself grew, so the caller's free-cluster scan
    /// must restart from the beginning of its range.
    fn alloc_refcount_block(
        &self,
        st: &mut MetaState,
        cluster_index: u64,
    ) -> BlockResult<(usize, bool)> {
        let l = self.layout();
        let table_index = (cluster_index >> l.refcount_block_bits) as usize;

        if table_index < st.refcount_table.len() {
            let block_offset = st.refcount_table[table_index] & REFT_OFFSET_MASK;
            if block_offset > 0 {
                if l.offset_into_cluster(block_offset) > 0 {
                    return Err(BlockError::CorruptImage("misaligned refcount block"));
                }
                let slot = st.caches.get(&self.file, CacheKind::Refblock, block_offset)?;
                return Ok((slot, false));
            }
        }

        // We are about to write to the refcount table, so the L2 tables that
        // might still reference freed clusters must reach the disk first.
        st.caches.flush(&self.file, CacheKind::L2)?;

        // Allocate the refcount block itself and mark it as used.
        let new_block = self.alloc_clusters_noref(st, l.cluster_size, u64::MAX)?;
        if new_block == 0 {
            return Err(BlockError::RefcountAllocFailed);
        }

        let slot = if self.in_same_refcount_block(new_block, cluster_index << l.cluster_bits) {
            // The new block describes its own cluster; set that refcount
            // directly instead of recursing.
            let slot = st.caches.get_empty(&self.file, CacheKind::Refblock, new_block)?;
            let table = st.caches.table_mut(CacheKind::Refblock, slot);
            table.fill(0);
            let block_index = ((new_block >> l.cluster_bits) & (l.refcount_block_size - 1)) as usize;
            store_u16_be(table, block_index, 1);
            slot
        } else {
            match self.update_refcount(st, new_block, l.cluster_size, 1, false, DiscardType::Never)
            {
                Ok(()) => {}
                Err(e) => {
                    return Err(e);
                }
            }
            st.caches.flush(&self.file, CacheKind::Refblock)?;
            let slot = st.caches.get_empty(&self.file, CacheKind::Refblock, new_block)?;
            st.caches.table_mut(CacheKind::Refblock, slot).fill(0);
            slot
        };

        // The new refcount block must be durable before anything points at
        // it.
        st.caches.mark_dirty(CacheKind::Refblock, slot);
        if let Err(e) = st.caches.flush(&self.file, CacheKind::Refblock) {
            st.caches.put(CacheKind::Refblock, slot);
            return Err(e);
        }

        if table_index < st.refcount_table.len() {
            // The block fits the current table; persist just that entry.
            let mut entry = [0u8; REFTABLE_ENTRY_SIZE as usize];
            store_u64_be(&mut entry, 0, new_block);
            if let Err(e) = io::pwrite(
                &self.file,
                st.refcount_table_offset + table_index as u64 * REFTABLE_ENTRY_SIZE,
                &entry,
            ) {
                st.caches.put(CacheKind::Refblock, slot);
                return Err(e);
            }

            st.refcount_table[table_index] = new_block;
            if (st.max_refcount_table_index as usize) < table_index {
                st.max_refcount_table_index = table_index as u32;
            }
            return Ok((slot, true));
        }

        // The table itself is full: grow the refcount area.
        st.caches.put(CacheKind::Refblock, slot);

        let blocks_used = (cluster_index + 1)
            .max((new_block >> l.cluster_bits) + 1)
            .div_ceil(l.refcount_block_size);
        let meta_offset = blocks_used * l.refcount_block_size * l.cluster_size;

        self.refcount_area(st, meta_offset, 0, false, table_index as u64, new_block)?;

        let slot = st.caches.get(&self.file, CacheKind::Refblock, new_block)?;
        Ok((slot, true))
    }

    /// Refcount blocks needed to cover `clusters` host clusters.
    fn refcount_metadata_size(&self, clusters: u64) -> u64 {
        clusters.div_ceil(self.layout().refcount_block_size)
    }

    /// Grows the refcount structure: writes a new, larger refcount table at
    /// `start_offset` (preceded by any refblocks that still need creating),
    /// switches to it in memory and frees the old table.
    ///
    /// The on-disk header keeps its original refcount-table fields; a
    /// close/open after growth observes the old table. Known limitation
    /// carried over from the reference behaviour.
    fn refcount_area(
        &self,
        st: &mut MetaState,
        start_offset: u64,
        additional_clusters: u64,
        exact_size: bool,
        new_refblock_index: u64,
        new_refblock_offset: u64,
    ) -> BlockResult<u64> {
        let l = self.layout();
        debug_assert!(l.offset_into_cluster(start_offset) == 0);

        let total_refblock_count =
            self.refcount_metadata_size(start_offset / l.cluster_size + additional_clusters);
        if total_refblock_count * REFTABLE_ENTRY_SIZE > MAX_REFTABLE_BYTES {
            return Err(BlockError::TooBig);
        }

        let area_reftable_index = (start_offset / l.cluster_size) / l.refcount_block_size;

        let mut table_size = if exact_size {
            total_refblock_count
        } else {
            // Grow with ~50 % slack so the next growth is further away.
            total_refblock_count + round_up(total_refblock_count, 2)
        };
        // The file stores the reftable size in whole clusters.
        table_size = round_up(table_size, l.cluster_size / REFTABLE_ENTRY_SIZE);
        let table_clusters = (table_size * REFTABLE_ENTRY_SIZE) / l.cluster_size;

        if table_size * REFTABLE_ENTRY_SIZE > MAX_REFTABLE_BYTES {
            return Err(BlockError::TooBig);
        }

        tracing::debug!(
            start_offset,
            total_refblock_count,
            table_size,
            "growing refcount table"
        );

        let mut new_table = vec![0u64; table_size as usize];
        let keep = st
            .refcount_table
            .len()
            .min(st.max_refcount_table_index as usize + 1)
            .min(new_table.len());
        new_table[..keep].copy_from_slice(&st.refcount_table[..keep]);

        if new_refblock_offset > 0 {
            new_table[new_refblock_index as usize] = new_refblock_offset;
        }

        // Count how many refblocks still have to be created.
        let mut additional_refblock_count = 0u64;
        for entry in new_table
            .iter()
            .take(total_refblock_count as usize)
            .skip(area_reftable_index as usize)
        {
            if *entry == 0 {
                additional_refblock_count += 1;
            }
        }

        let table_offset = start_offset + additional_refblock_count * l.cluster_size;
        let end_offset = table_offset + table_clusters * l.cluster_size;

        // Fill the refcount blocks, creating the missing ones in front of
        // the new table.
        let mut block_offset = start_offset;
        for i in area_reftable_index..total_refblock_count {
            let slot = if new_table[i as usize] > 0 {
                st.caches
                    .get(&self.file, CacheKind::Refblock, new_table[i as usize])?
            } else {
                let slot = st.caches.get_empty(&self.file, CacheKind::Refblock, block_offset)?;
                st.caches.table_mut(CacheKind::Refblock, slot).fill(0);
                st.caches.mark_dirty(CacheKind::Refblock, slot);
                new_table[i as usize] = block_offset;
                block_offset += l.cluster_size;
                slot
            };

            // Mark the new area's own clusters used in the refblock that
            // covers them.
            let first_offset_covered = i * l.refcount_block_size * l.cluster_size;
            if first_offset_covered < end_offset {
                let start_index = if first_offset_covered < start_offset {
                    (start_offset - first_offset_covered) / l.cluster_size
                } else {
                    0
                };
                let end_index = ((end_offset - first_offset_covered) / l.cluster_size)
                    .min(l.refcount_block_size);
                let table = st.caches.table_mut(CacheKind::Refblock, slot);
                for j in start_index..end_index {
                    store_u16_be(table, j as usize, 1);
                }
                st.caches.mark_dirty(CacheKind::Refblock, slot);
            }

            st.caches.put(CacheKind::Refblock, slot);
        }

        st.caches.flush(&self.file, CacheKind::Refblock)?;

        // Write the new refcount table.
        let mut raw = vec![0u8; (table_size * REFTABLE_ENTRY_SIZE) as usize];
        for (i, entry) in new_table.iter().enumerate() {
            store_u64_be(&mut raw, i, *entry);
        }
        io::pwrite(&self.file, table_offset, &raw)?;

        // Switch in memory and release the old table.
        let old_table_offset = st.refcount_table_offset;
        let old_table_size = st.refcount_table.len() as u64;

        st.refcount_table = new_table;
        st.refcount_table_offset = table_offset;
        Self::update_max_refcount_table_index(st);

        self.free_clusters(
            st,
            old_table_offset,
            old_table_size * REFTABLE_ENTRY_SIZE,
            DiscardType::Other,
        );

        Ok(end_offset)
    }

    /// Adjusts the refcount of every cluster in `[offset, offset+length)` by
    /// `addend`. Counters reaching zero invalidate matching cache slots,
    /// feed the discard machinery and lower the free-cluster scan hint. On
    /// error, the clusters already walked are compensated in reverse.
    pub(crate) fn update_refcount(
        &self,
        st: &mut MetaState,
        offset: u64,
        length: u64,
        addend: u16,
        decrease: bool,
        discard_type: DiscardType,
    ) -> BlockResult {
        let l = self.layout();
        if length == 0 {
            return Ok(());
        }

        if decrease {
            // Freed clusters may still be referenced from unflushed L2
            // entries; those must reach the disk before the refcount drop.
            st.caches
                .set_dependency(&self.file, CacheKind::Refblock, CacheKind::L2)?;
        }

        let start = l.start_of_cluster(offset);
        let last = l.start_of_cluster(offset + length - 1);

        let mut block_slot: Option<usize> = None;
        let mut old_table_index: Option<u64> = None;
        let mut err: Option<BlockError> = None;
        let mut cluster_offset = start;

        while cluster_offset <= last {
            let cluster_index = cluster_offset >> l.cluster_bits;
            let table_index = cluster_index >> l.refcount_block_bits;

            // Load the refcount block, allocating it if needed.
            if old_table_index != Some(table_index) {
                if let Some(slot) = block_slot.take() {
                    st.caches.put(CacheKind::Refblock, slot);
                }
                match self.alloc_refcount_block(st, cluster_index) {
                    Ok((slot, again)) => {
                        if again && st.free_cluster_index > (start >> l.cluster_bits) {
                            st.free_cluster_index = start >> l.cluster_bits;
                        }
                        block_slot = Some(slot);
                    }
                    Err(e) => {
                        err = Some(e);
                        break;
                    }
                }
                old_table_index = Some(table_index);
            }
            let Some(slot) = block_slot else {
                err = Some(BlockError::RefcountAllocFailed);
                break;
            };
            st.caches.mark_dirty(CacheKind::Refblock, slot);

            let block_index = (cluster_index & (l.refcount_block_size - 1)) as usize;
            let table = st.caches.table_mut(CacheKind::Refblock, slot);
            let old_refcount = load_u16_be(table, block_index);
            let new_refcount = if decrease {
                match old_refcount.checked_sub(addend) {
                    Some(v) => v,
                    None => {
                        err = Some(BlockError::InvalidArgument);
                        break;
                    }
                }
            } else {
                match old_refcount.checked_add(addend) {
                    Some(v) => v,
                    None => {
                        err = Some(BlockError::InvalidArgument);
                        break;
                    }
                }
            };
            store_u16_be(table, block_index, new_refcount);

            if new_refcount == 0 {
                if cluster_index < st.free_cluster_index {
                    st.free_cluster_index = cluster_index;
                }

                // The freed cluster may itself back a cached table.
                if let Some(s) = st.caches.lookup_offset(CacheKind::Refblock, cluster_offset) {
                    if Some(s) == block_slot {
                        st.caches.put(CacheKind::Refblock, s);
                        block_slot = None;
                        old_table_index = None;
                    }
                }
                if let Some(s) = st.caches.lookup_offset(CacheKind::L2, cluster_offset) {
                    st.caches.discard_slot(CacheKind::L2, s);
                }

                if discard_type.passthrough() {
                    self.queue_discard(st, cluster_offset, l.cluster_size);
                }
            }

            cluster_offset += l.cluster_size;
        }

        if let Some(slot) = block_slot.take() {
            st.caches.put(CacheKind::Refblock, slot);
        }

        if let Some(e) = err {
            // Undo the part that was already applied.
            if cluster_offset > offset {
                let _ = self.update_refcount(
                    st,
                    offset,
                    cluster_offset - offset,
                    addend,
                    !decrease,
                    DiscardType::Never,
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// Scans for `size` worth of contiguous free clusters without touching
    /// refcounts. The scan restarts whenever it trips over a used cluster.
    fn alloc_clusters_noref(&self, st: &mut MetaState, size: u64, max: u64) -> BlockResult<u64> {
        let l = self.layout();
        let nb_clusters = l.size_to_clusters(size);

        'retry: loop {
            for _ in 0..nb_clusters {
                let next = st.free_cluster_index;
                st.free_cluster_index += 1;
                if self.get_refcount(st, next)? != 0 {
                    continue 'retry;
                }
            }
            break;
        }

        if st.free_cluster_index > 0 && st.free_cluster_index - 1 > (max >> l.cluster_bits) {
            return Err(BlockError::TooBig);
        }
        Ok((st.free_cluster_index - nb_clusters) << l.cluster_bits)
    }

    /// Allocates `size` bytes of clusters and bumps their refcounts.
    /// Retried internally: bumping the counts may grow the refcount area,
    /// which invalidates the scan.
    pub(crate) fn alloc_clusters(&self, st: &mut MetaState, size: u64) -> BlockResult<u64> {
        loop {
            let offset = self.alloc_clusters_noref(st, size, MAX_IMAGE_SIZE)?;
            match self.update_refcount(st, offset, size, 1, false, DiscardType::Never) {
                Err(e) if e.is_again() => continue,
                Err(e) => return Err(e),
                Ok(()) => return Ok(offset),
            }
        }
    }

    /// Allocates up to `nb_clusters` clusters at a fixed host offset;
    /// returns how many consecutive clusters were actually free there.
    pub(crate) fn alloc_clusters_at(
        &self,
        st: &mut MetaState,
        offset: u64,
        nb_clusters: u64,
    ) -> BlockResult<u64> {
        let l = self.layout();
        if nb_clusters == 0 {
            return Ok(0);
        }
        loop {
            let mut cluster_index = offset >> l.cluster_bits;
            let mut grabbed = 0u64;
            while grabbed < nb_clusters {
                if self.get_refcount(st, cluster_index)? != 0 {
                    break;
                }
                cluster_index += 1;
                grabbed += 1;
            }
            match self.update_refcount(
                st,
                offset,
                grabbed << l.cluster_bits,
                1,
                false,
                DiscardType::Never,
            ) {
                Err(e) if e.is_again() => continue,
                Err(e) => return Err(e),
                Ok(()) => return Ok(grabbed),
            }
        }
    }

    /// Drops one reference on each covered cluster. Failures are reported
    /// but not propagated: a missed free leaks space, it does not corrupt.
    pub(crate) fn free_clusters(
        &self,
        st: &mut MetaState,
        offset: u64,
        size: u64,
        discard_type: DiscardType,
    ) {
        if let Err(e) = self.update_refcount(st, offset, size, 1, true, discard_type) {
            tracing::error!(offset, size, error = %e, "freeing clusters failed");
        }
    }

    pub(crate) fn update_max_refcount_table_index(st: &mut MetaState) {
        let mut i = st.refcount_table.len().saturating_sub(1);
        while i > 0 && (st.refcount_table[i] & REFT_OFFSET_MASK) == 0 {
            i -= 1;
        }
        st.max_refcount_table_index = i as u32;
    }

    /// Reads the on-disk refcount table into memory.
    pub(crate) fn refcount_init(&self, st: &mut MetaState) -> BlockResult {
        let entries = st.refcount_table.len();
        if entries == 0 {
            return Ok(());
        }
        let mut raw = vec![0u8; entries * REFTABLE_ENTRY_SIZE as usize];
        io::pread(&self.file, st.refcount_table_offset, &mut raw)?;
        for i in 0..entries {
            st.refcount_table[i] = load_u64_be(&raw, i);
        }
        Self::update_max_refcount_table_index(st);
        Ok(())
    }

    // === Discard coalescing ===

    /// Queues `[offset, offset+bytes)` for discard, merging with
    /// overlapping or adjacent pending regions. Within a bulk operation the
    /// queue drains once at the end; outside one, immediately.
    pub(crate) fn queue_discard(&self, st: &mut MetaState, offset: u64, bytes: u64) {
        let mut d = DiscardRegion { offset, bytes };

        // Absorb every pending region the new one overlaps or touches; the
        // union may grow into further neighbours, so keep sweeping.
        loop {
            let hit = st
                .discards
                .iter()
                .position(|p| p.offset <= d.offset + d.bytes && d.offset <= p.offset + p.bytes);
            let Some(i) = hit else {
                break;
            };
            let p = st.discards.remove(i);
            let start = d.offset.min(p.offset);
            let end = (d.offset + d.bytes).max(p.offset + p.bytes);
            d = DiscardRegion {
                offset: start,
                bytes: end - start,
            };
        }
        st.discards.push(d);

        if !st.cache_discards {
            self.process_discards(st, true);
        }
    }

    /// Drains the coalesced discard queue through the image file, but only
    /// when the enclosing operation succeeded.
    pub(crate) fn process_discards(&self, st: &mut MetaState, ok: bool) {
        for d in std::mem::take(&mut st.discards) {
            if ok {
                tracing::trace!(offset = d.offset, bytes = d.bytes, "issuing discard");
                let _ = io::pdiscard(&self.file, d.offset, d.bytes);
            }
        }
    }

    /// Writes back both metadata caches (L2 before refcount, honouring
    /// recorded dependencies).
    pub(crate) fn write_caches(&self, st: &mut MetaState) -> BlockResult {
        st.caches.write_back(&self.file, CacheKind::L2)?;
        st.caches.write_back(&self.file, CacheKind::Refblock)?;
        Ok(())
    }

    /// Cache write-back plus a flush of the image file.
    pub(crate) fn flush_caches(&self, st: &mut MetaState) -> BlockResult {
        self.write_caches(st)?;
        io::flush(self.file.node())
    }
}
