// SPDX-License-Identifier: MIT

//! Cluster/L2 engine: host-offset resolution, L2 table allocation, write
//! planning with copy-on-write regions, and the subcluster zeroize/discard
//! paths.

use rcowio::bits::{align_down, align_up, clz32, ctz32, cto32, is_aligned, round_up};
use rcowio::be::store_u64_be;
use rcowio::{IoVec, IoVecMut};

use crate::cache::CacheKind;
use crate::consts::*;
use crate::error::{BlockError, BlockResult};
use crate::flags::ReqFlags;
use crate::io;
use crate::layout::{sub_alloc, sub_alloc_range, sub_zero, sub_zero_range};
use crate::node::BlockNode;
use crate::qcow2::{DiscardType, MetaState, Qcow2};

/// Cluster-granularity mapping state of one L2 entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterType {
    Unallocated,
    ZeroPlain,
    ZeroAlloc,
    Normal,
    Compressed,
}

/// Subcluster-granularity state; without extended L2 entries a cluster is
/// its own single subcluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubclusterType {
    UnallocatedPlain,
    UnallocatedAlloc,
    ZeroPlain,
    ZeroAlloc,
    Normal,
    Compressed,
    Invalid,
}

/// Byte range inside an allocation that must be copied from the previous
/// cluster contents, relative to the first allocated cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct CowRegion {
    pub offset: u64,
    pub nb_bytes: u64,
}

/// Pending-write plan for a cluster run inside one L2 slice. Chained when a
/// guest write spans several allocation steps; consumed by the write task
/// and linked (or aborted) through `handle_l2meta`.
pub struct L2Meta<'a> {
    /// Guest offset, cluster-aligned.
    pub offset: u64,
    /// Host offset of the first allocated cluster.
    pub alloc_offset: u64,
    pub nb_clusters: u64,
    pub keep_old_clusters: bool,
    pub cow_start: CowRegion,
    pub cow_end: CowRegion,
    pub skip_cow: bool,
    /// Guest data merged into the COW write, if adjacency allows it.
    pub data_qiov: Option<&'a IoVec<'a>>,
    pub data_qiov_offset: u64,
    pub next: Option<Box<L2Meta<'a>>>,
}

impl L2Meta<'_> {
    /// Guest offset where the leading COW region ends.
    pub fn cow_start_end(&self) -> u64 {
        self.offset + self.cow_start.offset + self.cow_start.nb_bytes
    }
}

impl Qcow2 {
    pub(crate) fn get_cluster_type(&self, l2_entry: u64) -> ClusterType {
        let l = self.layout();
        if l2_entry & OFLAG_COMPRESSED != 0 {
            ClusterType::Compressed
        } else if (l2_entry & OFLAG_ZERO != 0) && !l.extended_l2 {
            if l2_entry & L2E_OFFSET_MASK != 0 {
                ClusterType::ZeroAlloc
            } else {
                ClusterType::ZeroPlain
            }
        } else if l2_entry & L2E_OFFSET_MASK == 0 {
            // External data files keep unallocated entries with COPIED set
            // for preallocated identity clusters.
            if self.has_data_file() && l2_entry & OFLAG_COPIED != 0 {
                ClusterType::Normal
            } else {
                ClusterType::Unallocated
            }
        } else {
            ClusterType::Normal
        }
    }

    pub(crate) fn cluster_is_allocated(ctype: ClusterType) -> bool {
        matches!(
            ctype,
            ClusterType::Compressed | ClusterType::Normal | ClusterType::ZeroAlloc
        )
    }

    pub(crate) fn get_subcluster_type(
        &self,
        l2_entry: u64,
        l2_bitmap: u64,
        sc_index: u64,
    ) -> SubclusterType {
        let l = self.layout();
        let ctype = self.get_cluster_type(l2_entry);
        if !l.extended_l2 {
            return match ctype {
                ClusterType::Compressed => SubclusterType::Compressed,
                ClusterType::ZeroPlain => SubclusterType::ZeroPlain,
                ClusterType::ZeroAlloc => SubclusterType::ZeroAlloc,
                ClusterType::Normal => SubclusterType::Normal,
                ClusterType::Unallocated => SubclusterType::UnallocatedPlain,
            };
        }

        let sc = sc_index as u32;
        match ctype {
            ClusterType::Compressed => SubclusterType::Compressed,
            ClusterType::Normal => {
                if (l2_bitmap >> 32) & l2_bitmap != 0 {
                    SubclusterType::Invalid
                } else if l2_bitmap & sub_zero(sc) != 0 {
                    SubclusterType::ZeroAlloc
                } else if l2_bitmap & sub_alloc(sc) != 0 {
                    SubclusterType::Normal
                } else {
                    SubclusterType::UnallocatedAlloc
                }
            }
            ClusterType::Unallocated => {
                if l2_bitmap & L2_BITMAP_ALL_ALLOC != 0 {
                    SubclusterType::Invalid
                } else if l2_bitmap & sub_zero(sc) != 0 {
                    SubclusterType::ZeroPlain
                } else {
                    SubclusterType::UnallocatedPlain
                }
            }
            // The zero flag does not exist with extended L2 entries.
            _ => SubclusterType::Invalid,
        }
    }

    /// Number of contiguous subclusters of one type starting at `sc_from`
    /// within a single L2 entry, plus that type.
    pub(crate) fn get_subcluster_range_type(
        &self,
        l2_entry: u64,
        l2_bitmap: u64,
        sc_from: u64,
    ) -> BlockResult<(u64, SubclusterType)> {
        let l = self.layout();
        let sctype = self.get_subcluster_type(l2_entry, l2_bitmap, sc_from);

        if sctype == SubclusterType::Invalid {
            return Err(BlockError::InvalidArgument);
        }
        if !l.extended_l2 || sctype == SubclusterType::Compressed {
            return Ok((l.subclusters_per_cluster - sc_from, sctype));
        }

        let sc = sc_from as u32;
        let count = match sctype {
            SubclusterType::Normal => {
                let val = l2_bitmap as u32 | sub_alloc_range(0, sc) as u32;
                cto32(val) as u64 - sc_from
            }
            SubclusterType::ZeroPlain | SubclusterType::ZeroAlloc => {
                let val = ((l2_bitmap | sub_zero_range(0, sc)) >> 32) as u32;
                cto32(val) as u64 - sc_from
            }
            SubclusterType::UnallocatedPlain | SubclusterType::UnallocatedAlloc => {
                let val = (l2_bitmap >> 32) as u32
                    | (l2_bitmap as u32 & !(sub_alloc_range(0, sc) as u32));
                ctz32(val) as u64 - sc_from
            }
            _ => return Err(BlockError::InvalidArgument),
        };
        Ok((count, sctype))
    }

    /// Extends a run of same-typed subclusters across consecutive L2
    /// entries; allocated types additionally require contiguous host
    /// offsets.
    fn count_contiguous_subclusters(
        &self,
        st: &MetaState,
        nb_clusters: u64,
        sc_index: u64,
        l2_slot: usize,
        l2_index: u64,
    ) -> BlockResult<u64> {
        let l = self.layout();
        let mut count = 0u64;
        let mut check_offset = false;
        let mut expected_offset = 0u64;
        let mut expected_type = SubclusterType::Normal;

        debug_assert!(l2_index + nb_clusters <= l.l2_slice_size);
        for i in 0..nb_clusters {
            let first_sc = if i == 0 { sc_index } else { 0 };
            let slice = st.caches.table(CacheKind::L2, l2_slot);
            let l2_entry = l.l2_entry(slice, l2_index + i);
            let l2_bitmap = l.l2_bitmap(slice, l2_index + i);

            let (ret, tmp_type) = self
                .get_subcluster_range_type(l2_entry, l2_bitmap, first_sc)
                .map_err(|_| BlockError::CorruptImage("invalid subcluster state"))?;

            if i == 0 {
                if tmp_type == SubclusterType::Compressed {
                    return Ok(ret);
                }
                expected_type = tmp_type;
                expected_offset = l2_entry & L2E_OFFSET_MASK;
                check_offset = matches!(
                    tmp_type,
                    SubclusterType::Normal
                        | SubclusterType::ZeroAlloc
                        | SubclusterType::UnallocatedAlloc
                );
            } else if tmp_type != expected_type {
                break;
            } else if check_offset {
                expected_offset += l.cluster_size;
                if expected_offset != l2_entry & L2E_OFFSET_MASK {
                    break;
                }
            }

            count += ret;
            // Stop on type changes before the end of the cluster.
            if first_sc + ret < l.subclusters_per_cluster {
                break;
            }
        }
        Ok(count)
    }

    /// Loads the L2 slice that maps `offset`, given the table's disk
    /// offset.
    fn l2_load(&self, st: &mut MetaState, offset: u64, l2_offset: u64) -> BlockResult<usize> {
        let l = self.layout();
        let start_of_slice =
            l.l2_entry_size() * (l.offset_to_l2_index(offset) - l.offset_to_l2_slice_index(offset));
        st.caches
            .get(&self.file, CacheKind::L2, l2_offset + start_of_slice)
    }

    /// Persists one L1 entry, batching at least a device-alignment unit of
    /// neighbouring entries.
    fn write_l1_entry(&self, st: &MetaState, l1_index: u64) -> BlockResult {
        let l = self.layout();
        let bufsize = L1E_SIZE.max((self.common.request_alignment as u64).min(l.cluster_size));
        let nentries = (bufsize / L1E_SIZE) as usize;
        let l1_start = align_down(l1_index, nentries as u64) as usize;
        let count = nentries.min(st.l1_table.len() - l1_start);

        let mut buf = vec![0u8; nentries * L1E_SIZE as usize];
        for i in 0..count {
            store_u64_be(&mut buf, i, st.l1_table[l1_start + i]);
        }
        io::pwrite(
            &self.file,
            st.l1_table_offset + L1E_SIZE * l1_start as u64,
            &buf,
        )?;
        Ok(())
    }

    /// Allocates a fresh L2 table for `l1_index`, copying the old table
    /// when one exists without sole ownership, and repoints the L1 entry.
    fn l2_allocate(&self, st: &mut MetaState, l1_index: usize) -> BlockResult {
        let l = self.layout();
        let old_l2_offset = st.l1_table[l1_index];
        let l2_bytes = l.l2_size * l.l2_entry_size();

        let l2_offset = self.alloc_clusters(st, l2_bytes)?;
        debug_assert_eq!(l2_offset & L1E_OFFSET_MASK, l2_offset);
        if l2_offset == 0 {
            return Err(BlockError::L2AllocFailed);
        }

        let res: BlockResult = 'body: {
            // The new table's refcounts must be durable before the L1 entry
            // points at it.
            if let Err(e) = st.caches.flush(&self.file, CacheKind::Refblock) {
                break 'body Err(e);
            }

            let slice_bytes = (l.l2_slice_size * l.l2_entry_size()) as usize;
            let n_slices = l.cluster_size as usize / slice_bytes;
            for slice in 0..n_slices {
                let slice_off = l2_offset + (slice * slice_bytes) as u64;
                let slot = match st.caches.get_empty(&self.file, CacheKind::L2, slice_off) {
                    Ok(s) => s,
                    Err(e) => break 'body Err(e),
                };
                if old_l2_offset & L1E_OFFSET_MASK == 0 {
                    // No previous table: a fresh, empty slice.
                    st.caches.table_mut(CacheKind::L2, slot).fill(0);
                } else {
                    let old_slice_off =
                        (old_l2_offset & L1E_OFFSET_MASK) + (slice * slice_bytes) as u64;
                    let old_slot = match st.caches.get(&self.file, CacheKind::L2, old_slice_off) {
                        Ok(s) => s,
                        Err(e) => {
                            st.caches.put(CacheKind::L2, slot);
                            break 'body Err(e);
                        }
                    };
                    st.caches.copy_table(CacheKind::L2, old_slot, slot);
                    st.caches.put(CacheKind::L2, old_slot);
                }
                st.caches.mark_dirty(CacheKind::L2, slot);
                st.caches.put(CacheKind::L2, slot);
            }
            if let Err(e) = st.caches.flush(&self.file, CacheKind::L2) {
                break 'body Err(e);
            }

            st.l1_table[l1_index] = l2_offset | OFLAG_COPIED;
            if let Err(e) = self.write_l1_entry(st, l1_index as u64) {
                break 'body Err(e);
            }
            Ok(())
        };

        if let Err(e) = res {
            st.l1_table[l1_index] = old_l2_offset;
            self.free_clusters(st, l2_offset, l2_bytes, DiscardType::Always);
            return Err(e);
        }
        Ok(())
    }

    /// Returns the (pinned) L2 slice and slice index for `offset`,
    /// allocating a writable L2 table first when the current one is shared
    /// or absent.
    fn get_cluster_table(&self, st: &mut MetaState, offset: u64) -> BlockResult<(usize, u64)> {
        let l = self.layout();
        let l1_index = l.offset_to_l1_index(offset) as usize;
        if l1_index >= st.l1_table.len() {
            return Err(BlockError::OutOfRange);
        }

        let mut l2_offset = st.l1_table[l1_index] & L1E_OFFSET_MASK;
        if l.offset_into_cluster(l2_offset) > 0 {
            return Err(BlockError::CorruptImage("misaligned L2 table"));
        }

        if st.l1_table[l1_index] & OFLAG_COPIED == 0 {
            // Allocate a new L2 table (with COW of the old one), then drop
            // the old table's reference.
            self.l2_allocate(st, l1_index)?;
            if l2_offset > 0 {
                self.free_clusters(
                    st,
                    l2_offset,
                    l.l2_size * l.l2_entry_size(),
                    DiscardType::Other,
                );
            }
            l2_offset = st.l1_table[l1_index] & L1E_OFFSET_MASK;
            debug_assert_eq!(l.offset_into_cluster(l2_offset), 0);
        }

        let slot = self.l2_load(st, offset, l2_offset)?;
        Ok((slot, l.offset_to_l2_slice_index(offset)))
    }

    /// Resolves a guest offset: `(host_offset, usable_bytes, type)`. The
    /// byte count extends across same-typed contiguous subclusters within
    /// one L2 slice, clipped to the request.
    pub(crate) fn get_host_offset(
        &self,
        st: &mut MetaState,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<(u64, u64, SubclusterType)> {
        let l = self.layout();
        let offset_in_cluster = l.offset_into_cluster(offset);
        let slice_cap = (l.l2_slice_size - l.offset_to_l2_slice_index(offset)) << l.cluster_bits;
        let bytes_needed = (bytes + offset_in_cluster).min(slice_cap);

        let mut host_offset = 0u64;

        let (sctype, bytes_available) = 'resolve: {
            let l1_index = l.offset_to_l1_index(offset) as usize;
            if l1_index >= st.l1_table.len() {
                break 'resolve (SubclusterType::UnallocatedPlain, slice_cap);
            }

            let l2_offset = st.l1_table[l1_index] & L1E_OFFSET_MASK;
            if l2_offset == 0 {
                break 'resolve (SubclusterType::UnallocatedPlain, slice_cap);
            }
            if l.offset_into_cluster(l2_offset) > 0 {
                return Err(BlockError::CorruptImage("misaligned L2 table"));
            }

            let slot = self.l2_load(st, offset, l2_offset)?;
            let l2_index = l.offset_to_l2_slice_index(offset);
            let sc_index = l.offset_to_sc_index(offset);
            let slice = st.caches.table(CacheKind::L2, slot);
            let l2_entry = l.l2_entry(slice, l2_index);
            let l2_bitmap = l.l2_bitmap(slice, l2_index);
            let nb_clusters = l.size_to_clusters(bytes_needed);

            let sctype = self.get_subcluster_type(l2_entry, l2_bitmap, sc_index);
            if self.version() < VERSION_3
                && matches!(
                    sctype,
                    SubclusterType::ZeroPlain | SubclusterType::ZeroAlloc
                )
            {
                st.caches.put(CacheKind::L2, slot);
                return Err(BlockError::CorruptImage("zero cluster in a v2 image"));
            }

            match sctype {
                SubclusterType::Invalid
                | SubclusterType::Compressed
                | SubclusterType::ZeroPlain
                | SubclusterType::UnallocatedPlain => {}
                SubclusterType::ZeroAlloc
                | SubclusterType::Normal
                | SubclusterType::UnallocatedAlloc => {
                    let host_cluster_offset = l2_entry & L2E_OFFSET_MASK;
                    host_offset = host_cluster_offset + offset_in_cluster;
                    if l.offset_into_cluster(host_cluster_offset) > 0 {
                        st.caches.put(CacheKind::L2, slot);
                        return Err(BlockError::CorruptImage("misaligned data cluster"));
                    }
                    if self.has_data_file() && host_offset != offset {
                        st.caches.put(CacheKind::L2, slot);
                        return Err(BlockError::CorruptImage(
                            "data-file cluster mapped away from its guest offset",
                        ));
                    }
                }
            }

            let sc = match self.count_contiguous_subclusters(st, nb_clusters, sc_index, slot, l2_index)
            {
                Ok(sc) => sc,
                Err(e) => {
                    st.caches.put(CacheKind::L2, slot);
                    return Err(e);
                }
            };
            st.caches.put(CacheKind::L2, slot);
            (sctype, (sc + sc_index) << l.subcluster_bits)
        };

        let bytes_available = bytes_available.min(bytes_needed);
        Ok((host_offset, bytes_available - offset_in_cluster, sctype))
    }

    fn cluster_needs_new_alloc(&self, l2_entry: u64) -> bool {
        match self.get_cluster_type(l2_entry) {
            ClusterType::Normal | ClusterType::ZeroAlloc => l2_entry & OFLAG_COPIED == 0,
            ClusterType::Unallocated | ClusterType::Compressed | ClusterType::ZeroPlain => true,
        }
    }

    /// Length of the run of clusters that can be handled by a single write
    /// step: either all needing fresh allocation, or all reusable in place
    /// with contiguous host offsets.
    fn count_single_write_clusters(
        &self,
        st: &MetaState,
        nb_clusters: u64,
        l2_slot: usize,
        l2_index: u64,
        new_alloc: bool,
    ) -> u64 {
        let l = self.layout();
        let slice = st.caches.table(CacheKind::L2, l2_slot);
        let mut expected_offset = l.l2_entry(slice, l2_index) & L2E_OFFSET_MASK;

        let mut i = 0;
        while i < nb_clusters {
            let l2_entry = l.l2_entry(slice, l2_index + i);
            if self.cluster_needs_new_alloc(l2_entry) != new_alloc {
                break;
            }
            if !new_alloc {
                if expected_offset != l2_entry & L2E_OFFSET_MASK {
                    break;
                }
                expected_offset += l.cluster_size;
            }
            i += 1;
        }
        i
    }

    /// Picks the host offset for a fresh cluster run: identity mapping on
    /// external data files, the refcount allocator otherwise.
    fn do_alloc_cluster_offset(
        &self,
        st: &mut MetaState,
        guest_offset: u64,
        host_offset: &mut u64,
        nb_clusters: &mut u64,
    ) -> BlockResult {
        let l = self.layout();
        if self.has_data_file() {
            debug_assert!(
                *host_offset == INV_OFFSET || *host_offset == l.start_of_cluster(guest_offset)
            );
            *host_offset = l.start_of_cluster(guest_offset);
            return Ok(());
        }
        if *host_offset == INV_OFFSET {
            *host_offset = self.alloc_clusters(st, *nb_clusters * l.cluster_size)?;
        } else {
            *nb_clusters = self.alloc_clusters_at(st, *host_offset, *nb_clusters)?;
        }
        Ok(())
    }

    /// Computes the COW regions for a cluster run and prepends the
    /// resulting plan to `m`. With `keep_old`, a range whose touched
    /// subclusters are all normal needs no plan at all.
    fn calculate_l2_meta<'a>(
        &self,
        st: &mut MetaState,
        host_cluster_offset: u64,
        guest_offset: u64,
        bytes: u64,
        l2_slot: usize,
        m: &mut Option<Box<L2Meta<'a>>>,
        keep_old: bool,
    ) -> BlockResult {
        let l = self.layout();
        let l2_index = l.offset_to_l2_slice_index(guest_offset);
        let cow_start_to = l.offset_into_cluster(guest_offset);
        let cow_end_from = cow_start_to + bytes;
        let nb_clusters = l.size_to_clusters(cow_end_from);

        debug_assert!(nb_clusters <= l.l2_slice_size - l2_index);

        // Check the type of every affected subcluster.
        let mut skip_cow = keep_old;
        for i in 0..nb_clusters {
            let slice = st.caches.table(CacheKind::L2, l2_slot);
            let l2_entry = l.l2_entry(slice, l2_index + i);
            let l2_bitmap = l.l2_bitmap(slice, l2_index + i);
            if skip_cow {
                let write_from = cow_start_to.max(i << l.cluster_bits);
                let write_to = cow_end_from.min((i + 1) << l.cluster_bits);
                let first_sc = l.offset_to_sc_index(write_from);
                let last_sc = l.offset_to_sc_index(write_to - 1);
                let (cnt, sctype) =
                    self.get_subcluster_range_type(l2_entry, l2_bitmap, first_sc)?;
                if sctype != SubclusterType::Normal || first_sc + cnt <= last_sc {
                    skip_cow = false;
                }
            } else {
                let sctype = self.get_subcluster_type(l2_entry, l2_bitmap, 0);
                if sctype == SubclusterType::Invalid {
                    return Err(BlockError::CorruptImage("invalid subcluster state"));
                }
            }
        }
        if skip_cow {
            // Every touched subcluster already carries data owned by this
            // run; the write can go straight in place.
            return Ok(());
        }

        // Leading COW region, from the first cluster's entry.
        let slice = st.caches.table(CacheKind::L2, l2_slot);
        let l2_entry = l.l2_entry(slice, l2_index);
        let l2_bitmap = l.l2_bitmap(slice, l2_index);
        let sc_index = l.offset_to_sc_index(guest_offset);
        let sctype = self.get_subcluster_type(l2_entry, l2_bitmap, sc_index);

        let cow_start_from = if !keep_old {
            match sctype {
                SubclusterType::Compressed => 0,
                SubclusterType::Normal
                | SubclusterType::ZeroAlloc
                | SubclusterType::UnallocatedAlloc => {
                    if l.extended_l2 {
                        // Skip all leading zero and unallocated subclusters.
                        let alloc_bitmap = (l2_bitmap & L2_BITMAP_ALL_ALLOC) as u32;
                        sc_index.min(ctz32(alloc_bitmap) as u64) << l.subcluster_bits
                    } else {
                        0
                    }
                }
                SubclusterType::ZeroPlain | SubclusterType::UnallocatedPlain => {
                    sc_index << l.subcluster_bits
                }
                SubclusterType::Invalid => {
                    return Err(BlockError::CorruptImage("invalid subcluster state"));
                }
            }
        } else {
            match sctype {
                SubclusterType::Normal => cow_start_to,
                SubclusterType::ZeroAlloc | SubclusterType::UnallocatedAlloc => {
                    sc_index << l.subcluster_bits
                }
                _ => return Err(BlockError::CorruptImage("unexpected subcluster state")),
            }
        };

        // Trailing COW region, from the last cluster's entry.
        let last_index = l2_index + nb_clusters - 1;
        let l2_entry = l.l2_entry(slice, last_index);
        let l2_bitmap = l.l2_bitmap(slice, last_index);
        let sc_index = l.offset_to_sc_index(guest_offset + bytes - 1);
        let sctype = self.get_subcluster_type(l2_entry, l2_bitmap, sc_index);

        let cow_end_to = if !keep_old {
            match sctype {
                SubclusterType::Compressed => round_up(cow_end_from, l.cluster_size),
                SubclusterType::Normal
                | SubclusterType::ZeroAlloc
                | SubclusterType::UnallocatedAlloc => {
                    let mut end = round_up(cow_end_from, l.cluster_size);
                    if l.extended_l2 {
                        // Skip all trailing zero and unallocated subclusters.
                        let alloc_bitmap = (l2_bitmap & L2_BITMAP_ALL_ALLOC) as u32;
                        end -= (l.subclusters_per_cluster - sc_index - 1)
                            .min(clz32(alloc_bitmap) as u64)
                            << l.subcluster_bits;
                    }
                    end
                }
                SubclusterType::ZeroPlain | SubclusterType::UnallocatedPlain => {
                    round_up(cow_end_from, l.subcluster_size)
                }
                SubclusterType::Invalid => {
                    return Err(BlockError::CorruptImage("invalid subcluster state"));
                }
            }
        } else {
            match sctype {
                SubclusterType::Normal => cow_end_from,
                SubclusterType::ZeroAlloc | SubclusterType::UnallocatedAlloc => {
                    round_up(cow_end_from, l.subcluster_size)
                }
                _ => return Err(BlockError::CorruptImage("unexpected subcluster state")),
            }
        };

        let meta = L2Meta {
            offset: l.start_of_cluster(guest_offset),
            alloc_offset: host_cluster_offset,
            nb_clusters,
            keep_old_clusters: keep_old,
            cow_start: CowRegion {
                offset: cow_start_from,
                nb_bytes: cow_start_to - cow_start_from,
            },
            cow_end: CowRegion {
                offset: cow_end_from,
                nb_bytes: cow_end_to - cow_end_from,
            },
            skip_cow: false,
            data_qiov: None,
            data_qiov_offset: 0,
            next: m.take(),
        };
        st.in_flight_allocs
            .push((meta.offset, meta.nb_clusters));
        *m = Some(Box::new(meta));
        Ok(())
    }

    /// Reuses clusters already solely owned by this image. Returns whether
    /// progress was made; on progress, `host_offset` and `bytes` describe
    /// the reusable span and a keep-old plan was queued.
    fn handle_copied<'a>(
        &self,
        st: &mut MetaState,
        guest_offset: u64,
        host_offset: &mut u64,
        bytes: &mut u64,
        m: &mut Option<Box<L2Meta<'a>>>,
    ) -> BlockResult<bool> {
        let l = self.layout();
        debug_assert!(
            *host_offset == INV_OFFSET
                || l.offset_into_cluster(guest_offset) == l.offset_into_cluster(*host_offset)
        );

        let mut nb_clusters =
            l.size_to_clusters(l.offset_into_cluster(guest_offset) + *bytes);
        nb_clusters = nb_clusters.min(l.l2_slice_size - l.offset_to_l2_slice_index(guest_offset));

        let (slot, l2_index) = self.get_cluster_table(st, guest_offset)?;
        let slice = st.caches.table(CacheKind::L2, slot);
        let l2_entry = l.l2_entry(slice, l2_index);
        let cluster_offset = l2_entry & L2E_OFFSET_MASK;

        let mut progress = false;
        let res: BlockResult = 'body: {
            if !self.cluster_needs_new_alloc(l2_entry) {
                if l.offset_into_cluster(cluster_offset) > 0 {
                    break 'body Err(BlockError::CorruptImage("misaligned data cluster"));
                }
                // If a specific host offset is required, check it.
                if *host_offset != INV_OFFSET && cluster_offset != *host_offset {
                    *bytes = 0;
                    break 'body Ok(());
                }

                let keep_clusters =
                    self.count_single_write_clusters(st, nb_clusters, slot, l2_index, false);
                debug_assert!(keep_clusters <= nb_clusters);
                let cap = keep_clusters * l.cluster_size - l.offset_into_cluster(guest_offset);
                if *bytes > cap {
                    *bytes = cap;
                }
                debug_assert!(*bytes != 0);

                if let Err(e) =
                    self.calculate_l2_meta(st, cluster_offset, guest_offset, *bytes, slot, m, true)
                {
                    break 'body Err(e);
                }
                progress = true;
            }
            Ok(())
        };
        st.caches.put(CacheKind::L2, slot);
        res?;

        // Only report a host offset when progress was made; anything else
        // would constrain the allocation step with a stale offset.
        if progress {
            *host_offset = cluster_offset + l.offset_into_cluster(guest_offset);
        }
        Ok(progress)
    }

    /// Allocates a fresh cluster run and queues a new-allocation plan.
    fn handle_alloc<'a>(
        &self,
        st: &mut MetaState,
        guest_offset: u64,
        host_offset: &mut u64,
        bytes: &mut u64,
        m: &mut Option<Box<L2Meta<'a>>>,
    ) -> BlockResult<bool> {
        let l = self.layout();
        debug_assert!(*bytes > 0);

        let mut nb_clusters =
            l.size_to_clusters(l.offset_into_cluster(guest_offset) + *bytes);
        nb_clusters = nb_clusters.min(l.l2_slice_size - l.offset_to_l2_slice_index(guest_offset));

        let (slot, l2_index) = self.get_cluster_table(st, guest_offset)?;

        let res: BlockResult<bool> = 'body: {
            nb_clusters =
                self.count_single_write_clusters(st, nb_clusters, slot, l2_index, true);
            debug_assert!(nb_clusters > 0);

            let mut alloc_cluster_offset = if *host_offset == INV_OFFSET {
                INV_OFFSET
            } else {
                l.start_of_cluster(*host_offset)
            };
            if let Err(e) = self.do_alloc_cluster_offset(
                st,
                guest_offset,
                &mut alloc_cluster_offset,
                &mut nb_clusters,
            ) {
                break 'body Err(e);
            }
            if nb_clusters == 0 {
                // Cannot extend the contiguous allocation.
                *bytes = 0;
                break 'body Ok(false);
            }
            debug_assert!(alloc_cluster_offset != INV_OFFSET);

            let requested_bytes = *bytes + l.offset_into_cluster(guest_offset);
            let avail_bytes = nb_clusters << l.cluster_bits;
            let nb_bytes = requested_bytes.min(avail_bytes);

            *host_offset = alloc_cluster_offset + l.offset_into_cluster(guest_offset);
            *bytes = (*bytes).min(nb_bytes - l.offset_into_cluster(guest_offset));
            debug_assert!(*bytes != 0);

            if let Err(e) = self.calculate_l2_meta(
                st,
                alloc_cluster_offset,
                guest_offset,
                *bytes,
                slot,
                m,
                false,
            ) {
                break 'body Err(e);
            }
            Ok(true)
        };
        st.caches.put(CacheKind::L2, slot);
        res
    }

    /// Write planning: turns `[offset, offset + *bytes)` into a host
    /// offset plus a chain of allocation plans, reusing solely-owned
    /// clusters and allocating the rest.
    pub(crate) fn alloc_host_offset<'a>(
        &self,
        st: &mut MetaState,
        offset: u64,
        bytes: &mut u64,
        m: &mut Option<Box<L2Meta<'a>>>,
    ) -> BlockResult<u64> {
        let l = self.layout();
        let mut start = offset;
        let mut remaining = *bytes;
        let mut cluster_offset = INV_OFFSET;
        let mut host_offset = INV_OFFSET;
        let mut cur_bytes = 0u64;

        loop {
            if host_offset == INV_OFFSET && cluster_offset != INV_OFFSET {
                host_offset = cluster_offset;
            }
            debug_assert!(remaining >= cur_bytes);
            start += cur_bytes;
            remaining -= cur_bytes;
            if cluster_offset != INV_OFFSET {
                cluster_offset += cur_bytes;
            }
            if remaining == 0 {
                break;
            }
            cur_bytes = remaining;

            if self.handle_copied(st, start, &mut cluster_offset, &mut cur_bytes, m)? {
                continue;
            }
            if cur_bytes == 0 {
                break;
            }
            if self.handle_alloc(st, start, &mut cluster_offset, &mut cur_bytes, m)? {
                continue;
            }
            debug_assert_eq!(cur_bytes, 0);
            break;
        }

        *bytes -= remaining;
        debug_assert!(*bytes > 0);
        debug_assert!(host_offset != INV_OFFSET);
        debug_assert_eq!(
            l.offset_into_cluster(host_offset),
            l.offset_into_cluster(offset)
        );
        Ok(host_offset)
    }

    fn cow_read(&self, cluster_offset: u64, offset_in_cluster: u64, qiov: &mut IoVecMut<'_>) -> BlockResult {
        if qiov.size() == 0 {
            return Ok(());
        }
        let bytes = qiov.size();
        self.drv_preadv_part(cluster_offset + offset_in_cluster, bytes, qiov, 0, ReqFlags::empty())
    }

    fn cow_write(&self, cluster_offset: u64, offset_in_cluster: u64, qiov: &IoVec<'_>) -> BlockResult {
        if qiov.size() == 0 {
            return Ok(());
        }
        io::pwritev(
            self.payload(),
            cluster_offset + offset_in_cluster,
            qiov.size(),
            qiov,
            ReqFlags::empty(),
        )
    }

    /// Copies the bytes around the written range from the old cluster into
    /// the new one. Runs without the metadata lock; the guest-visible read
    /// below resolves through the not-yet-updated mapping, which is exactly
    /// the pre-write content. Returns whether any I/O happened.
    pub(crate) fn perform_cow(&self, m: &L2Meta<'_>) -> BlockResult<bool> {
        let start = m.cow_start;
        let end = m.cow_end;
        let data_bytes = end.offset - (start.offset + start.nb_bytes);

        debug_assert!(start.offset + start.nb_bytes <= end.offset);
        if (start.nb_bytes == 0 && end.nb_bytes == 0) || m.skip_cow {
            return Ok(false);
        }

        // One merged read when the gap between the regions is small.
        let merge_reads = start.nb_bytes > 0 && end.nb_bytes > 0 && data_bytes <= 16384;
        let buffer_size = if merge_reads {
            start.nb_bytes + data_bytes + end.nb_bytes
        } else {
            align_up(start.nb_bytes, DEFAULT_SECTOR_SIZE) + end.nb_bytes
        };
        let mut buf = vec![0u8; buffer_size as usize];
        let end_start = (buffer_size - end.nb_bytes) as usize;

        if merge_reads {
            let mut q = IoVecMut::from_buf(&mut buf);
            self.cow_read(m.offset, start.offset, &mut q)?;
        } else {
            {
                let mut q = IoVecMut::from_buf(&mut buf[..start.nb_bytes as usize]);
                self.cow_read(m.offset, start.offset, &mut q)?;
            }
            let mut q = IoVecMut::from_buf(&mut buf[end_start..]);
            self.cow_read(m.offset, end.offset, &mut q)?;
        }

        if let Some(data_qiov) = m.data_qiov {
            // Assemble one write: start padding, guest data, end padding.
            let mut q = IoVec::with_capacity(
                2 + data_qiov.subvec_niov(m.data_qiov_offset, data_bytes),
            );
            if start.nb_bytes > 0 {
                q.push(&buf[..start.nb_bytes as usize]);
            }
            q.concat(data_qiov, m.data_qiov_offset, data_bytes);
            if end.nb_bytes > 0 {
                q.push(&buf[end_start..]);
            }
            self.cow_write(m.alloc_offset, start.offset, &q)?;
        } else {
            // No guest data: write the two regions separately.
            if start.nb_bytes > 0 {
                let q = IoVec::from_buf(&buf[..start.nb_bytes as usize]);
                self.cow_write(m.alloc_offset, start.offset, &q)?;
            }
            if end.nb_bytes > 0 {
                let q = IoVec::from_buf(&buf[end_start..]);
                self.cow_write(m.alloc_offset, end.offset, &q)?;
            }
        }
        Ok(true)
    }

    /// Links a completed allocation into the L2 table: entries flip to the
    /// new host offsets with `COPIED`, subcluster bitmaps record the
    /// written range, and replaced clusters are released.
    pub(crate) fn alloc_cluster_link_l2(&self, st: &mut MetaState, m: &L2Meta<'_>) -> BlockResult {
        let l = self.layout();
        debug_assert!(m.nb_clusters > 0);
        let mut old_clusters = Vec::with_capacity(m.nb_clusters as usize);

        // The L2 update depends on the refcounts of the new clusters being
        // durable.
        st.caches
            .set_dependency(&self.file, CacheKind::L2, CacheKind::Refblock)?;

        let (slot, l2_index) = self.get_cluster_table(st, m.offset)?;
        st.caches.mark_dirty(CacheKind::L2, slot);

        debug_assert!(l2_index + m.nb_clusters <= l.l2_slice_size);
        debug_assert!(m.cow_end.offset + m.cow_end.nb_bytes <= m.nb_clusters << l.cluster_bits);

        {
            let slice = st.caches.table_mut(CacheKind::L2, slot);
            for i in 0..m.nb_clusters {
                let offset = m.alloc_offset + (i << l.cluster_bits);
                let old_entry = l.l2_entry(slice, l2_index + i);
                if old_entry != 0 {
                    old_clusters.push(old_entry);
                }
                debug_assert_eq!(offset & L2E_OFFSET_MASK, offset);
                l.set_l2_entry(slice, l2_index + i, offset | OFLAG_COPIED);

                // Record the written subclusters: allocated, not zero.
                if l.extended_l2 {
                    let mut bitmap = l.l2_bitmap(slice, l2_index + i);
                    let written_from = m.cow_start.offset.max(i << l.cluster_bits);
                    let written_to =
                        (m.cow_end.offset + m.cow_end.nb_bytes).min((i + 1) << l.cluster_bits);
                    debug_assert!(written_from < written_to);
                    let first_sc = l.offset_to_sc_index(written_from) as u32;
                    let last_sc = l.offset_to_sc_index(written_to - 1) as u32;
                    bitmap |= sub_alloc_range(first_sc, last_sc + 1);
                    bitmap &= !sub_zero_range(first_sc, last_sc + 1);
                    l.set_l2_bitmap(slice, l2_index + i, bitmap);
                }
            }
        }
        st.caches.put(CacheKind::L2, slot);

        if !m.keep_old_clusters {
            for old_entry in old_clusters {
                self.free_any_cluster(st, old_entry, DiscardType::Never);
            }
        }
        Ok(())
    }

    /// Abort path of a planned allocation: release the freshly allocated
    /// clusters. Payload clusters of an external data file are not
    /// refcounted, so there is nothing to undo there.
    pub(crate) fn alloc_cluster_abort(&self, st: &mut MetaState, m: &L2Meta<'_>) {
        let l = self.layout();
        if !self.has_data_file() && !m.keep_old_clusters {
            self.free_clusters(
                st,
                m.alloc_offset,
                m.nb_clusters << l.cluster_bits,
                DiscardType::Never,
            );
        }
    }

    /// Releases whatever an L2 entry references, by entry type.
    pub(crate) fn free_any_cluster(&self, st: &mut MetaState, l2_entry: u64, dtype: DiscardType) {
        let l = self.layout();
        let ctype = self.get_cluster_type(l2_entry);

        if self.has_data_file() {
            if dtype.passthrough()
                && matches!(ctype, ClusterType::Normal | ClusterType::ZeroAlloc)
            {
                let _ = io::pdiscard(self.payload(), l2_entry & L2E_OFFSET_MASK, l.cluster_size);
            }
            return;
        }

        match ctype {
            ClusterType::Normal | ClusterType::ZeroAlloc => {
                if l.offset_into_cluster(l2_entry & L2E_OFFSET_MASK) > 0 {
                    tracing::error!(l2_entry, "refusing to free a misaligned cluster");
                } else {
                    self.free_clusters(st, l2_entry & L2E_OFFSET_MASK, l.cluster_size, dtype);
                }
            }
            ClusterType::Compressed | ClusterType::ZeroPlain | ClusterType::Unallocated => {}
        }
    }

    /// Marks `[offset, offset + bytes)` as reading zero at subcluster
    /// granularity. The range must be subcluster-aligned, except for a tail
    /// that ends exactly at the virtual size.
    pub(crate) fn subcluster_zeroize(
        &self,
        st: &mut MetaState,
        offset: u64,
        bytes: u64,
        flags: ReqFlags,
    ) -> BlockResult {
        let l = self.layout();
        let mut end_offset = offset + bytes;

        if self.data_file_is_raw() {
            // The guest may read the data file directly, so propagate the
            // zeroes to the payload bytes as well.
            debug_assert!(self.has_data_file());
            io::pwrite_zeroes(self.payload(), offset, bytes, flags)?;
        }

        debug_assert_eq!(l.offset_into_subcluster(offset), 0);
        debug_assert!(
            l.offset_into_subcluster(end_offset) == 0 || end_offset >= self.virtual_size()
        );

        let mut offset = offset;
        let head = end_offset.min(round_up(offset, l.cluster_size)) - offset;
        offset += head;

        let tail = if end_offset >= self.virtual_size() {
            0
        } else {
            end_offset - offset.max(l.start_of_cluster(end_offset))
        };
        end_offset -= tail;

        if head > 0 {
            self.zero_l2_subclusters(st, offset - head, l.size_to_subclusters(head))?;
        }

        // Each L2 slice is handled by its own loop iteration.
        let mut nb_clusters = l.size_to_clusters(end_offset - offset);
        while nb_clusters > 0 {
            let cleared = self.zero_in_l2_slice(st, offset, nb_clusters, flags)?;
            nb_clusters -= cleared;
            offset += cleared * l.cluster_size;
        }

        if tail > 0 {
            self.zero_l2_subclusters(st, end_offset, l.size_to_subclusters(tail))?;
        }
        Ok(())
    }

    /// Zero-marks whole clusters within one L2 slice; with `MAY_UNMAP` the
    /// old clusters are also released.
    fn zero_in_l2_slice(
        &self,
        st: &mut MetaState,
        offset: u64,
        nb_clusters: u64,
        flags: ReqFlags,
    ) -> BlockResult<u64> {
        let l = self.layout();
        let (slot, l2_index) = self.get_cluster_table(st, offset)?;
        let nb_clusters = nb_clusters.min(l.l2_slice_size - l2_index);

        for i in 0..nb_clusters {
            let (old_entry, old_bitmap) = {
                let slice = st.caches.table(CacheKind::L2, slot);
                (l.l2_entry(slice, l2_index + i), l.l2_bitmap(slice, l2_index + i))
            };
            let ctype = self.get_cluster_type(old_entry);
            let unmap = ctype == ClusterType::Compressed
                || (flags.contains(ReqFlags::MAY_UNMAP) && Self::cluster_is_allocated(ctype));

            let mut new_entry = if unmap { 0 } else { old_entry };
            let mut new_bitmap = old_bitmap;
            if l.extended_l2 {
                new_bitmap = L2_BITMAP_ALL_ZEROES;
            } else {
                new_entry |= OFLAG_ZERO;
            }
            if old_entry == new_entry && old_bitmap == new_bitmap {
                continue;
            }

            // First update the L2 entry, then drop the refcount.
            st.caches.mark_dirty(CacheKind::L2, slot);
            {
                let slice = st.caches.table_mut(CacheKind::L2, slot);
                l.set_l2_entry(slice, l2_index + i, new_entry);
                if l.extended_l2 {
                    l.set_l2_bitmap(slice, l2_index + i, new_bitmap);
                }
            }
            if unmap {
                self.free_any_cluster(st, old_entry, DiscardType::Request);
            }
        }

        st.caches.put(CacheKind::L2, slot);
        Ok(nb_clusters)
    }

    /// Zero-marks a subcluster range inside a single cluster: set the zero
    /// bits, clear the alloc bits. Pure bitmap surgery.
    fn zero_l2_subclusters(
        &self,
        st: &mut MetaState,
        offset: u64,
        nb_subclusters: u64,
    ) -> BlockResult {
        let l = self.layout();
        let sc = l.offset_to_sc_index(offset);

        debug_assert!(nb_subclusters > 0 && nb_subclusters < l.subclusters_per_cluster);
        debug_assert!(sc + nb_subclusters <= l.subclusters_per_cluster);
        debug_assert_eq!(l.offset_into_subcluster(offset), 0);

        let (slot, l2_index) = self.get_cluster_table(st, offset)?;
        let res: BlockResult = 'body: {
            let entry = l.l2_entry(st.caches.table(CacheKind::L2, slot), l2_index);
            match self.get_cluster_type(entry) {
                ClusterType::Compressed => break 'body Err(BlockError::NotSupported),
                ClusterType::Normal | ClusterType::Unallocated => {}
                _ => break 'body Err(BlockError::CorruptImage("unexpected cluster type")),
            }

            let old_bitmap = l.l2_bitmap(st.caches.table(CacheKind::L2, slot), l2_index);
            let mut bitmap = old_bitmap;
            bitmap |= sub_zero_range(sc as u32, (sc + nb_subclusters) as u32);
            bitmap &= !sub_alloc_range(sc as u32, (sc + nb_subclusters) as u32);
            if bitmap != old_bitmap {
                let slice = st.caches.table_mut(CacheKind::L2, slot);
                l.set_l2_bitmap(slice, l2_index, bitmap);
                st.caches.mark_dirty(CacheKind::L2, slot);
            }
            Ok(())
        };
        st.caches.put(CacheKind::L2, slot);
        res
    }

    /// Discards whole clusters. With `full`, mappings vanish outright;
    /// otherwise they become zero clusters so backing data cannot resurface.
    pub(crate) fn cluster_discard(
        &self,
        st: &mut MetaState,
        offset: u64,
        bytes: u64,
        dtype: DiscardType,
        full_discard: bool,
    ) -> BlockResult {
        let l = self.layout();
        let end_offset = offset + bytes;

        debug_assert!(is_aligned(offset, l.cluster_size));
        debug_assert!(is_aligned(end_offset, l.cluster_size) || end_offset == self.virtual_size());

        let mut nb_clusters = l.size_to_clusters(bytes);
        st.cache_discards = true;

        // Each L2 slice is handled by its own loop iteration.
        let mut offset = offset;
        let mut res = Ok(());
        while nb_clusters > 0 {
            match self.discard_in_l2_slice(st, offset, nb_clusters, dtype, full_discard) {
                Ok(cleared) => {
                    nb_clusters -= cleared;
                    offset += cleared * l.cluster_size;
                }
                Err(e) => {
                    res = Err(e);
                    break;
                }
            }
        }

        st.cache_discards = false;
        self.process_discards(st, res.is_ok());
        res
    }

    fn discard_in_l2_slice(
        &self,
        st: &mut MetaState,
        offset: u64,
        nb_clusters: u64,
        dtype: DiscardType,
        full_discard: bool,
    ) -> BlockResult<u64> {
        let l = self.layout();
        let (slot, l2_index) = self.get_cluster_table(st, offset)?;
        let nb_clusters = nb_clusters.min(l.l2_slice_size - l2_index);

        for i in 0..nb_clusters {
            let (old_entry, old_bitmap) = {
                let slice = st.caches.table(CacheKind::L2, slot);
                (l.l2_entry(slice, l2_index + i), l.l2_bitmap(slice, l2_index + i))
            };
            let ctype = self.get_cluster_type(old_entry);

            let (new_entry, new_bitmap) = if full_discard {
                (0, 0)
            } else if self.backing_child().is_some() || Self::cluster_is_allocated(ctype) {
                // Keep reads-as-zero so the backing file cannot shine
                // through.
                if l.extended_l2 {
                    (0, L2_BITMAP_ALL_ZEROES)
                } else {
                    (OFLAG_ZERO, old_bitmap)
                }
            } else {
                (old_entry, old_bitmap)
            };

            if old_entry == new_entry && old_bitmap == new_bitmap {
                continue;
            }

            // First remove the L2 mapping, then drop the refcount.
            st.caches.mark_dirty(CacheKind::L2, slot);
            {
                let slice = st.caches.table_mut(CacheKind::L2, slot);
                l.set_l2_entry(slice, l2_index + i, new_entry);
                if l.extended_l2 {
                    l.set_l2_bitmap(slice, l2_index + i, new_bitmap);
                }
            }
            self.free_any_cluster(st, old_entry, dtype);
        }

        st.caches.put(CacheKind::L2, slot);
        Ok(nb_clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::OpenFlags;
    use crate::opts::{CreateOpts, OpenOpts};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn image(dir: &TempDir, subcluster: bool) -> Arc<Qcow2> {
        let path = dir.path().join("cl.qcow2");
        let path = path.to_str().unwrap();
        let opts = CreateOpts {
            size: 1 << 20,
            enable_subcluster: subcluster,
            ..Default::default()
        };
        Qcow2::create(path, &opts).unwrap();
        Qcow2::open(path, &OpenOpts::default(), OpenFlags::RDWR).unwrap()
    }

    #[test]
    fn test_subcluster_classification_extended() {
        let dir = TempDir::new().unwrap();
        let img = image(&dir, true);

        // Fully unallocated entry.
        assert_eq!(
            img.get_subcluster_type(0, 0, 0),
            SubclusterType::UnallocatedPlain
        );
        // Zero-marked subcluster of an unallocated cluster.
        assert_eq!(
            img.get_subcluster_type(0, sub_zero(3), 3),
            SubclusterType::ZeroPlain
        );
        // Alloc bits on an unallocated cluster are inconsistent.
        assert_eq!(
            img.get_subcluster_type(0, sub_alloc(3), 3),
            SubclusterType::Invalid
        );

        let entry = 0x50000 | OFLAG_COPIED;
        assert_eq!(
            img.get_subcluster_type(entry, sub_alloc(0), 0),
            SubclusterType::Normal
        );
        assert_eq!(
            img.get_subcluster_type(entry, sub_alloc(0), 1),
            SubclusterType::UnallocatedAlloc
        );
        assert_eq!(
            img.get_subcluster_type(entry, sub_zero(2), 2),
            SubclusterType::ZeroAlloc
        );
        // A subcluster both allocated and zero violates the format.
        assert_eq!(
            img.get_subcluster_type(entry, sub_alloc(5) | sub_zero(5), 5),
            SubclusterType::Invalid
        );
        assert_eq!(
            img.get_subcluster_type(OFLAG_COMPRESSED, 0, 0),
            SubclusterType::Compressed
        );

        img.drv_close();
    }

    #[test]
    fn test_subcluster_classification_plain() {
        let dir = TempDir::new().unwrap();
        let img = image(&dir, false);

        assert_eq!(
            img.get_subcluster_type(0, 0, 0),
            SubclusterType::UnallocatedPlain
        );
        assert_eq!(
            img.get_subcluster_type(OFLAG_ZERO, 0, 0),
            SubclusterType::ZeroPlain
        );
        assert_eq!(
            img.get_subcluster_type(OFLAG_ZERO | 0x50000, 0, 0),
            SubclusterType::ZeroAlloc
        );
        assert_eq!(
            img.get_subcluster_type(0x50000 | OFLAG_COPIED, 0, 0),
            SubclusterType::Normal
        );

        img.drv_close();
    }

    #[test]
    fn test_subcluster_range_counts() {
        let dir = TempDir::new().unwrap();
        let img = image(&dir, true);
        let entry = 0x50000 | OFLAG_COPIED;

        // Subclusters 0..4 carry data.
        let bitmap = sub_alloc_range(0, 4);
        let (count, sctype) = img.get_subcluster_range_type(entry, bitmap, 0).unwrap();
        assert_eq!(sctype, SubclusterType::Normal);
        assert_eq!(count, 4);

        // From subcluster 4 the rest of the cluster is unallocated.
        let (count, sctype) = img.get_subcluster_range_type(entry, bitmap, 4).unwrap();
        assert_eq!(sctype, SubclusterType::UnallocatedAlloc);
        assert_eq!(count, 28);

        // Zero run bounded by an allocated subcluster.
        let bitmap = sub_zero_range(0, 8) | sub_alloc(8);
        let (count, sctype) = img.get_subcluster_range_type(entry, bitmap, 0).unwrap();
        assert_eq!(sctype, SubclusterType::ZeroAlloc);
        assert_eq!(count, 8);

        img.drv_close();
    }

    #[test]
    fn test_write_plan_narrows_cow_to_subclusters() {
        let dir = TempDir::new().unwrap();
        let img = image(&dir, true);
        let mut st = img.lock();

        let mut bytes = 14u64;
        let mut plan: Option<Box<L2Meta<'_>>> = None;
        let host = img
            .alloc_host_offset(&mut st, 123, &mut bytes, &mut plan)
            .unwrap();
        assert_eq!(bytes, 14);
        assert_eq!(host % img.layout().cluster_size, 123);

        let m = plan.as_deref().unwrap();
        assert_eq!(m.nb_clusters, 1);
        assert!(!m.keep_old_clusters);
        // Leading region: cluster start up to the write.
        assert_eq!(m.cow_start.offset, 0);
        assert_eq!(m.cow_start.nb_bytes, 123);
        // Trailing region: write end to the subcluster boundary only.
        assert_eq!(m.cow_end.offset, 137);
        assert_eq!(m.cow_end.nb_bytes, 2048 - 137);

        while let Some(m) = plan.take() {
            img.alloc_cluster_abort(&mut st, &m);
            plan = m.next;
        }
        drop(st);
        img.drv_close();
    }

    #[test]
    fn test_write_plan_full_cluster_cow_without_subclusters() {
        let dir = TempDir::new().unwrap();
        let img = image(&dir, false);
        let mut st = img.lock();

        let mut bytes = 14u64;
        let mut plan: Option<Box<L2Meta<'_>>> = None;
        img.alloc_host_offset(&mut st, 123, &mut bytes, &mut plan)
            .unwrap();

        let m = plan.as_deref().unwrap();
        assert_eq!(m.cow_start.nb_bytes, 123);
        assert_eq!(m.cow_end.offset, 137);
        assert_eq!(m.cow_end.nb_bytes, 65536 - 137);

        while let Some(m) = plan.take() {
            img.alloc_cluster_abort(&mut st, &m);
            plan = m.next;
        }
        drop(st);
        img.drv_close();
    }
}
