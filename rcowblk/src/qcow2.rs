// SPDX-License-Identifier: MIT

//! The qcow2 format driver: create/open/close, the read/write entry points
//! with their task decomposition, zero writes, discard, block status and
//! the write-plan lifecycle around `L2Meta`.

use std::sync::{Arc, Mutex, MutexGuard};

use rcowio::bits::{is_aligned, round_up};
use rcowio::be::load_u64_be;
use rcowio::{IOV_MAX, IoVec, IoVecMut};
use zerocopy::byteorder::{U32, U64};
use zerocopy::{FromBytes, IntoBytes};

use crate::cache::{CacheKind, Caches};
use crate::cluster::{L2Meta, SubclusterType};
use crate::consts::*;
use crate::error::{BlockError, BlockResult};
use crate::flags::{AutoclearFeatures, IncompatFeatures, OpenFlags, Perm, ReqFlags, Status};
use crate::header::{HEADER_EXT_SIZE, HEADER_SIZE, Header, HeaderExtension};
use crate::io;
use crate::layout::Layout;
use crate::node::{BdsCommon, BlockNode, Child, DriverStatus};
use crate::opts::{CreateOpts, OpenOpts};
use crate::raw::Raw;
use crate::refcount::DiscardRegion;
use crate::task::{TaskQueue, relock, worker_loop};

/// Why clusters are being freed; only some reasons pass a discard down to
/// the host file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardType {
    Never,
    Always,
    Request,
    Snapshot,
    Other,
}

impl DiscardType {
    pub fn passthrough(self) -> bool {
        matches!(self, DiscardType::Always | DiscardType::Request)
    }
}

/// Mutable per-image metadata, guarded by the one image lock.
pub(crate) struct MetaState {
    pub l1_table: Vec<u64>,
    pub l1_table_offset: u64,
    pub refcount_table: Vec<u64>,
    pub refcount_table_offset: u64,
    pub max_refcount_table_index: u32,
    /// Scan hint: no free cluster exists below this index.
    pub free_cluster_index: u64,
    pub caches: Caches,
    pub discards: Vec<DiscardRegion>,
    pub cache_discards: bool,
    /// Cluster runs with a pending allocation plan, as
    /// `(guest_offset, nb_clusters)`.
    pub in_flight_allocs: Vec<(u64, u64)>,
}

/// An opened qcow2 image.
pub struct Qcow2 {
    pub(crate) common: BdsCommon,
    /// The metadata file (raw).
    pub(crate) file: Child,
    backing: Option<Child>,
    /// External payload file; `None` keeps payload in `file`.
    data_file: Option<Child>,
    version: u32,
    layout: Layout,
    incompatible: IncompatFeatures,
    autoclear: AutoclearFeatures,
    virtual_size: u64,
    state: Mutex<MetaState>,
}

impl Qcow2 {
    #[inline]
    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub(crate) fn version(&self) -> u32 {
        self.version
    }

    #[inline]
    pub(crate) fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    #[inline]
    pub(crate) fn has_data_file(&self) -> bool {
        self.data_file.is_some()
    }

    #[inline]
    pub(crate) fn data_file_is_raw(&self) -> bool {
        self.has_data_file() && self.autoclear.contains(AutoclearFeatures::DATA_FILE_RAW)
    }

    /// The child payload bytes live in: the data file if there is one, the
    /// image file otherwise.
    #[inline]
    pub(crate) fn payload(&self) -> &Child {
        self.data_file.as_ref().unwrap_or(&self.file)
    }

    #[inline]
    pub(crate) fn backing_child(&self) -> Option<&Child> {
        self.backing.as_ref()
    }

    #[inline]
    pub(crate) fn incompat(&self) -> IncompatFeatures {
        self.incompatible
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MetaState> {
        relock(&self.state)
    }

    fn build(
        filename: &str,
        file: Child,
        backing: Option<Child>,
        data_file: Option<Child>,
        header: &Header,
        open_flags: OpenFlags,
        l2_cache_tables: usize,
        refblock_cache_tables: usize,
    ) -> Arc<Qcow2> {
        let version = header.version.get();
        let refcount_order = if version >= VERSION_3 {
            header.refcount_order.get()
        } else {
            REFCOUNT_ORDER
        };
        let layout = Layout::new(header.cluster_bits.get(), refcount_order, header.has_extended_l2());

        let total_sectors = header.size.get() / SECTOR_SIZE;
        let mut common = BdsCommon::new(filename.to_string(), open_flags);
        common.pdiscard_alignment = layout.cluster_size as u32;
        common.total_sectors = total_sectors;
        // Zero writes are native (L2 zero flag / subcluster bitmap), and
        // they can unmap.
        common.supported_zero_flags = ReqFlags::MAY_UNMAP;

        let reftable_entries =
            (header.refcount_table_clusters.get() as u64) << (layout.cluster_bits - 3);
        let (incompatible, autoclear) = if version >= VERSION_3 {
            (
                IncompatFeatures::from_bits_retain(header.incompatible_features.get()),
                AutoclearFeatures::from_bits_retain(header.autoclear_features.get()),
            )
        } else {
            (IncompatFeatures::empty(), AutoclearFeatures::empty())
        };

        let state = MetaState {
            l1_table: vec![0; header.l1_size.get() as usize],
            l1_table_offset: header.l1_table_offset.get(),
            refcount_table: vec![0; reftable_entries as usize],
            refcount_table_offset: header.refcount_table_offset.get(),
            max_refcount_table_index: 0,
            free_cluster_index: 0,
            caches: Caches::new(
                l2_cache_tables,
                refblock_cache_tables,
                layout.cluster_size as usize,
            ),
            discards: Vec::new(),
            cache_discards: false,
            in_flight_allocs: Vec::new(),
        };

        Arc::new(Qcow2 {
            common,
            file,
            backing,
            data_file,
            version,
            layout,
            incompatible,
            autoclear,
            virtual_size: total_sectors * SECTOR_SIZE,
            state: Mutex::new(state),
        })
    }

    /// Creates a fresh image: header, one-block refcount table, empty L1,
    /// and the first four clusters accounted for.
    pub fn create(filename: &str, opts: &CreateOpts) -> BlockResult {
        if filename.is_empty() || opts.size == 0 {
            return Err(BlockError::IncompleteParameters);
        }

        let file_node = Raw::open(filename, OpenFlags::CREATE | OpenFlags::RDWR)?;
        let file = Child::new(file_node, Perm::ALL);

        let size = round_up(opts.size, DEFAULT_SECTOR_SIZE);

        // One L2 table maps 512 MiB; the L1 table needs one entry per such
        // span (twice as many with extended entries).
        let size2 = round_up(size, DEFAULT_CLUSTER_SIZE);
        let shift = DEFAULT_CLUSTER_BITS + DEFAULT_CLUSTER_BITS - 3;
        let mut l1_size = (round_up(size2, 1 << shift) >> shift) as u32;

        let mut header = Header::new(size, l1_size);
        let mut incompatible = IncompatFeatures::empty();
        let mut autoclear = AutoclearFeatures::empty();
        if opts.enable_subcluster {
            incompatible |= IncompatFeatures::EXTL2;
            l1_size *= 2;
            header.l1_size = U32::new(l1_size);
        }
        if opts.data_file.is_some() {
            incompatible |= IncompatFeatures::DATA_FILE;
            autoclear |= AutoclearFeatures::DATA_FILE_RAW;
        }
        header.incompatible_features = U64::new(incompatible.bits());
        header.autoclear_features = U64::new(autoclear.bits());

        let backing_path = match &opts.backing {
            Some(path) => {
                let abs = std::fs::canonicalize(path)?;
                let abs = abs.to_string_lossy().into_owned();
                header.backing_file_offset = U64::new(BACKING_PATH_OFFSET);
                header.backing_file_size = U32::new(abs.len() as u32);
                Some(abs)
            }
            None => None,
        };

        io::pwrite(&file, 0, header.as_bytes())?;

        let data_file = match &opts.data_file {
            Some(path) => {
                Self::write_data_file_extension(&file, HEADER_SIZE, path)?;
                let node = Raw::open(path, OpenFlags::CREATE | OpenFlags::RDWR)?;
                Some(Child::new(node, Perm::ALL))
            }
            None => None,
        };

        if let Some(path) = &backing_path {
            io::pwrite(&file, BACKING_PATH_OFFSET, path.as_bytes())?;
        }

        // Minimal caches are enough for writing the initial metadata.
        let node = Self::build(
            filename,
            file,
            None,
            data_file,
            &header,
            OpenFlags::CREATE | OpenFlags::RDWR,
            1,
            1,
        );

        // Refcount table with a single block, pointing at cluster 2.
        let reftable_entries = (DEFAULT_CLUSTER_SIZE / REFTABLE_ENTRY_SIZE) as usize;
        let mut reftable = vec![0u8; DEFAULT_CLUSTER_SIZE as usize];
        rcowio::be::store_u64_be(&mut reftable, 0, 2 * DEFAULT_CLUSTER_SIZE);
        io::pwrite(&node.file, REFCOUNT_TABLE_OFFSET, &reftable)?;
        io::flush(node.file.node())?;

        // Empty L1 table.
        io::pwrite(
            &node.file,
            L1_TABLE_OFFSET,
            &vec![0u8; l1_size as usize * L1E_SIZE as usize],
        )?;
        io::flush(node.file.node())?;

        {
            let mut st = node.lock();
            debug_assert_eq!(st.refcount_table.len(), reftable_entries);
            st.refcount_table[0] = 2 * DEFAULT_CLUSTER_SIZE;
            Self::update_max_refcount_table_index(&mut st);

            // Account for the four metadata clusters laid out above.
            node.alloc_clusters(&mut st, 4 * DEFAULT_CLUSTER_SIZE)?;
        }

        tracing::debug!(filename, size, subcluster = opts.enable_subcluster, "created image");
        node.drv_close();
        Ok(())
    }

    /// Opens an existing image, its backing chain and its data file.
    pub fn open(filename: &str, opts: &OpenOpts, flags: OpenFlags) -> BlockResult<Arc<Qcow2>> {
        if filename.is_empty() {
            return Err(BlockError::IncompleteParameters);
        }

        let file_node = Raw::open(filename, flags)?;
        let file = Child::new(file_node, Perm::ALL);

        let mut header_buf = vec![0u8; HEADER_SIZE as usize];
        io::pread(&file, 0, &mut header_buf)?;
        let header = Header::read_from_bytes(&header_buf)
            .map_err(|_| BlockError::CorruptImage("short header"))?;
        header.check()?;

        // Backing chain, opened read-only and recursively.
        let mut backing = None;
        if header.backing_file_offset.get() > 0 && header.backing_file_size.get() > 0 {
            let mut path = vec![0u8; header.backing_file_size.get() as usize];
            io::pread(&file, header.backing_file_offset.get(), &mut path)?;
            let path = String::from_utf8(path)
                .map_err(|_| BlockError::CorruptImage("backing path is not valid UTF-8"))?;
            let node = Qcow2::open(&path, opts, flags)?;
            backing = Some(Child::new(node, Perm::READABLE));
        }

        // External data file.
        let mut data_file = None;
        if header.has_external_data_file() {
            let path = Self::read_data_file_extension(&file)?;
            if path.is_empty() {
                return Err(BlockError::IncompleteParameters);
            }
            let node = Raw::open(&path, flags)?;
            data_file = Some(Child::new(node, Perm::ALL));
        }

        // Cache sizing: an explicit byte budget, or enough for every L2
        // table; the refcount cache needs no more than half of that.
        let l1_size = header.l1_size.get() as usize;
        let l2_cache_tables = match opts.l2_cache_size {
            Some(bytes) if bytes > 0 => {
                (round_up(bytes, DEFAULT_CLUSTER_SIZE) / DEFAULT_CLUSTER_SIZE) as usize
            }
            _ => l1_size,
        }
        .max(1);
        let refblock_cache_tables = (l2_cache_tables / 2).max(1);

        let node = Self::build(
            filename,
            file,
            backing,
            data_file,
            &header,
            flags,
            l2_cache_tables,
            refblock_cache_tables,
        );

        {
            let mut st = node.lock();
            node.refcount_init(&mut st)?;

            if l1_size > 0 {
                let mut raw = vec![0u8; l1_size * L1E_SIZE as usize];
                io::pread(&node.file, st.l1_table_offset, &mut raw)?;
                for i in 0..l1_size {
                    st.l1_table[i] = load_u64_be(&raw, i);
                }
            }
        }

        tracing::debug!(
            filename,
            virtual_size = node.virtual_size,
            extended_l2 = node.layout.extended_l2,
            "opened image"
        );
        Ok(node)
    }

    fn write_data_file_extension(file: &Child, offset: u64, path: &str) -> BlockResult {
        let ext = HeaderExtension {
            magic: U32::new(EXT_MAGIC_DATA_FILE),
            length: U32::new(path.len() as u32),
        };
        io::pwrite(file, offset, ext.as_bytes())?;
        io::pwrite(file, offset + HEADER_EXT_SIZE, path.as_bytes())?;
        Ok(())
    }

    fn read_data_file_extension(file: &Child) -> BlockResult<String> {
        let mut buf = [0u8; HEADER_EXT_SIZE as usize];
        io::pread(file, HEADER_SIZE, &mut buf)?;
        let ext = HeaderExtension::read_from_bytes(&buf)
            .map_err(|_| BlockError::CorruptImage("short header extension"))?;
        if ext.magic.get() != EXT_MAGIC_DATA_FILE || ext.length.get() == 0 {
            return Ok(String::new());
        }
        let mut path = vec![0u8; ext.length.get() as usize];
        io::pread(file, HEADER_SIZE + HEADER_EXT_SIZE, &mut path)?;
        String::from_utf8(path)
            .map_err(|_| BlockError::CorruptImage("data-file path is not valid UTF-8"))
    }

    // === L2Meta lifecycle ===

    fn remove_in_flight(st: &mut MetaState, m: &L2Meta<'_>) {
        if let Some(pos) = st
            .in_flight_allocs
            .iter()
            .position(|&(offset, n)| offset == m.offset && n == m.nb_clusters)
        {
            st.in_flight_allocs.swap_remove(pos);
        }
    }

    /// Consumes a plan chain. With `link_l2`, each plan runs its COW and
    /// lands in the L2 table; without, freshly allocated clusters are
    /// released. On error the failing plan (and the rest of the chain)
    /// stays in `chain` for the caller's abort pass.
    pub(crate) fn handle_l2meta(
        &self,
        chain: &mut Option<Box<L2Meta<'_>>>,
        link_l2: bool,
    ) -> BlockResult {
        while let Some(mut m) = chain.take() {
            let next = m.next.take();
            if link_l2 {
                match self.perform_cow(&m) {
                    Ok(did_cow) => {
                        let mut st = self.lock();
                        if did_cow {
                            // The copied bytes must hit the disk before the
                            // L2 entry that exposes them.
                            st.caches.depends_on_flush(CacheKind::L2);
                        }
                        if let Err(e) = self.alloc_cluster_link_l2(&mut st, &m) {
                            drop(st);
                            m.next = next;
                            *chain = Some(m);
                            return Err(e);
                        }
                        Self::remove_in_flight(&mut st, &m);
                    }
                    Err(e) => {
                        m.next = next;
                        *chain = Some(m);
                        return Err(e);
                    }
                }
            } else {
                let mut st = self.lock();
                self.alloc_cluster_abort(&mut st, &m);
                Self::remove_in_flight(&mut st, &m);
            }
            *chain = next;
        }
        Ok(())
    }

    /// Optimistically zero-fills fresh clusters whose COW regions read as
    /// zero, saving the read-back/write pair. Only worth it when the
    /// payload child has a no-fallback zero fast path.
    fn handle_alloc_space(&self, chain: &mut Option<Box<L2Meta<'_>>>) -> BlockResult {
        if !self
            .payload()
            .node()
            .common()
            .supported_zero_flags
            .contains(ReqFlags::NO_FALLBACK)
        {
            return Ok(());
        }

        let mut m = chain.as_deref_mut();
        while let Some(meta) = m {
            'this: {
                if meta.cow_start.nb_bytes == 0 && meta.cow_end.nb_bytes == 0 {
                    break 'this;
                }
                if !self.is_zero_cow(meta)? {
                    break 'this;
                }
                let start_offset = meta.alloc_offset + meta.cow_start.offset;
                let nb_bytes = meta.cow_end.offset + meta.cow_end.nb_bytes - meta.cow_start.offset;
                match io::pwrite_zeroes(
                    self.payload(),
                    start_offset,
                    nb_bytes,
                    ReqFlags::NO_FALLBACK,
                ) {
                    Ok(()) => meta.skip_cow = true,
                    Err(e) if e.is_not_supported() || e.is_again() => {}
                    Err(e) => return Err(e),
                }
            }
            m = meta.next.as_deref_mut();
        }
        Ok(())
    }

    fn is_zero_cow(&self, m: &L2Meta<'_>) -> BlockResult<bool> {
        if !io::is_zero_fast(self, m.offset + m.cow_start.offset, m.cow_start.nb_bytes)? {
            return Ok(false);
        }
        io::is_zero_fast(self, m.offset + m.cow_end.offset, m.cow_end.nb_bytes)
    }

    /// When the guest data sits exactly between the two COW regions of a
    /// plan, hand the data vector to the plan so COW and payload go out as
    /// one write.
    fn merge_cow<'a>(
        offset: u64,
        bytes: u64,
        qiov: &'a IoVec<'a>,
        qiov_offset: u64,
        chain: &mut Option<Box<L2Meta<'a>>>,
    ) -> bool {
        let mut m = chain.as_deref_mut();
        while let Some(meta) = m {
            'this: {
                // Nothing to merge without COW regions, and nothing to do
                // when they are already handled.
                if meta.cow_start.nb_bytes == 0 && meta.cow_end.nb_bytes == 0 {
                    break 'this;
                }
                if meta.skip_cow {
                    break 'this;
                }
                // The request must start right after the first region and
                // end right at the second.
                if meta.cow_start_end() != offset {
                    break 'this;
                }
                if meta.offset + meta.cow_end.offset != offset + bytes {
                    break 'this;
                }
                // Both regions plus the data must fit one vector.
                if qiov.subvec_niov(qiov_offset, bytes) > IOV_MAX - 2 {
                    break 'this;
                }

                meta.data_qiov = Some(qiov);
                meta.data_qiov_offset = qiov_offset;
                return true;
            }
            m = meta.next.as_deref_mut();
        }
        false
    }

    fn pwritev_task<'a>(
        &self,
        host_offset: u64,
        offset: u64,
        bytes: u64,
        qiov: &'a IoVec<'a>,
        qiov_offset: u64,
        mut l2meta: Option<Box<L2Meta<'a>>>,
    ) -> BlockResult {
        let res = (|| -> BlockResult {
            self.handle_alloc_space(&mut l2meta)?;

            if !Self::merge_cow(offset, bytes, qiov, qiov_offset, &mut l2meta) {
                io::pwritev_part(
                    self.payload(),
                    host_offset,
                    bytes,
                    qiov,
                    qiov_offset,
                    ReqFlags::empty(),
                )?;
            }
            self.handle_l2meta(&mut l2meta, true)
        })();

        if l2meta.is_some() {
            let _ = self.handle_l2meta(&mut l2meta, false);
        }
        res
    }

    fn preadv_task(
        &self,
        sctype: SubclusterType,
        host_offset: u64,
        offset: u64,
        bytes: u64,
        dst: &Mutex<&mut IoVecMut<'_>>,
        qiov_offset: u64,
    ) -> BlockResult {
        match sctype {
            SubclusterType::UnallocatedPlain | SubclusterType::UnallocatedAlloc => {
                let Some(backing) = self.backing.as_ref() else {
                    return Err(BlockError::InvalidArgument);
                };
                let mut guard = relock(dst);
                let mut sub = guard.slice_mut(qiov_offset, bytes);
                io::preadv_part(backing, offset, bytes, &mut sub, 0, ReqFlags::empty())
            }
            SubclusterType::Compressed => Err(BlockError::NotSupported),
            SubclusterType::Normal => {
                let mut guard = relock(dst);
                let mut sub = guard.slice_mut(qiov_offset, bytes);
                io::preadv_part(self.payload(), host_offset, bytes, &mut sub, 0, ReqFlags::empty())
            }
            _ => Err(BlockError::InvalidArgument),
        }
    }

    /// Whether `[offset, offset + bytes)` currently reads as zero; errors
    /// count as "not zero".
    fn is_zero(&self, offset: u64, bytes: u64) -> bool {
        // Clamp to the image length before probing the mapping.
        let mut bytes = bytes.min(self.virtual_size.saturating_sub(offset));
        let mut offset = offset;
        while bytes > 0 {
            match io::block_status_above(self, None, offset, bytes) {
                Ok(ds) if ds.status.contains(Status::ZERO) && ds.pnum > 0 => {
                    offset += ds.pnum;
                    bytes -= ds.pnum;
                }
                _ => return false,
            }
        }
        true
    }
}

impl BlockNode for Qcow2 {
    fn common(&self) -> &BdsCommon {
        &self.common
    }

    fn format_name(&self) -> &'static str {
        "qcow2"
    }

    fn supports_backing(&self) -> bool {
        true
    }

    fn backing(&self) -> Option<&Child> {
        self.backing.as_ref()
    }

    fn drv_preadv_part(
        &self,
        offset: u64,
        bytes: u64,
        qiov: &mut IoVecMut<'_>,
        qiov_offset: u64,
        _flags: ReqFlags,
    ) -> BlockResult {
        let dst = Mutex::new(qiov);
        let queue = TaskQueue::new();
        let mut result = Ok(());

        std::thread::scope(|scope| {
            let mut worker_started = false;
            let mut first = true;
            let mut offset = offset;
            let mut bytes = bytes;
            let mut qiov_offset = qiov_offset;

            let res = loop {
                if bytes == 0 {
                    break Ok(());
                }
                let (host_offset, cur_bytes, sctype) = {
                    let mut st = self.lock();
                    match self.get_host_offset(&mut st, offset, bytes) {
                        Ok(v) => v,
                        Err(e) => break Err(e),
                    }
                };

                let reads_zero = matches!(
                    sctype,
                    SubclusterType::ZeroPlain | SubclusterType::ZeroAlloc
                ) || (matches!(
                    sctype,
                    SubclusterType::UnallocatedPlain | SubclusterType::UnallocatedAlloc
                ) && self.backing.is_none());

                if reads_zero {
                    relock(&dst).memset(qiov_offset, 0, cur_bytes);
                } else {
                    let dst = &dst;
                    let task_offset = offset;
                    let task_qiov_offset = qiov_offset;
                    let task = move || {
                        self.preadv_task(
                            sctype,
                            host_offset,
                            task_offset,
                            cur_bytes,
                            dst,
                            task_qiov_offset,
                        )
                    };
                    let r = if first {
                        task()
                    } else {
                        if !worker_started {
                            scope.spawn(|| worker_loop(&queue));
                            worker_started = true;
                        }
                        queue.submit_and_wait(Box::new(task))
                    };
                    if let Err(e) = r {
                        break Err(e);
                    }
                }

                first = false;
                bytes -= cur_bytes;
                offset += cur_bytes;
                qiov_offset += cur_bytes;
            };

            queue.shutdown();
            result = res;
        });
        result
    }

    fn drv_pwritev_part(
        &self,
        offset: u64,
        bytes: u64,
        qiov: &IoVec<'_>,
        qiov_offset: u64,
        _flags: ReqFlags,
    ) -> BlockResult {
        let queue = TaskQueue::new();
        let mut result = Ok(());

        std::thread::scope(|scope| {
            let mut worker_started = false;
            let mut first = true;
            let mut offset = offset;
            let mut bytes = bytes;
            let mut qiov_offset = qiov_offset;

            let res = loop {
                if bytes == 0 {
                    break Ok(());
                }
                let mut cur_bytes = bytes;
                let mut l2meta: Option<Box<L2Meta<'_>>> = None;

                // Plan the step under the lock; the payload write itself
                // runs without it so writes can overlap in the file.
                let host_offset = {
                    let mut st = self.lock();
                    match self.alloc_host_offset(&mut st, offset, &mut cur_bytes, &mut l2meta) {
                        Ok(h) => h,
                        Err(e) => {
                            drop(st);
                            let _ = self.handle_l2meta(&mut l2meta, false);
                            break Err(e);
                        }
                    }
                };

                let task_offset = offset;
                let task_qiov_offset = qiov_offset;
                let task = move || {
                    self.pwritev_task(
                        host_offset,
                        task_offset,
                        cur_bytes,
                        qiov,
                        task_qiov_offset,
                        l2meta,
                    )
                };
                let r = if first {
                    task()
                } else {
                    if !worker_started {
                        scope.spawn(|| worker_loop(&queue));
                        worker_started = true;
                    }
                    queue.submit_and_wait(Box::new(task))
                };
                if let Err(e) = r {
                    break Err(e);
                }

                first = false;
                bytes -= cur_bytes;
                offset += cur_bytes;
                qiov_offset += cur_bytes;
            };

            queue.shutdown();
            result = res;
        });
        result
    }

    /// Marks a range as reading zero without touching payload bytes. The
    /// subcluster-misaligned edges must already read as zero; otherwise the
    /// caller falls back to explicit zero writes.
    fn drv_pwrite_zeroes(&self, offset: u64, bytes: u64, flags: ReqFlags) -> BlockResult {
        let l = self.layout;
        let head = l.offset_into_subcluster(offset);
        let mut tail = round_up(offset + bytes, l.subcluster_size) - (offset + bytes);
        if offset + bytes == self.virtual_size {
            tail = 0;
        }

        if head > 0 || tail > 0 {
            if !(self.is_zero(offset - head, head) && self.is_zero(offset + bytes, tail)) {
                return Err(BlockError::NotSupported);
            }

            let offset = offset - head;
            let bytes = bytes + head + tail;

            let mut st = self.lock();
            // A write may have raced in since the check above.
            let (_, _, sctype) = self.get_host_offset(&mut st, offset, l.subcluster_size)?;
            if !matches!(
                sctype,
                SubclusterType::UnallocatedPlain
                    | SubclusterType::UnallocatedAlloc
                    | SubclusterType::ZeroPlain
                    | SubclusterType::ZeroAlloc
            ) {
                return Err(BlockError::NotSupported);
            }
            return self.subcluster_zeroize(&mut st, offset, bytes, flags);
        }

        let mut st = self.lock();
        self.subcluster_zeroize(&mut st, offset, bytes, flags)
    }

    fn drv_block_status(
        &self,
        _want_zero: bool,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<DriverStatus> {
        let (host_offset, pnum, sctype) = {
            let mut st = self.lock();
            self.get_host_offset(&mut st, offset, bytes)?
        };

        let mut status = Status::empty();
        let mut map = 0;
        let mut file = None;
        if matches!(
            sctype,
            SubclusterType::Normal | SubclusterType::ZeroAlloc | SubclusterType::UnallocatedAlloc
        ) {
            map = host_offset;
            file = Some(self.payload().node_arc());
            status |= Status::OFFSET_VALID;
        }
        if matches!(
            sctype,
            SubclusterType::ZeroPlain | SubclusterType::ZeroAlloc
        ) {
            status |= Status::ZERO;
        } else if !matches!(
            sctype,
            SubclusterType::UnallocatedPlain | SubclusterType::UnallocatedAlloc
        ) {
            status |= Status::DATA;
        }
        Ok(DriverStatus {
            status,
            pnum,
            map,
            file,
        })
    }

    fn drv_pdiscard(&self, offset: u64, bytes: u64) -> BlockResult {
        let l = self.layout;
        if !is_aligned(offset | bytes, l.cluster_size) {
            debug_assert!(bytes < l.cluster_size);
            if !is_aligned(offset, l.cluster_size) || offset + bytes != self.virtual_size {
                return Err(BlockError::NotSupported);
            }
        }
        let mut st = self.lock();
        self.cluster_discard(&mut st, offset, bytes, DiscardType::Request, false)
    }

    fn drv_flush_to_os(&self) -> BlockResult {
        let mut st = self.lock();
        self.flush_caches(&mut st)
    }

    fn drv_getlength(&self) -> BlockResult<u64> {
        Ok(self.virtual_size)
    }

    fn drv_close(&self) {
        {
            let mut st = self.lock();
            if let Err(e) = self.flush_caches(&mut st) {
                tracing::error!(error = %e, "flushing caches on close failed");
            }
        }
        for child in [Some(&self.file), self.backing.as_ref(), self.data_file.as_ref()]
            .into_iter()
            .flatten()
        {
            let _ = io::flush(child.node());
            child.node().drv_close();
        }
        tracing::debug!(filename = %self.common.filename, "closed image");
    }

    fn drv_info(&self, detail: bool, pretty: bool) -> BlockResult<String> {
        crate::info::image_info(self, detail, pretty)
    }
}
