// SPDX-License-Identifier: MIT

//! The driver capability surface and child handles the generic block layer
//! is polymorphic over.

use std::sync::Arc;

use rcowio::{IoVec, IoVecMut};

use crate::error::{BlockError, BlockResult};
use crate::flags::{OpenFlags, Perm, ReqFlags, Status};

/// Static per-node configuration shared by every driver.
#[derive(Debug, Clone)]
pub struct BdsCommon {
    pub filename: String,
    pub request_alignment: u32,
    pub pdiscard_alignment: u32,
    pub max_transfer: u32,
    pub open_flags: OpenFlags,
    pub supported_write_flags: ReqFlags,
    pub supported_zero_flags: ReqFlags,
    /// Virtual size in 512-byte sectors; 0 when only the driver knows the
    /// length (raw files).
    pub total_sectors: u64,
}

impl BdsCommon {
    pub fn new(filename: String, open_flags: OpenFlags) -> Self {
        Self {
            filename,
            request_alignment: crate::consts::REQUEST_ALIGNMENT,
            pdiscard_alignment: 0,
            max_transfer: crate::consts::MAX_TRANSFER,
            open_flags,
            supported_write_flags: ReqFlags::empty(),
            supported_zero_flags: ReqFlags::empty(),
            total_sectors: 0,
        }
    }
}

/// One driver's answer to a block-status query.
pub struct DriverStatus {
    pub status: Status,
    /// Bytes for which the answer holds, from the queried offset.
    pub pnum: u64,
    /// Raw mapping, valid with [`Status::OFFSET_VALID`].
    pub map: u64,
    /// Node the mapping refers to.
    pub file: Option<Arc<dyn BlockNode>>,
}

/// An opened node: the common configuration plus the driver operations.
///
/// This is the capability record both drivers implement; the generic block
/// layer composes every public operation out of these.
pub trait BlockNode: Send + Sync {
    fn common(&self) -> &BdsCommon;
    fn format_name(&self) -> &'static str;

    fn supports_backing(&self) -> bool {
        false
    }

    /// The chain parent, if this node has one.
    fn backing(&self) -> Option<&Child> {
        None
    }

    fn drv_preadv_part(
        &self,
        offset: u64,
        bytes: u64,
        qiov: &mut IoVecMut<'_>,
        qiov_offset: u64,
        flags: ReqFlags,
    ) -> BlockResult;

    fn drv_pwritev_part(
        &self,
        offset: u64,
        bytes: u64,
        qiov: &IoVec<'_>,
        qiov_offset: u64,
        flags: ReqFlags,
    ) -> BlockResult;

    fn drv_pwrite_zeroes(&self, _offset: u64, _bytes: u64, _flags: ReqFlags) -> BlockResult {
        Err(BlockError::NotSupported)
    }

    fn drv_block_status(
        &self,
        _want_zero: bool,
        _offset: u64,
        _bytes: u64,
    ) -> BlockResult<DriverStatus> {
        Err(BlockError::NotSupported)
    }

    fn drv_pdiscard(&self, _offset: u64, _bytes: u64) -> BlockResult {
        Err(BlockError::NotSupported)
    }

    /// Flush driver-internal state (metadata caches) to the file layer.
    fn drv_flush_to_os(&self) -> BlockResult {
        Err(BlockError::NotSupported)
    }

    /// Flush the file layer to stable storage.
    fn drv_flush_to_disk(&self) -> BlockResult {
        Err(BlockError::NotSupported)
    }

    fn drv_getlength(&self) -> BlockResult<u64>;

    /// Releases driver resources. Called once by [`crate::block::close`].
    fn drv_close(&self);

    /// Human-readable report; drivers without one return `NotSupported`.
    fn drv_info(&self, _detail: bool, _pretty: bool) -> BlockResult<String> {
        Err(BlockError::NotSupported)
    }
}

/// A handle onto an opened node plus the permissions the holder was granted.
#[derive(Clone)]
pub struct Child {
    node: Arc<dyn BlockNode>,
    perm: Perm,
}

impl Child {
    pub fn new(node: Arc<dyn BlockNode>, perm: Perm) -> Self {
        Self { node, perm }
    }

    #[inline]
    pub fn node(&self) -> &dyn BlockNode {
        &*self.node
    }

    #[inline]
    pub fn node_arc(&self) -> Arc<dyn BlockNode> {
        Arc::clone(&self.node)
    }

    #[inline]
    pub fn perm(&self) -> Perm {
        self.perm
    }

    pub fn set_perm(&mut self, perm: Perm) {
        self.perm = perm;
    }
}

impl std::fmt::Debug for Child {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Child")
            .field("format", &self.node.format_name())
            .field("filename", &self.node.common().filename)
            .field("perm", &self.perm)
            .finish()
    }
}
