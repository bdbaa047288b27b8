// SPDX-License-Identifier: MIT

//! On-disk header structures (big-endian, version 3 with a version-2
//! compatible prefix).

use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::consts::*;
use crate::error::{BlockError, BlockResult};
use crate::flags::IncompatFeatures;

/// QCOW2 header. The first 72 bytes are the version-2 layout; the remaining
/// fields only exist on version 3 images. Total size is a multiple of 8.
#[repr(C)]
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy)]
pub struct Header {
    pub magic: U32<BigEndian>,
    pub version: U32<BigEndian>,
    pub backing_file_offset: U64<BigEndian>,
    pub backing_file_size: U32<BigEndian>,
    pub cluster_bits: U32<BigEndian>,
    /// Virtual disk size in bytes.
    pub size: U64<BigEndian>,
    pub crypt_method: U32<BigEndian>,
    /// L1 table length in entries.
    pub l1_size: U32<BigEndian>,
    pub l1_table_offset: U64<BigEndian>,
    pub refcount_table_offset: U64<BigEndian>,
    pub refcount_table_clusters: U32<BigEndian>,
    pub nb_snapshots: U32<BigEndian>,
    pub snapshots_offset: U64<BigEndian>,

    // Version >= 3 only.
    pub incompatible_features: U64<BigEndian>,
    pub compatible_features: U64<BigEndian>,
    pub autoclear_features: U64<BigEndian>,
    pub refcount_order: U32<BigEndian>,
    pub header_length: U32<BigEndian>,

    pub compression_type: u8,
    padding: [u8; 7],
}

/// Header extension TLV: `{magic, length}` then `length` bytes of data,
/// padded to 8.
#[repr(C)]
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy)]
pub struct HeaderExtension {
    pub magic: U32<BigEndian>,
    pub length: U32<BigEndian>,
}

pub const HEADER_SIZE: u64 = core::mem::size_of::<Header>() as u64;
pub const HEADER_EXT_SIZE: u64 = core::mem::size_of::<HeaderExtension>() as u64;

impl Header {
    /// Header of a fresh version-3 image with the fixed initial layout.
    pub fn new(size: u64, l1_size: u32) -> Self {
        Self {
            magic: U32::new(MAGIC),
            version: U32::new(VERSION_3),
            backing_file_offset: U64::new(0),
            backing_file_size: U32::new(0),
            cluster_bits: U32::new(DEFAULT_CLUSTER_BITS),
            size: U64::new(size),
            crypt_method: U32::new(0),
            l1_size: U32::new(l1_size),
            l1_table_offset: U64::new(L1_TABLE_OFFSET),
            refcount_table_offset: U64::new(REFCOUNT_TABLE_OFFSET),
            refcount_table_clusters: U32::new(DEFAULT_REFCOUNT_TABLE_CLUSTERS),
            nb_snapshots: U32::new(0),
            snapshots_offset: U64::new(0),
            incompatible_features: U64::new(0),
            compatible_features: U64::new(0),
            autoclear_features: U64::new(0),
            refcount_order: U32::new(REFCOUNT_ORDER),
            header_length: U32::new(HEADER_SIZE as u32),
            compression_type: 0,
            padding: [0; 7],
        }
    }

    /// Validates the fields this implementation is pinned to.
    pub fn check(&self) -> BlockResult {
        if self.magic.get() != MAGIC {
            return Err(BlockError::CorruptImage("bad magic"));
        }
        let version = self.version.get();
        if version != VERSION_2 && version != VERSION_3 {
            return Err(BlockError::NotSupported);
        }
        if self.cluster_bits.get() != DEFAULT_CLUSTER_BITS {
            // Only 64 KiB clusters are supported.
            return Err(BlockError::NotSupported);
        }
        if version >= VERSION_3 && self.refcount_order.get() != REFCOUNT_ORDER {
            // Only 16-bit refcounts are supported.
            return Err(BlockError::NotSupported);
        }
        if self.crypt_method.get() != 0 {
            return Err(BlockError::NotSupported);
        }
        if version >= VERSION_3 && self.header_length.get() as u64 > HEADER_SIZE {
            return Err(BlockError::NotSupported);
        }
        if version >= VERSION_3
            && IncompatFeatures::from_bits(self.incompatible_features.get()).is_none()
        {
            // An unknown incompatible bit means we must not touch the image.
            return Err(BlockError::NotSupported);
        }
        Ok(())
    }

    pub fn incompat(&self) -> IncompatFeatures {
        IncompatFeatures::from_bits_retain(self.incompatible_features.get())
    }

    pub fn has_extended_l2(&self) -> bool {
        self.incompat().contains(IncompatFeatures::EXTL2)
    }

    pub fn has_external_data_file(&self) -> bool {
        self.incompat().contains(IncompatFeatures::DATA_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes as _;

    #[test]
    fn test_header_size() {
        assert_eq!(HEADER_SIZE, 112);
        assert_eq!(HEADER_EXT_SIZE, 8);
    }

    #[test]
    fn test_big_endian_encoding() {
        let h = Header::new(1 << 20, 2);
        let bytes = h.as_bytes();
        assert_eq!(&bytes[0..4], &[0x51, 0x46, 0x49, 0xFB]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 3]);
        // size at offset 24
        assert_eq!(&bytes[24..32], &[0, 0, 0, 0, 0, 0x10, 0, 0]);
    }

    #[test]
    fn test_check() {
        let mut h = Header::new(1 << 20, 2);
        assert!(h.check().is_ok());

        h.magic = U32::new(0xDEAD_BEEF);
        assert!(matches!(h.check(), Err(BlockError::CorruptImage(_))));

        let mut h = Header::new(1 << 20, 2);
        h.cluster_bits = U32::new(12);
        assert!(matches!(h.check(), Err(BlockError::NotSupported)));

        let mut h = Header::new(1 << 20, 2);
        h.incompatible_features = U64::new(1 << 60);
        assert!(matches!(h.check(), Err(BlockError::NotSupported)));
    }
}
