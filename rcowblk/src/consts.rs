// SPDX-License-Identifier: MIT

//! Format constants. All fixed offsets assume the 64 KiB cluster size this
//! implementation is pinned to.

/// Header magic, `"QFI\xfb"`.
pub const MAGIC: u32 = 0x5146_49FB;

/// Single image limit, 4 TiB.
pub const MAX_IMAGE_SIZE: u64 = 1 << 42;

pub const SUBCLUSTERS_PER_CLUSTER: u64 = 32;
pub const L2_BITMAP_ALL_ALLOC: u64 = (1 << 32) - 1;
pub const L2_BITMAP_ALL_ZEROES: u64 = L2_BITMAP_ALL_ALLOC << 32;

/// Upper bound on the refcount table, in bytes.
pub const MAX_REFTABLE_BYTES: u64 = 8 * 1024 * 1024;

// L1 / L2 / refcount-table entry masks.
pub const L1E_OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;
pub const L2E_OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;
pub const REFT_OFFSET_MASK: u64 = 0xffff_ffff_ffff_fe00;

/// Sentinel for "no host offset chosen yet" in the write planner.
pub const INV_OFFSET: u64 = 0xff00_0000_0000_0000;

pub const DEFAULT_CLUSTER_BITS: u32 = 16;
pub const DEFAULT_CLUSTER_SIZE: u64 = 1 << DEFAULT_CLUSTER_BITS;
pub const DEFAULT_SECTOR_SIZE: u64 = 512;
pub const DEFAULT_REFCOUNT_TABLE_CLUSTERS: u32 = 1;

pub const VERSION_2: u32 = 2;
pub const VERSION_3: u32 = 3;
pub const REFCOUNT_ORDER: u32 = 4;

/// Drivers take requests at sector granularity; the block layer pads the
/// rest.
pub const REQUEST_ALIGNMENT: u32 = DEFAULT_SECTOR_SIZE as u32;
pub const MAX_TRANSFER: u32 = 1 << 31;

pub const SECTOR_BITS: u32 = 9;
pub const SECTOR_SIZE: u64 = 1 << SECTOR_BITS;

/// Fixed layout of a fresh image: header, refcount table, first refcount
/// block, L1 table, one cluster each.
pub const REFCOUNT_TABLE_OFFSET: u64 = DEFAULT_CLUSTER_SIZE;
pub const L1_TABLE_OFFSET: u64 = 3 * DEFAULT_CLUSTER_SIZE;
pub const BACKING_PATH_OFFSET: u64 = 32768;

// Entry flags shared by L1 and L2 entries.
pub const OFLAG_COPIED: u64 = 1 << 63;
pub const OFLAG_COMPRESSED: u64 = 1 << 62;
pub const OFLAG_ZERO: u64 = 1 << 0;

pub const L1E_SIZE: u64 = 8;
pub const REFTABLE_ENTRY_SIZE: u64 = 8;
pub const L2E_SIZE_NORMAL: u64 = 8;
pub const L2E_SIZE_EXTENDED: u64 = 16;

/// Header-extension magic for the external data file path (`"DATA"`).
pub const EXT_MAGIC_DATA_FILE: u32 = 0x4441_5441;

/// Largest chunk handed to a driver's write-zeroes fast path.
pub const MAX_WRITE_ZEROES: u64 = 65536;

/// Largest bounce buffer the copy-on-read and zero-fallback paths allocate.
pub const MAX_BOUNCE_BUFFER: u64 = 32768 << 9;
