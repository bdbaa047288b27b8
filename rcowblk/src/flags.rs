// SPDX-License-Identifier: MIT

//! Flag sets shared across the block layer and the drivers.

use bitflags::bitflags;

bitflags! {
    /// Image open flags. Unknown bits are preserved so callers can round-trip
    /// flags they understand better than we do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Open read-write.
        const RDWR = 0x0002;
        /// Do not use the host page cache.
        const NOCACHE = 0x0020;
        /// Consistency hint for migration handoff; suppresses copy-on-read
        /// back-writes.
        const INACTIVE = 0x0800;
        /// Execute guest discard operations.
        const UNMAP = 0x4000;
        /// Degrade to read-only if a read-write open fails.
        const AUTO_RDONLY = 0x20000;
        /// Create the file if it does not exist.
        const CREATE = 0x80000;

        const _ = !0;
    }
}

bitflags! {
    /// Per-request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReqFlags: u32 {
        const COPY_ON_READ = 0x1;
        const ZERO_WRITE = 0x2;
        const MAY_UNMAP = 0x4;
        const FUA = 0x10;
        const WRITE_COMPRESSED = 0x20;
        const WRITE_UNCHANGED = 0x40;
        const SERIALISING = 0x80;
        const NO_FALLBACK = 0x100;
        const PREFETCH = 0x200;
    }
}

bitflags! {
    /// Block-status result flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u32 {
        /// Allocation for data at the offset is tied to this layer.
        const DATA = 0x01;
        /// The offset reads as zero.
        const ZERO = 0x02;
        /// The map field carries a usable raw offset.
        const OFFSET_VALID = 0x04;
        /// Passthrough: recompute the answer from the returned node.
        const RAW = 0x08;
        /// The content is determined by this layer rather than any backing.
        const ALLOCATED = 0x10;
        /// The returned length reaches the end of this layer's file.
        const EOF = 0x20;
        /// Recursively search for zeroes in the returned node.
        const RECURSE = 0x40;
    }
}

bitflags! {
    /// Child permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Perm: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const RESIZE = 0x04;
    }
}

impl Perm {
    pub const ALL: Perm = Perm::all();
    pub const READABLE: Perm = Perm::READ;
    pub const WRITABLE: Perm = Perm::WRITE.union(Perm::RESIZE);
}

bitflags! {
    /// Incompatible feature bits of the version-3 header. An image carrying
    /// a bit we do not recognise must be refused.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IncompatFeatures: u64 {
        const DIRTY = 1 << 0;
        const CORRUPT = 1 << 1;
        const DATA_FILE = 1 << 2;
        const COMPRESSION = 1 << 3;
        const EXTL2 = 1 << 4;
    }
}

bitflags! {
    /// Autoclear feature bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AutoclearFeatures: u64 {
        /// The external data file holds raw guest data at identity offsets.
        const DATA_FILE_RAW = 1 << 1;

        const _ = !0;
    }
}
