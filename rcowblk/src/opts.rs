// SPDX-License-Identifier: MIT

//! Typed create/open options.

/// Options accepted by [`crate::block::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    /// Virtual size in bytes; rounded up to a whole sector.
    pub size: u64,
    /// Backing image path; reads fall through to it where this image has
    /// no data.
    pub backing: Option<String>,
    /// Track allocation at 2 KiB subcluster granularity (extended L2).
    pub enable_subcluster: bool,
    /// Keep payload bytes in this separate raw file; the image itself then
    /// only holds metadata.
    pub data_file: Option<String>,
}

impl CreateOpts {
    pub fn with_size(size: u64) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }
}

/// Options accepted by [`crate::block::open`].
#[derive(Debug, Clone, Default)]
pub struct OpenOpts {
    /// L2 cache budget in bytes; rounded up to whole tables. Defaults to
    /// caching every L2 table the image can have.
    pub l2_cache_size: Option<u64>,
}
