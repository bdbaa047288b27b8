// SPDX-License-Identifier: MIT

//! Public block API: format dispatch plus the user-facing operations
//! composed from the generic layer.

use std::sync::Arc;

use crate::error::{BlockError, BlockResult};
use crate::flags::{OpenFlags, Perm, ReqFlags};
use crate::io;
use crate::node::{BlockNode, Child};
use crate::opts::{CreateOpts, OpenOpts};
use crate::qcow2::Qcow2;
use crate::raw::Raw;

fn open_node(
    filename: &str,
    fmt: &str,
    opts: &OpenOpts,
    flags: OpenFlags,
) -> BlockResult<Arc<dyn BlockNode>> {
    match fmt {
        "raw" => Ok(Raw::open(filename, flags)?),
        "qcow2" => Ok(Qcow2::open(filename, opts, flags)?),
        other => Err(BlockError::UnknownFormat(other.to_string())),
    }
}

/// Creates an image of the given format.
pub fn create(filename: &str, fmt: &str, opts: &CreateOpts) -> BlockResult {
    match fmt {
        "raw" => Raw::create(filename),
        "qcow2" => Qcow2::create(filename, opts),
        other => Err(BlockError::UnknownFormat(other.to_string())),
    }
}

/// Opens an image and returns the root child handle. The handle carries
/// all permissions, or read-only ones when opened without `RDWR`.
pub fn open(
    filename: &str,
    fmt: &str,
    opts: &OpenOpts,
    flags: OpenFlags,
) -> BlockResult<Child> {
    let node = open_node(filename, fmt, opts, flags)?;
    let perm = if flags.contains(OpenFlags::RDWR) {
        Perm::ALL
    } else {
        Perm::READABLE
    };
    Ok(Child::new(node, perm))
}

/// Flushes and closes the image behind `child`. The handle must not be
/// used afterwards.
pub fn close(child: &Child) {
    let _ = io::flush(child.node());
    child.node().drv_close();
}

/// Reads `buf.len()` bytes at `offset`.
pub fn pread(child: &Child, offset: u64, buf: &mut [u8]) -> BlockResult<u64> {
    io::pread(child, offset, buf)
}

/// Writes `buf` at `offset`; `FUA` in `flags` forces durability before
/// returning.
pub fn pwrite(child: &Child, offset: u64, buf: &[u8], flags: ReqFlags) -> BlockResult<u64> {
    let qiov = rcowio::IoVec::from_buf(buf);
    io::pwritev_part(child, offset, buf.len() as u64, &qiov, 0, flags)?;
    Ok(buf.len() as u64)
}

/// Efficient zero write; with `MAY_UNMAP` the range may also be unmapped.
pub fn pwrite_zeroes(child: &Child, offset: u64, bytes: u64, flags: ReqFlags) -> BlockResult {
    io::pwrite_zeroes(child, offset, bytes, flags)
}

/// Discards a cluster-aligned range. Requires the image to be opened with
/// `UNMAP`.
pub fn discard(child: &Child, offset: u64, bytes: u64) -> BlockResult {
    io::pdiscard(child, offset, bytes)
}

/// Virtual size in bytes.
pub fn get_length(child: &Child) -> BlockResult<u64> {
    io::getlength(child.node())
}

/// Textual (JSON) report about the image; `detail` adds a refcount scan.
pub fn info(child: &Child, detail: bool, pretty: bool) -> BlockResult<String> {
    child.node().drv_info(detail, pretty)
}
