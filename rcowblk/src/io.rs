// SPDX-License-Identifier: MIT

//! Generic block layer: request padding and splitting, write-zeroes with
//! bounce fallback, copy-on-read, block-status recursion through the backing
//! chain, discard plumbing and flush composition. Everything here is
//! polymorphic over [`BlockNode`].

use rcowio::bits::{align_down, is_aligned, round_up};
use rcowio::{IoVec, IoVecMut};

use crate::consts::*;
use crate::error::{BlockError, BlockResult};
use crate::flags::{OpenFlags, Perm, ReqFlags, Status};
use crate::node::{BlockNode, Child, DriverStatus};

#[inline]
fn same_node(a: &dyn BlockNode, b: &dyn BlockNode) -> bool {
    std::ptr::eq(a as *const dyn BlockNode as *const u8, b as *const dyn BlockNode as *const u8)
}

/// Composed flush: driver-internal state first, then the file layer.
pub fn flush(node: &dyn BlockNode) -> BlockResult {
    match node.drv_flush_to_os() {
        Err(e) if e.is_not_supported() => {}
        r => return r,
    }
    match node.drv_flush_to_disk() {
        Err(e) if e.is_not_supported() => Ok(()),
        r => r,
    }
}

pub fn getlength(node: &dyn BlockNode) -> BlockResult<u64> {
    node.drv_getlength()
}

/// Buffer-based read; a degenerate one-segment vector.
pub fn pread(child: &Child, offset: u64, buf: &mut [u8]) -> BlockResult<u64> {
    let bytes = buf.len() as u64;
    let mut qiov = IoVecMut::from_buf(buf);
    preadv_part(child, offset, bytes, &mut qiov, 0, ReqFlags::empty())?;
    Ok(bytes)
}

/// Buffer-based write; a degenerate one-segment vector.
pub fn pwrite(child: &Child, offset: u64, buf: &[u8]) -> BlockResult<u64> {
    let qiov = IoVec::from_buf(buf);
    pwritev_part(child, offset, buf.len() as u64, &qiov, 0, ReqFlags::empty())?;
    Ok(buf.len() as u64)
}

pub fn pwritev(
    child: &Child,
    offset: u64,
    bytes: u64,
    qiov: &IoVec<'_>,
    flags: ReqFlags,
) -> BlockResult {
    pwritev_part(child, offset, bytes, qiov, 0, flags)
}

pub fn preadv(
    child: &Child,
    offset: u64,
    bytes: u64,
    qiov: &mut IoVecMut<'_>,
    flags: ReqFlags,
) -> BlockResult {
    preadv_part(child, offset, bytes, qiov, 0, flags)
}

/// Efficient zero write. `MAY_UNMAP` is honoured only on images opened with
/// `UNMAP`.
pub fn pwrite_zeroes(child: &Child, offset: u64, bytes: u64, mut flags: ReqFlags) -> BlockResult {
    if !child.node().common().open_flags.contains(OpenFlags::UNMAP) {
        flags -= ReqFlags::MAY_UNMAP;
    }
    let empty = IoVec::new();
    pwritev_part(child, offset, bytes, &empty, 0, flags | ReqFlags::ZERO_WRITE)
}

// === Request padding ===
//
//  |<---- align ----->|                     |<----- align ---->|
//  |<- head ->|<------------- bytes ------------->|<-- tail -->|
// -*----------$-------*-------- ... --------*-----$------------*---
//  ALIGN_DOWN(offset) offset                end   ALIGN_UP(end)
//
// `buf` holds the head bytes at its start and the tail bytes at its end.
// When the whole padded request fits one aligned slot, `merge_reads` is set
// and a single buffer-sized transfer covers both paddings.

struct RequestPadding {
    buf: Vec<u8>,
    head: u64,
    tail: u64,
    merge_reads: bool,
    align: u64,
}

fn init_padding(align: u64, offset: u64, bytes: u64) -> Option<RequestPadding> {
    let head = offset & (align - 1);
    let mut tail = (offset + bytes) & (align - 1);
    if tail > 0 {
        tail = align - tail;
    }
    if head == 0 && tail == 0 {
        return None;
    }

    let sum = head + bytes + tail;
    let buf_len = if sum > align && head > 0 && tail > 0 {
        2 * align
    } else {
        align
    };
    Some(RequestPadding {
        buf: vec![0u8; buf_len as usize],
        head,
        tail,
        merge_reads: sum == buf_len,
        align,
    })
}

impl RequestPadding {
    fn head_slice(&self) -> &[u8] {
        &self.buf[..self.head as usize]
    }

    fn tail_slice(&self) -> &[u8] {
        &self.buf[self.buf.len() - self.tail as usize..]
    }

    /// Last alignment slot of the buffer (the RMW'd tail chunk).
    fn tail_region(&self) -> &[u8] {
        &self.buf[self.buf.len() - self.align as usize..]
    }

    /// Disjoint mutable head/tail padding areas for a padded read.
    fn head_tail_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        let len = self.buf.len();
        let tail = self.tail as usize;
        let (head, rest) = self.buf.split_at_mut(self.head as usize);
        let rest_len = rest.len();
        (head, &mut rest[rest_len - tail..][..tail])
    }
}

/// Reads the head (and tail, if separate) alignment chunks so a following
/// write becomes a pure replacement. `zero_middle` clears the bytes between
/// the paddings for the zero-write path.
fn padding_rmw_read(
    child: &Child,
    aligned_offset: u64,
    padded_bytes: u64,
    pad: &mut RequestPadding,
    zero_middle: bool,
) -> BlockResult {
    let align = pad.align;

    if pad.head > 0 || pad.merge_reads {
        let n = if pad.merge_reads {
            pad.buf.len() as u64
        } else {
            align
        };
        let mut lq = IoVecMut::from_buf(&mut pad.buf[..n as usize]);
        aligned_preadv(child, aligned_offset, n, align, &mut lq, 0, ReqFlags::empty())?;
    }

    if pad.tail > 0 && !pad.merge_reads {
        let tail_start = pad.buf.len() - align as usize;
        let mut lq = IoVecMut::from_buf(&mut pad.buf[tail_start..]);
        aligned_preadv(
            child,
            aligned_offset + padded_bytes - align,
            align,
            align,
            &mut lq,
            0,
            ReqFlags::empty(),
        )?;
    }

    if zero_middle {
        let len = pad.buf.len();
        pad.buf[pad.head as usize..len - pad.tail as usize].fill(0);
    }
    Ok(())
}

// === Write pipeline ===

pub fn pwritev_part(
    child: &Child,
    offset: u64,
    bytes: u64,
    qiov: &IoVec<'_>,
    qiov_offset: u64,
    flags: ReqFlags,
) -> BlockResult {
    if !child.perm().intersects(Perm::WRITABLE) {
        return Err(BlockError::PermissionDenied("write"));
    }
    let node = child.node();
    let align = node.common().request_alignment as u64;

    // A misaligned request cannot be made efficient; the strict path refuses.
    if flags.contains(ReqFlags::NO_FALLBACK) && !is_aligned(offset | bytes, align) {
        return Err(BlockError::Misaligned);
    }
    if bytes == 0 && !is_aligned(offset, align) {
        return Ok(());
    }

    if flags.contains(ReqFlags::ZERO_WRITE) {
        return do_zero_pwritev(child, offset, bytes, flags);
    }

    match init_padding(align, offset, bytes) {
        None => aligned_pwritev(child, offset, bytes, align, Some(qiov), qiov_offset, flags),
        Some(mut pad) => {
            let aligned_offset = offset - pad.head;
            let padded_bytes = bytes + pad.head + pad.tail;
            padding_rmw_read(child, aligned_offset, padded_bytes, &mut pad, false)?;

            let ext = IoVec::extended(
                pad.head_slice(),
                qiov,
                qiov_offset,
                bytes,
                pad.tail_slice(),
            )
            .ok_or(BlockError::InvalidArgument)?;
            aligned_pwritev(child, aligned_offset, padded_bytes, align, Some(&ext), 0, flags)
        }
    }
}

/// Zero-write with misaligned edges: RMW the paddings, write them as plain
/// data, route the aligned middle through the zero machinery.
fn do_zero_pwritev(child: &Child, offset: u64, bytes: u64, flags: ReqFlags) -> BlockResult {
    let node = child.node();
    let align = node.common().request_alignment as u64;
    let mut offset = offset;
    let mut bytes = bytes;

    let mut pad = init_padding(align, offset, bytes);
    if let Some(pad) = pad.as_mut() {
        let aligned_offset = offset - pad.head;
        let padded_bytes = bytes + pad.head + pad.tail;
        padding_rmw_read(child, aligned_offset, padded_bytes, pad, true)?;

        if pad.head > 0 || pad.merge_reads {
            let write_bytes = if pad.merge_reads {
                pad.buf.len() as u64
            } else {
                align
            };
            let lq = IoVec::from_buf(&pad.buf[..write_bytes as usize]);
            aligned_pwritev(
                child,
                aligned_offset,
                write_bytes,
                align,
                Some(&lq),
                0,
                flags - ReqFlags::ZERO_WRITE,
            )?;
            if pad.merge_reads {
                return Ok(());
            }
            offset += write_bytes - pad.head;
            bytes -= write_bytes - pad.head;
        }
    }

    if bytes >= align {
        // Write the aligned middle without touching payload buffers.
        let aligned_bytes = bytes & !(align - 1);
        aligned_pwritev(child, offset, aligned_bytes, align, None, 0, flags)?;
        bytes -= aligned_bytes;
        offset += aligned_bytes;
    }

    if bytes > 0 {
        let Some(pad) = pad.as_ref() else {
            return Err(BlockError::InvalidArgument);
        };
        let lq = IoVec::from_buf(pad.tail_region());
        return aligned_pwritev(
            child,
            offset,
            align,
            align,
            Some(&lq),
            0,
            flags - ReqFlags::ZERO_WRITE,
        );
    }
    Ok(())
}

fn aligned_pwritev(
    child: &Child,
    offset: u64,
    bytes: u64,
    align: u64,
    qiov: Option<&IoVec<'_>>,
    qiov_offset: u64,
    flags: ReqFlags,
) -> BlockResult {
    let node = child.node();
    let max_transfer = align_down(node.common().max_transfer as u64, align);

    if flags.contains(ReqFlags::ZERO_WRITE) {
        return do_pwrite_zeroes(node, offset, bytes, flags);
    }
    if flags.contains(ReqFlags::WRITE_COMPRESSED) {
        return Err(BlockError::NotSupported);
    }
    let Some(qiov) = qiov else {
        return Err(BlockError::InvalidArgument);
    };

    if bytes <= max_transfer {
        return driver_pwritev(node, offset, bytes, qiov, qiov_offset, flags);
    }

    let mut remaining = bytes;
    while remaining > 0 {
        let num = remaining.min(max_transfer);
        let mut local_flags = flags;
        if num < remaining
            && flags.contains(ReqFlags::FUA)
            && !node.common().supported_write_flags.contains(ReqFlags::FUA)
        {
            // FUA is emulated by a flush; only the last chunk needs it.
            local_flags -= ReqFlags::FUA;
        }
        driver_pwritev(
            node,
            offset + bytes - remaining,
            num,
            qiov,
            qiov_offset + bytes - remaining,
            local_flags,
        )?;
        remaining -= num;
    }
    Ok(())
}

fn driver_pwritev(
    node: &dyn BlockNode,
    offset: u64,
    bytes: u64,
    qiov: &IoVec<'_>,
    qiov_offset: u64,
    flags: ReqFlags,
) -> BlockResult {
    let supported = node.common().supported_write_flags;
    node.drv_pwritev_part(offset, bytes, qiov, qiov_offset, flags & supported)?;
    if (flags - supported).contains(ReqFlags::FUA) {
        flush(node)?;
    }
    Ok(())
}

/// Zero write at driver granularity: try the driver fast path in bounded
/// chunks, fall back to a zero bounce buffer unless forbidden, batch the
/// emulated FUA flush.
fn do_pwrite_zeroes(node: &dyn BlockNode, offset: u64, bytes: u64, flags: ReqFlags) -> BlockResult {
    let supported_zero = node.common().supported_zero_flags;
    if (flags - supported_zero).contains(ReqFlags::NO_FALLBACK) {
        return Err(BlockError::NotSupported);
    }

    let alignment = MAX_WRITE_ZEROES;
    let max_write_zeroes = align_down(MAX_WRITE_ZEROES, alignment);
    let max_transfer = MAX_WRITE_ZEROES;

    let mut head = offset % alignment;
    let tail = (offset + bytes) % alignment;
    let mut need_flush = false;
    let mut bounce: Vec<u8> = Vec::new();

    let mut offset = offset;
    let mut bytes = bytes;
    while bytes > 0 {
        let mut num = bytes;
        if head > 0 {
            // Align up to the next boundary first.
            num = bytes.min(max_transfer).min(alignment - head);
            head = (head + num) % alignment;
        } else if tail > 0 && num > alignment {
            // Shorten the request down to the last aligned boundary.
            num -= tail;
        }
        if num > max_write_zeroes {
            num = max_write_zeroes;
        }

        let mut res = node.drv_pwrite_zeroes(offset, num, flags & supported_zero);
        match &res {
            Ok(()) => {
                if flags.contains(ReqFlags::FUA) && !supported_zero.contains(ReqFlags::FUA) {
                    need_flush = true;
                }
            }
            Err(e) if e.is_not_supported() && !flags.contains(ReqFlags::NO_FALLBACK) => {
                let mut write_flags = flags - ReqFlags::ZERO_WRITE;
                if flags.contains(ReqFlags::FUA)
                    && !node.common().supported_write_flags.contains(ReqFlags::FUA)
                {
                    write_flags -= ReqFlags::FUA;
                    need_flush = true;
                }
                num = num.min(max_transfer);
                if (bounce.len() as u64) < num {
                    bounce = vec![0u8; num as usize];
                }
                let lq = IoVec::from_buf(&bounce[..num as usize]);
                res = driver_pwritev(node, offset, num, &lq, 0, write_flags);
            }
            Err(_) => {}
        }
        res?;

        offset += num;
        bytes -= num;
    }

    if need_flush {
        flush(node)?;
    }
    Ok(())
}

// === Read pipeline ===

pub fn preadv_part(
    child: &Child,
    offset: u64,
    bytes: u64,
    qiov: &mut IoVecMut<'_>,
    qiov_offset: u64,
    flags: ReqFlags,
) -> BlockResult {
    let node = child.node();
    let align = node.common().request_alignment as u64;
    if bytes == 0 && !is_aligned(offset, align) {
        return Ok(());
    }

    match init_padding(align, offset, bytes) {
        None => aligned_preadv(child, offset, bytes, align, qiov, qiov_offset, flags),
        Some(mut pad) => {
            let aligned_offset = offset - pad.head;
            let padded_bytes = bytes + pad.head + pad.tail;
            let (head_buf, tail_buf) = pad.head_tail_mut();
            let mid = qiov.sub_views_mut(qiov_offset, bytes);
            let mut ext =
                IoVecMut::extended(head_buf, mid, tail_buf).ok_or(BlockError::InvalidArgument)?;
            aligned_preadv(child, aligned_offset, padded_bytes, align, &mut ext, 0, flags)
        }
    }
}

fn aligned_preadv(
    child: &Child,
    offset: u64,
    bytes: u64,
    align: u64,
    qiov: &mut IoVecMut<'_>,
    qiov_offset: u64,
    mut flags: ReqFlags,
) -> BlockResult {
    if !child.perm().intersects(Perm::READABLE) {
        return Err(BlockError::PermissionDenied("read"));
    }
    let node = child.node();
    let max_transfer = align_down(node.common().max_transfer as u64, align);

    if flags.contains(ReqFlags::COPY_ON_READ) {
        flags -= ReqFlags::COPY_ON_READ;
        let (allocated, pnum) = is_allocated(node, offset, bytes)?;
        if !allocated || pnum != bytes {
            return do_copy_on_readv(child, offset, bytes, qiov, qiov_offset, flags);
        }
        if flags.contains(ReqFlags::PREFETCH) {
            return Ok(());
        }
    }

    let total_bytes = getlength(node)?;
    let mut max_bytes = round_up(total_bytes.saturating_sub(offset), align);
    if bytes <= max_bytes && bytes <= max_transfer {
        return node.drv_preadv_part(offset, bytes, qiov, qiov_offset, flags);
    }

    let mut remaining = bytes;
    while remaining > 0 {
        if max_bytes > 0 {
            let num = remaining.min(max_bytes).min(max_transfer);
            node.drv_preadv_part(
                offset + bytes - remaining,
                num,
                qiov,
                qiov_offset + bytes - remaining,
                flags,
            )?;
            max_bytes -= num;
            remaining -= num;
        } else {
            // Past end of file: the tail reads as zero.
            qiov.memset(qiov_offset + bytes - remaining, 0, remaining);
            remaining = 0;
        }
    }
    Ok(())
}

fn round_to_clusters(offset: u64, bytes: u64) -> (u64, u64) {
    let cluster_offset = align_down(offset, DEFAULT_CLUSTER_SIZE);
    (
        cluster_offset,
        rcowio::bits::align_up(offset - cluster_offset + bytes, DEFAULT_CLUSTER_SIZE),
    )
}

/// Copy-on-read: pull unallocated spans out of the backing chain through a
/// bounce buffer, write them back into this layer (unless the image is
/// inactive), then satisfy the caller.
fn do_copy_on_readv(
    child: &Child,
    offset: u64,
    bytes: u64,
    qiov: &mut IoVecMut<'_>,
    qiov_offset: u64,
    flags: ReqFlags,
) -> BlockResult {
    let node = child.node();
    let max_transfer = node.common().max_transfer as u64;
    let skip_write = node.common().open_flags.contains(OpenFlags::INACTIVE);

    let (mut cluster_offset, mut cluster_bytes) = round_to_clusters(offset, bytes);
    let mut skip_bytes = offset - cluster_offset;
    let mut progress = 0u64;
    let mut bounce: Vec<u8> = Vec::new();

    while cluster_bytes > 0 {
        let want = cluster_bytes.min(max_transfer);
        let (allocated, mut pnum) = if skip_write {
            // Treat as allocated so nothing gets copied back.
            (true, want)
        } else {
            match is_allocated(node, cluster_offset, want) {
                Ok((a, p)) => {
                    if !a && p == 0 {
                        // Image ends in the middle of the cluster.
                        break;
                    }
                    (a, p)
                }
                Err(_) => (false, want),
            }
        };

        if !allocated {
            pnum = pnum.min(MAX_BOUNCE_BUFFER);
            if bounce.is_empty() {
                let max_we_need = pnum.max(cluster_bytes - pnum);
                let max_allowed = max_transfer.min(MAX_BOUNCE_BUFFER);
                bounce = vec![0u8; max_we_need.min(max_allowed) as usize];
            }
            if (bounce.len() as u64) < pnum {
                bounce.resize(pnum as usize, 0);
            }
            {
                let mut lq = IoVecMut::from_buf(&mut bounce[..pnum as usize]);
                node.drv_preadv_part(cluster_offset, pnum, &mut lq, 0, ReqFlags::empty())?;
            }

            if bounce[..pnum as usize].iter().all(|&b| b == 0) {
                do_pwrite_zeroes(node, cluster_offset, pnum, ReqFlags::WRITE_UNCHANGED)?;
            } else {
                let lq = IoVec::from_buf(&bounce[..pnum as usize]);
                driver_pwritev(node, cluster_offset, pnum, &lq, 0, ReqFlags::WRITE_UNCHANGED)?;
            }

            if !flags.contains(ReqFlags::PREFETCH) {
                let take = (pnum - skip_bytes).min(bytes - progress);
                qiov.copy_from_buf(
                    qiov_offset + progress,
                    &bounce[skip_bytes as usize..(skip_bytes + take) as usize],
                );
            }
        } else if !flags.contains(ReqFlags::PREFETCH) {
            // Read directly into the destination.
            let take = (pnum - skip_bytes).min(bytes - progress);
            let mut sub = qiov.slice_mut(qiov_offset + progress, take);
            node.drv_preadv_part(offset + progress, take, &mut sub, 0, ReqFlags::empty())?;
        }

        cluster_offset += pnum;
        cluster_bytes -= pnum;
        progress += pnum - skip_bytes;
        skip_bytes = 0;
    }
    Ok(())
}

// === Block status ===

/// Single-node status with the generic clamping, alignment and flag algebra.
fn block_status(
    node: &dyn BlockNode,
    want_zero: bool,
    offset: u64,
    bytes: u64,
) -> BlockResult<DriverStatus> {
    let total_size = getlength(node)?;
    if offset >= total_size {
        return Ok(DriverStatus {
            status: Status::EOF,
            pnum: 0,
            map: 0,
            file: None,
        });
    }
    if bytes == 0 {
        return Ok(DriverStatus {
            status: Status::empty(),
            pnum: 0,
            map: 0,
            file: None,
        });
    }
    let bytes = bytes.min(total_size - offset);

    let align = node.common().request_alignment as u64;
    let aligned_offset = align_down(offset, align);
    let aligned_bytes = round_up(offset + bytes, align) - aligned_offset;

    let mut ds = match node.drv_block_status(want_zero, aligned_offset, aligned_bytes) {
        Ok(mut ds) => {
            ds.pnum -= offset - aligned_offset;
            if ds.pnum > bytes {
                ds.pnum = bytes;
            }
            if ds.status.contains(Status::OFFSET_VALID) {
                ds.map += offset - aligned_offset;
            }
            ds
        }
        Err(e) if e.is_not_supported() => {
            // No mapping information: the bytes are data owned by this layer.
            DriverStatus {
                status: Status::DATA | Status::ALLOCATED,
                pnum: bytes,
                map: 0,
                file: None,
            }
        }
        Err(e) => return Err(e),
    };

    if ds.status.contains(Status::RAW) {
        let file = ds.file.clone();
        if let Some(file) = file {
            return block_status(&*file, want_zero, ds.map, ds.pnum);
        }
    }

    if ds.status.intersects(Status::DATA | Status::ZERO) {
        ds.status |= Status::ALLOCATED;
    } else if node.supports_backing() {
        match node.backing() {
            None => ds.status |= Status::ZERO,
            Some(cow) => {
                if want_zero {
                    if let Ok(size2) = getlength(cow.node()) {
                        if offset >= size2 {
                            ds.status |= Status::ZERO;
                        }
                    }
                }
            }
        }
    }

    if want_zero
        && ds.status.contains(Status::RECURSE)
        && ds.status.contains(Status::DATA)
        && !ds.status.contains(Status::ZERO)
        && ds.status.contains(Status::OFFSET_VALID)
    {
        if let Some(file) = ds.file.clone() {
            if !same_node(&*file, node) {
                if let Ok(ds2) = block_status(&*file, want_zero, ds.map, ds.pnum) {
                    if ds2.status.contains(Status::EOF)
                        && (ds2.pnum == 0 || ds2.status.contains(Status::ZERO))
                    {
                        ds.status |= Status::ZERO;
                    } else {
                        // Limit to the range the protocol layer reported.
                        ds.pnum = ds2.pnum;
                        ds.status |= ds2.status & Status::ZERO;
                    }
                }
            }
        }
    }

    if offset + ds.pnum == total_size {
        ds.status |= Status::EOF;
    }
    Ok(ds)
}

/// Status recursion from `bs` toward `base`: the first definitive answer
/// wins, unallocated regions fall through, a hole past the backing chain
/// reads as zero.
pub fn common_block_status_above(
    bs: &dyn BlockNode,
    base: Option<&dyn BlockNode>,
    include_base: bool,
    want_zero: bool,
    offset: u64,
    bytes: u64,
) -> BlockResult<DriverStatus> {
    let mut eof = 0u64;

    if !include_base && base.is_some_and(|b| same_node(bs, b)) {
        return Ok(DriverStatus {
            status: Status::empty(),
            pnum: bytes,
            map: 0,
            file: None,
        });
    }

    let mut ds = block_status(bs, want_zero, offset, bytes)?;
    if ds.pnum == 0
        || ds.status.contains(Status::ALLOCATED)
        || base.is_some_and(|b| same_node(bs, b))
    {
        return Ok(ds);
    }
    if ds.status.contains(Status::EOF) {
        eof = offset + ds.pnum;
    }

    let mut bytes = ds.pnum;
    let mut cur: &dyn BlockNode = bs;
    loop {
        let Some(backing) = cur.backing() else {
            break;
        };
        let p = backing.node();
        if !include_base && base.is_some_and(|b| same_node(p, b)) {
            break;
        }

        let next = block_status(p, want_zero, offset, bytes)?;
        if next.pnum == 0 {
            // Short backing file: beyond its end reads as zero.
            ds.status = Status::ZERO | Status::ALLOCATED;
            ds.pnum = bytes;
            ds.map = 0;
            ds.file = Some(backing.node_arc());
            break;
        }
        ds = next;
        if ds.status.contains(Status::ALLOCATED) {
            ds.status -= Status::EOF;
            break;
        }
        if base.is_some_and(|b| same_node(p, b)) {
            break;
        }
        bytes = ds.pnum;
        cur = p;
    }

    if offset + ds.pnum == eof {
        ds.status |= Status::EOF;
    }
    Ok(ds)
}

/// Public status query: recurse from `bs` through the chain above `base`.
pub fn block_status_above(
    bs: &dyn BlockNode,
    base: Option<&dyn BlockNode>,
    offset: u64,
    bytes: u64,
) -> BlockResult<DriverStatus> {
    common_block_status_above(bs, base, false, true, offset, bytes)
}

/// Whether `[offset, offset + bytes)` is answered by this layer; `pnum` is
/// the length of the uniform prefix.
pub fn is_allocated(node: &dyn BlockNode, offset: u64, bytes: u64) -> BlockResult<(bool, u64)> {
    let ds = common_block_status_above(node, Some(node), true, false, offset, bytes)?;
    Ok((ds.status.contains(Status::ALLOCATED), ds.pnum))
}

/// Cheap "does this whole range read as zero" probe.
pub fn is_zero_fast(node: &dyn BlockNode, offset: u64, bytes: u64) -> BlockResult<bool> {
    if bytes == 0 {
        return Ok(true);
    }
    let ds = common_block_status_above(node, None, false, false, offset, bytes)?;
    Ok(ds.pnum == bytes && ds.status.contains(Status::ZERO))
}

// === Discard ===

/// Discards aligned chunks through the driver. A no-op unless the image was
/// opened with `UNMAP`; drivers without discard support are tolerated.
pub fn pdiscard(child: &Child, offset: u64, bytes: u64) -> BlockResult {
    let node = child.node();
    if !node.common().open_flags.contains(OpenFlags::UNMAP) {
        return Ok(());
    }

    let request_align = node.common().request_alignment as u64;
    let align = request_align.max(node.common().pdiscard_alignment as u64);
    let mut head = offset % align;
    let mut tail = (offset + bytes) % align;

    let mut offset = offset;
    let mut bytes = bytes;
    while bytes > 0 {
        let mut num = bytes;
        if head > 0 {
            // Small requests until the first alignment boundary.
            num = bytes.min(align - head);
            if !is_aligned(num, request_align) {
                num %= request_align;
            }
            head = (head + num) % align;
        } else if tail > 0 {
            if num > align {
                num -= tail;
            } else if !is_aligned(tail, request_align) && tail > request_align {
                tail %= request_align;
                num -= tail;
            }
        }

        match node.drv_pdiscard(offset, num) {
            Ok(()) => {}
            Err(e) if e.is_not_supported() => {}
            Err(e) => return Err(e),
        }

        offset += num;
        bytes -= num;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_padding_aligned() {
        assert!(init_padding(512, 0, 512).is_none());
        assert!(init_padding(512, 1024, 2048).is_none());
    }

    #[test]
    fn test_init_padding_small_merged() {
        let pad = init_padding(512, 123, 14).unwrap();
        assert_eq!(pad.head, 123);
        assert_eq!(pad.tail, 512 - 137);
        assert_eq!(pad.buf.len(), 512);
        assert!(pad.merge_reads);
    }

    #[test]
    fn test_init_padding_two_slots() {
        let pad = init_padding(512, 500, 600).unwrap();
        assert_eq!(pad.head, 500);
        assert_eq!(pad.tail, 512 - ((500 + 600) % 512));
        assert_eq!(pad.buf.len(), 1024);
        assert!(!pad.merge_reads);
    }

    #[test]
    fn test_init_padding_head_only() {
        let pad = init_padding(512, 100, 412).unwrap();
        assert_eq!(pad.head, 100);
        assert_eq!(pad.tail, 0);
        assert_eq!(pad.buf.len(), 512);
        assert!(pad.merge_reads);
    }

    #[test]
    fn test_head_tail_mut_disjoint() {
        let mut pad = init_padding(512, 123, 14).unwrap();
        let (h, t) = pad.head_tail_mut();
        assert_eq!(h.len(), 123);
        assert_eq!(t.len(), 512 - 137);
    }

    #[test]
    fn test_round_to_clusters() {
        let (off, len) = round_to_clusters(65537, 2);
        assert_eq!(off, 65536);
        assert_eq!(len, 65536);
        let (off, len) = round_to_clusters(65536, 65537);
        assert_eq!(off, 65536);
        assert_eq!(len, 2 * 65536);
    }
}
