// SPDX-License-Identifier: MIT

//! Zero-write semantics: reads-as-zero via subcluster bitmaps or the L2
//! zero flag, block-status reporting, and the bitmap consistency invariant.

use rcowblk::prelude::*;
use rcowblk::io::block_status_above;
use rcowio::FileBackend;
use rcowio::be::load_u64_be;
use tempfile::TempDir;

const MIB: u64 = 1 << 20;
const CLUSTER: u64 = 65536;

fn new_image(dir: &TempDir, subcluster: bool) -> (String, Child) {
    let path = dir.path().join("z.qcow2").to_str().unwrap().to_string();
    let opts = CreateOpts {
        size: MIB,
        enable_subcluster: subcluster,
        ..Default::default()
    };
    create(&path, "qcow2", &opts).unwrap();
    let child = open(&path, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap();
    (path, child)
}

#[test]
fn test_zero_write_reads_zero() {
    for subcluster in [false, true] {
        let dir = TempDir::new().unwrap();
        let (_, child) = new_image(&dir, subcluster);

        pwrite_zeroes(&child, 123, 14, ReqFlags::empty()).unwrap();

        let mut out = [0xFFu8; 14];
        pread(&child, 123, &mut out).unwrap();
        assert_eq!(out, [0u8; 14], "subcluster={subcluster}");

        close(&child);
    }
}

#[test]
fn test_zero_range_reports_zero_status() {
    let dir = TempDir::new().unwrap();
    let (_, child) = new_image(&dir, true);

    pwrite_zeroes(&child, 0, 4096, ReqFlags::empty()).unwrap();

    let ds = block_status_above(child.node(), None, 0, 4096).unwrap();
    assert!(ds.status.contains(Status::ZERO));
    assert_eq!(ds.pnum, 4096);

    close(&child);
}

#[test]
fn test_zero_write_over_data() {
    let dir = TempDir::new().unwrap();
    let (_, child) = new_image(&dir, true);

    pwrite(&child, 100, &[0xEE; 200], ReqFlags::empty()).unwrap();
    pwrite_zeroes(&child, 150, 50, ReqFlags::empty()).unwrap();

    let mut out = [0u8; 300];
    pread(&child, 0, &mut out).unwrap();
    assert!(out[..100].iter().all(|&b| b == 0));
    assert!(out[100..150].iter().all(|&b| b == 0xEE));
    assert!(out[150..200].iter().all(|&b| b == 0));
    assert!(out[200..300].iter().all(|&b| b == 0xEE));

    close(&child);
}

#[test]
fn test_whole_cluster_zero_keeps_mapping_without_unmap() {
    let dir = TempDir::new().unwrap();
    let (path, child) = new_image(&dir, false);

    pwrite(&child, 0, &[0xAB; 65536], ReqFlags::empty()).unwrap();
    pwrite_zeroes(&child, 0, CLUSTER, ReqFlags::empty()).unwrap();

    let mut out = vec![0xFFu8; 65536];
    pread(&child, 0, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0));
    close(&child);

    // The L2 entry keeps its host offset but gained the zero flag.
    let raw = FileBackend::create(&path).unwrap();
    let mut l1 = [0u8; 8];
    raw.pread_at(3 * CLUSTER, &mut l1).unwrap();
    let l2_offset = load_u64_be(&l1, 0) & 0x00ff_ffff_ffff_fe00;
    let mut l2 = [0u8; 8];
    raw.pread_at(l2_offset, &mut l2).unwrap();
    let entry = load_u64_be(&l2, 0);
    assert_eq!(entry & 1, 1, "zero flag set");
    assert_ne!(entry & 0x00ff_ffff_ffff_fe00, 0, "mapping kept");
}

#[test]
fn test_subcluster_bitmap_invariant_after_writes() {
    let dir = TempDir::new().unwrap();
    let (path, child) = new_image(&dir, true);

    pwrite(&child, 123, &[1; 14], ReqFlags::empty()).unwrap();
    pwrite_zeroes(&child, 4096, 2048, ReqFlags::empty()).unwrap();
    pwrite(&child, 70_000, &[2; 10_000], ReqFlags::empty()).unwrap();
    close(&child);

    // For every extended L2 entry: a subcluster is never both allocated
    // and zero.
    let raw = FileBackend::create(&path).unwrap();
    let mut l1 = [0u8; 16];
    raw.pread_at(3 * CLUSTER, &mut l1).unwrap();
    for i in 0..2 {
        let l2_offset = load_u64_be(&l1, i) & 0x00ff_ffff_ffff_fe00;
        if l2_offset == 0 {
            continue;
        }
        let mut l2 = vec![0u8; CLUSTER as usize];
        raw.pread_at(l2_offset, &mut l2).unwrap();
        for e in 0..4096 {
            let bitmap = load_u64_be(&l2, e * 2 + 1);
            assert_eq!(
                (bitmap >> 32) & bitmap,
                0,
                "entry {e} has a subcluster both allocated and zero"
            );
        }
    }
}
