// SPDX-License-Identifier: MIT

//! Requests that decompose into several runs: mixing already-allocated and
//! fresh clusters forces the write planner to emit multiple pieces, which
//! exercises the background task path.

use rcowblk::prelude::*;
use tempfile::TempDir;

const MIB: u64 = 1 << 20;
const CLUSTER: u64 = 65536;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(17).wrapping_add(seed)).collect()
}

#[test]
fn test_write_across_alloc_and_copied_boundaries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.qcow2").to_str().unwrap().to_string();
    create(&path, "qcow2", &CreateOpts::with_size(8 * MIB)).unwrap();
    let child = open(&path, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap();

    // Pre-allocate the middle cluster, leaving its neighbours untouched.
    let middle = pattern(CLUSTER as usize, 1);
    pwrite(&child, CLUSTER, &middle, ReqFlags::empty()).unwrap();

    // One request over clusters 0..3: fresh, copied, fresh. The planner
    // cannot express that as a single contiguous allocation.
    let data = pattern(3 * CLUSTER as usize, 2);
    pwrite(&child, 0, &data, ReqFlags::empty()).unwrap();

    let mut out = vec![0u8; data.len()];
    pread(&child, 0, &mut out).unwrap();
    assert_eq!(out, data);

    close(&child);
}

#[test]
fn test_read_across_mixed_mappings() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.qcow2").to_str().unwrap().to_string();
    let opts = CreateOpts {
        size: 8 * MIB,
        enable_subcluster: true,
        ..Default::default()
    };
    create(&path, "qcow2", &opts).unwrap();
    let child = open(&path, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap();

    // Alternating allocated and hole clusters.
    let a = pattern(CLUSTER as usize, 3);
    let c = pattern(CLUSTER as usize, 4);
    pwrite(&child, 0, &a, ReqFlags::empty()).unwrap();
    pwrite(&child, 2 * CLUSTER, &c, ReqFlags::empty()).unwrap();

    // One read across data, hole, data.
    let mut out = vec![0u8; 3 * CLUSTER as usize];
    pread(&child, 0, &mut out).unwrap();
    assert_eq!(&out[..CLUSTER as usize], &a[..]);
    assert!(out[CLUSTER as usize..2 * CLUSTER as usize].iter().all(|&b| b == 0));
    assert_eq!(&out[2 * CLUSTER as usize..], &c[..]);

    close(&child);
}

#[test]
fn test_reads_past_virtual_size_tail_zeroed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.qcow2").to_str().unwrap().to_string();
    create(&path, "qcow2", &CreateOpts::with_size(MIB)).unwrap();
    let child = open(&path, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap();

    // Nothing written: the very last bytes still read as zero.
    let mut out = [0xAAu8; 64];
    pread(&child, MIB - 64, &mut out).unwrap();
    assert_eq!(out, [0u8; 64]);

    close(&child);
}
