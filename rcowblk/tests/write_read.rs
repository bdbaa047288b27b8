// SPDX-License-Identifier: MIT

//! Write/read round-trips: arbitrary offsets, partial overwrites, requests
//! spanning several clusters, and persistence across reopen.

use rcowblk::prelude::*;
use tempfile::TempDir;

const MIB: u64 = 1 << 20;

fn new_image(dir: &TempDir, name: &str, size: u64, subcluster: bool) -> (String, Child) {
    let path = dir.path().join(name).to_str().unwrap().to_string();
    let opts = CreateOpts {
        size,
        enable_subcluster: subcluster,
        ..Default::default()
    };
    create(&path, "qcow2", &opts).unwrap();
    let child = open(&path, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap();
    (path, child)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn test_small_write_read() {
    let dir = TempDir::new().unwrap();
    let (_, child) = new_image(&dir, "t.qcow2", MIB, true);

    let data = b"this is a test";
    pwrite(&child, 123, data, ReqFlags::empty()).unwrap();

    let mut out = [0u8; 14];
    pread(&child, 123, &mut out).unwrap();
    assert_eq!(&out, data);

    // Bytes around the write read as zero.
    let mut around = [0xFFu8; 200];
    pread(&child, 0, &mut around).unwrap();
    assert!(around[..123].iter().all(|&b| b == 0));
    assert_eq!(&around[123..137], data);
    assert!(around[137..].iter().all(|&b| b == 0));

    close(&child);
}

#[test]
fn test_round_trip_survives_reopen() {
    for subcluster in [false, true] {
        let dir = TempDir::new().unwrap();
        let (path, child) = new_image(&dir, "t.qcow2", 4 * MIB, subcluster);

        let data = pattern(200_000, 7);
        pwrite(&child, 50_000, &data, ReqFlags::empty()).unwrap();
        close(&child);

        let child = open(&path, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap();
        let mut out = vec![0u8; data.len()];
        pread(&child, 50_000, &mut out).unwrap();
        assert_eq!(out, data, "subcluster={subcluster}");
        close(&child);
    }
}

#[test]
fn test_partial_overwrite_of_allocated_cluster() {
    let dir = TempDir::new().unwrap();
    let (_, child) = new_image(&dir, "t.qcow2", MIB, true);

    let base = pattern(65536, 1);
    pwrite(&child, 0, &base, ReqFlags::empty()).unwrap();

    let patch = pattern(100, 2);
    pwrite(&child, 1000, &patch, ReqFlags::empty()).unwrap();

    let mut out = vec![0u8; 65536];
    pread(&child, 0, &mut out).unwrap();
    assert_eq!(&out[..1000], &base[..1000]);
    assert_eq!(&out[1000..1100], &patch[..]);
    assert_eq!(&out[1100..], &base[1100..]);

    close(&child);
}

#[test]
fn test_write_spanning_clusters_misaligned() {
    let dir = TempDir::new().unwrap();
    let (_, child) = new_image(&dir, "t.qcow2", 4 * MIB, true);

    // Three clusters and both misaligned edges.
    let data = pattern(3 * 65536 + 777, 9);
    pwrite(&child, 65536 - 333, &data, ReqFlags::empty()).unwrap();

    let mut out = vec![0u8; data.len()];
    pread(&child, 65536 - 333, &mut out).unwrap();
    assert_eq!(out, data);

    close(&child);
}

#[test]
fn test_fua_write() {
    let dir = TempDir::new().unwrap();
    let (_, child) = new_image(&dir, "t.qcow2", MIB, false);

    pwrite(&child, 4096, b"durable", ReqFlags::FUA).unwrap();
    let mut out = [0u8; 7];
    pread(&child, 4096, &mut out).unwrap();
    assert_eq!(&out, b"durable");

    close(&child);
}

#[test]
fn test_read_only_handle_rejects_writes() {
    let dir = TempDir::new().unwrap();
    let (path, child) = new_image(&dir, "t.qcow2", MIB, true);
    pwrite(&child, 0, b"seed", ReqFlags::empty()).unwrap();
    close(&child);

    let child = open(&path, "qcow2", &OpenOpts::default(), OpenFlags::empty()).unwrap();
    assert!(matches!(
        pwrite(&child, 0, b"nope", ReqFlags::empty()),
        Err(BlockError::PermissionDenied(_))
    ));
    let mut out = [0u8; 4];
    pread(&child, 0, &mut out).unwrap();
    assert_eq!(&out, b"seed");
    close(&child);
}

#[test]
fn test_small_l2_cache_still_works() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.qcow2").to_str().unwrap().to_string();
    create(&path, "qcow2", &CreateOpts::with_size(4 * MIB)).unwrap();

    let opts = OpenOpts {
        l2_cache_size: Some(65536),
    };
    let child = open(&path, "qcow2", &opts, OpenFlags::RDWR).unwrap();

    let data = pattern(70_000, 3);
    pwrite(&child, 123_456, &data, ReqFlags::empty()).unwrap();
    let mut out = vec![0u8; data.len()];
    pread(&child, 123_456, &mut out).unwrap();
    assert_eq!(out, data);

    close(&child);
}
