// SPDX-License-Identifier: MIT

//! Backing chains: read-through, overlay override, and base immutability.

use rcowblk::prelude::*;
use tempfile::TempDir;

const MIB: u64 = 1 << 20;

fn create_image(path: &str, backing: Option<&str>) {
    let opts = CreateOpts {
        size: MIB,
        backing: backing.map(|s| s.to_string()),
        enable_subcluster: true,
        ..Default::default()
    };
    create(path, "qcow2", &opts).unwrap();
}

fn open_rw(path: &str) -> Child {
    open(path, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap()
}

fn read_vec(child: &Child, offset: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    pread(child, offset, &mut buf).unwrap();
    buf
}

#[test]
fn test_backing_read_through_and_override() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("base.qcow2").to_str().unwrap().to_string();
    let overlay = dir.path().join("overlay.qcow2").to_str().unwrap().to_string();
    let overlay2 = dir.path().join("overlay2.qcow2").to_str().unwrap().to_string();

    // Base with some data.
    create_image(&base, None);
    let child = open_rw(&base);
    pwrite(&child, 123, b"this is a test", ReqFlags::empty()).unwrap();
    close(&child);

    // Overlay sees the base bytes where it has none of its own.
    create_image(&overlay, Some(&base));
    let child = open_rw(&overlay);
    assert_eq!(read_vec(&child, 123, 14), b"this is a test");

    // Writes land in the overlay only.
    pwrite(&child, 123, b"this is the first overlay test", ReqFlags::empty()).unwrap();
    pwrite(&child, 456, b"this is the first overlay test2", ReqFlags::empty()).unwrap();
    close(&child);

    // Second level: newest data wins, untouched ranges fall through one
    // level at a time.
    create_image(&overlay2, Some(&overlay));
    let child = open_rw(&overlay2);
    pwrite(&child, 123, b"this is the second overlay test", ReqFlags::empty()).unwrap();
    assert_eq!(read_vec(&child, 123, 31), b"this is the second overlay test");
    assert_eq!(read_vec(&child, 456, 31), b"this is the first overlay test2");
    close(&child);

    // The base file never changed.
    let child = open_rw(&base);
    assert_eq!(read_vec(&child, 123, 14), b"this is a test");
    assert_eq!(read_vec(&child, 456, 31), vec![0u8; 31]);
    close(&child);
}

#[test]
fn test_cow_preserves_backing_bytes_around_write() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("base.qcow2").to_str().unwrap().to_string();
    let overlay = dir.path().join("overlay.qcow2").to_str().unwrap().to_string();

    create_image(&base, None);
    let child = open_rw(&base);
    let block: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
    pwrite(&child, 0, &block, ReqFlags::empty()).unwrap();
    close(&child);

    create_image(&overlay, Some(&base));
    let child = open_rw(&overlay);

    // A write inside the backed range must pull the surrounding bytes into
    // the overlay's fresh cluster.
    pwrite(&child, 1000, b"OVERLAY", ReqFlags::empty()).unwrap();

    let out = read_vec(&child, 0, 4096);
    assert_eq!(&out[..1000], &block[..1000]);
    assert_eq!(&out[1000..1007], b"OVERLAY");
    assert_eq!(&out[1007..], &block[1007..]);

    close(&child);
}

#[test]
fn test_backing_shorter_than_overlay_reads_zero() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("base.qcow2").to_str().unwrap().to_string();
    let overlay = dir.path().join("overlay.qcow2").to_str().unwrap().to_string();

    let opts = CreateOpts {
        size: MIB / 2,
        enable_subcluster: true,
        ..Default::default()
    };
    create(&base, "qcow2", &opts).unwrap();

    let opts = CreateOpts {
        size: MIB,
        backing: Some(base.clone()),
        enable_subcluster: true,
        ..Default::default()
    };
    create(&overlay, "qcow2", &opts).unwrap();

    let child = open_rw(&overlay);
    // Past the backing image's end: a hole that reads as zero.
    assert_eq!(read_vec(&child, MIB / 2 + 100, 64), vec![0u8; 64]);
    close(&child);
}
