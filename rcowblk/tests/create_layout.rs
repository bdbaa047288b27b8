// SPDX-License-Identifier: MIT

//! Fresh-image layout: header fields, fixed metadata offsets and initial
//! refcounts, verified through raw file reads so the big-endian on-disk
//! encoding is what is actually checked.

use rcowblk::prelude::*;
use rcowblk::Header;
use rcowio::FileBackend;
use rcowio::be::{load_u16_be, load_u64_be};
use tempfile::TempDir;

const MIB: u64 = 1 << 20;
const CLUSTER: u64 = 65536;

fn path_str(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_str().unwrap().to_string()
}

#[test]
fn test_create_and_inspect() {
    let dir = TempDir::new().unwrap();
    let path = path_str(&dir, "t.qcow2");

    let opts = CreateOpts {
        size: MIB,
        enable_subcluster: true,
        ..Default::default()
    };
    create(&path, "qcow2", &opts).unwrap();

    let raw = FileBackend::create(&path).unwrap();
    let header: Header = raw.read_struct(0).unwrap();

    assert_eq!(header.magic.get(), 0x514649FB);
    assert_eq!(header.version.get(), 3);
    assert_eq!(header.cluster_bits.get(), 16);
    assert_eq!(header.size.get(), MIB);
    assert_eq!(header.refcount_order.get(), 4);
    assert_eq!(header.refcount_table_offset.get(), CLUSTER);
    assert_eq!(header.l1_table_offset.get(), 3 * CLUSTER);
    // Extended L2 doubles the L1 size: one 512 MiB span, twice.
    assert_eq!(header.l1_size.get(), 2);
    assert_eq!(header.incompatible_features.get() & (1 << 4), 1 << 4);

    // Refcount table: a single block at cluster 2.
    let mut reftable = [0u8; 16];
    raw.pread_at(CLUSTER, &mut reftable).unwrap();
    assert_eq!(load_u64_be(&reftable, 0), 2 * CLUSTER);
    assert_eq!(load_u64_be(&reftable, 1), 0);

    // The four metadata clusters hold one reference each; nothing else is
    // allocated.
    let mut refblock = [0u8; 16];
    raw.pread_at(2 * CLUSTER, &mut refblock).unwrap();
    for i in 0..4 {
        assert_eq!(load_u16_be(&refblock, i), 1, "cluster {i}");
    }
    for i in 4..8 {
        assert_eq!(load_u16_be(&refblock, i), 0, "cluster {i}");
    }

    // The magic is literally big-endian on disk.
    let mut magic = [0u8; 4];
    raw.pread_at(0, &mut magic).unwrap();
    assert_eq!(&magic, b"QFI\xfb");
}

#[test]
fn test_open_reports_virtual_size() {
    let dir = TempDir::new().unwrap();
    let path = path_str(&dir, "t.qcow2");
    create(&path, "qcow2", &CreateOpts::with_size(MIB)).unwrap();

    let child = open(&path, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap();
    assert_eq!(get_length(&child).unwrap(), MIB);
    close(&child);
}

#[test]
fn test_odd_size_rounds_to_sector() {
    let dir = TempDir::new().unwrap();
    let path = path_str(&dir, "t.qcow2");
    create(&path, "qcow2", &CreateOpts::with_size(1000)).unwrap();

    let child = open(&path, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap();
    assert_eq!(get_length(&child).unwrap(), 1024);
    close(&child);
}

#[test]
fn test_unknown_format_is_refused() {
    let dir = TempDir::new().unwrap();
    let path = path_str(&dir, "t.vmdk");
    assert!(matches!(
        create(&path, "vmdk", &CreateOpts::with_size(MIB)),
        Err(BlockError::UnknownFormat(_))
    ));
}

#[test]
fn test_corrupt_magic_is_refused() {
    let dir = TempDir::new().unwrap();
    let path = path_str(&dir, "t.qcow2");
    create(&path, "qcow2", &CreateOpts::with_size(MIB)).unwrap();

    let raw = FileBackend::create(&path).unwrap();
    raw.pwrite_at(0, b"XXXX").unwrap();

    assert!(matches!(
        open(&path, "qcow2", &OpenOpts::default(), OpenFlags::RDWR),
        Err(BlockError::CorruptImage(_))
    ));
}

#[test]
fn test_missing_parameters() {
    assert!(matches!(
        create("", "qcow2", &CreateOpts::with_size(MIB)),
        Err(BlockError::IncompleteParameters)
    ));
    let dir = TempDir::new().unwrap();
    let path = path_str(&dir, "t.qcow2");
    assert!(matches!(
        create(&path, "qcow2", &CreateOpts::default()),
        Err(BlockError::IncompleteParameters)
    ));
}
