// SPDX-License-Identifier: MIT

//! The JSON info report.

use rcowblk::prelude::*;
use tempfile::TempDir;

const MIB: u64 = 1 << 20;

#[test]
fn test_info_basics() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.qcow2").to_str().unwrap().to_string();
    let opts = CreateOpts {
        size: MIB,
        enable_subcluster: true,
        ..Default::default()
    };
    create(&path, "qcow2", &opts).unwrap();

    let child = open(&path, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap();
    let report = info(&child, false, false).unwrap();
    let v: serde_json::Value = serde_json::from_str(&report).unwrap();

    assert_eq!(v["file format"], "qcow2");
    assert_eq!(v["virtual size"], MIB);
    assert_eq!(v["cluster size"], 65536);
    assert_eq!(v["refcount bits"], 16);
    assert_eq!(v["extended l2"], true);
    assert!(v["stat"].is_null());

    close(&child);
}

#[test]
fn test_info_detail_counts_blocks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.qcow2").to_str().unwrap().to_string();
    create(&path, "qcow2", &CreateOpts::with_size(MIB)).unwrap();

    let child = open(&path, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap();
    pwrite(&child, 0, &[1u8; 100], ReqFlags::empty()).unwrap();

    let report = info(&child, true, true).unwrap();
    let v: serde_json::Value = serde_json::from_str(&report).unwrap();

    // header, reftable, refblock, L1, one L2 table, one data cluster.
    assert_eq!(v["stat"]["total blocks"], 6);
    assert_eq!(v["stat"]["l2 blocks"], 1);
    assert_eq!(v["stat"]["data blocks"], 1);

    close(&child);
}

#[test]
fn test_info_reports_backing_chain() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("base.qcow2").to_str().unwrap().to_string();
    let overlay = dir.path().join("overlay.qcow2").to_str().unwrap().to_string();

    create(&base, "qcow2", &CreateOpts::with_size(MIB)).unwrap();
    let opts = CreateOpts {
        size: MIB,
        backing: Some(base.clone()),
        ..Default::default()
    };
    create(&overlay, "qcow2", &opts).unwrap();

    let child = open(&overlay, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap();
    let report = info(&child, false, false).unwrap();
    let v: serde_json::Value = serde_json::from_str(&report).unwrap();

    let chain = v["backing chain"].as_array().unwrap();
    assert_eq!(chain.len(), 1);
    assert!(chain[0].as_str().unwrap().ends_with("base.qcow2"));

    close(&child);
}
