// SPDX-License-Identifier: MIT

//! External data files: payload bytes live at identity offsets in the data
//! file, the image itself carries only metadata.

use rcowblk::prelude::*;
use rcowio::FileBackend;
use tempfile::TempDir;

const MIB: u64 = 1 << 20;

#[test]
fn test_payload_goes_to_data_file() {
    let dir = TempDir::new().unwrap();
    let img = dir.path().join("t.qcow2").to_str().unwrap().to_string();
    let data = dir.path().join("t.img").to_str().unwrap().to_string();

    let opts = CreateOpts {
        size: MIB,
        data_file: Some(data.clone()),
        ..Default::default()
    };
    create(&img, "qcow2", &opts).unwrap();

    let child = open(&img, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap();
    pwrite(&child, 123, b"this is a test", ReqFlags::empty()).unwrap();

    let mut out = [0u8; 14];
    pread(&child, 123, &mut out).unwrap();
    assert_eq!(&out, b"this is a test");
    close(&child);

    // The payload sits at the guest offset of the data file itself.
    let raw = FileBackend::create(&data).unwrap();
    let mut direct = [0u8; 14];
    raw.pread_at(123, &mut direct).unwrap();
    assert_eq!(&direct, b"this is a test");

    // The metadata file holds no payload bytes anywhere.
    let meta = FileBackend::create(&img).unwrap();
    let len = meta.len().unwrap() as usize;
    let mut contents = vec![0u8; len];
    meta.pread_at(0, &mut contents).unwrap();
    assert!(
        !contents
            .windows(14)
            .any(|w| w == b"this is a test"),
        "payload leaked into the metadata file"
    );
}

#[test]
fn test_data_file_round_trip_after_reopen() {
    let dir = TempDir::new().unwrap();
    let img = dir.path().join("t.qcow2").to_str().unwrap().to_string();
    let data = dir.path().join("t.img").to_str().unwrap().to_string();

    let opts = CreateOpts {
        size: MIB,
        data_file: Some(data),
        ..Default::default()
    };
    create(&img, "qcow2", &opts).unwrap();

    let child = open(&img, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap();
    pwrite(&child, 70_000, &[0x42; 1000], ReqFlags::empty()).unwrap();
    close(&child);

    // The data-file path is recovered from the header extension.
    let child = open(&img, "qcow2", &OpenOpts::default(), OpenFlags::RDWR).unwrap();
    let mut out = [0u8; 1000];
    pread(&child, 70_000, &mut out).unwrap();
    assert_eq!(out, [0x42; 1000]);
    close(&child);
}
