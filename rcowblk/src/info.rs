// SPDX-License-Identifier: MIT

//! The `info` report: image geometry, backing chain and (on request) a
//! refcount-table occupancy breakdown, serialized as JSON.

use serde::Serialize;

use crate::cache::CacheKind;
use crate::consts::REFT_OFFSET_MASK;
use crate::error::{BlockError, BlockResult};
use crate::flags::IncompatFeatures;
use crate::node::BlockNode;
use crate::qcow2::Qcow2;

#[derive(Debug, Default, Serialize)]
pub struct BlockStatistic {
    #[serde(rename = "total blocks")]
    pub total_blocks: u64,
    #[serde(rename = "head blocks")]
    pub head_blocks: u64,
    #[serde(rename = "l1 blocks")]
    pub l1_blocks: u64,
    #[serde(rename = "refcount table blocks")]
    pub refcount_table_blocks: u64,
    #[serde(rename = "l2 blocks")]
    pub l2_blocks: u64,
    #[serde(rename = "refcount blocks")]
    pub refcount_blocks: u64,
    #[serde(rename = "data blocks")]
    pub data_blocks: u64,
}

#[derive(Debug, Serialize)]
pub struct BlockInfo {
    #[serde(rename = "file format")]
    pub file_format: &'static str,
    #[serde(rename = "virtual size")]
    pub virtual_size: u64,
    #[serde(rename = "disk size")]
    pub disk_size: u64,
    #[serde(rename = "cluster size")]
    pub cluster_size: u64,
    #[serde(rename = "refcount bits")]
    pub refcount_bits: u32,
    #[serde(rename = "extended l2")]
    pub extended_l2: bool,
    #[serde(rename = "backing chain")]
    pub backing_chain: Vec<String>,
    #[serde(rename = "data file", skip_serializing_if = "Option::is_none")]
    pub data_file: Option<String>,
    #[serde(rename = "stat", skip_serializing_if = "Option::is_none")]
    pub statistic: Option<BlockStatistic>,
}

/// Counts occupied clusters per role by walking the refcount structure and
/// the L1 table.
fn scan_refcount_table(image: &Qcow2) -> BlockResult<BlockStatistic> {
    let mut stat = BlockStatistic::default();
    let l = *image.layout();
    let mut st = image.lock();

    for table_index in 0..st.refcount_table.len() {
        let block_offset = st.refcount_table[table_index] & REFT_OFFSET_MASK;
        if block_offset == 0 {
            continue;
        }
        let slot = st.caches.get(&image.file, CacheKind::Refblock, block_offset)?;
        let table = st.caches.table(CacheKind::Refblock, slot);
        for i in 0..l.refcount_block_size as usize {
            if rcowio::be::load_u16_be(table, i) > 0 {
                stat.total_blocks += 1;
            }
        }
        st.caches.put(CacheKind::Refblock, slot);
        stat.refcount_blocks += 1;
    }

    stat.refcount_table_blocks = 1;
    stat.head_blocks = 1;
    stat.l1_blocks = 1;

    for entry in &st.l1_table {
        if entry & crate::consts::L1E_OFFSET_MASK > 0 {
            stat.l2_blocks += 1;
        }
    }

    stat.data_blocks = stat
        .total_blocks
        .saturating_sub(stat.head_blocks)
        .saturating_sub(stat.l1_blocks)
        .saturating_sub(stat.refcount_table_blocks)
        .saturating_sub(stat.refcount_blocks)
        .saturating_sub(stat.l2_blocks);
    Ok(stat)
}

fn backing_chain(image: &Qcow2, chain: &mut Vec<String>) {
    let mut current = image.backing_child();
    while let Some(child) = current {
        chain.push(child.node().common().filename.clone());
        current = child.node().backing();
    }
}

pub(crate) fn image_info(image: &Qcow2, detail: bool, pretty: bool) -> BlockResult<String> {
    let l = image.layout();

    let mut info = BlockInfo {
        file_format: "qcow2",
        virtual_size: image.virtual_size(),
        disk_size: crate::io::getlength(image.file.node()).unwrap_or(0),
        cluster_size: l.cluster_size,
        refcount_bits: 16,
        extended_l2: image.incompat().contains(IncompatFeatures::EXTL2),
        backing_chain: Vec::new(),
        data_file: None,
        statistic: None,
    };

    backing_chain(image, &mut info.backing_chain);
    if image.has_data_file() {
        info.data_file = Some(image.payload().node().common().filename.clone());
    }
    if detail {
        info.statistic = Some(scan_refcount_table(image)?);
    }

    let rendered = if pretty {
        serde_json::to_string_pretty(&info)
    } else {
        serde_json::to_string(&info)
    };
    rendered.map_err(|_| BlockError::InvalidArgument)
}
