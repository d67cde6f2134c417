// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Consistency check of the block map.
//!
//! The allocated entries of the block map must reference every physical
//! block in `[0, blocks_allocated)` exactly once. The check only reports
//! what it finds, images are never modified.

use std::fmt::{Display, Formatter, Result as FmtResult};

use log::error;
use serde::Serialize;

use crate::bmap::{BlockMap, BmapEntry};
use crate::vdi::{Result, VdiError};
use crate::vdi_header::VdiHeader;

/// A single inconsistency found in the block map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Corruption {
    /// The entry points past the last block of the image.
    IndexOutOfRange { logical: u32, physical: u32 },
    /// The physical block is already referenced by an earlier entry.
    DuplicateBlock { logical: u32, physical: u32 },
    /// The header count differs from the number of referenced blocks.
    AllocatedCountMismatch { counted: u32, recorded: u32 },
}

impl Display for Corruption {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Corruption::IndexOutOfRange { logical, physical } => write!(
                f,
                "block {logical} references physical block {physical} out of range"
            ),
            Corruption::DuplicateBlock { logical, physical } => write!(
                f,
                "block {logical} references physical block {physical} already in use"
            ),
            Corruption::AllocatedCountMismatch { counted, recorded } => write!(
                f,
                "{counted} blocks in use but header records {recorded}"
            ),
        }
    }
}

/// Outcome of a consistency check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub corruptions: Vec<Corruption>,
    /// Distinct physical blocks referenced by the block map.
    pub allocated_blocks: u32,
    pub blocks_in_image: u32,
    /// End of the data region according to the header.
    pub image_end_offset: u64,
}

impl CheckResult {
    pub fn is_clean(&self) -> bool {
        self.corruptions.is_empty()
    }
}

pub(crate) fn check_block_map(header: &VdiHeader, bmap: &BlockMap) -> Result<CheckResult> {
    let blocks = header.blocks_in_image as usize;
    let mut in_use = Vec::new();
    in_use
        .try_reserve_exact(blocks)
        .map_err(|e| VdiError::AllocateBuffer(blocks, e))?;
    in_use.resize(blocks, false);

    let mut result = CheckResult {
        blocks_in_image: header.blocks_in_image,
        image_end_offset: header.image_end_offset(),
        ..Default::default()
    };

    for (logical, entry) in bmap.iter().enumerate() {
        let BmapEntry::Allocated(physical) = entry else {
            continue;
        };
        let logical = logical as u32;
        let corruption = match in_use.get_mut(physical as usize) {
            None => Corruption::IndexOutOfRange { logical, physical },
            Some(true) => Corruption::DuplicateBlock { logical, physical },
            Some(slot) => {
                *slot = true;
                result.allocated_blocks += 1;
                continue;
            }
        };
        error!("VDI block map corrupted: {corruption}");
        result.corruptions.push(corruption);
    }

    if result.allocated_blocks != header.blocks_allocated {
        let corruption = Corruption::AllocatedCountMismatch {
            counted: result.allocated_blocks,
            recorded: header.blocks_allocated,
        };
        error!("VDI block map corrupted: {corruption}");
        result.corruptions.push(corruption);
    }

    Ok(result)
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::vdi_header::{ImageType, DEFAULT_BLOCK_SIZE};

    fn header(blocks: u32, allocated: u32) -> VdiHeader {
        let mut header = VdiHeader::create_for_size(
            u64::from(blocks) * u64::from(DEFAULT_BLOCK_SIZE),
            DEFAULT_BLOCK_SIZE,
            ImageType::Dynamic,
        );
        header.blocks_allocated = allocated;
        header
    }

    fn bmap(entries: &[BmapEntry]) -> BlockMap {
        let mut bmap = BlockMap::unallocated(entries.len() as u32).unwrap();
        for (logical, entry) in entries.iter().enumerate() {
            bmap.set(logical as u32, *entry);
        }
        bmap
    }

    #[test]
    fn test_clean_map() {
        let bmap = bmap(&[
            BmapEntry::Allocated(1),
            BmapEntry::Unallocated,
            BmapEntry::Discarded,
            BmapEntry::Allocated(0),
        ]);
        let result = check_block_map(&header(4, 2), &bmap).unwrap();
        assert!(result.is_clean());
        assert_eq!(result.allocated_blocks, 2);
        assert_eq!(result.blocks_in_image, 4);
        assert_eq!(result.image_end_offset, 1024 + 2 * u64::from(DEFAULT_BLOCK_SIZE));
    }

    #[test]
    fn test_duplicate_block() {
        let bmap = bmap(&[
            BmapEntry::Allocated(0),
            BmapEntry::Allocated(0),
            BmapEntry::Unallocated,
        ]);
        let result = check_block_map(&header(3, 2), &bmap).unwrap();
        assert_eq!(
            result.corruptions,
            vec![
                Corruption::DuplicateBlock {
                    logical: 1,
                    physical: 0
                },
                Corruption::AllocatedCountMismatch {
                    counted: 1,
                    recorded: 2
                },
            ]
        );
    }

    #[test]
    fn test_duplicate_with_matching_count() {
        let bmap = bmap(&[BmapEntry::Allocated(0), BmapEntry::Allocated(0)]);
        let result = check_block_map(&header(2, 1), &bmap).unwrap();
        assert_eq!(
            result.corruptions,
            vec![Corruption::DuplicateBlock {
                logical: 1,
                physical: 0
            }]
        );
    }

    #[test]
    fn test_index_out_of_range() {
        let bmap = bmap(&[BmapEntry::Allocated(0), BmapEntry::Allocated(2)]);
        let result = check_block_map(&header(2, 2), &bmap).unwrap();
        assert_eq!(
            result.corruptions,
            vec![
                Corruption::IndexOutOfRange {
                    logical: 1,
                    physical: 2
                },
                Corruption::AllocatedCountMismatch {
                    counted: 1,
                    recorded: 2
                },
            ]
        );
        assert!(!result.is_clean());
    }

    #[test]
    fn test_serialize_result() {
        let bmap = bmap(&[BmapEntry::Allocated(0), BmapEntry::Allocated(0)]);
        let result = check_block_map(&header(2, 1), &bmap).unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["corruptions"][0]["kind"], "duplicate_block");
        assert_eq!(json["corruptions"][0]["logical"], 1);
        assert_eq!(json["allocated_blocks"], 1);
    }
}
