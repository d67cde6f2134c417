// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! VDI metadata with lock based synchronization.
//!
//! VdiMetadata keeps the header and the block map behind a single
//! upgradable RwLock. Lookups only need the shared lock and data I/O is done
//! by the caller once the lock is released, so reads and writes to already
//! allocated blocks proceed in parallel.
//!
//! Allocating a block is the only mutation. The allocator re-checks the
//! entry under the upgradable lock, which excludes every other allocator,
//! then upgrades to the exclusive lock to claim the next physical block and
//! write its full content. Two writers racing on the same unallocated block
//! therefore end up sharing a single physical block.

use std::cmp::min;

use log::{debug, error, warn};
use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};

use crate::bmap::{BlockMap, BmapEntry};
use crate::check::{self, CheckResult};
use crate::raw_file::RawFile;
use crate::vdi::{alloc_buffer, Result, VdiError};
use crate::vdi_header::VdiHeader;

/// Describes how to satisfy a read for a range within the image.
///
/// Returned by VdiMetadata::map_blocks_for_read. Adjacent blocks with the
/// same kind of backing are merged into one mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockMapping {
    /// The range has no physical block behind it and reads as zeros.
    Zero { length: u64 },

    /// The range is stored at the given byte offset of the image file.
    Allocated { offset: u64, length: u64 },
}

impl BlockMapping {
    pub fn length(&self) -> u64 {
        match self {
            BlockMapping::Zero { length } | BlockMapping::Allocated { length, .. } => *length,
        }
    }

    // Extends self with the next mapping if they are contiguous.
    fn merge(&mut self, next: &BlockMapping) -> bool {
        match (self, next) {
            (BlockMapping::Zero { length }, BlockMapping::Zero { length: next_len }) => {
                *length += next_len;
                true
            }
            (
                BlockMapping::Allocated { offset, length },
                BlockMapping::Allocated {
                    offset: next_offset,
                    length: next_len,
                },
            ) if *offset + *length == *next_offset => {
                *length += next_len;
                true
            }
            _ => false,
        }
    }
}

/// The metadata state, accessible only through the RwLock.
pub(crate) struct VdiState {
    pub(crate) header: VdiHeader,
    pub(crate) bmap: BlockMap,
    /// File used for header and block map updates.
    raw_file: RawFile,
}

impl VdiState {
    // The header goes first so the new allocation count is on disk before
    // the entry referencing it.
    fn persist_allocation(&self, logical: u32) -> Result<()> {
        self.header
            .write_to(&self.raw_file)
            .map_err(VdiError::WriteHeader)?;
        let (offset, sector) = self.bmap.sector_containing(logical);
        self.raw_file
            .write_all_at(&sector, u64::from(self.header.offset_bmap) + offset)
            .map_err(VdiError::WriteBlockMap)
    }
}

/// Shared VDI metadata protected by an upgradable RwLock.
///
/// One instance is shared via Arc between all handles of an open image.
/// Each handle owns its own RawFile clone for data I/O.
pub(crate) struct VdiMetadata {
    inner: RwLock<VdiState>,
    // Copies of immutable header fields, readable without the lock.
    block_size: u64,
    disk_size: u64,
}

impl VdiMetadata {
    pub(crate) fn new(header: VdiHeader, bmap: BlockMap, raw_file: RawFile) -> Self {
        VdiMetadata {
            block_size: u64::from(header.block_size),
            disk_size: header.disk_size,
            inner: RwLock::new(VdiState {
                header,
                bmap,
                raw_file,
            }),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    pub fn header(&self) -> VdiHeader {
        self.inner.read().header.clone()
    }

    /// Maps a guest range spanning any number of blocks under a single
    /// shared lock acquisition. The caller must have validated the range
    /// against the disk size.
    pub fn map_blocks_for_read(&self, address: u64, length: usize) -> Vec<BlockMapping> {
        let state = self.inner.read();
        let mut mappings: Vec<BlockMapping> = Vec::new();
        let mut mapped = 0usize;

        while mapped < length {
            let curr_addr = address + mapped as u64;
            let offset_in_block = curr_addr % self.block_size;
            let count = min(length - mapped, (self.block_size - offset_in_block) as usize);
            let logical = (curr_addr / self.block_size) as u32;

            let mapping = match state.bmap.get(logical) {
                BmapEntry::Allocated(index) => BlockMapping::Allocated {
                    offset: state.header.block_offset(index) + offset_in_block,
                    length: count as u64,
                },
                BmapEntry::Unallocated | BmapEntry::Discarded => BlockMapping::Zero {
                    length: count as u64,
                },
            };
            if !mappings.last_mut().is_some_and(|last| last.merge(&mapping)) {
                mappings.push(mapping);
            }
            mapped += count;
        }

        mappings
    }

    /// Writes `buf` at guest `address`, allocating the block on first use.
    ///
    /// The range must not cross a block boundary. A newly claimed block is
    /// written in full, zero padded around `buf`, before the header and the
    /// block map sector referencing it are persisted.
    pub fn write_block(&self, address: u64, buf: &[u8], data_file: &RawFile) -> Result<()> {
        let logical = (address / self.block_size) as u32;
        let offset_in_block = (address % self.block_size) as usize;

        let state = self.inner.read();
        if let BmapEntry::Allocated(index) = state.bmap.get(logical) {
            let offset = state.header.block_offset(index) + offset_in_block as u64;
            drop(state);
            return data_file
                .write_all_at(buf, offset)
                .map_err(VdiError::WriteData);
        }
        drop(state);

        let state = self.inner.upgradable_read();
        let previous = state.bmap.get(logical);
        if let BmapEntry::Allocated(index) = previous {
            // Another writer claimed the block since the lookup above.
            let offset = state.header.block_offset(index) + offset_in_block as u64;
            drop(state);
            return data_file
                .write_all_at(buf, offset)
                .map_err(VdiError::WriteData);
        }

        let index = state.header.blocks_allocated;
        if index >= state.header.blocks_in_image {
            return Err(VdiError::BlockMapExhausted(index));
        }

        let mut block = alloc_buffer(self.block_size as usize)?;
        block[offset_in_block..offset_in_block + buf.len()].copy_from_slice(buf);

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        state.header.blocks_allocated += 1;
        state.bmap.set(logical, BmapEntry::Allocated(index));
        let offset = state.header.block_offset(index);
        if let Err(e) = data_file.write_all_at(&block, offset) {
            error!("Failed writing new VDI block {index} for logical block {logical}: {e}");
            state.bmap.set(logical, previous);
            state.header.blocks_allocated -= 1;
            return Err(VdiError::WriteData(e));
        }
        debug!("Allocated VDI block {index} for logical block {logical}");

        // The data is in place, readers may use the mapping. Other
        // allocators stay out until the metadata is on disk.
        let state = RwLockWriteGuard::downgrade_to_upgradable(state);
        state.persist_allocation(logical)
    }

    #[cfg(test)]
    pub(crate) fn bmap_entry(&self, logical: u32) -> BmapEntry {
        self.inner.read().bmap.get(logical)
    }

    pub fn check(&self) -> Result<CheckResult> {
        let state = self.inner.read();
        check::check_block_map(&state.header, &state.bmap)
    }

    pub fn flush(&self) -> Result<()> {
        self.inner
            .read()
            .raw_file
            .sync_all()
            .map_err(VdiError::SyncFile)
    }
}

impl Drop for VdiMetadata {
    fn drop(&mut self) {
        if let Err(e) = self.inner.get_mut().raw_file.sync_all() {
            warn!("Failed to sync VDI image on close: {e}");
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use std::fs::OpenOptions;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::options::{CreateOptions, PreallocMode};
    use crate::vdi::Vdi;
    use crate::DEFAULT_BLOCK_SIZE;

    const BLOCK: u64 = DEFAULT_BLOCK_SIZE as u64;

    fn create_image(blocks: u64, preallocation: PreallocMode) -> (TempFile, Vdi) {
        let temp_file = TempFile::new().unwrap();
        let options = CreateOptions {
            preallocation,
            ..CreateOptions::new(blocks * BLOCK)
        };
        let vdi = Vdi::create(temp_file.as_file().try_clone().unwrap(), &options).unwrap();
        (temp_file, vdi)
    }

    #[test]
    fn test_map_blocks_for_read_merges() {
        let (_temp, vdi) = create_image(4, PreallocMode::Off);
        let metadata = vdi.metadata();

        assert_eq!(
            metadata.map_blocks_for_read(100, 3 * BLOCK as usize),
            vec![BlockMapping::Zero {
                length: 3 * BLOCK
            }]
        );

        vdi.write_at(&[1], BLOCK).unwrap();
        vdi.write_at(&[2], 2 * BLOCK).unwrap();
        let data_offset = u64::from(metadata.header().offset_data);
        // Logical blocks 1 and 2 got physical blocks 0 and 1, which are
        // contiguous in the file.
        assert_eq!(
            metadata.map_blocks_for_read(BLOCK - 10, 2 * BLOCK as usize),
            vec![
                BlockMapping::Zero { length: 10 },
                BlockMapping::Allocated {
                    offset: data_offset,
                    length: 2 * BLOCK - 10
                },
            ]
        );
    }

    #[test]
    fn test_map_static_image() {
        let (_temp, vdi) = create_image(3, PreallocMode::Metadata);
        let metadata = vdi.metadata();
        let data_offset = u64::from(metadata.header().offset_data);
        assert_eq!(
            metadata.map_blocks_for_read(512, 2 * BLOCK as usize),
            vec![BlockMapping::Allocated {
                offset: data_offset + 512,
                length: 2 * BLOCK
            }]
        );
    }

    #[test]
    fn test_failed_data_write_rolls_back() {
        let (temp, vdi) = create_image(2, PreallocMode::Off);
        let read_only = RawFile::new(
            OpenOptions::new()
                .read(true)
                .open(temp.as_path())
                .unwrap(),
        );

        let metadata = vdi.metadata();
        let err = metadata.write_block(0, &[0xaa; 16], &read_only).unwrap_err();
        assert!(matches!(err, VdiError::WriteData(_)));
        assert_eq!(metadata.header().blocks_allocated, 0);
        assert_eq!(
            metadata.map_blocks_for_read(0, 16),
            vec![BlockMapping::Zero { length: 16 }]
        );

        // The image is still usable.
        vdi.write_at(&[0xbb; 16], 0).unwrap();
        assert_eq!(metadata.header().blocks_allocated, 1);
    }

    #[test]
    fn test_allocation_persisted() {
        let (temp, vdi) = create_image(200, PreallocMode::Off);
        vdi.write_at(&[7; 4], 150 * BLOCK).unwrap();

        let raw = RawFile::new(temp.as_file().try_clone().unwrap());
        let header = VdiHeader::new(&raw).unwrap();
        assert_eq!(header.blocks_allocated, 1);

        let mut entry = [0u8; 4];
        raw.read_exact_at(&mut entry, u64::from(header.offset_bmap) + 150 * 4)
            .unwrap();
        assert_eq!(u32::from_le_bytes(entry), 0);
    }
}
