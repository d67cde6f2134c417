// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::TryReserveError;
use std::mem::size_of;

use byteorder::{ByteOrder, LittleEndian};
use remain::sorted;
use thiserror::Error;

use crate::SECTOR_SIZE;

// Block map entry values with no physical block behind them.
pub const VDI_UNALLOCATED: u32 = 0xffff_ffff;
pub const VDI_DISCARDED: u32 = 0xffff_fffe;

const ENTRY_SIZE: usize = size_of::<u32>();
const ENTRIES_PER_SECTOR: u32 = (SECTOR_SIZE as usize / ENTRY_SIZE) as u32;

#[sorted]
#[derive(Error, Debug)]
pub enum VdiBmapError {
    #[error("Failed to allocate memory for {0} block map entries")]
    Allocate(u32, #[source] TryReserveError),
    #[error("Block map holds {actual} bytes, {expected} needed")]
    ShortBlockMap { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, VdiBmapError>;

/// Size in bytes of the on-disk block map for `blocks` entries.
pub(crate) fn bmap_size(blocks: u32) -> u64 {
    (u64::from(blocks) * ENTRY_SIZE as u64).next_multiple_of(SECTOR_SIZE)
}

/// Decoded value of a block map entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BmapEntry {
    /// Index of the physical block backing the logical block.
    Allocated(u32),
    /// Never written, reads as zeros.
    Unallocated,
    /// Discarded, reads as zeros.
    Discarded,
}

impl BmapEntry {
    pub fn is_allocated(self) -> bool {
        matches!(self, BmapEntry::Allocated(_))
    }
}

impl From<u32> for BmapEntry {
    fn from(value: u32) -> Self {
        match value {
            VDI_UNALLOCATED => BmapEntry::Unallocated,
            VDI_DISCARDED => BmapEntry::Discarded,
            index => BmapEntry::Allocated(index),
        }
    }
}

impl From<BmapEntry> for u32 {
    fn from(entry: BmapEntry) -> Self {
        match entry {
            BmapEntry::Allocated(index) => index,
            BmapEntry::Unallocated => VDI_UNALLOCATED,
            BmapEntry::Discarded => VDI_DISCARDED,
        }
    }
}

fn alloc_entries(blocks: u32) -> Result<Vec<u32>> {
    let mut entries = Vec::new();
    entries
        .try_reserve_exact(blocks as usize)
        .map_err(|e| VdiBmapError::Allocate(blocks, e))?;
    Ok(entries)
}

/// In memory block map, one raw entry per logical block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMap {
    entries: Vec<u32>,
}

impl BlockMap {
    /// Map of a dynamic image where nothing has been written yet.
    pub fn unallocated(blocks: u32) -> Result<Self> {
        let mut entries = alloc_entries(blocks)?;
        entries.resize(blocks as usize, VDI_UNALLOCATED);
        Ok(BlockMap { entries })
    }

    /// Map of a static image, logical block `i` lives in physical block `i`.
    pub fn identity(blocks: u32) -> Result<Self> {
        let mut entries = alloc_entries(blocks)?;
        entries.extend(0..blocks);
        Ok(BlockMap { entries })
    }

    /// Decodes `blocks` little endian entries from the start of `buf`.
    /// Trailing padding is ignored.
    pub fn load(buf: &[u8], blocks: u32) -> Result<Self> {
        let expected = blocks as usize * ENTRY_SIZE;
        if buf.len() < expected {
            return Err(VdiBmapError::ShortBlockMap {
                expected,
                actual: buf.len(),
            });
        }

        let mut entries = alloc_entries(blocks)?;
        entries.extend(
            buf[..expected]
                .chunks_exact(ENTRY_SIZE)
                .map(LittleEndian::read_u32),
        );
        Ok(BlockMap { entries })
    }

    /// Encodes the whole map, zero padded to a sector boundary.
    pub fn store(&self) -> Result<Vec<u8>> {
        let size = bmap_size(self.len()) as usize;
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|e| VdiBmapError::Allocate(self.len(), e))?;
        buf.resize(size, 0);
        LittleEndian::write_u32_into(&self.entries, &mut buf[..self.entries.len() * ENTRY_SIZE]);
        Ok(buf)
    }

    /// Encodes the sector of the map holding entry `logical`. Returns the
    /// byte offset of that sector from the start of the map and its content.
    pub fn sector_containing(&self, logical: u32) -> (u64, [u8; SECTOR_SIZE as usize]) {
        let first = (logical / ENTRIES_PER_SECTOR * ENTRIES_PER_SECTOR) as usize;
        let last = (first + ENTRIES_PER_SECTOR as usize).min(self.entries.len());
        let mut sector = [0u8; SECTOR_SIZE as usize];
        LittleEndian::write_u32_into(
            &self.entries[first..last],
            &mut sector[..(last - first) * ENTRY_SIZE],
        );
        ((first * ENTRY_SIZE) as u64, sector)
    }

    pub fn get(&self, logical: u32) -> BmapEntry {
        BmapEntry::from(self.entries[logical as usize])
    }

    pub fn set(&mut self, logical: u32, entry: BmapEntry) {
        self.entries[logical as usize] = u32::from(entry);
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn iter(&self) -> impl Iterator<Item = BmapEntry> + '_ {
        self.entries.iter().map(|&e| BmapEntry::from(e))
    }
}
