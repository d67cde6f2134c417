// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::cmp::min;
use std::collections::TryReserveError;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use log::{debug, info};
use remain::sorted;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::bmap::{bmap_size, BlockMap, VdiBmapError};
use crate::check::CheckResult;
use crate::metadata::{BlockMapping, VdiMetadata};
use crate::options::CreateOptions;
use crate::raw_file::RawFile;
use crate::vdi_header::{
    block_size_supported, ImageType, VdiHeader, VdiHeaderError, MAX_BLOCKS_IN_IMAGE,
};
use crate::SECTOR_SIZE;

#[sorted]
#[derive(Error, Debug)]
pub enum VdiError {
    #[error("Failed to allocate a {0} byte buffer")]
    AllocateBuffer(usize, #[source] TryReserveError),
    #[error("Invalid block map")]
    BlockMap(#[source] VdiBmapError),
    #[error("No free block left, {0} blocks already allocated")]
    BlockMapExhausted(u32),
    #[error("Failed to clone the image file")]
    CloneFile(#[source] io::Error),
    #[error("Failed to get the image file size")]
    GetFileSize(#[source] io::Error),
    #[error("Image size {size} exceeds the maximum of {max} bytes")]
    ImageTooBig { size: u64, max: u64 },
    #[error("Unsupported block size {0}")]
    InvalidBlockSize(u32),
    #[error("Request of {length} bytes at offset {offset} exceeds the disk size {disk_size}")]
    InvalidOffset {
        offset: u64,
        length: usize,
        disk_size: u64,
    },
    #[error("Not a valid VDI image")]
    ParseHeader(#[source] VdiHeaderError),
    #[error("Failed to read the block map")]
    ReadBlockMap(#[source] io::Error),
    #[error("Failed to read data")]
    ReadData(#[source] io::Error),
    #[error("Repairing VDI images is not supported")]
    RepairUnsupported,
    #[error("Failed to set the image file size")]
    SetFileSize(#[source] io::Error),
    #[error("Failed to sync the image file")]
    SyncFile(#[source] io::Error),
    #[error("Failed to write the block map")]
    WriteBlockMap(#[source] io::Error),
    #[error("Failed to write data")]
    WriteData(#[source] io::Error),
    #[error("Failed to write the header")]
    WriteHeader(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, VdiError>;

/// Allocates a zeroed buffer, failing instead of aborting when memory is
/// short.
pub(crate) fn alloc_buffer(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| VdiError::AllocateBuffer(len, e))?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Summary of an open image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub virtual_size: u64,
    pub block_size: u32,
    pub blocks_in_image: u32,
    pub blocks_allocated: u32,
    pub image_type: ImageType,
    pub uuid: Uuid,
}

/// An open VDI image.
///
/// All methods take `&self`, an image can be shared between threads
/// through an `Arc`. [`Vdi::try_clone`] returns a handle with its own
/// file descriptor sharing the same metadata.
pub struct Vdi {
    metadata: Arc<VdiMetadata>,
    data_file: RawFile,
}

impl Vdi {
    /// Opens the image stored in `file`, loading its block map in memory.
    pub fn new(file: File) -> Result<Vdi> {
        let raw_file = RawFile::new(file);
        let header = VdiHeader::new(&raw_file).map_err(VdiError::ParseHeader)?;
        header.log();

        let mut buf = alloc_buffer(bmap_size(header.blocks_in_image) as usize)?;
        raw_file
            .read_exact_at(&mut buf, u64::from(header.offset_bmap))
            .map_err(VdiError::ReadBlockMap)?;
        let bmap = BlockMap::load(&buf, header.blocks_in_image).map_err(VdiError::BlockMap)?;
        debug!(
            "Loaded VDI block map, {} of {} blocks allocated",
            header.blocks_allocated, header.blocks_in_image
        );

        Self::from_parts(raw_file, header, bmap)
    }

    /// Formats `file` as a new image and opens it.
    ///
    /// The header goes first, then the block map. Static images have the
    /// file extended over the whole data region, which reads as zeros.
    pub fn create(file: File, options: &CreateOptions) -> Result<Vdi> {
        if !block_size_supported(options.block_size) {
            return Err(VdiError::InvalidBlockSize(options.block_size));
        }
        let max = u64::from(MAX_BLOCKS_IN_IMAGE) * u64::from(options.block_size);
        if options.size > max {
            return Err(VdiError::ImageTooBig {
                size: options.size,
                max,
            });
        }

        let disk_size = options.size.next_multiple_of(SECTOR_SIZE);
        let image_type = options.preallocation.image_type();
        let header = VdiHeader::create_for_size(disk_size, options.block_size, image_type);
        let bmap = match image_type {
            ImageType::Dynamic => BlockMap::unallocated(header.blocks_in_image),
            ImageType::Static => BlockMap::identity(header.blocks_in_image),
        }
        .map_err(VdiError::BlockMap)?;

        let raw_file = RawFile::new(file);
        header
            .write_to(&raw_file)
            .map_err(VdiError::WriteHeader)?;
        raw_file
            .write_all_at(
                &bmap.store().map_err(VdiError::BlockMap)?,
                u64::from(header.offset_bmap),
            )
            .map_err(VdiError::WriteBlockMap)?;
        raw_file
            .set_len(header.image_end_offset())
            .map_err(VdiError::SetFileSize)?;

        info!(
            "Created {} VDI image of {} bytes with {} blocks of {} bytes",
            image_type, disk_size, header.blocks_in_image, header.block_size
        );

        Self::from_parts(raw_file, header, bmap)
    }

    fn from_parts(raw_file: RawFile, header: VdiHeader, bmap: BlockMap) -> Result<Vdi> {
        let data_file = raw_file.try_clone().map_err(VdiError::CloneFile)?;
        Ok(Vdi {
            metadata: Arc::new(VdiMetadata::new(header, bmap, raw_file)),
            data_file,
        })
    }

    /// Returns a new handle on the same image with its own file descriptor.
    pub fn try_clone(&self) -> Result<Vdi> {
        Ok(Vdi {
            metadata: Arc::clone(&self.metadata),
            data_file: self.data_file.try_clone().map_err(VdiError::CloneFile)?,
        })
    }

    fn check_range(&self, offset: u64, length: usize) -> Result<()> {
        let disk_size = self.metadata.disk_size();
        match offset.checked_add(length as u64) {
            Some(end) if end <= disk_size => Ok(()),
            _ => Err(VdiError::InvalidOffset {
                offset,
                length,
                disk_size,
            }),
        }
    }

    /// Fills `buf` with the image content at `offset`. Ranges that were
    /// never written read as zeros.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.check_range(offset, buf.len())?;

        let mut pos = 0usize;
        for mapping in self.metadata.map_blocks_for_read(offset, buf.len()) {
            let length = mapping.length() as usize;
            match mapping {
                BlockMapping::Zero { .. } => buf[pos..pos + length].fill(0),
                BlockMapping::Allocated {
                    offset: host_offset,
                    ..
                } => self
                    .data_file
                    .read_exact_at(&mut buf[pos..pos + length], host_offset)
                    .map_err(VdiError::ReadData)?,
            }
            pos += length;
        }
        Ok(())
    }

    /// Writes `buf` at `offset`, one block at a time.
    ///
    /// Stops at the first error. Blocks allocated before it stay allocated.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.check_range(offset, buf.len())?;

        let block_size = self.metadata.block_size();
        let mut pos = 0usize;
        while pos < buf.len() {
            let address = offset + pos as u64;
            let count = min(
                buf.len() - pos,
                (block_size - address % block_size) as usize,
            );
            self.metadata
                .write_block(address, &buf[pos..pos + count], &self.data_file)?;
            pos += count;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.metadata.flush()
    }

    /// Allocation status of a range, without reading any data.
    pub fn block_status(&self, offset: u64, length: usize) -> Result<Vec<BlockMapping>> {
        self.check_range(offset, length)?;
        Ok(self.metadata.map_blocks_for_read(offset, length))
    }

    /// Checks the consistency of the block map. Repairing is not supported,
    /// asking for it fails without looking at the image.
    pub fn check(&self, repair: bool) -> Result<CheckResult> {
        if repair {
            return Err(VdiError::RepairUnsupported);
        }
        self.metadata.check()
    }

    pub fn info(&self) -> ImageInfo {
        let header = self.metadata.header();
        ImageInfo {
            virtual_size: header.disk_size,
            block_size: header.block_size,
            blocks_in_image: header.blocks_in_image,
            blocks_allocated: header.blocks_allocated,
            image_type: header.image_type,
            uuid: header.uuid_image,
        }
    }

    pub fn header(&self) -> VdiHeader {
        self.metadata.header()
    }

    pub fn virtual_size(&self) -> u64 {
        self.metadata.disk_size()
    }

    pub fn block_size(&self) -> u64 {
        self.metadata.block_size()
    }

    pub fn physical_size(&self) -> Result<u64> {
        self.data_file
            .physical_size()
            .map_err(VdiError::GetFileSize)
    }

    /// Whether a newly created image reads as zeros everywhere without
    /// relying on the backing file.
    pub fn has_zero_init(&self) -> bool {
        self.metadata.header().image_type == ImageType::Dynamic
    }

    #[cfg(test)]
    pub(crate) fn metadata(&self) -> &VdiMetadata {
        &self.metadata
    }
}

impl AsRawFd for Vdi {
    fn as_raw_fd(&self) -> RawFd {
        self.data_file.as_raw_fd()
    }
}
