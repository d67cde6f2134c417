// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! VDI header parsing, validation and creation.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use remain::sorted;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::bmap::bmap_size;
use crate::raw_file::RawFile;
use crate::SECTOR_SIZE;

// Size of the header as stored at the start of the image.
pub const VDI_HEADER_SIZE: usize = 512;
// Tag written at the start of images created by this implementation.
const VDI_TEXT: &[u8] = b"<<< QEMU VM Virtual Disk Image >>>\n";
pub const VDI_SIGNATURE: u32 = 0xbeda_107f;
pub const VDI_VERSION_1_1: u32 = 0x0001_0001;
// Size of the header following the text, signature and version fields.
const VDI_HEADER_SIZE_V1_1: u32 = 0x180;

const VDI_TYPE_DYNAMIC: u32 = 1;
const VDI_TYPE_STATIC: u32 = 2;

pub const DEFAULT_BLOCK_SIZE: u32 = 1 << 20;
// The sector aligned block map byte count must fit in a signed 32 bit integer.
pub const MAX_BLOCKS_IN_IMAGE: u32 = (i32::MAX as u32 + 1 - SECTOR_SIZE as u32) / 4;

// Field offsets. All integers are little endian.
const TEXT_OFFSET: usize = 0x00;
const TEXT_SIZE: usize = 64;
const SIGNATURE_OFFSET: usize = 0x40;
const VERSION_OFFSET: usize = 0x44;
const HEADER_SIZE_OFFSET: usize = 0x48;
const IMAGE_TYPE_OFFSET: usize = 0x4c;
const IMAGE_FLAGS_OFFSET: usize = 0x50;
const DESCRIPTION_OFFSET: usize = 0x54;
const DESCRIPTION_SIZE: usize = 256;
const OFFSET_BMAP_OFFSET: usize = 0x154;
const OFFSET_DATA_OFFSET: usize = 0x158;
const CYLINDERS_OFFSET: usize = 0x15c;
const HEADS_OFFSET: usize = 0x160;
const SECTORS_OFFSET: usize = 0x164;
const SECTOR_SIZE_OFFSET: usize = 0x168;
const UNUSED1_OFFSET: usize = 0x16c;
const DISK_SIZE_OFFSET: usize = 0x170;
const BLOCK_SIZE_OFFSET: usize = 0x178;
const BLOCK_EXTRA_OFFSET: usize = 0x17c;
const BLOCKS_IN_IMAGE_OFFSET: usize = 0x180;
const BLOCKS_ALLOCATED_OFFSET: usize = 0x184;
const UUID_IMAGE_OFFSET: usize = 0x188;
const UUID_LAST_SNAP_OFFSET: usize = 0x198;
const UUID_LINK_OFFSET: usize = 0x1a8;
const UUID_PARENT_OFFSET: usize = 0x1b8;
const RESERVED_OFFSET: usize = 0x1c8;
const RESERVED_SIZE: usize = 56;

#[sorted]
#[derive(Error, Debug)]
pub enum VdiHeaderError {
    #[error("Block map at offset {0:#x} overlaps the header")]
    BlockMapOverlapsHeader(u32),
    #[error("Data region at offset {offset_data:#x} overlaps the block map ending at {bmap_end:#x}")]
    DataOverlapsBlockMap { offset_data: u32, bmap_end: u64 },
    #[error("Disk size {disk_size} exceeds the {capacity} bytes covered by the block map")]
    DiskSizeExceedsBlocks { disk_size: u64, capacity: u64 },
    #[error("Disk size {0} cannot be rounded up to a sector boundary")]
    DiskSizeOverflow(u64),
    #[error("Invalid signature {0:#x}")]
    InvalidSignature(u32),
    #[error("Linked images are not supported (link UUID {0})")]
    LinkUuidNotNull(Uuid),
    #[error("Block map offset {0:#x} is not sector aligned")]
    MisalignedBlockMapOffset(u32),
    #[error("Data offset {0:#x} is not sector aligned")]
    MisalignedDataOffset(u32),
    #[error("Differencing images are not supported (parent UUID {0})")]
    ParentUuidNotNull(Uuid),
    #[error("Failed to read header")]
    ReadHeader(#[source] io::Error),
    #[error("Header too short: {0} bytes")]
    ShortHeader(usize),
    #[error("Too many blocks in image: {0}")]
    TooManyBlocks(u32),
    #[error("Unsupported block size {0}")]
    UnsupportedBlockSize(u32),
    #[error("Unsupported image type {0}")]
    UnsupportedImageType(u32),
    #[error("Unsupported sector size {0}")]
    UnsupportedSectorSize(u32),
    #[error("Unsupported version {0:#x}")]
    UnsupportedVersion(u32),
}

pub type Result<T> = std::result::Result<T, VdiHeaderError>;

/// How the data region of an image is populated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    /// Physical blocks are claimed on the first write to a logical block.
    Dynamic,
    /// Every logical block is mapped to the physical block of the same index.
    Static,
}

impl ImageType {
    fn from_raw(value: u32) -> Option<Self> {
        match value {
            VDI_TYPE_DYNAMIC => Some(ImageType::Dynamic),
            VDI_TYPE_STATIC => Some(ImageType::Static),
            _ => None,
        }
    }

    fn to_raw(self) -> u32 {
        match self {
            ImageType::Dynamic => VDI_TYPE_DYNAMIC,
            ImageType::Static => VDI_TYPE_STATIC,
        }
    }
}

impl Display for ImageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ImageType::Dynamic => write!(f, "dynamic"),
            ImageType::Static => write!(f, "static"),
        }
    }
}

/// Whether images with the given block size can be opened and created.
#[cfg(not(feature = "vdi_block_size"))]
pub fn block_size_supported(block_size: u32) -> bool {
    block_size == DEFAULT_BLOCK_SIZE
}

/// Whether images with the given block size can be opened and created.
#[cfg(feature = "vdi_block_size")]
pub fn block_size_supported(block_size: u32) -> bool {
    block_size.is_power_of_two() && u64::from(block_size) >= SECTOR_SIZE
}

/// In memory copy of the VDI header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VdiHeader {
    pub text: [u8; TEXT_SIZE],
    pub signature: u32,
    pub version: u32,
    pub header_size: u32,
    pub image_type: ImageType,
    pub image_flags: u32,
    pub description: [u8; DESCRIPTION_SIZE],
    pub offset_bmap: u32,
    pub offset_data: u32,
    // Legacy geometry, preserved but never used.
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
    pub sector_size: u32,
    pub unused1: u32,
    pub disk_size: u64,
    pub block_size: u32,
    pub block_extra: u32,
    pub blocks_in_image: u32,
    pub blocks_allocated: u32,
    pub uuid_image: Uuid,
    pub uuid_last_snap: Uuid,
    pub uuid_link: Uuid,
    pub uuid_parent: Uuid,
    pub reserved: [u8; RESERVED_SIZE],
}

fn read_array<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&buf[offset..offset + N]);
    bytes
}

// UUIDs are stored with their first three fields little endian.
fn read_uuid(buf: &[u8], offset: usize) -> Uuid {
    Uuid::from_bytes_le(read_array(buf, offset))
}

fn write_uuid(buf: &mut [u8], offset: usize, uuid: &Uuid) {
    buf[offset..offset + 16].copy_from_slice(&uuid.to_bytes_le());
}

impl VdiHeader {
    /// Reads and validates the header at the start of `file`.
    pub(crate) fn new(file: &RawFile) -> Result<VdiHeader> {
        let mut buf = [0u8; VDI_HEADER_SIZE];
        file.read_exact_at(&mut buf, 0)
            .map_err(VdiHeaderError::ReadHeader)?;
        Self::decode(&buf)
    }

    /// Builds the header of a new image of `disk_size` bytes.
    ///
    /// `disk_size` must already be sector aligned and small enough for the
    /// block count to stay within `MAX_BLOCKS_IN_IMAGE`.
    pub fn create_for_size(disk_size: u64, block_size: u32, image_type: ImageType) -> VdiHeader {
        let blocks_in_image = disk_size.div_ceil(u64::from(block_size)) as u32;
        let offset_bmap = VDI_HEADER_SIZE as u32;
        let offset_data = offset_bmap + bmap_size(blocks_in_image) as u32;
        let blocks_allocated = match image_type {
            ImageType::Dynamic => 0,
            ImageType::Static => blocks_in_image,
        };

        let mut text = [0u8; TEXT_SIZE];
        text[..VDI_TEXT.len()].copy_from_slice(VDI_TEXT);

        VdiHeader {
            text,
            signature: VDI_SIGNATURE,
            version: VDI_VERSION_1_1,
            header_size: VDI_HEADER_SIZE_V1_1,
            image_type,
            image_flags: 0,
            description: [0u8; DESCRIPTION_SIZE],
            offset_bmap,
            offset_data,
            cylinders: 0,
            heads: 0,
            sectors: 0,
            sector_size: SECTOR_SIZE as u32,
            unused1: 0,
            disk_size,
            block_size,
            block_extra: 0,
            blocks_in_image,
            blocks_allocated,
            uuid_image: Uuid::new_v4(),
            uuid_last_snap: Uuid::new_v4(),
            uuid_link: Uuid::nil(),
            uuid_parent: Uuid::nil(),
            reserved: [0u8; RESERVED_SIZE],
        }
    }

    /// Parses and validates a header from the first 512 bytes of `buf`.
    ///
    /// A disk size that is not a multiple of the sector size is rounded up.
    pub fn decode(buf: &[u8]) -> Result<VdiHeader> {
        if buf.len() < VDI_HEADER_SIZE {
            return Err(VdiHeaderError::ShortHeader(buf.len()));
        }

        let signature = LittleEndian::read_u32(&buf[SIGNATURE_OFFSET..]);
        if signature != VDI_SIGNATURE {
            return Err(VdiHeaderError::InvalidSignature(signature));
        }
        let version = LittleEndian::read_u32(&buf[VERSION_OFFSET..]);
        if version != VDI_VERSION_1_1 {
            return Err(VdiHeaderError::UnsupportedVersion(version));
        }

        let raw_type = LittleEndian::read_u32(&buf[IMAGE_TYPE_OFFSET..]);
        let image_type = ImageType::from_raw(raw_type);

        let mut header = VdiHeader {
            text: read_array(buf, TEXT_OFFSET),
            signature,
            version,
            header_size: LittleEndian::read_u32(&buf[HEADER_SIZE_OFFSET..]),
            image_type: image_type.unwrap_or(ImageType::Dynamic),
            image_flags: LittleEndian::read_u32(&buf[IMAGE_FLAGS_OFFSET..]),
            description: read_array(buf, DESCRIPTION_OFFSET),
            offset_bmap: LittleEndian::read_u32(&buf[OFFSET_BMAP_OFFSET..]),
            offset_data: LittleEndian::read_u32(&buf[OFFSET_DATA_OFFSET..]),
            cylinders: LittleEndian::read_u32(&buf[CYLINDERS_OFFSET..]),
            heads: LittleEndian::read_u32(&buf[HEADS_OFFSET..]),
            sectors: LittleEndian::read_u32(&buf[SECTORS_OFFSET..]),
            sector_size: LittleEndian::read_u32(&buf[SECTOR_SIZE_OFFSET..]),
            unused1: LittleEndian::read_u32(&buf[UNUSED1_OFFSET..]),
            disk_size: LittleEndian::read_u64(&buf[DISK_SIZE_OFFSET..]),
            block_size: LittleEndian::read_u32(&buf[BLOCK_SIZE_OFFSET..]),
            block_extra: LittleEndian::read_u32(&buf[BLOCK_EXTRA_OFFSET..]),
            blocks_in_image: LittleEndian::read_u32(&buf[BLOCKS_IN_IMAGE_OFFSET..]),
            blocks_allocated: LittleEndian::read_u32(&buf[BLOCKS_ALLOCATED_OFFSET..]),
            uuid_image: read_uuid(buf, UUID_IMAGE_OFFSET),
            uuid_last_snap: read_uuid(buf, UUID_LAST_SNAP_OFFSET),
            uuid_link: read_uuid(buf, UUID_LINK_OFFSET),
            uuid_parent: read_uuid(buf, UUID_PARENT_OFFSET),
            reserved: read_array(buf, RESERVED_OFFSET),
        };

        if header.disk_size % SECTOR_SIZE != 0 {
            let aligned = header
                .disk_size
                .checked_next_multiple_of(SECTOR_SIZE)
                .ok_or(VdiHeaderError::DiskSizeOverflow(header.disk_size))?;
            debug!(
                "VDI disk size {} is not sector aligned, using {}",
                header.disk_size, aligned
            );
            header.disk_size = aligned;
        }

        header.validate()?;
        if image_type.is_none() {
            return Err(VdiHeaderError::UnsupportedImageType(raw_type));
        }
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if u64::from(self.sector_size) != SECTOR_SIZE {
            return Err(VdiHeaderError::UnsupportedSectorSize(self.sector_size));
        }
        if u64::from(self.offset_bmap) % SECTOR_SIZE != 0 {
            return Err(VdiHeaderError::MisalignedBlockMapOffset(self.offset_bmap));
        }
        if u64::from(self.offset_data) % SECTOR_SIZE != 0 {
            return Err(VdiHeaderError::MisalignedDataOffset(self.offset_data));
        }
        if !block_size_supported(self.block_size) {
            return Err(VdiHeaderError::UnsupportedBlockSize(self.block_size));
        }
        let capacity = u64::from(self.blocks_in_image) * u64::from(self.block_size);
        if self.disk_size > capacity {
            return Err(VdiHeaderError::DiskSizeExceedsBlocks {
                disk_size: self.disk_size,
                capacity,
            });
        }
        if self.blocks_in_image > MAX_BLOCKS_IN_IMAGE {
            return Err(VdiHeaderError::TooManyBlocks(self.blocks_in_image));
        }
        if (self.offset_bmap as usize) < VDI_HEADER_SIZE {
            return Err(VdiHeaderError::BlockMapOverlapsHeader(self.offset_bmap));
        }
        let bmap_end = u64::from(self.offset_bmap) + bmap_size(self.blocks_in_image);
        if u64::from(self.offset_data) < bmap_end {
            return Err(VdiHeaderError::DataOverlapsBlockMap {
                offset_data: self.offset_data,
                bmap_end,
            });
        }
        if !self.uuid_link.is_nil() {
            return Err(VdiHeaderError::LinkUuidNotNull(self.uuid_link));
        }
        if !self.uuid_parent.is_nil() {
            return Err(VdiHeaderError::ParentUuidNotNull(self.uuid_parent));
        }
        Ok(())
    }

    /// Serializes the header into its on-disk layout.
    pub fn encode(&self) -> [u8; VDI_HEADER_SIZE] {
        let mut buf = [0u8; VDI_HEADER_SIZE];

        buf[TEXT_OFFSET..TEXT_OFFSET + TEXT_SIZE].copy_from_slice(&self.text);
        LittleEndian::write_u32(&mut buf[SIGNATURE_OFFSET..], self.signature);
        LittleEndian::write_u32(&mut buf[VERSION_OFFSET..], self.version);
        LittleEndian::write_u32(&mut buf[HEADER_SIZE_OFFSET..], self.header_size);
        LittleEndian::write_u32(&mut buf[IMAGE_TYPE_OFFSET..], self.image_type.to_raw());
        LittleEndian::write_u32(&mut buf[IMAGE_FLAGS_OFFSET..], self.image_flags);
        buf[DESCRIPTION_OFFSET..DESCRIPTION_OFFSET + DESCRIPTION_SIZE]
            .copy_from_slice(&self.description);
        LittleEndian::write_u32(&mut buf[OFFSET_BMAP_OFFSET..], self.offset_bmap);
        LittleEndian::write_u32(&mut buf[OFFSET_DATA_OFFSET..], self.offset_data);
        LittleEndian::write_u32(&mut buf[CYLINDERS_OFFSET..], self.cylinders);
        LittleEndian::write_u32(&mut buf[HEADS_OFFSET..], self.heads);
        LittleEndian::write_u32(&mut buf[SECTORS_OFFSET..], self.sectors);
        LittleEndian::write_u32(&mut buf[SECTOR_SIZE_OFFSET..], self.sector_size);
        LittleEndian::write_u32(&mut buf[UNUSED1_OFFSET..], self.unused1);
        LittleEndian::write_u64(&mut buf[DISK_SIZE_OFFSET..], self.disk_size);
        LittleEndian::write_u32(&mut buf[BLOCK_SIZE_OFFSET..], self.block_size);
        LittleEndian::write_u32(&mut buf[BLOCK_EXTRA_OFFSET..], self.block_extra);
        LittleEndian::write_u32(&mut buf[BLOCKS_IN_IMAGE_OFFSET..], self.blocks_in_image);
        LittleEndian::write_u32(&mut buf[BLOCKS_ALLOCATED_OFFSET..], self.blocks_allocated);
        write_uuid(&mut buf, UUID_IMAGE_OFFSET, &self.uuid_image);
        write_uuid(&mut buf, UUID_LAST_SNAP_OFFSET, &self.uuid_last_snap);
        write_uuid(&mut buf, UUID_LINK_OFFSET, &self.uuid_link);
        write_uuid(&mut buf, UUID_PARENT_OFFSET, &self.uuid_parent);
        buf[RESERVED_OFFSET..RESERVED_OFFSET + RESERVED_SIZE].copy_from_slice(&self.reserved);

        buf
    }

    /// Writes the header at the start of `file`.
    pub(crate) fn write_to(&self, file: &RawFile) -> io::Result<()> {
        file.write_all_at(&self.encode(), 0)
    }

    /// Byte offset of the physical block `index` in the image file.
    pub fn block_offset(&self, index: u32) -> u64 {
        u64::from(self.offset_data) + u64::from(index) * u64::from(self.block_size)
    }

    /// End of the data region holding every allocated block.
    pub fn image_end_offset(&self) -> u64 {
        self.block_offset(self.blocks_allocated)
    }

    pub fn log(&self) {
        let text_len = self
            .text
            .iter()
            .position(|&b| b == 0 || b == b'\n')
            .unwrap_or(TEXT_SIZE);
        debug!("VDI header:");
        debug!("  text            {}", String::from_utf8_lossy(&self.text[..text_len]));
        debug!("  signature       {:#010x}", self.signature);
        debug!("  version         {:#010x}", self.version);
        debug!("  header size     {:#x}", self.header_size);
        debug!("  image type      {}", self.image_type);
        debug!("  image flags     {:#x}", self.image_flags);
        debug!("  block map       {:#x}", self.offset_bmap);
        debug!("  data            {:#x}", self.offset_data);
        debug!(
            "  geometry        {}/{}/{}",
            self.cylinders, self.heads, self.sectors
        );
        debug!("  sector size     {}", self.sector_size);
        debug!("  disk size       {}", self.disk_size);
        debug!("  block size      {}", self.block_size);
        debug!("  block extra     {}", self.block_extra);
        debug!("  blocks          {}", self.blocks_in_image);
        debug!("  allocated       {}", self.blocks_allocated);
        debug!("  image uuid      {}", self.uuid_image);
        debug!("  snapshot uuid   {}", self.uuid_last_snap);
        debug!("  link uuid       {}", self.uuid_link);
        debug!("  parent uuid     {}", self.uuid_parent);
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn dynamic_header() -> VdiHeader {
        VdiHeader::create_for_size(
            8 * u64::from(DEFAULT_BLOCK_SIZE),
            DEFAULT_BLOCK_SIZE,
            ImageType::Dynamic,
        )
    }

    fn decode_modified<F: FnOnce(&mut VdiHeader)>(modify: F) -> Result<VdiHeader> {
        let mut header = dynamic_header();
        modify(&mut header);
        VdiHeader::decode(&header.encode())
    }

    #[test]
    fn test_header_round_trip() {
        for image_type in [ImageType::Dynamic, ImageType::Static] {
            let mut header = VdiHeader::create_for_size(5 << 20, DEFAULT_BLOCK_SIZE, image_type);
            header.description[..4].copy_from_slice(b"boot");
            header.cylinders = 1024;
            header.heads = 16;
            header.sectors = 63;
            header.reserved[7] = 0x5a;
            let decoded = VdiHeader::decode(&header.encode()).unwrap();
            assert_eq!(decoded, header);
            assert_eq!(decoded.encode(), header.encode());
        }
    }

    #[test]
    fn test_header_layout() {
        let header = dynamic_header();
        let buf = header.encode();

        assert!(buf.starts_with(b"<<< QEMU VM Virtual Disk Image >>>\n"));
        assert_eq!(&buf[0x40..0x44], &[0x7f, 0x10, 0xda, 0xbe]);
        assert_eq!(&buf[0x44..0x48], &[0x01, 0x00, 0x01, 0x00]);
        assert_eq!(LittleEndian::read_u32(&buf[0x48..]), 0x180);
        assert_eq!(LittleEndian::read_u32(&buf[0x4c..]), 1);
        assert_eq!(LittleEndian::read_u32(&buf[0x154..]), 0x200);
        // Eight map entries fit in a single sector.
        assert_eq!(LittleEndian::read_u32(&buf[0x158..]), 0x400);
        assert_eq!(LittleEndian::read_u32(&buf[0x168..]), 512);
        assert_eq!(LittleEndian::read_u64(&buf[0x170..]), 8 << 20);
        assert_eq!(LittleEndian::read_u32(&buf[0x178..]), 1 << 20);
        assert_eq!(LittleEndian::read_u32(&buf[0x180..]), 8);
        assert_eq!(LittleEndian::read_u32(&buf[0x184..]), 0);
        assert_eq!(&buf[0x188..0x198], &header.uuid_image.to_bytes_le());
        assert!(buf[0x1a8..0x200].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_create_for_size() {
        let header = VdiHeader::create_for_size(
            3 * u64::from(DEFAULT_BLOCK_SIZE) + 512,
            DEFAULT_BLOCK_SIZE,
            ImageType::Static,
        );
        assert_eq!(header.blocks_in_image, 4);
        assert_eq!(header.blocks_allocated, 4);
        assert_eq!(header.offset_bmap, 512);
        assert_eq!(header.offset_data, 1024);
        assert!(!header.uuid_image.is_nil());
        assert_ne!(header.uuid_image, header.uuid_last_snap);
        assert_eq!(header.image_end_offset(), 1024 + 4 * (1 << 20));

        // 129 entries need a second map sector.
        let header =
            VdiHeader::create_for_size(129 << 20, DEFAULT_BLOCK_SIZE, ImageType::Dynamic);
        assert_eq!(header.offset_data, 512 + 1024);
        assert_eq!(header.blocks_allocated, 0);
    }

    #[test]
    fn test_unaligned_disk_size_rounded_up() {
        let header = decode_modified(|h| h.disk_size = 1000).unwrap();
        assert_eq!(header.disk_size, 1024);
    }

    #[test]
    fn test_short_header() {
        let buf = dynamic_header().encode();
        assert!(matches!(
            VdiHeader::decode(&buf[..511]),
            Err(VdiHeaderError::ShortHeader(511))
        ));
    }

    #[test]
    fn test_invalid_headers() {
        assert!(matches!(
            decode_modified(|h| h.signature = 0x1234_5678),
            Err(VdiHeaderError::InvalidSignature(0x1234_5678))
        ));
        assert!(matches!(
            decode_modified(|h| h.version = 0x0001_0000),
            Err(VdiHeaderError::UnsupportedVersion(0x0001_0000))
        ));
        assert!(matches!(
            decode_modified(|h| h.sector_size = 4096),
            Err(VdiHeaderError::UnsupportedSectorSize(4096))
        ));
        assert!(matches!(
            decode_modified(|h| h.offset_bmap = 0x201),
            Err(VdiHeaderError::MisalignedBlockMapOffset(0x201))
        ));
        assert!(matches!(
            decode_modified(|h| h.offset_data = 0x401),
            Err(VdiHeaderError::MisalignedDataOffset(0x401))
        ));
        assert!(matches!(
            decode_modified(|h| h.block_size = 3000),
            Err(VdiHeaderError::UnsupportedBlockSize(3000))
        ));
        assert!(matches!(
            decode_modified(|h| h.disk_size = 8 * u64::from(DEFAULT_BLOCK_SIZE) + 512),
            Err(VdiHeaderError::DiskSizeExceedsBlocks { .. })
        ));
        assert!(matches!(
            decode_modified(|h| h.blocks_in_image = MAX_BLOCKS_IN_IMAGE + 1),
            Err(VdiHeaderError::TooManyBlocks(_))
        ));
        assert!(matches!(
            decode_modified(|h| h.offset_bmap = 0),
            Err(VdiHeaderError::BlockMapOverlapsHeader(0))
        ));
        assert!(matches!(
            decode_modified(|h| h.offset_data = 512),
            Err(VdiHeaderError::DataOverlapsBlockMap { offset_data: 512, bmap_end: 1024 })
        ));
        assert!(matches!(
            decode_modified(|h| h.uuid_link = Uuid::new_v4()),
            Err(VdiHeaderError::LinkUuidNotNull(_))
        ));
        assert!(matches!(
            decode_modified(|h| h.uuid_parent = Uuid::new_v4()),
            Err(VdiHeaderError::ParentUuidNotNull(_))
        ));
    }

    #[test]
    fn test_unsupported_image_type() {
        let mut buf = dynamic_header().encode();
        LittleEndian::write_u32(&mut buf[IMAGE_TYPE_OFFSET..], 4);
        assert!(matches!(
            VdiHeader::decode(&buf),
            Err(VdiHeaderError::UnsupportedImageType(4))
        ));
    }

    #[test]
    fn test_image_type_checked_last() {
        let mut buf = dynamic_header().encode();
        LittleEndian::write_u32(&mut buf[IMAGE_TYPE_OFFSET..], 0);
        LittleEndian::write_u32(&mut buf[SECTOR_SIZE_OFFSET..], 4096);
        assert!(matches!(
            VdiHeader::decode(&buf),
            Err(VdiHeaderError::UnsupportedSectorSize(4096))
        ));

        let mut header = dynamic_header();
        header.uuid_parent = Uuid::new_v4();
        let mut buf = header.encode();
        LittleEndian::write_u32(&mut buf[IMAGE_TYPE_OFFSET..], 0);
        assert!(matches!(
            VdiHeader::decode(&buf),
            Err(VdiHeaderError::ParentUuidNotNull(_))
        ));
    }

    #[test]
    fn test_max_blocks_in_image() {
        assert_eq!(MAX_BLOCKS_IN_IMAGE, 536_870_784);
        assert!(bmap_size(MAX_BLOCKS_IN_IMAGE) <= i32::MAX as u64);
        assert!(bmap_size(MAX_BLOCKS_IN_IMAGE + 1) > i32::MAX as u64);

        let with_blocks = |blocks: u32| {
            decode_modified(|h| {
                h.blocks_in_image = blocks;
                h.offset_data = h.offset_bmap + bmap_size(blocks) as u32;
            })
        };
        let header = with_blocks(MAX_BLOCKS_IN_IMAGE).unwrap();
        assert_eq!(header.blocks_in_image, MAX_BLOCKS_IN_IMAGE);
        assert_eq!(header.offset_data, 1 << 31);
        assert!(matches!(
            with_blocks(MAX_BLOCKS_IN_IMAGE + 1),
            Err(VdiHeaderError::TooManyBlocks(536_870_785))
        ));
    }

    #[test]
    fn test_signature_checked_first() {
        let mut buf = dynamic_header().encode();
        LittleEndian::write_u32(&mut buf[SIGNATURE_OFFSET..], 0);
        LittleEndian::write_u32(&mut buf[SECTOR_SIZE_OFFSET..], 4096);
        assert!(matches!(
            VdiHeader::decode(&buf),
            Err(VdiHeaderError::InvalidSignature(0))
        ));
    }
}
