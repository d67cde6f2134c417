// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! VirtualBox VDI (version 1.1) disk image support.
//!
//! A VDI image is a 512 byte header, a block map with one little endian
//! 32 bit entry per logical block, and a data region holding the physical
//! blocks in allocation order. Dynamic images claim physical blocks on the
//! first write to a logical block, static images are fully mapped when
//! created.

pub mod async_io;
mod bmap;
pub mod check;
mod metadata;
pub mod options;
mod raw_file;
pub mod vdi;
mod vdi_header;
pub mod vdi_sync;

pub use bmap::{BmapEntry, VdiBmapError, VDI_DISCARDED, VDI_UNALLOCATED};
pub use check::{CheckResult, Corruption};
pub use metadata::BlockMapping;
pub use options::{CreateOptions, OptionsError, PreallocMode};
pub use vdi::{ImageInfo, Vdi, VdiError};
pub use vdi_header::{
    ImageType, VdiHeader, VdiHeaderError, DEFAULT_BLOCK_SIZE, MAX_BLOCKS_IN_IMAGE,
};

/// Sector size of every supported image, in bytes.
pub const SECTOR_SIZE: u64 = 512;
