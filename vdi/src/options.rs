// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use option_parser::{ByteSized, OptionParser, OptionParserError, Toggle};
use remain::sorted;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "vdi_block_size")]
use crate::vdi_header::block_size_supported;
use crate::vdi_header::{ImageType, DEFAULT_BLOCK_SIZE};

#[sorted]
#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("static=on conflicts with preallocation={0}")]
    ConflictingPreallocation(PreallocMode),
    #[cfg(feature = "vdi_block_size")]
    #[error("Invalid block size {0}")]
    InvalidBlockSize(u64),
    #[error("Invalid preallocation mode {0:?}, expected \"off\" or \"metadata\"")]
    InvalidPreallocation(String),
    #[error("Error parsing image creation options")]
    Parse(#[source] OptionParserError),
    #[error("Missing image size")]
    SizeMissing,
}

pub type Result<T> = std::result::Result<T, OptionsError>;

/// Preallocation mode of a new image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreallocMode {
    /// Dynamic image, blocks are allocated on first write.
    #[default]
    Off,
    /// Static image, every block is mapped and the file is extended to its
    /// full size.
    Metadata,
}

impl PreallocMode {
    pub fn image_type(self) -> ImageType {
        match self {
            PreallocMode::Off => ImageType::Dynamic,
            PreallocMode::Metadata => ImageType::Static,
        }
    }
}

impl Display for PreallocMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            PreallocMode::Off => write!(f, "off"),
            PreallocMode::Metadata => write!(f, "metadata"),
        }
    }
}

impl FromStr for PreallocMode {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(PreallocMode::Off),
            "metadata" => Ok(PreallocMode::Metadata),
            _ => Err(OptionsError::InvalidPreallocation(s.to_owned())),
        }
    }
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

/// Parameters of a new image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOptions {
    /// Virtual disk size in bytes, rounded up to a whole sector.
    pub size: u64,
    #[serde(default)]
    pub preallocation: PreallocMode,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
}

impl CreateOptions {
    #[cfg(not(feature = "vdi_block_size"))]
    pub const SYNTAX: &'static str = "VDI image creation parameters \
        \"size=<image size>,preallocation=off|metadata,static=on|off\"";
    #[cfg(feature = "vdi_block_size")]
    pub const SYNTAX: &'static str = "VDI image creation parameters \
        \"size=<image size>,preallocation=off|metadata,static=on|off,\
        block_size=<block size>\"";

    pub fn new(size: u64) -> Self {
        CreateOptions {
            size,
            preallocation: PreallocMode::Off,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn parse(options: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser.add("size").add("preallocation").add("static");
        #[cfg(feature = "vdi_block_size")]
        parser.add("block_size");
        parser.parse(options).map_err(OptionsError::Parse)?;

        let size = parser
            .convert::<ByteSized>("size")
            .map_err(OptionsError::Parse)?
            .ok_or(OptionsError::SizeMissing)?
            .0;
        let preallocation = parser
            .get("preallocation")
            .map(|mode| mode.parse::<PreallocMode>())
            .transpose()?;
        let static_image = parser
            .convert::<Toggle>("static")
            .map_err(OptionsError::Parse)?
            .unwrap_or(Toggle(false))
            .0;

        let preallocation = match (preallocation, static_image) {
            (Some(PreallocMode::Off), true) => {
                return Err(OptionsError::ConflictingPreallocation(PreallocMode::Off));
            }
            (_, true) => PreallocMode::Metadata,
            (mode, false) => mode.unwrap_or_default(),
        };

        #[cfg(feature = "vdi_block_size")]
        let block_size = match parser
            .convert::<ByteSized>("block_size")
            .map_err(OptionsError::Parse)?
        {
            Some(ByteSized(block_size)) => u32::try_from(block_size)
                .ok()
                .filter(|bs| block_size_supported(*bs))
                .ok_or(OptionsError::InvalidBlockSize(block_size))?,
            None => DEFAULT_BLOCK_SIZE,
        };
        #[cfg(not(feature = "vdi_block_size"))]
        let block_size = DEFAULT_BLOCK_SIZE;

        Ok(CreateOptions {
            size,
            preallocation,
            block_size,
        })
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let options = CreateOptions::parse("size=64M").unwrap();
        assert_eq!(options, CreateOptions::new(64 << 20));
        assert_eq!(options.preallocation.image_type(), ImageType::Dynamic);
    }

    #[test]
    fn test_parse_preallocation() {
        let options = CreateOptions::parse("size=1G,preallocation=metadata").unwrap();
        assert_eq!(options.size, 1 << 30);
        assert_eq!(options.preallocation, PreallocMode::Metadata);

        let options = CreateOptions::parse("preallocation=off,size=4096").unwrap();
        assert_eq!(options.preallocation, PreallocMode::Off);

        let options = CreateOptions::parse("size=2M,static=on").unwrap();
        assert_eq!(options.preallocation, PreallocMode::Metadata);
        let options = CreateOptions::parse("size=2M,static=on,preallocation=metadata").unwrap();
        assert_eq!(options.preallocation, PreallocMode::Metadata);
        let options = CreateOptions::parse("size=2M,static=off").unwrap();
        assert_eq!(options.preallocation, PreallocMode::Off);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            CreateOptions::parse("size=1M,preallocation=full"),
            Err(OptionsError::InvalidPreallocation(mode)) if mode == "full"
        ));
        assert!(matches!(
            CreateOptions::parse("size=1M,preallocation=falloc"),
            Err(OptionsError::InvalidPreallocation(_))
        ));
        assert!(matches!(
            CreateOptions::parse("preallocation=metadata"),
            Err(OptionsError::SizeMissing)
        ));
        assert!(matches!(
            CreateOptions::parse("size=1M,static=on,preallocation=off"),
            Err(OptionsError::ConflictingPreallocation(PreallocMode::Off))
        ));
        assert!(matches!(
            CreateOptions::parse("size=1M,cluster_size=64K"),
            Err(OptionsError::Parse(OptionParserError::UnknownOption(_)))
        ));
        assert!(matches!(
            CreateOptions::parse("size=lots"),
            Err(OptionsError::Parse(OptionParserError::Conversion(..)))
        ));
    }

    #[cfg(not(feature = "vdi_block_size"))]
    #[test]
    fn test_block_size_option_rejected() {
        assert!(matches!(
            CreateOptions::parse("size=1M,block_size=2M"),
            Err(OptionsError::Parse(OptionParserError::UnknownOption(_)))
        ));
    }

    #[cfg(feature = "vdi_block_size")]
    #[test]
    fn test_block_size_option() {
        let options = CreateOptions::parse("size=1M,block_size=64K").unwrap();
        assert_eq!(options.block_size, 64 << 10);
        assert!(matches!(
            CreateOptions::parse("size=1M,block_size=3000"),
            Err(OptionsError::InvalidBlockSize(3000))
        ));
        assert!(matches!(
            CreateOptions::parse("size=1M,block_size=8G"),
            Err(OptionsError::InvalidBlockSize(_))
        ));
    }

    #[test]
    fn test_serde() {
        let options: CreateOptions = serde_json::from_str(r#"{"size": 1048576}"#).unwrap();
        assert_eq!(options, CreateOptions::new(1 << 20));

        let options: CreateOptions =
            serde_json::from_str(r#"{"size": 4096, "preallocation": "metadata"}"#).unwrap();
        assert_eq!(options.preallocation, PreallocMode::Metadata);

        let json = serde_json::to_string(&options).unwrap();
        assert!(json.contains(r#""preallocation":"metadata""#));
        serde_json::from_str::<CreateOptions>(r#"{"size": 1, "preallocation": "full"}"#)
            .unwrap_err();
    }
}
