//! Compression transformers. Output is base64 text.

use std::io::Write;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::write::{GzEncoder, ZlibEncoder};

use super::{Result, StageError, Transformer};
use crate::models::CompressionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zlib,
}

impl Compression {
    /// Resolve the compression stage; `NONE` installs nothing.
    pub fn from_type(compression: &CompressionType) -> Result<Option<Self>> {
        match compression {
            CompressionType::None => Ok(None),
            CompressionType::Gzip => Ok(Some(Compression::Gzip)),
            CompressionType::Zip => Ok(Some(Compression::Zlib)),
            CompressionType::Unsupported(value) => Err(StageError::Unsupported {
                stage: "compression",
                value: value.clone(),
            }),
        }
    }
}

impl Transformer for Compression {
    fn transform(&self, data: &[u8]) -> Result<Vec<u8>> {
        let compressed = match self {
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                encoder.finish()?
            }
            Compression::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                encoder.finish()?
            }
        };
        Ok(STANDARD.encode(compressed).into_bytes())
    }
}
