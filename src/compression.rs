//! Chunk payload codec used by the concrete store backends.
//!
//! The access core itself only moves raw voxel bytes; backends that persist
//! chunks (e.g. [`crate::store::FileVolumeStore`]) run payloads through one
//! of these methods.

use crate::error::{Result, VdsError};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression methods supported for chunk payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionMethod {
    /// No compression
    None = 0,
    /// Deflate/ZIP compression
    Deflate = 1,
    /// Zstandard compression
    Zstd = 2,
}

/// Compression level (0-9, where 0 is no compression and 9 is maximum)
#[derive(Debug, Clone, Copy)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn best() -> Self {
        Self(9)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// Compress a chunk payload
pub fn compress(method: CompressionMethod, level: CompressionLevel, data: &[u8]) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Deflate => {
            let mut encoder = DeflateEncoder::new(data, FlateCompression::new(level.value() as u32));
            let mut compressed = Vec::new();
            encoder
                .read_to_end(&mut compressed)
                .map_err(|e| VdsError::Compression(e.to_string()))?;
            Ok(compressed)
        }
        CompressionMethod::Zstd => zstd::encode_all(data, level.value() as i32)
            .map_err(|e| VdsError::Compression(e.to_string())),
    }
}

/// Decompress a chunk payload. `expected_size` pre-sizes the output buffer
/// when the caller knows the uncompressed chunk size.
pub fn decompress(
    method: CompressionMethod,
    data: &[u8],
    expected_size: Option<usize>,
) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Deflate => {
            let mut decoder = DeflateDecoder::new(data);
            let mut decompressed = match expected_size {
                Some(size) => Vec::with_capacity(size),
                None => Vec::new(),
            };
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| VdsError::Decompression(e.to_string()))?;
            Ok(decompressed)
        }
        CompressionMethod::Zstd => {
            zstd::decode_all(data).map_err(|e| VdsError::Decompression(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_roundtrip() {
        let data = b"chunk payload";
        let compressed = compress(CompressionMethod::None, CompressionLevel::default(), data)
            .unwrap();
        assert_eq!(compressed, data);
        let decompressed = decompress(CompressionMethod::None, &compressed, None).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_deflate_roundtrip() {
        let data = b"chunk payload ".repeat(100);
        let compressed =
            compress(CompressionMethod::Deflate, CompressionLevel::default(), &data).unwrap();
        assert!(compressed.len() < data.len());
        let decompressed =
            decompress(CompressionMethod::Deflate, &compressed, Some(data.len())).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_zstd_roundtrip() {
        let data = b"chunk payload ".repeat(100);
        let compressed =
            compress(CompressionMethod::Zstd, CompressionLevel::default(), &data).unwrap();
        assert!(compressed.len() < data.len());
        let decompressed = decompress(CompressionMethod::Zstd, &compressed, None).unwrap();
        assert_eq!(decompressed, data);
    }
}
