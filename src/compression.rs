//! Tile compression codecs

use crate::error::{Result, StackError};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression methods a tile can be stored with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionMethod {
    /// No compression
    None = 0,
    /// Deflate/ZIP compression
    Deflate = 1,
    /// Run-length encoding
    RLE = 2,
    /// Zstandard compression
    Zstd = 3,
}

/// Compression level (0-9, where 0 is no compression and 9 is maximum)
#[derive(Debug, Clone, Copy)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(3)
    }
}

/// Encodes and decodes tile payloads
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>>;
}

/// Stores tiles verbatim
#[derive(Debug, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _expected_size: usize) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

#[derive(Debug, Default)]
pub struct DeflateCompressor;

impl Compressor for DeflateCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(data, FlateCompression::new(level.value() as u32));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| StackError::Compression(e.to_string()))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let mut decoder = DeflateDecoder::new(data);
        let mut decompressed = Vec::with_capacity(expected_size);
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| StackError::Decompression(e.to_string()))?;
        Ok(decompressed)
    }
}

#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        zstd::encode_all(data, level.value() as i32)
            .map_err(|e| StackError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        zstd::bulk::decompress(data, expected_size)
            .map_err(|e| StackError::Decompression(e.to_string()))
    }
}

/// Byte-wise run-length encoding, pairs of (count, value)
#[derive(Debug, Default)]
pub struct RLECompressor;

impl RLECompressor {
    fn encode_runs(data: &[u8]) -> Vec<u8> {
        let mut encoded = Vec::new();
        let mut i = 0;

        while i < data.len() {
            let byte = data[i];
            let mut run = 1usize;
            while i + run < data.len() && data[i + run] == byte && run < 255 {
                run += 1;
            }
            encoded.push(run as u8);
            encoded.push(byte);
            i += run;
        }

        encoded
    }

    fn decode_runs(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        if data.len() % 2 != 0 {
            return Err(StackError::Decompression(
                "RLE data must have even length".to_string(),
            ));
        }

        let mut decoded = Vec::with_capacity(expected_size);
        for pair in data.chunks_exact(2) {
            decoded.extend(std::iter::repeat(pair[1]).take(pair[0] as usize));
        }
        Ok(decoded)
    }
}

impl Compressor for RLECompressor {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(Self::encode_runs(data))
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        Self::decode_runs(data, expected_size)
    }
}

/// Get a compressor for a given method
pub fn get_compressor(method: CompressionMethod) -> Box<dyn Compressor> {
    match method {
        CompressionMethod::None => Box::new(NoneCompressor),
        CompressionMethod::Deflate => Box::new(DeflateCompressor),
        CompressionMethod::RLE => Box::new(RLECompressor),
        CompressionMethod::Zstd => Box::new(ZstdCompressor),
    }
}
