//! Payload compression codecs, keyed by wire type.
//!
//! The compression type travels in the message metadata so the consumer
//! can pick the matching decoder. Only `None` and `Lz4` are implemented;
//! the remaining discriminants are declared for wire fidelity and fail at
//! encode time if selected.

use bytes::Bytes;
use lz4_flex::block::{compress, decompress};

use crate::error::{Error, Result};

/// Wire-level compression discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, num_derive::FromPrimitive)]
pub enum CompressionType {
    /// No compression; the payload is sent as-is.
    #[default]
    None = 0,
    /// LZ4 block format, no frame header. The uncompressed size travels in
    /// the message metadata.
    Lz4 = 1,
    Zlib = 2,
    Zstd = 3,
    Snappy = 4,
}

impl CompressionType {
    /// Decode a metadata byte into a compression type.
    pub fn from_u8(value: u8) -> Option<CompressionType> {
        num_traits::FromPrimitive::from_u8(value)
    }
}

/// Compress `payload` with the selected codec.
pub fn encode(compression: CompressionType, payload: &Bytes) -> Result<Bytes> {
    match compression {
        CompressionType::None => Ok(payload.clone()),
        CompressionType::Lz4 => Ok(Bytes::from(compress(payload))),
        other => {
            tracing::warn!(compression = ?other, "Compression codec not available");
            Err(Error::UnknownError)
        }
    }
}

/// Decompress `payload`, which was compressed from `uncompressed_size`
/// bytes with the selected codec.
pub fn decode(
    compression: CompressionType,
    payload: &Bytes,
    uncompressed_size: usize,
) -> Result<Bytes> {
    match compression {
        CompressionType::None => Ok(payload.clone()),
        CompressionType::Lz4 => decompress(payload, uncompressed_size)
            .map(Bytes::from)
            .map_err(|error| {
                tracing::error!(%error, "Failed to decompress LZ4 payload");
                Error::ChecksumError
            }),
        other => {
            tracing::warn!(compression = ?other, "Compression codec not available");
            Err(Error::UnknownError)
        }
    }
}
