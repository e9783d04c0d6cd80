// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Compression envelope for entry payloads and tag lists.
//!
//! Compressed values carry a 5 byte prefix so a reader can tell them apart
//! from raw values without any help from the store's type system:
//!
//! ```text
//! ┌────────┬────────────────┬──────────────────────────┐
//! │ tag(2) │ ':' 0x1f 0x8b  │ codec output ...         │
//! └────────┴────────────────┴──────────────────────────┘
//!   "zs"     magic (3 bytes)
//! ```
//!
//! The codec tag is the first two bytes of the codec name (`zstd` → `zs`,
//! `snappy` → `sn`, `gzip` → `gz`, ...). Anything without the magic at offset
//! 2 is stored raw.
//!
//! Only zstd ships built in (behind the `compression` feature). Other codecs
//! plug in through the [`Codec`] trait and [`CodecRegistry::register`].
//!
//! # Example
//!
//! ```rust,ignore
//! use tag_cache::compression::{CodecRegistry, Envelope};
//!
//! let registry = CodecRegistry::with_defaults();
//! let envelope = Envelope::new(registry.by_name("zstd"), 16, registry);
//! let stored = envelope.encode(&[b'x'; 64], 1)?;
//! assert!(Envelope::is_enveloped(&stored));
//! assert_eq!(envelope.decode(&stored)?.as_ref(), &[b'x'; 64][..]);
//! ```

use std::borrow::Cow;
use std::sync::Arc;

/// Fixed magic following the two byte codec tag.
pub const ENVELOPE_MAGIC: [u8; 3] = [b':', 0x1f, 0x8b];

/// Total prefix length (codec tag + magic).
pub const ENVELOPE_LEN: usize = 5;

/// Compression error types
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// Failed to compress data
    #[error("compression failed: {0}")]
    CompressFailed(String),

    /// Failed to decompress data
    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    /// Payload names a codec this process does not know
    #[error("unknown codec tag {0:?}")]
    UnknownCodec(String),
}

/// A byte codec selectable by name.
pub trait Codec: Send + Sync {
    /// Configuration name (`"zstd"`, `"snappy"`, ...). At least two ASCII bytes.
    fn name(&self) -> &str;

    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CompressionError>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Envelope tag, derived from the first two bytes of the name.
    fn tag(&self) -> [u8; 2] {
        let bytes = self.name().as_bytes();
        [
            bytes.first().copied().unwrap_or(b'?'),
            bytes.get(1).copied().unwrap_or(b'?'),
        ]
    }
}

/// zstd codec (the crate's built-in).
#[cfg(feature = "compression")]
#[derive(Debug, Default, Clone, Copy)]
pub struct ZstdCodec;

#[cfg(feature = "compression")]
impl Codec for ZstdCodec {
    fn name(&self) -> &str {
        "zstd"
    }

    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CompressionError> {
        zstd::encode_all(data, level)
            .map_err(|e| CompressionError::CompressFailed(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::decode_all(data)
            .map_err(|e| CompressionError::DecompressFailed(e.to_string()))
    }
}

/// Codecs known to this process, looked up by name on write and by tag on read.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { codecs: Vec::new() }
    }

    /// Registry holding the built-in codecs.
    #[must_use]
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "compression")]
        registry.register(Arc::new(ZstdCodec));
        registry
    }

    /// Add a codec. A later codec with the same name replaces the earlier one.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.retain(|c| c.name() != codec.name());
        self.codecs.push(codec);
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.iter().find(|c| c.name() == name).cloned()
    }

    #[must_use]
    pub fn by_tag(&self, tag: [u8; 2]) -> Option<Arc<dyn Codec>> {
        self.codecs.iter().find(|c| c.tag() == tag).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.codecs.iter().map(|c| c.name().to_string()).collect()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry").field("codecs", &self.names()).finish()
    }
}

/// Applies the envelope on write and strips it on read.
#[derive(Clone, Debug)]
pub struct Envelope {
    codec: Option<Arc<dyn Codec>>,
    threshold: usize,
    registry: CodecRegistry,
}

impl std::fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Codec({})", self.name())
    }
}

impl Envelope {
    /// `codec = None` stores everything raw; reads still understand any
    /// registered codec.
    #[must_use]
    pub fn new(codec: Option<Arc<dyn Codec>>, threshold: usize, registry: CodecRegistry) -> Self {
        Self {
            codec,
            threshold: threshold.max(1),
            registry,
        }
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Check for the magic at offset 2.
    #[inline]
    #[must_use]
    pub fn is_enveloped(data: &[u8]) -> bool {
        data.len() >= ENVELOPE_LEN && data[2..ENVELOPE_LEN] == ENVELOPE_MAGIC
    }

    /// Compress `data` when a codec is configured, `level != 0` and the
    /// payload reaches the threshold. Otherwise the bytes pass through.
    pub fn encode<'a>(&self, data: &'a [u8], level: i32) -> Result<Cow<'a, [u8]>, CompressionError> {
        let codec = match &self.codec {
            Some(codec) if level != 0 && data.len() >= self.threshold => codec,
            _ => return Ok(Cow::Borrowed(data)),
        };

        let compressed = codec.compress(data, level)?;
        if compressed.is_empty() {
            return Err(CompressionError::CompressFailed(format!(
                "{} produced no output",
                codec.name()
            )));
        }

        let stats = CompressionStats::new(data.len(), compressed.len() + ENVELOPE_LEN);
        crate::metrics::record_compression(codec.name(), &stats);

        let mut out = Vec::with_capacity(ENVELOPE_LEN + compressed.len());
        out.extend_from_slice(&codec.tag());
        out.extend_from_slice(&ENVELOPE_MAGIC);
        out.extend_from_slice(&compressed);
        Ok(Cow::Owned(out))
    }

    /// Strip the envelope and decompress, or return raw bytes untouched.
    ///
    /// Raw data whose bytes 2..5 happen to equal `:\x1f\x8b` is taken for an
    /// envelope and decoded (or rejected) as one.
    pub fn decode<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>, CompressionError> {
        if !Self::is_enveloped(data) {
            return Ok(Cow::Borrowed(data));
        }
        let tag = [data[0], data[1]];
        let codec = self
            .registry
            .by_tag(tag)
            .ok_or_else(|| CompressionError::UnknownCodec(String::from_utf8_lossy(&tag).into_owned()))?;
        codec.decompress(&data[ENVELOPE_LEN..]).map(Cow::Owned)
    }
}

/// Compression statistics for a single operation.
#[derive(Debug, Clone, Copy)]
pub struct CompressionStats {
    /// Original size in bytes
    pub original_bytes: usize,
    /// Stored size in bytes (envelope included)
    pub compressed_bytes: usize,
    /// Compression ratio (original / compressed)
    pub ratio: f64,
    /// Space saved as fraction (can go negative for incompressible input)
    pub savings: f64,
}

impl CompressionStats {
    #[must_use]
    pub fn new(original_bytes: usize, compressed_bytes: usize) -> Self {
        let ratio = if compressed_bytes > 0 {
            original_bytes as f64 / compressed_bytes as f64
        } else {
            0.0
        };
        let savings = if original_bytes > 0 {
            1.0 - (compressed_bytes as f64 / original_bytes as f64)
        } else {
            0.0
        };
        Self {
            original_bytes,
            compressed_bytes,
            ratio,
            savings,
        }
    }
}
