//! Compression codecs for RDB string/packed-list payloads.
//!
//! Same [`Codec`] trait shape the storage layer has always used for
//! pluggable compression; LZF is just another implementor, registered in a
//! [`CodecRegistry`] the same way LZ4/Zstd codecs were.

use crate::error::StorageError;
use crate::lzf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionKind {
    None,
    Lzf,
}

pub trait Codec: Send + Sync {
    fn kind(&self) -> CompressionKind;
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, StorageError>;
    fn decompress(&self, input: &[u8], expected_len: usize) -> Result<Vec<u8>, StorageError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoneCodec;

impl Codec for NoneCodec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::None
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, StorageError> {
        Ok(input.to_vec())
    }

    fn decompress(&self, input: &[u8], _expected_len: usize) -> Result<Vec<u8>, StorageError> {
        Ok(input.to_vec())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LzfCodec;

impl Codec for LzfCodec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Lzf
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, StorageError> {
        lzf::compress(input).ok_or_else(|| StorageError::CompressionFailed {
            codec: "lzf",
            reason: "input did not shrink".to_string(),
        })
    }

    fn decompress(&self, input: &[u8], expected_len: usize) -> Result<Vec<u8>, StorageError> {
        lzf::decompress(input, expected_len).map_err(|e| StorageError::DecompressionFailed {
            codec: "lzf",
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Default)]
pub struct CodecRegistry {
    none: NoneCodec,
    lzf: LzfCodec,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self {
            none: NoneCodec,
            lzf: LzfCodec,
        }
    }

    pub fn get(&self, kind: CompressionKind) -> &dyn Codec {
        match kind {
            CompressionKind::None => &self.none,
            CompressionKind::Lzf => &self.lzf,
        }
    }

    /// Picks LZF when `data` is long enough and actually shrinks, else
    /// stores it literally — mirrors the RDB rule that strings under
    /// [`lzf::MIN_COMPRESS_LEN`] are never compressed.
    pub fn compress_best(&self, data: &[u8]) -> (CompressionKind, Vec<u8>) {
        if data.len() >= lzf::MIN_COMPRESS_LEN {
            if let Ok(compressed) = self.lzf.compress(data) {
                return (CompressionKind::Lzf, compressed);
            }
        }
        (CompressionKind::None, data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_codec_roundtrip() {
        let codec = NoneCodec;
        let data = b"hello world";
        let compressed = codec.compress(data).unwrap();
        let decompressed = codec.decompress(&compressed, data.len()).unwrap();
        assert_eq!(data.as_slice(), &decompressed);
    }

    #[test]
    fn lzf_codec_roundtrip() {
        let codec = LzfCodec;
        let data = b"hello world hello world hello world hello world hello world";
        let compressed = codec.compress(data).unwrap();
        let decompressed = codec.decompress(&compressed, data.len()).unwrap();
        assert_eq!(data.as_slice(), &decompressed);
    }

    #[test]
    fn registry_compress_best_prefers_none_for_short_input() {
        let registry = CodecRegistry::new();
        let (kind, payload) = registry.compress_best(b"hi");
        assert_eq!(kind, CompressionKind::None);
        assert_eq!(payload, b"hi");
    }

    #[test]
    fn registry_compress_best_uses_lzf_for_repetitive_input() {
        let registry = CodecRegistry::new();
        let data = vec![b'z'; 200];
        let (kind, payload) = registry.compress_best(&data);
        assert_eq!(kind, CompressionKind::Lzf);
        let restored = registry.get(kind).decompress(&payload, data.len()).unwrap();
        assert_eq!(restored, data);
    }
}
