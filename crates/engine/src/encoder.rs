//! Pluggable value encoding
//!
//! An [`Encoder`] pairs a serializer with an optional compressor. The
//! engine uses it in two places: chunking large document values into
//! segments, and nowhere else; index keying uses the deterministic JSON
//! form directly (see [`crate::keys::encode_index_value`]).
//!
//! Two serializers ship: JSON over the tagged value enum, and bincode as
//! the compact binary form. The shipped compressor is brotli. Encoders
//! must be pure: no internal state observable across concurrent calls.

use kvdex_core::{KvValue, KvdexError, KvdexResult};
use std::io::Write;
use std::sync::Arc;

/// Serializes a [`KvValue`] to bytes and back, loss-free.
pub trait Serializer: Send + Sync {
    /// Value to bytes.
    fn serialize(&self, value: &KvValue) -> KvdexResult<Vec<u8>>;
    /// Bytes back to the value.
    fn deserialize(&self, bytes: &[u8]) -> KvdexResult<KvValue>;
}

/// Optional byte-level compression applied after serialization.
pub trait Compressor: Send + Sync {
    /// Compress a serialized value.
    fn compress(&self, data: &[u8]) -> KvdexResult<Vec<u8>>;
    /// Invert [`Compressor::compress`].
    fn decompress(&self, data: &[u8]) -> KvdexResult<Vec<u8>>;
}

/// JSON serializer over the tagged value enum.
///
/// Human-readable and deterministic (object keys are ordered), at the
/// cost of size.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &KvValue) -> KvdexResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> KvdexResult<KvValue> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact binary serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl Serializer for BincodeSerializer {
    fn serialize(&self, value: &KvValue) -> KvdexResult<Vec<u8>> {
        bincode::serialize(value).map_err(|e| KvdexError::serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> KvdexResult<KvValue> {
        bincode::deserialize(bytes).map_err(|e| KvdexError::serialization(e.to_string()))
    }
}

/// Brotli compressor.
#[derive(Debug, Clone, Copy)]
pub struct BrotliCompressor {
    quality: u32,
}

impl BrotliCompressor {
    /// Compressor with an explicit quality (0..=11).
    pub fn new(quality: u32) -> Self {
        BrotliCompressor { quality }
    }
}

impl Default for BrotliCompressor {
    fn default() -> Self {
        BrotliCompressor { quality: 6 }
    }
}

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_LG_WINDOW_SIZE: u32 = 22;

impl Compressor for BrotliCompressor {
    fn compress(&self, data: &[u8]) -> KvdexResult<Vec<u8>> {
        let mut out = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(
                &mut out,
                BROTLI_BUFFER_SIZE,
                self.quality,
                BROTLI_LG_WINDOW_SIZE,
            );
            writer
                .write_all(data)
                .map_err(|e| KvdexError::serialization(format!("brotli compression: {}", e)))?;
            writer
                .flush()
                .map_err(|e| KvdexError::serialization(format!("brotli compression: {}", e)))?;
        }
        Ok(out)
    }

    fn decompress(&self, data: &[u8]) -> KvdexResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut reader = brotli::Decompressor::new(data, BROTLI_BUFFER_SIZE);
        std::io::copy(&mut reader, &mut out)
            .map_err(|e| KvdexError::serialization(format!("brotli decompression: {}", e)))?;
        Ok(out)
    }
}

/// A serializer plus an optional compressor.
#[derive(Clone)]
pub struct Encoder {
    /// Value serializer.
    pub serializer: Arc<dyn Serializer>,
    /// Byte compressor applied after serialization, when present.
    pub compressor: Option<Arc<dyn Compressor>>,
}

impl Encoder {
    /// JSON serializer, no compression.
    pub fn json() -> Self {
        Encoder {
            serializer: Arc::new(JsonSerializer),
            compressor: None,
        }
    }

    /// JSON serializer with brotli compression.
    pub fn json_compressed() -> Self {
        Encoder {
            serializer: Arc::new(JsonSerializer),
            compressor: Some(Arc::new(BrotliCompressor::default())),
        }
    }

    /// Binary serializer, no compression.
    pub fn binary() -> Self {
        Encoder {
            serializer: Arc::new(BincodeSerializer),
            compressor: None,
        }
    }

    /// Binary serializer with brotli compression.
    pub fn binary_compressed() -> Self {
        Encoder {
            serializer: Arc::new(BincodeSerializer),
            compressor: Some(Arc::new(BrotliCompressor::default())),
        }
    }

    /// Serialize and (when configured) compress a value.
    pub fn encode(&self, value: &KvValue) -> KvdexResult<Vec<u8>> {
        let bytes = self.serializer.serialize(value)?;
        self.pack(bytes)
    }

    /// Invert [`Encoder::encode`].
    pub fn decode(&self, bytes: &[u8]) -> KvdexResult<KvValue> {
        let bytes = self.unpack(bytes)?;
        self.serializer.deserialize(&bytes)
    }

    /// Compress raw bytes without serializing. Used when the document
    /// value already is a byte string.
    pub fn pack(&self, bytes: Vec<u8>) -> KvdexResult<Vec<u8>> {
        match &self.compressor {
            Some(compressor) => compressor.compress(&bytes),
            None => Ok(bytes),
        }
    }

    /// Invert [`Encoder::pack`].
    pub fn unpack(&self, bytes: &[u8]) -> KvdexResult<Vec<u8>> {
        match &self.compressor {
            Some(compressor) => compressor.decompress(bytes),
            None => Ok(bytes.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvdex_core::KvValue;

    fn sample() -> KvValue {
        KvValue::Object(
            [
                ("text".to_string(), KvValue::String("A".repeat(1000))),
                ("n".to_string(), KvValue::Float(f64::NAN)),
                ("big".to_string(), KvValue::BigInt(i128::MIN)),
                ("bytes".to_string(), KvValue::Bytes(vec![0u8; 64])),
            ]
            .into_iter()
            .collect(),
        )
    }

    #[test]
    fn test_json_round_trip() {
        let enc = Encoder::json();
        let bytes = enc.encode(&sample()).unwrap();
        assert_eq!(enc.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_binary_round_trip() {
        let enc = Encoder::binary();
        let bytes = enc.encode(&sample()).unwrap();
        assert_eq!(enc.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_compressed_round_trip() {
        for enc in [Encoder::json_compressed(), Encoder::binary_compressed()] {
            let bytes = enc.encode(&sample()).unwrap();
            assert_eq!(enc.decode(&bytes).unwrap(), sample());
        }
    }

    #[test]
    fn test_brotli_shrinks_repetitive_input() {
        let enc = Encoder::json_compressed();
        let plain = Encoder::json();
        let value = KvValue::String("repeat ".repeat(500));
        let compressed = enc.encode(&value).unwrap();
        let uncompressed = plain.encode(&value).unwrap();
        assert!(compressed.len() < uncompressed.len());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let enc = Encoder::binary_compressed();
        assert!(enc.decode(&[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_raw_pack_round_trip() {
        let enc = Encoder::json_compressed();
        let data = vec![7u8; 500];
        let packed = enc.pack(data.clone()).unwrap();
        assert_eq!(enc.unpack(&packed).unwrap(), data);
    }
}
