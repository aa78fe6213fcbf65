use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::entry::CacheEntry;
use crate::error::CacheError;

/// Wire format for entries written to the shared and edge layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// JSON via `serde_json`. Readable with any Redis client.
    #[default]
    Json,
    /// Compact binary via `bincode`. Values must not rely on self-describing
    /// formats (e.g. `serde_json::Value` or untagged enums).
    Binary,
}

/// Encodes and decodes whole [`CacheEntry`] values, bookkeeping included.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    format: SerializationFormat,
}

impl Codec {
    pub fn new(format: SerializationFormat) -> Self {
        Codec { format }
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }

    pub fn encode<V: Serialize>(&self, entry: &CacheEntry<V>) -> Result<Vec<u8>, CacheError> {
        match self.format {
            SerializationFormat::Json => serde_json::to_vec(entry)
                .map_err(|e| CacheError::Serialization(format!("Serialization failed: {}", e))),
            SerializationFormat::Binary => bincode::serialize(entry)
                .map_err(|e| CacheError::Serialization(format!("Serialization failed: {}", e))),
        }
    }

    pub fn decode<V: DeserializeOwned>(&self, bytes: &[u8]) -> Result<CacheEntry<V>, CacheError> {
        match self.format {
            SerializationFormat::Json => serde_json::from_slice(bytes)
                .map_err(|e| CacheError::Serialization(format!("Deserialization failed: {}", e))),
            SerializationFormat::Binary => bincode::deserialize(bytes)
                .map_err(|e| CacheError::Serialization(format!("Deserialization failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Version;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Position {
        symbol: String,
        qty: i64,
    }

    #[test]
    fn test_binary_keeps_bookkeeping() {
        let codec = Codec::new(SerializationFormat::Binary);
        let mut entry = CacheEntry::new(
            Position {
                symbol: "BTC".into(),
                qty: 3,
            },
            1_700_000_000_000,
            Version(42),
        );
        entry.hit_count = 7;

        let bytes = codec.encode(&entry).unwrap();
        let decoded: CacheEntry<Position> = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_json_is_readable() {
        let codec = Codec::new(SerializationFormat::Json);
        let entry = CacheEntry::new("hello".to_string(), 10, Version(1));
        let bytes = codec.encode(&entry).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"version\":1"));
        assert!(text.contains("\"hit_count\":0"));
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        let codec = Codec::new(SerializationFormat::Json);
        let result: Result<CacheEntry<String>, _> = codec.decode(b"not json");
        assert!(matches!(result, Err(CacheError::Serialization(_))));
    }
}
