//! Tagged serialization of checkpoint payloads, metadata and write values
//!
//! Every stored value is a pair of an encoding tag and a text scalar, because the
//! warehouse hands back nothing richer than strings. The tag names one of a fixed,
//! versioned set of representations:
//!
//! | Tag       | Scalar                         | Used for                                   |
//! |-----------|--------------------------------|--------------------------------------------|
//! | `json`    | JSON text                      | anything serde can express as JSON         |
//! | `bincode` | base64 of bincode bytes        | values JSON rejects (e.g. non-string keys) |
//! | `bytes`   | base64 of the raw bytes        | opaque blobs                               |
//!
//! Decoding a tag outside this set fails with
//! [`WarehouseError::UnsupportedEncoding`]; nothing is ever returned raw.

use crate::error::{Result, WarehouseError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Representation used for a stored scalar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Json,
    Bincode,
    Bytes,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Bincode => "bincode",
            Encoding::Bytes => "bytes",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = WarehouseError;

    fn from_str(tag: &str) -> Result<Self> {
        match tag {
            "json" => Ok(Encoding::Json),
            "bincode" => Ok(Encoding::Bincode),
            "bytes" => Ok(Encoding::Bytes),
            other => Err(WarehouseError::UnsupportedEncoding(other.to_string())),
        }
    }
}

/// An encoding tag together with the text scalar it describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedValue {
    pub tag: String,
    pub data: String,
}

impl EncodedValue {
    pub fn new(encoding: Encoding, data: String) -> Self {
        Self {
            tag: encoding.as_str().to_string(),
            data,
        }
    }

    /// Rebuild from the tag and scalar columns of a stored row
    pub fn from_parts(tag: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            data: data.into(),
        }
    }

    /// Parse the tag, failing for tags this build does not know
    pub fn encoding(&self) -> Result<Encoding> {
        self.tag.parse()
    }
}

/// Protocol for serializing and deserializing stored values
///
/// Implementations choose a representation per value and must be able to decode
/// every tag they ever produced.
pub trait SerializerProtocol: Send + Sync {
    /// Encode a value, choosing its representation
    fn dumps_typed<T: Serialize + ?Sized>(&self, value: &T) -> Result<EncodedValue>;

    /// Decode a value previously produced by [`dumps_typed`](Self::dumps_typed)
    fn loads_typed<T: DeserializeOwned>(&self, encoded: &EncodedValue) -> Result<T>;

    /// Encode an opaque byte blob
    fn dumps_bytes(&self, bytes: &[u8]) -> EncodedValue {
        EncodedValue::new(Encoding::Bytes, BASE64.encode(bytes))
    }

    /// Decode an opaque byte blob
    fn loads_bytes(&self, encoded: &EncodedValue) -> Result<Vec<u8>> {
        match encoded.encoding()? {
            Encoding::Bytes | Encoding::Bincode => Ok(BASE64.decode(encoded.data.as_bytes())?),
            Encoding::Json => Err(WarehouseError::Invalid(
                "value is JSON encoded, not a byte blob".to_string(),
            )),
        }
    }
}

/// JSON first, bincode when JSON cannot represent the value
#[derive(Debug, Clone)]
pub struct TaggedSerializer {
    binary_fallback: bool,
}

impl TaggedSerializer {
    pub fn new() -> Self {
        Self {
            binary_fallback: true,
        }
    }

    /// Only ever produce JSON; values JSON rejects fail to encode
    pub fn json_only() -> Self {
        Self {
            binary_fallback: false,
        }
    }
}

impl Default for TaggedSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl SerializerProtocol for TaggedSerializer {
    fn dumps_typed<T: Serialize + ?Sized>(&self, value: &T) -> Result<EncodedValue> {
        match serde_json::to_string(value) {
            Ok(text) => Ok(EncodedValue::new(Encoding::Json, text)),
            Err(err) if self.binary_fallback => {
                tracing::debug!("JSON encoding rejected value ({}), using bincode", err);
                let bytes = bincode::serialize(value)?;
                Ok(EncodedValue::new(Encoding::Bincode, BASE64.encode(bytes)))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn loads_typed<T: DeserializeOwned>(&self, encoded: &EncodedValue) -> Result<T> {
        match encoded.encoding()? {
            Encoding::Json => Ok(serde_json::from_str(&encoded.data)?),
            Encoding::Bincode => {
                let bytes = BASE64.decode(encoded.data.as_bytes())?;
                Ok(bincode::deserialize(&bytes)?)
            }
            Encoding::Bytes => {
                // Raw blobs surface as a JSON array of octets so `Vec<u8>` and
                // `serde_json::Value` targets both decode.
                let bytes = BASE64.decode(encoded.data.as_bytes())?;
                let octets = bytes.into_iter().map(serde_json::Value::from).collect();
                Ok(serde_json::from_value(serde_json::Value::Array(octets))?)
            }
        }
    }
}
