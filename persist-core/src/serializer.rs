/*!
Codecs between in-memory substates and stored records.
*/

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::PersistedRecord;
use crate::{PersistError, Result};

/// Codec between substate values and [`PersistedRecord`]s.
pub trait Serializer: Send + Sync {
    /// Encode a value for storage
    fn serialize(&self, value: &Value) -> Result<PersistedRecord>;

    /// Decode a stored record
    fn deserialize(&self, record: &PersistedRecord) -> Result<Value>;
}

/// What the write path does when a serializer fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationPolicy {
    /// Halt the persistor and surface the error
    Strict,
    /// Log the failure and omit the record
    Lenient,
}

impl SerializationPolicy {
    /// `Strict` in debug builds, `Lenient` in release builds
    pub fn for_build() -> Self {
        if cfg!(debug_assertions) {
            SerializationPolicy::Strict
        } else {
            SerializationPolicy::Lenient
        }
    }
}

impl Default for SerializationPolicy {
    fn default() -> Self {
        Self::for_build()
    }
}

/// Compact JSON text codec. This is the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<PersistedRecord> {
        Ok(PersistedRecord::Encoded(serde_json::to_string(value)?))
    }

    fn deserialize(&self, record: &PersistedRecord) -> Result<Value> {
        match record {
            PersistedRecord::Encoded(text) => Ok(serde_json::from_str(text)?),
            PersistedRecord::Raw(_) => Err(PersistError::invalid_format(
                "expected an encoded record, found a raw value",
            )),
        }
    }
}

/// Codec that stores values un-encoded.
///
/// Encoded records read back as their string content, so text written by a
/// JSON-serializing persistor is still readable (as a string).
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughSerializer;

impl Serializer for PassthroughSerializer {
    fn serialize(&self, value: &Value) -> Result<PersistedRecord> {
        Ok(PersistedRecord::Raw(value.clone()))
    }

    fn deserialize(&self, record: &PersistedRecord) -> Result<Value> {
        match record {
            PersistedRecord::Raw(value) => Ok(value.clone()),
            PersistedRecord::Encoded(text) => Ok(Value::String(text.clone())),
        }
    }
}
