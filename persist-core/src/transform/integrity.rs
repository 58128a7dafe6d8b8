/*!
Integrity-checking transform.
*/

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::Transform;
use crate::{PersistError, Result};

/// Lossless transform that stores a SHA-256 digest next to each substate and
/// verifies it on read.
///
/// Written records have the shape `{"sha256": "<hex>", "value": <substate>}`.
/// A record whose digest does not match fails with
/// [`PersistError::IntegrityCheckFailed`], which drops that key from a serial
/// rehydrate instead of restoring tampered or truncated data.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityTransform;

impl IntegrityTransform {
    pub fn new() -> Self {
        Self
    }

    /// Hex-encoded SHA-256 of the compact JSON text of `value`
    pub fn digest(value: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(value.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl Transform for IntegrityTransform {
    fn inbound(&self, state: &Value, _key: &str) -> Result<Option<Value>> {
        Ok(Some(json!({
            "sha256": Self::digest(state),
            "value": state,
        })))
    }

    fn outbound(&self, state: &Value, key: &str) -> Result<Value> {
        let expected = state
            .get("sha256")
            .and_then(Value::as_str)
            .ok_or_else(|| PersistError::transform(key, "record has no sha256 digest"))?;
        let value = state
            .get("value")
            .ok_or_else(|| PersistError::transform(key, "record has no value"))?;

        let actual = Self::digest(value);
        if actual != expected {
            return Err(PersistError::IntegrityCheckFailed {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(value.clone())
    }

    fn name(&self) -> &'static str {
        "IntegrityTransform"
    }
}
