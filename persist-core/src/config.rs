//! Configuration for a persistor instance
//!
//! [`PersistSettings`] holds the scalar options and can be loaded from JSON.
//! [`PersistConfig`] adds the pieces that cannot be serialized: the storage
//! backend, the transform list, the state accessor and an optional custom
//! serializer.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::filter::KeyFilter;
use crate::serializer::{JsonSerializer, PassthroughSerializer, SerializationPolicy, Serializer};
use crate::state::{MapAccessor, StateAccessor};
use crate::storage::StorageBackend;
use crate::transform::Transform;
use crate::{PersistError, Result};

/// Prefix prepended to every substate key to form its storage key.
pub const DEFAULT_KEY_PREFIX: &str = "persist:";

/// Scalar persistor options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistSettings {
    /// Encode records as JSON text; when false values are stored as-is
    pub serialize: bool,
    /// Keys that are never persisted
    pub blacklist: Vec<String>,
    /// When present, only these keys are persisted
    pub whitelist: Option<Vec<String>>,
    /// Interval between write ticks; 0 writes as soon as possible
    pub debounce_ms: u64,
    /// Prepended to every key to form its storage key
    pub key_prefix: String,
    /// Run write transforms through their async entry point
    pub async_transforms: bool,
    /// Upper bound for a single storage write; `None` waits indefinitely
    pub write_timeout_ms: Option<u64>,
    /// Reaction to serializer failures
    pub serialization_errors: SerializationPolicy,
}

impl Default for PersistSettings {
    fn default() -> Self {
        Self {
            serialize: true,
            blacklist: Vec::new(),
            whitelist: None,
            debounce_ms: 0,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            async_transforms: false,
            write_timeout_ms: None,
            serialization_errors: SerializationPolicy::for_build(),
        }
    }
}

impl PersistSettings {
    /// Parse settings from a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: PersistSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }

    /// Key filter built from the whitelist and blacklist
    pub fn filter(&self) -> KeyFilter {
        KeyFilter::new(self.whitelist.clone(), self.blacklist.clone())
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.write_timeout_ms == Some(0) {
            return Err(PersistError::validation(
                "write_timeout_ms must be greater than zero",
            ));
        }

        let whitelist = self.whitelist.iter().flatten();
        if self.blacklist.iter().chain(whitelist).any(String::is_empty) {
            return Err(PersistError::validation(
                "whitelist and blacklist entries must not be empty",
            ));
        }

        if let Some(whitelist) = &self.whitelist {
            if !whitelist.is_empty() && whitelist.iter().all(|key| self.blacklist.contains(key)) {
                warn!("Every whitelisted key is also blacklisted; nothing will be persisted");
            }
        }
        Ok(())
    }
}

/// Whole milliseconds, rounding any sub-millisecond remainder up
fn millis_rounded_up(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

/// Full persistor configuration
pub struct PersistConfig<A: StateAccessor = MapAccessor> {
    pub(crate) settings: PersistSettings,
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) transforms: Vec<Arc<dyn Transform>>,
    pub(crate) accessor: A,
    pub(crate) serializer: Option<Arc<dyn Serializer>>,
}

impl PersistConfig<MapAccessor> {
    /// Configuration with default settings over `storage`, for [`MapState`]
    /// containers
    ///
    /// [`MapState`]: crate::state::MapState
    pub fn new<B: StorageBackend + 'static>(storage: B) -> Self {
        Self {
            settings: PersistSettings::default(),
            storage: Arc::new(storage),
            transforms: Vec::new(),
            accessor: MapAccessor,
            serializer: None,
        }
    }
}

impl<A: StateAccessor> PersistConfig<A> {
    /// Swap the state accessor, for stores whose state is not a [`MapState`]
    ///
    /// [`MapState`]: crate::state::MapState
    pub fn with_accessor<B: StateAccessor>(self, accessor: B) -> PersistConfig<B> {
        PersistConfig {
            settings: self.settings,
            storage: self.storage,
            transforms: self.transforms,
            accessor,
            serializer: self.serializer,
        }
    }

    pub fn with_settings(mut self, settings: PersistSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn whitelist<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.whitelist = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn blacklist<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.blacklist = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn debounce(mut self, interval: Duration) -> Self {
        self.settings.debounce_ms = millis_rounded_up(interval);
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.settings.key_prefix = prefix.into();
        self
    }

    pub fn serialize(mut self, enabled: bool) -> Self {
        self.settings.serialize = enabled;
        self
    }

    pub fn async_transforms(mut self, enabled: bool) -> Self {
        self.settings.async_transforms = enabled;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.settings.write_timeout_ms = Some(millis_rounded_up(timeout));
        self
    }

    pub fn serialization_errors(mut self, policy: SerializationPolicy) -> Self {
        self.settings.serialization_errors = policy;
        self
    }

    /// Append a transform; transforms run in the order they are added
    pub fn transform<T: Transform + 'static>(mut self, transform: T) -> Self {
        self.transforms.push(Arc::new(transform));
        self
    }

    /// Replace the serializer chosen by the `serialize` setting
    pub fn serializer<S: Serializer + 'static>(mut self, serializer: S) -> Self {
        self.serializer = Some(Arc::new(serializer));
        self
    }

    pub fn settings(&self) -> &PersistSettings {
        &self.settings
    }

    /// The serializer the persistor will use
    pub(crate) fn resolved_serializer(&self) -> Arc<dyn Serializer> {
        match &self.serializer {
            Some(serializer) => Arc::clone(serializer),
            None if self.settings.serialize => Arc::new(JsonSerializer),
            None => Arc::new(PassthroughSerializer),
        }
    }
}
