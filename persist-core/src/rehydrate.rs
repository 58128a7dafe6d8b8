/*!
Reconstruction of state from persisted records.
*/

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::serializer::Serializer;
use crate::state::StateAccessor;
use crate::storage::PersistedRecord;
use crate::transform::TransformPipeline;
use crate::{PersistError, Result};

/// Data handed to a rehydrate call.
#[derive(Debug, Clone, PartialEq)]
pub enum RehydrateInput<S> {
    /// One stored record per substate key, still encoded.
    ///
    /// Records are restored in the order given, which is the insertion order
    /// seen by order-preserving accessors such as
    /// [`PairsAccessor`](crate::state::PairsAccessor). [`get_stored_state`]
    /// supplies them sorted by key.
    ///
    /// [`get_stored_state`]: crate::purge::get_stored_state
    Serial(Vec<(String, PersistedRecord)>),
    /// An already assembled state, passed through unchanged
    State(S),
}

impl<S> RehydrateInput<S> {
    pub fn is_serial(&self) -> bool {
        matches!(self, RehydrateInput::Serial(_))
    }
}

/// Decodes records and runs the read direction of the transform pipeline.
#[derive(Clone)]
pub struct Rehydrator {
    serializer: Arc<dyn Serializer>,
    pipeline: TransformPipeline,
}

impl fmt::Debug for Rehydrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rehydrator")
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl Rehydrator {
    pub fn new(serializer: Arc<dyn Serializer>, pipeline: TransformPipeline) -> Self {
        Self {
            serializer,
            pipeline,
        }
    }

    /// Deserialize one record and fold the read transforms over it
    pub fn restore_key(&self, key: &str, record: &PersistedRecord) -> Result<Value> {
        let data = self
            .serializer
            .deserialize(record)
            .map_err(|e| PersistError::rehydrate(key, e.to_string()))?;
        self.pipeline.apply_outbound(data, key)
    }

    /// Assemble a state from records, in the order given.
    ///
    /// A record that fails to deserialize or transform is logged and left out;
    /// the remaining keys are still restored.
    pub fn rehydrate_records<A, I>(&self, accessor: &A, records: I) -> A::State
    where
        A: StateAccessor,
        I: IntoIterator<Item = (String, PersistedRecord)>,
    {
        let mut state = accessor.init();
        for (key, record) in records {
            match self.restore_key(&key, &record) {
                Ok(value) => {
                    state = accessor.set(state, &key, Arc::new(value));
                    #[cfg(feature = "metrics")]
                    crate::observability::PersistMetrics::global().record_rehydrated_key();
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Error rehydrating data for key");
                    #[cfg(feature = "metrics")]
                    crate::observability::PersistMetrics::global().record_rehydrate_error();
                }
            }
        }
        state
    }
}
