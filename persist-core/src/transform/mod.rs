/*!
Bidirectional transforms applied to substates on their way to and from storage.

A [`TransformPipeline`] holds an ordered list of [`Transform`]s. Writes fold the
list left to right through [`Transform::inbound`]; reads fold it right to left
through [`Transform::outbound`], so a pipeline `[T1, T2]` stores
`T2.inbound(T1.inbound(v))` and reads back `T1.outbound(T2.outbound(stored))`.
*/

pub mod integrity;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use crate::filter::KeyFilter;
use crate::Result;

pub use integrity::IntegrityTransform;

/// Bidirectional adapter applied to a substate before write and after read.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Write direction. `Ok(None)` means "nothing to store" and ends the chain.
    fn inbound(&self, state: &Value, key: &str) -> Result<Option<Value>>;

    /// Read direction
    fn outbound(&self, state: &Value, key: &str) -> Result<Value>;

    /// Write direction when the persistor runs transforms asynchronously
    async fn inbound_async(&self, state: &Value, key: &str) -> Result<Option<Value>> {
        self.inbound(state, key)
    }

    /// Name used in log output
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Ordered transform list.
#[derive(Clone, Default)]
pub struct TransformPipeline {
    transforms: Vec<Arc<dyn Transform>>,
}

impl fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.transforms.iter().map(|t| t.name()))
            .finish()
    }
}

impl TransformPipeline {
    pub fn new(transforms: Vec<Arc<dyn Transform>>) -> Self {
        Self { transforms }
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Fold the write direction left to right.
    ///
    /// A failing step is logged and skipped; the next step receives the last
    /// good value. Returns `None` as soon as a step yields no value.
    pub fn apply_inbound(&self, value: Value, key: &str) -> Option<Value> {
        let mut current = value;
        for (step, transform) in self.transforms.iter().enumerate() {
            match transform.inbound(&current, key) {
                Ok(Some(next)) => current = next,
                Ok(None) => return None,
                Err(e) => report_inbound_failure(transform.as_ref(), step, key, &e),
            }
        }
        Some(current)
    }

    /// Async write direction: each step is awaited before the next starts.
    /// Failure handling matches [`apply_inbound`](Self::apply_inbound).
    pub async fn apply_inbound_async(&self, value: Value, key: &str) -> Option<Value> {
        let mut current = value;
        for (step, transform) in self.transforms.iter().enumerate() {
            match transform.inbound_async(&current, key).await {
                Ok(Some(next)) => current = next,
                Ok(None) => return None,
                Err(e) => report_inbound_failure(transform.as_ref(), step, key, &e),
            }
        }
        Some(current)
    }

    /// Fold the read direction right to left. The first failure aborts.
    pub fn apply_outbound(&self, value: Value, key: &str) -> Result<Value> {
        self.transforms
            .iter()
            .rev()
            .try_fold(value, |current, transform| transform.outbound(&current, key))
    }
}

fn report_inbound_failure(
    transform: &dyn Transform,
    step: usize,
    key: &str,
    error: &crate::PersistError,
) {
    warn!(
        key = %key,
        step,
        transform = transform.name(),
        error = %error,
        "Transform failed on write; continuing with last good value"
    );
    #[cfg(feature = "metrics")]
    crate::observability::PersistMetrics::global().record_transform_error();
}

type InboundFn = dyn Fn(&Value, &str) -> Result<Option<Value>> + Send + Sync;
type OutboundFn = dyn Fn(&Value, &str) -> Result<Value> + Send + Sync;
type AsyncInboundFn =
    dyn Fn(Value, String) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync;

/// Transform built from closures, restricted to the keys its filter allows.
/// Keys outside the filter pass through unchanged in both directions.
pub struct FnTransform {
    inbound: Box<InboundFn>,
    outbound: Box<OutboundFn>,
    inbound_async: Option<Box<AsyncInboundFn>>,
    filter: KeyFilter,
}

#[async_trait]
impl Transform for FnTransform {
    fn inbound(&self, state: &Value, key: &str) -> Result<Option<Value>> {
        if !self.filter.allows(key) {
            return Ok(Some(state.clone()));
        }
        (self.inbound)(state, key)
    }

    fn outbound(&self, state: &Value, key: &str) -> Result<Value> {
        if !self.filter.allows(key) {
            return Ok(state.clone());
        }
        (self.outbound)(state, key)
    }

    async fn inbound_async(&self, state: &Value, key: &str) -> Result<Option<Value>> {
        match &self.inbound_async {
            Some(step) if self.filter.allows(key) => step(state.clone(), key.to_string()).await,
            _ => self.inbound(state, key),
        }
    }

    fn name(&self) -> &'static str {
        "FnTransform"
    }
}

/// Build a transform from a write closure and a read closure.
///
/// # Example
/// ```rust
/// use persist_core::{create_transform, KeyFilter};
/// use serde_json::{json, Value};
///
/// // Persist only the first 10 entries of the "history" substate
/// let trim = create_transform(
///     |state: &Value, _key: &str| {
///         let items = state.as_array().cloned().unwrap_or_default();
///         Ok(Some(Value::Array(items.into_iter().take(10).collect())))
///     },
///     |state: &Value, _key: &str| Ok(state.clone()),
///     KeyFilter::new(Some(["history"]), Vec::<&str>::new()),
/// );
/// # let _ = trim;
/// ```
pub fn create_transform<I, O>(inbound: I, outbound: O, filter: KeyFilter) -> FnTransform
where
    I: Fn(&Value, &str) -> Result<Option<Value>> + Send + Sync + 'static,
    O: Fn(&Value, &str) -> Result<Value> + Send + Sync + 'static,
{
    FnTransform {
        inbound: Box::new(inbound),
        outbound: Box::new(outbound),
        inbound_async: None,
        filter,
    }
}

/// Build a transform whose write direction is asynchronous.
///
/// In synchronous mode the write direction of this transform is a pass-through;
/// enable `async_transforms` on the persistor to run it.
pub fn create_async_transform<I, O>(inbound: I, outbound: O, filter: KeyFilter) -> FnTransform
where
    I: Fn(Value, String) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync + 'static,
    O: Fn(&Value, &str) -> Result<Value> + Send + Sync + 'static,
{
    FnTransform {
        inbound: Box::new(passthrough_inbound),
        outbound: Box::new(outbound),
        inbound_async: Some(Box::new(inbound)),
        filter,
    }
}

fn passthrough_inbound(state: &Value, _key: &str) -> Result<Option<Value>> {
    Ok(Some(state.clone()))
}
