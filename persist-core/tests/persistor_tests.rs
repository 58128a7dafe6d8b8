/*!
Integration tests for the persistor: detection, scheduling, transforms,
rehydration and purging working together against real and stub backends.
*/

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use mockall::mock;
use persist_core::{
    create_async_transform, create_persistor, create_transform, InMemoryStore, JsonSerializer,
    KeyFilter, LocalFileStorage, MapAccessor, MapState, MemoryStorage, PairsAccessor, PairsState,
    PersistConfig, PersistError, PersistedRecord, RehydrateInput, Result, SerializationPolicy,
    Serializer, StorageBackend, Store,
};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Backend that records write attempts and detects overlapping writes
#[derive(Default)]
struct RecordingBackend {
    records: MemoryStorage,
    attempts: Mutex<Vec<(String, PersistedRecord)>>,
    in_flight: AtomicBool,
    overlaps: AtomicUsize,
    delay: Duration,
    slow_keys: HashSet<String>,
    failing_keys: HashSet<String>,
}

impl RecordingBackend {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn attempts(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn attempted_records(&self) -> Vec<(String, PersistedRecord)> {
        self.attempts.lock().unwrap().clone()
    }

    fn stored_keys(&self) -> Vec<String> {
        self.records.snapshot().into_keys().collect()
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for RecordingBackend {
    async fn get_item(&self, key: &str) -> Result<Option<PersistedRecord>> {
        self.records.get_item(key).await
    }

    async fn set_item(&self, key: &str, record: PersistedRecord) -> Result<()> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let _guard = InFlight(&self.in_flight);
        self.attempts
            .lock()
            .unwrap()
            .push((key.to_string(), record.clone()));

        if self.slow_keys.contains(key) {
            tokio::time::sleep(Duration::from_secs(10)).await;
        } else if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing_keys.contains(key) {
            return Err(PersistError::storage(format!("refusing to write {key}")));
        }
        self.records.set_item(key, record).await
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.records.remove_item(key).await
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        self.records.get_all_keys().await
    }
}

/// Serializer that refuses string values
struct RejectStrings;

impl Serializer for RejectStrings {
    fn serialize(&self, value: &Value) -> Result<PersistedRecord> {
        if value.is_string() {
            return Err(PersistError::invalid_format("strings cannot be stored"));
        }
        JsonSerializer.serialize(value)
    }

    fn deserialize(&self, record: &PersistedRecord) -> Result<Value> {
        JsonSerializer.deserialize(record)
    }
}

fn new_store() -> Arc<InMemoryStore<MapState>> {
    Arc::new(InMemoryStore::new(MapState::new()))
}

fn set(store: &InMemoryStore<MapState>, value: Value) {
    store.set_state(MapAccessor::from_value(value));
}

/// Replace a single substate, keeping the others identical
fn set_key(store: &InMemoryStore<MapState>, key: &str, value: Value) {
    store.update(|state| {
        let mut next = state.clone();
        next.insert(key.to_string(), Arc::new(value));
        next
    });
}

fn encoded(text: &str) -> PersistedRecord {
    PersistedRecord::Encoded(text.to_string())
}

fn wrap_transform(tag: &'static str) -> persist_core::FnTransform {
    create_transform(
        move |state: &Value, _: &str| {
            let mut wrapped = serde_json::Map::new();
            wrapped.insert(tag.to_string(), state.clone());
            Ok(Some(Value::Object(wrapped)))
        },
        move |state: &Value, key: &str| {
            state
                .get(tag)
                .cloned()
                .ok_or_else(|| PersistError::transform(key, format!("missing {tag}")))
        },
        KeyFilter::allow_all(),
    )
}

#[tokio::test]
async fn test_only_allowed_keys_are_written() {
    let store = new_store();
    let storage = MemoryStorage::new();
    let config = PersistConfig::new(storage.clone())
        .whitelist(["a", "b"])
        .blacklist(["b"]);
    let persistor = create_persistor(Arc::clone(&store), config).unwrap();

    set(&store, json!({"a": 1, "b": 2, "c": 3}));
    persistor.flush().await.unwrap();

    let keys: Vec<_> = storage.snapshot().into_keys().collect();
    assert_eq!(keys, vec!["persist:a"]);
}

#[tokio::test]
async fn test_transforms_apply_in_order_and_reverse_on_read() {
    let storage = MemoryStorage::new();
    let config = || {
        PersistConfig::new(storage.clone())
            .transform(wrap_transform("t1"))
            .transform(wrap_transform("t2"))
    };

    let store = new_store();
    let persistor = create_persistor(Arc::clone(&store), config()).unwrap();
    set(&store, json!({"k": 1}));
    persistor.flush().await.unwrap();
    assert_eq!(
        storage.snapshot().get("persist:k"),
        Some(&encoded(r#"{"t2":{"t1":1}}"#))
    );
    drop(persistor);

    let restored_store = new_store();
    let restored = create_persistor(Arc::clone(&restored_store), config()).unwrap();
    let state = restored.restore().await.unwrap();
    assert_eq!(MapAccessor::to_value(&state), json!({"k": 1}));
    assert_eq!(restored_store.rehydrate_count(), 1);
    restored.flush().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_zero_debounce_writes_one_key_at_a_time_in_order() {
    let store = new_store();
    let backend = Arc::new(RecordingBackend::with_delay(Duration::from_millis(5)));
    let persistor =
        create_persistor(Arc::clone(&store), PersistConfig::new(Arc::clone(&backend))).unwrap();

    set(&store, json!({"a": 1, "b": 2, "c": 3}));
    assert_eq!(persistor.pending_keys(), vec!["a", "b", "c"]);
    persistor.flush().await.unwrap();

    assert_eq!(
        backend.attempts(),
        vec!["persist:a", "persist:b", "persist:c"]
    );
    assert_eq!(backend.overlaps.load(Ordering::SeqCst), 0);
    assert!(persistor.is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_debounce_spaces_out_writes() {
    let store = new_store();
    let storage = MemoryStorage::new();
    let config = PersistConfig::new(storage.clone()).debounce(Duration::from_millis(100));
    let persistor = create_persistor(Arc::clone(&store), config).unwrap();

    let started = tokio::time::Instant::now();
    set(&store, json!({"a": 1, "b": 2, "c": 3}));
    persistor.flush().await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(storage.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_key_changed_during_its_write_is_written_again() {
    let store = new_store();
    let backend = Arc::new(RecordingBackend::with_delay(Duration::from_millis(50)));
    let config = PersistConfig::new(Arc::clone(&backend)).debounce(Duration::from_millis(10));
    let persistor = create_persistor(Arc::clone(&store), config).unwrap();

    set(&store, json!({"a": 1, "b": 2, "c": 3}));
    // First tick at 10ms starts writing "a"; ticks during the write do nothing
    tokio::time::sleep(Duration::from_millis(15)).await;
    assert!(!persistor.is_idle());
    set_key(&store, "a", json!(9));
    assert_eq!(persistor.pending_keys(), vec!["b", "c", "a"]);
    persistor.flush().await.unwrap();

    assert_eq!(
        backend.attempted_records(),
        vec![
            ("persist:a".to_string(), encoded("1")),
            ("persist:b".to_string(), encoded("2")),
            ("persist:c".to_string(), encoded("3")),
            ("persist:a".to_string(), encoded("9")),
        ]
    );
    assert_eq!(backend.overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_last_write_wins_for_a_queued_key() {
    let store = new_store();
    let backend = Arc::new(RecordingBackend::default());
    let persistor =
        create_persistor(Arc::clone(&store), PersistConfig::new(Arc::clone(&backend))).unwrap();

    set_key(&store, "a", json!(1));
    set_key(&store, "a", json!(2));
    persistor.flush().await.unwrap();

    assert_eq!(backend.attempts(), vec!["persist:a"]);
    assert_eq!(
        backend.records.snapshot().get("persist:a"),
        Some(&encoded("2"))
    );
}

#[tokio::test]
async fn test_unchanged_substates_are_not_rewritten() {
    let store = new_store();
    let backend = Arc::new(RecordingBackend::default());
    let persistor =
        create_persistor(Arc::clone(&store), PersistConfig::new(Arc::clone(&backend))).unwrap();

    set(&store, json!({"a": 1, "b": 2}));
    persistor.flush().await.unwrap();
    set_key(&store, "b", json!(3));
    persistor.flush().await.unwrap();

    assert_eq!(
        backend.attempts(),
        vec!["persist:a", "persist:b", "persist:b"]
    );
}

#[tokio::test]
async fn test_restore_skips_corrupt_record() {
    let storage = MemoryStorage::new();
    storage.insert("persist:a", encoded("1"));
    storage.insert("persist:b", encoded("{not json"));
    storage.insert("persist:c", encoded("[3]"));

    let store = new_store();
    let persistor = create_persistor(Arc::clone(&store), PersistConfig::new(storage)).unwrap();
    let state = persistor.restore().await.unwrap();

    assert_eq!(MapAccessor::to_value(&state), json!({"a": 1, "c": [3]}));
    assert_eq!(store.rehydrate_count(), 1);
    assert_eq!(MapAccessor::to_value(&store.get_state()), json!({"a": 1, "c": [3]}));
    persistor.flush().await.unwrap();
}

#[tokio::test]
async fn test_pause_stops_queueing_until_resume() {
    let store = new_store();
    let storage = MemoryStorage::new();
    let persistor = create_persistor(Arc::clone(&store), PersistConfig::new(storage.clone())).unwrap();

    persistor.pause();
    set_key(&store, "a", json!(1));
    persistor.flush().await.unwrap();
    assert!(storage.is_empty());
    assert!(persistor.pending_keys().is_empty());

    // Detection after resume compares against the snapshot from before the pause
    persistor.resume();
    set_key(&store, "b", json!(2));
    persistor.flush().await.unwrap();

    let keys: Vec<_> = storage.snapshot().into_keys().collect();
    assert_eq!(keys, vec!["persist:a", "persist:b"]);
}

#[tokio::test]
async fn test_purge_named_keys_and_everything() {
    let store = new_store();
    let storage = MemoryStorage::new();
    storage.insert("other:a", encoded("0"));
    let persistor = create_persistor(Arc::clone(&store), PersistConfig::new(storage.clone())).unwrap();

    set(&store, json!({"a": 1, "b": 2}));
    persistor.flush().await.unwrap();
    assert_eq!(storage.len(), 3);

    persistor.purge(Some(&["a".to_string()])).await.unwrap();
    let keys: Vec<_> = storage.snapshot().into_keys().collect();
    assert_eq!(keys, vec!["other:a", "persist:b"]);

    persistor.purge(None).await.unwrap();
    let keys: Vec<_> = storage.snapshot().into_keys().collect();
    assert_eq!(keys, vec!["other:a"]);
}

#[tokio::test]
async fn test_async_transform_failure_keeps_pre_failure_value() {
    let store = new_store();
    let storage = MemoryStorage::new();
    let tagging = create_async_transform(
        |state: Value, _key: String| async move { Ok::<_, PersistError>(Some(json!({"t1": state}))) }.boxed(),
        |state: &Value, _: &str| Ok(state.clone()),
        KeyFilter::allow_all(),
    );
    let failing = create_async_transform(
        |_state: Value, key: String| {
            async move { Err::<Option<Value>, _>(PersistError::transform(key, "remote unavailable")) }
                .boxed()
        },
        |state: &Value, _: &str| Ok(state.clone()),
        KeyFilter::allow_all(),
    );
    let config = PersistConfig::new(storage.clone())
        .async_transforms(true)
        .transform(tagging)
        .transform(failing);
    let persistor = create_persistor(Arc::clone(&store), config).unwrap();

    set(&store, json!({"k": 5}));
    persistor.flush().await.unwrap();

    assert_eq!(
        storage.snapshot().get("persist:k"),
        Some(&encoded(r#"{"t1":5}"#))
    );
}

#[tokio::test]
async fn test_transform_returning_none_skips_the_write() {
    let store = new_store();
    let storage = MemoryStorage::new();
    let redact = create_transform(
        |_: &Value, _: &str| Ok(None),
        |state: &Value, _: &str| Ok(state.clone()),
        KeyFilter::new(Some(["secret"]), Vec::<&str>::new()),
    );
    let config = PersistConfig::new(storage.clone()).transform(redact);
    let persistor = create_persistor(Arc::clone(&store), config).unwrap();

    set(&store, json!({"secret": "hunter2", "open": true}));
    persistor.flush().await.unwrap();

    let keys: Vec<_> = storage.snapshot().into_keys().collect();
    assert_eq!(keys, vec!["persist:open"]);
}

#[tokio::test]
async fn test_panicking_transform_does_not_stall_other_keys() {
    let store = new_store();
    let storage = MemoryStorage::new();
    let explode = create_transform(
        |_: &Value, key: &str| -> Result<Option<Value>> { panic!("cannot write {key}") },
        |state: &Value, _: &str| Ok(state.clone()),
        KeyFilter::new(Some(["a"]), Vec::<&str>::new()),
    );
    let config = PersistConfig::new(storage.clone()).transform(explode);
    let persistor = create_persistor(Arc::clone(&store), config).unwrap();

    set(&store, json!({"a": 1, "b": 2}));
    tokio::time::timeout(Duration::from_secs(2), persistor.flush())
        .await
        .expect("flush should finish after a panicking write")
        .unwrap();

    let keys: Vec<_> = storage.snapshot().into_keys().collect();
    assert_eq!(keys, vec!["persist:b"]);
    assert!(persistor.pending_keys().is_empty());
    assert!(persistor.is_idle());
}

#[tokio::test]
async fn test_storage_error_does_not_stop_the_queue() {
    let store = new_store();
    let backend = Arc::new(RecordingBackend {
        failing_keys: HashSet::from(["persist:a".to_string()]),
        ..RecordingBackend::default()
    });
    let persistor =
        create_persistor(Arc::clone(&store), PersistConfig::new(Arc::clone(&backend))).unwrap();

    set(&store, json!({"a": 1, "b": 2}));
    persistor.flush().await.unwrap();

    assert_eq!(backend.attempts(), vec!["persist:a", "persist:b"]);
    assert_eq!(backend.stored_keys(), vec!["persist:b"]);
}

#[tokio::test(start_paused = true)]
async fn test_write_timeout_releases_the_scheduler() {
    let store = new_store();
    let backend = Arc::new(RecordingBackend {
        slow_keys: HashSet::from(["persist:a".to_string()]),
        ..RecordingBackend::default()
    });
    let config =
        PersistConfig::new(Arc::clone(&backend)).write_timeout(Duration::from_millis(100));
    let persistor = create_persistor(Arc::clone(&store), config).unwrap();

    set(&store, json!({"a": 1, "b": 2}));
    persistor.flush().await.unwrap();

    assert_eq!(backend.attempts(), vec!["persist:a", "persist:b"]);
    assert_eq!(backend.stored_keys(), vec!["persist:b"]);
}

#[tokio::test]
async fn test_strict_serialization_failure_halts_the_persistor() {
    let store = new_store();
    let storage = MemoryStorage::new();
    let config = PersistConfig::new(storage.clone())
        .serializer(RejectStrings)
        .serialization_errors(SerializationPolicy::Strict);
    let persistor = create_persistor(Arc::clone(&store), config).unwrap();

    set(&store, json!({"a": "text", "b": 1}));
    let result = persistor.flush().await;
    assert!(matches!(result, Err(PersistError::Halted(_))));
    assert!(storage.is_empty());

    set_key(&store, "c", json!(3));
    assert!(persistor.pending_keys().is_empty());
}

#[tokio::test]
async fn test_lenient_serialization_failure_omits_the_record() {
    let store = new_store();
    let storage = MemoryStorage::new();
    let config = PersistConfig::new(storage.clone())
        .serializer(RejectStrings)
        .serialization_errors(SerializationPolicy::Lenient);
    let persistor = create_persistor(Arc::clone(&store), config).unwrap();

    set(&store, json!({"a": "text", "b": 1}));
    persistor.flush().await.unwrap();

    let keys: Vec<_> = storage.snapshot().into_keys().collect();
    assert_eq!(keys, vec!["persist:b"]);
}

#[tokio::test]
async fn test_serial_rehydrate_rejects_async_transforms() {
    let store = new_store();
    let config = PersistConfig::new(MemoryStorage::new()).async_transforms(true);
    let persistor = create_persistor(Arc::clone(&store), config).unwrap();

    let result = persistor.rehydrate(RehydrateInput::Serial(vec![("a".to_string(), encoded("1"))]));
    assert!(matches!(result, Err(PersistError::Configuration(_))));
    assert_eq!(store.rehydrate_count(), 0);
}

#[tokio::test]
async fn test_assembled_state_is_passed_through() {
    let store = new_store();
    let persistor =
        create_persistor(Arc::clone(&store), PersistConfig::new(MemoryStorage::new())).unwrap();

    let assembled = MapAccessor::from_value(json!({"x": {"y": 1}}));
    let state = persistor
        .rehydrate(RehydrateInput::State(assembled.clone()))
        .unwrap();

    assert_eq!(state, assembled);
    assert_eq!(store.rehydrate_count(), 1);
    persistor.flush().await.unwrap();
}

#[tokio::test]
async fn test_instances_do_not_share_state() {
    let storage = MemoryStorage::new();
    let first_store = new_store();
    let second_store = new_store();
    let first = create_persistor(
        Arc::clone(&first_store),
        PersistConfig::new(storage.clone()).key_prefix("first:"),
    )
    .unwrap();
    let second = create_persistor(
        Arc::clone(&second_store),
        PersistConfig::new(storage.clone()).key_prefix("second:"),
    )
    .unwrap();

    first.pause();
    set(&first_store, json!({"a": 1}));
    set(&second_store, json!({"a": 2}));
    first.flush().await.unwrap();
    second.flush().await.unwrap();

    assert!(!second.is_paused());
    let keys: Vec<_> = storage.snapshot().into_keys().collect();
    assert_eq!(keys, vec!["second:a"]);

    second.purge(None).await.unwrap();
    assert!(storage.is_empty());
}

#[tokio::test]
async fn test_pairs_state_writes_follow_state_order() {
    let store = Arc::new(InMemoryStore::new(PairsState::new()));
    let backend = Arc::new(RecordingBackend::default());
    let config = PersistConfig::new(Arc::clone(&backend)).with_accessor(PairsAccessor);
    let persistor = create_persistor(Arc::clone(&store), config).unwrap();

    store.set_state(vec![
        ("z".to_string(), Arc::new(json!(1))),
        ("a".to_string(), Arc::new(json!(2))),
    ]);
    persistor.flush().await.unwrap();

    assert_eq!(backend.attempts(), vec!["persist:z", "persist:a"]);
}

#[tokio::test]
async fn test_local_files_survive_a_restart() {
    let temp_dir = TempDir::new().unwrap();

    let store = new_store();
    let persistor = create_persistor(
        Arc::clone(&store),
        PersistConfig::new(LocalFileStorage::with_base_dir(temp_dir.path())),
    )
    .unwrap();
    set(&store, json!({"todos": ["one", "two"], "count": 2}));
    persistor.flush().await.unwrap();
    drop(persistor);

    let restarted_store = new_store();
    let restarted = create_persistor(
        Arc::clone(&restarted_store),
        PersistConfig::new(LocalFileStorage::with_base_dir(temp_dir.path())),
    )
    .unwrap();
    let state = restarted.restore().await.unwrap();
    assert_eq!(
        MapAccessor::to_value(&state),
        json!({"todos": ["one", "two"], "count": 2})
    );
    restarted.flush().await.unwrap();
}

mock! {
    Backend {}

    #[async_trait]
    impl StorageBackend for Backend {
        async fn get_item(&self, key: &str) -> Result<Option<PersistedRecord>>;
        async fn set_item(&self, key: &str, record: PersistedRecord) -> Result<()>;
        async fn remove_item(&self, key: &str) -> Result<()>;
        async fn get_all_keys(&self) -> Result<Vec<String>>;
    }
}

#[tokio::test]
async fn test_failed_write_is_attempted_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let mut backend = MockBackend::new();
    backend.expect_set_item().returning(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(PersistError::storage("quota exceeded"))
    });

    let store = new_store();
    let persistor = create_persistor(Arc::clone(&store), PersistConfig::new(backend)).unwrap();
    set(&store, json!({"a": 1}));
    persistor.flush().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(persistor.is_idle());
}
