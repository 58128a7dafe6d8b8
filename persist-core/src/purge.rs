/*!
Bulk operations on stored records: purging and loading.
*/

use tracing::{debug, warn};

use crate::filter::KeyFilter;
use crate::storage::{storage_key, PersistedRecord, StorageBackend};
use crate::Result;

/// Remove persisted records.
///
/// With `keys`, removes `key_prefix + key` for each key. Without, removes every
/// enumerated storage key that starts with `key_prefix`. All removals are
/// attempted; the first failure is returned afterwards.
pub async fn purge_stored_state(
    storage: &dyn StorageBackend,
    key_prefix: &str,
    keys: Option<&[String]>,
) -> Result<()> {
    let targets: Vec<String> = match keys {
        Some(keys) => keys.iter().map(|key| storage_key(key_prefix, key)).collect(),
        None => storage
            .get_all_keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(key_prefix))
            .collect(),
    };

    let mut first_error = None;
    for target in &targets {
        if let Err(e) = storage.remove_item(target).await {
            warn!(storage_key = %target, error = %e, "Error purging stored state");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    debug!(count = targets.len(), "Purged stored state");

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Load every stored record under `key_prefix` whose key passes `filter`.
///
/// Keys are returned without the prefix, sorted, ready for a serial rehydrate.
/// A record that cannot be read is logged and skipped.
pub async fn get_stored_state(
    storage: &dyn StorageBackend,
    key_prefix: &str,
    filter: &KeyFilter,
) -> Result<Vec<(String, PersistedRecord)>> {
    let mut keys: Vec<String> = storage
        .get_all_keys()
        .await?
        .into_iter()
        .filter_map(|key| key.strip_prefix(key_prefix).map(str::to_string))
        .filter(|key| filter.allows(key))
        .collect();
    keys.sort();

    let mut records = Vec::with_capacity(keys.len());
    for key in keys {
        match storage.get_item(&storage_key(key_prefix, &key)).await {
            Ok(Some(record)) => records.push((key, record)),
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Error reading stored state for key"),
        }
    }
    Ok(records)
}
