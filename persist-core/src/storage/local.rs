/*!
Local filesystem storage adapter implementation.
*/

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::fs;
use tracing::debug;

use super::{PersistedRecord, StorageBackend};
use crate::{PersistError, Result};

const RECORD_EXTENSION: &str = "record.json";

/// Local filesystem storage adapter
///
/// Each storage key is kept in its own file under a base directory. Keys are
/// encoded into portable file names, so prefixes such as `persist:` are safe on
/// every platform. The base directory is created on first write.
///
/// # Example
/// ```rust,no_run
/// use persist_core::storage::{LocalFileStorage, PersistedRecord, StorageBackend};
///
/// # async fn demo() -> persist_core::Result<()> {
/// let storage = LocalFileStorage::with_base_dir("/var/lib/myapp/state");
/// storage
///     .set_item("persist:todos", PersistedRecord::Encoded("[]".to_string()))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    /// Directory holding one file per storage key
    base_dir: PathBuf,
}

impl LocalFileStorage {
    /// Create a storage adapter rooted at `base_dir`
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve the file path for a storage key
    fn resolve_path(&self, key: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.{RECORD_EXTENSION}", encode_file_name(key)))
    }

    async fn ensure_base_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            PersistError::storage(format!(
                "Failed to create directory {}: {}",
                self.base_dir.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl StorageBackend for LocalFileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<PersistedRecord>> {
        let full_path = self.resolve_path(key);
        let bytes = match fs::read(&full_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PersistError::storage(format!(
                    "Failed to read record from {}: {}",
                    full_path.display(),
                    e
                )))
            }
        };

        let record = serde_json::from_slice(&bytes).map_err(|e| {
            PersistError::invalid_format(format!(
                "Corrupt record file {}: {}",
                full_path.display(),
                e
            ))
        })?;
        Ok(Some(record))
    }

    async fn set_item(&self, key: &str, record: PersistedRecord) -> Result<()> {
        self.ensure_base_dir().await?;

        let full_path = self.resolve_path(key);
        let bytes = serde_json::to_vec(&record)?;

        // Write next to the target and rename so readers never see a torn file
        let staging = full_path.with_extension("tmp");
        fs::write(&staging, &bytes).await.map_err(|e| {
            PersistError::storage(format!(
                "Failed to write record to {}: {}",
                staging.display(),
                e
            ))
        })?;
        fs::rename(&staging, &full_path).await.map_err(|e| {
            PersistError::storage(format!(
                "Failed to move record into {}: {}",
                full_path.display(),
                e
            ))
        })?;

        debug!(key = %key, bytes = bytes.len(), "Wrote record file");
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        let full_path = self.resolve_path(key);
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistError::storage(format!(
                "Failed to delete record {}: {}",
                full_path.display(),
                e
            ))),
        }
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let suffix = format!(".{RECORD_EXTENSION}");
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(&suffix) else {
                continue;
            };
            if let Some(key) = decode_file_name(stem) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Bytes kept verbatim in file names: `[A-Za-z0-9_-]`
const FILE_NAME: &AsciiSet = &NON_ALPHANUMERIC.remove(b'_').remove(b'-');

fn encode_file_name(key: &str) -> String {
    utf8_percent_encode(key, FILE_NAME).to_string()
}

fn decode_file_name(name: &str) -> Option<String> {
    percent_decode_str(name)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}
