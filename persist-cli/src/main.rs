/*!
Persist CLI - Command-line interface for persisted state records.

This CLI provides utilities for inspecting, editing, restoring and purging the
records a persistor keeps in a local storage directory.
*/

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use persist_core::{
    create_persistor, get_stored_state, purge_stored_state, storage_key, InMemoryStore,
    IntegrityTransform, JsonSerializer, LocalFileStorage, MapAccessor, MapState,
    PassthroughSerializer, PersistConfig, PersistError, PersistSettings, PersistedRecord,
    Rehydrator, Serializer, StorageBackend, Transform, TransformPipeline,
};
use tabled::{Table, Tabled};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "persist")]
#[command(about = "CLI for inspecting and managing persisted state records")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the stored records
    #[arg(short, long, global = true, env = "PERSIST_DIR", default_value = "./persisted")]
    dir: PathBuf,

    /// Storage key prefix (overrides the configuration file)
    #[arg(short, long, global = true, env = "PERSIST_KEY_PREFIX")]
    prefix: Option<String>,

    /// Persistor settings file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored records
    List,
    /// Show the decoded value of one record
    Show {
        /// Substate key (without prefix)
        key: String,
        /// Print the stored record instead of the decoded value
        #[arg(long)]
        raw: bool,
    },
    /// Store a JSON value under a key
    Set {
        /// Substate key (without prefix)
        key: String,
        /// Value as JSON text
        value: String,
    },
    /// Rehydrate every stored record and print the assembled state
    Restore,
    /// Check records written through the integrity transform
    Verify,
    /// Remove stored records
    Purge {
        /// Keys to remove; every record under the prefix when omitted
        keys: Vec<String>,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Tabled)]
struct RecordInfo {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Storage Key")]
    storage_key: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    let settings = load_settings(&cli)?;
    let storage = LocalFileStorage::with_base_dir(&cli.dir);

    // Execute command
    match cli.command {
        Commands::List => list_records(&storage, &settings).await?,
        Commands::Show { key, raw } => show_record(&storage, &settings, &key, raw).await?,
        Commands::Set { key, value } => set_record(&storage, &settings, &key, &value).await?,
        Commands::Restore => restore_state(storage, settings).await?,
        Commands::Verify => verify_records(&storage, &settings).await?,
        Commands::Purge { keys, force } => purge_records(&storage, &settings, keys, force).await?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_settings(cli: &Cli) -> Result<PersistSettings, anyhow::Error> {
    let mut settings = match &cli.config {
        Some(path) => PersistSettings::from_file(path)?,
        None => PersistSettings::default(),
    };
    if let Some(prefix) = &cli.prefix {
        settings.key_prefix = prefix.clone();
    }
    settings.validate()?;
    Ok(settings)
}

/// Rehydrator matching the settings, without user transforms
fn plain_rehydrator(settings: &PersistSettings) -> Rehydrator {
    let serializer: Arc<dyn Serializer> = if settings.serialize {
        Arc::new(JsonSerializer)
    } else {
        Arc::new(PassthroughSerializer)
    };
    Rehydrator::new(serializer, TransformPipeline::default())
}

async fn list_records(
    storage: &LocalFileStorage,
    settings: &PersistSettings,
) -> Result<(), anyhow::Error> {
    info!("Listing records in {}", storage.base_dir().display());

    let records = get_stored_state(storage, &settings.key_prefix, &settings.filter()).await?;
    if records.is_empty() {
        println!("No records found");
        return Ok(());
    }

    let rows: Vec<RecordInfo> = records
        .into_iter()
        .map(|(key, record)| RecordInfo {
            storage_key: storage_key(&settings.key_prefix, &key),
            kind: record.kind().to_string(),
            size: format_size(record.size_hint() as u64),
            key,
        })
        .collect();

    let table = Table::new(rows);
    println!("{table}");
    Ok(())
}

async fn show_record(
    storage: &LocalFileStorage,
    settings: &PersistSettings,
    key: &str,
    raw: bool,
) -> Result<(), anyhow::Error> {
    let target = storage_key(&settings.key_prefix, key);
    let Some(record) = storage.get_item(&target).await? else {
        return Err(anyhow::anyhow!("No record stored under '{target}'"));
    };

    if raw {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    match plain_rehydrator(settings).restore_key(key, &record) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(e) => {
            error!("Failed to decode record {}: {}", target, e);
            return Err(e.into());
        }
    }
    Ok(())
}

async fn set_record(
    storage: &LocalFileStorage,
    settings: &PersistSettings,
    key: &str,
    value: &str,
) -> Result<(), anyhow::Error> {
    let value: serde_json::Value = serde_json::from_str(value)?;
    let record = if settings.serialize {
        PersistedRecord::Encoded(serde_json::to_string(&value)?)
    } else {
        PersistedRecord::Raw(value)
    };

    let target = storage_key(&settings.key_prefix, key);
    storage.set_item(&target, record).await?;
    println!("✓ Stored {target}");
    Ok(())
}

async fn restore_state(
    storage: LocalFileStorage,
    settings: PersistSettings,
) -> Result<(), anyhow::Error> {
    let store = Arc::new(InMemoryStore::new(MapState::new()));
    let config = PersistConfig::new(storage).with_settings(settings);
    let persistor = create_persistor(Arc::clone(&store), config)?;

    // Read-only: rehydration must not write the records back
    persistor.pause();
    let state = persistor.restore().await?;

    info!("Restored {} keys", state.len());
    println!(
        "{}",
        serde_json::to_string_pretty(&MapAccessor::to_value(&state))?
    );
    Ok(())
}

async fn verify_records(
    storage: &LocalFileStorage,
    settings: &PersistSettings,
) -> Result<(), anyhow::Error> {
    let records = get_stored_state(storage, &settings.key_prefix, &settings.filter()).await?;
    let rehydrator = plain_rehydrator(settings);
    let integrity = IntegrityTransform::new();

    let mut failures = 0;
    for (key, record) in &records {
        let checked = rehydrator
            .restore_key(key, record)
            .and_then(|value| integrity.outbound(&value, key));
        match checked {
            Ok(_) => println!("✓ {key}"),
            Err(PersistError::IntegrityCheckFailed { expected, actual }) => {
                failures += 1;
                error!("✗ {}: integrity check failed", key);
                error!("  Expected hash: {}", expected);
                error!("  Actual hash: {}", actual);
            }
            Err(e) => {
                failures += 1;
                error!("✗ {}: {}", key, e);
            }
        }
    }

    if failures > 0 {
        return Err(anyhow::anyhow!(
            "{failures} of {} records failed verification",
            records.len()
        ));
    }
    println!("✓ {} records verified", records.len());
    Ok(())
}

async fn purge_records(
    storage: &LocalFileStorage,
    settings: &PersistSettings,
    keys: Vec<String>,
    force: bool,
) -> Result<(), anyhow::Error> {
    let description = if keys.is_empty() {
        format!("every record under '{}'", settings.key_prefix)
    } else {
        keys.join(", ")
    };

    if !force {
        print!("Are you sure you want to purge {description}? (y/N): ");
        use std::io::{self, Write};
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().to_lowercase().starts_with('y') {
            println!("Purge cancelled");
            return Ok(());
        }
    }

    let keys = (!keys.is_empty()).then_some(keys);
    if let Err(e) = purge_stored_state(storage, &settings.key_prefix, keys.as_deref()).await {
        warn!("Purge did not complete: {}", e);
        return Err(e.into());
    }
    println!("✓ Purged {description}");
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
