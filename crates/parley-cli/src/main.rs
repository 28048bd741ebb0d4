//! Operator tool for a local Parley store
//!
//! Inspects and maintains the encrypted store outside the app:
//! - Read, write and delete documents
//! - List collections and keys
//! - Report lifecycle, key and backup status
//! - Wipe a session store, with or without backup

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use parley_store::{
    DatabaseLifecycle, FileCredentialStore, Identity, KeyAccess, KeyVault, ObjectStore,
    ObserverCursor, Reader, StoreConfig, WipeOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Passphrase that unlocks the file credential store
const PASSPHRASE_ENV: &str = "PARLEY_PASSPHRASE";

/// How long `put` waits for its queued write to commit
const COMMIT_WAIT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley local store maintenance", long_about = None)]
struct Cli {
    /// Account identity; omit for single-account installs
    #[arg(short, long, global = true)]
    account: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a document
    Put {
        /// Collection name
        collection: String,

        /// Document body (stored as UTF-8 bytes)
        value: String,

        /// Document key (a random UUID if omitted)
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Print a document
    Get {
        /// Collection name
        collection: String,

        /// Document key
        key: String,
    },

    /// Delete documents
    Rm {
        /// Collection name
        collection: String,

        /// Keys to delete; all documents in the collection if none given
        keys: Vec<String>,
    },

    /// List collections, or the keys of one collection
    Ls {
        /// Collection name
        collection: Option<String>,
    },

    /// Count documents in a collection
    Count {
        /// Collection name
        collection: String,
    },

    /// Show key, store and backup status
    Status,

    /// Tear down the session store
    Wipe {
        /// Identity is verified: move the store to backup instead of deleting it
        #[arg(long)]
        confirmed: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let identity = cli
        .account
        .map(Identity::account)
        .unwrap_or_else(Identity::single_account);
    let lifecycle = open_lifecycle()?;

    let result = match cli.command {
        Commands::Put {
            collection,
            value,
            key,
        } => {
            let store = lifecycle.open_or_create(&identity)?;
            run_put(&store, collection, value, key).await
        }
        Commands::Get { collection, key } => {
            let store = lifecycle.open_or_create(&identity)?;
            run_get(&store, &collection, &key)
        }
        Commands::Rm { collection, keys } => {
            let store = lifecycle.open_or_create(&identity)?;
            run_rm(&store, &collection, keys)
        }
        Commands::Ls { collection } => {
            let store = lifecycle.open_or_create(&identity)?;
            run_ls(&store, collection.as_deref())
        }
        Commands::Count { collection } => {
            let store = lifecycle.open_or_create(&identity)?;
            let count = store.read(|s| s.count(&collection))??;
            println!("{}", count);
            Ok(())
        }
        Commands::Status => run_status(&lifecycle, &identity),
        Commands::Wipe { confirmed } => run_wipe(&lifecycle, &identity, confirmed),
    };

    lifecycle.close();
    result
}

fn open_lifecycle() -> anyhow::Result<DatabaseLifecycle> {
    let config = StoreConfig::from_env();
    let credentials = Arc::new(FileCredentialStore::new(config.data_dir.join("credentials")));

    match std::env::var(PASSPHRASE_ENV) {
        Ok(passphrase) => credentials
            .unlock(&passphrase)
            .context("failed to unlock credential store")?,
        Err(_) => warn!("{} not set; store keys are unavailable", PASSPHRASE_ENV),
    }

    // An operator running the tool has already verified who they are
    Ok(DatabaseLifecycle::new(
        config,
        KeyVault::new(credentials),
        Arc::new(|_: &Identity| true),
    ))
}

async fn run_put(
    store: &ObjectStore,
    collection: String,
    value: String,
    key: Option<String>,
) -> anyhow::Result<()> {
    let key = key.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut cursor = store.begin_observing();

    let (queued_key, queued_collection) = (key.clone(), collection.clone());
    store.async_read_write(move |tx| {
        tx.set(Some(value.as_bytes()), &queued_key, &queued_collection)
    })?;

    // Queued writes report completion only through the notifier
    let seq = tokio::time::timeout(
        COMMIT_WAIT,
        wait_for_commit(store, &mut cursor, &collection, &key),
    )
    .await
    .with_context(|| format!("write for '{}' did not commit within {:?}", key, COMMIT_WAIT))??;

    info!("Stored '{}' at seq {}", key, seq);
    println!("{}", key);
    Ok(())
}

/// Follow `cursor` until a commit touching `key` lands and return its seq.
///
/// Commits by other writers are skipped over.
async fn wait_for_commit(
    store: &ObjectStore,
    cursor: &mut ObserverCursor,
    collection: &str,
    key: &str,
) -> parley_store::Result<u64> {
    loop {
        let latest = cursor.changed().await?;
        let committed = cursor
            .pending()
            .iter()
            .find(|set| {
                set.changes
                    .iter()
                    .any(|c| c.key == key && c.collection == collection)
            })
            .map(|set| set.seq);
        store.notifier().advance(cursor, latest);
        if let Some(seq) = committed {
            return Ok(seq);
        }
    }
}

fn run_get(store: &ObjectStore, collection: &str, key: &str) -> anyhow::Result<()> {
    let document = store.read(|s| s.get_document(key, collection))??;
    let Some(document) = document else {
        bail!("no document '{}' in '{}'", key, collection);
    };
    println!("{}", String::from_utf8_lossy(&document.payload));
    if let Some(metadata) = document.metadata {
        println!("metadata: {}", String::from_utf8_lossy(&metadata));
    }
    Ok(())
}

fn run_rm(store: &ObjectStore, collection: &str, keys: Vec<String>) -> anyhow::Result<()> {
    let removed = store.read_write(|tx| {
        if keys.is_empty() {
            tx.remove_all(collection)
        } else {
            tx.remove_many(&keys, collection)
        }
    })?;
    info!("Removed {} document(s) from '{}'", removed, collection);
    Ok(())
}

fn run_ls(store: &ObjectStore, collection: Option<&str>) -> anyhow::Result<()> {
    let names = store.read(|s| match collection {
        Some(collection) => s.keys(collection),
        None => s.collections(),
    })??;
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

fn run_status(lifecycle: &DatabaseLifecycle, identity: &Identity) -> anyhow::Result<()> {
    let config = lifecycle.config();
    println!("identity:   {}", identity);
    println!("store:      {}", config.store_path().display());
    println!("backup dir: {}", config.backup_dir.display());

    let access = lifecycle.vault().access(identity);
    let described = match &access {
        Ok(KeyAccess::Unlocked) => "unlocked".to_string(),
        Ok(KeyAccess::Locked) => format!("locked (set {})", PASSPHRASE_ENV),
        Ok(KeyAccess::Absent) => "absent".to_string(),
        Err(e) => format!("unreadable: {}", e),
    };
    println!("key:        {}", described);
    println!("backup:     {}", if lifecycle.has_backup(identity) { "present" } else { "none" });

    // Status never creates, restores or replaces a store
    if !config.store_path().exists() {
        println!("documents:  (no store)");
        return Ok(());
    }
    if !lifecycle.owns_live_store(identity)? {
        println!("documents:  (store belongs to another identity)");
        return Ok(());
    }
    if !matches!(access, Ok(KeyAccess::Unlocked)) {
        println!("documents:  (key unavailable)");
        return Ok(());
    }
    let store = lifecycle.open_or_create(identity)?;
    println!("state:      {:?}", lifecycle.state());
    println!("seq:        {}", store.notifier().latest_seq());
    let counts = store.read(|s| -> parley_store::Result<Vec<(String, usize)>> {
        s.collections()?
            .into_iter()
            .map(|c| s.count(&c).map(|n| (c, n)))
            .collect()
    })??;
    for (collection, count) in counts {
        println!("  {:<24} {}", collection, count);
    }
    Ok(())
}

fn run_wipe(lifecycle: &DatabaseLifecycle, identity: &Identity, confirmed: bool) -> anyhow::Result<()> {
    match lifecycle.wipe_and_backup(identity, confirmed)? {
        WipeOutcome::Deleted => info!("Deleted store and key for {}", identity),
        WipeOutcome::BackedUp { path } => info!("Backed up store for {} to {}", identity, path.display()),
        WipeOutcome::BackupFailed { reason } => bail!("backup failed: {}", reason),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_store::MemoryCredentialStore;

    fn lifecycle(root: &std::path::Path) -> DatabaseLifecycle {
        DatabaseLifecycle::new(
            StoreConfig::with_root(root),
            KeyVault::new(Arc::new(MemoryCredentialStore::new())),
            Arc::new(|_: &Identity| true),
        )
    }

    #[tokio::test]
    async fn test_wait_skips_commits_by_other_writers() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = lifecycle(dir.path());
        let store = lifecycle.open_or_create(&Identity::single_account()).unwrap();
        let mut cursor = store.begin_observing();

        store.read_write(|tx| tx.set_string("first", "other", "notes")).unwrap();
        store
            .async_read_write(|tx| tx.set_string("second", "mine", "notes"))
            .unwrap();

        let seq = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_commit(&store, &mut cursor, "notes", "mine"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(seq, 2);
        assert_eq!(cursor.seq(), 2);
        lifecycle.close();
    }

    #[tokio::test]
    async fn test_put_prints_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = lifecycle(dir.path());
        let store = lifecycle.open_or_create(&Identity::single_account()).unwrap();
        store.read_write(|tx| tx.set_string("x", "earlier", "notes")).unwrap();

        run_put(&store, "notes".into(), "hello".into(), Some("k1".into()))
            .await
            .unwrap();
        assert_eq!(
            store.read(|s| s.get_string("k1", "notes")).unwrap().unwrap().as_deref(),
            Some("hello")
        );
        lifecycle.close();
    }
}
