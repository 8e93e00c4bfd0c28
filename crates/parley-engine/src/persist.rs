//! Durable snapshots of the conversation table
//!
//! The whole table is stored as one JSON document under a single key.
//! Writes are debounced and run one at a time; each write captures the
//! newest table state when it starts, so an older snapshot can never land
//! after a newer one.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::{
    error::{Error, Result},
    events::StoreEvent,
    store::Table,
    types::{Conversation, now_millis},
    usage::UsageStats,
};

/// Key the conversation table is stored under
pub const STORAGE_KEY: &str = "chat-storage";

/// Current snapshot document version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Key-value storage for snapshot documents
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the value stored under `key`
    async fn put(&self, key: &str, value: &str) -> Result<()>;
}

/// Stores each key as `<dir>/<key>.json`
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path backing `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::persistence(e)),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(Error::persistence)?;

        // Write to a sibling file and rename so readers never see a torn document.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(Error::persistence)?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(Error::persistence)
    }
}

/// In-memory store, mainly for tests
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `put` fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    /// Current raw value under `key`
    pub fn raw(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    /// Every key with a value, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.values.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(Error::Persistence("storage unavailable".into()));
        }
        self.values.lock().insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Serialized form of the conversation table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    #[serde(default)]
    pub active_conversation_id: Option<String>,
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub usage: Option<UsageStats>,
    #[serde(default)]
    pub detailed_mode: bool,
}

impl Snapshot {
    /// Capture a table. Pending messages are written as failed, since a
    /// snapshot that survives a crash must not resume them.
    pub(crate) fn capture(table: &Table) -> Self {
        let mut conversations = table.conversations.clone();
        for conversation in &mut conversations {
            conversation.fail_pending();
        }
        Self {
            version: SNAPSHOT_VERSION,
            active_conversation_id: table.active.clone(),
            conversations,
            usage: Some(table.usage.clone()),
            detailed_mode: table.detailed_mode,
        }
    }

    /// Parse a stored document, coercing any pending message to failed
    pub fn from_json(document: &str) -> Result<Self> {
        let mut snapshot: Snapshot = serde_json::from_str(document).map_err(Error::persistence)?;
        let coerced: usize = snapshot
            .conversations
            .iter_mut()
            .map(Conversation::fail_pending)
            .sum();
        if coerced > 0 {
            tracing::warn!("Marked {} interrupted message(s) as failed", coerced);
        }

        // A selection pointing at a missing conversation is dropped.
        if let Some(ref active) = snapshot.active_conversation_id {
            if !snapshot.conversations.iter().any(|c| &c.id == active) {
                snapshot.active_conversation_id = None;
            }
        }
        Ok(snapshot)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::persistence)
    }
}

/// Load the stored snapshot, moving an unparseable document aside.
///
/// The bad document is kept under `<STORAGE_KEY>.corrupt-<millis>` and
/// `None` is returned so the caller starts empty. Storage errors still fail.
pub async fn load_or_recover(backend: &dyn KeyValueStore) -> Result<Option<Snapshot>> {
    let Some(document) = backend.get(STORAGE_KEY).await? else {
        return Ok(None);
    };
    match Snapshot::from_json(&document) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            let backup = corrupt_key(now_millis());
            tracing::warn!(
                "Stored conversations are unreadable ({}); moved to {} and starting empty",
                e,
                backup
            );
            backend.put(&backup, &document).await?;
            Ok(None)
        }
    }
}

/// Key a corrupt snapshot is kept under
pub fn corrupt_key(millis: i64) -> String {
    format!("{}.corrupt-{}", STORAGE_KEY, millis)
}

/// Writes snapshots of a shared table to a backend
pub(crate) struct Persister {
    backend: Arc<dyn KeyValueStore>,
    table: Arc<Mutex<Table>>,
    events: broadcast::Sender<StoreEvent>,
    write_lock: tokio::sync::Mutex<()>,
    written_revision: AtomicU64,
}

impl Persister {
    pub(crate) fn new(
        backend: Arc<dyn KeyValueStore>,
        table: Arc<Mutex<Table>>,
        events: broadcast::Sender<StoreEvent>,
    ) -> Self {
        let written = table.lock().revision;
        Self {
            backend,
            table,
            events,
            write_lock: tokio::sync::Mutex::new(()),
            written_revision: AtomicU64::new(written),
        }
    }

    /// Write the newest table state unless it is already on disk
    pub(crate) async fn write_latest(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let (revision, snapshot) = {
            let table = self.table.lock();
            (table.revision, Snapshot::capture(&table))
        };
        if revision <= self.written_revision.load(Ordering::Acquire) {
            return Ok(());
        }

        let result = match snapshot.to_json() {
            Ok(document) => self.backend.put(STORAGE_KEY, &document).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.written_revision.store(revision, Ordering::Release);
                tracing::debug!("Saved snapshot at revision {}", revision);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to save snapshot: {}", e);
                let _ = self.events.send(StoreEvent::PersistenceFailed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Debounce loop: wait for a change, let further changes settle, write.
    ///
    /// Ends once the revision sender is dropped and the last change is saved.
    pub(crate) async fn run(self: Arc<Self>, mut changes: watch::Receiver<u64>, debounce: Duration) {
        while changes.changed().await.is_ok() {
            tokio::time::sleep(debounce).await;
            changes.borrow_and_update();
            // Failures are reported through the event channel.
            let _ = self.write_latest().await;
        }
        let _ = self.write_latest().await;
    }
}
