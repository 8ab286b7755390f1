//! Durable local state: reconciled tabs and annotations per group, the last
//! published cluster list, and the classification credential.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tabshare_protocol::{Annotation, Cluster, SharedTab};
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Locally held state of one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupState {
    #[serde(default)]
    pub shared_tabs: Vec<SharedTab>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

/// The whole persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDocument {
    #[serde(default)]
    pub groups: BTreeMap<String, GroupState>,
    #[serde(default)]
    pub clusters: Vec<Cluster>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

pub trait TabStore: Send + Sync {
    /// State of `group_id`, empty if never saved.
    fn load_group(&self, group_id: &str) -> Result<GroupState, StoreError>;
    fn save_group(&self, group_id: &str, state: &GroupState) -> Result<(), StoreError>;
    fn load_clusters(&self) -> Result<Vec<Cluster>, StoreError>;
    fn save_clusters(&self, clusters: &[Cluster]) -> Result<(), StoreError>;
    fn api_key(&self) -> Result<Option<String>, StoreError>;
    fn set_api_key(&self, key: Option<String>) -> Result<(), StoreError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: Mutex<StoreDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_key(key: impl Into<String>) -> Self {
        Self {
            doc: Mutex::new(StoreDocument {
                api_key: Some(key.into()),
                ..Default::default()
            }),
        }
    }
}

impl TabStore for MemoryStore {
    fn load_group(&self, group_id: &str) -> Result<GroupState, StoreError> {
        Ok(lock(&self.doc).groups.get(group_id).cloned().unwrap_or_default())
    }

    fn save_group(&self, group_id: &str, state: &GroupState) -> Result<(), StoreError> {
        lock(&self.doc).groups.insert(group_id.to_string(), state.clone());
        Ok(())
    }

    fn load_clusters(&self) -> Result<Vec<Cluster>, StoreError> {
        Ok(lock(&self.doc).clusters.clone())
    }

    fn save_clusters(&self, clusters: &[Cluster]) -> Result<(), StoreError> {
        lock(&self.doc).clusters = clusters.to_vec();
        Ok(())
    }

    fn api_key(&self) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.doc).api_key.clone())
    }

    fn set_api_key(&self, key: Option<String>) -> Result<(), StoreError> {
        lock(&self.doc).api_key = key;
        Ok(())
    }
}

/// Outcome of the writer's latest pass.
#[derive(Debug, Clone, Default)]
struct Written {
    version: u64,
    error: Option<String>,
}

/// Single JSON document on disk, served from memory.
///
/// Saves update the in-memory copy and wake a writer task that replaces the
/// file atomically with the newest version, so callers never wait on disk.
/// A burst of saves coalesces into one write. [`flush`](Self::flush) waits
/// for the writer to catch up.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    doc: Arc<Mutex<StoreDocument>>,
    version_tx: watch::Sender<u64>,
    written_rx: watch::Receiver<Written>,
}

impl JsonFileStore {
    /// Load the document at `path` (missing means empty) and start its
    /// writer task.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let doc = match fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => StoreDocument::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), groups = doc.groups.len(), "Loaded local state");

        let doc = Arc::new(Mutex::new(doc));
        let (version_tx, version_rx) = watch::channel(0);
        let (written_tx, written_rx) = watch::channel(Written::default());
        tokio::spawn(write_loop(path.clone(), doc.clone(), version_rx, written_tx));
        Ok(Self {
            path,
            doc,
            version_tx,
            written_rx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every save made so far has reached the disk.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let target = *self.version_tx.borrow();
        let mut written = self.written_rx.clone();
        let status = written
            .wait_for(|w| w.version >= target)
            .await
            .map_err(|_| StoreError::WriterStopped)?
            .clone();
        match status.error {
            Some(e) => Err(StoreError::Write(e)),
            None => Ok(()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut StoreDocument)) -> Result<(), StoreError> {
        f(&mut lock(&self.doc));
        // Bumped after the change so any snapshot taken for a version holds it.
        self.version_tx.send_modify(|v| *v += 1);
        Ok(())
    }
}

async fn write_loop(
    path: PathBuf,
    doc: Arc<Mutex<StoreDocument>>,
    mut version_rx: watch::Receiver<u64>,
    written_tx: watch::Sender<Written>,
) {
    while version_rx.changed().await.is_ok() {
        let version = *version_rx.borrow_and_update();
        let snapshot = lock(&doc).clone();
        let error = match write_atomic(&path, &snapshot).await {
            Ok(()) => None,
            Err(e) => {
                warn!(path = %path.display(), "Failed to save local state: {}", e);
                Some(e.to_string())
            }
        };
        written_tx.send_replace(Written { version, error });
    }
    debug!(path = %path.display(), "Store writer stopped");
}

async fn write_atomic(path: &Path, doc: &StoreDocument) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(doc)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), "Saved local state");
    Ok(())
}

impl TabStore for JsonFileStore {
    fn load_group(&self, group_id: &str) -> Result<GroupState, StoreError> {
        Ok(lock(&self.doc).groups.get(group_id).cloned().unwrap_or_default())
    }

    fn save_group(&self, group_id: &str, state: &GroupState) -> Result<(), StoreError> {
        self.update(|doc| {
            doc.groups.insert(group_id.to_string(), state.clone());
        })
    }

    fn load_clusters(&self) -> Result<Vec<Cluster>, StoreError> {
        Ok(lock(&self.doc).clusters.clone())
    }

    fn save_clusters(&self, clusters: &[Cluster]) -> Result<(), StoreError> {
        self.update(|doc| doc.clusters = clusters.to_vec())
    }

    fn api_key(&self) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.doc).api_key.clone().filter(|k| !k.trim().is_empty()))
    }

    fn set_api_key(&self, key: Option<String>) -> Result<(), StoreError> {
        self.update(|doc| doc.api_key = key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabshare_protocol::TabPayload;

    fn tab(url: &str) -> SharedTab {
        SharedTab::local(
            &TabPayload {
                title: url.to_string(),
                url: url.to_string(),
                summary: None,
                timestamp: 42,
            },
            "g1",
        )
    }

    #[test]
    fn test_memory_store_roundtrips_groups() {
        let store = MemoryStore::new();
        assert_eq!(store.load_group("g1").unwrap(), GroupState::default());

        let state = GroupState {
            shared_tabs: vec![tab("https://a.test/")],
            annotations: vec![],
        };
        store.save_group("g1", &state).unwrap();
        assert_eq!(store.load_group("g1").unwrap(), state);
        assert!(store.load_group("g2").unwrap().shared_tabs.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("state.json")).await.unwrap();
        assert!(store.load_clusters().unwrap().is_empty());
        assert!(store.api_key().unwrap().is_none());
        store.flush().await.unwrap();
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        store
            .save_group(
                "g1",
                &GroupState {
                    shared_tabs: vec![tab("https://a.test/"), tab("https://b.test/")],
                    annotations: vec![],
                },
            )
            .unwrap();
        store.set_api_key(Some("sk-test".into())).unwrap();
        store
            .save_clusters(&[Cluster {
                name: "a.test".into(),
                theme: "Pages from a.test".into(),
                tabs: vec![tab("https://a.test/")],
            }])
            .unwrap();
        store.flush().await.unwrap();

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.load_group("g1").unwrap().shared_tabs.len(), 2);
        assert_eq!(reopened.api_key().unwrap().as_deref(), Some("sk-test"));
        assert_eq!(reopened.load_clusters().unwrap()[0].name, "a.test");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_serves_saves_before_they_hit_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonFileStore::open(&path).await.unwrap();

        for n in 0..50 {
            let shared_tabs = (0..=n).map(|i| tab(&format!("https://{i}.test/"))).collect();
            store
                .save_group(
                    "g1",
                    &GroupState {
                        shared_tabs,
                        annotations: vec![],
                    },
                )
                .unwrap();
            assert_eq!(store.load_group("g1").unwrap().shared_tabs.len(), n + 1);
        }
        store.flush().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let on_disk: StoreDocument = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(on_disk.groups["g1"].shared_tabs.len(), 50);
    }

    #[tokio::test]
    async fn test_file_store_flush_reports_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("state");
        let store = JsonFileStore::open(parent.join("state.json")).await.unwrap();
        // The parent directory cannot be created once a file takes its name.
        std::fs::write(&parent, b"not a directory").unwrap();

        store.set_api_key(Some("sk".into())).unwrap();
        assert!(matches!(store.flush().await, Err(StoreError::Write(_))));
        // Still served from memory.
        assert_eq!(store.api_key().unwrap().as_deref(), Some("sk"));
    }

    #[tokio::test]
    async fn test_file_store_reports_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(JsonFileStore::open(&path).await, Err(StoreError::Corrupt(_))));
    }
}
