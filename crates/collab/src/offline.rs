//! Offline support for collaborative canvases.
//!
//! - [`Connectivity`]: the process-wide online/offline signal that gates
//!   flushing. Hosts flip it from their network monitor.
//! - [`OfflineBuffer`]: operations captured while offline, optionally
//!   persisted as JSON so a restarted host can restore them.

use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Connection status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Connected, flushes go to the channel
    Online,
    /// Disconnected, operations are buffered locally
    Offline,
}

/// Shared online/offline signal.
///
/// Cheap to clone; every clone observes the same state.
#[derive(Clone, Debug)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Starts online
    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.is_online() {
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        }
    }

    /// Update the signal. Subscribers are only woken on an actual change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::online()
    }
}

/// Offline buffer configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineConfig {
    /// Directory the buffers are persisted to, one JSON file per document
    pub storage_path: Option<PathBuf>,
    /// Persist after every change
    pub auto_save: bool,
}

impl OfflineConfig {
    /// Persist under the directory `dir` with auto-save enabled
    pub fn with_storage(dir: impl AsRef<Path>) -> Self {
        Self {
            storage_path: Some(dir.as_ref().to_path_buf()),
            auto_save: true,
        }
    }

    /// File holding the buffer of `document_id`, if storage is configured
    pub fn file_for(&self, document_id: &str) -> Option<PathBuf> {
        let name: String = document_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.storage_path
            .as_ref()
            .map(|dir| dir.join(format!("offline-{name}.json")))
    }

    pub fn with_auto_save(mut self, enabled: bool) -> Self {
        self.auto_save = enabled;
        self
    }
}

/// Serializable buffer contents
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineState {
    pub document_id: String,
    pub operations: Vec<Operation>,
    /// Wall clock at save time (ms)
    pub saved_at: i64,
}

/// Offline errors
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OfflineError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("No storage path configured")]
    NoStoragePath,
    #[error("Stored operations belong to document {0}")]
    DocumentMismatch(String),
}

/// Ordered operations of one document captured while offline
#[derive(Debug, Default)]
pub struct OfflineBuffer {
    document_id: String,
    operations: Vec<Operation>,
    storage_path: Option<PathBuf>,
    auto_save: bool,
}

impl OfflineBuffer {
    pub fn new(config: &OfflineConfig, document_id: &str) -> Self {
        let storage_path = config.file_for(document_id);
        Self {
            document_id: document_id.to_string(),
            operations: Vec::new(),
            auto_save: config.auto_save && storage_path.is_some(),
            storage_path,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Append operations in order
    pub fn extend(&mut self, ops: impl IntoIterator<Item = Operation>) {
        let before = self.operations.len();
        self.operations.extend(ops);
        if self.operations.len() != before {
            self.persist();
        }
    }

    /// Remove up to `max` operations from the front, oldest first
    pub fn take_front(&mut self, max: usize) -> Vec<Operation> {
        let n = max.min(self.operations.len());
        let ops: Vec<Operation> = self.operations.drain(..n).collect();
        if !ops.is_empty() {
            self.persist();
        }
        ops
    }

    /// Put operations back ahead of everything buffered, e.g. after a
    /// failed send
    pub fn prepend(&mut self, ops: Vec<Operation>) {
        if ops.is_empty() {
            return;
        }
        self.operations.splice(0..0, ops);
        self.persist();
    }

    /// Drop buffered operations matching `predicate`. Returns how many.
    pub fn remove_where(&mut self, predicate: impl Fn(&Operation) -> bool) -> usize {
        let before = self.operations.len();
        self.operations.retain(|op| !predicate(op));
        let removed = before - self.operations.len();
        if removed > 0 {
            self.persist();
        }
        removed
    }

    fn persist(&self) {
        if !self.auto_save {
            return;
        }
        if let Err(e) = self.save() {
            tracing::warn!("Failed to persist offline buffer: {}", e);
        }
    }

    /// Write the buffer to its storage path
    pub fn save(&self) -> Result<(), OfflineError> {
        let path = self.storage_path.as_ref().ok_or(OfflineError::NoStoragePath)?;

        let state = OfflineState {
            document_id: self.document_id.clone(),
            operations: self.operations.clone(),
            saved_at: crate::clock::now_ms(),
        };
        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| OfflineError::Serialization(e.to_string()))?;

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| OfflineError::Storage(e.to_string()))?;
        }
        std::fs::write(path, json).map_err(|e| OfflineError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Restore operations saved by a previous run, appending them ahead of
    /// anything buffered since. Returns how many were restored.
    pub fn load(&mut self) -> Result<usize, OfflineError> {
        let path = self.storage_path.as_ref().ok_or(OfflineError::NoStoragePath)?;

        if !path.exists() {
            return Ok(0);
        }

        let json = std::fs::read_to_string(path).map_err(|e| OfflineError::Storage(e.to_string()))?;
        let state: OfflineState =
            serde_json::from_str(&json).map_err(|e| OfflineError::Serialization(e.to_string()))?;
        if state.document_id != self.document_id {
            return Err(OfflineError::DocumentMismatch(state.document_id));
        }

        let restored = state.operations.len();
        let newer = std::mem::replace(&mut self.operations, state.operations);
        self.operations.extend(newer);
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_id::ClientId;
    use crate::operation::OperationDraft;

    fn op(id: &str, ts: i64) -> Operation {
        OperationDraft::moved(vec![id.to_string()], 1.0, 0.0).stamp("u", ClientId::from("c"), ts)
    }

    #[test]
    fn test_connectivity_shared_between_clones() {
        let connectivity = Connectivity::default();
        let other = connectivity.clone();
        assert!(other.is_online());

        connectivity.set_online(false);
        assert!(!other.is_online());
        assert_eq!(other.status(), ConnectionStatus::Offline);
    }

    #[tokio::test]
    async fn test_connectivity_wakes_only_on_change() {
        let connectivity = Connectivity::online();
        let mut rx = connectivity.subscribe();

        connectivity.set_online(true);
        assert!(!rx.has_changed().unwrap());

        connectivity.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
    }

    #[test]
    fn test_buffer_keeps_order() {
        let mut buffer = OfflineBuffer::default();
        buffer.extend(vec![op("a", 1), op("b", 2)]);
        buffer.extend(vec![op("c", 3)]);

        let first = buffer.take_front(2);
        assert_eq!(first.len(), 2);
        assert_eq!(buffer.len(), 1);

        buffer.prepend(first);
        let ids: Vec<String> = buffer
            .take_front(usize::MAX)
            .into_iter()
            .map(|o| o.element_ids[0].clone())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_remove_where() {
        let mut buffer = OfflineBuffer::default();
        buffer.extend(vec![op("a", 1), op("b", 2)]);
        assert_eq!(buffer.remove_where(|o| o.element_ids[0] == "a"), 1);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_save_load_without_storage_path() {
        let mut buffer = OfflineBuffer::default();
        assert_eq!(buffer.save(), Err(OfflineError::NoStoragePath));
        assert_eq!(buffer.load(), Err(OfflineError::NoStoragePath));
    }

    #[test]
    fn test_file_per_document() {
        let config = OfflineConfig::with_storage("/tmp/canvas");
        assert_ne!(config.file_for("doc-1"), config.file_for("doc-2"));
        assert_eq!(
            config.file_for("a/b"),
            Some(PathBuf::from("/tmp/canvas/offline-a_b.json"))
        );
        assert_eq!(OfflineConfig::default().file_for("doc-1"), None);
    }

    #[test]
    fn test_auto_save_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = OfflineConfig::with_storage(temp_dir.path().join("pending"));

        {
            let mut buffer = OfflineBuffer::new(&config, "doc");
            buffer.extend(vec![op("a", 1), op("b", 2)]);
            assert!(config.file_for("doc").unwrap().exists());
        }

        let mut restored = OfflineBuffer::new(&config.clone().with_auto_save(false), "doc");
        restored.extend(vec![op("c", 3)]);
        assert_eq!(restored.load().unwrap(), 2);

        let ids: Vec<&str> = restored
            .operations()
            .iter()
            .map(|o| o.element_ids[0].as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_other_documents_are_not_restored() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = OfflineConfig::with_storage(temp_dir.path());

        let mut first = OfflineBuffer::new(&config, "doc-1");
        first.extend(vec![op("a", 1)]);

        let mut second = OfflineBuffer::new(&config, "doc-2");
        assert_eq!(second.load().unwrap(), 0);
        assert!(second.is_empty());

        let mut again = OfflineBuffer::new(&config, "doc-1");
        assert_eq!(again.load().unwrap(), 1);
    }

    #[test]
    fn test_load_rejects_foreign_state() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = OfflineConfig::with_storage(temp_dir.path());

        let mut first = OfflineBuffer::new(&config, "doc-1");
        first.extend(vec![op("a", 1)]);
        // Same file, different owner.
        std::fs::rename(
            config.file_for("doc-1").unwrap(),
            config.file_for("doc-2").unwrap(),
        )
        .unwrap();

        let mut second = OfflineBuffer::new(&config, "doc-2");
        assert_eq!(second.load(), Err(OfflineError::DocumentMismatch("doc-1".into())));
        assert!(second.is_empty());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = OfflineConfig::with_storage(temp_dir.path().join("none"));
        let mut buffer = OfflineBuffer::new(&config, "doc");
        assert_eq!(buffer.load().unwrap(), 0);
    }

    #[test]
    fn test_load_corrupt_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = OfflineConfig::with_storage(temp_dir.path());
        std::fs::write(config.file_for("doc").unwrap(), "not json").unwrap();

        let mut buffer = OfflineBuffer::new(&config, "doc");
        assert!(matches!(buffer.load(), Err(OfflineError::Serialization(_))));
    }
}
