//! In-memory presence store.

use super::{MessageStream, PresenceSnapshot, PresenceStore, PresenceStream};
use crate::clock::now_ms;
use crate::error::{ChannelError, ChannelResult};
use crate::presence::{ChatMessage, PresencePatch, PresenceRecord};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Default)]
struct DocumentPresence {
    records: PresenceSnapshot,
    /// Users whose record goes offline on disconnect
    disconnect_hooks: HashSet<String>,
    messages: Vec<ChatMessage>,
    subscribers: Vec<mpsc::UnboundedSender<PresenceSnapshot>>,
    message_subscribers: Vec<mpsc::UnboundedSender<ChatMessage>>,
}

impl DocumentPresence {
    fn broadcast(&mut self) {
        let snapshot = self.records.clone();
        self.subscribers.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

/// In-memory implementation of [`PresenceStore`].
///
/// [`disconnect`](Self::disconnect) plays the server side of an ungraceful
/// disconnect by running the registered offline write.
pub struct MemoryPresenceStore {
    documents: Mutex<HashMap<String, DocumentPresence>>,
    available: AtomicBool,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    fn documents(&self) -> MutexGuard<'_, HashMap<String, DocumentPresence>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> ChannelResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChannelError::Unavailable("presence store offline".into()))
        }
    }

    /// Make every call fail until switched back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current record for a user
    pub fn record(&self, document_id: &str, user_id: &str) -> Option<PresenceRecord> {
        self.documents()
            .get(document_id)
            .and_then(|doc| doc.records.get(user_id).cloned())
    }

    /// Messages currently stored for a document
    pub fn messages(&self, document_id: &str) -> Vec<ChatMessage> {
        self.documents()
            .get(document_id)
            .map(|doc| doc.messages.clone())
            .unwrap_or_default()
    }

    /// Simulate the client's connection dropping. Runs the registered
    /// disconnect write, if any. Returns whether one was registered.
    pub fn disconnect(&self, document_id: &str, user_id: &str) -> bool {
        let mut docs = self.documents();
        let Some(doc) = docs.get_mut(document_id) else {
            return false;
        };
        if !doc.disconnect_hooks.remove(user_id) {
            return false;
        }
        if let Some(record) = doc.records.get_mut(user_id) {
            record.is_online = false;
            record.last_seen = now_ms();
        }
        doc.broadcast();
        true
    }
}

impl Default for MemoryPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceStore for MemoryPresenceStore {
    async fn set(&self, document_id: &str, record: PresenceRecord) -> ChannelResult<()> {
        self.check_available()?;
        let mut docs = self.documents();
        let doc = docs.entry(document_id.to_string()).or_default();
        doc.records.insert(record.user_id.clone(), record);
        doc.broadcast();
        Ok(())
    }

    async fn update(&self, document_id: &str, user_id: &str, patch: PresencePatch) -> ChannelResult<()> {
        self.check_available()?;
        let mut docs = self.documents();
        let Some(doc) = docs.get_mut(document_id) else {
            return Ok(());
        };
        if let Some(record) = doc.records.get_mut(user_id) {
            record.apply(&patch);
            doc.broadcast();
        }
        Ok(())
    }

    async fn register_disconnect(&self, document_id: &str, user_id: &str) -> ChannelResult<()> {
        self.check_available()?;
        self.documents()
            .entry(document_id.to_string())
            .or_default()
            .disconnect_hooks
            .insert(user_id.to_string());
        Ok(())
    }

    async fn subscribe(&self, document_id: &str) -> ChannelResult<PresenceStream> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut docs = self.documents();
        let doc = docs.entry(document_id.to_string()).or_default();
        if tx.send(doc.records.clone()).is_ok() {
            doc.subscribers.push(tx);
        }
        Ok(rx)
    }

    async fn post_message(&self, document_id: &str, message: ChatMessage) -> ChannelResult<()> {
        self.check_available()?;
        let mut docs = self.documents();
        let doc = docs.entry(document_id.to_string()).or_default();
        doc.message_subscribers
            .retain(|tx| tx.send(message.clone()).is_ok());
        doc.messages.push(message);
        Ok(())
    }

    async fn remove_message(&self, document_id: &str, message_id: &str) -> ChannelResult<()> {
        self.check_available()?;
        if let Some(doc) = self.documents().get_mut(document_id) {
            doc.messages.retain(|m| m.id != message_id);
        }
        Ok(())
    }

    async fn subscribe_messages(&self, document_id: &str) -> ChannelResult<MessageStream> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut docs = self.documents();
        let doc = docs.entry(document_id.to_string()).or_default();
        for message in &doc.messages {
            let _ = tx.send(message.clone());
        }
        doc.message_subscribers.push(tx);
        Ok(rx)
    }
}
