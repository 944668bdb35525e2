//! In-memory operation log.
//!
//! Operations are kept in arrival order per document and broadcast to every
//! live subscriber. Nothing is persisted.

use super::{OperationLog, OperationStream};
use crate::error::{ChannelError, ChannelResult};
use crate::operation::Operation;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

struct Subscriber {
    since_ms: i64,
    tx: mpsc::UnboundedSender<Operation>,
}

#[derive(Default)]
struct DocumentLog {
    /// Arrival order
    operations: Vec<Operation>,
    subscribers: Vec<Subscriber>,
}

/// In-memory implementation of [`OperationLog`].
///
/// Shared between sessions with `Arc`. Counts `append` calls and can be
/// switched unavailable to simulate a transport outage.
pub struct MemoryOperationLog {
    documents: Mutex<HashMap<String, DocumentLog>>,
    append_calls: AtomicUsize,
    available: AtomicBool,
}

impl MemoryOperationLog {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            append_calls: AtomicUsize::new(0),
            available: AtomicBool::new(true),
        }
    }

    fn documents(&self) -> MutexGuard<'_, HashMap<String, DocumentLog>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of `append` calls, successful or not
    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    /// Make every call fail with [`ChannelError::Unavailable`] until
    /// switched back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Everything stored for a document, in arrival order
    pub fn operations(&self, document_id: &str) -> Vec<Operation> {
        self.documents()
            .get(document_id)
            .map(|log| log.operations.clone())
            .unwrap_or_default()
    }

    /// Append operations that were written by someone else, e.g. history
    /// seeded before any session starts. Does not count as an append call.
    pub fn seed(&self, document_id: &str, operations: Vec<Operation>) {
        let mut docs = self.documents();
        let log = docs.entry(document_id.to_string()).or_default();
        for op in operations {
            log.operations.push(with_id(op));
        }
    }

    fn check_available(&self) -> ChannelResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChannelError::Unavailable("operation log offline".into()))
        }
    }
}

impl Default for MemoryOperationLog {
    fn default() -> Self {
        Self::new()
    }
}

fn with_id(mut op: Operation) -> Operation {
    if op.id.is_none() {
        op.id = Some(Uuid::new_v4().to_string());
    }
    op
}

impl OperationLog for MemoryOperationLog {
    async fn append(&self, document_id: &str, operations: Vec<Operation>) -> ChannelResult<Vec<Operation>> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut docs = self.documents();
        let log = docs.entry(document_id.to_string()).or_default();

        let stored: Vec<Operation> = operations.into_iter().map(with_id).collect();
        for op in &stored {
            log.operations.push(op.clone());
            log.subscribers
                .retain(|sub| op.timestamp < sub.since_ms || sub.tx.send(op.clone()).is_ok());
        }
        Ok(stored)
    }

    async fn query_since(&self, document_id: &str, since_ms: i64) -> ChannelResult<Vec<Operation>> {
        self.check_available()?;

        let mut ops: Vec<Operation> = self
            .documents()
            .get(document_id)
            .map(|log| {
                log.operations
                    .iter()
                    .filter(|op| op.timestamp >= since_ms)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        ops.sort_by_key(|op| op.timestamp);
        Ok(ops)
    }

    async fn subscribe(&self, document_id: &str, since_ms: i64) -> ChannelResult<OperationStream> {
        self.check_available()?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.documents()
            .entry(document_id.to_string())
            .or_default()
            .subscribers
            .push(Subscriber { since_ms, tx });
        Ok(rx)
    }
}
