//! Channel abstractions the sync engine talks to.
//!
//! - [`OperationLog`]: append-only, per-document broadcast log of operations.
//! - [`PresenceStore`]: per-document map of current presence records plus an
//!   ephemeral message list.
//!
//! Backends implement these traits. [`MemoryOperationLog`] and
//! [`MemoryPresenceStore`] are in-process implementations for tests and for
//! hosts running several sessions in one process.

mod memory_log;
mod memory_presence;

pub use memory_log::MemoryOperationLog;
pub use memory_presence::MemoryPresenceStore;

use crate::error::ChannelResult;
use crate::operation::Operation;
use crate::presence::{ChatMessage, PresencePatch, PresenceRecord};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Live operations in channel arrival order
pub type OperationStream = mpsc::UnboundedReceiver<Operation>;

/// Full presence map for a document, keyed by user id
pub type PresenceSnapshot = HashMap<String, PresenceRecord>;

/// Presence map snapshots, one per change
pub type PresenceStream = mpsc::UnboundedReceiver<PresenceSnapshot>;

/// Posted ephemeral messages
pub type MessageStream = mpsc::UnboundedReceiver<ChatMessage>;

/// Append-only operation log, one stream per document.
///
/// Arrival order at the channel is the only order subscribers see; it does
/// not have to match sender timestamps.
#[trait_variant::make(Send)]
pub trait OperationLog: Send + Sync + 'static {
    /// Append one flush wave. Returns the operations as stored, with
    /// channel-assigned ids.
    async fn append(&self, document_id: &str, operations: Vec<Operation>) -> ChannelResult<Vec<Operation>>;

    /// Stored operations with `timestamp >= since_ms`, ordered by timestamp.
    async fn query_since(&self, document_id: &str, since_ms: i64) -> ChannelResult<Vec<Operation>>;

    /// Operations appended from now on with `timestamp >= since_ms`.
    async fn subscribe(&self, document_id: &str, since_ms: i64) -> ChannelResult<OperationStream>;
}

/// Current-state presence records, overwritten in place.
#[trait_variant::make(Send)]
pub trait PresenceStore: Send + Sync + 'static {
    /// Create or replace the record for `record.user_id`.
    async fn set(&self, document_id: &str, record: PresenceRecord) -> ChannelResult<()>;

    /// Merge the set fields of `patch` into an existing record.
    async fn update(&self, document_id: &str, user_id: &str, patch: PresencePatch) -> ChannelResult<()>;

    /// Ask the backend to mark the record offline with `lastSeen = now` if
    /// the client goes away without cleaning up.
    async fn register_disconnect(&self, document_id: &str, user_id: &str) -> ChannelResult<()>;

    /// Full snapshots of the document's presence map. The current map is
    /// delivered first.
    async fn subscribe(&self, document_id: &str) -> ChannelResult<PresenceStream>;

    async fn post_message(&self, document_id: &str, message: ChatMessage) -> ChannelResult<()>;

    async fn remove_message(&self, document_id: &str, message_id: &str) -> ChannelResult<()>;

    /// Messages currently stored, then every newly posted one.
    async fn subscribe_messages(&self, document_id: &str) -> ChannelResult<MessageStream>;
}
