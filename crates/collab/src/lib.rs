//! Real-time synchronization for shared canvases.
//!
//! Local edits are diffed into element-level operations, batched and
//! appended to a per-document operation log. Remote operations are applied
//! with last-write-wins conflict resolution. A separate presence service
//! tracks who is on the canvas, their cursors and short-lived messages.
//!
//! # Modules
//!
//! - `diff`: Element-level change detection between two snapshots
//! - `operation`: Operation types and payloads
//! - `codec`: Changes to operations, and operations back onto elements
//! - `conflict`: Last-write-wins conflict resolution
//! - `sync`: The operations service (batching, echo suppression, replay)
//! - `presence`: The presence service (records, cursors, messages)
//! - `offline`: Connectivity signal and the offline operation buffer
//! - `transport`: Operation log and presence store abstractions
//! - `clock`, `client_id`: Wall-clock timestamps and session identities
//! - `error`: Error types for the collaboration crate
//!
//! # Example
//!
//! ```
//! use canvas_model::Element;
//! use collab::{apply_operations, changes_to_operations, detect_changes, ClientId};
//!
//! let before: Vec<Element> = Vec::new();
//! let after = vec![Element::rectangle("r1", 0.0, 0.0, 10.0, 10.0)];
//!
//! let changes = detect_changes(&before, &after);
//! let ops: Vec<_> = changes_to_operations(&changes, &after)
//!     .unwrap()
//!     .into_iter()
//!     .map(|draft| draft.stamp("alice", ClientId::generate(), 1))
//!     .collect();
//!
//! let replica = apply_operations(&before, &ops);
//! assert_eq!(replica.len(), 1);
//! assert_eq!(replica[0].id, "r1");
//! ```

pub mod client_id;
pub mod clock;
pub mod codec;
pub mod conflict;
pub mod diff;
pub mod error;
pub mod offline;
pub mod operation;
pub mod presence;
pub mod sync;
pub mod transport;

// Re-export commonly used types
pub use client_id::ClientId;
pub use clock::{now_ms, Watermark};
pub use codec::{apply_operation, apply_operations, changes_to_operations, materialize};
pub use conflict::{
    last_write_wins, ConflictRecord, ConflictResolver, ConflictResult, ResolvedBy, ResolverHook,
};
pub use diff::{detect_changes, has_changed, ElementChanges};
pub use error::{ChannelError, ChannelResult, SyncError, SyncResult};
pub use offline::{ConnectionStatus, Connectivity, OfflineBuffer, OfflineConfig, OfflineError};
pub use operation::{
    ElementPayload, Operation, OperationDraft, OperationKind, OperationPayload, ResizeData,
    StylePatch,
};
pub use presence::{
    diff_presence, ChatMessage, Cursor, PresenceConfig, PresenceEvent, PresencePatch,
    PresenceRecord, PresenceService, UserIdentity,
};
pub use sync::{
    OperationEvent, OperationsConfig, OperationsService, SessionHooks, SessionState, SyncStatus,
};
pub use transport::{MemoryOperationLog, MemoryPresenceStore, OperationLog, PresenceStore};
