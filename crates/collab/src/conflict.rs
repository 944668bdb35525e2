//! Conflict resolution for concurrent operations.
//!
//! A remote operation conflicts with a local operation that is still queued
//! (not yet flushed) when they target at least one common element and their
//! timestamps are within the conflict window.
//!
//! # Resolution Rules
//!
//! 1. Caller-supplied resolver hooks, in registration order. The first hook
//!    returning `Some` decides.
//! 2. Last write wins by `timestamp`.
//! 3. On an exact tie, the lexicographically larger `client_id` wins.
//!
//! The loser is dropped, never merged or retried. Timestamps come from each
//! sender's wall clock and are compared as is, so skewed clocks can pick the
//! "wrong" winner.

use crate::clock::now_ms;
use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

/// Default conflict window in milliseconds.
pub const DEFAULT_CONFLICT_WINDOW_MS: i64 = 1_000;

/// Outcome of resolving a local/remote conflict
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResult {
    /// Keep the queued local operation, drop the remote one
    LocalWins,
    /// Deliver the remote operation, drop the local one
    RemoteWins,
}

/// Which rule decided a conflict
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolvedBy {
    Hook,
    Timestamp,
    ClientId,
}

/// Caller-supplied resolver, called as `hook(local, remote)`.
///
/// Returning `None` defers to the next hook and finally to last-write-wins.
pub type ResolverHook = Arc<dyn Fn(&Operation, &Operation) -> Option<ConflictResult> + Send + Sync>;

/// Record of a resolved conflict
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub local_op: Operation,
    pub remote_op: Operation,
    pub element_ids: Vec<String>,
    pub winner: ConflictResult,
    pub resolved_by: ResolvedBy,
    /// Local wall clock at resolution (ms)
    pub at: i64,
}

/// Conflict detection and resolution
#[derive(Clone, Debug)]
pub struct ConflictResolver {
    window_ms: i64,
    /// Resolved conflicts, for debugging
    history: Vec<ConflictRecord>,
    keep_history: bool,
}

impl ConflictResolver {
    /// Create a resolver with the given window
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            history: Vec::new(),
            keep_history: false,
        }
    }

    /// Keep a record of every resolved conflict
    pub fn with_history(mut self) -> Self {
        self.keep_history = true;
        self
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// True if `local` and `remote` share an element and are close in time.
    pub fn conflicts(&self, local: &Operation, remote: &Operation) -> bool {
        (local.timestamp - remote.timestamp).abs() <= self.window_ms && local.touches(remote)
    }

    /// Pick a winner between a queued local operation and a remote one.
    pub fn resolve(
        &mut self,
        local: &Operation,
        remote: &Operation,
        hooks: &[ResolverHook],
    ) -> ConflictResult {
        let (winner, resolved_by) = Self::decide(local, remote, hooks);
        self.record(local, remote, winner, resolved_by);
        winner
    }

    /// Decide a conflict without touching the history: hooks first, in
    /// order, then last-write-wins.
    pub fn decide(
        local: &Operation,
        remote: &Operation,
        hooks: &[ResolverHook],
    ) -> (ConflictResult, ResolvedBy) {
        hooks
            .iter()
            .find_map(|hook| hook(local, remote))
            .map(|winner| (winner, ResolvedBy::Hook))
            .unwrap_or_else(|| last_write_wins(local, remote))
    }

    /// Log a decided conflict and keep it if history is enabled.
    pub fn record(
        &mut self,
        local: &Operation,
        remote: &Operation,
        winner: ConflictResult,
        resolved_by: ResolvedBy,
    ) {
        tracing::debug!(
            local_client = %local.client_id,
            remote_client = %remote.client_id,
            ?winner,
            ?resolved_by,
            "Resolved conflict"
        );

        if self.keep_history {
            self.history.push(ConflictRecord {
                local_op: local.clone(),
                remote_op: remote.clone(),
                element_ids: local.shared_ids(remote),
                winner,
                resolved_by,
                at: now_ms(),
            });
        }
    }

    /// Get conflict history
    pub fn history(&self) -> &[ConflictRecord] {
        &self.history
    }

    /// Clear conflict history
    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CONFLICT_WINDOW_MS)
    }
}

/// Later timestamp wins; on a tie the larger client id wins.
pub fn last_write_wins(local: &Operation, remote: &Operation) -> (ConflictResult, ResolvedBy) {
    match local.timestamp.cmp(&remote.timestamp) {
        Ordering::Greater => (ConflictResult::LocalWins, ResolvedBy::Timestamp),
        Ordering::Less => (ConflictResult::RemoteWins, ResolvedBy::Timestamp),
        Ordering::Equal => {
            if local.client_id > remote.client_id {
                (ConflictResult::LocalWins, ResolvedBy::ClientId)
            } else {
                (ConflictResult::RemoteWins, ResolvedBy::ClientId)
            }
        }
    }
}
