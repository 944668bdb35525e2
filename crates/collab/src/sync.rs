//! Operations service: one sync session per (document, user).
//!
//! The service:
//!
//! - Stamps and queues local operations, flushing them to the operation log
//!   in debounced waves
//! - Buffers operations while offline and flushes them on reconnect
//! - Replays recent history on start, then follows the live log
//! - Skips self-echoes, stale redeliveries and duplicates
//! - Resolves conflicts between remote operations and unflushed local ones
//!
//! Events reach the host over an unbounded channel returned by
//! [`OperationsService::initialize`].

use crate::client_id::ClientId;
use crate::clock::{now_ms, Watermark};
use crate::conflict::{ConflictResolver, ConflictResult, ResolverHook};
use crate::error::{SyncError, SyncResult};
use crate::offline::{Connectivity, OfflineBuffer, OfflineConfig};
use crate::operation::{Operation, OperationDraft};
use crate::transport::{OperationLog, OperationStream};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for an operations session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationsConfig {
    /// Debounce window after the last queued operation
    pub batch_window_ms: u64,
    /// Maximum operations per append call
    pub max_batch_size: usize,
    /// History replayed on initialize
    pub lookback_ms: u64,
    /// Maximum timestamp distance for two operations to conflict
    pub conflict_window_ms: u64,
    /// Upper bound on the final flush during cleanup
    pub cleanup_flush_timeout_ms: u64,
    /// Channel-assigned ids remembered for de-duplication
    pub dedupe_capacity: usize,
    /// Record resolved conflicts
    pub keep_conflict_history: bool,
    pub offline: OfflineConfig,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: 50,
            max_batch_size: 500,
            lookback_ms: 5 * 60 * 1000,
            conflict_window_ms: 1_000,
            cleanup_flush_timeout_ms: 2_000,
            dedupe_capacity: 1_024,
            keep_conflict_history: false,
            offline: OfflineConfig::default(),
        }
    }
}

impl OperationsConfig {
    pub fn with_batch_window(mut self, ms: u64) -> Self {
        self.batch_window_ms = ms;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_lookback(mut self, ms: u64) -> Self {
        self.lookback_ms = ms;
        self
    }

    pub fn with_conflict_window(mut self, ms: u64) -> Self {
        self.conflict_window_ms = ms;
        self
    }

    pub fn with_cleanup_timeout(mut self, ms: u64) -> Self {
        self.cleanup_flush_timeout_ms = ms;
        self
    }

    pub fn with_conflict_history(mut self) -> Self {
        self.keep_conflict_history = true;
        self
    }

    pub fn with_offline(mut self, offline: OfflineConfig) -> Self {
        self.offline = offline;
        self
    }
}

// =============================================================================
// Public types
// =============================================================================

/// Lifecycle of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Active,
    CleaningUp,
}

/// Snapshot for sync indicators
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SessionState,
    pub online: bool,
    /// Operations waiting for the next flush
    pub queued: usize,
    /// Operations buffered while offline
    pub offline_queued: usize,
    pub is_flushing: bool,
    /// Last successful append (ms)
    pub last_sync_time: Option<i64>,
}

/// Events delivered to the host
#[derive(Clone, Debug, PartialEq)]
pub enum OperationEvent {
    /// A remote operation to apply to the local snapshot
    Remote(Operation),
    /// A conflict was decided; the loser was dropped
    ConflictResolved { winner: Operation, loser: Operation },
    /// Sync status after a flush wave or connectivity change
    StatusChanged(SyncStatus),
}

/// Caller-supplied hooks for a session
#[derive(Clone, Default)]
pub struct SessionHooks {
    pub resolvers: Vec<ResolverHook>,
}

impl SessionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a conflict resolver, called as `resolver(local, remote)`
    pub fn with_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&Operation, &Operation) -> Option<ConflictResult> + Send + Sync + 'static,
    {
        self.resolvers.push(Arc::new(resolver));
        self
    }
}

// =============================================================================
// Internal state
// =============================================================================

struct Session {
    document_id: String,
    user_id: String,
    client_id: ClientId,
    epoch: u64,
}

/// Bounded set of channel-assigned operation ids
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    /// Returns false if `id` was already seen
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

struct Shared {
    state: SessionState,
    session: Option<Session>,
    epoch: u64,
    queue: Vec<Operation>,
    /// Batch handed to the log and not yet acknowledged
    in_flight: Vec<Operation>,
    offline: OfflineBuffer,
    watermark: Watermark,
    seen: SeenIds,
    resolver: ConflictResolver,
    hooks: Vec<ResolverHook>,
    listeners: Vec<mpsc::UnboundedSender<OperationEvent>>,
    last_sync_time: Option<i64>,
    tasks: Vec<JoinHandle<()>>,
    runtime: Option<Handle>,
}

impl Shared {
    fn emit(&mut self, event: OperationEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn current(&self, epoch: u64) -> Option<&Session> {
        self.session.as_ref().filter(|s| s.epoch == epoch)
    }

    /// Next batch to send: offline leftovers first, then the queue
    fn take_batch(&mut self, max: usize) -> Vec<Operation> {
        let max = max.max(1);
        let mut batch = self.offline.take_front(max);
        let rest = (max - batch.len()).min(self.queue.len());
        batch.extend(self.queue.drain(..rest));
        batch
    }
}

struct Inner<L> {
    log: Arc<L>,
    connectivity: Connectivity,
    config: OperationsConfig,
    shared: Mutex<Shared>,
    /// Serializes flush waves
    flush_lock: tokio::sync::Mutex<()>,
    flush_generation: AtomicU64,
    queued: AtomicUsize,
    offline_queued: AtomicUsize,
    flushing: AtomicBool,
}

impl<L: OperationLog> Inner<L> {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sync_counters(&self, shared: &Shared) {
        self.queued.store(shared.queue.len(), Ordering::SeqCst);
        self.offline_queued.store(shared.offline.len(), Ordering::SeqCst);
    }

    fn status_of(&self, shared: &Shared) -> SyncStatus {
        SyncStatus {
            state: shared.state,
            online: self.connectivity.is_online(),
            queued: shared.queue.len(),
            offline_queued: shared.offline.len(),
            is_flushing: self.flushing.load(Ordering::SeqCst),
            last_sync_time: shared.last_sync_time,
        }
    }

    fn emit_status(&self) {
        let mut shared = self.shared();
        let status = self.status_of(&shared);
        shared.emit(OperationEvent::StatusChanged(status));
    }

    /// Handle one operation from history or the live stream.
    ///
    /// Resolver hooks run without the session lock held, so they may call
    /// back into the service.
    fn receive(&self, op: Operation, epoch: u64) {
        let (candidates, hooks) = {
            let mut guard = self.shared();
            let shared = &mut *guard;
            let Some(session) = shared.session.as_ref().filter(|s| s.epoch == epoch) else {
                return;
            };

            if op.client_id == session.client_id {
                tracing::debug!(op_id = ?op.id, "Skipping own operation");
                return;
            }
            if let Some(id) = &op.id {
                if !shared.seen.insert(id) {
                    tracing::debug!(op_id = %id, "Skipping duplicate operation");
                    return;
                }
            }
            if shared.watermark.is_stale(op.timestamp) {
                tracing::debug!(
                    timestamp = op.timestamp,
                    watermark = shared.watermark.value(),
                    "Skipping stale operation"
                );
                return;
            }
            shared.watermark.observe(op.timestamp);

            let resolver = &shared.resolver;
            let candidates: Vec<Operation> = shared
                .queue
                .iter()
                .chain(shared.offline.operations().iter())
                .filter(|local| resolver.conflicts(local, &op))
                .cloned()
                .collect();
            if candidates.is_empty() {
                shared.emit(OperationEvent::Remote(op));
                return;
            }
            (candidates, shared.hooks.clone())
        };

        let mut decisions = Vec::new();
        for local in candidates {
            let (winner, resolved_by) = ConflictResolver::decide(&local, &op, &hooks);
            let remote_lost = winner == ConflictResult::LocalWins;
            decisions.push((local, winner, resolved_by));
            if remote_lost {
                break;
            }
        }

        let mut shared = self.shared();
        if shared.current(epoch).is_none() {
            return;
        }
        for (local, winner, resolved_by) in &decisions {
            shared.resolver.record(local, &op, *winner, *resolved_by);
        }

        if let Some((winner, ..)) = decisions
            .iter()
            .find(|(_, result, _)| *result == ConflictResult::LocalWins)
        {
            let winner = winner.clone();
            shared.emit(OperationEvent::ConflictResolved { winner, loser: op });
            return;
        }

        let local_losers: Vec<Operation> = decisions.into_iter().map(|(local, ..)| local).collect();
        let lost = |candidate: &Operation| local_losers.iter().any(|l| l == candidate);
        shared.queue.retain(|queued| !lost(queued));
        shared.offline.remove_where(lost);
        self.sync_counters(&shared);
        for loser in local_losers.iter().cloned() {
            shared.emit(OperationEvent::ConflictResolved {
                winner: op.clone(),
                loser,
            });
        }

        shared.emit(OperationEvent::Remote(op));
    }

    /// Run one flush wave. Waits for a wave already in flight.
    async fn flush(self: &Arc<Self>) -> SyncResult<()> {
        let _wave = self.flush_lock.lock().await;
        self.flushing.store(true, Ordering::SeqCst);
        let result = self.flush_wave().await;
        self.flushing.store(false, Ordering::SeqCst);
        self.emit_status();
        result
    }

    async fn flush_wave(&self) -> SyncResult<()> {
        loop {
            let (document_id, batch) = {
                let mut shared = self.shared();
                let Some(document_id) = shared.session.as_ref().map(|s| s.document_id.clone()) else {
                    return Ok(());
                };

                if !self.connectivity.is_online() {
                    let pending: Vec<Operation> = shared.queue.drain(..).collect();
                    if !pending.is_empty() {
                        tracing::debug!(count = pending.len(), "Offline, buffering operations");
                        shared.offline.extend(pending);
                    }
                    self.sync_counters(&shared);
                    return Ok(());
                }

                let batch = shared.take_batch(self.config.max_batch_size);
                self.sync_counters(&shared);
                if batch.is_empty() {
                    return Ok(());
                }
                shared.in_flight = batch.clone();
                (document_id, batch)
            };

            let count = batch.len();
            match self.log.append(&document_id, batch.clone()).await {
                Ok(_) => {
                    let mut shared = self.shared();
                    shared.in_flight.clear();
                    shared.last_sync_time = Some(now_ms());
                    tracing::debug!(document_id = %document_id, count, "Flushed operations");
                }
                Err(e) => {
                    tracing::warn!(document_id = %document_id, count, "Flush failed, keeping operations: {}", e);
                    let mut shared = self.shared();
                    shared.in_flight.clear();
                    if self.connectivity.is_online() {
                        shared.queue.splice(0..0, batch);
                    } else {
                        shared.offline.prepend(batch);
                    }
                    self.sync_counters(&shared);
                    return Err(e.into());
                }
            }
        }
    }
}

// =============================================================================
// Operations service
// =============================================================================

/// Sync session for one (document, user) pair.
///
/// Cheap to clone; clones share the session.
pub struct OperationsService<L: OperationLog> {
    inner: Arc<Inner<L>>,
}

impl<L: OperationLog> Clone for OperationsService<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: OperationLog> OperationsService<L> {
    pub fn new(log: Arc<L>, connectivity: Connectivity, config: OperationsConfig) -> Self {
        let mut resolver = ConflictResolver::new(config.conflict_window_ms as i64);
        if config.keep_conflict_history {
            resolver = resolver.with_history();
        }
        let shared = Shared {
            state: SessionState::Uninitialized,
            session: None,
            epoch: 0,
            queue: Vec::new(),
            in_flight: Vec::new(),
            offline: OfflineBuffer::default(),
            watermark: Watermark::new(),
            seen: SeenIds::new(config.dedupe_capacity),
            resolver,
            hooks: Vec::new(),
            listeners: Vec::new(),
            last_sync_time: None,
            tasks: Vec::new(),
            runtime: None,
        };

        Self {
            inner: Arc::new(Inner {
                log,
                connectivity,
                config,
                shared: Mutex::new(shared),
                flush_lock: tokio::sync::Mutex::new(()),
                flush_generation: AtomicU64::new(0),
                queued: AtomicUsize::new(0),
                offline_queued: AtomicUsize::new(0),
                flushing: AtomicBool::new(false),
            }),
        }
    }

    /// Start (or join) the session for `document_id` as `user_id`.
    ///
    /// Calling again for the active pair only registers another event
    /// receiver and more resolver hooks. Calling for a different pair tears
    /// the current session down first.
    pub async fn initialize(
        &self,
        document_id: &str,
        user_id: &str,
        hooks: SessionHooks,
    ) -> SyncResult<mpsc::UnboundedReceiver<OperationEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let has_other_session = {
            let mut shared = self.inner.shared();
            let same_pair = shared
                .session
                .as_ref()
                .map(|s| s.document_id == document_id && s.user_id == user_id);
            match same_pair {
                Some(true) => {
                    tracing::info!(document_id, user_id, "Session already active, adding hooks");
                    shared.listeners.push(tx);
                    shared.hooks.extend(hooks.resolvers);
                    return Ok(rx);
                }
                Some(false) => true,
                None => false,
            }
        };
        if has_other_session {
            self.cleanup().await;
        }

        let since = now_ms() - self.inner.config.lookback_ms as i64;
        let client_id = ClientId::generate();
        let epoch = {
            let mut shared = self.inner.shared();
            shared.epoch += 1;
            let epoch = shared.epoch;
            shared.state = SessionState::Initializing;
            shared.session = Some(Session {
                document_id: document_id.to_string(),
                user_id: user_id.to_string(),
                client_id: client_id.clone(),
                epoch,
            });
            shared.queue.clear();
            shared.in_flight.clear();
            shared.watermark = Watermark::starting_at(since);
            shared.seen.clear();
            shared.listeners = vec![tx];
            shared.hooks = hooks.resolvers;
            shared.runtime = Some(Handle::current());
            shared.offline = OfflineBuffer::new(&self.inner.config.offline, document_id);
            if self.inner.config.offline.storage_path.is_some() {
                match shared.offline.load() {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(document_id, count = n, "Restored offline operations"),
                    Err(e) => tracing::warn!(document_id, "Failed to restore offline operations: {}", e),
                }
            }
            self.inner.sync_counters(&shared);
            epoch
        };

        // Subscribe before querying so nothing appended in between is lost.
        let stream = match self.inner.log.subscribe(document_id, since).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(document_id, "Failed to subscribe to operation log: {}", e);
                let mut shared = self.inner.shared();
                shared.session = None;
                shared.state = SessionState::Uninitialized;
                shared.listeners.clear();
                return Err(e.into());
            }
        };

        match self.inner.log.query_since(document_id, since).await {
            Ok(history) => {
                tracing::debug!(document_id, count = history.len(), "Replaying history");
                for op in history {
                    self.inner.receive(op, epoch);
                }
            }
            Err(e) => tracing::warn!(document_id, "Failed to load history: {}", e),
        }

        let tasks = vec![self.spawn_listener(stream, epoch), self.spawn_connectivity_watcher()];
        {
            let mut shared = self.inner.shared();
            shared.tasks = tasks;
            shared.state = SessionState::Active;
        }

        // Operations restored from disk go out with the first wave.
        if self.inner.offline_queued.load(Ordering::SeqCst) > 0 && self.inner.connectivity.is_online() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                if let Err(e) = inner.flush().await {
                    tracing::warn!("Flushing restored operations failed: {}", e);
                }
            });
        }

        tracing::info!(document_id, user_id, client_id = %client_id, "Operations session started");
        Ok(rx)
    }

    fn spawn_listener(&self, mut stream: OperationStream, epoch: u64) -> JoinHandle<()> {
        let weak: Weak<Inner<L>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(op) = stream.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.receive(op, epoch);
            }
        })
    }

    fn spawn_connectivity_watcher(&self) -> JoinHandle<()> {
        let weak: Weak<Inner<L>> = Arc::downgrade(&self.inner);
        let mut changes = self.inner.connectivity.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let online = *changes.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if online {
                    if let Err(e) = inner.flush().await {
                        tracing::warn!("Reconnect flush failed: {}", e);
                    }
                } else {
                    inner.emit_status();
                }
            }
        })
    }

    /// Stamp and queue a local operation.
    ///
    /// Returns the stamped operation for optimistic local application, or
    /// `None` if there is no active session.
    pub fn queue_operation(&self, draft: OperationDraft) -> Option<Operation> {
        let mut shared = self.inner.shared();
        let (Some(session), Some(runtime)) = (shared.session.as_ref(), shared.runtime.clone()) else {
            tracing::warn!(op = %draft.kind(), "Dropping operation, session not initialized");
            return None;
        };
        if shared.state == SessionState::CleaningUp {
            tracing::warn!(op = %draft.kind(), "Dropping operation, session is closing");
            return None;
        }

        let op = draft.stamp(session.user_id.clone(), session.client_id.clone(), now_ms());
        shared.queue.push(op.clone());
        self.inner.sync_counters(&shared);
        drop(shared);

        let generation = self.inner.flush_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        let window = Duration::from_millis(self.inner.config.batch_window_ms);
        runtime.spawn(async move {
            tokio::time::sleep(window).await;
            if inner.flush_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Err(e) = inner.flush().await {
                tracing::debug!("Scheduled flush failed: {}", e);
            }
        });

        Some(op)
    }

    /// Flush both the queue and the offline buffer now.
    pub async fn force_sync(&self) -> SyncResult<()> {
        if self.inner.shared().session.is_none() {
            tracing::warn!("force_sync called without an active session");
            return Ok(());
        }
        self.inner.flush().await
    }

    /// End the session: best-effort final flush, then unsubscribe.
    ///
    /// Never fails. Operations that could not be sent are kept in the
    /// offline buffer (persisted if storage is configured).
    pub async fn cleanup(&self) {
        let document_id = {
            let mut shared = self.inner.shared();
            let Some(session) = shared.session.as_ref() else {
                return;
            };
            let document_id = session.document_id.clone();
            shared.state = SessionState::CleaningUp;
            document_id
        };
        // Cancel pending debounce timers.
        self.inner.flush_generation.fetch_add(1, Ordering::SeqCst);

        let timeout = Duration::from_millis(self.inner.config.cleanup_flush_timeout_ms);
        match tokio::time::timeout(timeout, self.inner.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(document_id = %document_id, "Final flush failed: {}", e),
            Err(_) => {
                tracing::warn!(document_id = %document_id, "Final flush timed out");
                self.inner.flushing.store(false, Ordering::SeqCst);
            }
        }

        let mut shared = self.inner.shared();
        let in_flight = std::mem::take(&mut shared.in_flight);
        shared.offline.prepend(in_flight);
        for task in shared.tasks.drain(..) {
            task.abort();
        }
        let unsent: Vec<Operation> = shared.queue.drain(..).collect();
        shared.offline.extend(unsent);
        if !shared.offline.is_empty() {
            if self.inner.config.offline.storage_path.is_none() {
                tracing::warn!(
                    document_id = %document_id,
                    count = shared.offline.len(),
                    "Discarding unsent operations"
                );
            } else if let Err(e) = shared.offline.save() {
                tracing::warn!(document_id = %document_id, "Failed to save unsent operations: {}", e);
            }
        }
        shared.offline = OfflineBuffer::default();
        shared.session = None;
        shared.state = SessionState::Uninitialized;
        shared.listeners.clear();
        shared.hooks.clear();
        shared.runtime = None;
        self.inner.sync_counters(&shared);

        tracing::info!(document_id = %document_id, "Operations session closed");
    }

    /// Operations not yet acknowledged by the log. Lock-free.
    pub fn queue_size(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst) + self.inner.offline_queued.load(Ordering::SeqCst)
    }

    /// True when nothing is queued, buffered or in flight. Lock-free.
    pub fn is_synced(&self) -> bool {
        !self.inner.flushing.load(Ordering::SeqCst)
            && self.inner.queued.load(Ordering::SeqCst) == 0
            && self.inner.offline_queued.load(Ordering::SeqCst) == 0
    }

    pub fn status(&self) -> SyncStatus {
        let shared = self.inner.shared();
        self.inner.status_of(&shared)
    }

    pub fn state(&self) -> SessionState {
        self.inner.shared().state
    }

    /// Client id of the active session
    pub fn client_id(&self) -> Option<ClientId> {
        self.inner.shared().session.as_ref().map(|s| s.client_id.clone())
    }

    pub fn document_id(&self) -> Option<String> {
        self.inner.shared().session.as_ref().map(|s| s.document_id.clone())
    }

    /// Conflicts resolved so far, if history is enabled
    pub fn conflict_history(&self) -> Vec<crate::conflict::ConflictRecord> {
        self.inner.shared().resolver.history().to_vec()
    }

    /// Error if there is no active session
    pub fn ensure_active(&self) -> SyncResult<()> {
        match self.state() {
            SessionState::Active => Ok(()),
            _ => Err(SyncError::NotInitialized),
        }
    }
}
