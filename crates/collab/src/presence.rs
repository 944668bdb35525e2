//! Presence service: who is on a canvas and where their cursor is.
//!
//! Each participant owns one record per document, overwritten in place. The
//! service publishes the local record, follows everyone else's, and turns
//! map snapshots into join/leave/update events. A local sweep evicts entries
//! that went stale without a proper leave (crash, lost network).

use crate::clock::now_ms;
use crate::error::SyncResult;
use crate::transport::{MessageStream, PresenceSnapshot, PresenceStore, PresenceStream};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

/// Default cursor colors
pub fn default_colors() -> Vec<String> {
    vec![
        "#E91E63".into(), // Pink
        "#9C27B0".into(), // Purple
        "#3F51B5".into(), // Indigo
        "#2196F3".into(), // Blue
        "#00BCD4".into(), // Cyan
        "#4CAF50".into(), // Green
        "#FF9800".into(), // Orange
        "#795548".into(), // Brown
    ]
}

/// Configuration for a presence session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    pub heartbeat_interval_ms: u64,
    pub sweep_interval_ms: u64,
    /// A record older than this is no longer active
    pub stale_after_ms: u64,
    /// Trailing window for coalescing cursor moves
    pub cursor_throttle_ms: u64,
    pub message_ttl_ms: u64,
    /// Upper bound on the final offline write during cleanup
    pub cleanup_timeout_ms: u64,
    pub palette: Vec<String>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            sweep_interval_ms: 15_000,
            stale_after_ms: 30_000,
            cursor_throttle_ms: 16,
            message_ttl_ms: 5_000,
            cleanup_timeout_ms: 2_000,
            palette: default_colors(),
        }
    }
}

impl PresenceConfig {
    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_sweep_interval(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }

    pub fn with_stale_after(mut self, ms: u64) -> Self {
        self.stale_after_ms = ms;
        self
    }

    pub fn with_palette(mut self, palette: Vec<String>) -> Self {
        self.palette = palette;
        self
    }
}

// =============================================================================
// Records
// =============================================================================

/// Cursor position in canvas coordinates
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

/// Who the local user is
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            display_name: display_name.into(),
        }
    }
}

/// Current presence of one user in one document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    /// Last heartbeat or cursor move (ms)
    pub last_seen: i64,
    pub is_online: bool,
}

impl PresenceRecord {
    pub fn new(identity: &UserIdentity, color: impl Into<String>) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            email: identity.email.clone(),
            display_name: identity.display_name.clone(),
            color: color.into(),
            cursor: None,
            last_seen: now_ms(),
            is_online: true,
        }
    }

    /// Online and seen within `stale_after_ms` of `now`
    pub fn is_active(&self, now: i64, stale_after_ms: u64) -> bool {
        self.is_online && now - self.last_seen <= stale_after_ms as i64
    }

    pub fn apply(&mut self, patch: &PresencePatch) {
        if let Some(cursor) = patch.cursor {
            self.cursor = Some(cursor);
        }
        if let Some(last_seen) = patch.last_seen {
            self.last_seen = last_seen;
        }
        if let Some(is_online) = patch.is_online {
            self.is_online = is_online;
        }
    }
}

/// Partial presence update; `None` fields are left alone
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
}

impl PresencePatch {
    /// Heartbeat: online, seen now
    pub fn alive(now: i64) -> Self {
        Self {
            cursor: None,
            last_seen: Some(now),
            is_online: Some(true),
        }
    }

    /// Final write on leave
    pub fn offline(now: i64) -> Self {
        Self {
            cursor: None,
            last_seen: Some(now),
            is_online: Some(false),
        }
    }
}

/// Ephemeral chat message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub text: String,
    /// Posting time (ms)
    pub timestamp: i64,
}

/// Events delivered to the host
#[derive(Clone, Debug, PartialEq)]
pub enum PresenceEvent {
    UserJoined(PresenceRecord),
    UserLeft { user_id: String },
    UserUpdated(PresenceRecord),
    /// All active participants (including the local user) after a change
    PresenceChanged(HashMap<String, PresenceRecord>),
    Message(ChatMessage),
}

/// Diff a presence snapshot against the currently known active set.
///
/// Returns the events to emit (join/leave/update, then the full map) and the
/// new known set. Only active records are kept. The local user never gets
/// join or leave events.
pub fn diff_presence(
    known: &HashMap<String, PresenceRecord>,
    incoming: &PresenceSnapshot,
    local_user: &str,
    now: i64,
    stale_after_ms: u64,
) -> (Vec<PresenceEvent>, HashMap<String, PresenceRecord>) {
    let active: HashMap<String, PresenceRecord> = incoming
        .iter()
        .filter(|(_, record)| record.is_active(now, stale_after_ms))
        .map(|(id, record)| (id.clone(), record.clone()))
        .collect();

    let mut events = Vec::new();
    for (user_id, record) in &active {
        if user_id == local_user {
            continue;
        }
        match known.get(user_id) {
            None => events.push(PresenceEvent::UserJoined(record.clone())),
            Some(previous) if previous != record => events.push(PresenceEvent::UserUpdated(record.clone())),
            Some(_) => {}
        }
    }
    for user_id in known.keys() {
        if user_id != local_user && !active.contains_key(user_id) {
            events.push(PresenceEvent::UserLeft {
                user_id: user_id.clone(),
            });
        }
    }
    events.push(PresenceEvent::PresenceChanged(active.clone()));

    (events, active)
}

// =============================================================================
// Presence service
// =============================================================================

struct PresenceSession {
    document_id: String,
    identity: UserIdentity,
    color: String,
    epoch: u64,
}

#[derive(Default)]
struct Shared {
    session: Option<PresenceSession>,
    epoch: u64,
    /// Active participants by user id
    known: HashMap<String, PresenceRecord>,
    listeners: Vec<mpsc::UnboundedSender<PresenceEvent>>,
    tasks: Vec<JoinHandle<()>>,
    runtime: Option<Handle>,
    pending_cursor: Option<Cursor>,
    cursor_scheduled: bool,
}

impl Shared {
    fn emit(&mut self, event: PresenceEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn current(&self, epoch: u64) -> Option<&PresenceSession> {
        self.session.as_ref().filter(|s| s.epoch == epoch)
    }
}

struct Inner<S> {
    store: Arc<S>,
    config: PresenceConfig,
    shared: Mutex<Shared>,
}

impl<S: PresenceStore> Inner<S> {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_snapshot(&self, snapshot: PresenceSnapshot, epoch: u64) {
        let mut shared = self.shared();
        let Some(local_user) = shared.current(epoch).map(|s| s.identity.user_id.clone()) else {
            return;
        };
        let (events, known) = diff_presence(
            &shared.known,
            &snapshot,
            &local_user,
            now_ms(),
            self.config.stale_after_ms,
        );
        shared.known = known;
        for event in events {
            if let PresenceEvent::UserJoined(record) = &event {
                tracing::debug!(user_id = %record.user_id, "User joined");
            }
            if let PresenceEvent::UserLeft { user_id } = &event {
                tracing::debug!(user_id = %user_id, "User left");
            }
            shared.emit(event);
        }
    }

    /// Evict entries that went stale without a leave.
    fn sweep(&self, epoch: u64) {
        let mut shared = self.shared();
        let Some(local_user) = shared.current(epoch).map(|s| s.identity.user_id.clone()) else {
            return;
        };
        let now = now_ms();
        let stale: Vec<String> = shared
            .known
            .iter()
            .filter(|(id, record)| **id != local_user && !record.is_active(now, self.config.stale_after_ms))
            .map(|(id, _)| id.clone())
            .collect();
        if stale.is_empty() {
            return;
        }
        for user_id in stale {
            tracing::debug!(user_id = %user_id, "Evicting stale presence");
            shared.known.remove(&user_id);
            shared.emit(PresenceEvent::UserLeft { user_id });
        }
        let known = shared.known.clone();
        shared.emit(PresenceEvent::PresenceChanged(known));
    }

    fn deliver_message(&self, message: ChatMessage, epoch: u64) {
        let mut shared = self.shared();
        if shared.current(epoch).is_none() {
            return;
        }
        if now_ms() - message.timestamp > self.config.message_ttl_ms as i64 {
            return;
        }
        shared.emit(PresenceEvent::Message(message));
    }

    /// Document and user of the session, if `epoch` is still current
    fn target(&self, epoch: u64) -> Option<(String, String)> {
        self.shared()
            .current(epoch)
            .map(|s| (s.document_id.clone(), s.identity.user_id.clone()))
    }

    async fn heartbeat(&self, epoch: u64) {
        let Some((document_id, user_id)) = self.target(epoch) else {
            return;
        };
        if let Err(e) = self.store.update(&document_id, &user_id, PresencePatch::alive(now_ms())).await {
            tracing::warn!(document_id = %document_id, "Presence heartbeat failed: {}", e);
        }
    }

    async fn flush_cursor(&self, epoch: u64) {
        let (target, cursor) = {
            let mut shared = self.shared();
            shared.cursor_scheduled = false;
            let cursor = shared.pending_cursor.take();
            let target = shared
                .current(epoch)
                .map(|s| (s.document_id.clone(), s.identity.user_id.clone()));
            (target, cursor)
        };
        let (Some((document_id, user_id)), Some(cursor)) = (target, cursor) else {
            return;
        };
        let patch = PresencePatch {
            cursor: Some(cursor),
            ..PresencePatch::alive(now_ms())
        };
        if let Err(e) = self.store.update(&document_id, &user_id, patch).await {
            tracing::warn!(document_id = %document_id, "Cursor update failed: {}", e);
        }
    }
}

/// Presence session for one (document, user) pair.
///
/// Cheap to clone; clones share the session.
pub struct PresenceService<S: PresenceStore> {
    inner: Arc<Inner<S>>,
}

impl<S: PresenceStore> Clone for PresenceService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: PresenceStore> PresenceService<S> {
    pub fn new(store: Arc<S>, config: PresenceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    fn pick_color(&self) -> String {
        self.inner
            .config
            .palette
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| "#E91E63".to_string())
    }

    /// Join `document_id` as `identity`.
    ///
    /// Calling again for the active pair only registers another event
    /// receiver. Calling for a different pair leaves the current one first.
    pub async fn initialize_presence(
        &self,
        document_id: &str,
        identity: UserIdentity,
    ) -> SyncResult<mpsc::UnboundedReceiver<PresenceEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let has_other_session = {
            let mut shared = self.inner.shared();
            let same_pair = shared
                .session
                .as_ref()
                .map(|s| s.document_id == document_id && s.identity.user_id == identity.user_id);
            match same_pair {
                Some(true) => {
                    tracing::info!(document_id, user_id = %identity.user_id, "Presence already active, adding receiver");
                    shared.listeners.push(tx);
                    return Ok(rx);
                }
                Some(false) => true,
                None => false,
            }
        };
        if has_other_session {
            self.cleanup().await;
        }

        let color = self.pick_color();
        let record = PresenceRecord::new(&identity, color.clone());
        let user_id = identity.user_id.clone();
        let epoch = {
            let mut shared = self.inner.shared();
            shared.epoch += 1;
            let epoch = shared.epoch;
            shared.session = Some(PresenceSession {
                document_id: document_id.to_string(),
                identity,
                color,
                epoch,
            });
            shared.known.clear();
            shared.listeners = vec![tx];
            shared.runtime = Some(Handle::current());
            shared.pending_cursor = None;
            shared.cursor_scheduled = false;
            epoch
        };

        let store = &self.inner.store;
        let started = async {
            store.set(document_id, record).await?;
            store.register_disconnect(document_id, &user_id).await?;
            store.subscribe(document_id).await
        };
        let stream = match started.await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(document_id, user_id = %user_id, "Failed to join presence: {}", e);
                let mut shared = self.inner.shared();
                shared.session = None;
                shared.listeners.clear();
                shared.runtime = None;
                return Err(e.into());
            }
        };

        let mut tasks = vec![
            self.spawn_snapshot_listener(stream, epoch),
            self.spawn_heartbeat(epoch),
            self.spawn_sweep(epoch),
        ];
        match self.inner.store.subscribe_messages(document_id).await {
            Ok(messages) => tasks.push(self.spawn_message_listener(messages, epoch)),
            Err(e) => tracing::warn!(document_id, "Failed to subscribe to messages: {}", e),
        }
        self.inner.shared().tasks = tasks;

        tracing::info!(document_id, user_id = %user_id, "Presence session started");
        Ok(rx)
    }

    fn spawn_snapshot_listener(&self, mut stream: PresenceStream, epoch: u64) -> JoinHandle<()> {
        let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(snapshot) = stream.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.apply_snapshot(snapshot, epoch);
            }
        })
    }

    fn spawn_message_listener(&self, mut messages: MessageStream, epoch: u64) -> JoinHandle<()> {
        let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.deliver_message(message, epoch);
            }
        })
    }

    fn spawn_heartbeat(&self, epoch: u64) -> JoinHandle<()> {
        let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(self.inner.config.heartbeat_interval_ms);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.heartbeat(epoch).await;
            }
        })
    }

    fn spawn_sweep(&self, epoch: u64) -> JoinHandle<()> {
        let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(self.inner.config.sweep_interval_ms);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.sweep(epoch);
            }
        })
    }

    /// Publish a cursor position.
    ///
    /// Moves within the throttle window are coalesced and only the latest
    /// position is written. Returns false if there is no active session.
    pub fn update_cursor(&self, x: f64, y: f64) -> bool {
        let mut shared = self.inner.shared();
        let (Some(epoch), Some(runtime)) = (shared.session.as_ref().map(|s| s.epoch), shared.runtime.clone()) else {
            tracing::warn!("Dropping cursor update, presence not initialized");
            return false;
        };

        shared.pending_cursor = Some(Cursor { x, y });
        if shared.cursor_scheduled {
            return true;
        }
        shared.cursor_scheduled = true;
        drop(shared);

        let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);
        let window = Duration::from_millis(self.inner.config.cursor_throttle_ms);
        runtime.spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush_cursor(epoch).await;
            }
        });
        true
    }

    /// Post an ephemeral message that expires after the configured TTL.
    ///
    /// Returns `None` if there is no active session or the post failed.
    pub async fn send_message(&self, text: impl Into<String>) -> Option<ChatMessage> {
        let (document_id, message, runtime) = {
            let shared = self.inner.shared();
            let (Some(session), Some(runtime)) = (shared.session.as_ref(), shared.runtime.clone()) else {
                tracing::warn!("Dropping message, presence not initialized");
                return None;
            };
            let message = ChatMessage {
                id: Uuid::new_v4().to_string(),
                user_id: session.identity.user_id.clone(),
                display_name: session.identity.display_name.clone(),
                color: session.color.clone(),
                text: text.into(),
                timestamp: now_ms(),
            };
            (session.document_id.clone(), message, runtime)
        };

        if let Err(e) = self.inner.store.post_message(&document_id, message.clone()).await {
            tracing::warn!(document_id = %document_id, "Failed to post message: {}", e);
            return None;
        }

        let store = Arc::clone(&self.inner.store);
        let ttl = Duration::from_millis(self.inner.config.message_ttl_ms);
        let message_id = message.id.clone();
        runtime.spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Err(e) = store.remove_message(&document_id, &message_id).await {
                tracing::debug!(message_id = %message_id, "Failed to expire message: {}", e);
            }
        });

        Some(message)
    }

    /// Active participants other than the local user, by user id
    pub fn active_users(&self) -> Vec<PresenceRecord> {
        let shared = self.inner.shared();
        let Some(local_user) = shared.session.as_ref().map(|s| s.identity.user_id.as_str()) else {
            return Vec::new();
        };
        let now = now_ms();
        let mut users: Vec<PresenceRecord> = shared
            .known
            .values()
            .filter(|r| r.user_id != local_user && r.is_active(now, self.inner.config.stale_after_ms))
            .cloned()
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    /// Color assigned to the local user
    pub fn local_color(&self) -> Option<String> {
        self.inner.shared().session.as_ref().map(|s| s.color.clone())
    }

    pub fn is_active(&self) -> bool {
        self.inner.shared().session.is_some()
    }

    /// Leave the document: stop timers, write a final offline record and
    /// drop all state. A failed final write is logged, not returned.
    pub async fn cleanup(&self) {
        let (document_id, user_id) = {
            let mut shared = self.inner.shared();
            let Some(session) = shared.session.take() else {
                return;
            };
            for task in shared.tasks.drain(..) {
                task.abort();
            }
            shared.known.clear();
            shared.listeners.clear();
            shared.runtime = None;
            shared.pending_cursor = None;
            shared.cursor_scheduled = false;
            (session.document_id, session.identity.user_id)
        };

        let timeout = Duration::from_millis(self.inner.config.cleanup_timeout_ms);
        let write = self
            .inner
            .store
            .update(&document_id, &user_id, PresencePatch::offline(now_ms()));
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(document_id = %document_id, "Failed to write offline presence: {}", e),
            Err(_) => tracing::warn!(document_id = %document_id, "Offline presence write timed out"),
        }

        tracing::info!(document_id = %document_id, user_id = %user_id, "Presence session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelResult;
    use crate::transport::MemoryPresenceStore;

    fn record(user: &str, last_seen: i64, online: bool) -> PresenceRecord {
        PresenceRecord {
            user_id: user.to_string(),
            email: format!("{user}@example.com"),
            display_name: user.to_string(),
            color: "#2196F3".to_string(),
            cursor: None,
            last_seen,
            is_online: online,
        }
    }

    fn snapshot(records: &[PresenceRecord]) -> PresenceSnapshot {
        records.iter().map(|r| (r.user_id.clone(), r.clone())).collect()
    }

    fn leaves(events: &[PresenceEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                PresenceEvent::UserLeft { user_id } => Some(user_id.as_str()),
                _ => None,
            })
            .collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PresenceEvent>) -> Vec<PresenceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_record_activity() {
        let now = 100_000;
        assert!(record("a", now - 30_000, true).is_active(now, 30_000));
        assert!(!record("a", now - 30_001, true).is_active(now, 30_000));
        assert!(!record("a", now, false).is_active(now, 30_000));
    }

    #[test]
    fn test_record_wire_shape() {
        let json = serde_json::to_value(record("a", 5, true)).unwrap();
        assert_eq!(json["userId"], "a");
        assert_eq!(json["displayName"], "a");
        assert_eq!(json["lastSeen"], 5);
        assert_eq!(json["isOnline"], true);
        assert!(json.get("cursor").is_none());
    }

    #[test]
    fn test_diff_join_update_leave() {
        let now = 100_000;
        let known = HashMap::new();

        let first = snapshot(&[record("me", now, true), record("bob", now, true)]);
        let (events, known) = diff_presence(&known, &first, "me", now, 30_000);
        assert!(matches!(&events[0], PresenceEvent::UserJoined(r) if r.user_id == "bob"));
        assert_eq!(events.len(), 2);

        let mut moved = record("bob", now, true);
        moved.cursor = Some(Cursor { x: 1.0, y: 2.0 });
        let second = snapshot(&[record("me", now, true), moved]);
        let (events, known) = diff_presence(&known, &second, "me", now, 30_000);
        assert!(matches!(&events[0], PresenceEvent::UserUpdated(r) if r.cursor.is_some()));

        let third = snapshot(&[record("me", now, true)]);
        let (events, known) = diff_presence(&known, &third, "me", now, 30_000);
        assert_eq!(leaves(&events), vec!["bob"]);
        assert!(!known.contains_key("bob"));
    }

    #[test]
    fn test_stale_record_leaves_exactly_once() {
        let now = 100_000;
        let (_, known) = diff_presence(
            &HashMap::new(),
            &snapshot(&[record("bob", now, true)]),
            "me",
            now,
            30_000,
        );

        let stale = snapshot(&[record("bob", now - 40_000, false)]);
        let (events, known) = diff_presence(&known, &stale, "me", now, 30_000);
        assert_eq!(leaves(&events), vec!["bob"]);
        match events.last() {
            Some(PresenceEvent::PresenceChanged(map)) => assert!(map.is_empty()),
            other => panic!("unexpected {other:?}"),
        }

        let (events, _) = diff_presence(&known, &stale, "me", now, 30_000);
        assert!(leaves(&events).is_empty());
    }

    #[test]
    fn test_local_user_never_joins_or_leaves() {
        let now = 100_000;
        let (events, known) =
            diff_presence(&HashMap::new(), &snapshot(&[record("me", now, true)]), "me", now, 30_000);
        assert_eq!(events.len(), 1);
        assert!(known.contains_key("me"));

        let (events, _) = diff_presence(&known, &HashMap::new(), "me", now, 30_000);
        assert!(leaves(&events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_publishes_record() {
        let store = Arc::new(MemoryPresenceStore::new());
        let service = PresenceService::new(Arc::clone(&store), PresenceConfig::default());
        let _rx = service
            .initialize_presence("doc", UserIdentity::new("alice", "alice@example.com", "Alice"))
            .await
            .unwrap();

        let record = store.record("doc", "alice").unwrap();
        assert!(record.is_online);
        assert!(default_colors().contains(&record.color));
        assert_eq!(service.local_color(), Some(record.color));
        assert!(service.active_users().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_moves_are_coalesced() {
        let store = Arc::new(MemoryPresenceStore::new());
        let service = PresenceService::new(Arc::clone(&store), PresenceConfig::default());
        let _rx = service
            .initialize_presence("doc", UserIdentity::new("alice", "a@example.com", "Alice"))
            .await
            .unwrap();

        for i in 0..10 {
            assert!(service.update_cursor(i as f64, 0.0));
        }
        assert!(store.record("doc", "alice").unwrap().cursor.is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            store.record("doc", "alice").unwrap().cursor,
            Some(Cursor { x: 9.0, y: 0.0 })
        );
    }

    #[tokio::test]
    async fn test_calls_without_session_are_dropped() {
        let store = Arc::new(MemoryPresenceStore::new());
        let service = PresenceService::new(store, PresenceConfig::default());
        assert!(!service.update_cursor(1.0, 1.0));
        assert!(service.send_message("hi").await.is_none());
        assert!(service.active_users().is_empty());
        service.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_expire() {
        let store = Arc::new(MemoryPresenceStore::new());
        let service = PresenceService::new(Arc::clone(&store), PresenceConfig::default());
        let mut rx = service
            .initialize_presence("doc", UserIdentity::new("alice", "a@example.com", "Alice"))
            .await
            .unwrap();

        let message = service.send_message("hello").await.unwrap();
        assert_eq!(message.color, service.local_color().unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, PresenceEvent::Message(m) if m.text == "hello")));
        assert_eq!(store.messages("doc").len(), 1);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert!(store.messages("doc").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_stale_users() {
        let store = Arc::new(MemoryPresenceStore::new());
        // No heartbeat snapshots before the first sweep.
        let config = PresenceConfig::default().with_heartbeat_interval(600_000);
        let service = PresenceService::new(Arc::clone(&store), config);
        let mut rx = service
            .initialize_presence("doc", UserIdentity::new("alice", "a@example.com", "Alice"))
            .await
            .unwrap();

        store.set("doc", record("bob", now_ms(), true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(service.active_users().len(), 1);
        drain(&mut rx);

        // Wall clock does not follow paused time, so age bob's record by hand.
        service.inner.shared().known.get_mut("bob").unwrap().last_seen -= 60_000;
        tokio::time::sleep(Duration::from_millis(15_100)).await;

        let events = drain(&mut rx);
        assert_eq!(leaves(&events), vec!["bob"]);
        assert!(service.active_users().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_marks_offline() {
        let store = Arc::new(MemoryPresenceStore::new());
        let service = PresenceService::new(Arc::clone(&store), PresenceConfig::default());
        let _rx = service
            .initialize_presence("doc", UserIdentity::new("alice", "a@example.com", "Alice"))
            .await
            .unwrap();

        service.cleanup().await;
        assert!(!store.record("doc", "alice").unwrap().is_online);
        assert!(!service.is_active());
        assert!(service.local_color().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_tolerates_store_failure() {
        let store = Arc::new(MemoryPresenceStore::new());
        let service = PresenceService::new(Arc::clone(&store), PresenceConfig::default());
        let _rx = service
            .initialize_presence("doc", UserIdentity::new("alice", "a@example.com", "Alice"))
            .await
            .unwrap();

        store.set_available(false);
        service.cleanup().await;
        assert!(!service.is_active());
    }

    /// Store that accepts joins but never answers record updates
    struct StalledStore;

    impl PresenceStore for StalledStore {
        async fn set(&self, _document_id: &str, _record: PresenceRecord) -> ChannelResult<()> {
            Ok(())
        }

        async fn update(&self, _document_id: &str, _user_id: &str, _patch: PresencePatch) -> ChannelResult<()> {
            std::future::pending().await
        }

        async fn register_disconnect(&self, _document_id: &str, _user_id: &str) -> ChannelResult<()> {
            Ok(())
        }

        async fn subscribe(&self, _document_id: &str) -> ChannelResult<PresenceStream> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }

        async fn post_message(&self, _document_id: &str, _message: ChatMessage) -> ChannelResult<()> {
            Ok(())
        }

        async fn remove_message(&self, _document_id: &str, _message_id: &str) -> ChannelResult<()> {
            Ok(())
        }

        async fn subscribe_messages(&self, _document_id: &str) -> ChannelResult<MessageStream> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_gives_up_on_stalled_store() {
        let config = PresenceConfig {
            cleanup_timeout_ms: 500,
            ..PresenceConfig::default()
        };
        let service = PresenceService::new(Arc::new(StalledStore), config);
        let _rx = service
            .initialize_presence("doc", UserIdentity::new("alice", "a@example.com", "Alice"))
            .await
            .unwrap();
        assert!(service.update_cursor(1.0, 2.0));

        let started = tokio::time::Instant::now();
        service.cleanup().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(600));
        assert!(!service.is_active());
    }
}
