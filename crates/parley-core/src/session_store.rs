//! TTL-bound conversation state keyed by opaque session id.
//!
//! Sessions live in a concurrent map of `Arc<Mutex<ChatSession>>` slots. A
//! caller holds the slot's async mutex for the whole turn, so messages on one
//! session apply in arrival order while unrelated sessions proceed in
//! parallel. An optional SQLite mirror keeps sessions across restarts; its
//! failures degrade to in-process state with a warning.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::SessionConfig;
use crate::error::{ParleyError, Result};
use crate::model::{ChatSession, ChatTurn};
use crate::storage::SqliteStorage;

type Slot = Arc<Mutex<ChatSession>>;

/// Exclusive access to one live session for the duration of a turn.
pub struct SessionLease {
    guard: OwnedMutexGuard<ChatSession>,
    is_new: bool,
}

impl SessionLease {
    pub fn is_new(&self) -> bool {
        self.is_new
    }
}

impl Deref for SessionLease {
    type Target = ChatSession;

    fn deref(&self) -> &ChatSession {
        &self.guard
    }
}

impl DerefMut for SessionLease {
    fn deref_mut(&mut self) -> &mut ChatSession {
        &mut self.guard
    }
}

pub struct SessionStore {
    sessions: DashMap<String, Slot>,
    ttl: Duration,
    max_history: usize,
    mirror: Option<SqliteStorage>,
    mirror_degraded: AtomicBool,
}

impl SessionStore {
    pub fn new(ttl: Duration, max_history: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            max_history: max_history.max(1),
            mirror: None,
            mirror_degraded: AtomicBool::new(false),
        }
    }

    pub fn with_mirror(mut self, mirror: SqliteStorage) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Build from config. A mirror that cannot be opened is logged and
    /// skipped; the store then runs purely in-process.
    pub fn from_config(config: &SessionConfig) -> Self {
        let store = Self::new(
            Duration::seconds(config.ttl_secs as i64),
            config.max_history,
        );
        if !config.persist {
            return store;
        }
        match crate::storage::open_session_mirror(config) {
            Ok(mirror) => {
                tracing::info!(path = %mirror.path().display(), "session mirror opened");
                store.with_mirror(mirror)
            }
            Err(e) => {
                tracing::warn!(error = %e, "session mirror unavailable, using in-process sessions");
                store
            }
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the caller's live session, or a fresh one when `session_id` is
    /// absent, unknown, expired, or owned by a different user/client.
    pub async fn get_or_create(
        &self,
        session_id: Option<&str>,
        user_id: &str,
        client_id: &str,
    ) -> SessionLease {
        if let Some(id) = session_id.filter(|s| !s.is_empty()) {
            if let Some(guard) = self.lookup(id, Utc::now()).await {
                if guard.belongs_to(user_id, client_id) {
                    return SessionLease {
                        guard,
                        is_new: false,
                    };
                }
                tracing::warn!(
                    session_id = id,
                    user_id,
                    "session belongs to another principal, starting a new one"
                );
            }
        }
        self.create(user_id, client_id).await
    }

    /// Lock an existing live session owned by `user_id`/`client_id`.
    /// Never creates one.
    pub async fn resume(&self, session_id: &str, user_id: &str, client_id: &str) -> Option<SessionLease> {
        let guard = self.lookup(session_id, Utc::now()).await?;
        guard.belongs_to(user_id, client_id).then_some(SessionLease {
            guard,
            is_new: false,
        })
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Mark activity on the leased session.
    pub fn touch(&self, lease: &mut SessionLease) {
        lease.touch(Utc::now());
    }

    /// Append a turn to the leased session, keeping at most `max_history`.
    pub async fn append_turn(&self, lease: &mut SessionLease, turn: ChatTurn) {
        lease.push_turn(turn, self.max_history);
        // A session cleared mid-turn must not be resurrected in the mirror.
        if self.sessions.contains_key(&lease.session_id) {
            self.mirror_save(lease).await;
        }
    }

    /// Recent turns of a session owned by `user_id`/`client_id`.
    /// Unknown, expired and foreign sessions all read as not found.
    pub async fn history(
        &self,
        session_id: &str,
        user_id: &str,
        client_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatTurn>> {
        match self.lookup(session_id, Utc::now()).await {
            Some(guard) if guard.belongs_to(user_id, client_id) => Ok(guard.recent_turns(limit)),
            _ => Err(ParleyError::NotFound("session not found or expired".into())),
        }
    }

    /// End a session. Idempotent: returns whether anything was removed.
    pub async fn clear(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        let mirrored = match &self.mirror {
            Some(mirror) => match mirror.delete_session(session_id).await {
                Ok(found) => found,
                Err(e) => {
                    self.mark_degraded("clear", &e);
                    false
                }
            },
            None => false,
        };
        self.report_active();
        removed || mirrored
    }

    /// Clear only if the session belongs to `user_id`/`client_id`; anything
    /// else is a silent no-op.
    pub async fn clear_owned(&self, session_id: &str, user_id: &str, client_id: &str) -> bool {
        let owned = match self.lookup(session_id, Utc::now()).await {
            Some(guard) => guard.belongs_to(user_id, client_id),
            None => false,
        };
        owned && self.clear(session_id).await
    }

    /// Evict every expired session. Sessions currently in use are skipped;
    /// an active turn is activity by definition.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let ttl = self.ttl;
        let is_stale = |slot: &Slot| {
            slot.try_lock()
                .map(|s| s.is_expired(now, ttl))
                .unwrap_or(false)
        };

        let candidates: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| is_stale(e.value()))
            .map(|e| e.key().clone())
            .collect();

        let removed = candidates
            .iter()
            .filter(|id| self.sessions.remove_if(id.as_str(), |_, slot| is_stale(slot)).is_some())
            .count();

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.delete_inactive_since(now - ttl).await {
                self.mark_degraded("sweep", &e);
            }
        }

        self.report_active();
        if removed > 0 {
            tracing::debug!(removed, "swept expired sessions");
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// `"memory"`, `"ok"`, or `"degraded"` for the health endpoint.
    pub fn mirror_status(&self) -> &'static str {
        match &self.mirror {
            None => "memory",
            Some(_) if self.mirror_degraded.load(Ordering::Relaxed) => "degraded",
            Some(_) => "ok",
        }
    }

    async fn create(&self, user_id: &str, client_id: &str) -> SessionLease {
        let session = ChatSession::new(user_id, client_id);
        let id = session.session_id.clone();
        let slot: Slot = Arc::new(Mutex::new(session));
        let guard = Arc::clone(&slot).lock_owned().await;
        self.sessions.insert(id.clone(), slot);
        self.report_active();
        tracing::debug!(session_id = %id, user_id, "session created");

        let lease = SessionLease {
            guard,
            is_new: true,
        };
        self.mirror_save(&lease).await;
        lease
    }

    /// Lock the live session for `id`, evicting it if expired.
    async fn lookup(&self, id: &str, now: DateTime<Utc>) -> Option<OwnedMutexGuard<ChatSession>> {
        let existing = self.sessions.get(id).map(|e| Arc::clone(e.value()));
        let slot = match existing {
            Some(slot) => slot,
            None => self.load_from_mirror(id, now).await?,
        };
        let guard = Arc::clone(&slot).lock_owned().await;

        // Cleared or replaced while we waited for the lock.
        let still_live = self
            .sessions
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &slot));
        if !still_live {
            return None;
        }

        if guard.is_expired(now, self.ttl) {
            drop(guard);
            self.sessions.remove_if(id, |_, v| Arc::ptr_eq(v, &slot));
            if let Some(mirror) = &self.mirror {
                if let Err(e) = mirror.delete_session(id).await {
                    self.mark_degraded("evict", &e);
                }
            }
            self.report_active();
            tracing::debug!(session_id = id, "session expired");
            return None;
        }
        Some(guard)
    }

    async fn load_from_mirror(&self, id: &str, now: DateTime<Utc>) -> Option<Slot> {
        let mirror = self.mirror.as_ref()?;
        let session = match mirror.load_session(id).await {
            Ok(Some(session)) => session,
            Ok(None) => return None,
            Err(e) => {
                self.mark_degraded("load", &e);
                return None;
            }
        };
        if session.is_expired(now, self.ttl) {
            if let Err(e) = mirror.delete_session(id).await {
                self.mark_degraded("evict", &e);
            }
            return None;
        }
        let slot = Arc::clone(
            self.sessions
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(session)))
                .value(),
        );
        self.report_active();
        Some(slot)
    }

    async fn mirror_save(&self, session: &ChatSession) {
        if let Some(mirror) = &self.mirror {
            match mirror.save_session(session).await {
                Ok(()) => self.mirror_degraded.store(false, Ordering::Relaxed),
                Err(e) => self.mark_degraded("save", &e),
            }
        }
    }

    fn mark_degraded(&self, op: &str, error: &ParleyError) {
        self.mirror_degraded.store(true, Ordering::Relaxed);
        tracing::warn!(op, error = %error, "session mirror failed, continuing in-process");
    }

    fn report_active(&self) {
        metrics::gauge!(crate::metrics::CHAT_SESSIONS_ACTIVE).set(self.sessions.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(Duration::minutes(30), 10)
    }

    #[tokio::test]
    async fn test_creates_session_when_none_given() {
        let store = store();
        let lease = store.get_or_create(None, "alice", "acme").await;
        assert!(lease.is_new());
        assert_eq!(lease.session_id.len(), 32);
        assert_eq!(store.active_count(), 1);
    }

    #[tokio::test]
    async fn test_reuses_live_session() {
        let store = store();
        let id = {
            let mut lease = store.get_or_create(None, "alice", "acme").await;
            store.append_turn(&mut lease, ChatTurn::user("hi")).await;
            lease.session_id.clone()
        };
        let lease = store.get_or_create(Some(&id), "alice", "acme").await;
        assert!(!lease.is_new());
        assert_eq!(lease.history.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_session_is_replaced_and_unreachable() {
        let store = store();
        let id = {
            let mut lease = store.get_or_create(None, "alice", "acme").await;
            store.append_turn(&mut lease, ChatTurn::user("hi")).await;
            lease.last_activity_at = Utc::now() - Duration::minutes(30);
            lease.session_id.clone()
        };

        let lease = store.get_or_create(Some(&id), "alice", "acme").await;
        assert!(lease.is_new());
        assert_ne!(lease.session_id, id);
        assert!(lease.history.is_empty());
        drop(lease);

        let err = store.history(&id, "alice", "acme", 10).await.unwrap_err();
        assert!(matches!(err, ParleyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_session_just_inside_ttl_survives() {
        let store = store();
        let id = {
            let mut lease = store.get_or_create(None, "alice", "acme").await;
            lease.last_activity_at = Utc::now() - Duration::minutes(29);
            lease.session_id.clone()
        };
        let lease = store.get_or_create(Some(&id), "alice", "acme").await;
        assert!(!lease.is_new());
    }

    #[tokio::test]
    async fn test_foreign_session_never_reassigned() {
        let store = store();
        let id = {
            let mut lease = store.get_or_create(None, "alice", "acme").await;
            store.append_turn(&mut lease, ChatTurn::user("secret")).await;
            lease.session_id.clone()
        };

        let lease = store.get_or_create(Some(&id), "mallory", "acme").await;
        assert!(lease.is_new());
        assert_ne!(lease.session_id, id);
        assert_eq!(lease.user_id, "mallory");
        drop(lease);

        // Same user id under another client is still a different principal.
        let lease = store.get_or_create(Some(&id), "alice", "globex").await;
        assert!(lease.is_new());
        drop(lease);

        let original = store.history(&id, "alice", "acme", 10).await.unwrap();
        assert_eq!(original.len(), 1);
        assert!(store.history(&id, "mallory", "acme", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_resume_never_creates() {
        let store = store();
        assert!(store.resume("nope", "alice", "acme").await.is_none());
        assert_eq!(store.active_count(), 0);

        let id = store
            .get_or_create(None, "alice", "acme")
            .await
            .session_id
            .clone();
        assert!(store.resume(&id, "mallory", "acme").await.is_none());
        let lease = store.resume(&id, "alice", "acme").await.unwrap();
        assert!(!lease.is_new());
    }

    #[tokio::test]
    async fn test_history_ring_buffer() {
        let store = store();
        let mut lease = store.get_or_create(None, "alice", "acme").await;
        for i in 0..11 {
            store
                .append_turn(&mut lease, ChatTurn::user(format!("turn {i}")))
                .await;
        }
        assert_eq!(lease.history.len(), 10);
        assert_eq!(lease.history[0].text, "turn 1");
        assert_eq!(lease.history[9].text, "turn 10");
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let store = store();
        let id = store
            .get_or_create(None, "alice", "acme")
            .await
            .session_id
            .clone();
        assert!(store.clear(&id).await);
        assert!(!store.clear(&id).await);
        assert_eq!(store.active_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_owned_ignores_foreign_sessions() {
        let store = store();
        let id = store
            .get_or_create(None, "alice", "acme")
            .await
            .session_id
            .clone();
        assert!(!store.clear_owned(&id, "mallory", "acme").await);
        assert_eq!(store.active_count(), 1);
        assert!(store.clear_owned(&id, "alice", "acme").await);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let store = store();
        {
            let mut stale = store.get_or_create(None, "alice", "acme").await;
            stale.last_activity_at = Utc::now() - Duration::hours(1);
        }
        let _fresh_id = store
            .get_or_create(None, "bob", "acme")
            .await
            .session_id
            .clone();

        assert_eq!(store.sweep_expired().await, 1);
        assert_eq!(store.active_count(), 1);
        assert_eq!(store.sweep_expired().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_sessions_in_use() {
        let store = store();
        let mut held = store.get_or_create(None, "alice", "acme").await;
        held.last_activity_at = Utc::now() - Duration::hours(1);
        assert_eq!(store.sweep_expired().await, 0);
        drop(held);
        assert_eq!(store.sweep_expired().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_turns_are_serialized() {
        let store = Arc::new(SessionStore::new(Duration::minutes(30), 100));
        let id = store
            .get_or_create(None, "alice", "acme")
            .await
            .session_id
            .clone();

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let store = Arc::clone(&store);
                let id = id.clone();
                tokio::spawn(async move {
                    let mut lease = store.get_or_create(Some(&id), "alice", "acme").await;
                    let seen = lease.history.len();
                    tokio::task::yield_now().await;
                    store
                        .append_turn(&mut lease, ChatTurn::user(format!("{i}:{seen}")))
                        .await;
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        let history = store.history(&id, "alice", "acme", 100).await.unwrap();
        assert_eq!(history.len(), 20);
        // Each turn saw exactly the turns appended before it.
        for (pos, turn) in history.iter().enumerate() {
            let seen: usize = turn.text.split(':').nth(1).unwrap().parse().unwrap();
            assert_eq!(seen, pos);
        }
    }

    #[tokio::test]
    async fn test_mirror_restores_sessions() {
        let mirror = SqliteStorage::open_in_memory().unwrap();
        let first = SessionStore::new(Duration::minutes(30), 10).with_mirror(mirror.clone());
        let id = {
            let mut lease = first.get_or_create(None, "alice", "acme").await;
            first
                .append_turn(&mut lease, ChatTurn::user("what's blocking TSK-42?"))
                .await;
            lease.session_id.clone()
        };
        assert_eq!(first.mirror_status(), "ok");

        let restarted = SessionStore::new(Duration::minutes(30), 10).with_mirror(mirror);
        let lease = restarted.get_or_create(Some(&id), "alice", "acme").await;
        assert!(!lease.is_new());
        assert_eq!(lease.history.len(), 1);
    }

    #[tokio::test]
    async fn test_broken_mirror_degrades_to_in_process() {
        let mirror = SqliteStorage::open_in_memory().unwrap();
        mirror
            .with_conn(|conn| {
                conn.execute_batch("DROP TABLE chat_sessions;")
                    .map_err(|e| ParleyError::Storage(e.to_string()))
            })
            .await
            .unwrap();

        let store = SessionStore::new(Duration::minutes(30), 10).with_mirror(mirror);
        let id = {
            let mut lease = store.get_or_create(None, "alice", "acme").await;
            store.append_turn(&mut lease, ChatTurn::user("hi")).await;
            lease.session_id.clone()
        };
        assert_eq!(store.mirror_status(), "degraded");

        let lease = store.get_or_create(Some(&id), "alice", "acme").await;
        assert!(!lease.is_new());
        assert_eq!(lease.history.len(), 1);
    }
}
