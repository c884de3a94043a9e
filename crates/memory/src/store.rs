use crate::session::{Clock, Session, SystemClock, TransitionRecord};
use common::PersistenceError;
use chrono::{DateTime, Utc};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use llm::Message;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Lazy, finite, single-pass sequence of live sessions.
pub type SessionIter = Box<dyn Iterator<Item = Session> + Send>;

/// Per-session conversation history with expiry.
///
/// Writes to the same session id are serialized by the store; writes to
/// different ids proceed independently. Every read or write of a session
/// resets its TTL. An expired session is never returned and is treated as
/// new by the next write.
pub trait SessionStore: Send + Sync {
    /// Append `messages` in order, creating the session if needed.
    fn append_many(
        &self,
        session_id: &str,
        messages: &[Message],
    ) -> Result<Session, PersistenceError>;

    /// Record a user turn in one step: a missing, expired or empty session
    /// is seeded with `seed`, otherwise only `last` is appended.
    fn append_turn(
        &self,
        session_id: &str,
        seed: &[Message],
        last: Message,
    ) -> Result<Session, PersistenceError>;

    fn append(&self, session_id: &str, message: Message) -> Result<Session, PersistenceError> {
        self.append_many(session_id, std::slice::from_ref(&message))
    }

    fn get(&self, session_id: &str) -> Result<Option<Session>, PersistenceError>;

    /// Every live session. Does not refresh TTLs.
    fn restore_all(&self) -> Result<SessionIter, PersistenceError>;

    /// Record `provider` as the session's current provider and return the
    /// previous one. Missing sessions are left alone and yield `None`.
    fn swap_provider(
        &self,
        session_id: &str,
        provider: &str,
    ) -> Result<Option<String>, PersistenceError>;

    /// Drop expired sessions, returning how many were removed.
    fn purge_expired(&self) -> Result<usize, PersistenceError>;

    /// Whether sessions survive a process restart.
    fn is_durable(&self) -> bool;
}

/// Append-only per-session audit trail of provider switches.
pub trait AuditLog: Send + Sync {
    fn append_transition(&self, record: TransitionRecord) -> Result<(), PersistenceError>;

    /// Records for `session_id` in the order they were appended.
    fn transitions(&self, session_id: &str) -> Result<Vec<TransitionRecord>, PersistenceError>;
}

/// Process-local store. The DashMap entry lock makes each per-session
/// read-modify-write atomic.
pub struct InMemorySessionStore {
    sessions: Arc<DashMap<String, Session>>,
    transitions: DashMap<String, Vec<TransitionRecord>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            transitions: DashMap::new(),
            ttl,
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Entry for `session_id`, locked, replaced by a fresh session if absent
    /// or expired.
    fn live_entry(&self, session_id: &str, now: DateTime<Utc>) -> RefMut<'_, String, Session> {
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id, now));

        if entry.is_expired(now, self.ttl) {
            debug!("Session {} expired, starting fresh", session_id);
            *entry = Session::new(session_id, now);
        }
        entry
    }
}

impl SessionStore for InMemorySessionStore {
    fn append_many(
        &self,
        session_id: &str,
        messages: &[Message],
    ) -> Result<Session, PersistenceError> {
        let now = self.clock.now();
        let mut entry = self.live_entry(session_id, now);

        entry.messages.extend_from_slice(messages);
        entry.touch(now);
        Ok(entry.clone())
    }

    fn append_turn(
        &self,
        session_id: &str,
        seed: &[Message],
        last: Message,
    ) -> Result<Session, PersistenceError> {
        let now = self.clock.now();
        let mut entry = self.live_entry(session_id, now);

        if entry.messages.is_empty() {
            debug!("New session {} seeded with {} messages", session_id, seed.len());
            entry.messages.extend_from_slice(seed);
        } else {
            entry.messages.push(last);
        }
        entry.touch(now);
        Ok(entry.clone())
    }

    fn get(&self, session_id: &str) -> Result<Option<Session>, PersistenceError> {
        let now = self.clock.now();
        match self.sessions.get_mut(session_id) {
            None => return Ok(None),
            Some(mut entry) if !entry.is_expired(now, self.ttl) => {
                entry.touch(now);
                return Ok(Some(entry.clone()));
            }
            Some(_) => {}
        }

        // Re-check under the removal lock; a writer may have revived it
        self.sessions
            .remove_if(session_id, |_, s| s.is_expired(now, self.ttl));
        Ok(None)
    }

    fn restore_all(&self) -> Result<SessionIter, PersistenceError> {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let sessions = Arc::clone(&self.sessions);
        let clock = Arc::clone(&self.clock);
        let ttl = self.ttl;

        Ok(Box::new(ids.into_iter().filter_map(move |id| {
            let entry = sessions.get(&id)?;
            if entry.is_expired(clock.now(), ttl) {
                None
            } else {
                Some(entry.clone())
            }
        })))
    }

    fn swap_provider(
        &self,
        session_id: &str,
        provider: &str,
    ) -> Result<Option<String>, PersistenceError> {
        let now = self.clock.now();
        match self.sessions.get_mut(session_id) {
            Some(mut entry) if !entry.is_expired(now, self.ttl) => {
                entry.touch(now);
                Ok(entry.last_provider.replace(provider.to_string()))
            }
            _ => Ok(None),
        }
    }

    fn purge_expired(&self) -> Result<usize, PersistenceError> {
        let now = self.clock.now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired(now, self.ttl));
        Ok(before.saturating_sub(self.sessions.len()))
    }

    fn is_durable(&self) -> bool {
        false
    }
}

impl AuditLog for InMemorySessionStore {
    fn append_transition(&self, record: TransitionRecord) -> Result<(), PersistenceError> {
        self.transitions
            .entry(record.session_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    fn transitions(&self, session_id: &str) -> Result<Vec<TransitionRecord>, PersistenceError> {
        Ok(self
            .transitions
            .get(session_id)
            .map(|t| t.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ManualClock;

    const DAY: Duration = Duration::from_secs(86_400);

    fn store() -> (InMemorySessionStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (InMemorySessionStore::with_clock(DAY, clock.clone()), clock)
    }

    #[test]
    fn test_append_creates_and_extends() {
        let (store, _) = store();
        let session = store.append("s1", Message::user("one")).unwrap();
        assert_eq!(session.message_count(), 1);

        let session = store.append("s1", Message::assistant("two")).unwrap();
        assert_eq!(session.message_count(), 2);
        assert_eq!(session.messages[1].content, "two");
    }

    #[test]
    fn test_two_n_history_in_call_order() {
        let (store, _) = store();
        let n = 25;
        for i in 0..n {
            store.append("s1", Message::user(&format!("q{}", i))).unwrap();
            store.append("s1", Message::assistant(&format!("a{}", i))).unwrap();
        }

        let session = store.get("s1").unwrap().unwrap();
        assert_eq!(session.message_count(), 2 * n);
        for (i, pair) in session.messages.chunks(2).enumerate() {
            assert_eq!(pair[0].content, format!("q{}", i));
            assert_eq!(pair[1].content, format!("a{}", i));
        }
    }

    #[test]
    fn test_expired_session_is_absent_and_treated_as_new() {
        let (store, clock) = store();
        store.append("s1", Message::user("old")).unwrap();

        clock.advance(DAY);
        assert!(store.restore_all().unwrap().next().is_none());
        assert!(store.get("s1").unwrap().is_none());

        let session = store.append("s1", Message::user("new")).unwrap();
        assert_eq!(session.messages, vec![Message::user("new")]);
        assert_eq!(session.last_provider, None);
    }

    #[test]
    fn test_reads_refresh_ttl() {
        let (store, clock) = store();
        store.append("s1", Message::user("hi")).unwrap();

        clock.advance(Duration::from_secs(80_000));
        assert!(store.get("s1").unwrap().is_some());
        clock.advance(Duration::from_secs(80_000));
        assert!(store.get("s1").unwrap().is_some());
    }

    #[test]
    fn test_restore_all_is_idempotent_and_does_not_touch() {
        let (store, clock) = store();
        store.append("a", Message::user("1")).unwrap();
        store.append("b", Message::user("2")).unwrap();

        let mut first: Vec<Session> = store.restore_all().unwrap().collect();
        let mut second: Vec<Session> = store.restore_all().unwrap().collect();
        first.sort_by(|x, y| x.id.cmp(&y.id));
        second.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);

        // restoring must not have extended the lifetime
        clock.advance(DAY);
        assert_eq!(store.restore_all().unwrap().count(), 0);
    }

    #[test]
    fn test_swap_provider() {
        let (store, _) = store();
        assert_eq!(store.swap_provider("missing", "primary").unwrap(), None);

        store.append("s1", Message::user("hi")).unwrap();
        assert_eq!(store.swap_provider("s1", "primary").unwrap(), None);
        assert_eq!(
            store.swap_provider("s1", "openai").unwrap().as_deref(),
            Some("primary")
        );
        assert_eq!(
            store.get("s1").unwrap().unwrap().last_provider.as_deref(),
            Some("openai")
        );
    }

    #[test]
    fn test_purge_expired() {
        let (store, clock) = store();
        store.append("old", Message::user("x")).unwrap();
        clock.advance(Duration::from_secs(50_000));
        store.append("fresh", Message::user("y")).unwrap();
        clock.advance(Duration::from_secs(40_000));

        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("fresh").unwrap().is_some());
    }

    #[test]
    fn test_concurrent_appends_to_one_session() {
        let (store, _) = store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store
                            .append("shared", Message::user(&format!("{}-{}", t, i)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.get("shared").unwrap().unwrap().message_count(), 400);
    }

    fn seed() -> Vec<Message> {
        vec![
            Message::user("earlier question"),
            Message::assistant("earlier answer"),
            Message::user("hello"),
        ]
    }

    #[test]
    fn test_append_turn_seeds_new_then_appends_last() {
        let (store, _) = store();
        let session = store.append_turn("s1", &seed(), Message::user("hello")).unwrap();
        assert_eq!(session.messages, seed());

        store.append("s1", Message::assistant("hi")).unwrap();
        let session = store
            .append_turn("s1", &seed(), Message::user("next"))
            .unwrap();
        assert_eq!(session.message_count(), 5);
        assert_eq!(session.last_message().unwrap().content, "next");
    }

    #[test]
    fn test_append_turn_reseeds_expired_session() {
        let (store, clock) = store();
        store.append("s1", Message::user("stale")).unwrap();
        clock.advance(DAY);

        let session = store.append_turn("s1", &seed(), Message::user("hello")).unwrap();
        assert_eq!(session.messages, seed());
    }

    #[test]
    fn test_concurrent_first_turns_seed_once() {
        let (store, _) = store();
        let store = Arc::new(store);
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store
                        .append_turn("fresh", &seed(), Message::user("hello"))
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // one seeding turn, then seven single-message turns
        let session = store.get("fresh").unwrap().unwrap();
        assert_eq!(session.message_count(), 3 + 7);
        assert_eq!(session.messages[..3], seed()[..]);
        assert!(session.messages[3..].iter().all(|m| m.content == "hello"));
    }

    #[test]
    fn test_audit_trail_is_ordered() {
        let (store, _) = store();
        for (from, to) in [("primary", "openai"), ("openai", "primary")] {
            store
                .append_transition(TransitionRecord {
                    session_id: "s1".into(),
                    from_provider: from.into(),
                    to_provider: to.into(),
                    timestamp: Utc::now(),
                    message_count: 1,
                })
                .unwrap();
        }

        let trail = store.transitions("s1").unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].to_provider, "openai");
        assert_eq!(trail[1].to_provider, "primary");
        assert!(store.transitions("other").unwrap().is_empty());
    }
}
