use crate::session::{Clock, Session, StoredSession, SystemClock, TransitionRecord};
use crate::store::{AuditLog, SessionIter, SessionStore};
use common::PersistenceError;
use llm::Message;
use sled::{Db, IVec, Tree};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SESSIONS_TREE: &str = "sessions";
const TRANSITIONS_TREE: &str = "transitions";

/// Durable store backed by sled. Sessions are bincode-encoded under their id;
/// transition records live under `<id length><session id><sequence>` so a
/// prefix scan yields exactly one session's trail in append order.
pub struct SledSessionStore {
    db: Db,
    sessions: Tree,
    transitions: Tree,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SledSessionStore {
    pub fn open(path: impl AsRef<Path>, ttl: Duration) -> Result<Self, PersistenceError> {
        Self::open_with_clock(path, ttl, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        path: impl AsRef<Path>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PersistenceError::new("open", e))?;
        }

        info!("Opening session store at: {:?}", path);
        let db = sled::open(path).map_err(|e| PersistenceError::new("open", e))?;
        let sessions = db
            .open_tree(SESSIONS_TREE)
            .map_err(|e| PersistenceError::new("open", e))?;
        let transitions = db
            .open_tree(TRANSITIONS_TREE)
            .map_err(|e| PersistenceError::new("open", e))?;

        Ok(Self {
            db,
            sessions,
            transitions,
            ttl,
            clock,
        })
    }

    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| PersistenceError::new("flush", e))
    }

    /// Compare-and-swap loop over one session. `modify` may run more than once
    /// when writers race; it sees `None` for a missing or expired session.
    /// Returning `None` from `modify` leaves the entry untouched.
    fn update<R>(
        &self,
        operation: &str,
        session_id: &str,
        mut modify: impl FnMut(Option<Session>) -> Option<(Session, R)>,
    ) -> Result<Option<(Session, R)>, PersistenceError> {
        let now = self.clock.now();
        loop {
            let current = self
                .sessions
                .get(session_id)
                .map_err(|e| PersistenceError::new(operation, e))?;

            let existing = match &current {
                Some(bytes) => Some(decode(operation, bytes)?),
                None => None,
            }
            .filter(|s| !s.is_expired(now, self.ttl));

            let Some((mut session, result)) = modify(existing) else {
                return Ok(None);
            };
            session.touch(now);

            let encoded = encode(operation, &session)?;
            match self
                .sessions
                .compare_and_swap(session_id, current, Some(encoded))
                .map_err(|e| PersistenceError::new(operation, e))?
            {
                Ok(()) => return Ok(Some((session, result))),
                Err(_) => debug!("Concurrent write to session {}, retrying", session_id),
            }
        }
    }
}

fn encode(operation: &str, session: &Session) -> Result<Vec<u8>, PersistenceError> {
    bincode::serialize(&StoredSession::from(session))
        .map_err(|e| PersistenceError::new(operation, e))
}

fn decode(operation: &str, bytes: &IVec) -> Result<Session, PersistenceError> {
    bincode::deserialize::<StoredSession>(bytes)
        .map(Session::from)
        .map_err(|e| PersistenceError::new(operation, e))
}

// Length first, so no id is a prefix of another id's key range
fn transition_prefix(session_id: &str) -> Vec<u8> {
    let id = session_id.as_bytes();
    let mut prefix = Vec::with_capacity(8 + id.len());
    prefix.extend_from_slice(&(id.len() as u64).to_be_bytes());
    prefix.extend_from_slice(id);
    prefix
}

impl SessionStore for SledSessionStore {
    fn append_many(
        &self,
        session_id: &str,
        messages: &[Message],
    ) -> Result<Session, PersistenceError> {
        let now = self.clock.now();
        let updated = self.update("append", session_id, |existing| {
            let mut session = existing.unwrap_or_else(|| Session::new(session_id, now));
            session.messages.extend_from_slice(messages);
            Some((session, ()))
        })?;

        updated
            .map(|(session, _)| session)
            .ok_or_else(|| PersistenceError::new("append", "session update was skipped"))
    }

    fn append_turn(
        &self,
        session_id: &str,
        seed: &[Message],
        last: Message,
    ) -> Result<Session, PersistenceError> {
        let now = self.clock.now();
        let updated = self.update("append_turn", session_id, |existing| {
            let mut session = existing.unwrap_or_else(|| Session::new(session_id, now));
            if session.messages.is_empty() {
                session.messages.extend_from_slice(seed);
            } else {
                session.messages.push(last.clone());
            }
            Some((session, ()))
        })?;

        updated
            .map(|(session, _)| session)
            .ok_or_else(|| PersistenceError::new("append_turn", "session update was skipped"))
    }

    fn get(&self, session_id: &str) -> Result<Option<Session>, PersistenceError> {
        let touched = self.update("get", session_id, |existing| existing.map(|s| (s, ())))?;
        if touched.is_none() {
            // Lazy eviction of an expired entry
            let now = self.clock.now();
            if let Some(bytes) = self
                .sessions
                .get(session_id)
                .map_err(|e| PersistenceError::new("get", e))?
            {
                if decode("get", &bytes)?.is_expired(now, self.ttl) {
                    let _ = self
                        .sessions
                        .compare_and_swap(session_id, Some(bytes), None as Option<IVec>)
                        .map_err(|e| PersistenceError::new("get", e))?;
                }
            }
        }
        Ok(touched.map(|(s, _)| s))
    }

    fn restore_all(&self) -> Result<SessionIter, PersistenceError> {
        let clock = Arc::clone(&self.clock);
        let ttl = self.ttl;

        Ok(Box::new(self.sessions.iter().filter_map(move |item| {
            let (key, bytes) = match item {
                Ok(kv) => kv,
                Err(e) => {
                    warn!("Skipping unreadable session entry: {}", e);
                    return None;
                }
            };
            match decode("restore_all", &bytes) {
                Ok(session) if !session.is_expired(clock.now(), ttl) => Some(session),
                Ok(_) => None,
                Err(e) => {
                    warn!(
                        "Skipping undecodable session {}: {}",
                        String::from_utf8_lossy(&key),
                        e
                    );
                    None
                }
            }
        })))
    }

    fn swap_provider(
        &self,
        session_id: &str,
        provider: &str,
    ) -> Result<Option<String>, PersistenceError> {
        let swapped = self.update("swap_provider", session_id, |existing| {
            existing.map(|mut session| {
                let previous = session.last_provider.replace(provider.to_string());
                (session, previous)
            })
        })?;
        Ok(swapped.and_then(|(_, previous)| previous))
    }

    fn purge_expired(&self) -> Result<usize, PersistenceError> {
        let now = self.clock.now();
        let mut purged = 0;

        for item in self.sessions.iter() {
            let (key, bytes) = item.map_err(|e| PersistenceError::new("purge", e))?;
            let expired = match decode("purge", &bytes) {
                Ok(session) => session.is_expired(now, self.ttl),
                Err(e) => {
                    warn!("Removing undecodable session entry: {}", e);
                    true
                }
            };
            if expired {
                // Only remove if no writer revived it meanwhile
                let removed = self
                    .sessions
                    .compare_and_swap(&key, Some(bytes), None as Option<IVec>)
                    .map_err(|e| PersistenceError::new("purge", e))?;
                if removed.is_ok() {
                    purged += 1;
                }
            }
        }

        if purged > 0 {
            debug!("Purged {} expired sessions", purged);
        }
        Ok(purged)
    }

    fn is_durable(&self) -> bool {
        true
    }
}

impl AuditLog for SledSessionStore {
    fn append_transition(&self, record: TransitionRecord) -> Result<(), PersistenceError> {
        let sequence = self
            .db
            .generate_id()
            .map_err(|e| PersistenceError::new("append_transition", e))?;
        let mut key = transition_prefix(&record.session_id);
        key.extend_from_slice(&sequence.to_be_bytes());

        let bytes = bincode::serialize(&record)
            .map_err(|e| PersistenceError::new("append_transition", e))?;
        self.transitions
            .insert(key, bytes)
            .map_err(|e| PersistenceError::new("append_transition", e))?;
        Ok(())
    }

    fn transitions(&self, session_id: &str) -> Result<Vec<TransitionRecord>, PersistenceError> {
        self.transitions
            .scan_prefix(transition_prefix(session_id))
            .map(|item| {
                let (_, bytes) = item.map_err(|e| PersistenceError::new("transitions", e))?;
                bincode::deserialize(&bytes)
                    .map_err(|e| PersistenceError::new("transitions", e))
            })
            .collect()
    }
}
