use chrono::{DateTime, Duration as ChronoDuration, Utc};
use llm::{Message, MessageRole};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A caller-identified conversation with its accumulated history.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    /// Append-only during the session's life
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub last_touched: DateTime<Utc>,
    /// Provider that served the most recent turn, `None` before the first one.
    pub last_provider: Option<String>,
}

impl Session {
    pub fn new(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            messages: Vec::new(),
            created_at: now,
            last_touched: now,
            last_provider: None,
        }
    }

    /// Untouched for at least `ttl`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match now.signed_duration_since(self.last_touched).to_std() {
            Ok(elapsed) => elapsed >= ttl,
            // touched in the future of `now`
            Err(_) => false,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_touched = now;
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Audit entry marking a session's provider switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub session_id: String,
    pub from_provider: String,
    pub to_provider: String,
    pub timestamp: DateTime<Utc>,
    pub message_count: usize,
}

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Fixed-layout mirror of `Session` for binary encodings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredSession {
    pub id: String,
    pub messages: Vec<StoredMessage>,
    pub created_at: DateTime<Utc>,
    pub last_touched: DateTime<Utc>,
    pub last_provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<&Session> for StoredSession {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            messages: session
                .messages
                .iter()
                .map(|m| StoredMessage {
                    role: m.role,
                    content: m.content.clone(),
                    timestamp: m.timestamp,
                })
                .collect(),
            created_at: session.created_at,
            last_touched: session.last_touched,
            last_provider: session.last_provider.clone(),
        }
    }
}

impl From<StoredSession> for Session {
    fn from(stored: StoredSession) -> Self {
        Self {
            id: stored.id,
            messages: stored
                .messages
                .into_iter()
                .map(|m| Message {
                    role: m.role,
                    content: m.content,
                    timestamp: m.timestamp,
                })
                .collect(),
            created_at: stored.created_at,
            last_touched: stored.last_touched,
            last_provider: stored.last_provider,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_boundary() {
        let clock = ManualClock::default();
        let session = Session::new("s1", clock.now());
        let ttl = Duration::from_secs(86_400);

        clock.advance(Duration::from_secs(86_399));
        assert!(!session.is_expired(clock.now(), ttl));

        clock.advance(Duration::from_secs(1));
        assert!(session.is_expired(clock.now(), ttl));
    }

    #[test]
    fn test_stored_session_conversion() {
        let now = Utc::now();
        let mut session = Session::new("s1", now);
        session.messages.push(Message::user("hi").stamped(now));
        session.messages.push(Message::assistant("hello"));
        session.last_provider = Some("primary".into());

        let stored = StoredSession::from(&session);
        assert_eq!(Session::from(stored), session);
    }
}
