use chrono::Utc;
use common::PersistenceError;
use memory::{AuditLog, TransitionRecord};
use std::sync::Arc;
use tracing::{error, info};

/// Best-effort recorder of per-session provider switches. Never fails the
/// caller: storage errors are logged and dropped.
#[derive(Clone)]
pub struct TransitionAuditor {
    log: Arc<dyn AuditLog>,
}

impl TransitionAuditor {
    pub fn new(log: Arc<dyn AuditLog>) -> Self {
        Self { log }
    }

    pub fn record(
        &self,
        session_id: &str,
        from_provider: &str,
        to_provider: &str,
        message_count: usize,
    ) {
        let record = TransitionRecord {
            session_id: session_id.to_string(),
            from_provider: from_provider.to_string(),
            to_provider: to_provider.to_string(),
            timestamp: Utc::now(),
            message_count,
        };

        match self.log.append_transition(record) {
            Ok(()) => info!(
                session_id = %session_id,
                from = %from_provider,
                to = %to_provider,
                message_count,
                "Provider transition recorded"
            ),
            Err(e) => error!(
                session_id = %session_id,
                from = %from_provider,
                to = %to_provider,
                "Failed to record provider transition: {}",
                e
            ),
        }
    }

    pub fn trail(&self, session_id: &str) -> Result<Vec<TransitionRecord>, PersistenceError> {
        self.log.transitions(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory::InMemorySessionStore;
    use std::time::Duration;

    struct BrokenLog;

    impl AuditLog for BrokenLog {
        fn append_transition(&self, _record: TransitionRecord) -> Result<(), PersistenceError> {
            Err(PersistenceError::new("append_transition", "disk full"))
        }

        fn transitions(
            &self,
            _session_id: &str,
        ) -> Result<Vec<TransitionRecord>, PersistenceError> {
            Err(PersistenceError::new("transitions", "disk full"))
        }
    }

    #[test]
    fn test_record_appends_to_trail() {
        let store = Arc::new(InMemorySessionStore::new(Duration::from_secs(60)));
        let auditor = TransitionAuditor::new(store);

        auditor.record("s1", "primary", "openai", 3);
        let trail = auditor.trail("s1").unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].from_provider, "primary");
        assert_eq!(trail[0].message_count, 3);
    }

    #[test]
    fn test_storage_failure_is_swallowed() {
        let auditor = TransitionAuditor::new(Arc::new(BrokenLog));
        auditor.record("s1", "primary", "openai", 1);
        assert!(auditor.trail("s1").is_err());
    }
}
