use crate::store::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Periodically purge expired sessions until `shutdown` fires.
pub fn spawn_janitor(
    store: Arc<dyn SessionStore>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(every);
        // first tick completes immediately
        interval_timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Session janitor stopping");
                    break;
                }
                _ = interval_timer.tick() => {
                    match store.purge_expired() {
                        Ok(0) => debug!("Session janitor: nothing to purge"),
                        Ok(n) => info!("Session janitor purged {} expired sessions", n),
                        Err(e) => error!("Session janitor failed: {}", e),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ManualClock;
    use crate::store::InMemorySessionStore;
    use chrono::Utc;
    use llm::Message;

    #[tokio::test(start_paused = true)]
    async fn test_janitor_purges_and_stops() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemorySessionStore::with_clock(
            Duration::from_secs(60),
            clock.clone(),
        ));
        store.append("s1", Message::user("hi")).unwrap();
        clock.advance(Duration::from_secs(61));

        let shutdown = CancellationToken::new();
        let handle = spawn_janitor(store.clone(), Duration::from_secs(10), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(store.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
