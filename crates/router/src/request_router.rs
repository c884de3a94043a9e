use crate::audit::TransitionAuditor;
use crate::failover::{Decision, FailoverController};
use crate::stats::{RouterStatistics, StatisticsSnapshot};
use chrono::Utc;
use common::{FailoverError, FailoverResult, OperationTimer, ProviderError, RequestContext};
use llm::{
    execute_with_retry, HealthProbe, Message, MessageRole, PrimaryStatus, ProviderAdapter,
    ProviderRegistry, RequestEnvelope, ResponseEnvelope, RetryFailure, RetryPolicy,
};
use memory::{SessionStore, TransitionRecord};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// A served turn.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub session_id: String,
    pub provider: String,
    pub response: ResponseEnvelope,
}

/// Sessions resynchronised after a provider change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub provider: String,
    pub sessions: usize,
    pub messages: usize,
}

/// Everything the router needs, resolved once at startup.
pub struct RouterComponents {
    pub controller: Arc<FailoverController>,
    pub probe: Arc<dyn HealthProbe>,
    pub registry: ProviderRegistry,
    pub sessions: Arc<dyn SessionStore>,
    pub auditor: TransitionAuditor,
    pub retry: RetryPolicy,
    /// Upper bound for a single provider attempt
    pub provider_timeout: Duration,
}

/// Composes health, failover, persistence, retry and audit into the
/// per-turn protocol.
pub struct RequestRouter {
    controller: Arc<FailoverController>,
    probe: Arc<dyn HealthProbe>,
    registry: ProviderRegistry,
    sessions: Arc<dyn SessionStore>,
    auditor: TransitionAuditor,
    retry: RetryPolicy,
    provider_timeout: Duration,
    stats: Arc<RouterStatistics>,
}

/// Why one dispatch attempt on a provider failed.
enum DispatchFailure {
    Exhausted { attempts: u32, last_error: ProviderError },
    /// Not worth retrying on this provider, but another one may serve the turn.
    Rejected(ProviderError),
    Fatal(FailoverError),
}

impl DispatchFailure {
    fn into_error(self, provider: &str) -> FailoverError {
        match self {
            DispatchFailure::Exhausted {
                attempts,
                last_error,
            } => FailoverError::ExhaustedRetries {
                provider: provider.to_string(),
                attempts,
                last_error,
            },
            DispatchFailure::Rejected(e) => e.into(),
            DispatchFailure::Fatal(e) => e,
        }
    }
}

impl RequestRouter {
    pub fn new(components: RouterComponents) -> Self {
        Self {
            controller: components.controller,
            probe: components.probe,
            registry: components.registry,
            sessions: components.sessions,
            auditor: components.auditor,
            retry: components.retry,
            provider_timeout: components.provider_timeout,
            stats: Arc::new(RouterStatistics::new()),
        }
    }

    pub fn controller(&self) -> &FailoverController {
        &self.controller
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Result of the most recent health check, `None` until one completed.
    pub fn primary_status(&self) -> Option<PrimaryStatus> {
        self.probe.last_status()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot(
            self.controller.total_fallbacks(),
            self.probe.checks_performed(),
            self.probe.failures_observed(),
        )
    }

    pub fn transitions(&self, session_id: &str) -> FailoverResult<Vec<TransitionRecord>> {
        Ok(self.auditor.trail(session_id)?)
    }

    /// Serve one turn.
    #[instrument(skip(self, request, cancel), fields(request_id = tracing::field::Empty))]
    pub async fn handle(
        &self,
        session_id: Option<String>,
        request: RequestEnvelope,
        cancel: CancellationToken,
    ) -> FailoverResult<RoutedResponse> {
        validate(&request)?;

        let session_id = resolve_session_id(session_id)?;
        let context = RequestContext::new().with_session(session_id.clone());
        tracing::Span::current().record("request_id", context.request_id.as_str());

        let health = if self.controller.needs_probe() {
            Some(self.probe.check().await)
        } else {
            None
        };
        let decision = self.controller.evaluate(health)?;
        self.after_decision(&decision);

        // The user turn is persisted before dispatch and never rolled back
        let history = self.persist_user_turn(&session_id, &request)?;

        let first = self
            .dispatch(&session_id, &decision.provider, &request, history.clone(), &cancel)
            .await;

        let on_primary = decision.provider == self.controller.primary_id();
        let can_fail_over = on_primary && self.controller.needs_probe();

        let last_error = match first {
            Ok(response) => return Ok(self.finish(&context, response)),
            Err(DispatchFailure::Fatal(e)) => return Err(e),
            Err(failure) if !can_fail_over => return Err(failure.into_error(&decision.provider)),
            Err(DispatchFailure::Exhausted {
                attempts,
                last_error,
            }) => {
                warn!(
                    "Primary exhausted {} attempts, failing over: {}",
                    attempts, last_error
                );
                last_error
            }
            Err(DispatchFailure::Rejected(last_error)) => {
                warn!("Primary rejected the call, failing over: {}", last_error);
                last_error
            }
        };

        // The primary cannot serve this turn: treat it as down and try one alternate
        let fallback = self.controller.evaluate(Some(PrimaryStatus::Down))?;
        self.after_decision(&fallback);

        if fallback.provider == self.controller.primary_id() {
            return Err(FailoverError::NoProviderAvailable {
                reason: "primary failed and no alternate provider is configured".to_string(),
                last_error: Some(last_error),
            });
        }

        match self
            .dispatch(&session_id, &fallback.provider, &request, history, &cancel)
            .await
        {
            Ok(response) => Ok(self.finish(&context, response)),
            Err(failure) => Err(failure.into_error(&fallback.provider)),
        }
    }

    /// Make the primary active again (auto/disabled modes).
    pub fn restore_primary(&self) -> FailoverResult<Decision> {
        let decision = self.controller.restore_primary()?;
        self.after_decision(&decision);
        Ok(decision)
    }

    /// Advance the alternate rotation.
    pub fn rotate_alternate(&self) -> FailoverResult<Decision> {
        let decision = self
            .controller
            .rotate()
            .ok_or_else(|| FailoverError::no_provider("no alternates configured"))?;
        self.after_decision(&decision);
        Ok(decision)
    }

    /// Resynchronise every live session into `provider`'s adapter in the
    /// background.
    pub fn restore_context(&self, provider: &str) -> JoinHandle<RestoreReport> {
        let adapter = self.registry.get(provider);
        let sessions = Arc::clone(&self.sessions);
        let provider = provider.to_string();

        tokio::task::spawn_blocking(move || {
            let mut report = RestoreReport {
                provider: provider.clone(),
                ..Default::default()
            };
            let Some(adapter) = adapter else {
                warn!("No adapter registered for {}, skipping context restore", provider);
                return report;
            };

            match sessions.restore_all() {
                Ok(iter) => {
                    for session in iter {
                        adapter.restore_context(&session.id, &session.messages);
                        report.sessions += 1;
                        report.messages += session.messages.len();
                    }
                    info!(
                        provider = %report.provider,
                        sessions = report.sessions,
                        messages = report.messages,
                        "Context restored"
                    );
                }
                Err(e) => error!("Context restore for {} failed: {}", provider, e),
            }
            report
        })
    }

    fn after_decision(&self, decision: &Decision) {
        if let Some(transition) = &decision.transition {
            // detached; the report is only logged
            let _ = self.restore_context(&transition.to);
        }
    }

    /// New sessions are seeded with every message of the envelope; existing
    /// ones receive the envelope's final user message.
    fn persist_user_turn(
        &self,
        session_id: &str,
        request: &RequestEnvelope,
    ) -> FailoverResult<Vec<Message>> {
        let now = Utc::now();
        let stamp = |m: &Message| match m.timestamp {
            Some(_) => m.clone(),
            None => m.clone().stamped(now),
        };

        let seed: Vec<Message> = request.messages.iter().map(stamp).collect();
        let last = seed.last().cloned().ok_or_else(|| {
            FailoverError::InvalidRequest("messages must not be empty".to_string())
        })?;

        let session = self.sessions.append_turn(session_id, &seed, last)?;
        Ok(session.messages)
    }

    /// Steps 4 to 6 of a turn on one provider.
    async fn dispatch(
        &self,
        session_id: &str,
        provider: &str,
        request: &RequestEnvelope,
        history: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<(String, ResponseEnvelope), DispatchFailure> {
        let adapter = self.registry.get(provider).ok_or_else(|| {
            DispatchFailure::Fatal(FailoverError::NoProviderAvailable {
                reason: format!("provider '{}' is not configured", provider),
                last_error: Some(ProviderError::not_configured(provider)),
            })
        })?;

        self.audit_switch(session_id, provider, history.len());

        let _in_flight =
            (provider != self.controller.primary_id()).then(|| self.stats.fallback_in_flight());

        let outgoing = request.with_history(history);
        let mut timer = OperationTimer::new("provider_call");
        timer.add_field("provider", provider);
        timer.add_field("session_id", session_id);

        let result = self.call_with_retry(adapter.as_ref(), &outgoing, cancel).await;
        timer.finish_with_result(&result);

        match result {
            Ok(response) => {
                let reply = Message::assistant(&response.content).stamped(Utc::now());
                if let Err(e) = self.sessions.append(session_id, reply) {
                    error!("Failed to persist reply for session {}: {}", session_id, e);
                }
                Ok((provider.to_string(), response))
            }
            Err(RetryFailure::Exhausted {
                attempts,
                last_error,
            }) => Err(DispatchFailure::Exhausted {
                attempts,
                last_error,
            }),
            Err(RetryFailure::NonRetryable(e)) if e.warrants_failover() => {
                Err(DispatchFailure::Rejected(e))
            }
            Err(RetryFailure::NonRetryable(e)) => Err(DispatchFailure::Fatal(e.into())),
            Err(RetryFailure::Cancelled) => Err(DispatchFailure::Fatal(FailoverError::Cancelled)),
        }
    }

    async fn call_with_retry(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &RequestEnvelope,
        cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope, RetryFailure<ProviderError>> {
        let limit = self.provider_timeout;

        execute_with_retry(&self.retry, cancel, move |attempt| async move {
            debug!("Calling {} (attempt {})", adapter.id(), attempt);
            match tokio::time::timeout(limit, adapter.complete(request)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(adapter.id(), limit)),
            }
        })
        .await
    }

    /// Record a switch when this session was last served by someone else.
    /// A session that was never served counts as having been on the primary.
    fn audit_switch(&self, session_id: &str, provider: &str, message_count: usize) {
        let previous = match self.sessions.swap_provider(session_id, provider) {
            Ok(previous) => previous,
            Err(e) => {
                error!("Failed to track provider for session {}: {}", session_id, e);
                return;
            }
        };

        let previous = previous.unwrap_or_else(|| self.controller.primary_id().to_string());
        if previous != provider {
            self.auditor
                .record(session_id, &previous, provider, message_count);
        }
    }

    fn finish(
        &self,
        context: &RequestContext,
        (provider, response): (String, ResponseEnvelope),
    ) -> RoutedResponse {
        let session_id = context.session_id.clone().unwrap_or_default();
        self.stats.record_latency(context.start_time.elapsed());

        let response = response
            .with_metadata("session_id", session_id.clone())
            .with_metadata("provider", provider.clone());

        RoutedResponse {
            session_id,
            provider,
            response,
        }
    }
}

/// Trimmed caller id, or a fresh one when absent or blank.
fn resolve_session_id(session_id: Option<String>) -> FailoverResult<String> {
    let session_id = session_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if session_id.contains('\0') {
        return Err(FailoverError::InvalidRequest(
            "session id must not contain NUL".to_string(),
        ));
    }
    Ok(session_id)
}

fn validate(request: &RequestEnvelope) -> FailoverResult<()> {
    if request.stream {
        return Err(FailoverError::InvalidRequest(
            "streaming responses are not supported".to_string(),
        ));
    }
    match request.messages.last() {
        None => Err(FailoverError::InvalidRequest(
            "messages must not be empty".to_string(),
        )),
        Some(last) if last.role != MessageRole::User => Err(FailoverError::InvalidRequest(
            "the final message must have role 'user'".to_string(),
        )),
        Some(last) if last.content.trim().is_empty() => Err(FailoverError::InvalidRequest(
            "the final message must not be empty".to_string(),
        )),
        Some(_) => Ok(()),
    }
}
