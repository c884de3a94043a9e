use anyhow::{Context, Result};
use common::GatewayConfig;
use llm::{HealthProbe, HttpHealthProbe, ProviderFactory, RetryPolicy};
use memory::{AuditLog, InMemorySessionStore, SessionStore, SledSessionStore};
use router::{FailoverController, RequestRouter, RouterComponents, TransitionAuditor};
use std::sync::Arc;
use tracing::{info, warn};

/// The wired gateway, ready to be served.
pub struct Gateway {
    pub router: Arc<RequestRouter>,
    pub sessions: Arc<dyn SessionStore>,
}

/// Resolve every component from configuration once, at startup.
pub fn build_gateway(config: &GatewayConfig) -> Result<Gateway> {
    let registry = ProviderFactory::build_registry(config).context("building provider registry")?;

    // Alternates without a usable adapter never enter the rotation
    let alternates: Vec<String> = config
        .alternates
        .iter()
        .filter(|id| {
            let known = registry.contains(id);
            if !known {
                warn!("Alternate {} is not available and is left out of the rotation", id);
            }
            known
        })
        .cloned()
        .collect();

    let (sessions, audit) = open_session_store(config)?;

    let probe: Arc<dyn HealthProbe> = Arc::new(
        HttpHealthProbe::new(&config.primary.health_url(), config.timeouts.health_check())
            .context("building health probe client")?,
    );

    let controller = Arc::new(FailoverController::new(
        llm::PRIMARY_PROVIDER_ID,
        config.fallback_mode,
        alternates,
    ));

    info!(
        mode = %config.fallback_mode,
        providers = ?registry.ids(),
        alternates = ?controller.alternates(),
        durable = sessions.is_durable(),
        "Gateway assembled"
    );

    let router = RequestRouter::new(RouterComponents {
        controller,
        probe,
        registry,
        sessions: Arc::clone(&sessions),
        auditor: TransitionAuditor::new(audit),
        retry: RetryPolicy::from_settings(&config.retry),
        provider_timeout: config.timeouts.provider_call(),
    });

    Ok(Gateway {
        router: Arc::new(router),
        sessions,
    })
}

fn open_session_store(
    config: &GatewayConfig,
) -> Result<(Arc<dyn SessionStore>, Arc<dyn AuditLog>)> {
    let ttl = config.session_ttl();
    match &config.session.store_path {
        Some(path) => {
            let store = Arc::new(
                SledSessionStore::open(path, ttl)
                    .with_context(|| format!("opening session store at {}", path))?,
            );
            info!("Sessions persisted at {}", path);
            Ok((store.clone(), store))
        }
        None => {
            info!("Sessions kept in memory");
            let store = Arc::new(InMemorySessionStore::new(ttl));
            Ok((store.clone(), store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ProviderKind, ProviderSettings};

    #[test]
    fn test_unavailable_alternates_are_left_out() {
        let mut config = GatewayConfig::default();
        config.alternates = vec!["ollama".into(), "openai".into()];
        config.providers.insert(
            "ollama".into(),
            ProviderSettings {
                kind: ProviderKind::Ollama,
                base_url: "http://localhost:11434".into(),
                api_key: None,
                model: None,
            },
        );
        config.providers.insert(
            "openai".into(),
            ProviderSettings {
                kind: ProviderKind::OpenAI,
                base_url: "https://api.openai.com/v1".into(),
                api_key: None,
                model: None,
            },
        );

        let gateway = build_gateway(&config).unwrap();
        assert_eq!(gateway.router.controller().alternates(), vec!["ollama"]);
        assert!(!gateway.sessions.is_durable());
    }

    #[test]
    fn test_store_path_selects_durable_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.alternates.clear();
        config.session.store_path = Some(dir.path().join("sessions").display().to_string());

        let gateway = build_gateway(&config).unwrap();
        assert!(gateway.sessions.is_durable());
    }
}
