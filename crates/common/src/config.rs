//! Gateway configuration.
//!
//! Layers, later ones win: built-in defaults, an optional TOML file, then the
//! process environment (a `.env` file is loaded first when present).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for a single primary liveness check.
pub const MAX_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl fmt::Display) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Operator-selected policy governing whether health drives provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    #[default]
    Auto,
    Forced,
    Disabled,
}

impl FallbackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackMode::Auto => "auto",
            FallbackMode::Forced => "forced",
            FallbackMode::Disabled => "disabled",
        }
    }
}

impl fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FallbackMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(FallbackMode::Auto),
            "forced" => Ok(FallbackMode::Forced),
            "disabled" => Ok(FallbackMode::Disabled),
            other => Err(ConfigError::invalid(
                "fallback_mode",
                format!("'{}' is not one of auto|forced|disabled", other),
            )),
        }
    }
}

/// Wire dialect spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
    Ollama,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::OpenAI),
            "ollama" | "local" => Ok(ProviderKind::Ollama),
            other => Err(ConfigError::invalid(
                "providers.kind",
                format!("unknown provider kind '{}'", other),
            )),
        }
    }
}

/// Settings for one backend. Credentials are opaque and never printed.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .finish()
    }
}

/// The primary service: an Anthropic-compatible endpoint with a liveness route.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimarySettings {
    pub endpoint: String,
    pub health_path: String,
    pub model: String,
    pub api_key: Option<String>,
}

impl Default for PrimarySettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000".to_string(),
            health_path: "/health".to_string(),
            model: "claude-3-sonnet-20240229".to_string(),
            api_key: None,
        }
    }
}

impl PrimarySettings {
    pub fn health_url(&self) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.health_path.trim_start_matches('/')
        )
    }
}

impl fmt::Debug for PrimarySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimarySettings")
            .field("endpoint", &self.endpoint)
            .field("health_path", &self.health_path)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub ttl_seconds: u64,
    /// Enables the durable sled store when set.
    pub store_path: Option<String>,
    pub purge_interval_seconds: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 86_400,
            store_path: None,
            purge_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub multiplier: f64,
    pub min_delay_seconds: f64,
    pub max_delay_seconds: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            multiplier: 1.0,
            min_delay_seconds: 2.0,
            max_delay_seconds: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub health_check_seconds: u64,
    pub provider_call_seconds: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            health_check_seconds: 5,
            provider_call_seconds: 30,
        }
    }
}

impl TimeoutSettings {
    pub fn health_check(&self) -> Duration {
        Duration::from_secs(self.health_check_seconds).min(MAX_HEALTH_CHECK_TIMEOUT)
    }

    pub fn provider_call(&self) -> Duration {
        Duration::from_secs(self.provider_call_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub primary: PrimarySettings,
    pub fallback_mode: FallbackMode,
    /// Ordered alternate provider ids.
    pub alternates: Vec<String>,
    pub providers: BTreeMap<String, ProviderSettings>,
    pub session: SessionSettings,
    pub retry: RetrySettings,
    pub timeouts: TimeoutSettings,
    pub logging: LoggingSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            "anthropic".to_string(),
            ProviderSettings {
                kind: ProviderKind::Anthropic,
                base_url: "https://api.anthropic.com".to_string(),
                api_key: None,
                model: None,
            },
        );
        providers.insert(
            "openai".to_string(),
            ProviderSettings {
                kind: ProviderKind::OpenAI,
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: None,
                model: None,
            },
        );
        providers.insert(
            "ollama".to_string(),
            ProviderSettings {
                kind: ProviderKind::Ollama,
                base_url: "http://localhost:11434".to_string(),
                api_key: None,
                model: None,
            },
        );

        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            primary: PrimarySettings::default(),
            fallback_mode: FallbackMode::Auto,
            alternates: vec!["anthropic".to_string(), "openai".to_string()],
            providers,
            session: SessionSettings::default(),
            retry: RetrySettings::default(),
            timeouts: TimeoutSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Defaults, then `path` (if any), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&raw).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })
    }

    /// Override fields from environment-style variables resolved by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("GATEWAY_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(endpoint) = lookup("PRIMARY_ENDPOINT") {
            self.primary.endpoint = endpoint;
        }
        if let Some(path) = lookup("PRIMARY_HEALTH_PATH") {
            self.primary.health_path = path;
        }
        if let Some(model) = lookup("PRIMARY_MODEL") {
            self.primary.model = model;
        }
        if let Some(key) = lookup("PRIMARY_API_KEY") {
            self.primary.api_key = Some(key);
        }
        if let Some(mode) = lookup("FALLBACK_MODE") {
            self.fallback_mode = mode.parse()?;
        }
        if let Some(list) = lookup("FALLBACK_PROVIDERS") {
            self.alternates = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(key) = lookup("ANTHROPIC_API_KEY") {
            self.set_provider_key("anthropic", key);
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.set_provider_key("openai", key);
        }
        if let Some(url) = lookup("OLLAMA_URL") {
            if let Some(p) = self.providers.get_mut("ollama") {
                p.base_url = url;
            }
        }
        for (id, settings) in self.providers.iter_mut() {
            let prefix = id.to_ascii_uppercase().replace('-', "_");
            if let Some(model) = lookup(&format!("{}_MODEL", prefix)) {
                settings.model = Some(model);
            }
            if let Some(url) = lookup(&format!("{}_BASE_URL", prefix)) {
                settings.base_url = url;
            }
        }

        if let Some(v) = lookup("SESSION_TTL_SECONDS") {
            self.session.ttl_seconds = parse_num("SESSION_TTL_SECONDS", &v)?;
        }
        if let Some(v) = lookup("SESSION_STORE_PATH") {
            self.session.store_path = Some(v).filter(|p| !p.is_empty());
        }
        if let Some(v) = lookup("SESSION_PURGE_INTERVAL_SECONDS") {
            self.session.purge_interval_seconds = parse_num("SESSION_PURGE_INTERVAL_SECONDS", &v)?;
        }
        if let Some(v) = lookup("RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_num("RETRY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("RETRY_MULTIPLIER") {
            self.retry.multiplier = parse_num("RETRY_MULTIPLIER", &v)?;
        }
        if let Some(v) = lookup("RETRY_MIN_DELAY_SECONDS") {
            self.retry.min_delay_seconds = parse_num("RETRY_MIN_DELAY_SECONDS", &v)?;
        }
        if let Some(v) = lookup("RETRY_MAX_DELAY_SECONDS") {
            self.retry.max_delay_seconds = parse_num("RETRY_MAX_DELAY_SECONDS", &v)?;
        }
        if let Some(v) = lookup("HEALTH_CHECK_TIMEOUT_SECONDS") {
            self.timeouts.health_check_seconds = parse_num("HEALTH_CHECK_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = lookup("PROVIDER_TIMEOUT_SECONDS") {
            self.timeouts.provider_call_seconds = parse_num("PROVIDER_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = lookup("LOG_FORMAT") {
            self.logging.json = v.eq_ignore_ascii_case("json");
        }

        Ok(())
    }

    fn set_provider_key(&mut self, id: &str, key: String) {
        if let Some(p) = self.providers.get_mut(id) {
            p.api_key = Some(key).filter(|k| !k.is_empty());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.primary.endpoint.trim().is_empty() {
            return Err(ConfigError::invalid("primary.endpoint", "must not be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.multiplier <= 0.0 {
            return Err(ConfigError::invalid("retry.multiplier", "must be positive"));
        }
        if self.retry.min_delay_seconds < 0.0
            || self.retry.min_delay_seconds > self.retry.max_delay_seconds
        {
            return Err(ConfigError::invalid(
                "retry.min_delay_seconds",
                format!(
                    "bounds [{}, {}] are inverted or negative",
                    self.retry.min_delay_seconds, self.retry.max_delay_seconds
                ),
            ));
        }
        if self.session.ttl_seconds == 0 {
            return Err(ConfigError::invalid("session.ttl_seconds", "must be positive"));
        }
        if self.timeouts.provider_call_seconds == 0 {
            return Err(ConfigError::invalid(
                "timeouts.provider_call_seconds",
                "must be positive",
            ));
        }
        for id in &self.alternates {
            if id == "primary" {
                return Err(ConfigError::invalid(
                    "alternates",
                    "'primary' is reserved for the primary service",
                ));
            }
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.ttl_seconds)
    }
}

fn parse_num<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.fallback_mode, FallbackMode::Auto);
        assert_eq!(config.session.ttl_seconds, 86_400);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.min_delay_seconds, 2.0);
        assert_eq!(config.retry.max_delay_seconds, 10.0);
        assert_eq!(config.alternates, vec!["anthropic", "openai"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GatewayConfig::default();
        config
            .apply_env(env(&[
                ("FALLBACK_MODE", "forced"),
                ("FALLBACK_PROVIDERS", "openai, ollama"),
                ("OPENAI_API_KEY", "sk-test"),
                ("OPENAI_MODEL", "gpt-4o"),
                ("SESSION_TTL_SECONDS", "60"),
                ("RETRY_MAX_ATTEMPTS", "5"),
                ("LOG_FORMAT", "json"),
            ]))
            .unwrap();

        assert_eq!(config.fallback_mode, FallbackMode::Forced);
        assert_eq!(config.alternates, vec!["openai", "ollama"]);
        let openai = &config.providers["openai"];
        assert_eq!(openai.api_key.as_deref(), Some("sk-test"));
        assert_eq!(openai.model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.session.ttl_seconds, 60);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.logging.json);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let mut config = GatewayConfig::default();
        let err = config
            .apply_env(env(&[("FALLBACK_MODE", "sometimes")]))
            .unwrap_err();
        assert!(err.to_string().contains("fallback_mode"));
    }

    #[test]
    fn test_toml_file_layer() {
        let raw = r#"
            fallback_mode = "disabled"
            alternates = ["ollama"]

            [primary]
            endpoint = "http://desktop:9000"

            [retry]
            max_attempts = 2
        "#;
        let config = GatewayConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.fallback_mode, FallbackMode::Disabled);
        assert_eq!(config.primary.endpoint, "http://desktop:9000");
        assert_eq!(config.primary.health_path, "/health");
        assert_eq!(config.primary.health_url(), "http://desktop:9000/health");
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.max_delay_seconds, 10.0);
        // untouched sections keep their defaults
        assert_eq!(config.session.ttl_seconds, 86_400);
    }

    #[test]
    fn test_toml_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "listen_addr = \"127.0.0.1:9999\"\n").unwrap();

        let config = GatewayConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9999");

        let missing = GatewayConfig::from_toml_file(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_validation() {
        let mut config = GatewayConfig::default();
        config.retry.min_delay_seconds = 20.0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.alternates = vec!["primary".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_health_timeout_is_capped() {
        let timeouts = TimeoutSettings {
            health_check_seconds: 30,
            provider_call_seconds: 30,
        };
        assert_eq!(timeouts.health_check(), Duration::from_secs(5));
    }

    #[test]
    fn test_credentials_are_not_printed() {
        let mut config = GatewayConfig::default();
        config.set_provider_key("openai", "sk-very-secret".to_string());
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-very-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
