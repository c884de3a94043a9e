use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{GatewayConfig, ProviderError, ProviderKind, ProviderSettings};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod anthropic_provider;
pub mod http;
pub mod ollama_provider;
pub mod openai_provider;

pub use anthropic_provider::AnthropicAdapter;
pub use ollama_provider::OllamaAdapter;
pub use openai_provider::OpenAIAdapter;

/// Identifier under which the primary service is registered.
pub const PRIMARY_PROVIDER_ID: &str = "primary";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// One conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn user(content: &str) -> Self {
        Self {
            role: MessageRole::User,
            content: content.to_string(),
            timestamp: None,
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.to_string(),
            timestamp: None,
        }
    }

    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }
}

/// Caller-supplied generation parameters; `None` means "adapter default".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

/// Canonical request for one turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestEnvelope {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(flatten)]
    pub params: GenerationParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub stream: bool,
}

impl RequestEnvelope {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            system: None,
            params: GenerationParams::default(),
            model: None,
            metadata: None,
            stream: false,
        }
    }

    pub fn with_system(mut self, system: &str) -> Self {
        self.system = Some(system.to_string());
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Same parameters, different conversation.
    pub fn with_history(&self, messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..self.clone()
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }
}

/// Normalized reason a generation stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    ContentFilter,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Canonical response for one turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    /// Provider-assigned identifier
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub role: MessageRole,
    /// Model actually used
    pub model: String,
    pub content: String,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ResponseEnvelope {
    pub fn new(
        id: String,
        model: String,
        content: String,
        stop_reason: StopReason,
        usage: TokenUsage,
    ) -> Self {
        Self {
            id,
            kind: "message".to_string(),
            role: MessageRole::Assistant,
            model,
            content,
            stop_reason,
            stop_sequence: None,
            usage,
            metadata: None,
        }
    }

    pub fn with_stop_sequence(mut self, stop_sequence: Option<String>) -> Self {
        self.stop_sequence = stop_sequence;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }
}

/// Generation parameters an adapter uses when the caller leaves them unset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationDefaults {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: Option<f32>,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
            top_p: None,
        }
    }
}

impl GenerationDefaults {
    pub fn max_tokens(&self, params: &GenerationParams) -> u32 {
        params.max_tokens.unwrap_or(self.max_tokens)
    }

    pub fn temperature(&self, params: &GenerationParams) -> f32 {
        params.temperature.unwrap_or(self.temperature)
    }

    pub fn top_p(&self, params: &GenerationParams) -> Option<f32> {
        params.top_p.or(self.top_p)
    }
}

/// Conversation snapshots an adapter was resynchronised with.
#[derive(Debug, Default)]
pub struct ContextCache {
    sessions: DashMap<String, Vec<Message>>,
}

impl ContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, session_id: &str, history: &[Message]) {
        self.sessions.insert(session_id.to_string(), history.to_vec());
    }

    pub fn get(&self, session_id: &str) -> Option<Vec<Message>> {
        self.sessions.get(session_id).map(|h| h.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Translator between the canonical envelopes and one backend's wire format.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Identifier this adapter is registered under.
    fn id(&self) -> &str;

    fn default_model(&self) -> &str;

    fn defaults(&self) -> GenerationDefaults {
        GenerationDefaults::default()
    }

    /// Build the backend request body.
    fn translate_request(&self, request: &RequestEnvelope) -> Result<Value, ProviderError>;

    /// Parse a backend response body into the canonical envelope.
    fn translate_response(&self, raw: Value) -> Result<ResponseEnvelope, ProviderError>;

    /// Perform one call. No retries happen here.
    async fn complete(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope, ProviderError>;

    fn context_cache(&self) -> &ContextCache;

    /// Resynchronise a session's history after this adapter became active.
    fn restore_context(&self, session_id: &str, history: &[Message]) {
        debug!(
            "Restoring {} messages of session {} into {}",
            history.len(),
            session_id,
            self.id()
        );
        self.context_cache().store(session_id, history);
    }

    fn restored_context(&self, session_id: &str) -> Option<Vec<Message>> {
        self.context_cache().get(session_id)
    }
}

/// Adapters keyed by provider id, resolved once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        let id = adapter.id().to_string();
        if self.adapters.insert(id.clone(), adapter).is_some() {
            warn!("Provider {} registered twice, keeping the latest", id);
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.adapters.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}

/// Builds adapters from configuration.
pub struct ProviderFactory;

impl ProviderFactory {
    /// Register the primary plus every configured alternate that has usable settings.
    /// Alternates that cannot be built are skipped with a warning.
    pub fn build_registry(config: &GatewayConfig) -> Result<ProviderRegistry, ProviderError> {
        let timeout = config.timeouts.provider_call();
        let mut registry = ProviderRegistry::new();

        let primary = AnthropicAdapter::primary(
            &config.primary.endpoint,
            config.primary.api_key.clone(),
            &config.primary.model,
            timeout,
        )?;
        registry.register(Arc::new(primary));

        for id in &config.alternates {
            let Some(settings) = config.providers.get(id) else {
                warn!("Alternate provider {} has no settings, skipping", id);
                continue;
            };
            match Self::create_adapter(id, settings, timeout) {
                Ok(adapter) => {
                    info!("Registered alternate provider {} ({:?})", id, settings.kind);
                    registry.register(adapter);
                }
                Err(e) => warn!("Alternate provider {} unavailable: {}", id, e),
            }
        }

        Ok(registry)
    }

    pub fn create_adapter(
        id: &str,
        settings: &ProviderSettings,
        timeout: Duration,
    ) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        let adapter: Arc<dyn ProviderAdapter> = match settings.kind {
            ProviderKind::Anthropic => Arc::new(AnthropicAdapter::alternate(
                id,
                &settings.base_url,
                settings.api_key.clone().unwrap_or_default(),
                settings.model.as_deref(),
                timeout,
            )?),
            ProviderKind::OpenAI => Arc::new(OpenAIAdapter::new(
                id,
                &settings.base_url,
                settings.api_key.clone().unwrap_or_default(),
                settings.model.as_deref(),
                timeout,
            )?),
            ProviderKind::Ollama => Arc::new(OllamaAdapter::new(
                id,
                &settings.base_url,
                settings.model.as_deref(),
                timeout,
            )?),
        };
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::FallbackMode;

    #[test]
    fn test_token_usage_total_saturates() {
        let usage = TokenUsage::new(u32::MAX, 1);
        assert_eq!(usage.prompt_tokens, u32::MAX);
        assert_eq!(usage.completion_tokens, 1);
        assert_eq!(usage.total_tokens, u32::MAX);
        assert_eq!(TokenUsage::new(5, 3).total_tokens, 8);
    }

    #[test]
    fn test_request_envelope_deserialization() {
        let raw = r#"{
            "messages": [{"role": "user", "content": "hello"}],
            "system": "be brief",
            "max_tokens": 256,
            "temperature": 0.2,
            "stop_sequences": ["END"],
            "metadata": {"session_id": "abc"}
        }"#;
        let request: RequestEnvelope = serde_json::from_str(raw).unwrap();

        assert_eq!(request.messages, vec![Message::user("hello")]);
        assert_eq!(request.system.as_deref(), Some("be brief"));
        assert_eq!(request.params.max_tokens, Some(256));
        assert_eq!(request.params.temperature, Some(0.2));
        assert_eq!(request.params.top_k, None);
        assert_eq!(request.metadata_str("session_id"), Some("abc"));
        assert!(!request.stream);
    }

    #[test]
    fn test_response_envelope_shape() {
        let response = ResponseEnvelope::new(
            "msg_1".into(),
            "gpt-4o-mini".into(),
            "hi".into(),
            StopReason::MaxTokens,
            TokenUsage::new(3, 4),
        )
        .with_metadata("provider", "openai");

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["stop_reason"], "max_tokens");
        assert_eq!(json["usage"]["total_tokens"], 7);
        assert_eq!(json["metadata"]["provider"], "openai");
    }

    #[test]
    fn test_generation_defaults() {
        let defaults = GenerationDefaults::default();
        let unset = GenerationParams::default();
        assert_eq!(defaults.max_tokens(&unset), 4096);
        assert_eq!(defaults.temperature(&unset), 0.7);

        let set = GenerationParams {
            max_tokens: Some(10),
            temperature: Some(0.0),
            ..Default::default()
        };
        assert_eq!(defaults.max_tokens(&set), 10);
        assert_eq!(defaults.temperature(&set), 0.0);
    }

    #[test]
    fn test_registry_skips_alternates_without_credentials() {
        let mut config = GatewayConfig::default();
        config.fallback_mode = FallbackMode::Auto;
        config.alternates = vec![
            "anthropic".into(),
            "openai".into(),
            "ollama".into(),
            "missing".into(),
        ];
        config
            .providers
            .get_mut("openai")
            .unwrap()
            .api_key = Some("sk-test".into());

        let registry = ProviderFactory::build_registry(&config).unwrap();
        assert!(registry.contains(PRIMARY_PROVIDER_ID));
        assert!(registry.contains("openai"));
        assert!(registry.contains("ollama"));
        // no key configured
        assert!(!registry.contains("anthropic"));
        assert!(!registry.contains("missing"));
        assert_eq!(registry.ids(), vec!["ollama", "openai", "primary"]);
    }

    #[test]
    fn test_context_cache_restore() {
        let cache = ContextCache::new();
        assert!(cache.is_empty());
        let history = vec![Message::user("a"), Message::assistant("b")];
        cache.store("s1", &history);
        assert_eq!(cache.get("s1"), Some(history));
        assert_eq!(cache.get("s2"), None);
    }
}
