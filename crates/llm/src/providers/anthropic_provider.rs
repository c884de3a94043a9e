use super::http::{join_url, missing_field, HttpTransport};
use super::{
    ContextCache, GenerationDefaults, MessageRole, ProviderAdapter, RequestEnvelope,
    ResponseEnvelope, StopReason, TokenUsage, PRIMARY_PROVIDER_ID,
};
use async_trait::async_trait;
use common::{ProviderError, ProviderErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-sonnet-20240229";

/// Anthropic Messages API. Serves both the primary service and the hosted
/// Anthropic alternate, which speak the same dialect.
pub struct AnthropicAdapter {
    id: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    /// Only the primary honours a caller-specified model.
    honour_requested_model: bool,
    defaults: GenerationDefaults,
    transport: HttpTransport,
    context: ContextCache,
}

impl AnthropicAdapter {
    pub fn primary(
        endpoint: &str,
        api_key: Option<String>,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            id: PRIMARY_PROVIDER_ID.to_string(),
            base_url: endpoint.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            model: model.to_string(),
            honour_requested_model: true,
            defaults: GenerationDefaults {
                top_p: Some(0.9),
                ..GenerationDefaults::default()
            },
            transport: HttpTransport::new(PRIMARY_PROVIDER_ID, timeout)?,
            context: ContextCache::new(),
        })
    }

    pub fn alternate(
        id: &str,
        base_url: &str,
        api_key: String,
        model: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        if api_key.is_empty() {
            return Err(ProviderError::new(
                id,
                ProviderErrorKind::NotConfigured,
                "Anthropic API key cannot be empty",
            ));
        }

        Ok(Self {
            id: id.to_string(),
            base_url: base_url.to_string(),
            api_key: Some(api_key),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            honour_requested_model: false,
            defaults: GenerationDefaults::default(),
            transport: HttpTransport::new(id, timeout)?,
            context: ContextCache::new(),
        })
    }

    fn model_for(&self, request: &RequestEnvelope) -> String {
        match (&request.model, self.honour_requested_model) {
            (Some(model), true) => model.clone(),
            _ => self.model.clone(),
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![("anthropic-version", ANTHROPIC_VERSION.to_string())];
        if let Some(key) = &self.api_key {
            headers.push(("x-api-key", key.clone()));
        }
        headers
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn defaults(&self) -> GenerationDefaults {
        self.defaults
    }

    fn translate_request(&self, request: &RequestEnvelope) -> Result<Value, ProviderError> {
        let params = &request.params;
        let body = AnthropicRequest {
            model: self.model_for(request),
            max_tokens: self.defaults.max_tokens(params),
            messages: request
                .messages
                .iter()
                .map(|m| AnthropicMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            system: request.system.clone(),
            temperature: Some(self.defaults.temperature(params)),
            top_p: self.defaults.top_p(params),
            top_k: params.top_k,
            stop_sequences: params.stop_sequences.clone(),
        };

        serde_json::to_value(body).map_err(|e| {
            ProviderError::new(&self.id, ProviderErrorKind::InvalidRequest, e.to_string())
        })
    }

    fn translate_response(&self, raw: Value) -> Result<ResponseEnvelope, ProviderError> {
        let parsed: AnthropicResponse = serde_json::from_value(raw).map_err(|e| {
            ProviderError::new(&self.id, ProviderErrorKind::Decode, e.to_string())
        })?;

        if parsed.role.as_deref().is_some_and(|r| r != MessageRole::Assistant.as_str()) {
            return Err(ProviderError::new(
                &self.id,
                ProviderErrorKind::Decode,
                "response role is not 'assistant'",
            ));
        }

        let content: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
            .unwrap_or_else(|| TokenUsage::new(0, 0));

        let id = parsed.id.ok_or_else(|| missing_field(&self.id, "id"))?;
        let model = parsed.model.unwrap_or_else(|| self.model.clone());

        Ok(ResponseEnvelope::new(
            id,
            model,
            content,
            map_stop_reason(parsed.stop_reason.as_deref()),
            usage,
        )
        .with_stop_sequence(parsed.stop_sequence))
    }

    #[instrument(skip(self, request), fields(provider = %self.id))]
    async fn complete(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope, ProviderError> {
        let body = self.translate_request(request)?;
        let url = join_url(&self.base_url, "/v1/messages");

        let raw = self.transport.post_json(&url, &self.headers(), &body).await?;
        let response = self.translate_response(raw)?;

        debug!(
            "Anthropic response: {} prompt + {} completion tokens",
            response.usage.prompt_tokens, response.usage.completion_tokens
        );
        Ok(response)
    }

    fn context_cache(&self) -> &ContextCache {
        &self.context
    }
}

fn map_stop_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("end_turn") => StopReason::EndTurn,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("stop_sequence") => StopReason::StopSequence,
        Some("tool_use") => StopReason::ToolUse,
        _ => StopReason::Unknown,
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: Option<String>,
    model: Option<String>,
    role: Option<String>,
    #[serde(default)]
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    stop_sequence: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{GenerationParams, Message};
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn sample_request() -> RequestEnvelope {
        RequestEnvelope::new(vec![
            Message::user("What is Rust?"),
            Message::assistant("A language."),
            Message::user("Tell me more"),
        ])
        .with_system("You are terse.")
    }

    #[test]
    fn test_alternate_requires_api_key() {
        let result = AnthropicAdapter::alternate(
            "anthropic",
            "https://api.anthropic.com",
            String::new(),
            None,
            Duration::from_secs(30),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_request_translation_uses_system_field() {
        let adapter = AnthropicAdapter::primary(
            "http://localhost:8000",
            None,
            DEFAULT_MODEL,
            Duration::from_secs(30),
        )
        .unwrap();

        let body = adapter.translate_request(&sample_request()).unwrap();
        assert_eq!(body["system"], "You are terse.");
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert!((body["top_p"].as_f64().unwrap() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_alternate_ignores_requested_model() {
        let adapter = AnthropicAdapter::alternate(
            "anthropic",
            "https://api.anthropic.com",
            "key".into(),
            Some("claude-3-haiku-20240307"),
            Duration::from_secs(30),
        )
        .unwrap();

        let mut request = sample_request().with_params(GenerationParams {
            top_k: Some(5),
            ..Default::default()
        });
        request.model = Some("something-else".into());

        let body = adapter.translate_request(&request).unwrap();
        assert_eq!(body["model"], "claude-3-haiku-20240307");
        assert_eq!(body["top_k"], 5);
        assert!(body.get("top_p").is_none());
    }

    #[test]
    fn test_response_translation() {
        let adapter = AnthropicAdapter::primary(
            "http://localhost:8000",
            None,
            DEFAULT_MODEL,
            Duration::from_secs(30),
        )
        .unwrap();

        let raw = json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-sonnet-20240229",
            "content": [{"type": "text", "text": "Hello "}, {"type": "text", "text": "there"}],
            "stop_reason": "stop_sequence",
            "stop_sequence": "END",
            "usage": {"input_tokens": 12, "output_tokens": 3}
        });

        let response = adapter.translate_response(raw).unwrap();
        assert_eq!(response.id, "msg_01");
        assert_eq!(response.content, "Hello there");
        assert_eq!(response.stop_reason, StopReason::StopSequence);
        assert_eq!(response.stop_sequence.as_deref(), Some("END"));
        assert_eq!(response.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn test_complete_against_mock_server() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "test-key")
            .match_header("anthropic-version", ANTHROPIC_VERSION)
            .match_body(Matcher::PartialJson(json!({"system": "You are terse."})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "id": "msg_02",
                    "role": "assistant",
                    "model": "claude-3-haiku-20240307",
                    "content": [{"type": "text", "text": "Rust is a systems language."}],
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 20, "output_tokens": 6}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let adapter = AnthropicAdapter::alternate(
            "anthropic",
            &server.url(),
            "test-key".into(),
            Some("claude-3-haiku-20240307"),
            Duration::from_secs(5),
        )
        .unwrap();

        let response = adapter.complete(&sample_request()).await.unwrap();
        assert_eq!(response.content, "Rust is a systems language.");
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_overloaded_primary_is_transient() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/messages")
            .with_status(529)
            .with_body(r#"{"type":"error","error":{"type":"overloaded_error"}}"#)
            .create_async()
            .await;

        let adapter =
            AnthropicAdapter::primary(&server.url(), None, DEFAULT_MODEL, Duration::from_secs(5))
                .unwrap();
        let err = adapter.complete(&sample_request()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.provider, PRIMARY_PROVIDER_ID);
    }
}
