use super::http::{join_url, HttpTransport};
use super::{
    ContextCache, ProviderAdapter, RequestEnvelope, ResponseEnvelope, StopReason, TokenUsage,
};
use async_trait::async_trait;
use common::{ProviderError, ProviderErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

const DEFAULT_MODEL: &str = "llama3";

/// Local Ollama server (`/api/chat`, non-streaming).
pub struct OllamaAdapter {
    id: String,
    base_url: String,
    model: String,
    transport: HttpTransport,
    context: ContextCache,
}

impl OllamaAdapter {
    pub fn new(
        id: &str,
        base_url: &str,
        model: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            id: id.to_string(),
            base_url: base_url.to_string(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            transport: HttpTransport::new(id, timeout)?,
            context: ContextCache::new(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn translate_request(&self, request: &RequestEnvelope) -> Result<Value, ProviderError> {
        let defaults = self.defaults();
        let params = &request.params;

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(OllamaMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().map(|m| OllamaMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        }));

        let body = OllamaRequest {
            model: self.model.clone(),
            messages,
            stream: false,
            options: OllamaOptions {
                num_predict: defaults.max_tokens(params),
                temperature: defaults.temperature(params),
                top_p: defaults.top_p(params),
                top_k: params.top_k,
                stop: params.stop_sequences.clone(),
            },
        };

        serde_json::to_value(body).map_err(|e| {
            ProviderError::new(&self.id, ProviderErrorKind::InvalidRequest, e.to_string())
        })
    }

    fn translate_response(&self, raw: Value) -> Result<ResponseEnvelope, ProviderError> {
        let parsed: OllamaResponse = serde_json::from_value(raw).map_err(|e| {
            ProviderError::new(&self.id, ProviderErrorKind::Decode, e.to_string())
        })?;

        let stop_reason = match parsed.done_reason.as_deref() {
            Some("stop") => StopReason::EndTurn,
            Some("length") => StopReason::MaxTokens,
            _ => StopReason::Unknown,
        };

        Ok(ResponseEnvelope::new(
            format!("{}-{}", self.id, uuid::Uuid::new_v4()),
            parsed.model.unwrap_or_else(|| self.model.clone()),
            parsed.message.content,
            stop_reason,
            TokenUsage::new(
                parsed.prompt_eval_count.unwrap_or(0),
                parsed.eval_count.unwrap_or(0),
            ),
        ))
    }

    #[instrument(skip(self, request), fields(provider = %self.id))]
    async fn complete(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope, ProviderError> {
        let body = self.translate_request(request)?;
        let url = join_url(&self.base_url, "/api/chat");

        let raw = self.transport.post_json(&url, &[], &body).await?;
        let response = self.translate_response(raw)?;
        debug!("Ollama response from model {}", response.model);
        Ok(response)
    }

    fn context_cache(&self) -> &ContextCache {
        &self.context
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    model: Option<String>,
    message: OllamaMessage,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{GenerationParams, Message};
    use mockito::{Matcher, Server};
    use serde_json::json;

    #[test]
    fn test_options_carry_generation_params() {
        let adapter =
            OllamaAdapter::new("ollama", "http://unused", None, Duration::from_secs(5)).unwrap();
        let request = RequestEnvelope::new(vec![Message::user("hi")]).with_params(GenerationParams {
            max_tokens: Some(64),
            top_k: Some(20),
            ..Default::default()
        });

        let body = adapter.translate_request(&request).unwrap();
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["num_predict"], 64);
        assert_eq!(body["options"]["top_k"], 20);
        assert_eq!(body["model"], DEFAULT_MODEL);
    }

    #[tokio::test]
    async fn test_complete_against_mock_server() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/chat")
            .match_body(Matcher::PartialJson(json!({"model": "mistral", "stream": false})))
            .with_status(200)
            .with_body(
                json!({
                    "model": "mistral",
                    "message": {"role": "assistant", "content": "Local answer"},
                    "done": true,
                    "done_reason": "stop",
                    "prompt_eval_count": 7,
                    "eval_count": 2
                })
                .to_string(),
            )
            .create_async()
            .await;

        let adapter = OllamaAdapter::new(
            "ollama",
            &server.url(),
            Some("mistral"),
            Duration::from_secs(5),
        )
        .unwrap();
        let response = adapter
            .complete(&RequestEnvelope::new(vec![Message::user("hi")]))
            .await
            .unwrap();

        assert_eq!(response.content, "Local answer");
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert_eq!(response.usage.total_tokens, 9);
        assert!(response.id.starts_with("ollama-"));
        mock.assert_async().await;
    }
}
