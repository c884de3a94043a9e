use super::http::{join_url, missing_field, HttpTransport};
use super::{
    ContextCache, ProviderAdapter, RequestEnvelope, ResponseEnvelope, StopReason, TokenUsage,
};
use async_trait::async_trait;
use common::{ProviderError, ProviderErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI Chat Completions API.
pub struct OpenAIAdapter {
    id: String,
    base_url: String,
    api_key: String,
    model: String,
    transport: HttpTransport,
    context: ContextCache,
}

impl OpenAIAdapter {
    pub fn new(
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
                "OpenAI API key cannot be empty",
            ));
        }

        Ok(Self {
            id: id.to_string(),
            base_url: base_url.to_string(),
            api_key,
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            transport: HttpTransport::new(id, timeout)?,
            context: ContextCache::new(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn translate_request(&self, request: &RequestEnvelope) -> Result<Value, ProviderError> {
        let defaults = self.defaults();
        let params = &request.params;

        // System prompt travels as the leading message
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().map(|m| OpenAIMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        }));

        if params.top_k.is_some() {
            debug!("top_k is not supported by {}, dropping it", self.id);
        }

        let body = OpenAIRequest {
            model: self.model.clone(),
            messages,
            max_tokens: defaults.max_tokens(params),
            temperature: defaults.temperature(params),
            top_p: defaults.top_p(params),
            stop: params.stop_sequences.clone(),
        };

        serde_json::to_value(body).map_err(|e| {
            ProviderError::new(&self.id, ProviderErrorKind::InvalidRequest, e.to_string())
        })
    }

    fn translate_response(&self, raw: Value) -> Result<ResponseEnvelope, ProviderError> {
        let parsed: OpenAIResponse = serde_json::from_value(raw).map_err(|e| {
            ProviderError::new(&self.id, ProviderErrorKind::Decode, e.to_string())
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| missing_field(&self.id, "choices[0]"))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_else(|| TokenUsage::new(0, 0));

        Ok(ResponseEnvelope::new(
            parsed.id.unwrap_or_else(|| format!("{}-{}", self.id, uuid::Uuid::new_v4())),
            parsed.model.unwrap_or_else(|| self.model.clone()),
            choice.message.content.unwrap_or_default(),
            map_finish_reason(choice.finish_reason.as_deref()),
            usage,
        ))
    }

    #[instrument(skip(self, request), fields(provider = %self.id))]
    async fn complete(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope, ProviderError> {
        let body = self.translate_request(request)?;
        let url = join_url(&self.base_url, "/chat/completions");
        let headers = [("Authorization", format!("Bearer {}", self.api_key))];

        let raw = self.transport.post_json(&url, &headers, &body).await?;
        let response = self.translate_response(raw)?;

        debug!(
            "OpenAI response: {} total tokens",
            response.usage.total_tokens
        );
        Ok(response)
    }

    fn context_cache(&self) -> &ContextCache {
        &self.context
    }
}

fn map_finish_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("stop") => StopReason::EndTurn,
        Some("length") => StopReason::MaxTokens,
        Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
        Some("content_filter") => StopReason::ContentFilter,
        _ => StopReason::Unknown,
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
