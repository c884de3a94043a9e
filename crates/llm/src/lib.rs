//! Provider side of the gateway: canonical envelopes, wire adapters for each
//! backend, the primary liveness probe and bounded retry.

pub mod health;
pub mod providers;
pub mod retry;

pub use health::{HealthProbe, HttpHealthProbe, PrimaryStatus, ProbeCounters};
pub use providers::{
    AnthropicAdapter, ContextCache, GenerationDefaults, GenerationParams, Message, MessageRole,
    OllamaAdapter, OpenAIAdapter, ProviderAdapter, ProviderFactory, ProviderRegistry,
    RequestEnvelope, ResponseEnvelope, StopReason, TokenUsage, PRIMARY_PROVIDER_ID,
};
pub use retry::{execute_with_retry, RetryFailure, RetryPolicy, RetryableError};
