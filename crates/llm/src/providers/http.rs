use common::{ProviderError, ProviderErrorKind};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Maximum number of body bytes kept in an error message.
const ERROR_BODY_LIMIT: usize = 512;

/// JSON-over-HTTP client shared by the adapters.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    provider: String,
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(provider: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            ProviderError::new(
                provider,
                ProviderErrorKind::NotConfigured,
                format!("failed to create HTTP client: {}", e),
            )
        })?;

        Ok(Self {
            provider: provider.to_string(),
            client,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST `body` and return the decoded JSON response.
    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &Value,
    ) -> Result<Value, ProviderError> {
        debug!("POST {} via {}", url, self.provider);

        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        let response = request.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                &self.provider,
                status.as_u16(),
                truncate(&text),
            ));
        }

        response.json::<Value>().await.map_err(|e| {
            ProviderError::new(
                &self.provider,
                ProviderErrorKind::Decode,
                format!("invalid JSON body: {}", e),
            )
        })
    }

    fn classify(&self, error: reqwest::Error) -> ProviderError {
        if error.is_timeout() {
            ProviderError::timeout(&self.provider, self.timeout)
        } else if let Some(status) = error.status() {
            ProviderError::from_status(&self.provider, status.as_u16(), error.to_string())
        } else {
            ProviderError::new(&self.provider, ProviderErrorKind::Network, error.to_string())
        }
    }
}

/// Join a base URL and a path without doubling slashes.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn truncate(text: &str) -> String {
    if text.len() <= ERROR_BODY_LIMIT {
        return text.to_string();
    }
    let mut end = ERROR_BODY_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Error for a response body missing a required field.
pub fn missing_field(provider: &str, field: &str) -> ProviderError {
    ProviderError::new(
        provider,
        ProviderErrorKind::Decode,
        format!("response is missing '{}'", field),
    )
}
