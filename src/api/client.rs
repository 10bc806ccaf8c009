//! Completion-service client for Azure OpenAI-style chat completions.
//!
//! Retryable failures (rate limits, server errors, transport faults) are
//! retried a bounded number of times with doubling backoff before they
//! surface to the caller.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::{AssistantTurn, ChatCompletionResponse, ChatRequest};
use crate::core::config::{CompletionConfig, SamplingParams};

const MAX_COMPLETION_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Http(String),
    #[error("completion service returned status {status}: {message}")]
    Service {
        status: u16,
        message: String,
        retryable: bool,
    },
    #[error("malformed completion response: {0}")]
    Malformed(String),
}

impl CompletionError {
    fn is_retryable(&self) -> bool {
        match self {
            CompletionError::Http(_) => true,
            CompletionError::Service { retryable, .. } => *retryable,
            CompletionError::Malformed(_) => false,
        }
    }
}

/// Seam between the conversation engine and the completion service. The
/// engine only needs one round trip at a time; tests script this trait.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<AssistantTurn, CompletionError>;
}

pub struct CompletionClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    deployment: String,
    sampling: SamplingParams,
}

impl CompletionClient {
    pub fn new(config: &CompletionConfig) -> Result<Self, CompletionError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| CompletionError::Http(err.to_string()))?;
        Ok(Self {
            http,
            url: completions_url(&config.endpoint, &config.deployment, &config.api_version),
            api_key: config.api_key.clone(),
            deployment: config.deployment.clone(),
            sampling: config.sampling(),
        })
    }

    async fn attempt(&self, request: &ChatRequest) -> Result<AssistantTurn, CompletionError> {
        let response = self
            .http
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|err| CompletionError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CompletionError::Service {
                status: status.as_u16(),
                message: truncate_body(&message),
                retryable: status.as_u16() == 429 || status.is_server_error(),
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| CompletionError::Malformed(err.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CompletionError::Malformed("response contained no choices".to_string()))?;
        debug!(finish_reason = ?choice.finish_reason, "Completion round trip finished");
        Ok(AssistantTurn::from(choice.message))
    }
}

#[async_trait]
impl CompletionBackend for CompletionClient {
    async fn complete(&self, mut request: ChatRequest) -> Result<AssistantTurn, CompletionError> {
        request.model = Some(self.deployment.clone());
        request.max_tokens = self.sampling.max_tokens;
        request.temperature = self.sampling.temperature;
        request.top_p = self.sampling.top_p;

        let mut backoff = RETRY_BACKOFF_BASE;
        let mut attempt = 1;
        loop {
            match self.attempt(&request).await {
                Ok(turn) => return Ok(turn),
                Err(err) if err.is_retryable() && attempt < MAX_COMPLETION_ATTEMPTS => {
                    warn!(attempt, error = %err, "Completion attempt failed; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn completions_url(endpoint: &str, deployment: &str, api_version: &str) -> String {
    format!(
        "{}/openai/deployments/{}/chat/completions?api-version={}",
        endpoint.trim_end_matches('/'),
        deployment,
        api_version
    )
}

fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_strips_trailing_endpoint_slash() {
        let url = completions_url("https://example.openai.azure.com/", "gpt-4o", "2024-06-01");
        assert_eq!(
            url,
            "https://example.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        let rate_limited = CompletionError::Service {
            status: 429,
            message: String::new(),
            retryable: true,
        };
        let bad_request = CompletionError::Service {
            status: 400,
            message: String::new(),
            retryable: false,
        };
        assert!(rate_limited.is_retryable());
        assert!(!bad_request.is_retryable());
        assert!(!CompletionError::Malformed("x".to_string()).is_retryable());
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(2048);
        assert!(truncate_body(&body).len() < 600);
    }
}
