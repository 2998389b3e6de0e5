use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use tracing::{debug, warn};

use super::error::AnthropicError;
use super::types::{MessagesRequest, MessagesResponse};

pub const API_URL: &str = "https://api.anthropic.com/v1/messages";

const API_VERSION: &str = "2023-06-01";

/// Fallback when a request carries no tier timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Used when a 429 has no parseable `retry-after`.
const DEFAULT_RETRY_AFTER_MS: u64 = 1000;

/// Ceiling on a server-supplied `retry-after`.
pub const MAX_RETRY_AFTER_MS: u64 = 5 * 60 * 1000;

/// Messages API client. Timeouts are per request, so one client serves every
/// tier.
pub struct AnthropicClient {
    api_key: String,
    client: Client,
    endpoint: String,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Result<Self, AnthropicError> {
        Self::with_base_url(api_key, API_URL.to_string())
    }

    /// Client pointing at a custom endpoint (mock servers, proxies).
    pub fn with_base_url(api_key: String, endpoint: String) -> Result<Self, AnthropicError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            api_key,
            client,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        let timeout = Duration::from_secs(req.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
        debug!(model = %req.model, max_tokens = req.max_tokens, ?timeout, "sending message");

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(req)
            .send()
            .await?;

        let response = check_status(response).await?;
        let body = response.json::<MessagesResponse>().await?;
        debug!(
            model = %body.model,
            input_tokens = body.usage.input_tokens,
            output_tokens = body.usage.output_tokens,
            stop_reason = body.stop_reason.as_deref().unwrap_or("-"),
            "message received"
        );
        Ok(body)
    }
}

/// Maps non-success statuses to typed errors. 429 carries the server's
/// `retry-after` in milliseconds.
async fn check_status(response: Response) -> Result<Response, AnthropicError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let request_id = response
        .headers()
        .get("request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_ms = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|secs| secs.saturating_mul(1000).min(MAX_RETRY_AFTER_MS))
            .unwrap_or(DEFAULT_RETRY_AFTER_MS);
        warn!(retry_after_ms, request_id = request_id.as_deref().unwrap_or("-"), "rate limited");
        return Err(AnthropicError::RateLimited { retry_after_ms });
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unreadable error body".to_string());
    let message = match request_id {
        Some(id) => format!("{body} (request-id {id})"),
        None => body,
    };
    Err(AnthropicError::ApiError {
        status: status.as_u16(),
        message,
    })
}
