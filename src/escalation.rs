//! Cost-tiered call/validate/retry loop against the generative API.
//!
//! Tiers are walked by index from the start tier forward. Transport failures
//! are retried in place with exponential backoff and never escalate; parse,
//! validation and content-quality failures move to the next, more expensive
//! tier. A tier is never attempted twice in one [`EscalationExecutor::execute`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::anthropic::{AnthropicError, MessageSender, MessagesRequest, MessagesResponse};
use crate::prompt::{CorrectionTask, Strictness, build_prompt};
use crate::validator::Validator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    TransportTimeout,
    RateLimited,
    ParseError,
    ValidationError,
    ContentQualityError,
    Other,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::TransportTimeout => "transport_timeout",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::ParseError => "parse_error",
            ErrorCategory::ValidationError => "validation_error",
            ErrorCategory::ContentQualityError => "content_quality_error",
            ErrorCategory::Other => "other",
        }
    }

    /// Categories that a more capable model can plausibly fix.
    pub fn is_escalatable(self) -> bool {
        matches!(
            self,
            ErrorCategory::ParseError
                | ErrorCategory::ValidationError
                | ErrorCategory::ContentQualityError
        )
    }

    pub fn from_api_error(err: &AnthropicError) -> Self {
        match err {
            AnthropicError::RateLimited { .. } => ErrorCategory::RateLimited,
            AnthropicError::Timeout | AnthropicError::NetworkError(_) => {
                ErrorCategory::TransportTimeout
            }
            AnthropicError::ApiError { status, .. } if *status >= 500 => {
                ErrorCategory::TransportTimeout
            }
            AnthropicError::ApiError { .. } => ErrorCategory::Other,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_escalate_on() -> Vec<ErrorCategory> {
    vec![
        ErrorCategory::ParseError,
        ErrorCategory::ValidationError,
        ErrorCategory::ContentQualityError,
    ]
}

/// One cost level of the model chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub model: String,
    pub cost_level: u32,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    #[serde(default)]
    pub strictness: Strictness,
    /// Failure categories that move on to the next tier.
    #[serde(default = "default_escalate_on")]
    pub escalate_on: Vec<ErrorCategory>,
}

impl TierConfig {
    pub fn new(name: &str, model: &str, cost_level: u32) -> Self {
        Self {
            name: name.to_string(),
            model: model.to_string(),
            cost_level,
            max_tokens: 2048,
            temperature: 0.3,
            timeout_secs: 60,
            strictness: Strictness::Relaxed,
            escalate_on: default_escalate_on(),
        }
    }
}

/// Standard → intermediate → premium, ascending cost.
pub fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig {
            max_tokens: 2048,
            temperature: 0.3,
            timeout_secs: 60,
            ..TierConfig::new("standard", "claude-haiku-4-5-20251001", 1)
        },
        TierConfig {
            max_tokens: 4096,
            temperature: 0.2,
            timeout_secs: 120,
            strictness: Strictness::Strict,
            ..TierConfig::new("intermediate", "claude-sonnet-4-5-20250929", 3)
        },
        TierConfig {
            max_tokens: 8192,
            temperature: 0.0,
            timeout_secs: 300,
            strictness: Strictness::Strictest,
            ..TierConfig::new("premium", "claude-opus-4-6", 15)
        },
    ]
}

/// Escalation decision for a failure at a tier. Non-escalatable categories
/// never advance, whatever the tier lists.
pub fn should_escalate(tier: &TierConfig, category: ErrorCategory) -> bool {
    category.is_escalatable() && tier.escalate_on.contains(&category)
}

/// Configuration for transport retries within one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Calls per tier, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

/// Upper bound on any single backoff sleep, server hints included.
pub const MAX_RETRY_DELAY_MS: u64 = 5 * 60 * 1000;

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
            .min(MAX_RETRY_DELAY_MS)
    }
}

/// One failed tier within an execution. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationAttempt {
    pub tier: String,
    pub tier_index: usize,
    pub model: String,
    pub cost_level: u32,
    pub category: ErrorCategory,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EscalationOutcome {
    pub result: Value,
    pub tier_used: String,
    pub tier_index: usize,
    /// API calls made, transport retries included.
    pub attempts: u32,
    pub escalated: bool,
    pub history: Vec<EscalationAttempt>,
}

impl EscalationOutcome {
    /// Summary stored alongside the corrected data.
    pub fn summary(&self) -> Value {
        json!({
            "tier_used": self.tier_used,
            "attempts": self.attempts,
            "escalated": self.escalated,
            "failures": self.history,
        })
    }
}

#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("start tier {start} is out of range ({tiers} tiers configured)")]
    InvalidStartTier { start: usize, tiers: usize },

    #[error("{}", describe_exhausted(.history, .halted_on))]
    Exhausted {
        history: Vec<EscalationAttempt>,
        /// Set when a non-escalating failure stopped the chain early.
        halted_on: Option<ErrorCategory>,
        attempts: u32,
    },
}

fn describe_exhausted(history: &[EscalationAttempt], halted_on: &Option<ErrorCategory>) -> String {
    let last = history
        .last()
        .map(|a| format!("{} on {}: {}", a.category, a.tier, a.message))
        .unwrap_or_else(|| "no tier attempted".to_string());
    match halted_on {
        Some(category) => format!("escalation abandoned after {category} ({last})"),
        None => format!("escalation exhausted after {} tier(s) ({last})", history.len()),
    }
}

struct TierFailure {
    category: ErrorCategory,
    message: String,
}

impl TierFailure {
    fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// Finds the earliest balanced `{...}` block that parses as a JSON object,
/// skipping markdown fences and prose around it. One pass over the text;
/// quotes only count once a brace is open.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let mut open = Vec::new();
    let mut blocks = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in text.bytes().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' if !open.is_empty() => in_string = true,
            b'{' => open.push(i),
            b'}' => {
                if let Some(start) = open.pop() {
                    blocks.push((start, i));
                }
            }
            _ => {}
        }
    }
    blocks.sort_unstable();
    blocks
        .into_iter()
        .find_map(|(start, end)| match serde_json::from_str::<Value>(&text[start..=end]) {
            Ok(value @ Value::Object(_)) => Some(value),
            _ => None,
        })
}

pub struct EscalationExecutor<C> {
    client: C,
    tiers: Vec<TierConfig>,
    retry: RetryConfig,
    validator: Validator,
}

impl<C: MessageSender> EscalationExecutor<C> {
    pub fn new(client: C, tiers: Vec<TierConfig>, retry: RetryConfig, validator: Validator) -> Self {
        Self {
            client,
            tiers,
            retry,
            validator,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn tiers(&self) -> &[TierConfig] {
        &self.tiers
    }

    pub fn tier_index(&self, name: &str) -> Option<usize> {
        self.tiers.iter().position(|t| t.name == name)
    }

    /// Runs the task from `start_tier` (default: cheapest) until a tier
    /// produces valid output or the chain ends.
    pub async fn execute(
        &self,
        task: &CorrectionTask<'_>,
        start_tier: Option<usize>,
    ) -> Result<EscalationOutcome, EscalationError> {
        let start = start_tier.unwrap_or(0);
        if start >= self.tiers.len() {
            return Err(EscalationError::InvalidStartTier {
                start,
                tiers: self.tiers.len(),
            });
        }

        let mut history = Vec::new();
        let mut attempts = 0u32;

        for (index, tier) in self.tiers.iter().enumerate().skip(start) {
            let (outcome, calls) = self.attempt_tier(task, tier).await;
            attempts += calls;
            let failure = match outcome {
                Ok(result) => {
                    info!(
                        subject = task.subject_key,
                        tier = %tier.name,
                        attempts,
                        escalated = index != start,
                        "correction generated"
                    );
                    return Ok(EscalationOutcome {
                        result,
                        tier_used: tier.name.clone(),
                        tier_index: index,
                        attempts,
                        escalated: index != start,
                        history,
                    });
                }
                Err(failure) => failure,
            };

            warn!(
                subject = task.subject_key,
                tier = %tier.name,
                category = %failure.category,
                error = %failure.message,
                "tier failed"
            );
            let escalate = should_escalate(tier, failure.category);
            history.push(EscalationAttempt {
                tier: tier.name.clone(),
                tier_index: index,
                model: tier.model.clone(),
                cost_level: tier.cost_level,
                category: failure.category,
                message: failure.message,
            });
            if !escalate {
                return Err(EscalationError::Exhausted {
                    halted_on: Some(history[history.len() - 1].category),
                    history,
                    attempts,
                });
            }
        }

        Err(EscalationError::Exhausted {
            history,
            halted_on: None,
            attempts,
        })
    }

    /// One tier: build, call with transport retries, parse, validate.
    /// Returns the outcome and the number of API calls made.
    async fn attempt_tier(
        &self,
        task: &CorrectionTask<'_>,
        tier: &TierConfig,
    ) -> (Result<Value, TierFailure>, u32) {
        let prompt = match build_prompt(task, tier.strictness) {
            Ok(p) => p,
            Err(e) => return (Err(TierFailure::new(ErrorCategory::Other, e.to_string())), 0),
        };
        let mut req = MessagesRequest::user(tier.model.clone(), tier.max_tokens, prompt);
        req.temperature = Some(tier.temperature);
        req.timeout_secs = Some(tier.timeout_secs);

        let (response, calls) = self.call_with_retry(&req, tier).await;
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let category = ErrorCategory::from_api_error(&e);
                return (Err(TierFailure::new(category, e.to_string())), calls);
            }
        };

        let text = response.text();
        let Some(value) = extract_json_object(&text) else {
            return (
                Err(TierFailure::new(
                    ErrorCategory::ParseError,
                    "no JSON object found in response",
                )),
                calls,
            );
        };

        match self
            .validator
            .validate(task.correction_type, &value, response.is_truncated())
        {
            Ok(()) => (Ok(value), calls),
            Err(e) => {
                let category = if e.is_quality_only() {
                    ErrorCategory::ContentQualityError
                } else {
                    ErrorCategory::ValidationError
                };
                (Err(TierFailure::new(category, e.to_string())), calls)
            }
        }
    }

    async fn call_with_retry(
        &self,
        req: &MessagesRequest,
        tier: &TierConfig,
    ) -> (Result<MessagesResponse, AnthropicError>, u32) {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.client.send_message(req).await {
                Ok(response) => return (Ok(response), attempt),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let mut delay_ms = self.retry.delay_for_attempt(attempt);
                    if let AnthropicError::RateLimited { retry_after_ms } = &e {
                        delay_ms = delay_ms.max(*retry_after_ms).min(MAX_RETRY_DELAY_MS);
                    }
                    debug!(
                        tier = %tier.name,
                        attempt,
                        max_attempts,
                        delay_ms,
                        error = %e,
                        "retrying transport failure"
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}
