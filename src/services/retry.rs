use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Phrases that mark a provider error as a throughput/quota limit.
/// Matched case-insensitively against the error text.
pub const RATE_LIMIT_KEYWORDS: &[&str] = &[
    "token_quota_exceeded",
    "rate_limit_exceeded",
    "too many requests",
    "tokens per minute limit",
    "rate limit",
    "quota exceeded",
    "too many tokens",
];

/// Wait used when a rate-limited response carries no retry hint
pub const DEFAULT_SERVER_RETRY_AFTER: Duration = Duration::from_secs(10);

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(60);

/// Prefix of the placeholder text written in place of an abandoned result
pub const SKIP_MARKER_PREFIX: &str = "[SKIPPED]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    RateLimited,
    ContentFiltered,
    Other,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorClass::RateLimited => "rate limited",
            ErrorClass::ContentFiltered => "content filtered",
            ErrorClass::Other => "other",
        })
    }
}

/// Errors returned by an AI provider, already classified for retrying
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AiError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("content filtered: {0}")]
    ContentFiltered(String),

    #[error("{0}")]
    Other(String),
}

impl AiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AiError::RateLimited { .. } => ErrorClass::RateLimited,
            AiError::ContentFiltered(_) => ErrorClass::ContentFiltered,
            AiError::Other(_) => ErrorClass::Other,
        }
    }

    /// Classify a failed HTTP exchange.
    ///
    /// 429 or a rate-limit phrase in the body is `RateLimited`, 400 is
    /// `ContentFiltered`, everything else is `Other`.
    pub fn from_http(status: u16, body: &str) -> Self {
        let message = error_message(body);

        if status == 429 || is_rate_limit_message(body) {
            return AiError::RateLimited {
                message: format!("HTTP {status}: {message}"),
                retry_after: parse_retry_after(body),
            };
        }

        match status {
            400 => AiError::ContentFiltered(message),
            _ => AiError::Other(format!("HTTP {status}: {message}")),
        }
    }

    /// Classify a failure that only carries text, such as a transport error
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_rate_limit_message(&message) {
            AiError::RateLimited {
                message,
                retry_after: None,
            }
        } else {
            AiError::Other(message)
        }
    }
}

pub fn is_rate_limit_message(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Read a `retry_after` / `retryAfter` hint (seconds) from a JSON error body,
/// at the top level or inside an `error` object
pub fn parse_retry_after(body: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;

    let lookup = |v: &serde_json::Value| {
        v.get("retry_after")
            .or_else(|| v.get("retryAfter"))
            .and_then(|r| match r {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            })
    };

    lookup(&value)
        .or_else(|| value.get("error").and_then(lookup))
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Human readable message out of a JSON error body, or the raw body
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Wait before the next attempt after `error`.
///
/// Rate limits wait `max(base, server hint)`, with the hint defaulting to
/// [`DEFAULT_SERVER_RETRY_AFTER`]. Other classes wait `base`.
pub fn retry_delay(base: Duration, error: &AiError) -> Duration {
    match error {
        AiError::RateLimited { retry_after, .. } => {
            base.max(retry_after.unwrap_or(DEFAULT_SERVER_RETRY_AFTER))
        }
        _ => base,
    }
}

/// State of one retry decision, handed to the per-attempt hook
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    /// 1-based number of the attempt that just failed, across all classes
    pub index: u32,
    /// 1-based count of failures of `last_error`'s class so far
    pub class_attempt: u32,
    /// Ceiling of attempts for a single error class. Budgets are per class,
    /// so `index` may exceed this while `class_attempt` never does.
    pub max_attempts: u32,
    pub last_error: ErrorClass,
    pub next_delay: Duration,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Retry `ContentFiltered` failures instead of returning them at once
    pub retry_content_filter: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            retry_content_filter: false,
        }
    }

    pub fn with_content_filter_retries(mut self, enabled: bool) -> Self {
        self.retry_content_filter = enabled;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY)
    }
}

/// Placeholder recorded for a subsection whose result was abandoned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipMarker {
    pub reason: String,
}

impl SkipMarker {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn content_filtered(detail: &str) -> Self {
        Self::new(format!("content filtered: {detail}"))
    }

    pub fn text(&self) -> String {
        format!("{SKIP_MARKER_PREFIX} {}", self.reason)
    }

    pub fn is_marker(text: &str) -> bool {
        text.trim_start().starts_with(SKIP_MARKER_PREFIX)
    }

    pub fn parse(text: &str) -> Option<Self> {
        text.trim_start()
            .strip_prefix(SKIP_MARKER_PREFIX)
            .map(|reason| Self::new(reason.trim()))
    }
}

impl fmt::Display for SkipMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Result of a call site that downgrades content filtering
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    Value(T),
    Skipped(SkipMarker),
}

/// Runs a provider call, retrying rate limits (and optionally content
/// filtering) with independent budgets per error class.
///
/// Any other error is returned on the first occurrence.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `operation` until it succeeds, a budget runs out, or a
    /// non-retryable error comes back. `on_retry` runs before every wait.
    pub async fn execute<T, F, Fut, H>(&self, mut operation: F, mut on_retry: H) -> Result<T, AiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AiError>>,
        H: FnMut(&Attempt),
    {
        let mut rate_limited = 0u32;
        let mut filtered = 0u32;
        let mut index = 0u32;

        loop {
            index += 1;
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let class = error.class();
            let used = match class {
                ErrorClass::RateLimited => {
                    rate_limited += 1;
                    rate_limited
                }
                ErrorClass::ContentFiltered if self.policy.retry_content_filter => {
                    filtered += 1;
                    filtered
                }
                _ => return Err(error),
            };

            if used > self.policy.max_retries {
                tracing::warn!(
                    "Giving up after {} {} retries: {}",
                    self.policy.max_retries,
                    class,
                    error
                );
                return Err(error);
            }

            let attempt = Attempt {
                index,
                class_attempt: used,
                max_attempts: self.policy.max_attempts(),
                last_error: class,
                next_delay: retry_delay(self.policy.base_delay, &error),
                message: error.to_string(),
            };

            tracing::warn!(
                "Attempt {} failed ({}), retry {}/{} in {:.1}s",
                attempt.index,
                class,
                used,
                self.policy.max_retries,
                attempt.next_delay.as_secs_f64()
            );
            on_retry(&attempt);
            tokio::time::sleep(attempt.next_delay).await;
        }
    }

    /// Like [`execute`](Self::execute), but a final `ContentFiltered` error
    /// becomes a [`SkipMarker`] carrying the provider's reason
    pub async fn execute_or_skip<T, F, Fut, H>(
        &self,
        operation: F,
        on_retry: H,
    ) -> Result<CallOutcome<T>, AiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AiError>>,
        H: FnMut(&Attempt),
    {
        match self.execute(operation, on_retry).await {
            Ok(value) => Ok(CallOutcome::Value(value)),
            Err(AiError::ContentFiltered(reason)) => {
                tracing::warn!("Content filtered, recording skip marker: {}", reason);
                Ok(CallOutcome::Skipped(SkipMarker::content_filtered(&reason)))
            }
            Err(e) => Err(e),
        }
    }
}
