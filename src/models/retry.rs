//! Error taxonomy, provider error classification and bounded backoff shared by
//! every adapter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientRateLimited,
    QuotaExhausted,
    AuthSignatureTransient,
    ContentSafetyBlocked,
    ProviderUnavailable,
    ModelNotFoundOnTier,
    Timeout,
    BothProvidersExhausted,
    InvalidRequest,
    ServerTransient,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    /// Worth another attempt against the same tier after a backoff.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::TransientRateLimited | ErrorKind::ServerTransient
        )
    }

    /// No other tier or provider can change the outcome.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorKind::ContentSafetyBlocked
                | ErrorKind::InvalidRequest
                | ErrorKind::Cancelled
                | ErrorKind::BothProvidersExhausted
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::TransientRateLimited => "rate limited",
            ErrorKind::QuotaExhausted => "quota exhausted",
            ErrorKind::AuthSignatureTransient => "invalid signature",
            ErrorKind::ContentSafetyBlocked => "content blocked",
            ErrorKind::ProviderUnavailable => "provider unavailable",
            ErrorKind::ModelNotFoundOnTier => "model not found",
            ErrorKind::Timeout => "timed out",
            ErrorKind::BothProvidersExhausted => "all providers exhausted",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::ServerTransient => "server error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown error",
        };
        write!(f, "{}", label)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientRateLimited, message)
    }

    pub fn quota_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExhausted, message)
    }

    pub fn content_blocked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContentSafetyBlocked, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerTransient, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderUnavailable, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "generation cancelled")
    }

    /// Network-level failure before any HTTP status was received.
    pub fn from_transport(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::transient(format!("request timed out: {}", error))
        } else {
            Self::transient(format!("request failed: {}", error))
        }
    }
}

/// Substrings observed in provider error bodies. Matching is case-insensitive.
/// Providers change their wording without notice, so these live in config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPhrases {
    pub quota_exhausted: Vec<String>,
    pub rate_limited: Vec<String>,
    pub signature_invalid: Vec<String>,
    pub model_not_found: Vec<String>,
    pub content_blocked: Vec<String>,
    pub unsupported_field: Vec<String>,
}

fn phrases(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for ErrorPhrases {
    fn default() -> Self {
        Self {
            quota_exhausted: phrases(&[
                "limit: 0",
                "exceeded your current quota",
                "quota exceeded",
                "daily quota",
                "per day",
                "account balance not enough",
                "insufficient credit",
            ]),
            rate_limited: phrases(&[
                "rate limit",
                "too many requests",
                "resource_exhausted",
                "resource has been exhausted",
                "throttl",
            ]),
            signature_invalid: phrases(&[
                "signature is invalid",
                "invalid signature",
                "signature verification failed",
            ]),
            model_not_found: phrases(&[
                "is not found for api version",
                "model not found",
                "is not supported for predict",
                "is not supported for generatecontent",
            ]),
            content_blocked: phrases(&[
                "nsfw",
                "content policy",
                "risk control",
                "responsible ai",
                "safety filter",
            ]),
            unsupported_field: phrases(&[
                "isn't supported by this model",
                "is not supported by this model",
                "unknown name",
            ]),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    phrases: ErrorPhrases,
}

impl ErrorClassifier {
    pub fn new(phrases: ErrorPhrases) -> Self {
        Self { phrases }
    }

    fn matches(list: &[String], lowered: &str) -> bool {
        list.iter()
            .any(|p| !p.is_empty() && lowered.contains(&p.to_ascii_lowercase()))
    }

    /// Maps an HTTP status and body to a taxonomy entry. Body phrases win over
    /// the status code: quota exhaustion is usually reported as a 429 too.
    pub fn classify(&self, status: Option<u16>, body: &str) -> ErrorKind {
        let lowered = body.to_ascii_lowercase();

        if Self::matches(&self.phrases.content_blocked, &lowered) {
            return ErrorKind::ContentSafetyBlocked;
        }
        if Self::matches(&self.phrases.quota_exhausted, &lowered) {
            return ErrorKind::QuotaExhausted;
        }
        if Self::matches(&self.phrases.signature_invalid, &lowered) {
            return ErrorKind::AuthSignatureTransient;
        }
        if status == Some(429) || Self::matches(&self.phrases.rate_limited, &lowered) {
            return ErrorKind::TransientRateLimited;
        }
        if status == Some(404) || Self::matches(&self.phrases.model_not_found, &lowered) {
            return ErrorKind::ModelNotFoundOnTier;
        }

        match status {
            Some(401) | Some(403) => ErrorKind::ProviderUnavailable,
            Some(400) | Some(422) => ErrorKind::InvalidRequest,
            Some(408) | Some(500) | Some(502) | Some(503) | Some(504) => {
                ErrorKind::ServerTransient
            }
            _ => ErrorKind::Unknown,
        }
    }

    pub fn error(&self, status: Option<u16>, body: &str) -> ProviderError {
        let kind = self.classify(status, body);
        let truncated: String = body.chars().take(500).collect();
        let error = ProviderError::new(kind, truncated);
        match status {
            Some(code) => error.with_status(code),
            None => error,
        }
    }

    pub fn mentions_unsupported_field(&self, message: &str) -> bool {
        Self::matches(&self.phrases.unsupported_field, &message.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
            jitter_max: Duration::from_millis(1000),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        let jitter_ms = self.jitter_max.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        base + Duration::from_millis(jitter)
    }
}

/// Sleeps unless the token fires first.
pub async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), ProviderError> {
    if cancel.is_cancelled() {
        return Err(ProviderError::cancelled());
    }
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(ProviderError::cancelled()),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable kind, or the
/// policy's attempt bound is reached. The closure receives the 0-based attempt.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &BackoffPolicy,
    label: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::cancelled());
        }

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.kind.is_retryable() && attempt + 1 < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    target: "mediagen::retry",
                    label,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient failure"
                );
                sleep_or_cancel(delay, cancel).await?;
                attempt += 1;
            }
            Err(e) => {
                debug!(label, attempt = attempt + 1, error = %e, "giving up");
                return Err(e);
            }
        }
    }
}
