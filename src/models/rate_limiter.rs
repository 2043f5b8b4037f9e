//! Rate-limit capability consumed by the router, plus an in-process
//! implementation. Production deployments may back the trait with a shared
//! store; the router only ever reads through it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub reason: Option<String>,
    /// When denied, seconds until a request could be admitted again.
    #[serde(default)]
    pub retry_after_seconds: u64,
}

impl RateLimitStatus {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_seconds: 0,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            retry_after_seconds: 0,
        }
    }

    pub fn retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = seconds;
        self
    }
}

/// Whole seconds, rounded up so a 0.4s wait is not reported as free.
fn ceil_secs(duration: Duration) -> u64 {
    if duration.subsec_nanos() > 0 {
        duration.as_secs() + 1
    } else {
        duration.as_secs()
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn is_temporarily_blocked(&self, provider: &str, scope: &str) -> bool;

    /// Seconds until the temporary block lifts; 0 when not blocked.
    async fn remaining_block_time(&self, provider: &str, scope: &str) -> u64;

    /// Admits one request, consuming capacity when allowed.
    async fn can_accept_request(&self, provider: &str, scope: &str) -> RateLimitStatus;

    /// Same answer as `can_accept_request` without consuming anything.
    async fn has_capacity(&self, provider: &str, scope: &str) -> RateLimitStatus;
}

/// Feedback channel for providers that reported quota exhaustion mid-request.
pub trait QuotaReporter: Send + Sync {
    fn report_quota_exhausted(&self, provider: &str, scope: &str, block_for: Duration);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderLimits {
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst: 10,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limits: &ProviderLimits) -> Self {
        let capacity = limits.burst.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: limits.requests_per_minute as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn has_token(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= 1.0
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        if self.has_token(now) {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one whole token is available. A bucket that never refills
    /// reports one minute, the window its limit is expressed in.
    fn until_next_token(&self) -> Duration {
        let deficit = 1.0 - self.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else if self.refill_per_sec <= 0.0 {
            Duration::from_secs(60)
        } else {
            Duration::from_secs_f64(deficit / self.refill_per_sec)
        }
    }
}

#[derive(Debug)]
struct ScopeState {
    bucket: TokenBucket,
    blocked_until: Option<Instant>,
    block_reason: Option<String>,
}

impl ScopeState {
    fn remaining(&self, now: Instant) -> Duration {
        self.blocked_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn admit(
        &mut self,
        provider: &str,
        scope: &str,
        now: Instant,
        consume: bool,
    ) -> RateLimitStatus {
        let blocked = self.remaining(now);
        if !blocked.is_zero() {
            let reason = self
                .block_reason
                .clone()
                .unwrap_or_else(|| format!("{} is temporarily blocked", provider));
            return RateLimitStatus::denied(reason).retry_after(ceil_secs(blocked));
        }

        let admitted = if consume {
            self.bucket.try_consume(now)
        } else {
            self.bucket.has_token(now)
        };
        if admitted {
            if consume {
                debug!(provider, scope, tokens = self.bucket.tokens, "rate limit permit granted");
            }
            RateLimitStatus::allowed()
        } else {
            RateLimitStatus::denied(format!("{} rate limit reached for {}", provider, scope))
                .retry_after(ceil_secs(self.bucket.until_next_token()))
        }
    }
}

/// Token bucket per `(provider, scope)` with a temporary block flag.
#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    limits: HashMap<String, ProviderLimits>,
    default_limits: ProviderLimits,
    state: Mutex<HashMap<(String, String), ScopeState>>,
}

impl InMemoryRateLimiter {
    pub fn new(default_limits: ProviderLimits) -> Self {
        Self {
            limits: HashMap::new(),
            default_limits,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_provider_limits(
        mut self,
        provider: impl Into<String>,
        limits: ProviderLimits,
    ) -> Self {
        self.limits.insert(provider.into(), limits);
        self
    }

    fn limits_for(&self, provider: &str) -> &ProviderLimits {
        self.limits.get(provider).unwrap_or(&self.default_limits)
    }

    fn with_state<R>(
        &self,
        provider: &str,
        scope: &str,
        f: impl FnOnce(&mut ScopeState) -> R,
    ) -> R {
        let mut state = self.state.lock();
        let entry = state
            .entry((provider.to_string(), scope.to_string()))
            .or_insert_with(|| ScopeState {
                bucket: TokenBucket::new(self.limits_for(provider)),
                blocked_until: None,
                block_reason: None,
            });
        f(entry)
    }

    pub fn block(
        &self,
        provider: &str,
        scope: &str,
        duration: Duration,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        warn!(
            provider,
            scope,
            seconds = duration.as_secs(),
            %reason,
            "provider temporarily blocked"
        );
        self.with_state(provider, scope, |s| {
            s.blocked_until = Some(Instant::now() + duration);
            s.block_reason = Some(reason);
        });
    }

    pub fn unblock(&self, provider: &str, scope: &str) {
        info!(provider, scope, "provider block cleared");
        self.with_state(provider, scope, |s| {
            s.blocked_until = None;
            s.block_reason = None;
        });
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn is_temporarily_blocked(&self, provider: &str, scope: &str) -> bool {
        let now = Instant::now();
        self.with_state(provider, scope, |s| !s.remaining(now).is_zero())
    }

    async fn remaining_block_time(&self, provider: &str, scope: &str) -> u64 {
        let now = Instant::now();
        self.with_state(provider, scope, |s| ceil_secs(s.remaining(now)))
    }

    async fn can_accept_request(&self, provider: &str, scope: &str) -> RateLimitStatus {
        let now = Instant::now();
        self.with_state(provider, scope, |s| s.admit(provider, scope, now, true))
    }

    async fn has_capacity(&self, provider: &str, scope: &str) -> RateLimitStatus {
        let now = Instant::now();
        self.with_state(provider, scope, |s| s.admit(provider, scope, now, false))
    }
}

impl QuotaReporter for InMemoryRateLimiter {
    fn report_quota_exhausted(&self, provider: &str, scope: &str, block_for: Duration) {
        self.block(provider, scope, block_for, format!("{} quota exhausted", provider));
    }
}
