use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::catalog::ModelCatalog;
use crate::models::rate_limiter::{RateLimitStatus, RateLimiter};

/// Static association from a logical model id to an alternate provider+model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackMapping {
    pub model_id: String,
    pub primary_provider: String,
    pub fallback_provider: String,
    pub fallback_model_id: String,
    /// Model id billed when the fallback serves the request.
    #[serde(default)]
    pub billing_model_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRouteDecision {
    pub provider: String,
    pub original_model_id: String,
    pub effective_model_id: String,
    pub billing_model_id: String,
    pub is_fallback: bool,
    pub reason: String,
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message} (retry after {retry_after_seconds}s)")]
pub struct RouteError {
    pub both_providers_exhausted: bool,
    pub retry_after_seconds: u64,
    pub message: String,
}

pub struct ProviderRouter {
    limiter: Arc<dyn RateLimiter>,
    catalog: Arc<ModelCatalog>,
    mappings: HashMap<String, FallbackMapping>,
}

impl ProviderRouter {
    pub fn new(
        limiter: Arc<dyn RateLimiter>,
        catalog: Arc<ModelCatalog>,
        mappings: Vec<FallbackMapping>,
    ) -> Self {
        let mappings = mappings
            .into_iter()
            .map(|m| (m.model_id.clone(), m))
            .collect();
        Self {
            limiter,
            catalog,
            mappings,
        }
    }

    pub fn mapping_for(&self, model_id: &str) -> Option<&FallbackMapping> {
        self.mappings.get(model_id)
    }

    fn scope_for(&self, model_id: &str) -> &'static str {
        self.catalog
            .get(model_id)
            .map(|m| m.kind.scope())
            .unwrap_or("generation")
    }

    /// Fast path on the temporary block flag, live capacity check otherwise.
    /// Capacity is only consumed when `consume` is set.
    async fn check_provider(&self, provider: &str, scope: &str, consume: bool) -> RateLimitStatus {
        if self.limiter.is_temporarily_blocked(provider, scope).await {
            let remaining = self.limiter.remaining_block_time(provider, scope).await;
            return RateLimitStatus::denied(format!(
                "{} temporarily blocked for {}s",
                provider, remaining
            ))
            .retry_after(remaining);
        }

        if consume {
            self.limiter.can_accept_request(provider, scope).await
        } else {
            self.limiter.has_capacity(provider, scope).await
        }
    }

    /// Picks the provider for a request about to be sent, taking one permit
    /// from the chosen provider's limiter.
    pub async fn determine_provider_route(
        &self,
        model_id: &str,
    ) -> Result<ProviderRouteDecision, RouteError> {
        self.resolve(model_id, true).await
    }

    /// The decision `determine_provider_route` would make now, without
    /// consuming rate-limit capacity.
    pub async fn preview_route(&self, model_id: &str) -> Result<ProviderRouteDecision, RouteError> {
        self.resolve(model_id, false).await
    }

    async fn resolve(
        &self,
        model_id: &str,
        consume: bool,
    ) -> Result<ProviderRouteDecision, RouteError> {
        let Some(mapping) = self.mappings.get(model_id) else {
            let provider = self
                .catalog
                .get(model_id)
                .map(|m| m.provider.clone())
                .unwrap_or_default();
            debug!(model = model_id, %provider, "no fallback mapping, routing as-is");
            return Ok(ProviderRouteDecision {
                provider,
                original_model_id: model_id.to_string(),
                effective_model_id: model_id.to_string(),
                billing_model_id: model_id.to_string(),
                is_fallback: false,
                reason: "no fallback mapping".to_string(),
            });
        };

        let scope = self.scope_for(model_id);
        let primary = self
            .check_provider(&mapping.primary_provider, scope, consume)
            .await;
        if primary.allowed {
            debug!(
                model = model_id,
                provider = %mapping.primary_provider,
                "primary provider available"
            );
            return Ok(ProviderRouteDecision {
                provider: mapping.primary_provider.clone(),
                original_model_id: model_id.to_string(),
                effective_model_id: model_id.to_string(),
                billing_model_id: model_id.to_string(),
                is_fallback: false,
                reason: "primary provider available".to_string(),
            });
        }

        let primary_reason = primary
            .reason
            .clone()
            .unwrap_or_else(|| format!("{} unavailable", mapping.primary_provider));

        let fallback_scope = self.scope_for(&mapping.fallback_model_id);
        let fallback = self
            .check_provider(&mapping.fallback_provider, fallback_scope, consume)
            .await;
        if fallback.allowed {
            info!(
                model = model_id,
                primary = %mapping.primary_provider,
                fallback = %mapping.fallback_provider,
                fallback_model = %mapping.fallback_model_id,
                reason = %primary_reason,
                "routing to fallback provider"
            );
            return Ok(ProviderRouteDecision {
                provider: mapping.fallback_provider.clone(),
                original_model_id: model_id.to_string(),
                effective_model_id: mapping.fallback_model_id.clone(),
                billing_model_id: mapping
                    .billing_model_id
                    .clone()
                    .unwrap_or_else(|| mapping.fallback_model_id.clone()),
                is_fallback: true,
                reason: format!("{}: {}", mapping.primary_provider, primary_reason),
            });
        }

        let retry_after_seconds = primary
            .retry_after_seconds
            .min(fallback.retry_after_seconds);
        warn!(
            model = model_id,
            primary = %mapping.primary_provider,
            fallback = %mapping.fallback_provider,
            retry_after_seconds,
            "both providers unavailable"
        );

        Err(RouteError {
            both_providers_exhausted: true,
            retry_after_seconds,
            message: format!(
                "{} and {} are both unavailable ({}; {})",
                mapping.primary_provider,
                mapping.fallback_provider,
                primary_reason,
                fallback
                    .reason
                    .unwrap_or_else(|| format!("{} unavailable", mapping.fallback_provider)),
            ),
        })
    }

    /// For a model currently served by its fallback, whether the primary has
    /// become available again. Read-only: no capacity is consumed.
    pub async fn should_route_back_to_primary(&self, model_id: &str) -> bool {
        let Some(mapping) = self.mappings.get(model_id) else {
            return false;
        };
        let scope = self.scope_for(model_id);
        let status = self
            .check_provider(&mapping.primary_provider, scope, false)
            .await;
        if status.allowed {
            info!(
                model = model_id,
                provider = %mapping.primary_provider,
                "primary provider available again"
            );
        }
        status.allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::catalog::{GEMINI_IMAGE_MODEL, KLING_VIDEO_MODEL, MARKETPLACE_IMAGE_MODEL};
    use crate::models::rate_limiter::{InMemoryRateLimiter, ProviderLimits};
    use std::time::Duration;

    fn mapping() -> FallbackMapping {
        FallbackMapping {
            model_id: GEMINI_IMAGE_MODEL.to_string(),
            primary_provider: "google".to_string(),
            fallback_provider: "replicate".to_string(),
            fallback_model_id: MARKETPLACE_IMAGE_MODEL.to_string(),
            billing_model_id: Some("nano-banana-replicate".to_string()),
        }
    }

    fn router(limiter: Arc<InMemoryRateLimiter>) -> ProviderRouter {
        ProviderRouter::new(limiter, Arc::new(ModelCatalog::builtin()), vec![mapping()])
    }

    #[tokio::test]
    async fn test_unmapped_model_routes_as_is() {
        let limiter = Arc::new(InMemoryRateLimiter::default());
        limiter.block("kling", "videos", Duration::from_secs(60), "blocked");
        let router = router(limiter);

        let decision = router.determine_provider_route(KLING_VIDEO_MODEL).await.unwrap();
        assert!(!decision.is_fallback);
        assert_eq!(decision.effective_model_id, decision.original_model_id);
        assert_eq!(decision.provider, "kling");
    }

    #[tokio::test]
    async fn test_primary_available() {
        let router = router(Arc::new(InMemoryRateLimiter::default()));
        let decision = router.determine_provider_route(GEMINI_IMAGE_MODEL).await.unwrap();
        assert!(!decision.is_fallback);
        assert_eq!(decision.provider, "google");
        assert_eq!(decision.effective_model_id, GEMINI_IMAGE_MODEL);
    }

    #[tokio::test]
    async fn test_primary_blocked_routes_to_fallback() {
        let limiter = Arc::new(InMemoryRateLimiter::default());
        limiter.block("google", "images", Duration::from_secs(300), "daily quota");
        let router = router(limiter);

        let decision = router.determine_provider_route(GEMINI_IMAGE_MODEL).await.unwrap();
        assert!(decision.is_fallback);
        assert_eq!(decision.provider, "replicate");
        assert_eq!(decision.effective_model_id, MARKETPLACE_IMAGE_MODEL);
        assert_eq!(decision.billing_model_id, "nano-banana-replicate");
        assert!(decision.reason.contains("google"));
        assert_eq!(decision.original_model_id, GEMINI_IMAGE_MODEL);
    }

    #[tokio::test]
    async fn test_primary_capacity_denied_routes_to_fallback() {
        let limiter = Arc::new(InMemoryRateLimiter::default().with_provider_limits(
            "google",
            ProviderLimits {
                requests_per_minute: 0,
                burst: 1,
            },
        ));
        let router = router(limiter);

        assert!(!router.determine_provider_route(GEMINI_IMAGE_MODEL).await.unwrap().is_fallback);
        assert!(router.determine_provider_route(GEMINI_IMAGE_MODEL).await.unwrap().is_fallback);
    }

    #[tokio::test]
    async fn test_both_blocked_returns_min_retry_after() {
        let limiter = Arc::new(InMemoryRateLimiter::default());
        limiter.block("google", "images", Duration::from_secs(600), "quota");
        limiter.block("replicate", "images", Duration::from_secs(90), "quota");
        let router = router(limiter.clone());

        let err = router.determine_provider_route(GEMINI_IMAGE_MODEL).await.unwrap_err();
        assert!(err.both_providers_exhausted);
        let google = limiter.remaining_block_time("google", "images").await;
        let replicate = limiter.remaining_block_time("replicate", "images").await;
        assert_eq!(err.retry_after_seconds, google.min(replicate));
        assert!(err.retry_after_seconds <= 90);
    }

    #[tokio::test]
    async fn test_route_back_check() {
        let limiter = Arc::new(InMemoryRateLimiter::default());
        limiter.block("google", "images", Duration::from_secs(60), "quota");
        let router = router(limiter.clone());

        assert!(!router.should_route_back_to_primary(GEMINI_IMAGE_MODEL).await);
        limiter.unblock("google", "images");
        assert!(router.should_route_back_to_primary(GEMINI_IMAGE_MODEL).await);
        assert!(!router.should_route_back_to_primary(KLING_VIDEO_MODEL).await);
    }

    fn single_permit(provider: &str) -> Arc<InMemoryRateLimiter> {
        Arc::new(InMemoryRateLimiter::default().with_provider_limits(
            provider,
            ProviderLimits {
                requests_per_minute: 0,
                burst: 1,
            },
        ))
    }

    #[tokio::test]
    async fn test_route_back_and_preview_leave_capacity_alone() {
        let router = router(single_permit("google"));

        assert!(router.should_route_back_to_primary(GEMINI_IMAGE_MODEL).await);
        assert!(router.should_route_back_to_primary(GEMINI_IMAGE_MODEL).await);
        assert_eq!(router.preview_route(GEMINI_IMAGE_MODEL).await.unwrap().provider, "google");
        assert_eq!(router.preview_route(GEMINI_IMAGE_MODEL).await.unwrap().provider, "google");

        let decision = router.determine_provider_route(GEMINI_IMAGE_MODEL).await.unwrap();
        assert_eq!(decision.provider, "google");
        assert!(!decision.is_fallback);

        // the one permit is now spent
        assert!(!router.should_route_back_to_primary(GEMINI_IMAGE_MODEL).await);
        assert!(router.preview_route(GEMINI_IMAGE_MODEL).await.unwrap().is_fallback);
    }

    #[tokio::test]
    async fn test_fallback_check_consumes_only_the_fallback() {
        let limiter = Arc::new(
            InMemoryRateLimiter::default()
                .with_provider_limits(
                    "google",
                    ProviderLimits {
                        requests_per_minute: 0,
                        burst: 1,
                    },
                )
                .with_provider_limits(
                    "replicate",
                    ProviderLimits {
                        requests_per_minute: 30,
                        burst: 1,
                    },
                ),
        );
        let router = router(limiter);

        assert!(!router.determine_provider_route(GEMINI_IMAGE_MODEL).await.unwrap().is_fallback);
        assert!(router.determine_provider_route(GEMINI_IMAGE_MODEL).await.unwrap().is_fallback);

        // both out of capacity, neither blocked: wait for the faster refill
        let err = router.determine_provider_route(GEMINI_IMAGE_MODEL).await.unwrap_err();
        assert!(err.both_providers_exhausted);
        assert!((1..=2).contains(&err.retry_after_seconds));
    }
}
