use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::adapter::ModelAdapter;
use crate::models::catalog::{CompletionMode, ModelCatalog};
use crate::models::rate_limiter::QuotaReporter;
use crate::models::retry::{ErrorKind, ProviderError};
use crate::models::router::{ProviderRouteDecision, ProviderRouter, RouteError};
use crate::models::types::{GenerationRequest, GenerationResult};
use crate::models::webhook::{WebhookSubmission, WebhookSubmitter};

/// Outcome of one request, with the route that served it for billing
/// attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratedGeneration {
    pub request_id: String,
    pub result: GenerationResult,
    pub route: Option<ProviderRouteDecision>,
    pub route_error: Option<RouteError>,
    pub elapsed_ms: u64,
}

pub struct Orchestrator {
    catalog: Arc<ModelCatalog>,
    router: ProviderRouter,
    adapters: HashMap<String, Arc<dyn ModelAdapter>>,
    webhook: Option<Arc<WebhookSubmitter>>,
    quota_reporter: Option<Arc<dyn QuotaReporter>>,
    quota_block: Duration,
}

impl Orchestrator {
    pub fn new(catalog: Arc<ModelCatalog>, router: ProviderRouter) -> Self {
        Self {
            catalog,
            router,
            adapters: HashMap::new(),
            webhook: None,
            quota_reporter: None,
            quota_block: Duration::from_secs(3600),
        }
    }

    pub fn with_adapter(
        mut self,
        model_id: impl Into<String>,
        adapter: Arc<dyn ModelAdapter>,
    ) -> Self {
        self.adapters.insert(model_id.into(), adapter);
        self
    }

    pub fn with_webhook(mut self, webhook: Arc<WebhookSubmitter>) -> Self {
        self.webhook = Some(webhook);
        self
    }

    /// Providers that report quota exhaustion get blocked for `block_for`.
    pub fn with_quota_reporter(
        mut self,
        reporter: Arc<dyn QuotaReporter>,
        block_for: Duration,
    ) -> Self {
        self.quota_reporter = Some(reporter);
        self.quota_block = block_for;
        self
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn has_adapter(&self, model_id: &str) -> bool {
        self.adapters.contains_key(model_id)
    }

    /// Where a request for `model_id` would go right now. Does not consume
    /// rate-limit capacity; only `generate` does.
    pub async fn route(&self, model_id: &str) -> Result<ProviderRouteDecision, RouteError> {
        self.router.preview_route(model_id).await
    }

    fn scope_for(&self, model_id: &str) -> &'static str {
        self.catalog
            .get(model_id)
            .map(|m| m.kind.scope())
            .unwrap_or("generation")
    }

    async fn run_route(
        &self,
        request: &GenerationRequest,
        route: &ProviderRouteDecision,
        cancel: &CancellationToken,
    ) -> GenerationResult {
        let Some(config) = self.catalog.get(&route.effective_model_id) else {
            return GenerationResult::failed(
                ErrorKind::InvalidRequest,
                format!("unknown model {}", route.effective_model_id),
            );
        };

        let Some(adapter) = self.adapters.get(&route.effective_model_id) else {
            if config.completion == CompletionMode::Webhook {
                return GenerationResult::failed(
                    ErrorKind::InvalidRequest,
                    format!(
                        "{} completes by webhook; submit it with a callback instead",
                        config.id
                    ),
                );
            }
            return GenerationResult::failed(
                ErrorKind::ProviderUnavailable,
                format!("no adapter is configured for {}", route.effective_model_id),
            );
        };

        if route.is_fallback {
            adapter
                .generate(&request.routed_to(&route.effective_model_id), cancel)
                .await
        } else {
            adapter.generate(request, cancel).await
        }
    }

    fn report_quota(&self, route: &ProviderRouteDecision) {
        if let Some(reporter) = &self.quota_reporter {
            let scope = self.scope_for(&route.effective_model_id);
            reporter.report_quota_exhausted(&route.provider, scope, self.quota_block);
        }
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> OrchestratedGeneration {
        let started = Instant::now();
        let finish = |result: GenerationResult,
                      route: Option<ProviderRouteDecision>,
                      route_error: Option<RouteError>| {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                GenerationResult::Completed { outputs, .. } => info!(
                    request_id = %request.id,
                    model = %request.model_id,
                    provider = route.as_ref().map(|r| r.provider.as_str()).unwrap_or(""),
                    outputs = outputs.len(),
                    elapsed_ms,
                    "generation completed"
                ),
                GenerationResult::Failed { error, message } => warn!(
                    request_id = %request.id,
                    model = %request.model_id,
                    kind = ?error,
                    elapsed_ms,
                    "generation failed: {}",
                    message
                ),
            }
            OrchestratedGeneration {
                request_id: request.id.clone(),
                result,
                route,
                route_error,
                elapsed_ms,
            }
        };

        let route = match self.router.determine_provider_route(&request.model_id).await {
            Ok(route) => route,
            Err(e) => {
                let result =
                    GenerationResult::failed(ErrorKind::BothProvidersExhausted, e.to_string());
                return finish(result, None, Some(e));
            }
        };

        let result = self.run_route(request, &route, cancel).await;
        if result.error_kind() != Some(ErrorKind::QuotaExhausted) {
            return finish(result, Some(route), None);
        }

        self.report_quota(&route);

        // One reroute: with the primary now blocked the router may pick the fallback.
        if route.is_fallback || self.router.mapping_for(&request.model_id).is_none() {
            return finish(result, Some(route), None);
        }
        match self.router.determine_provider_route(&request.model_id).await {
            Ok(next) if next.is_fallback => {
                info!(
                    request_id = %request.id,
                    from = %route.provider,
                    to = %next.provider,
                    "primary quota exhausted, retrying on fallback"
                );
                let result = self.run_route(request, &next, cancel).await;
                if result.error_kind() == Some(ErrorKind::QuotaExhausted) {
                    self.report_quota(&next);
                }
                finish(result, Some(next), None)
            }
            Ok(_) => finish(result, Some(route), None),
            Err(e) => finish(result, Some(route), Some(e)),
        }
    }

    /// Submits a webhook-completed model. Returns once the provider accepted
    /// the job; the result arrives at the callback URL.
    pub async fn submit_with_webhook(
        &self,
        request: &GenerationRequest,
    ) -> Result<WebhookSubmission, ProviderError> {
        let webhook = self
            .webhook
            .as_ref()
            .ok_or_else(|| ProviderError::unavailable("no webhook callback url is configured"))?;
        let config = self.catalog.get(&request.model_id).ok_or_else(|| {
            ProviderError::invalid_request(format!("unknown model {}", request.model_id))
        })?;
        webhook.submit_request(config, request).await
    }

    pub fn webhook(&self) -> Option<&WebhookSubmitter> {
        self.webhook.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::catalog::{
        ModelConfig, FLUX_WEBHOOK_MODEL, GEMINI_IMAGE_MODEL, KLING_VIDEO_MODEL,
        MARKETPLACE_IMAGE_MODEL,
    };
    use crate::models::rate_limiter::{InMemoryRateLimiter, ProviderLimits, RateLimiter};
    use crate::models::replicate::fake::FakePredictionApi;
    use crate::models::retry::ErrorClassifier;
    use crate::models::router::FallbackMapping;
    use crate::models::types::{Generated, Output};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct FixedAdapter {
        config: ModelConfig,
        outcome: Result<Vec<Output>, ProviderError>,
        seen_models: Mutex<Vec<String>>,
    }

    impl FixedAdapter {
        fn new(model_id: &str, outcome: Result<Vec<Output>, ProviderError>) -> Arc<Self> {
            Arc::new(Self {
                config: ModelCatalog::builtin().get(model_id).cloned().unwrap(),
                outcome,
                seen_models: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ModelAdapter for FixedAdapter {
        fn provider_name(&self) -> &str {
            &self.config.provider
        }

        fn model_config(&self) -> &ModelConfig {
            &self.config
        }

        async fn execute(
            &self,
            request: &GenerationRequest,
            _cancel: &CancellationToken,
        ) -> Result<Generated, ProviderError> {
            self.seen_models.lock().push(request.model_id.clone());
            self.outcome.clone().map(Generated::from)
        }
    }

    fn orchestrator(
        limiter: Arc<InMemoryRateLimiter>,
        primary: Arc<FixedAdapter>,
        fallback: Arc<FixedAdapter>,
    ) -> Orchestrator {
        let catalog = Arc::new(ModelCatalog::builtin());
        let router = ProviderRouter::new(
            limiter.clone(),
            catalog.clone(),
            vec![FallbackMapping {
                model_id: GEMINI_IMAGE_MODEL.to_string(),
                primary_provider: "google".to_string(),
                fallback_provider: "replicate".to_string(),
                fallback_model_id: MARKETPLACE_IMAGE_MODEL.to_string(),
                billing_model_id: None,
            }],
        );
        Orchestrator::new(catalog, router)
            .with_adapter(GEMINI_IMAGE_MODEL, primary)
            .with_adapter(MARKETPLACE_IMAGE_MODEL, fallback)
            .with_quota_reporter(limiter, Duration::from_secs(600))
    }

    fn ok(url: &str) -> Result<Vec<Output>, ProviderError> {
        Ok(vec![Output::new(url)])
    }

    #[tokio::test]
    async fn test_primary_serves_request() {
        let limiter = Arc::new(InMemoryRateLimiter::default());
        let primary = FixedAdapter::new(GEMINI_IMAGE_MODEL, ok("https://g.test/1.png"));
        let fallback = FixedAdapter::new(MARKETPLACE_IMAGE_MODEL, ok("https://r.test/1.png"));
        let orchestrator = orchestrator(limiter, primary, fallback.clone());

        let request = GenerationRequest::new(GEMINI_IMAGE_MODEL, "fox");
        let generation = orchestrator.generate(&request, &CancellationToken::new()).await;
        assert_eq!(generation.request_id, request.id);
        assert_eq!(generation.result.outputs()[0].url, "https://g.test/1.png");
        assert!(!generation.route.unwrap().is_fallback);
        assert!(fallback.seen_models.lock().is_empty());
    }

    #[tokio::test]
    async fn test_route_preview_does_not_spend_capacity() {
        let limiter = Arc::new(InMemoryRateLimiter::default().with_provider_limits(
            "google",
            ProviderLimits {
                requests_per_minute: 0,
                burst: 1,
            },
        ));
        let primary = FixedAdapter::new(GEMINI_IMAGE_MODEL, ok("https://g.test/1.png"));
        let fallback = FixedAdapter::new(MARKETPLACE_IMAGE_MODEL, ok("https://r.test/1.png"));
        let orchestrator = orchestrator(limiter, primary.clone(), fallback);

        for _ in 0..3 {
            let preview = orchestrator.route(GEMINI_IMAGE_MODEL).await.unwrap();
            assert_eq!(preview.provider, "google");
        }

        let request = GenerationRequest::new(GEMINI_IMAGE_MODEL, "fox");
        let generation = orchestrator.generate(&request, &CancellationToken::new()).await;
        assert!(!generation.route.unwrap().is_fallback);
        assert_eq!(primary.seen_models.lock().len(), 1);

        assert!(orchestrator.route(GEMINI_IMAGE_MODEL).await.unwrap().is_fallback);
    }

    #[tokio::test]
    async fn test_blocked_primary_uses_fallback_model() {
        let limiter = Arc::new(InMemoryRateLimiter::default());
        limiter.block("google", "images", Duration::from_secs(60), "quota");
        let primary = FixedAdapter::new(GEMINI_IMAGE_MODEL, ok("https://g.test/1.png"));
        let fallback = FixedAdapter::new(MARKETPLACE_IMAGE_MODEL, ok("https://r.test/1.png"));
        let orchestrator = orchestrator(limiter, primary.clone(), fallback.clone());

        let generation = orchestrator
            .generate(&GenerationRequest::new(GEMINI_IMAGE_MODEL, "fox"), &CancellationToken::new())
            .await;
        let route = generation.route.unwrap();
        assert!(route.is_fallback);
        assert_eq!(route.billing_model_id, MARKETPLACE_IMAGE_MODEL);
        assert_eq!(generation.result.outputs()[0].url, "https://r.test/1.png");
        assert!(primary.seen_models.lock().is_empty());
        assert_eq!(*fallback.seen_models.lock(), vec![MARKETPLACE_IMAGE_MODEL.to_string()]);
    }

    #[tokio::test]
    async fn test_both_blocked_is_reported() {
        let limiter = Arc::new(InMemoryRateLimiter::default());
        limiter.block("google", "images", Duration::from_secs(300), "quota");
        limiter.block("replicate", "images", Duration::from_secs(30), "quota");
        let primary = FixedAdapter::new(GEMINI_IMAGE_MODEL, ok("u"));
        let fallback = FixedAdapter::new(MARKETPLACE_IMAGE_MODEL, ok("u"));
        let orchestrator = orchestrator(limiter, primary, fallback);

        let generation = orchestrator
            .generate(&GenerationRequest::new(GEMINI_IMAGE_MODEL, "fox"), &CancellationToken::new())
            .await;
        assert_eq!(generation.result.error_kind(), Some(ErrorKind::BothProvidersExhausted));
        let route_error = generation.route_error.unwrap();
        assert!(route_error.both_providers_exhausted);
        assert!(route_error.retry_after_seconds <= 30);
        assert!(generation.route.is_none());
    }

    #[tokio::test]
    async fn test_quota_exhaustion_blocks_primary_and_reroutes() {
        let limiter = Arc::new(InMemoryRateLimiter::default());
        let primary = FixedAdapter::new(
            GEMINI_IMAGE_MODEL,
            Err(ProviderError::quota_exhausted("all tiers exhausted")),
        );
        let fallback = FixedAdapter::new(MARKETPLACE_IMAGE_MODEL, ok("https://r.test/1.png"));
        let orchestrator = orchestrator(limiter.clone(), primary, fallback);

        let generation = orchestrator
            .generate(&GenerationRequest::new(GEMINI_IMAGE_MODEL, "fox"), &CancellationToken::new())
            .await;
        assert!(generation.result.is_completed());
        assert!(generation.route.unwrap().is_fallback);
        assert!(limiter.is_temporarily_blocked("google", "images").await);
    }

    #[tokio::test]
    async fn test_unmapped_model_without_adapter() {
        let limiter = Arc::new(InMemoryRateLimiter::default());
        let primary = FixedAdapter::new(GEMINI_IMAGE_MODEL, ok("u"));
        let fallback = FixedAdapter::new(MARKETPLACE_IMAGE_MODEL, ok("u"));
        let orchestrator = orchestrator(limiter, primary, fallback);

        let kling = orchestrator
            .generate(&GenerationRequest::new(KLING_VIDEO_MODEL, "x"), &CancellationToken::new())
            .await;
        assert_eq!(kling.result.error_kind(), Some(ErrorKind::ProviderUnavailable));
        assert_eq!(kling.route.unwrap().effective_model_id, KLING_VIDEO_MODEL);

        let flux = orchestrator
            .generate(&GenerationRequest::new(FLUX_WEBHOOK_MODEL, "x"), &CancellationToken::new())
            .await;
        assert_eq!(flux.result.error_kind(), Some(ErrorKind::InvalidRequest));

        let unknown = orchestrator
            .generate(&GenerationRequest::new("nope", "x"), &CancellationToken::new())
            .await;
        assert_eq!(unknown.result.error_kind(), Some(ErrorKind::InvalidRequest));
    }

    #[tokio::test]
    async fn test_webhook_submission() {
        let limiter = Arc::new(InMemoryRateLimiter::default());
        let primary = FixedAdapter::new(GEMINI_IMAGE_MODEL, ok("u"));
        let fallback = FixedAdapter::new(MARKETPLACE_IMAGE_MODEL, ok("u"));
        let without = orchestrator(limiter.clone(), primary.clone(), fallback.clone());
        let request = GenerationRequest::new(FLUX_WEBHOOK_MODEL, "lighthouse");
        assert_eq!(
            without.submit_with_webhook(&request).await.unwrap_err().kind,
            ErrorKind::ProviderUnavailable
        );

        let api = Arc::new(FakePredictionApi::default());
        let webhook =
            WebhookSubmitter::new(api.clone(), "https://hooks.test/cb", ErrorClassifier::default())
                .unwrap();
        let with = orchestrator(limiter, primary, fallback).with_webhook(Arc::new(webhook));
        let submission = with.submit_with_webhook(&request).await.unwrap();
        assert_eq!(submission.prediction_id, "pred-1");
        assert_eq!(api.created.lock().len(), 1);
    }
}
