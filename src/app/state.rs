use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::app::config::{AppConfig, ProviderConfig};
use crate::error::{Error, Result};
use crate::models::adapter::ModelAdapter;
use crate::models::catalog::{
    CompletionMode, ModelCatalog, ModelConfig, GEMINI_IMAGE_MODEL, KLING_VIDEO_MODEL,
    MARKETPLACE_IMAGE_MODEL, VEO_VIDEO_MODEL,
};
use crate::models::gemini::{GeminiTier, GenerationTier, TieredImageAdapter, DEVELOPER_API_BASE_URL};
use crate::models::kling::{self, HttpKlingApi, KlingAdapter};
use crate::models::orchestrator::Orchestrator;
use crate::models::replicate::{self, HttpPredictionApi, MarketplaceTier, PredictionApi};
use crate::models::router::ProviderRouter;
use crate::models::token::TokenSigner;
use crate::models::veo::{HttpVeoApi, VeoAdapter, VeoApi};
use crate::models::webhook::WebhookSubmitter;

/// Which provider and tiers serve a catalog model in this configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelServing {
    pub model_id: String,
    pub display_name: String,
    pub provider: String,
    pub completion: String,
    /// An adapter, or for webhook models the submitter, is registered.
    pub registered: bool,
    /// Empty when no credentials are configured for the model.
    pub tiers: Vec<String>,
}

pub struct AppState {
    config: AppConfig,
    orchestrator: Orchestrator,
    tiers: BTreeMap<String, Vec<String>>,
}

fn http_client(provider: &ProviderConfig) -> Result<Client> {
    Ok(Client::builder().timeout(provider.timeout()).build()?)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self> {
        info!(
            providers = ?config.get_enabled_providers(),
            "Initializing application state"
        );
        config.validate()?;

        let catalog = Arc::new(ModelCatalog::builtin());
        let limiter = Arc::new(config.to_rate_limiter());
        let router = ProviderRouter::new(
            limiter.clone(),
            catalog.clone(),
            config.fallbacks.clone(),
        );

        let mut orchestrator = Orchestrator::new(catalog.clone(), router)
            .with_quota_reporter(limiter, config.quota_block());
        let mut tiers = BTreeMap::new();

        let replicate_api = Self::replicate_api(&config)?;

        let mut adapters: Vec<(&str, Arc<dyn ModelAdapter>, Vec<String>)> = Vec::new();
        if let Some(adapter) = Self::kling_adapter(&config, &catalog)? {
            adapters.push((KLING_VIDEO_MODEL, adapter, vec!["kling".to_string()]));
        }
        let gemini = Self::gemini_adapter(&config, &catalog, replicate_api.clone())?;
        if let Some((adapter, names)) = gemini {
            adapters.push((GEMINI_IMAGE_MODEL, adapter, names));
        }
        let marketplace = Self::marketplace_adapter(&config, &catalog, replicate_api.clone());
        if let Some((adapter, names)) = marketplace {
            adapters.push((MARKETPLACE_IMAGE_MODEL, adapter, names));
        }
        if let Some((adapter, names)) = Self::veo_adapter(&config, &catalog)? {
            adapters.push((VEO_VIDEO_MODEL, adapter, names));
        }

        for (model_id, adapter, names) in adapters {
            debug!(model = model_id, tiers = ?names, "registered adapter");
            tiers.insert(model_id.to_string(), names);
            orchestrator = orchestrator.with_adapter(model_id, adapter);
        }

        if let (Some(callback), Some(api)) = (&config.webhook.callback_url, replicate_api) {
            let submitter = WebhookSubmitter::new(api, callback, config.classifier_for("replicate"))
                .map_err(|e| Error::validation(e.to_string()))?
                .with_events(config.webhook.events.clone());
            info!(callback = %submitter.callback_url(), "webhook submission enabled");
            orchestrator = orchestrator.with_webhook(Arc::new(submitter));
        }

        info!(adapters = tiers.len(), "Application state initialized");
        Ok(Self {
            config,
            orchestrator,
            tiers,
        })
    }

    fn model(catalog: &ModelCatalog, model_id: &str) -> Result<ModelConfig> {
        catalog
            .get(model_id)
            .cloned()
            .ok_or_else(|| {
                Error::unknown(format!("{} missing from the builtin catalog", model_id))
            })
    }

    fn replicate_api(config: &AppConfig) -> Result<Option<Arc<dyn PredictionApi>>> {
        let Some(provider) = config.provider("replicate") else {
            return Ok(None);
        };
        let Some(token) = non_empty(&provider.api_key) else {
            return Ok(None);
        };

        let base_url = provider.base_url.as_deref().unwrap_or(replicate::DEFAULT_BASE_URL);
        let api: Arc<dyn PredictionApi> = Arc::new(HttpPredictionApi::new(
            http_client(provider)?,
            base_url,
            token,
            config.classifier_for("replicate"),
        ));
        Ok(Some(api))
    }

    /// Registered even without keys; it then fails fast as unavailable.
    fn kling_adapter(
        config: &AppConfig,
        catalog: &ModelCatalog,
    ) -> Result<Option<Arc<dyn ModelAdapter>>> {
        let Some(provider) = config.provider("kling") else {
            return Ok(None);
        };

        let classifier = config.classifier_for("kling");
        let base_url = provider.base_url.as_deref().unwrap_or(kling::DEFAULT_BASE_URL);
        let api = HttpKlingApi::new(http_client(provider)?, base_url, classifier.clone());
        let signer = TokenSigner::new(
            provider.access_key.clone().unwrap_or_default(),
            provider.secret_key.clone().unwrap_or_default(),
        )
        .with_ttl(config.kling_token_ttl());
        if !signer.is_configured() {
            warn!("Kling access/secret keys are not configured");
        }

        let adapter: Arc<dyn ModelAdapter> = Arc::new(KlingAdapter::new(
            Arc::new(api),
            signer,
            Self::model(catalog, KLING_VIDEO_MODEL)?,
            config.to_kling_settings(),
            config.to_backoff_policy(),
            classifier,
        ));
        Ok(Some(adapter))
    }

    fn gemini_adapter(
        config: &AppConfig,
        catalog: &ModelCatalog,
        replicate_api: Option<Arc<dyn PredictionApi>>,
    ) -> Result<Option<(Arc<dyn ModelAdapter>, Vec<String>)>> {
        let model = Self::model(catalog, GEMINI_IMAGE_MODEL)?;
        let classifier = config.classifier_for("google");
        let mut tiers: Vec<Arc<dyn GenerationTier>> = Vec::new();

        if let Some(google) = config.provider("google") {
            let client = http_client(google)?;
            let vertex = (non_empty(&google.project), non_empty(&google.access_token));
            if let (Some(project), Some(token)) = vertex {
                let location = google.location.as_deref().unwrap_or("us-central1");
                tiers.push(Arc::new(GeminiTier::vertex(
                    client.clone(),
                    project,
                    location,
                    token,
                    model.upstream_model(),
                    classifier.clone(),
                )));
            }
            if let Some(key) = non_empty(&google.api_key) {
                let base_url = google.base_url.as_deref().unwrap_or(DEVELOPER_API_BASE_URL);
                tiers.push(Arc::new(GeminiTier::developer_api(
                    client,
                    base_url,
                    key,
                    model.upstream_model(),
                    classifier.clone(),
                )));
            }
        }

        if let Some(api) = replicate_api {
            let marketplace = Self::model(catalog, MARKETPLACE_IMAGE_MODEL)?;
            tiers.push(Arc::new(MarketplaceTier::new(
                api,
                marketplace.upstream_model(),
                config.to_marketplace_settings(),
                config.classifier_for("replicate"),
            )));
        }

        if tiers.is_empty() {
            warn!("No Gemini image tiers are configured");
            return Ok(None);
        }

        let adapter = TieredImageAdapter::new("google", model, tiers, config.to_tier_settings());
        let names: Vec<String> = adapter.tier_names().into_iter().map(String::from).collect();
        let adapter: Arc<dyn ModelAdapter> = Arc::new(adapter);
        Ok(Some((adapter, names)))
    }

    fn marketplace_adapter(
        config: &AppConfig,
        catalog: &ModelCatalog,
        replicate_api: Option<Arc<dyn PredictionApi>>,
    ) -> Option<(Arc<dyn ModelAdapter>, Vec<String>)> {
        let api = replicate_api?;
        let model = catalog.get(MARKETPLACE_IMAGE_MODEL)?.clone();
        let tier: Arc<dyn GenerationTier> = Arc::new(MarketplaceTier::new(
            api,
            model.upstream_model(),
            config.to_marketplace_settings(),
            config.classifier_for("replicate"),
        ));

        let adapter =
            TieredImageAdapter::new("replicate", model, vec![tier], config.to_tier_settings());
        let names: Vec<String> = adapter.tier_names().into_iter().map(String::from).collect();
        let adapter: Arc<dyn ModelAdapter> = Arc::new(adapter);
        Some((adapter, names))
    }

    fn veo_adapter(
        config: &AppConfig,
        catalog: &ModelCatalog,
    ) -> Result<Option<(Arc<dyn ModelAdapter>, Vec<String>)>> {
        let Some(google) = config.provider("google") else {
            return Ok(None);
        };

        let classifier = config.classifier_for("google");
        let client = http_client(google)?;
        let mut tiers: Vec<Arc<dyn VeoApi>> = Vec::new();

        let vertex = (non_empty(&google.project), non_empty(&google.access_token));
        if let (Some(project), Some(token)) = vertex {
            let location = google.location.as_deref().unwrap_or("us-central1");
            tiers.push(Arc::new(HttpVeoApi::vertex(
                client.clone(),
                project,
                location,
                token,
                classifier.clone(),
            )));
        }
        if let Some(key) = non_empty(&google.api_key) {
            let base_url = google.base_url.as_deref().unwrap_or(DEVELOPER_API_BASE_URL);
            tiers.push(Arc::new(HttpVeoApi::developer_api(
                client,
                base_url,
                key,
                classifier.clone(),
            )));
        }

        if tiers.is_empty() {
            warn!("No Veo tiers are configured");
            return Ok(None);
        }

        let names: Vec<String> = tiers.iter().map(|t| t.name().to_string()).collect();
        let adapter: Arc<dyn ModelAdapter> = Arc::new(VeoAdapter::new(
            tiers,
            Self::model(catalog, VEO_VIDEO_MODEL)?,
            config.to_veo_settings(),
            classifier,
        ));
        Ok(Some((adapter, names)))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn serving(&self) -> Vec<ModelServing> {
        self.orchestrator
            .catalog()
            .iter()
            .map(|model| ModelServing {
                model_id: model.id.clone(),
                display_name: model.display_name.clone(),
                provider: model.provider.clone(),
                completion: format!("{:?}", model.completion),
                registered: match model.completion {
                    CompletionMode::Webhook => self.orchestrator.webhook().is_some(),
                    _ => self.orchestrator.has_adapter(&model.id),
                },
                tiers: self.tiers.get(&model.id).cloned().unwrap_or_default(),
            })
            .collect()
    }
}
