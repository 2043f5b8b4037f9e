use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::info;
use url::Url;

use crate::error::{Error, Result};
use crate::models::catalog::{GEMINI_IMAGE_MODEL, MARKETPLACE_IMAGE_MODEL};
use crate::models::gemini::TierSettings;
use crate::models::kling::KlingSettings;
use crate::models::rate_limiter::{InMemoryRateLimiter, ProviderLimits};
use crate::models::replicate::{MarketplaceSettings, WebhookEventKind};
use crate::models::retry::{BackoffPolicy, ErrorClassifier, ErrorPhrases};
use crate::models::router::FallbackMapping;
use crate::models::veo::VeoSettings;
use crate::platform::AppPaths;

pub const ENV_PREFIX: &str = "MEDIAGEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub fallbacks: Vec<FallbackMapping>,
    pub retry: RetrySettings,
    pub polling: PollSettings,
    /// Keyed by provider; providers without an entry use the built-in phrases.
    pub error_phrases: HashMap<String, ErrorPhrases>,
    pub webhook: WebhookSettings,
    pub rate_limits: RateLimitSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// OAuth bearer token for Vertex AI.
    pub access_token: Option<String>,
    pub project: Option<String>,
    pub location: Option<String>,
    pub timeout_seconds: u64,
}

impl ProviderConfig {
    fn with_timeout(timeout_seconds: u64) -> Self {
        Self {
            enabled: true,
            base_url: None,
            api_key: None,
            access_key: None,
            secret_key: None,
            access_token: None,
            project: None,
            location: None,
            timeout_seconds,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_max_ms: u64,
    pub inter_image_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPollSettings {
    pub interval_seconds: u64,
    pub max_attempts: u32,
    pub submit_signature_attempts: u32,
    pub poll_signature_tolerance: u32,
    /// Lifetime of each signed bearer token.
    pub token_ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPollSettings {
    pub interval_seconds: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSettings {
    pub kling: SignedPollSettings,
    pub veo: OperationPollSettings,
    pub marketplace: OperationPollSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSettings {
    pub callback_url: Option<String>,
    pub events: Vec<WebhookEventKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// How long a provider stays blocked after reporting quota exhaustion.
    pub quota_block_seconds: u64,
    pub default: ProviderLimits,
    pub providers: HashMap<String, ProviderLimits>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert("kling".to_string(), ProviderConfig::with_timeout(30));
        providers.insert(
            "google".to_string(),
            ProviderConfig {
                location: Some("us-central1".to_string()),
                ..ProviderConfig::with_timeout(120)
            },
        );
        providers.insert("replicate".to_string(), ProviderConfig::with_timeout(60));

        let mut error_phrases = HashMap::new();
        for provider in ["kling", "google", "replicate"] {
            error_phrases.insert(provider.to_string(), ErrorPhrases::default());
        }

        Self {
            providers,
            fallbacks: vec![FallbackMapping {
                model_id: GEMINI_IMAGE_MODEL.to_string(),
                primary_provider: "google".to_string(),
                fallback_provider: "replicate".to_string(),
                fallback_model_id: MARKETPLACE_IMAGE_MODEL.to_string(),
                billing_model_id: None,
            }],
            retry: RetrySettings {
                max_attempts: 5,
                base_delay_ms: 1000,
                max_delay_ms: 60_000,
                jitter_max_ms: 1000,
                inter_image_delay_ms: 2000,
            },
            polling: PollSettings {
                kling: SignedPollSettings {
                    interval_seconds: 5,
                    max_attempts: 180,
                    submit_signature_attempts: 3,
                    poll_signature_tolerance: 20,
                    token_ttl_seconds: 1800,
                },
                veo: OperationPollSettings {
                    interval_seconds: 10,
                    max_attempts: 30,
                },
                marketplace: OperationPollSettings {
                    interval_seconds: 2,
                    max_attempts: 150,
                },
            },
            error_phrases,
            webhook: WebhookSettings {
                callback_url: None,
                events: vec![WebhookEventKind::Completed],
            },
            rate_limits: RateLimitSettings {
                quota_block_seconds: 3600,
                default: ProviderLimits::default(),
                providers: HashMap::new(),
            },
        }
    }
}

fn config_error(e: impl std::fmt::Display) -> Error {
    Error::Config(config::ConfigError::Message(e.to_string()))
}

impl AppConfig {
    pub async fn load(paths: &AppPaths) -> Result<Self> {
        Self::load_from(&paths.config_file()).await
    }

    /// Defaults, then the TOML file, then `MEDIAGEN_*` environment variables
    /// (`__` separates nested keys). A missing file is created with defaults.
    pub async fn load_from(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            info!(
                "Config file not found, creating default configuration at {:?}",
                config_file
            );
            Self::default().save_to(config_file).await?;
        }

        info!("Loading configuration from: {:?}", config_file);
        let contents = fs::read_to_string(config_file).await?;

        let layered = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from_str(&contents, FileFormat::Toml))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: AppConfig = layered.try_deserialize()?;
        config.apply_credential_env(|key| std::env::var(key).ok());
        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub async fn save_to(&self, config_file: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", config_file);

        if let Some(parent) = config_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let contents = toml::to_string_pretty(self).map_err(config_error)?;
        fs::write(config_file, contents).await?;

        Ok(())
    }

    /// Well-known credential variables fill in keys the config left empty.
    pub fn apply_credential_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let bindings: [(&str, &str, fn(&mut ProviderConfig) -> &mut Option<String>); 5] = [
            ("kling", "KLING_ACCESS_KEY", |p| &mut p.access_key),
            ("kling", "KLING_SECRET_KEY", |p| &mut p.secret_key),
            ("google", "GEMINI_API_KEY", |p| &mut p.api_key),
            ("google", "VERTEX_ACCESS_TOKEN", |p| &mut p.access_token),
            ("replicate", "REPLICATE_API_TOKEN", |p| &mut p.api_key),
        ];

        for (provider, variable, field) in bindings {
            let Some(value) = lookup(variable).filter(|v| !v.is_empty()) else {
                continue;
            };
            let provider = self
                .providers
                .entry(provider.to_string())
                .or_insert_with(|| ProviderConfig::with_timeout(60));
            let slot = field(provider);
            if slot.as_deref().map_or(true, str::is_empty) {
                *slot = Some(value);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        for mapping in &self.fallbacks {
            if mapping.model_id.is_empty() || mapping.fallback_model_id.is_empty() {
                return Err(Error::validation("Fallback mapping has an empty model id"));
            }
            if mapping.primary_provider == mapping.fallback_provider {
                return Err(Error::validation(format!(
                    "Fallback mapping for {} uses {} as both primary and fallback",
                    mapping.model_id, mapping.primary_provider
                )));
            }
        }

        for (name, provider) in &self.providers {
            if provider.timeout_seconds == 0 {
                return Err(Error::validation(format!("Provider {} has a zero timeout", name)));
            }
            if let Some(base_url) = &provider.base_url {
                Url::parse(base_url).map_err(|e| {
                    Error::validation(format!("Provider {} has an invalid base_url: {}", name, e))
                })?;
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::validation("retry.max_attempts must be at least 1"));
        }
        if self.polling.kling.max_attempts == 0
            || self.polling.veo.max_attempts == 0
            || self.polling.marketplace.max_attempts == 0
        {
            return Err(Error::validation("Poll attempt ceilings must be at least 1"));
        }
        if self.polling.kling.submit_signature_attempts == 0 {
            return Err(Error::validation(
                "polling.kling.submit_signature_attempts must be at least 1",
            ));
        }
        // a token must outlive the poll interval it is signed for
        if self.polling.kling.token_ttl_seconds <= self.polling.kling.interval_seconds {
            return Err(Error::validation(
                "polling.kling.token_ttl_seconds must exceed the poll interval",
            ));
        }

        if let Some(callback) = &self.webhook.callback_url {
            let url = Url::parse(callback)
                .map_err(|e| Error::validation(format!("Invalid webhook callback_url: {}", e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::validation("Webhook callback_url must be http or https"));
            }
        }

        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name).filter(|p| p.enabled)
    }

    pub fn get_enabled_providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .providers
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn classifier_for(&self, provider: &str) -> ErrorClassifier {
        ErrorClassifier::new(self.error_phrases.get(provider).cloned().unwrap_or_default())
    }

    pub fn to_backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter_max: Duration::from_millis(self.retry.jitter_max_ms),
        }
    }

    pub fn to_tier_settings(&self) -> TierSettings {
        TierSettings {
            inter_image_delay: Duration::from_millis(self.retry.inter_image_delay_ms),
            backoff: self.to_backoff_policy(),
        }
    }

    pub fn to_kling_settings(&self) -> KlingSettings {
        let kling = &self.polling.kling;
        KlingSettings {
            poll_interval: Duration::from_secs(kling.interval_seconds),
            max_poll_attempts: kling.max_attempts,
            submit_signature_attempts: kling.submit_signature_attempts,
            poll_signature_tolerance: kling.poll_signature_tolerance,
        }
    }

    pub fn kling_token_ttl(&self) -> Duration {
        Duration::from_secs(self.polling.kling.token_ttl_seconds)
    }

    pub fn to_veo_settings(&self) -> VeoSettings {
        VeoSettings {
            poll_interval: Duration::from_secs(self.polling.veo.interval_seconds),
            max_poll_attempts: self.polling.veo.max_attempts,
            backoff: self.to_backoff_policy(),
        }
    }

    pub fn to_marketplace_settings(&self) -> MarketplaceSettings {
        MarketplaceSettings {
            poll_interval: Duration::from_secs(self.polling.marketplace.interval_seconds),
            max_poll_attempts: self.polling.marketplace.max_attempts,
        }
    }

    pub fn to_rate_limiter(&self) -> InMemoryRateLimiter {
        self.rate_limits
            .providers
            .iter()
            .fold(
                InMemoryRateLimiter::new(self.rate_limits.default.clone()),
                |limiter, (provider, limits)| {
                    limiter.with_provider_limits(provider.clone(), limits.clone())
                },
            )
    }

    pub fn quota_block(&self) -> Duration {
        Duration::from_secs(self.rate_limits.quota_block_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.get_enabled_providers(), vec!["google", "kling", "replicate"]);
        assert_eq!(config.fallbacks.len(), 1);
        assert_eq!(config.polling.kling.max_attempts, 180);
        assert_eq!(config.polling.veo.interval_seconds, 10);
        assert_eq!(config.to_backoff_policy().max_attempts, 5);
        assert_eq!(config.to_tier_settings().inter_image_delay, Duration::from_millis(2000));
        assert_eq!(config.kling_token_ttl(), Duration::from_secs(1800));
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.fallbacks[0].fallback_provider = "google".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.webhook.callback_url = Some("ftp://example.com/hook".to_string());
        assert!(config.validate().is_err());
        config.webhook.callback_url = Some("https://example.com/hook".to_string());
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.polling.veo.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.polling.kling.token_ttl_seconds = config.polling.kling.interval_seconds;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = AppConfig::load_from(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(config.retry, AppConfig::default().retry);
    }

    #[tokio::test]
    async fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[retry]
max_attempts = 3
base_delay_ms = 500
max_delay_ms = 8000
jitter_max_ms = 0
inter_image_delay_ms = 0

[webhook]
callback_url = "https://hooks.example.com/replicate"
events = ["start", "completed"]

[polling.kling]
token_ttl_seconds = 600

[error_phrases.google]
quota_exhausted = ["out of credits"]
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).await.unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.polling.kling.max_attempts, 180);
        assert_eq!(config.kling_token_ttl(), Duration::from_secs(600));
        assert_eq!(
            config.webhook.events,
            vec![WebhookEventKind::Start, WebhookEventKind::Completed]
        );
        assert_eq!(
            config.error_phrases["google"].quota_exhausted,
            vec!["out of credits".to_string()]
        );
    }

    #[tokio::test]
    async fn test_save_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.rate_limits.quota_block_seconds = 120;
        config.save_to(&path).await.unwrap();

        let loaded = AppConfig::load_from(&path).await.unwrap();
        assert_eq!(loaded.rate_limits.quota_block_seconds, 120);
    }

    #[test]
    fn test_credential_env_fills_empty_keys() {
        let mut config = AppConfig::default();
        config.providers.get_mut("replicate").unwrap().api_key = Some("from-file".to_string());

        config.apply_credential_env(|key| match key {
            "KLING_ACCESS_KEY" => Some("ak".to_string()),
            "KLING_SECRET_KEY" => Some("sk".to_string()),
            "REPLICATE_API_TOKEN" => Some("from-env".to_string()),
            _ => None,
        });

        let kling = config.provider("kling").unwrap();
        assert_eq!(kling.access_key.as_deref(), Some("ak"));
        assert_eq!(kling.secret_key.as_deref(), Some("sk"));
        assert_eq!(
            config.provider("replicate").unwrap().api_key.as_deref(),
            Some("from-file")
        );
        assert!(config.provider("google").unwrap().api_key.is_none());
    }

    #[test]
    fn test_classifier_uses_provider_phrases() {
        let mut config = AppConfig::default();
        config
            .error_phrases
            .get_mut("kling")
            .unwrap()
            .quota_exhausted = vec!["balance not enough".to_string()];
        let classifier = config.classifier_for("kling");
        assert_eq!(
            classifier.classify(Some(429), "Account balance not enough"),
            crate::models::retry::ErrorKind::QuotaExhausted
        );
    }
}
