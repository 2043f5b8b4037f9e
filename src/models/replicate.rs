//! Prediction marketplace client (Replicate): model version lookup, prediction
//! create/status/cancel, and the marketplace tier used at the end of a
//! fallback chain.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::gemini::GenerationTier;
use crate::models::retry::{sleep_or_cancel, ErrorClassifier, ErrorKind, ProviderError};
use crate::models::types::{GenerationRequest, ImageInput, Output};

pub const DEFAULT_BASE_URL: &str = "https://api.replicate.com/v1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStatus {
    #[default]
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl PredictionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PredictionStatus::Succeeded | PredictionStatus::Failed | PredictionStatus::Canceled
        )
    }
}

/// Lifecycle events a webhook may be filtered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventKind {
    Start,
    Output,
    Logs,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    #[serde(default)]
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl Prediction {
    /// Output may be a single URL, a list of URLs, or objects carrying `url`.
    pub fn output_urls(&self) -> Vec<String> {
        fn collect(value: &Value, urls: &mut Vec<String>) {
            match value {
                Value::String(s) if !s.is_empty() => urls.push(s.clone()),
                Value::Array(items) => items.iter().for_each(|v| collect(v, urls)),
                Value::Object(map) => {
                    if let Some(url) = map.get("url").and_then(Value::as_str) {
                        urls.push(url.to_string());
                    }
                }
                _ => {}
            }
        }

        let mut urls = Vec::new();
        if let Some(output) = &self.output {
            collect(output, &mut urls);
        }
        urls
    }

    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRequest {
    pub version: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub webhook_events_filter: Vec<WebhookEventKind>,
}

/// Network seam for the prediction marketplace.
#[async_trait]
pub trait PredictionApi: Send + Sync {
    /// Resolves `owner/name` to its current version id.
    async fn latest_version(&self, model_path: &str) -> Result<String, ProviderError>;

    async fn create_prediction(
        &self,
        request: &PredictionRequest,
    ) -> Result<Prediction, ProviderError>;

    async fn get_prediction(&self, id: &str) -> Result<Prediction, ProviderError>;

    async fn cancel_prediction(&self, id: &str) -> Result<Prediction, ProviderError>;
}

pub struct HttpPredictionApi {
    client: Client,
    base_url: String,
    token: String,
    classifier: ErrorClassifier,
}

impl HttpPredictionApi {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
        classifier: ErrorClassifier,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            classifier,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ProviderError> {
        let response = builder
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(ProviderError::from_transport)?;
        if !status.is_success() {
            warn!(provider = "replicate", status = status.as_u16(), "prediction API error");
            return Err(self.classifier.error(Some(status.as_u16()), &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| ProviderError::transient(format!("unparseable replicate response: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    latest_version: Option<VersionInfo>,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    id: String,
}

#[async_trait]
impl PredictionApi for HttpPredictionApi {
    async fn latest_version(&self, model_path: &str) -> Result<String, ProviderError> {
        let url = format!("{}/models/{}", self.base_url, model_path);
        let info: ModelInfo = self.send(self.client.get(&url)).await?;
        info.latest_version.map(|v| v.id).ok_or_else(|| {
            ProviderError::new(
                ErrorKind::ModelNotFoundOnTier,
                format!("{} has no published version", model_path),
            )
        })
    }

    async fn create_prediction(
        &self,
        request: &PredictionRequest,
    ) -> Result<Prediction, ProviderError> {
        let url = format!("{}/predictions", self.base_url);
        self.send(self.client.post(&url).json(request)).await
    }

    async fn get_prediction(&self, id: &str) -> Result<Prediction, ProviderError> {
        let url = format!("{}/predictions/{}", self.base_url, id);
        self.send(self.client.get(&url)).await
    }

    async fn cancel_prediction(&self, id: &str) -> Result<Prediction, ProviderError> {
        let url = format!("{}/predictions/{}/cancel", self.base_url, id);
        self.send(self.client.post(&url)).await
    }
}

fn image_reference(image: &ImageInput) -> Option<String> {
    image
        .hosted_url()
        .map(str::to_string)
        .or_else(|| image.payload.as_ref().map(|p| p.to_data_url()))
}

/// Prediction input for a request. `include_count` asks the model for all
/// outputs in one prediction instead of one per call.
pub fn prediction_input(request: &GenerationRequest, include_count: bool) -> Value {
    let params = &request.params;
    let mut input = Map::new();
    input.insert("prompt".to_string(), json!(request.prompt));

    if let Some(ratio) = &params.aspect_ratio {
        input.insert("aspect_ratio".to_string(), json!(ratio));
    }
    if let Some(seed) = params.seed {
        input.insert("seed".to_string(), json!(seed));
    }
    if include_count && params.output_count > 1 {
        input.insert("num_outputs".to_string(), json!(params.output_count));
    }

    let images: Vec<String> = request.reference_images.iter().filter_map(image_reference).collect();
    if !images.is_empty() {
        input.insert("image_input".to_string(), json!(images));
    }

    for (key, value) in &params.extra {
        input.insert(key.clone(), value.clone());
    }

    Value::Object(input)
}

pub fn prediction_error(classifier: &ErrorClassifier, prediction: &Prediction) -> ProviderError {
    let message = prediction
        .error_message()
        .unwrap_or_else(|| format!("prediction {} {:?}", prediction.id, prediction.status));
    let error = classifier.error(None, &message);
    if prediction.status == PredictionStatus::Canceled && error.kind == ErrorKind::Unknown {
        return ProviderError::cancelled();
    }
    error
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketplaceSettings {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

impl Default for MarketplaceSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_poll_attempts: 150,
        }
    }
}

/// Last tier of a fallback chain: the same vendor model served through the
/// marketplace.
pub struct MarketplaceTier {
    api: Arc<dyn PredictionApi>,
    model_path: String,
    settings: MarketplaceSettings,
    classifier: ErrorClassifier,
}

impl MarketplaceTier {
    pub fn new(
        api: Arc<dyn PredictionApi>,
        model_path: impl Into<String>,
        settings: MarketplaceSettings,
        classifier: ErrorClassifier,
    ) -> Self {
        Self {
            api,
            model_path: model_path.into(),
            settings,
            classifier,
        }
    }

    async fn wait_for(
        &self,
        mut prediction: Prediction,
        cancel: &CancellationToken,
    ) -> Result<Prediction, ProviderError> {
        let mut attempt = 0;
        while !prediction.status.is_terminal() {
            if attempt >= self.settings.max_poll_attempts {
                return Err(ProviderError::timeout(format!(
                    "prediction {} did not finish after {} polls",
                    prediction.id, attempt
                )));
            }
            if let Err(e) = sleep_or_cancel(self.settings.poll_interval, cancel).await {
                // best effort, the prediction is billed until it stops
                if let Err(cancel_error) = self.api.cancel_prediction(&prediction.id).await {
                    debug!(
                        provider = "replicate",
                        id = %prediction.id,
                        error = %cancel_error,
                        "cancel failed"
                    );
                }
                return Err(e);
            }
            attempt += 1;
            prediction = match self.api.get_prediction(&prediction.id).await {
                Ok(p) => p,
                Err(e) if e.kind.is_retryable() => {
                    warn!(
                        provider = "replicate",
                        id = %prediction.id,
                        attempt,
                        error = %e,
                        "poll failed, continuing"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!(
                provider = "replicate",
                id = %prediction.id,
                attempt,
                status = ?prediction.status,
                "poll"
            );
        }
        Ok(prediction)
    }
}

#[async_trait]
impl GenerationTier for MarketplaceTier {
    fn name(&self) -> &str {
        "marketplace"
    }

    async fn generate_one(
        &self,
        request: &GenerationRequest,
        _index: u32,
        cancel: &CancellationToken,
    ) -> Result<Output, ProviderError> {
        let version = self.api.latest_version(&self.model_path).await?;
        let created = self
            .api
            .create_prediction(&PredictionRequest {
                version,
                input: prediction_input(request, false),
                webhook: None,
                webhook_events_filter: Vec::new(),
            })
            .await?;
        info!(
            provider = "replicate",
            model = %self.model_path,
            id = %created.id,
            "prediction created"
        );

        let prediction = self.wait_for(created, cancel).await?;
        if prediction.status != PredictionStatus::Succeeded {
            return Err(prediction_error(&self.classifier, &prediction));
        }

        let id = Value::String(prediction.id.clone());
        prediction
            .output_urls()
            .into_iter()
            .next()
            .map(|url| Output::new(url).with_metric("prediction_id", id))
            .ok_or_else(|| {
                ProviderError::transient(format!("prediction {} returned no output", prediction.id))
            })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted marketplace: `create` returns `starting`, polls pop from the
    /// script and default to `processing`.
    #[derive(Default)]
    pub struct FakePredictionApi {
        pub created: Mutex<Vec<PredictionRequest>>,
        pub polls: Mutex<VecDeque<Prediction>>,
        pub cancelled: Mutex<Vec<String>>,
        pub version_lookups: Mutex<u32>,
        pub poll_calls: Mutex<u32>,
        /// Cancels the token once this many polls have been answered.
        pub cancel_after: Mutex<Option<(u32, CancellationToken)>>,
    }

    pub fn prediction(status: PredictionStatus, output: Option<Value>) -> Prediction {
        Prediction {
            id: "pred-1".to_string(),
            status,
            output,
            error: None,
        }
    }

    #[async_trait]
    impl PredictionApi for FakePredictionApi {
        async fn latest_version(&self, _model_path: &str) -> Result<String, ProviderError> {
            *self.version_lookups.lock() += 1;
            Ok("v123".to_string())
        }

        async fn create_prediction(
            &self,
            request: &PredictionRequest,
        ) -> Result<Prediction, ProviderError> {
            self.created.lock().push(request.clone());
            Ok(prediction(PredictionStatus::Starting, None))
        }

        async fn get_prediction(&self, _id: &str) -> Result<Prediction, ProviderError> {
            let calls = {
                let mut calls = self.poll_calls.lock();
                *calls += 1;
                *calls
            };
            if let Some((after, cancel)) = self.cancel_after.lock().as_ref() {
                if calls == *after {
                    cancel.cancel();
                }
            }
            Ok(self
                .polls
                .lock()
                .pop_front()
                .unwrap_or_else(|| prediction(PredictionStatus::Processing, None)))
        }

        async fn cancel_prediction(&self, id: &str) -> Result<Prediction, ProviderError> {
            self.cancelled.lock().push(id.to_string());
            Ok(prediction(PredictionStatus::Canceled, None))
        }
    }
}
