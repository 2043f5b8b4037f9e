use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::adapter::ModelAdapter;
use crate::models::catalog::ModelConfig;
use crate::models::retry::{
    retry_with_backoff, sleep_or_cancel, BackoffPolicy, ErrorClassifier, ErrorKind, ProviderError,
};
use crate::models::types::{
    Generated, GenerationRequest, ImageInput, ImagePayload, Output, PartialFailure,
};

pub const DEVELOPER_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// One ranked option in a fallback chain. Produces a single output per call.
#[async_trait]
pub trait GenerationTier: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_one(
        &self,
        request: &GenerationRequest,
        index: u32,
        cancel: &CancellationToken,
    ) -> Result<Output, ProviderError>;
}

#[derive(Clone)]
enum GeminiAuth {
    Bearer(String),
    ApiKey(String),
}

/// `generateContent` against either Vertex AI (bearer token) or the developer
/// API (API key).
pub struct GeminiTier {
    name: String,
    client: Client,
    endpoint: String,
    auth: GeminiAuth,
    classifier: ErrorClassifier,
}

impl GeminiTier {
    pub fn vertex(
        client: Client,
        project: &str,
        location: &str,
        access_token: impl Into<String>,
        model: &str,
        classifier: ErrorClassifier,
    ) -> Self {
        let host = if location == "global" {
            "aiplatform.googleapis.com".to_string()
        } else {
            format!("{}-aiplatform.googleapis.com", location)
        };
        Self {
            name: "vertex".to_string(),
            client,
            endpoint: format!(
                concat!(
                    "https://{}/v1/projects/{}/locations/{}",
                    "/publishers/google/models/{}:generateContent"
                ),
                host, project, location, model
            ),
            auth: GeminiAuth::Bearer(access_token.into()),
            classifier,
        }
    }

    pub fn developer_api(
        client: Client,
        base_url: &str,
        api_key: impl Into<String>,
        model: &str,
        classifier: ErrorClassifier,
    ) -> Self {
        Self {
            name: "rest".to_string(),
            client,
            endpoint: format!(
                "{}/models/{}:generateContent",
                base_url.trim_end_matches('/'),
                model
            ),
            auth: GeminiAuth::ApiKey(api_key.into()),
            classifier,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn image_part(image: &ImageInput) -> Option<Value> {
    if let Some(payload) = &image.payload {
        return Some(json!({
            "inlineData": {"mimeType": payload.mime_type, "data": payload.data}
        }));
    }
    image.url.as_ref().map(|uri| {
        json!({
            "fileData": {"mimeType": image.mime_type(), "fileUri": uri}
        })
    })
}

pub fn build_body(request: &GenerationRequest) -> Value {
    let mut parts: Vec<Value> = request.reference_images.iter().filter_map(image_part).collect();
    parts.push(json!({"text": request.prompt}));

    let mut generation_config = json!({"responseModalities": ["IMAGE"]});
    if let Some(ratio) = &request.params.aspect_ratio {
        generation_config["imageConfig"] = json!({"aspectRatio": ratio});
    }
    if let Some(seed) = request.params.seed {
        generation_config["seed"] = json!(seed);
    }

    json!({
        "contents": [{"role": "user", "parts": parts}],
        "generationConfig": generation_config,
    })
}

/// Turns a syntactically successful response into an output, or explains why
/// there is none. Block indicators are checked before "no image" is treated as
/// transient.
pub fn inspect_response(response: &Value) -> Result<Output, ProviderError> {
    if let Some(reason) = response
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return Err(ProviderError::content_blocked(format!(
            "prompt blocked: {}",
            reason
        )));
    }

    let candidates = response
        .get("candidates")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let Some(candidate) = candidates.first() else {
        return Err(ProviderError::content_blocked(
            "response contained no candidates",
        ));
    };

    let image = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find_map(|part| part.get("inlineData").or_else(|| part.get("inline_data")));
    if let Some(data) = image.and_then(|d| d.get("data")).and_then(Value::as_str) {
        let mime_type = image
            .and_then(|d| d.get("mimeType").or_else(|| d.get("mime_type")))
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        let payload = ImagePayload {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        };
        return Ok(Output::new(payload.to_data_url()));
    }

    match candidate.get("finishReason").and_then(Value::as_str) {
        Some(reason) if !reason.eq_ignore_ascii_case("STOP") => Err(ProviderError::content_blocked(
            format!("generation stopped: {}", reason),
        )),
        _ => Err(ProviderError::transient("response contained no image")),
    }
}

#[async_trait]
impl GenerationTier for GeminiTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_one(
        &self,
        request: &GenerationRequest,
        _index: u32,
        cancel: &CancellationToken,
    ) -> Result<Output, ProviderError> {
        let builder = self.client.post(&self.endpoint).json(&build_body(request));
        let builder = match &self.auth {
            GeminiAuth::Bearer(token) => builder.bearer_auth(token),
            GeminiAuth::ApiKey(key) => builder.header("x-goog-api-key", key),
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::cancelled()),
            response = builder.send() => response.map_err(ProviderError::from_transport)?,
        };

        let status = response.status();
        let body = response.text().await.map_err(ProviderError::from_transport)?;
        if !status.is_success() {
            warn!(
                provider = "google",
                tier = %self.name,
                status = status.as_u16(),
                "generateContent error"
            );
            return Err(self.classifier.error(Some(status.as_u16()), &body));
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| ProviderError::transient(format!("unparseable response: {}", e)))?;
        inspect_response(&value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TierSettings {
    /// Pause between successive images of one request.
    pub inter_image_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            inter_image_delay: Duration::from_millis(2000),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Fallback-chain adapter: images are produced one at a time, each walking the
/// tiers in order until one succeeds.
pub struct TieredImageAdapter {
    provider: String,
    config: ModelConfig,
    tiers: Vec<Arc<dyn GenerationTier>>,
    settings: TierSettings,
}

impl TieredImageAdapter {
    pub fn new(
        provider: impl Into<String>,
        config: ModelConfig,
        tiers: Vec<Arc<dyn GenerationTier>>,
        settings: TierSettings,
    ) -> Self {
        Self {
            provider: provider.into(),
            config,
            tiers,
            settings,
        }
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    async fn generate_with_tiers(
        &self,
        request: &GenerationRequest,
        index: u32,
        cancel: &CancellationToken,
    ) -> Result<Output, ProviderError> {
        let mut exhausted = Vec::new();
        let mut last_kind = ErrorKind::ProviderUnavailable;

        for tier in &self.tiers {
            let label = format!("{}.{}", self.provider, tier.name());
            let result = retry_with_backoff(&self.settings.backoff, &label, cancel, |attempt| {
                debug!(
                    provider = %self.provider,
                    tier = tier.name(),
                    index,
                    attempt = attempt + 1,
                    "requesting image"
                );
                tier.generate_one(request, index, cancel)
            })
            .await;

            match result {
                Ok(output) => {
                    return Ok(output
                        .with_metric("tier", Value::String(tier.name().to_string()))
                        .with_metric("index", Value::from(index)));
                }
                Err(e) if e.kind.is_terminal() => return Err(e),
                Err(e) => {
                    info!(
                        provider = %self.provider,
                        tier = tier.name(),
                        index,
                        kind = ?e.kind,
                        "tier exhausted, advancing"
                    );
                    exhausted.push(format!("{} ({})", tier.name(), e.kind));
                    last_kind = e.kind;
                }
            }
        }

        Err(ProviderError::new(
            last_kind,
            if exhausted.is_empty() {
                "no generation tiers are configured".to_string()
            } else {
                format!(
                    "image {}: all tiers exhausted: {}",
                    index + 1,
                    exhausted.join(", ")
                )
            },
        ))
    }
}

#[async_trait]
impl ModelAdapter for TieredImageAdapter {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    async fn execute(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Generated, ProviderError> {
        let count = request.params.output_count;
        let mut outputs = Vec::with_capacity(count as usize);
        let mut last_error: Option<ProviderError> = None;
        let mut partial_failure = None;

        for index in 0..count {
            if index > 0 {
                sleep_or_cancel(self.settings.inter_image_delay, cancel).await?;
            }

            match self.generate_with_tiers(request, index, cancel).await {
                Ok(output) => outputs.push(output),
                Err(e) if e.kind == ErrorKind::Cancelled => return Err(e),
                Err(e) if e.kind.is_terminal() => {
                    warn!(
                        provider = %self.provider,
                        index,
                        error = %e,
                        "terminal failure, stopping"
                    );
                    if outputs.is_empty() {
                        return Err(e);
                    }
                    partial_failure = Some(PartialFailure {
                        failed_index: index,
                        error: e.kind,
                        message: e.message,
                    });
                    break;
                }
                Err(e) => {
                    warn!(
                        provider = %self.provider,
                        index,
                        error = %e,
                        "image failed on every tier"
                    );
                    last_error = Some(e);
                }
            }
        }

        if outputs.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| ProviderError::new(ErrorKind::Unknown, "no images produced")));
        }
        if outputs.len() < count as usize {
            warn!(
                provider = %self.provider,
                produced = outputs.len(),
                requested = count,
                "partial success"
            );
        }
        Ok(Generated {
            outputs,
            partial_failure,
        })
    }
}
