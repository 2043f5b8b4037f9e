//! Long-running-operation video adapter. Submission returns an operation name
//! that is polled until `done`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::adapter::ModelAdapter;
use crate::models::catalog::ModelConfig;
use crate::models::retry::{
    retry_with_backoff, sleep_or_cancel, BackoffPolicy, ErrorClassifier, ErrorKind, ProviderError,
};
use crate::models::types::{Generated, GenerationRequest, ImageInput, ImagePayload, Output};

/// Network seam for one LRO tier.
#[async_trait]
pub trait VeoApi: Send + Sync {
    fn name(&self) -> &str;

    /// Starts a generation and returns the operation name.
    async fn start(&self, model: &str, body: &Value) -> Result<String, ProviderError>;

    /// Fetches the current operation document.
    async fn poll(&self, model: &str, operation: &str) -> Result<Value, ProviderError>;
}

enum VeoEndpoint {
    Vertex {
        host: String,
        project: String,
        location: String,
        access_token: String,
    },
    DeveloperApi {
        base_url: String,
        api_key: String,
    },
}

pub struct HttpVeoApi {
    name: String,
    client: Client,
    endpoint: VeoEndpoint,
    classifier: ErrorClassifier,
}

impl HttpVeoApi {
    pub fn vertex(
        client: Client,
        project: &str,
        location: &str,
        access_token: impl Into<String>,
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
            endpoint: VeoEndpoint::Vertex {
                host,
                project: project.to_string(),
                location: location.to_string(),
                access_token: access_token.into(),
            },
            classifier,
        }
    }

    pub fn developer_api(
        client: Client,
        base_url: &str,
        api_key: impl Into<String>,
        classifier: ErrorClassifier,
    ) -> Self {
        Self {
            name: "rest".to_string(),
            client,
            endpoint: VeoEndpoint::DeveloperApi {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key: api_key.into(),
            },
            classifier,
        }
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        match &self.endpoint {
            VeoEndpoint::Vertex {
                host,
                project,
                location,
                ..
            } => format!(
                "https://{}/v1/projects/{}/locations/{}/publishers/google/models/{}:{}",
                host, project, location, model, method
            ),
            VeoEndpoint::DeveloperApi { base_url, .. } => {
                format!("{}/models/{}:{}", base_url, model, method)
            }
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.endpoint {
            VeoEndpoint::Vertex { access_token, .. } => builder.bearer_auth(access_token),
            VeoEndpoint::DeveloperApi { api_key, .. } => builder.header("x-goog-api-key", api_key),
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ProviderError::from_transport)?;
        if !status.is_success() {
            warn!(
                provider = "google",
                tier = %self.name,
                status = status.as_u16(),
                "video API error"
            );
            return Err(self.classifier.error(Some(status.as_u16()), &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| ProviderError::transient(format!("unparseable operation: {}", e)))
    }
}

#[async_trait]
impl VeoApi for HttpVeoApi {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, model: &str, body: &Value) -> Result<String, ProviderError> {
        let url = self.model_url(model, "predictLongRunning");
        let operation = self.send(self.client.post(&url).json(body)).await?;
        operation
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::new(ErrorKind::Unknown, "operation has no name"))
    }

    async fn poll(&self, model: &str, operation: &str) -> Result<Value, ProviderError> {
        match &self.endpoint {
            VeoEndpoint::Vertex { .. } => {
                let url = self.model_url(model, "fetchPredictOperation");
                self.send(
                    self.client
                        .post(&url)
                        .json(&json!({"operationName": operation})),
                )
                .await
            }
            VeoEndpoint::DeveloperApi { base_url, .. } => {
                let url = format!("{}/{}", base_url, operation);
                self.send(self.client.get(&url)).await
            }
        }
    }
}

/// Attachment schema for images in the request body. The preview endpoints
/// disagree on which one they accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncoding {
    BytesBase64,
    InlineData,
}

impl ImageEncoding {
    pub fn alternate(self) -> Self {
        match self {
            ImageEncoding::BytesBase64 => ImageEncoding::InlineData,
            ImageEncoding::InlineData => ImageEncoding::BytesBase64,
        }
    }

    fn encode(self, payload: &ImagePayload) -> Value {
        match self {
            ImageEncoding::BytesBase64 => json!({
                "bytesBase64Encoded": payload.data,
                "mimeType": payload.mime_type,
            }),
            ImageEncoding::InlineData => json!({
                "inlineData": {"mimeType": payload.mime_type, "data": payload.data}
            }),
        }
    }
}

fn encode_image(image: &ImageInput, encoding: ImageEncoding) -> Result<Value, ProviderError> {
    if let Some(payload) = &image.payload {
        return Ok(encoding.encode(payload));
    }
    match image.url.as_deref() {
        Some(uri) if uri.starts_with("gs://") => Ok(json!({
            "gcsUri": uri,
            "mimeType": image.mime_type(),
        })),
        Some(uri) => Err(ProviderError::invalid_request(format!(
            "video frames must be inline or gs:// images, got {}",
            uri
        ))),
        None => Err(ProviderError::invalid_request("image has no data")),
    }
}

pub fn build_body(
    request: &GenerationRequest,
    encoding: ImageEncoding,
) -> Result<Value, ProviderError> {
    let params = &request.params;

    let mut instance = Map::new();
    instance.insert("prompt".to_string(), json!(request.prompt));
    if let Some(image) = request.reference_images.first() {
        instance.insert("image".to_string(), encode_image(image, encoding)?);
    }
    if let Some(end) = &request.end_image {
        instance.insert("lastFrame".to_string(), encode_image(end, encoding)?);
    }

    let mut parameters = Map::new();
    parameters.insert("sampleCount".to_string(), json!(params.output_count));
    if let Some(ratio) = &params.aspect_ratio {
        parameters.insert("aspectRatio".to_string(), json!(ratio));
    }
    if let Some(duration) = params.duration_seconds {
        parameters.insert("durationSeconds".to_string(), json!(duration));
    }
    if let Some(resolution) = &params.resolution {
        parameters.insert("resolution".to_string(), json!(resolution));
    }
    if let Some(negative) = &params.negative_prompt {
        parameters.insert("negativePrompt".to_string(), json!(negative));
    }
    if let Some(seed) = params.seed {
        parameters.insert("seed".to_string(), json!(seed));
    }
    parameters.insert("generateAudio".to_string(), json!(params.generate_audio));
    for (key, value) in &params.extra {
        parameters.insert(key.clone(), value.clone());
    }

    Ok(json!({
        "instances": [Value::Object(instance)],
        "parameters": Value::Object(parameters),
    }))
}

fn video_output(video: &Value) -> Option<Output> {
    for key in ["uri", "gcsUri", "url"] {
        if let Some(uri) = video.get(key).and_then(Value::as_str) {
            return Some(Output::new(uri));
        }
    }
    video
        .get("bytesBase64Encoded")
        .and_then(Value::as_str)
        .map(|data| {
            let payload = ImagePayload {
                mime_type: video
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .unwrap_or("video/mp4")
                    .to_string(),
                data: data.to_string(),
            };
            Output::new(payload.to_data_url())
        })
}

/// Outputs of a finished operation. Handles both the Vertex (`videos`) and
/// developer API (`generateVideoResponse.generatedSamples`) shapes.
pub fn extract_outputs(
    operation: &Value,
    classifier: &ErrorClassifier,
) -> Result<Vec<Output>, ProviderError> {
    if let Some(error) = operation.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        let status = error
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
            .filter(|c| *c >= 400);
        return Err(classifier.error(status, &message));
    }

    let response = operation.get("response").unwrap_or(&Value::Null);
    let samples = response
        .get("videos")
        .and_then(Value::as_array)
        .cloned()
        .or_else(|| {
            response
                .pointer("/generateVideoResponse/generatedSamples")
                .and_then(Value::as_array)
                .map(|samples| {
                    samples
                        .iter()
                        .filter_map(|s| s.get("video").cloned())
                        .collect()
                })
        })
        .unwrap_or_default();

    let outputs: Vec<Output> = samples.iter().filter_map(video_output).collect();
    if !outputs.is_empty() {
        return Ok(outputs);
    }

    let filtered = response
        .get("raiMediaFilteredCount")
        .or_else(|| response.pointer("/generateVideoResponse/raiMediaFilteredCount"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if filtered > 0 {
        let reasons = response
            .get("raiMediaFilteredReasons")
            .or_else(|| response.pointer("/generateVideoResponse/raiMediaFilteredReasons"))
            .and_then(Value::as_array)
            .map(|r| {
                r.iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "responsible AI filter".to_string());
        return Err(ProviderError::content_blocked(format!(
            "{} video(s) filtered: {}",
            filtered, reasons
        )));
    }

    Err(ProviderError::new(
        ErrorKind::Unknown,
        "operation finished without a video",
    ))
}

#[derive(Debug, Clone, PartialEq)]
pub struct VeoSettings {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for VeoSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_poll_attempts: 30,
            backoff: BackoffPolicy::default(),
        }
    }
}

pub struct VeoAdapter {
    tiers: Vec<Arc<dyn VeoApi>>,
    config: ModelConfig,
    settings: VeoSettings,
    classifier: ErrorClassifier,
}

impl VeoAdapter {
    pub fn new(
        tiers: Vec<Arc<dyn VeoApi>>,
        config: ModelConfig,
        settings: VeoSettings,
        classifier: ErrorClassifier,
    ) -> Self {
        Self {
            tiers,
            config,
            settings,
            classifier,
        }
    }

    async fn start_once(
        &self,
        tier: &dyn VeoApi,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let model = self.config.upstream_model();
        let label = format!("veo.{}", tier.name());
        retry_with_backoff(&self.settings.backoff, &label, cancel, |_| {
            tier.start(model, body)
        })
        .await
    }

    /// Submits, retrying once with the other image schema when the endpoint
    /// rejects the one used.
    async fn start(
        &self,
        tier: &dyn VeoApi,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let encoding = ImageEncoding::BytesBase64;
        let body = build_body(request, encoding)?;
        let has_images = !request.reference_images.is_empty() || request.end_image.is_some();

        match self.start_once(tier, &body, cancel).await {
            Err(e) if has_images && self.classifier.mentions_unsupported_field(&e.message) => {
                warn!(
                    provider = "google",
                    tier = tier.name(),
                    error = %e,
                    "image encoding rejected, retrying with alternate schema"
                );
                let body = build_body(request, encoding.alternate())?;
                self.start_once(tier, &body, cancel).await
            }
            other => other,
        }
    }

    async fn wait(
        &self,
        tier: &dyn VeoApi,
        operation: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Output>, ProviderError> {
        let model = self.config.upstream_model();
        for attempt in 1..=self.settings.max_poll_attempts {
            sleep_or_cancel(self.settings.poll_interval, cancel).await?;
            let document = match tier.poll(model, operation).await {
                Ok(document) => document,
                Err(e) if e.kind.is_retryable() => {
                    warn!(
                        provider = "google",
                        tier = tier.name(),
                        attempt,
                        error = %e,
                        "operation poll failed, continuing"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            let done = document.get("done").and_then(Value::as_bool).unwrap_or(false);
            debug!(
                provider = "google",
                tier = tier.name(),
                operation,
                attempt,
                done,
                "operation poll"
            );
            if done {
                return extract_outputs(&document, &self.classifier);
            }
        }

        Err(ProviderError::timeout(format!(
            "operation {} not done after {} polls",
            operation, self.settings.max_poll_attempts
        )))
    }

    async fn run_tier(
        &self,
        tier: &dyn VeoApi,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Output>, ProviderError> {
        let operation = self.start(tier, request, cancel).await?;
        info!(provider = "google", tier = tier.name(), operation = %operation, "operation started");
        let outputs = self.wait(tier, &operation, cancel).await?;
        Ok(outputs
            .into_iter()
            .map(|o| {
                o.with_metric("tier", Value::String(tier.name().to_string()))
                    .with_metric("operation", Value::String(operation.clone()))
            })
            .collect())
    }
}

#[async_trait]
impl ModelAdapter for VeoAdapter {
    fn provider_name(&self) -> &str {
        "google"
    }

    fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    async fn execute(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Generated, ProviderError> {
        let mut exhausted = Vec::new();
        let mut last_kind = ErrorKind::ProviderUnavailable;

        for tier in &self.tiers {
            match self.run_tier(tier.as_ref(), request, cancel).await {
                Ok(outputs) => return Ok(outputs.into()),
                Err(e) if e.kind.is_terminal() => return Err(e),
                Err(e) => {
                    info!(
                        provider = "google",
                        tier = tier.name(),
                        kind = ?e.kind,
                        "video tier exhausted, advancing"
                    );
                    exhausted.push(format!("{} ({})", tier.name(), e.kind));
                    last_kind = e.kind;
                }
            }
        }

        Err(ProviderError::new(
            last_kind,
            if exhausted.is_empty() {
                "no video tiers are configured".to_string()
            } else {
                format!("all video tiers exhausted: {}", exhausted.join(", "))
            },
        ))
    }
}
