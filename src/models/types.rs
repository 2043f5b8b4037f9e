use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::retry::{ErrorKind, ProviderError};

/// Base64 image payload with its mime type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub mime_type: String,
    /// Raw base64, never prefixed with `data:`.
    pub data: String,
}

impl ImagePayload {
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: STANDARD.encode(bytes),
        }
    }

    /// Accepts either a full `data:<mime>;base64,<payload>` URL or an already
    /// raw base64 string.
    pub fn from_data_url(value: &str) -> Self {
        match value.strip_prefix("data:").and_then(|rest| rest.split_once(',')) {
            Some((header, payload)) => {
                let mime_type = header
                    .split(';')
                    .next()
                    .filter(|m| !m.is_empty())
                    .unwrap_or("image/png")
                    .to_string();
                Self {
                    mime_type,
                    data: payload.to_string(),
                }
            }
            None => Self {
                mime_type: "image/png".to_string(),
                data: value.to_string(),
            },
        }
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// A reference image, either hosted, inline, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ImagePayload>,
}

impl ImageInput {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            payload: None,
        }
    }

    pub fn data_url(value: &str) -> Self {
        Self {
            url: None,
            payload: Some(ImagePayload::from_data_url(value)),
        }
    }

    pub fn bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            url: None,
            payload: Some(ImagePayload::from_bytes(mime_type, bytes)),
        }
    }

    /// Parses a CLI or API supplied source: http(s) URLs stay hosted,
    /// `data:` URLs become inline payloads.
    pub fn from_source(source: &str) -> Self {
        if source.starts_with("data:") {
            Self::data_url(source)
        } else {
            Self::url(source)
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn hosted_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
    }

    /// Value for providers that take either a hosted URL or raw base64.
    /// A hosted URL wins when both are present.
    pub fn for_raw_provider(&self) -> Option<String> {
        if let Some(url) = self.hosted_url() {
            return Some(url.to_string());
        }
        self.payload.as_ref().map(|p| p.data.clone())
    }

    pub fn mime_type(&self) -> &str {
        self.payload
            .as_ref()
            .map(|p| p.mime_type.as_str())
            .unwrap_or("image/png")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub aspect_ratio: Option<String>,
    pub resolution: Option<String>,
    pub duration_seconds: Option<u32>,
    pub output_count: u32,
    pub generate_audio: bool,
    pub negative_prompt: Option<String>,
    /// Provider quality mode, e.g. `std` or `pro`.
    pub mode: Option<String>,
    pub seed: Option<u64>,
    /// Provider-specific fields passed through untouched.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            aspect_ratio: None,
            resolution: None,
            duration_seconds: None,
            output_count: 1,
            generate_audio: false,
            negative_prompt: None,
            mode: None,
            seed: None,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: String,
    pub prompt: String,
    pub model_id: String,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default)]
    pub reference_images: Vec<ImageInput>,
    #[serde(default)]
    pub end_image: Option<ImageInput>,
}

impl GenerationRequest {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            model_id: model_id.into(),
            params: GenerationParams::default(),
            reference_images: Vec::new(),
            end_image: None,
        }
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: impl Into<String>) -> Self {
        self.params.aspect_ratio = Some(aspect_ratio.into());
        self
    }

    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.params.resolution = Some(resolution.into());
        self
    }

    pub fn with_duration(mut self, seconds: u32) -> Self {
        self.params.duration_seconds = Some(seconds);
        self
    }

    pub fn with_output_count(mut self, count: u32) -> Self {
        self.params.output_count = count;
        self
    }

    pub fn with_audio(mut self, enabled: bool) -> Self {
        self.params.generate_audio = enabled;
        self
    }

    pub fn with_reference_image(mut self, image: ImageInput) -> Self {
        self.reference_images.push(image);
        self
    }

    pub fn with_end_image(mut self, image: ImageInput) -> Self {
        self.end_image = Some(image);
        self
    }

    /// Copy of this request addressed to another model, as chosen by routing.
    /// The id is kept so logs correlate across the reroute.
    pub fn routed_to(&self, model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    /// Hosted URL or `data:` URL of the generated media.
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

impl Output {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            width: None,
            height: None,
            duration_seconds: None,
            metrics: None,
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn with_metric(mut self, key: &str, value: serde_json::Value) -> Self {
        let metrics = self
            .metrics
            .get_or_insert_with(|| serde_json::Value::Object(Default::default()));
        if let Some(map) = metrics.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }
}

/// Terminal error that stopped a multi-output request after earlier outputs
/// had already succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialFailure {
    /// Zero-based index of the output that failed.
    pub failed_index: u32,
    pub error: ErrorKind,
    pub message: String,
}

/// What an adapter produced before `generate` normalizes it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Generated {
    pub outputs: Vec<Output>,
    pub partial_failure: Option<PartialFailure>,
}

impl From<Vec<Output>> for Generated {
    fn from(outputs: Vec<Output>) -> Self {
        Self {
            outputs,
            partial_failure: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GenerationResult {
    Completed {
        outputs: Vec<Output>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_failure: Option<PartialFailure>,
    },
    Failed {
        error: ErrorKind,
        message: String,
    },
}

impl GenerationResult {
    pub fn completed(outputs: Vec<Output>) -> Self {
        GenerationResult::Completed {
            outputs,
            partial_failure: None,
        }
    }

    pub fn failed(error: ErrorKind, message: impl Into<String>) -> Self {
        GenerationResult::Failed {
            error,
            message: message.into(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, GenerationResult::Completed { .. })
    }

    pub fn outputs(&self) -> &[Output] {
        match self {
            GenerationResult::Completed { outputs, .. } => outputs,
            GenerationResult::Failed { .. } => &[],
        }
    }

    pub fn partial_failure(&self) -> Option<&PartialFailure> {
        match self {
            GenerationResult::Completed {
                partial_failure, ..
            } => partial_failure.as_ref(),
            GenerationResult::Failed { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            GenerationResult::Completed { .. } => None,
            GenerationResult::Failed { error, .. } => Some(*error),
        }
    }
}

impl From<ProviderError> for GenerationResult {
    fn from(error: ProviderError) -> Self {
        GenerationResult::failed(error.kind, error.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_url_is_stripped_to_raw_payload() {
        let payload = ImagePayload::from_data_url("data:image/jpeg;base64,QUJD");
        assert_eq!(payload.mime_type, "image/jpeg");
        assert_eq!(payload.data, "QUJD");
        assert_eq!(payload.to_data_url(), "data:image/jpeg;base64,QUJD");
    }

    #[test]
    fn test_raw_base64_passes_through() {
        let payload = ImagePayload::from_data_url("QUJD");
        assert_eq!(payload.data, "QUJD");
        assert_eq!(payload.mime_type, "image/png");
    }

    #[test]
    fn test_url_preferred_over_payload() {
        let image = ImageInput::data_url("data:image/png;base64,QUJD")
            .with_url("https://cdn.example.com/a.png");
        assert_eq!(
            image.for_raw_provider().as_deref(),
            Some("https://cdn.example.com/a.png")
        );

        let inline_only = ImageInput::data_url("data:image/png;base64,QUJD");
        assert_eq!(inline_only.for_raw_provider().as_deref(), Some("QUJD"));
    }

    #[test]
    fn test_from_source() {
        assert!(ImageInput::from_source("https://x.test/a.png").payload.is_none());
        assert!(ImageInput::from_source("data:image/png;base64,AA==").url.is_none());
    }

    #[test]
    fn test_routed_copy_keeps_id() {
        let request = GenerationRequest::new("model-a", "a cat").with_output_count(2);
        let routed = request.routed_to("model-b");
        assert_eq!(routed.id, request.id);
        assert_eq!(routed.model_id, "model-b");
        assert_eq!(routed.params.output_count, 2);
        assert_eq!(request.model_id, "model-a");
    }

    #[test]
    fn test_result_serialization() {
        let result = GenerationResult::failed(ErrorKind::Timeout, "took too long");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "timeout");

        let ok = GenerationResult::completed(vec![Output::new("https://x.test/v.mp4")]);
        assert!(ok.is_completed());
        assert_eq!(ok.outputs().len(), 1);
        assert_eq!(ok.error_kind(), None);
    }

    #[test]
    fn test_output_metrics() {
        let output = Output::new("u")
            .with_metric("tier", serde_json::json!("rest"))
            .with_metric("index", serde_json::json!(1));
        let metrics = output.metrics.unwrap();
        assert_eq!(metrics["tier"], "rest");
        assert_eq!(metrics["index"], 1);
    }
}
