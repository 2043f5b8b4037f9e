//! Static per-model descriptors and request validation against them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::retry::ProviderError;
use crate::models::types::GenerationRequest;

pub const KLING_VIDEO_MODEL: &str = "kling-v2-1-master";
pub const GEMINI_IMAGE_MODEL: &str = "gemini-2.5-flash-image";
pub const MARKETPLACE_IMAGE_MODEL: &str = "nano-banana-marketplace";
pub const VEO_VIDEO_MODEL: &str = "veo-3.0-generate-001";
pub const FLUX_WEBHOOK_MODEL: &str = "flux-schnell";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Rate-limit scope used for this kind of media.
    pub fn scope(self) -> &'static str {
        match self {
            MediaKind::Image => "images",
            MediaKind::Video => "videos",
        }
    }
}

/// How completion of a submitted job is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    Synchronous,
    Polling,
    LongRunningOperation,
    Webhook,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub image_to_video: bool,
    pub frame_interpolation: bool,
    pub multi_image_editing: bool,
    pub audio_generation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub provider: String,
    pub display_name: String,
    pub kind: MediaKind,
    pub completion: CompletionMode,
    /// Upstream identifier, when it differs from `id`.
    #[serde(default)]
    pub upstream_model: Option<String>,
    pub aspect_ratios: Vec<String>,
    /// Ascending; the last entry is the maximum resolution.
    #[serde(default)]
    pub resolutions: Vec<String>,
    #[serde(default)]
    pub durations: Vec<u32>,
    pub max_outputs: u32,
    pub max_reference_images: u32,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl ModelConfig {
    pub fn upstream_model(&self) -> &str {
        self.upstream_model.as_deref().unwrap_or(&self.id)
    }

    pub fn max_resolution(&self) -> Option<&str> {
        self.resolutions.last().map(String::as_str)
    }

    /// Rejects parameter combinations this model cannot serve. Runs before any
    /// network call.
    pub fn validate_request(&self, request: &GenerationRequest) -> Result<(), ProviderError> {
        let params = &request.params;

        if request.prompt.trim().is_empty() {
            return Err(ProviderError::invalid_request("prompt must not be empty"));
        }

        if let Some(ratio) = &params.aspect_ratio {
            if !self.aspect_ratios.iter().any(|r| r == ratio) {
                return Err(ProviderError::invalid_request(format!(
                    "aspect ratio {} is not supported by {} (supported: {})",
                    ratio,
                    self.id,
                    self.aspect_ratios.join(", ")
                )));
            }
        }

        if let Some(resolution) = &params.resolution {
            if !self.resolutions.iter().any(|r| r == resolution) {
                return Err(ProviderError::invalid_request(format!(
                    "resolution {} is not supported by {} (max: {})",
                    resolution,
                    self.id,
                    self.max_resolution().unwrap_or("none")
                )));
            }
        }

        if params.output_count == 0 || params.output_count > self.max_outputs {
            return Err(ProviderError::invalid_request(format!(
                "output count must be between 1 and {} for {}",
                self.max_outputs, self.id
            )));
        }

        if let Some(duration) = params.duration_seconds {
            if self.kind == MediaKind::Image {
                return Err(ProviderError::invalid_request(format!(
                    "{} generates images; duration is not applicable",
                    self.id
                )));
            }
            if !self.durations.is_empty() && !self.durations.contains(&duration) {
                return Err(ProviderError::invalid_request(format!(
                    "duration {}s is not supported by {}",
                    duration, self.id
                )));
            }
        }

        let references = request.reference_images.len() as u32;
        if references > self.max_reference_images {
            return Err(ProviderError::invalid_request(format!(
                "{} accepts at most {} reference images, got {}",
                self.id, self.max_reference_images, references
            )));
        }
        if references > 1 && self.kind == MediaKind::Image && !self.capabilities.multi_image_editing
        {
            return Err(ProviderError::invalid_request(format!(
                "{} does not support multi-image editing",
                self.id
            )));
        }
        if references > 0 && self.kind == MediaKind::Video && !self.capabilities.image_to_video {
            return Err(ProviderError::invalid_request(format!(
                "{} does not support image-to-video",
                self.id
            )));
        }

        for image in request.reference_images.iter().chain(request.end_image.iter()) {
            if image.url.is_none() && image.payload.is_none() {
                return Err(ProviderError::invalid_request(
                    "image input has neither a url nor a payload",
                ));
            }
        }

        if request.end_image.is_some() {
            if !self.capabilities.frame_interpolation {
                return Err(ProviderError::invalid_request(format!(
                    "{} does not support end-frame interpolation",
                    self.id
                )));
            }
            if request.reference_images.is_empty() {
                return Err(ProviderError::invalid_request(
                    "an end frame requires a start image",
                ));
            }
        }

        if params.generate_audio && !self.capabilities.audio_generation {
            return Err(ProviderError::invalid_request(format!(
                "{} does not generate audio",
                self.id
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: BTreeMap<String, ModelConfig>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut catalog = Self::new();

        catalog.insert(ModelConfig {
            id: KLING_VIDEO_MODEL.to_string(),
            provider: "kling".to_string(),
            display_name: "Kling 2.1 Master".to_string(),
            kind: MediaKind::Video,
            completion: CompletionMode::Polling,
            upstream_model: Some("kling-v2-1-master".to_string()),
            aspect_ratios: strings(&["16:9", "9:16", "1:1"]),
            resolutions: strings(&["720p", "1080p"]),
            durations: vec![5, 10],
            max_outputs: 1,
            max_reference_images: 1,
            capabilities: Capabilities {
                image_to_video: true,
                frame_interpolation: true,
                multi_image_editing: false,
                audio_generation: true,
            },
        });

        catalog.insert(ModelConfig {
            id: GEMINI_IMAGE_MODEL.to_string(),
            provider: "google".to_string(),
            display_name: "Gemini 2.5 Flash Image".to_string(),
            kind: MediaKind::Image,
            completion: CompletionMode::Synchronous,
            upstream_model: None,
            aspect_ratios: strings(&[
                "1:1", "2:3", "3:2", "3:4", "4:3", "4:5", "5:4", "9:16", "16:9", "21:9",
            ]),
            resolutions: strings(&["1K"]),
            durations: Vec::new(),
            max_outputs: 4,
            max_reference_images: 3,
            capabilities: Capabilities {
                multi_image_editing: true,
                ..Capabilities::default()
            },
        });

        catalog.insert(ModelConfig {
            id: MARKETPLACE_IMAGE_MODEL.to_string(),
            provider: "replicate".to_string(),
            display_name: "Nano Banana (marketplace)".to_string(),
            kind: MediaKind::Image,
            completion: CompletionMode::Synchronous,
            upstream_model: Some("google/nano-banana".to_string()),
            aspect_ratios: strings(&[
                "1:1", "2:3", "3:2", "3:4", "4:3", "4:5", "5:4", "9:16", "16:9", "21:9",
            ]),
            resolutions: strings(&["1K"]),
            durations: Vec::new(),
            max_outputs: 4,
            max_reference_images: 3,
            capabilities: Capabilities {
                multi_image_editing: true,
                ..Capabilities::default()
            },
        });

        catalog.insert(ModelConfig {
            id: VEO_VIDEO_MODEL.to_string(),
            provider: "google".to_string(),
            display_name: "Veo 3".to_string(),
            kind: MediaKind::Video,
            completion: CompletionMode::LongRunningOperation,
            upstream_model: None,
            aspect_ratios: strings(&["16:9", "9:16"]),
            resolutions: strings(&["720p", "1080p"]),
            durations: vec![4, 6, 8],
            max_outputs: 2,
            max_reference_images: 1,
            capabilities: Capabilities {
                image_to_video: true,
                frame_interpolation: true,
                multi_image_editing: false,
                audio_generation: true,
            },
        });

        catalog.insert(ModelConfig {
            id: FLUX_WEBHOOK_MODEL.to_string(),
            provider: "replicate".to_string(),
            display_name: "FLUX.1 schnell".to_string(),
            kind: MediaKind::Image,
            completion: CompletionMode::Webhook,
            upstream_model: Some("black-forest-labs/flux-schnell".to_string()),
            aspect_ratios: strings(&["1:1", "16:9", "9:16", "4:3", "3:4", "21:9"]),
            resolutions: Vec::new(),
            durations: Vec::new(),
            max_outputs: 4,
            max_reference_images: 0,
            capabilities: Capabilities::default(),
        });

        catalog
    }

    pub fn insert(&mut self, config: ModelConfig) {
        self.models.insert(config.id.clone(), config);
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelConfig> {
        self.models.get(model_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelConfig> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
