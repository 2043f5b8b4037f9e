pub mod adapter;
pub mod catalog;
pub mod gemini;
pub mod kling;
pub mod orchestrator;
pub mod rate_limiter;
pub mod replicate;
pub mod retry;
pub mod router;
pub mod token;
pub mod types;
pub mod veo;
pub mod webhook;

pub use adapter::ModelAdapter;
pub use catalog::{Capabilities, CompletionMode, MediaKind, ModelCatalog, ModelConfig};
pub use gemini::{GeminiTier, GenerationTier, TierSettings, TieredImageAdapter};
pub use kling::{HttpKlingApi, KlingAdapter, KlingApi, KlingSettings};
pub use orchestrator::{OrchestratedGeneration, Orchestrator};
pub use rate_limiter::{
    InMemoryRateLimiter, ProviderLimits, QuotaReporter, RateLimitStatus, RateLimiter,
};
pub use replicate::{HttpPredictionApi, MarketplaceSettings, MarketplaceTier, PredictionApi};
pub use retry::{BackoffPolicy, ErrorClassifier, ErrorKind, ErrorPhrases, ProviderError};
pub use router::{FallbackMapping, ProviderRouteDecision, ProviderRouter, RouteError};
pub use token::TokenSigner;
pub use types::{
    Generated, GenerationParams, GenerationRequest, GenerationResult, ImageInput, ImagePayload,
    Output, PartialFailure,
};
pub use veo::{HttpVeoApi, VeoAdapter, VeoApi, VeoSettings};
pub use webhook::{WebhookEvent, WebhookSubmission, WebhookSubmitter};
