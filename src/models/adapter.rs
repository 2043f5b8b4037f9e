use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::catalog::ModelConfig;
use crate::models::retry::{ErrorKind, ProviderError};
use crate::models::types::{Generated, GenerationRequest, GenerationResult};

/// One implementation per provider. `generate` never fails past this
/// boundary: every error becomes a `failed` result.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn provider_name(&self) -> &str;

    fn model_config(&self) -> &ModelConfig;

    /// Runs the provider protocol for an already validated request. An `Ok`
    /// with fewer outputs than requested is a tolerated partial success; the
    /// error that cut it short, if terminal, rides along in `partial_failure`.
    async fn execute(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Generated, ProviderError>;

    fn validate_request(&self, request: &GenerationRequest) -> Result<(), ProviderError> {
        self.model_config().validate_request(request)
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> GenerationResult {
        if let Err(e) = self.validate_request(request) {
            warn!(
                provider = self.provider_name(),
                model = %request.model_id,
                error = %e,
                "request rejected before submission"
            );
            return e.into();
        }

        match self.execute(request, cancel).await {
            Ok(generated) if generated.outputs.is_empty() => GenerationResult::failed(
                ErrorKind::Unknown,
                format!("{} returned no outputs", self.provider_name()),
            ),
            Ok(Generated {
                outputs,
                partial_failure,
            }) => {
                info!(
                    provider = self.provider_name(),
                    model = %request.model_id,
                    outputs = outputs.len(),
                    requested = request.params.output_count,
                    partial = partial_failure.is_some(),
                    "generation completed"
                );
                GenerationResult::Completed {
                    outputs,
                    partial_failure,
                }
            }
            Err(e) => {
                warn!(
                    provider = self.provider_name(),
                    model = %request.model_id,
                    kind = ?e.kind,
                    error = %e.message,
                    "generation failed"
                );
                e.into()
            }
        }
    }
}
