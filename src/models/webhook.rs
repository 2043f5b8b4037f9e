//! Callback-based submission. Completion arrives out of band at the callback
//! URL; `submit` returns as soon as the provider has accepted the job.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::models::catalog::ModelConfig;
use crate::models::replicate::{
    prediction_error, prediction_input, Prediction, PredictionApi, PredictionRequest,
    PredictionStatus, WebhookEventKind,
};
use crate::models::retry::{ErrorClassifier, ErrorKind, ProviderError};
use crate::models::types::{GenerationRequest, GenerationResult, Output};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubmission {
    pub prediction_id: String,
    pub model_path: String,
    pub version: String,
    pub status: PredictionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub prediction_id: String,
    pub status: PredictionStatus,
    /// Present once the job is terminal.
    pub result: Option<GenerationResult>,
}

fn result_of(classifier: &ErrorClassifier, prediction: &Prediction) -> Option<GenerationResult> {
    match prediction.status {
        PredictionStatus::Succeeded => {
            let outputs: Vec<Output> =
                prediction.output_urls().into_iter().map(Output::new).collect();
            Some(if outputs.is_empty() {
                GenerationResult::failed(
                    ErrorKind::Unknown,
                    format!("prediction {} succeeded without output", prediction.id),
                )
            } else {
                GenerationResult::completed(outputs)
            })
        }
        PredictionStatus::Failed | PredictionStatus::Canceled => {
            Some(prediction_error(classifier, prediction).into())
        }
        _ => None,
    }
}

pub struct WebhookSubmitter {
    api: Arc<dyn PredictionApi>,
    callback_url: Url,
    events: Vec<WebhookEventKind>,
    classifier: ErrorClassifier,
}

impl WebhookSubmitter {
    pub fn new(
        api: Arc<dyn PredictionApi>,
        callback_url: &str,
        classifier: ErrorClassifier,
    ) -> Result<Self, ProviderError> {
        let callback_url = Url::parse(callback_url).map_err(|e| {
            ProviderError::invalid_request(format!("invalid callback url {}: {}", callback_url, e))
        })?;
        if !matches!(callback_url.scheme(), "http" | "https") {
            return Err(ProviderError::invalid_request(format!(
                "callback url must be http(s), got {}",
                callback_url.scheme()
            )));
        }

        Ok(Self {
            api,
            callback_url,
            events: vec![WebhookEventKind::Completed],
            classifier,
        })
    }

    pub fn with_events(mut self, events: Vec<WebhookEventKind>) -> Self {
        if !events.is_empty() {
            self.events = events;
        }
        self
    }

    pub fn callback_url(&self) -> &Url {
        &self.callback_url
    }

    pub async fn submit(
        &self,
        model_path: &str,
        input: Value,
    ) -> Result<WebhookSubmission, ProviderError> {
        let version = self.api.latest_version(model_path).await?;
        let prediction = self
            .api
            .create_prediction(&PredictionRequest {
                version: version.clone(),
                input,
                webhook: Some(self.callback_url.to_string()),
                webhook_events_filter: self.events.clone(),
            })
            .await?;

        info!(
            provider = "replicate",
            model = model_path,
            id = %prediction.id,
            callback = %self.callback_url,
            "submitted with webhook"
        );

        Ok(WebhookSubmission {
            prediction_id: prediction.id,
            model_path: model_path.to_string(),
            version,
            status: prediction.status,
        })
    }

    /// Validates the request against the model before submitting it.
    pub async fn submit_request(
        &self,
        config: &ModelConfig,
        request: &GenerationRequest,
    ) -> Result<WebhookSubmission, ProviderError> {
        config.validate_request(request)?;
        self.submit(config.upstream_model(), prediction_input(request, true))
            .await
    }

    pub async fn status(&self, prediction_id: &str) -> Result<JobStatus, ProviderError> {
        let prediction = self.api.get_prediction(prediction_id).await?;
        Ok(JobStatus {
            result: result_of(&self.classifier, &prediction),
            prediction_id: prediction.id,
            status: prediction.status,
        })
    }

    pub async fn cancel(&self, prediction_id: &str) -> Result<PredictionStatus, ProviderError> {
        let prediction = self.api.cancel_prediction(prediction_id).await?;
        info!(
            provider = "replicate",
            id = prediction_id,
            status = ?prediction.status,
            "cancel requested"
        );
        Ok(prediction.status)
    }
}

/// Body POSTed to the callback URL.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub prediction: Prediction,
}

impl WebhookEvent {
    pub fn parse(body: &str) -> Result<Self, ProviderError> {
        let prediction: Prediction = serde_json::from_str(body)
            .map_err(|e| {
                ProviderError::invalid_request(format!("malformed webhook payload: {}", e))
            })?;
        Ok(Self { prediction })
    }

    pub fn id(&self) -> &str {
        &self.prediction.id
    }

    pub fn is_terminal(&self) -> bool {
        self.prediction.status.is_terminal()
    }

    /// Normalized result, or `None` for intermediate lifecycle events.
    pub fn to_result(&self, classifier: &ErrorClassifier) -> Option<GenerationResult> {
        result_of(classifier, &self.prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::catalog::{ModelCatalog, FLUX_WEBHOOK_MODEL};
    use crate::models::replicate::fake::{prediction, FakePredictionApi};
    use serde_json::json;

    fn submitter(api: Arc<FakePredictionApi>) -> WebhookSubmitter {
        WebhookSubmitter::new(api, "https://hooks.test/replicate", ErrorClassifier::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_resolves_version_and_sets_callback() {
        let api = Arc::new(FakePredictionApi::default());
        let submitter = submitter(api.clone());
        let config = ModelCatalog::builtin().get(FLUX_WEBHOOK_MODEL).cloned().unwrap();
        let request = GenerationRequest::new(FLUX_WEBHOOK_MODEL, "a lighthouse")
            .with_aspect_ratio("16:9")
            .with_output_count(2);

        let submission = submitter.submit_request(&config, &request).await.unwrap();
        assert_eq!(submission.prediction_id, "pred-1");
        assert_eq!(submission.version, "v123");
        assert_eq!(submission.model_path, "black-forest-labs/flux-schnell");

        let created = api.created.lock();
        assert_eq!(created[0].webhook.as_deref(), Some("https://hooks.test/replicate"));
        assert_eq!(created[0].webhook_events_filter, vec![WebhookEventKind::Completed]);
        assert_eq!(created[0].input["num_outputs"], 2);

        let body = serde_json::to_value(&created[0]).unwrap();
        assert_eq!(body["webhook_events_filter"], json!(["completed"]));
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_submitted() {
        let api = Arc::new(FakePredictionApi::default());
        let submitter = submitter(api.clone());
        let config = ModelCatalog::builtin().get(FLUX_WEBHOOK_MODEL).cloned().unwrap();
        let request = GenerationRequest::new(FLUX_WEBHOOK_MODEL, "x").with_aspect_ratio("5:1");

        let err = submitter.submit_request(&config, &request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert!(api.created.lock().is_empty());
    }

    #[test]
    fn test_callback_url_must_be_http() {
        let api = Arc::new(FakePredictionApi::default());
        let classifier = ErrorClassifier::default();
        let ftp = WebhookSubmitter::new(api.clone(), "ftp://hooks.test/x", classifier);
        assert!(ftp.is_err());
        assert!(WebhookSubmitter::new(api, "not a url", ErrorClassifier::default()).is_err());
    }

    #[tokio::test]
    async fn test_status_and_cancel() {
        let api = Arc::new(FakePredictionApi::default());
        api.polls.lock().push_back(prediction(
            PredictionStatus::Succeeded,
            Some(json!(["https://r.test/1.png"])),
        ));
        let submitter = submitter(api.clone());

        let status = submitter.status("pred-1").await.unwrap();
        assert_eq!(status.status, PredictionStatus::Succeeded);
        assert!(status.result.unwrap().is_completed());

        let pending = submitter.status("pred-1").await.unwrap();
        assert!(pending.result.is_none());

        assert_eq!(submitter.cancel("pred-1").await.unwrap(), PredictionStatus::Canceled);
    }

    #[test]
    fn test_parse_callback_payloads() {
        let classifier = ErrorClassifier::default();

        let done = WebhookEvent::parse(
            r#"{"id":"p1","status":"succeeded",
                "output":["https://r.test/a.png","https://r.test/b.png"],"error":null}"#,
        )
        .unwrap();
        assert!(done.is_terminal());
        assert_eq!(done.to_result(&classifier).unwrap().outputs().len(), 2);

        let failed =
            WebhookEvent::parse(r#"{"id":"p2","status":"failed","error":"CUDA out of memory"}"#)
                .unwrap();
        assert!(!failed.to_result(&classifier).unwrap().is_completed());

        let started = WebhookEvent::parse(r#"{"id":"p3","status":"processing"}"#).unwrap();
        assert_eq!(started.id(), "p3");
        assert!(started.to_result(&classifier).is_none());

        assert!(WebhookEvent::parse("not json").is_err());
    }
}
