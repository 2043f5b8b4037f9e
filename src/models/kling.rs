//! Polling video adapter for Kling. Every call is authenticated with a freshly
//! signed short-lived token, including each status poll.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::adapter::ModelAdapter;
use crate::models::catalog::ModelConfig;
use crate::models::retry::{
    retry_with_backoff, sleep_or_cancel, BackoffPolicy, ErrorClassifier, ErrorKind, ProviderError,
};
use crate::models::token::TokenSigner;
use crate::models::types::{Generated, GenerationRequest, ImageInput, Output};

pub const DEFAULT_BASE_URL: &str = "https://api-singapore.klingai.com";

#[derive(Debug, Clone, PartialEq)]
pub struct KlingSettings {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub submit_signature_attempts: u32,
    /// Consecutive invalid-signature polls tolerated before giving up.
    pub poll_signature_tolerance: u32,
}

impl Default for KlingSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: 180,
            submit_signature_attempts: 3,
            poll_signature_tolerance: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlingEndpoint {
    TextToVideo,
    ImageToVideo,
}

impl KlingEndpoint {
    pub fn path(self) -> &'static str {
        match self {
            KlingEndpoint::TextToVideo => "/v1/videos/text2video",
            KlingEndpoint::ImageToVideo => "/v1/videos/image2video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KlingTaskInput {
    pub model_name: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub duration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_tail: Option<String>,
    pub sound: String,
}

/// Network seam for the Kling task API.
#[async_trait]
pub trait KlingApi: Send + Sync {
    /// Creates a task and returns its id.
    async fn submit(
        &self,
        token: &str,
        endpoint: KlingEndpoint,
        input: &KlingTaskInput,
    ) -> Result<String, ProviderError>;

    /// Returns the raw task document.
    async fn query(
        &self,
        token: &str,
        endpoint: KlingEndpoint,
        task_id: &str,
    ) -> Result<Value, ProviderError>;
}

pub struct HttpKlingApi {
    client: Client,
    base_url: String,
    classifier: ErrorClassifier,
}

impl HttpKlingApi {
    pub fn new(client: Client, base_url: impl Into<String>, classifier: ErrorClassifier) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            classifier,
        }
    }

    async fn read_envelope(&self, response: reqwest::Response) -> Result<Value, ProviderError> {
        let status = response.status();
        let body = response.text().await.map_err(ProviderError::from_transport)?;

        if !status.is_success() {
            warn!(provider = "kling", status = status.as_u16(), "kling API error");
            return Err(self.classifier.error(Some(status.as_u16()), &body));
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| {
            ProviderError::transient(format!("unparseable kling response: {}", e))
        })?;

        // Kling reports some failures as HTTP 200 with a non-zero code.
        match value.get("code").and_then(Value::as_i64) {
            Some(0) | None => Ok(value),
            Some(code) => {
                debug!(provider = "kling", code, "kling envelope error");
                Err(self.classifier.error(None, &body))
            }
        }
    }
}

#[async_trait]
impl KlingApi for HttpKlingApi {
    async fn submit(
        &self,
        token: &str,
        endpoint: KlingEndpoint,
        input: &KlingTaskInput,
    ) -> Result<String, ProviderError> {
        let url = format!("{}{}", self.base_url, endpoint.path());
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(input)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let value = self.read_envelope(response).await?;
        value
            .pointer("/data/task_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::new(ErrorKind::Unknown, "kling response had no task_id"))
    }

    async fn query(
        &self,
        token: &str,
        endpoint: KlingEndpoint,
        task_id: &str,
    ) -> Result<Value, ProviderError> {
        let url = format!("{}{}/{}", self.base_url, endpoint.path(), task_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        self.read_envelope(response).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Unknown,
}

impl TaskStatus {
    fn from_token(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "succeed" | "succeeded" | "success" | "successful" | "completed" | "complete"
            | "done" | "finished" => TaskStatus::Succeeded,
            "failed" | "fail" | "failure" | "error" | "errored" | "cancelled" | "canceled"
            | "rejected" => TaskStatus::Failed,
            "submitted" | "queued" | "pending" | "waiting" | "created" | "starting" => {
                TaskStatus::Pending
            }
            "processing" | "running" | "in_progress" | "generating" => TaskStatus::Processing,
            _ => TaskStatus::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedStatus {
    pub status: TaskStatus,
    pub output_url: Option<String>,
    pub duration_seconds: Option<f64>,
    pub message: Option<String>,
}

/// Task objects worth inspecting: `data` as an object, the elements of `data`
/// as an array (one level of nested arrays flattened), then the document root.
fn candidate_objects(raw: &Value) -> Vec<&Value> {
    let mut candidates = Vec::new();
    match raw.get("data") {
        Some(data @ Value::Object(_)) => candidates.push(data),
        Some(Value::Array(items)) => {
            for item in items {
                match item {
                    Value::Object(_) => candidates.push(item),
                    Value::Array(inner) => {
                        candidates.extend(inner.iter().filter(|v| v.is_object()))
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    candidates.push(raw);
    candidates
}

fn status_field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)"(?:[a-z_]*status|state)"\s*:\s*"([^"]+)""#)
            .expect("status pattern compiles")
    })
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn find_first_url(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for key in ["url", "video_url", "uri"] {
                if let Some(url) = map.get(key).and_then(Value::as_str).filter(|u| is_http_url(u)) {
                    return Some(url.to_string());
                }
            }
            map.values().find_map(find_first_url)
        }
        Value::Array(items) => items.iter().find_map(|item| match item {
            Value::String(url) if is_http_url(url) => Some(url.clone()),
            other => find_first_url(other),
        }),
        _ => None,
    }
}

fn parse_duration(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn status_of(candidate: &Value) -> TaskStatus {
    ["task_status", "status", "state"]
        .into_iter()
        .filter_map(|k| candidate.get(k))
        .filter_map(Value::as_str)
        .map(TaskStatus::from_token)
        .find(|s| *s != TaskStatus::Unknown)
        .unwrap_or(TaskStatus::Unknown)
}

/// The single task object a response is read from: the one whose `task_id`
/// matches, else the first terminal one, else the first with any known status.
fn select_candidate<'a>(candidates: &[&'a Value], task_id: Option<&str>) -> Option<&'a Value> {
    let by_id = task_id.and_then(|id| {
        candidates
            .iter()
            .copied()
            .find(|c| c.get("task_id").and_then(Value::as_str) == Some(id))
    });
    by_id
        .or_else(|| candidates.iter().copied().find(|c| status_of(c).is_terminal()))
        .or_else(|| {
            candidates
                .iter()
                .copied()
                .find(|c| status_of(c) != TaskStatus::Unknown)
        })
}

/// Reduces a poll response of any observed shape to a status, the first usable
/// video URL and the provider's message.
pub fn normalize_status(raw: &Value) -> NormalizedStatus {
    normalize_status_for(raw, None)
}

/// Like [`normalize_status`], but when the response lists several tasks the
/// one with `task_id` is preferred. Status, URL, duration and message always
/// come from the same task object.
pub fn normalize_status_for(raw: &Value, task_id: Option<&str>) -> NormalizedStatus {
    let candidates = candidate_objects(raw);
    let selected = select_candidate(&candidates, task_id).unwrap_or(raw);
    // root plus at most one task object: scanning the whole document is safe
    let scope = if candidates.len() <= 2 { raw } else { selected };

    let mut status = status_of(selected);
    if status == TaskStatus::Unknown {
        let text = scope.to_string();
        status = status_field_regex()
            .captures_iter(&text)
            .filter_map(|c| c.get(1))
            .map(|m| TaskStatus::from_token(m.as_str()))
            .find(|s| *s != TaskStatus::Unknown)
            .unwrap_or(TaskStatus::Unknown);
    }

    let output_url = selected
        .get("task_result")
        .and_then(find_first_url)
        .or_else(|| find_first_url(scope));

    let duration_seconds = selected
        .pointer("/task_result/videos/0/duration")
        .and_then(parse_duration);

    let message = selected
        .get("task_status_msg")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .or_else(|| raw.get("message").and_then(Value::as_str))
        .map(str::to_string);

    NormalizedStatus {
        status,
        output_url,
        duration_seconds,
        message,
    }
}

/// Kling takes an http(s) URL or bare base64. Anything else (a `gs://` URI)
/// is rejected instead of quietly turning the job into text-to-video.
fn raw_image(image: Option<&ImageInput>, role: &str) -> Result<Option<String>, ProviderError> {
    match image {
        None => Ok(None),
        Some(image) => image.for_raw_provider().map(Some).ok_or_else(|| {
            ProviderError::invalid_request(format!(
                "kling {} must be an http(s) URL or inline image data",
                role
            ))
        }),
    }
}

#[derive(Debug)]
struct PollState {
    task_id: String,
    attempt: u32,
    signature_failures: u32,
    terminal: bool,
}

impl PollState {
    fn new(task_id: String) -> Self {
        Self {
            task_id,
            attempt: 0,
            signature_failures: 0,
            terminal: false,
        }
    }
}

pub struct KlingAdapter {
    api: Arc<dyn KlingApi>,
    signer: TokenSigner,
    config: ModelConfig,
    settings: KlingSettings,
    backoff: BackoffPolicy,
    classifier: ErrorClassifier,
}

impl KlingAdapter {
    pub fn new(
        api: Arc<dyn KlingApi>,
        signer: TokenSigner,
        config: ModelConfig,
        settings: KlingSettings,
        backoff: BackoffPolicy,
        classifier: ErrorClassifier,
    ) -> Self {
        Self {
            api,
            signer,
            config,
            settings,
            backoff,
            classifier,
        }
    }

    pub fn build_task_input(
        &self,
        request: &GenerationRequest,
    ) -> Result<(KlingEndpoint, KlingTaskInput), ProviderError> {
        let params = &request.params;
        let image = raw_image(request.reference_images.first(), "start image")?;
        let image_tail = raw_image(request.end_image.as_ref(), "end image")?;

        let endpoint = if image.is_some() {
            KlingEndpoint::ImageToVideo
        } else {
            KlingEndpoint::TextToVideo
        };

        let mut sound = params.generate_audio;
        if sound && image_tail.is_some() {
            warn!(
                provider = "kling",
                request_id = %request.id,
                "audio is not available with an end frame, disabling audio"
            );
            sound = false;
        }

        let mode = params.mode.clone().unwrap_or_else(|| {
            if params.resolution.as_deref() == Some("1080p") {
                "pro".to_string()
            } else {
                "std".to_string()
            }
        });

        let input = KlingTaskInput {
            model_name: self.config.upstream_model().to_string(),
            prompt: request.prompt.clone(),
            negative_prompt: params.negative_prompt.clone(),
            duration: params.duration_seconds.unwrap_or(5).to_string(),
            // image2video derives the frame from the start image
            aspect_ratio: match endpoint {
                KlingEndpoint::TextToVideo => {
                    Some(params.aspect_ratio.clone().unwrap_or_else(|| "16:9".to_string()))
                }
                KlingEndpoint::ImageToVideo => None,
            },
            mode,
            image,
            image_tail,
            sound: if sound { "on" } else { "off" }.to_string(),
        };

        Ok((endpoint, input))
    }

    /// One submission, re-signed on every invalid-signature rejection.
    async fn submit_signed(
        &self,
        endpoint: KlingEndpoint,
        input: &KlingTaskInput,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let attempts = self.settings.submit_signature_attempts.max(1);
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::cancelled());
            }
            attempt += 1;
            let token = self.signer.sign()?;
            match self.api.submit(&token, endpoint, input).await {
                Ok(task_id) => return Ok(task_id),
                Err(e) if e.kind == ErrorKind::AuthSignatureTransient && attempt < attempts => {
                    warn!(
                        provider = "kling",
                        attempt,
                        max_attempts = attempts,
                        "submission signature rejected, re-signing"
                    );
                }
                Err(e) if e.kind == ErrorKind::AuthSignatureTransient => {
                    return Err(ProviderError::new(
                        ErrorKind::AuthSignatureTransient,
                        format!(
                            "kling rejected the request signature {} times: {}",
                            attempts, e.message
                        ),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn submit_task(
        &self,
        endpoint: KlingEndpoint,
        input: &KlingTaskInput,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let task_id = retry_with_backoff(&self.backoff, "kling.submit", cancel, |_| {
            self.submit_signed(endpoint, input, cancel)
        })
        .await?;
        info!(provider = "kling", task_id = %task_id, endpoint = endpoint.path(), "task submitted");
        Ok(task_id)
    }

    pub async fn poll_task(
        &self,
        endpoint: KlingEndpoint,
        task_id: String,
        cancel: &CancellationToken,
    ) -> Result<Output, ProviderError> {
        let mut state = PollState::new(task_id);

        while !state.terminal {
            if state.attempt >= self.settings.max_poll_attempts {
                warn!(
                    provider = "kling",
                    task_id = %state.task_id,
                    attempts = state.attempt,
                    "poll ceiling reached"
                );
                return Err(ProviderError::timeout(format!(
                    "kling task {} did not finish after {} polls",
                    state.task_id, state.attempt
                )));
            }

            sleep_or_cancel(self.settings.poll_interval, cancel).await?;
            state.attempt += 1;

            let token = self.signer.sign()?;
            let raw = match self.api.query(&token, endpoint, &state.task_id).await {
                Ok(raw) => {
                    state.signature_failures = 0;
                    raw
                }
                Err(e) if e.kind == ErrorKind::AuthSignatureTransient => {
                    state.signature_failures += 1;
                    warn!(
                        provider = "kling",
                        task_id = %state.task_id,
                        attempt = state.attempt,
                        signature_failures = state.signature_failures,
                        "poll signature rejected"
                    );
                    if state.signature_failures >= self.settings.poll_signature_tolerance {
                        return Err(ProviderError::new(
                            ErrorKind::AuthSignatureTransient,
                            format!(
                                "kling rejected {} consecutive poll signatures: {}",
                                state.signature_failures, e.message
                            ),
                        ));
                    }
                    continue;
                }
                Err(e) if e.kind.is_retryable() || e.kind == ErrorKind::Unknown => {
                    warn!(
                        provider = "kling",
                        task_id = %state.task_id,
                        attempt = state.attempt,
                        error = %e,
                        "poll failed, continuing"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            let normalized = normalize_status_for(&raw, Some(state.task_id.as_str()));
            debug!(
                provider = "kling",
                task_id = %state.task_id,
                attempt = state.attempt,
                status = ?normalized.status,
                "poll"
            );
            state.terminal = normalized.status.is_terminal();

            match normalized.status {
                TaskStatus::Succeeded => {
                    let url = normalized.output_url.ok_or_else(|| {
                        ProviderError::new(
                            ErrorKind::Unknown,
                            format!("kling task {} succeeded without a video url", state.task_id),
                        )
                    })?;
                    let mut output = Output::new(url)
                        .with_metric("task_id", Value::String(state.task_id.clone()))
                        .with_metric("poll_attempts", Value::from(state.attempt));
                    if let Some(duration) = normalized.duration_seconds {
                        output = output.with_duration(duration);
                    }
                    return Ok(output);
                }
                TaskStatus::Failed => {
                    let message = normalized
                        .message
                        .unwrap_or_else(|| "kling task failed".to_string());
                    let mut error = self.classifier.error(None, &message);
                    if error.kind == ErrorKind::Unknown {
                        error.message = format!("kling task {} failed: {}", state.task_id, message);
                    }
                    return Err(error);
                }
                _ => {}
            }
        }

        Err(ProviderError::new(ErrorKind::Unknown, "poll loop ended without a result"))
    }
}

#[async_trait]
impl ModelAdapter for KlingAdapter {
    fn provider_name(&self) -> &str {
        "kling"
    }

    fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    fn validate_request(&self, request: &GenerationRequest) -> Result<(), ProviderError> {
        self.config.validate_request(request)?;
        raw_image(request.reference_images.first(), "start image")?;
        raw_image(request.end_image.as_ref(), "end image")?;
        Ok(())
    }

    async fn execute(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Generated, ProviderError> {
        if !self.signer.is_configured() {
            return Err(ProviderError::unavailable("kling credentials are not configured"));
        }

        let (endpoint, input) = self.build_task_input(request)?;
        let task_id = self.submit_task(endpoint, &input, cancel).await?;
        let output = self.poll_task(endpoint, task_id, cancel).await?;
        Ok(vec![output].into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::catalog::{ModelCatalog, KLING_VIDEO_MODEL};
    use crate::models::types::GenerationResult;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedKlingApi {
        submits: Mutex<VecDeque<Result<String, ProviderError>>>,
        queries: Mutex<VecDeque<Result<Value, ProviderError>>>,
        submitted: Mutex<Vec<KlingTaskInput>>,
        tokens: Mutex<Vec<String>>,
        query_calls: Mutex<u32>,
        cancel_after: Option<(u32, CancellationToken)>,
    }

    impl ScriptedKlingApi {
        fn with_submits(self, submits: Vec<Result<String, ProviderError>>) -> Self {
            *self.submits.lock() = submits.into();
            self
        }

        fn with_queries(self, queries: Vec<Result<Value, ProviderError>>) -> Self {
            *self.queries.lock() = queries.into();
            self
        }

        fn cancelling_after(mut self, polls: u32, cancel: &CancellationToken) -> Self {
            self.cancel_after = Some((polls, cancel.clone()));
            self
        }
    }

    #[async_trait]
    impl KlingApi for ScriptedKlingApi {
        async fn submit(
            &self,
            token: &str,
            _endpoint: KlingEndpoint,
            input: &KlingTaskInput,
        ) -> Result<String, ProviderError> {
            self.tokens.lock().push(token.to_string());
            self.submitted.lock().push(input.clone());
            self.submits
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("task-1".to_string()))
        }

        async fn query(
            &self,
            token: &str,
            _endpoint: KlingEndpoint,
            _task_id: &str,
        ) -> Result<Value, ProviderError> {
            self.tokens.lock().push(token.to_string());
            let calls = {
                let mut calls = self.query_calls.lock();
                *calls += 1;
                *calls
            };
            if let Some((after, cancel)) = &self.cancel_after {
                if calls == *after {
                    cancel.cancel();
                }
            }
            self.queries
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"code": 0, "data": {"task_status": "processing"}})))
        }
    }

    fn signature_error() -> ProviderError {
        let body = r#"{"code":1004,"message":"Authorization signature is invalid"}"#;
        ErrorClassifier::default().error(Some(401), body)
    }

    fn succeeded() -> Value {
        json!({
            "code": 0,
            "message": "SUCCEED",
            "data": {
                "task_id": "task-1",
                "task_status": "succeed",
                "task_result": {
                    "videos": [{"id": "v1", "url": "https://cdn.test/v1.mp4", "duration": "5.1"}]
                }
            }
        })
    }

    fn cat() -> GenerationRequest {
        GenerationRequest::new(KLING_VIDEO_MODEL, "a cat")
    }

    fn fast_settings() -> KlingSettings {
        KlingSettings {
            poll_interval: Duration::ZERO,
            ..KlingSettings::default()
        }
    }

    fn adapter(api: Arc<ScriptedKlingApi>) -> KlingAdapter {
        KlingAdapter::new(
            api,
            TokenSigner::new("ak", "sk"),
            ModelCatalog::builtin().get(KLING_VIDEO_MODEL).cloned().unwrap(),
            fast_settings(),
            BackoffPolicy {
                max_attempts: 5,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                jitter_max: Duration::ZERO,
            },
            ErrorClassifier::default(),
        )
    }

    #[tokio::test]
    async fn test_signature_failures_resubmit_until_success() {
        let api = Arc::new(ScriptedKlingApi::default().with_submits(vec![
            Err(signature_error()),
            Err(signature_error()),
            Ok("task-3".to_string()),
        ]));
        let adapter = adapter(api.clone());
        let request = GenerationRequest::new(KLING_VIDEO_MODEL, "a cat");
        let (endpoint, input) = adapter.build_task_input(&request).unwrap();

        let task_id = adapter
            .submit_task(endpoint, &input, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(task_id, "task-3");
        assert_eq!(api.submitted.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_signature_failures_are_bounded_on_submit() {
        let api = Arc::new(ScriptedKlingApi::default().with_submits(vec![
            Err(signature_error()),
            Err(signature_error()),
            Err(signature_error()),
            Ok("never".to_string()),
        ]));
        let adapter = adapter(api.clone());
        let result = adapter
            .generate(&cat(), &CancellationToken::new())
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::AuthSignatureTransient));
        assert_eq!(api.submitted.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_poll_ceiling_yields_timeout() {
        let api = Arc::new(ScriptedKlingApi::default());
        let adapter = adapter(api.clone());
        let result = adapter
            .generate(&cat(), &CancellationToken::new())
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(*api.query_calls.lock(), 180);
    }

    #[tokio::test]
    async fn test_end_frame_disables_audio() {
        let api = Arc::new(ScriptedKlingApi::default().with_queries(vec![Ok(succeeded())]));
        let adapter = adapter(api.clone());
        let request = GenerationRequest::new(KLING_VIDEO_MODEL, "a cat")
            .with_reference_image(ImageInput::data_url("data:image/png;base64,U1RBUlQ="))
            .with_end_image(ImageInput::url("https://cdn.test/end.png"))
            .with_audio(true);

        let result = adapter.generate(&request, &CancellationToken::new()).await;
        assert!(result.is_completed());

        let submitted = api.submitted.lock();
        assert_eq!(submitted[0].sound, "off");
        assert_eq!(submitted[0].image.as_deref(), Some("U1RBUlQ="));
        assert_eq!(submitted[0].image_tail.as_deref(), Some("https://cdn.test/end.png"));
    }

    #[tokio::test]
    async fn test_completed_video_and_fresh_tokens() {
        let api = Arc::new(ScriptedKlingApi::default().with_queries(vec![
            Ok(json!({"code": 0, "data": {"task_status": "submitted"}})),
            Ok(succeeded()),
        ]));
        let adapter = adapter(api.clone());
        let request = GenerationRequest::new(KLING_VIDEO_MODEL, "a cat").with_audio(true);

        let result = adapter.generate(&request, &CancellationToken::new()).await;
        let GenerationResult::Completed { outputs, .. } = result else {
            panic!("expected completion");
        };
        assert_eq!(outputs[0].url, "https://cdn.test/v1.mp4");
        assert_eq!(outputs[0].duration_seconds, Some(5.1));
        assert_eq!(api.submitted.lock()[0].sound, "on");
        // one submit and two polls, each signed
        assert_eq!(api.tokens.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_poll_signature_failures_are_tolerated() {
        let mut queries: Vec<Result<Value, ProviderError>> =
            (0..19).map(|_| Err(signature_error())).collect();
        queries.push(Ok(succeeded()));
        let api = Arc::new(ScriptedKlingApi::default().with_queries(queries));
        let adapter = adapter(api);

        let result = adapter
            .generate(&cat(), &CancellationToken::new())
            .await;
        assert!(result.is_completed());
    }

    #[tokio::test]
    async fn test_poll_signature_tolerance_is_bounded() {
        let queries: Vec<Result<Value, ProviderError>> =
            (0..25).map(|_| Err(signature_error())).collect();
        let api = Arc::new(ScriptedKlingApi::default().with_queries(queries));
        let adapter = adapter(api.clone());

        let result = adapter
            .generate(&cat(), &CancellationToken::new())
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::AuthSignatureTransient));
        assert_eq!(*api.query_calls.lock(), 20);
    }

    #[tokio::test]
    async fn test_failed_task_carries_message() {
        let api = Arc::new(ScriptedKlingApi::default().with_queries(vec![Ok(json!({
            "code": 0,
            "data": {
                "task_status": "failed",
                "task_status_msg": "Failure to pass the risk control system"
            }
        }))]));
        let adapter = adapter(api);
        let result = adapter
            .generate(&cat(), &CancellationToken::new())
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::ContentSafetyBlocked));
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let api = Arc::new(ScriptedKlingApi::default());
        let adapter = adapter(api);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = adapter
            .generate(&GenerationRequest::new(KLING_VIDEO_MODEL, "a cat"), &cancel)
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_cancellation_mid_poll_stops_querying() {
        let cancel = CancellationToken::new();
        let api = Arc::new(ScriptedKlingApi::default().cancelling_after(3, &cancel));
        let adapter = adapter(api.clone());

        let result = adapter
            .generate(&GenerationRequest::new(KLING_VIDEO_MODEL, "a cat"), &cancel)
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
        assert_eq!(api.submitted.lock().len(), 1);
        assert_eq!(*api.query_calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_unsupported_image_uri_is_rejected() {
        let api = Arc::new(ScriptedKlingApi::default().with_queries(vec![Ok(succeeded())]));
        let adapter = adapter(api.clone());

        let start = GenerationRequest::new(KLING_VIDEO_MODEL, "a cat")
            .with_reference_image(ImageInput::from_source("gs://bucket/start.png"));
        let err = adapter.validate_request(&start).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert!(err.message.contains("start image"));
        assert_eq!(
            adapter.build_task_input(&start).unwrap_err().kind,
            ErrorKind::InvalidRequest
        );

        let end = GenerationRequest::new(KLING_VIDEO_MODEL, "a cat")
            .with_reference_image(ImageInput::url("https://cdn.test/start.png"))
            .with_end_image(ImageInput::from_source("gs://bucket/end.png"));
        let result = adapter.generate(&end, &CancellationToken::new()).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::InvalidRequest));

        assert!(api.submitted.lock().is_empty());
    }

    #[test]
    fn test_normalize_object_shape() {
        let normalized = normalize_status(&succeeded());
        assert_eq!(normalized.status, TaskStatus::Succeeded);
        assert_eq!(normalized.output_url.as_deref(), Some("https://cdn.test/v1.mp4"));
    }

    #[test]
    fn test_normalize_array_shape() {
        let raw = json!({
            "code": 0,
            "data": [
                {"task_id": "a", "task_status": "processing"},
                {
                    "task_id": "b",
                    "task_status": "succeed",
                    "task_result": {"videos": [{"url": "https://cdn.test/b.mp4"}]}
                }
            ]
        });
        let normalized = normalize_status(&raw);
        assert_eq!(normalized.status, TaskStatus::Succeeded);
        assert_eq!(normalized.output_url.as_deref(), Some("https://cdn.test/b.mp4"));

        let own_task = normalize_status_for(&raw, Some("a"));
        assert_eq!(own_task.status, TaskStatus::Processing);
        assert_eq!(own_task.output_url, None);

        let other = normalize_status_for(&raw, Some("b"));
        assert_eq!(other.status, TaskStatus::Succeeded);
        assert_eq!(other.output_url.as_deref(), Some("https://cdn.test/b.mp4"));

        let nested = json!({"data": [[{"task_status": "failed", "task_status_msg": "bad input"}]]});
        let normalized = normalize_status(&nested);
        assert_eq!(normalized.status, TaskStatus::Failed);
        assert_eq!(normalized.message.as_deref(), Some("bad input"));
    }

    #[test]
    fn test_normalize_heuristic_scan() {
        let raw = json!({
            "code": 0,
            "payload": {"job": {"taskStatus": "SUCCEED"}},
            "result": ["https://cdn.test/x.mp4"]
        });
        let normalized = normalize_status(&raw);
        assert_eq!(normalized.status, TaskStatus::Succeeded);
        assert_eq!(normalized.output_url.as_deref(), Some("https://cdn.test/x.mp4"));

        let unknown = json!({"code": 0, "message": "SUCCEED"});
        assert_eq!(normalize_status(&unknown).status, TaskStatus::Unknown);
    }
}
