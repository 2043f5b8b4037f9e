use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::app::AppState;
use crate::models::types::{GenerationRequest, ImageInput};
use crate::models::webhook::{WebhookEvent, WebhookSubmitter};

#[derive(Parser, Debug)]
#[command(name = "mediagen")]
#[command(about = "Image and video generation across providers with rate-limit aware fallback")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate images or a video and wait for the result
    Generate(GenerateArgs),

    /// Show which provider would serve a model right now
    Route {
        /// Catalog model id
        model: String,
    },

    /// List catalog models and the tiers configured for them
    Models,

    /// Webhook-completed jobs
    Webhook {
        #[command(subcommand)]
        action: WebhookCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum WebhookCommand {
    /// Submit a job; the result is delivered to the configured callback URL
    Submit(GenerateArgs),

    /// Look up a submitted job
    Status { id: String },

    /// Cancel a submitted job
    Cancel { id: String },

    /// Normalize a callback payload saved to a file
    Parse { path: String },
}

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    /// Catalog model id
    #[arg(short, long)]
    pub model: String,

    /// Text prompt
    #[arg(short, long)]
    pub prompt: String,

    #[arg(long)]
    pub aspect_ratio: Option<String>,

    #[arg(long)]
    pub resolution: Option<String>,

    /// Video length in seconds
    #[arg(long)]
    pub duration: Option<u32>,

    /// Number of outputs
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: u32,

    /// Reference image: URL, data URL, or local file (repeatable)
    #[arg(short, long = "image")]
    pub images: Vec<String>,

    /// Last frame for frame-interpolated video
    #[arg(long)]
    pub end_image: Option<String>,

    /// Generate an audio track where supported
    #[arg(long)]
    pub audio: bool,

    #[arg(long)]
    pub negative_prompt: Option<String>,

    #[arg(long)]
    pub seed: Option<u64>,
}

/// JSON printed by the binary, and whether the command succeeded.
#[derive(Debug)]
pub struct CommandOutput {
    pub json: Value,
    pub success: bool,
}

impl CommandOutput {
    fn ok(json: Value) -> Self {
        Self { json, success: true }
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/png",
    }
}

/// Remote and `data:` sources pass through; anything else is read from disk.
pub async fn load_image(source: &str) -> anyhow::Result<ImageInput> {
    let is_remote = ["http://", "https://", "gs://", "data:"]
        .iter()
        .any(|prefix| source.starts_with(prefix));
    if is_remote {
        return Ok(ImageInput::from_source(source));
    }

    let path = Path::new(source);
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read image {}", source))?;
    Ok(ImageInput::bytes(mime_for(path), &bytes))
}

impl GenerateArgs {
    pub async fn to_request(&self) -> anyhow::Result<GenerationRequest> {
        let mut request = GenerationRequest::new(&self.model, &self.prompt)
            .with_output_count(self.count)
            .with_audio(self.audio);

        if let Some(ratio) = &self.aspect_ratio {
            request = request.with_aspect_ratio(ratio);
        }
        if let Some(resolution) = &self.resolution {
            request = request.with_resolution(resolution);
        }
        if let Some(seconds) = self.duration {
            request = request.with_duration(seconds);
        }
        for source in &self.images {
            request = request.with_reference_image(load_image(source).await?);
        }
        if let Some(source) = &self.end_image {
            request = request.with_end_image(load_image(source).await?);
        }
        request.params.negative_prompt = self.negative_prompt.clone();
        request.params.seed = self.seed;

        Ok(request)
    }
}

pub async fn execute(
    command: Commands,
    state: &AppState,
    cancel: CancellationToken,
) -> anyhow::Result<CommandOutput> {
    let orchestrator = state.orchestrator();

    match command {
        Commands::Generate(args) => {
            let request = args.to_request().await?;
            let generation = orchestrator.generate(&request, &cancel).await;
            Ok(CommandOutput {
                success: generation.result.is_completed(),
                json: serde_json::to_value(&generation)?,
            })
        }
        Commands::Route { model } => match orchestrator.route(&model).await {
            Ok(decision) => Ok(CommandOutput::ok(serde_json::to_value(&decision)?)),
            Err(e) => Ok(CommandOutput {
                json: serde_json::to_value(&e)?,
                success: false,
            }),
        },
        Commands::Models => Ok(CommandOutput::ok(serde_json::to_value(state.serving())?)),
        Commands::Webhook { action } => execute_webhook(action, state).await,
    }
}

fn submitter(state: &AppState) -> anyhow::Result<&WebhookSubmitter> {
    match state.orchestrator().webhook() {
        Some(webhook) => Ok(webhook),
        None => bail!("webhook.callback_url and a Replicate token must be configured"),
    }
}

async fn execute_webhook(
    action: WebhookCommand,
    state: &AppState,
) -> anyhow::Result<CommandOutput> {
    let json = match action {
        WebhookCommand::Submit(args) => {
            submitter(state)?;
            let request = args.to_request().await?;
            serde_json::to_value(state.orchestrator().submit_with_webhook(&request).await?)?
        }
        WebhookCommand::Status { id } => {
            serde_json::to_value(submitter(state)?.status(&id).await?)?
        }
        WebhookCommand::Cancel { id } => {
            json!({ "prediction_id": id, "status": submitter(state)?.cancel(&id).await? })
        }
        WebhookCommand::Parse { path } => {
            let body = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path))?;
            let event = WebhookEvent::parse(&body)?;
            let result = event.to_result(&state.config().classifier_for("replicate"));
            json!({
                "prediction_id": event.id(),
                "status": event.prediction.status,
                "result": result,
            })
        }
    };
    Ok(CommandOutput::ok(json))
}
