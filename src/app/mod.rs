pub mod config;
pub mod state;

pub use config::{AppConfig, PollSettings, ProviderConfig, RetrySettings, WebhookSettings};
pub use state::{AppState, ModelServing};
