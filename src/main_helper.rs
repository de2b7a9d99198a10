use crate::constants::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_CONNECTION_TIMEOUT_MS, DEFAULT_MAX_DELAY_MS,
    DEFAULT_MAX_RETRIES, DEFAULT_SUBMISSION_TIMEOUT_MS,
};
use crate::hardening::RetryConfig;
use crate::panel::StreamConfig;
use crate::types::*;
use clap::Parser;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Prompt sent as the user message.
    pub prompt: String,
    #[arg(long, default_value = "http://localhost:3080/api/ask")]
    pub base_url: String,
    #[arg(long, default_value = "openAI")]
    pub endpoint: String,
    #[arg(long)]
    pub model: Option<String>,
    /// Runs a second panel side by side with this model.
    #[arg(long)]
    pub compare_model: Option<String>,
    /// Endpoint of the comparison panel; defaults to `--endpoint`.
    #[arg(long)]
    pub compare_endpoint: Option<String>,
    #[arg(long)]
    pub conversation_id: Option<String>,
    #[arg(long)]
    pub parent_message_id: Option<String>,
    #[arg(long, default_value_t = false)]
    pub temporary: bool,
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
    #[arg(long, default_value_t = DEFAULT_BASE_DELAY_MS)]
    pub base_delay_ms: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_DELAY_MS)]
    pub max_delay_ms: u64,
    #[arg(long, default_value_t = DEFAULT_CONNECTION_TIMEOUT_MS)]
    pub connection_timeout_ms: u64,
    #[arg(long, default_value_t = DEFAULT_SUBMISSION_TIMEOUT_MS)]
    pub submission_timeout_ms: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = false)]
    pub enable_debug_capture: bool,
    #[arg(long, default_value = "debug_capture")]
    pub capture_dir: PathBuf,
    #[arg(long, default_value = ".")]
    pub log_dir: PathBuf,
}

impl Args {
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            retry: RetryConfig {
                max_retries: self.max_retries,
                base_delay_ms: self.base_delay_ms,
                max_delay_ms: self.max_delay_ms,
                connection_timeout_ms: self.connection_timeout_ms,
                ..RetryConfig::default()
            },
            submission_timeout_ms: self.submission_timeout_ms,
            debug_capture_dir: self
                .enable_debug_capture
                .then(|| self.capture_dir.clone()),
            ..StreamConfig::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(DuetError::Config("prompt must not be empty".into()).into());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(DuetError::Config(format!(
                "max delay {}ms is below base delay {}ms",
                self.max_delay_ms, self.base_delay_ms
            ))
            .into());
        }
        if let Err(e) = reqwest::Url::parse(&self.base_url) {
            return Err(DuetError::Config(format!("invalid base url '{}': {}", self.base_url, e)).into());
        }
        Ok(())
    }

    pub fn primary_submission(&self) -> Submission {
        build_submission(self, &self.endpoint, self.model.as_deref())
    }

    pub fn comparison_submission(&self) -> Option<Submission> {
        let model = self.compare_model.as_deref()?;
        let endpoint = self.compare_endpoint.as_deref().unwrap_or(&self.endpoint);
        Some(build_submission(self, endpoint, Some(model)))
    }
}

/// Each panel gets its own user and response ids, so two panels never share
/// a message key even for the same prompt.
pub fn build_submission(args: &Args, endpoint: &str, model: Option<&str>) -> Submission {
    let conversation_id = args
        .conversation_id
        .clone()
        .unwrap_or_else(|| crate::constants::NEW_CONVERSATION_ID.to_string());
    let user_message = Message {
        message_id: Uuid::new_v4().to_string(),
        parent_message_id: args.parent_message_id.clone(),
        conversation_id: Some(conversation_id.clone()),
        text: args.prompt.clone(),
        is_created_by_user: true,
        ..Default::default()
    };
    let initial_response = Message {
        message_id: Uuid::new_v4().to_string(),
        parent_message_id: Some(user_message.message_id.clone()),
        conversation_id: Some(conversation_id.clone()),
        unfinished: true,
        ..Default::default()
    };
    Submission {
        user_message,
        messages: Vec::new(),
        conversation_id: Some(conversation_id),
        endpoint: EndpointOptions {
            endpoint: endpoint.to_string(),
            model: model.map(str::to_string),
            base_url: args.base_url.clone(),
            options: Default::default(),
        },
        initial_response,
        is_temporary: args.temporary,
        ..Default::default()
    }
}

pub fn build_client(args: &Args) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .tcp_keepalive(Some(std::time::Duration::from_secs(60)))
        .build()
        .map_err(DuetError::Network)?;
    Ok(client)
}
