use clap::Parser;
use colored::*;
use duet::collaborators::{
    Collaborators, HttpAbortClient, HttpTokenRefresher, MessageStore, StaticToken, TokenProvider,
};
use duet::main_helper::{build_client, Args};
use duet::panel::{PanelHandle, PanelOutcome, PanelRegistry};
use duet::redaction::RedactingWriter;
use duet::transport::HttpTransport;
use duet::types::{ContentPart, Message, PanelId, PanelStatus, Side};
use std::sync::Arc;

/// Store for the terminal: only status changes are shown while streaming.
struct ConsoleStore;

impl MessageStore for ConsoleStore {
    fn set_messages(&self, panel: PanelId, messages: Vec<Message>) {
        tracing::trace!("[⚙️ ] {} emitted {} messages", panel, messages.len());
    }

    fn set_status(&self, panel: PanelId, status: PanelStatus) {
        let line = format!("[{}] {}", panel.side, status);
        match status {
            PanelStatus::Reconnecting { .. } => eprintln!("{}", line.yellow()),
            PanelStatus::Failed { .. } => eprintln!("{}", line.red()),
            _ => tracing::debug!("{}", line),
        }
    }
}

fn side_label(side: Side) -> ColoredString {
    match side {
        Side::Primary => format!("[{}]", side).cyan().bold(),
        Side::Secondary => format!("[{}]", side).magenta().bold(),
    }
}

fn print_outcome(side: Side, outcome: &PanelOutcome) {
    let label = side_label(side);
    let response = outcome.messages().last();
    match outcome {
        PanelOutcome::Completed { .. } => {
            let text = response.map(|m| m.text.as_str()).unwrap_or_default();
            println!("{} {}", label, text);
        }
        PanelOutcome::Cancelled => println!("{} {}", label, "cancelled".dimmed()),
        PanelOutcome::Failed { error, .. } => {
            let partial = response.map(|m| m.text.as_str()).unwrap_or_default();
            if !partial.is_empty() {
                println!("{} {}", label, partial);
            }
            println!("{} {}", label, format!("error: {}", error.inner).red());
        }
    }
    if let Some(message) = response {
        for part in message.parts() {
            if let ContentPart::ToolCall { tool_call } = part {
                let name = tool_call.name.as_deref().unwrap_or("tool");
                println!("{}   {} {}", label, "tool".dimmed(), name);
            }
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "duet=info".into(),
    };

    let file_appender = tracing_appender::rolling::daily(&args.log_dir, "duet.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(move || RedactingWriter::new(non_blocking.clone()))
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(tracing_subscriber::filter::LevelFilter::WARN),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    duet::logging::setup_panic_hook();

    if let Err(e) = args.validate() {
        eprintln!("{}", format!("Invalid arguments: {}", e.inner).red());
        std::process::exit(2);
    }

    let client = match build_client(&args) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let token = std::env::var("DUET_TOKEN").ok().filter(|t| !t.is_empty());
    let tokens: Arc<dyn TokenProvider> = match std::env::var("DUET_REFRESH_URL") {
        Ok(url) if !url.is_empty() => Arc::new(HttpTokenRefresher::new(client.clone(), url, token)),
        _ => Arc::new(StaticToken::new(token)),
    };

    let collaborators = Collaborators::new(Arc::new(ConsoleStore))
        .with_tokens(tokens)
        .with_aborter(Arc::new(HttpAbortClient::new(client.clone())));
    let registry = PanelRegistry::new(
        Arc::new(HttpTransport::new(client)),
        collaborators,
        args.stream_config(),
    );

    let handles: Vec<PanelHandle> = match args.comparison_submission() {
        Some(secondary) => {
            let (a, b) = registry.submit_comparison(args.primary_submission(), secondary);
            vec![a, b]
        }
        None => vec![registry.submit(Side::Primary, args.primary_submission())],
    };
    let sides: Vec<Side> = handles.iter().map(|h| h.id().side).collect();

    let joined = futures_util::future::join_all(handles.into_iter().map(PanelHandle::join));
    tokio::pin!(joined);

    let outcomes = tokio::select! {
        outcomes = &mut joined => outcomes,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", "Cancelling...".yellow());
            for side in &sides {
                registry.cancel(*side).await;
            }
            joined.await
        }
    };

    let mut failed = false;
    for (side, outcome) in sides.iter().zip(outcomes.iter()) {
        print_outcome(*side, outcome);
        failed |= matches!(outcome, PanelOutcome::Failed { .. });
    }
    if failed {
        std::process::exit(1);
    }
}
