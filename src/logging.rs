use colored::*;
use std::panic;
use tracing::{error, info, warn};

use crate::assembler::StepOutcome;
use crate::dispatcher::Dispatch;
use crate::types::{ContentPart, Message, PanelId};

/// Sets up a global panic hook that logs panics using tracing before the
/// default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per-connection counters, logged once when the connection ends.
#[derive(Default, Debug, Clone)]
pub struct StreamMetric {
    pub frames: usize,
    pub applied: usize,
    pub dropped: usize,
    pub rejected: usize,
    pub text_chars: usize,
    pub tool_names: Vec<String>,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, dispatch: &Dispatch) {
        self.frames += 1;
        match dispatch {
            Dispatch::Applied(StepOutcome::Applied { appended_text }) => {
                self.applied += 1;
                self.text_chars += appended_text.chars().count();
            }
            Dispatch::Applied(StepOutcome::Dropped(_)) => self.dropped += 1,
            Dispatch::Rejected(_) => self.rejected += 1,
            Dispatch::Final(_) | Dispatch::Done => {}
        }
    }

    /// Collects tool names from the finished response.
    pub fn record_tools(&mut self, response: &Message) {
        for part in response.parts() {
            if let ContentPart::ToolCall { tool_call } = part {
                if let Some(name) = tool_call.name.as_ref().filter(|n| !n.is_empty()) {
                    self.tool_names.push(name.clone());
                }
            }
        }
    }

    pub fn log_summary(&self, panel: PanelId, outcome: &str) {
        let tools_str = if self.tool_names.is_empty() {
            "0".to_string()
        } else {
            format!("{} ({})", self.tool_names.len(), self.tool_names.join(", "))
        };

        if self.dropped + self.rejected > 0 {
            warn!(
                target: "flight_recorder",
                "{}",
                format!(
                    "[STREAM END] {} discarded {} frames ({} dropped, {} rejected)",
                    panel,
                    self.dropped + self.rejected,
                    self.dropped,
                    self.rejected
                )
                .yellow()
            );
        }

        info!(
            target: "flight_recorder",
            "[STREAM END] Panel: {} | Outcome: {} | Frames: {} | Applied: {} | Tools: {} | Text: {} chars",
            panel, outcome, self.frames, self.applied, tools_str, self.text_chars
        );
    }
}
