use crate::redaction::{redact_text, redact_value, RedactionLevel};
use crate::str_utils;
use crate::types::{PanelId, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

const MAX_CAPTURE_FILES: usize = 256;

/// Per-panel record of lifecycle decisions and notable payloads, written to
/// disk when the panel finishes if debug capture is enabled.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct FlightRecorder {
    pub panel_id: String,
    pub side: String,
    pub model: String,
    pub conversation_id: String,
    pub decisions: Vec<String>,
    pub stages: std::collections::HashMap<String, Value>,
    #[serde(skip)]
    pub redaction_level: RedactionLevel,
}

impl FlightRecorder {
    pub fn new(panel: PanelId, model: &str, conversation_id: &str) -> Self {
        Self {
            panel_id: panel.to_string(),
            side: panel.side.to_string(),
            model: model.to_string(),
            conversation_id: conversation_id.to_string(),
            decisions: Vec::new(),
            stages: std::collections::HashMap::new(),
            redaction_level: RedactionLevel::from_env(),
        }
    }

    pub fn record_decision(&mut self, decision: impl Into<String>) {
        let stamp = chrono::Utc::now().format("%H:%M:%S%.3f");
        let decision = decision.into();
        self.decisions
            .push(format!("{} {}", stamp, redact_text(&decision)));
    }

    pub fn record_stage(&mut self, label: &str, payload: Value) {
        let mut sanitized = payload;
        redact_value(&mut sanitized, self.redaction_level);
        self.stages.insert(label.to_string(), sanitized);
    }

    /// Classifies a transport error body (HTML vs JSON) and records it.
    pub fn record_transport_error(&mut self, err: &TransportError) {
        let body = err.message.as_str();
        let mut error_info = serde_json::json!({
            "status": err.status,
            "classification": "text",
            "body_snippet": str_utils::prefix_chars(body, 500),
        });

        let trimmed = body.trim_start();
        if trimmed.starts_with("<!DOCTYPE html") || trimmed.starts_with("<html") {
            error_info["classification"] = serde_json::json!("HTML");
        } else if let Ok(json) = serde_json::from_str::<Value>(body) {
            error_info["classification"] = serde_json::json!("JSON");
            error_info["json"] = json;
        }

        self.record_stage("transport_error", error_info);
    }

    fn capture_path(&self, dir: &Path) -> PathBuf {
        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let safe_model = self.model.replace(['/', ':'], "_");
        dir.join(format!(
            "{}_flight_{}_{}.json",
            timestamp,
            str_utils::short_id(&self.panel_id.replace('-', "_")),
            safe_model
        ))
    }

    /// Writes the recorder to `dir`. Failures are logged, never propagated.
    pub async fn save(&self, dir: &Path) -> Option<PathBuf> {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            tracing::error!("Failed to create {}: {}", dir.display(), e);
            return None;
        }

        let content = match serde_json::to_string_pretty(self) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Failed to serialize flight recorder: {}", e);
                return None;
            }
        };

        let path = self.capture_path(dir);
        if let Err(e) = tokio::fs::write(&path, content).await {
            tracing::error!("Failed to save flight recorder artifact: {}", e);
            return None;
        }
        tracing::info!("Saved flight recorder artifact to {}", path.display());
        cleanup_old_reports(dir).await;
        Some(path)
    }
}

async fn cleanup_old_reports(dir: &Path) {
    let mut entries = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(_) => return,
    };

    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.contains("_flight_") && name.ends_with(".json") {
            entries.push(entry.path());
        }
    }

    if entries.len() <= MAX_CAPTURE_FILES {
        return;
    }
    // Names start with a sortable timestamp.
    entries.sort();
    let excess = entries.len() - MAX_CAPTURE_FILES;
    for path in entries.into_iter().take(excess) {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!("Failed to remove old capture {}: {}", path.display(), e);
        }
    }
}
