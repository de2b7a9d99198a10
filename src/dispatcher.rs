use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;

use crate::assembler::{StepAssembler, StepOutcome};
use crate::constants::{DONE_SENTINEL, LEGACY_STEP_ID, MAX_FRAME_BYTES};
use crate::str_utils::snippet;
use crate::types::{
    ContentPart, CreatedEvent, FinalEvent, LegacyChunk, MessageDelta, MessageDeltaEvent,
    PlainMessage, RunEvent, StreamEvent, SyncEvent, TypedChunk,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Malformed,
    NotAnObject,
    TooLarge,
    UnknownShape,
    UnknownEvent,
    InvalidPayload,
    /// A well-formed chunk with nothing to apply, e.g. a bare `finish_reason`.
    NoContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRejection {
    pub reason: RejectReason,
    pub detail: String,
}

impl FrameRejection {
    fn new(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for FrameRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.reason, self.detail)
    }
}

/// What the pipeline has to do after a frame was dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Applied(StepOutcome),
    Final(FinalEvent),
    Done,
    Rejected(FrameRejection),
}

/// Normalizes frames into [`StreamEvent`]s and routes them to a
/// [`StepAssembler`].
#[derive(Debug, Clone, Default)]
pub struct EventDispatcher {
    plain_text_fallback: bool,
}

fn is_set(obj: &Map<String, Value>, key: &str) -> bool {
    match obj.get(key) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(_) => true,
    }
}

fn payload<T: DeserializeOwned>(value: Value, what: &str) -> Result<T, FrameRejection> {
    serde_json::from_value(value).map_err(|e| {
        FrameRejection::new(RejectReason::InvalidPayload, format!("{}: {}", what, e))
    })
}

fn text_delta(text: String) -> StreamEvent {
    StreamEvent::Legacy(MessageDeltaEvent {
        id: LEGACY_STEP_ID.to_string(),
        delta: MessageDelta {
            content: vec![ContentPart::text(text)],
        },
    })
}

impl EventDispatcher {
    pub fn new(plain_text_fallback: bool) -> Self {
        Self {
            plain_text_fallback,
        }
    }

    /// Enables the raw-text fallback when `model` matches one of `patterns`.
    pub fn for_model(model: Option<&str>, patterns: &[String]) -> Self {
        let Some(model) = model else {
            return Self::new(false);
        };
        let fallback = patterns.iter().any(|pattern| match Regex::new(pattern) {
            Ok(re) => re.is_match(model),
            Err(e) => {
                tracing::warn!("[⚙️ ] Ignoring invalid model pattern '{}': {}", pattern, e);
                false
            }
        });
        if fallback {
            tracing::debug!("[⚙️ ] Plain-text frame fallback enabled for {}", model);
        }
        Self::new(fallback)
    }

    pub fn plain_text_fallback(&self) -> bool {
        self.plain_text_fallback
    }

    pub fn classify(&self, raw: &str) -> Result<StreamEvent, FrameRejection> {
        if raw.len() > MAX_FRAME_BYTES {
            return Err(FrameRejection::new(
                RejectReason::TooLarge,
                format!("{} bytes", raw.len()),
            ));
        }
        let trimmed = raw.trim();
        if trimmed == DONE_SENTINEL {
            return Ok(StreamEvent::Done);
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                if self.plain_text_fallback && !raw.is_empty() {
                    return Ok(text_delta(raw.to_string()));
                }
                return Err(FrameRejection::new(
                    RejectReason::Malformed,
                    format!("{} in {}", e, snippet(raw, 120)),
                ));
            }
        };
        let Value::Object(obj) = value else {
            // Scalar frames like `4` are still model text for raw-text models.
            if self.plain_text_fallback {
                return Ok(text_delta(raw.to_string()));
            }
            return Err(FrameRejection::new(
                RejectReason::NotAnObject,
                snippet(raw, 120).into_owned(),
            ));
        };
        Self::classify_object(obj)
    }

    fn classify_object(mut obj: Map<String, Value>) -> Result<StreamEvent, FrameRejection> {
        if is_set(&obj, "final") {
            return payload(Value::Object(obj), "final").map(StreamEvent::Final);
        }

        let has_plain_text = obj.get("text").is_some_and(Value::is_string)
            || obj.get("response").is_some_and(Value::is_string);
        if is_set(&obj, "created") || (obj.get("message").is_some_and(Value::is_object) && !has_plain_text) {
            return payload::<CreatedEvent>(Value::Object(obj), "created").map(StreamEvent::Created);
        }

        if let Some(name) = obj.get("event").and_then(Value::as_str).map(str::to_string) {
            let data = obj.remove("data").unwrap_or(Value::Null);
            return Self::classify_run_event(&name, data).map(StreamEvent::Run);
        }

        if is_set(&obj, "sync") {
            return payload::<SyncEvent>(Value::Object(obj), "sync").map(StreamEvent::Sync);
        }

        if obj.get("type").is_some_and(Value::is_string) {
            let index = obj
                .get("index")
                .and_then(Value::as_u64)
                .and_then(|i| usize::try_from(i).ok())
                .unwrap_or(0);
            let message_id = obj
                .get("messageId")
                .and_then(Value::as_str)
                .map(str::to_string);
            let part: ContentPart = payload(Value::Object(obj), "content chunk")?;
            return Ok(StreamEvent::Content(TypedChunk {
                index,
                message_id,
                part,
            }));
        }

        if obj.get("choices").is_some_and(Value::is_array) {
            let chunk: LegacyChunk = payload(Value::Object(obj), "choices")?;
            return Self::classify_legacy(chunk);
        }

        if has_plain_text {
            let text = obj
                .get("text")
                .and_then(Value::as_str)
                .or_else(|| obj.get("response").and_then(Value::as_str))
                .unwrap_or_default()
                .to_string();
            return Ok(StreamEvent::Plain(PlainMessage { text }));
        }

        let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        Err(FrameRejection::new(
            RejectReason::UnknownShape,
            format!("keys {:?}", keys),
        ))
    }

    fn classify_run_event(name: &str, data: Value) -> Result<RunEvent, FrameRejection> {
        match name {
            "on_run_step" => payload(data, name).map(RunEvent::RunStep),
            "on_message_delta" => payload(data, name).map(RunEvent::MessageDelta),
            "on_reasoning_delta" => payload(data, name).map(RunEvent::ReasoningDelta),
            "on_run_step_delta" => payload(data, name).map(RunEvent::RunStepDelta),
            "on_run_step_completed" => payload(data, name).map(RunEvent::RunStepCompleted),
            "on_agent_update" => payload(data, name).map(RunEvent::AgentUpdate),
            other => Err(FrameRejection::new(RejectReason::UnknownEvent, other)),
        }
    }

    fn classify_legacy(chunk: LegacyChunk) -> Result<StreamEvent, FrameRejection> {
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Err(FrameRejection::new(RejectReason::NoContent, "empty choices"));
        };
        let mut content = Vec::new();
        if let Some(think) = choice.delta.extract_reasoning() {
            content.push(ContentPart::Think { think });
        }
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            content.push(ContentPart::text(text));
        }
        if content.is_empty() {
            let detail = match choice.finish_reason {
                Some(reason) => format!("finish_reason {}", reason),
                None => "empty delta".to_string(),
            };
            return Err(FrameRejection::new(RejectReason::NoContent, detail));
        }
        Ok(StreamEvent::Legacy(MessageDeltaEvent {
            id: LEGACY_STEP_ID.to_string(),
            delta: MessageDelta { content },
        }))
    }

    /// Applies an already-classified event.
    pub fn route(event: StreamEvent, assembler: &mut StepAssembler) -> Dispatch {
        let outcome = match event {
            StreamEvent::Done => return Dispatch::Done,
            StreamEvent::Final(event) => return Dispatch::Final(event),
            StreamEvent::Created(event) => assembler.on_created(event),
            StreamEvent::Run(RunEvent::RunStep(step)) => assembler.register_step(step),
            StreamEvent::Run(RunEvent::MessageDelta(event))
            | StreamEvent::Run(RunEvent::ReasoningDelta(event)) => assembler.apply_message_delta(event),
            StreamEvent::Run(RunEvent::RunStepDelta(event)) => assembler.apply_run_step_delta(event),
            StreamEvent::Run(RunEvent::RunStepCompleted(event)) => {
                assembler.apply_run_step_completed(event)
            }
            StreamEvent::Run(RunEvent::AgentUpdate(event)) => assembler.apply_agent_update(event),
            StreamEvent::Sync(event) => assembler.on_sync(event),
            StreamEvent::Content(chunk) => assembler.apply_typed_chunk(chunk),
            StreamEvent::Legacy(event) => assembler.apply_legacy_delta(event),
            StreamEvent::Plain(message) => assembler.apply_plain(message),
        };
        Dispatch::Applied(outcome)
    }

    pub fn dispatch(&self, raw: &str, assembler: &mut StepAssembler) -> Dispatch {
        match self.classify(raw) {
            Ok(event) => {
                tracing::trace!("[☁️  -> ⚙️ ] {} frame on {}", event.kind(), assembler.key());
                Self::route(event, assembler)
            }
            Err(rejection) => {
                match rejection.reason {
                    RejectReason::NoContent => {
                        tracing::trace!("[☁️  -> ⚙️ ] Skipping frame: {}", rejection)
                    }
                    _ => tracing::warn!("[☁️  -> ⚙️ ] Dropping frame: {}", rejection),
                }
                Dispatch::Rejected(rejection)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(raw: &str) -> StreamEvent {
        match EventDispatcher::default().classify(raw) {
            Ok(event) => event,
            Err(e) => panic!("Failed to classify {}: {}", raw, e),
        }
    }

    #[test]
    fn final_wins_over_every_other_key() {
        let event = classify(r#"{"final":true,"event":"on_run_step","sync":true,"responseMessage":{"messageId":"m1","text":"4"}}"#);
        assert!(matches!(event, StreamEvent::Final(_)));
    }

    #[test]
    fn bare_message_is_a_created_event() {
        let event = classify(r#"{"message":{"messageId":"m1"}}"#);
        assert!(matches!(event, StreamEvent::Created(_)));
    }

    #[test]
    fn message_with_text_is_plain_fallback() {
        let event = classify(r#"{"message":{"messageId":"m1"},"text":"partial"}"#);
        assert_eq!(
            event,
            StreamEvent::Plain(PlainMessage {
                text: "partial".into()
            })
        );
    }

    #[test]
    fn unknown_event_name_is_rejected() {
        let err = EventDispatcher::default().classify(r#"{"event":"on_mystery","data":{}}"#);
        assert!(matches!(
            err,
            Err(FrameRejection {
                reason: RejectReason::UnknownEvent,
                ..
            })
        ));
    }

    #[test]
    fn typed_chunk_keeps_index() {
        match classify(r#"{"type":"text","text":"hi","index":2,"messageId":"r1"}"#) {
            StreamEvent::Content(chunk) => {
                assert_eq!(chunk.index, 2);
                assert_eq!(chunk.message_id.as_deref(), Some("r1"));
                assert_eq!(chunk.part, ContentPart::text("hi"));
            }
            other => panic!("Expected content chunk, got {:?}", other),
        }
    }
}
