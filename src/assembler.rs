use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::collaborators::MessageStore;
use crate::constants::{LEGACY_STEP_ID, MAX_CONTENT_INDEX};
use crate::types::{
    AgentUpdateEvent, ConnectionKey, ContentPart, CreatedEvent, FinalEvent, Message,
    MessageDelta, MessageDeltaEvent, MessageKey, PlainMessage, RunStep, RunStepCompletedEvent,
    RunStepDeltaEvent, StepDetails, Submission, SyncEvent, ToolCall, TypedChunk,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// A delta referenced a step id never declared on this connection.
    UnknownStep(String),
    IndexOutOfRange(usize),
    Empty,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownStep(id) => write!(f, "unknown step '{}'", id),
            Self::IndexOutOfRange(index) => write!(f, "content index {} out of range", index),
            Self::Empty => write!(f, "nothing to apply"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The event changed the reconstruction; `appended_text` is the TEXT it added.
    Applied { appended_text: String },
    Dropped(DropReason),
}

impl StepOutcome {
    fn applied(appended_text: String) -> Self {
        Self::Applied { appended_text }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn check_index(index: usize) -> Result<(), DropReason> {
    if index > MAX_CONTENT_INDEX {
        tracing::warn!("[⚙️ ] Content index {} exceeds limit {}", index, MAX_CONTENT_INDEX);
        return Err(DropReason::IndexOutOfRange(index));
    }
    Ok(())
}

/// Reconstructs the response of one connection from its ordered deltas.
///
/// Every map is owned by the assembler and every message key carries the
/// connection key, so a second assembler (another panel, or a retried
/// connection of the same panel) never sees this one's state. Each applied
/// event emits a fresh snapshot to the store.
pub struct StepAssembler {
    key: ConnectionKey,
    submission: Arc<Submission>,
    store: Arc<dyn MessageStore>,
    request_message: Message,
    conversation_id: Option<String>,
    thread_id: Option<String>,
    active_run: Option<String>,
    /// The active run id was generated locally and gives way to the first
    /// run id the server names.
    local_run: bool,
    created: bool,
    created_response_id: Option<String>,
    steps_by_id: HashMap<String, RunStep>,
    messages_by_id: HashMap<MessageKey, Message>,
    tool_call_id_by_step: HashMap<String, String>,
    legacy_steps: usize,
}

impl StepAssembler {
    pub fn new(key: ConnectionKey, submission: Arc<Submission>, store: Arc<dyn MessageStore>) -> Self {
        let request_message = submission.user_message.clone();
        let conversation_id = if submission.is_new_conversation() {
            None
        } else {
            submission.conversation_id.clone()
        };
        Self {
            key,
            submission,
            store,
            request_message,
            conversation_id,
            thread_id: None,
            active_run: None,
            local_run: false,
            created: false,
            created_response_id: None,
            steps_by_id: HashMap::new(),
            messages_by_id: HashMap::new(),
            tool_call_id_by_step: HashMap::new(),
            legacy_steps: 0,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn has_created(&self) -> bool {
        self.created
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn request_message(&self) -> &Message {
        &self.request_message
    }

    /// Key under which the backend tracks this generation for abort requests.
    pub fn abort_key(&self) -> String {
        match &self.conversation_id {
            Some(id) => id.clone(),
            None => self.submission.user_message.message_id.clone(),
        }
    }

    /// Response of the active run, if one has been started.
    pub fn response(&self) -> Option<&Message> {
        let run_id = self.active_run.as_deref()?;
        self.messages_by_id.get(&self.message_key(run_id))
    }

    pub fn snapshot(&self) -> Vec<Message> {
        match self.active_run.as_deref() {
            Some(run_id) => self.snapshot_for(run_id),
            None => self.snapshot_for(""),
        }
    }

    /// Final event built from local state, for streams that end without one.
    pub fn synthesize_final(&self) -> FinalEvent {
        let mut response = self.response().cloned();
        if let Some(response) = response.as_mut() {
            response.unfinished = false;
        }
        FinalEvent {
            request_message: Some(self.request_message.clone()),
            response_message: response,
            conversation: self
                .conversation_id
                .as_ref()
                .map(|id| serde_json::json!({ "conversationId": id })),
            run_messages: None,
        }
    }

    fn message_key(&self, run_id: &str) -> MessageKey {
        MessageKey {
            connection: self.key,
            run_id: run_id.to_string(),
        }
    }

    fn current_run(&mut self) -> String {
        match &self.active_run {
            Some(run_id) => run_id.clone(),
            None => {
                let run_id = Uuid::new_v4().to_string();
                self.active_run = Some(run_id.clone());
                self.local_run = true;
                run_id
            }
        }
    }

    /// Makes a server-named run the active one. A locally generated run hands
    /// its response over, so nothing streamed before the first step is lost.
    fn adopt_run(&mut self, run_id: &str) {
        let Some(active) = self.active_run.clone() else {
            self.active_run = Some(run_id.to_string());
            return;
        };
        if active == run_id {
            return;
        }
        if self.local_run {
            let from = self.message_key(&active);
            let to = self.message_key(run_id);
            if let Some(response) = self.messages_by_id.remove(&from) {
                self.messages_by_id.entry(to).or_insert(response);
            }
            for step in self.steps_by_id.values_mut().filter(|s| s.run_id == active) {
                step.run_id = run_id.to_string();
            }
            self.local_run = false;
        }
        tracing::debug!("[⚙️ ] {} switched to run {}", self.key, run_id);
        self.active_run = Some(run_id.to_string());
    }

    fn seed_response(&self) -> Message {
        let mut seed = self.submission.initial_response.clone();
        seed.content.clear();
        seed.text.clear();
        seed.error = false;
        seed.is_created_by_user = false;
        if let Some(id) = &self.created_response_id {
            seed.message_id = id.clone();
        }
        if seed.parent_message_id.is_none() && !self.request_message.message_id.is_empty() {
            seed.parent_message_id = Some(self.request_message.message_id.clone());
        }
        if seed.conversation_id.is_none() {
            seed.conversation_id = self.conversation_id.clone();
        }
        seed
    }

    fn response_mut(&mut self, run_id: &str) -> &mut Message {
        let key = self.message_key(run_id);
        if !self.messages_by_id.contains_key(&key) {
            let seed = self.seed_response();
            self.messages_by_id.insert(key.clone(), seed);
        }
        self.messages_by_id.entry(key).or_default()
    }

    fn snapshot_for(&self, run_id: &str) -> Vec<Message> {
        let mut messages = self.submission.base_messages();
        if self.submission.includes_user_message() {
            messages.push(self.request_message.clone());
        }
        if let Some(response) = self.messages_by_id.get(&self.message_key(run_id)) {
            messages.push(response.clone());
        }
        messages
    }

    fn emit(&self, run_id: &str) {
        self.store.set_messages(self.key.panel, self.snapshot_for(run_id));
    }

    /// `created`: starts a fresh run. The payload is the server's copy of the
    /// user message when flagged as such, otherwise it names the response.
    pub fn on_created(&mut self, event: CreatedEvent) -> StepOutcome {
        let run_id = Uuid::new_v4().to_string();
        self.active_run = Some(run_id.clone());
        self.local_run = true;
        self.created = true;

        if let Some(message) = event.message {
            if let Some(conversation_id) = non_empty(message.conversation_id.clone()) {
                self.conversation_id = Some(conversation_id);
            }
            if message.is_created_by_user {
                let mut request = message;
                if request.text.is_empty() {
                    request.text = self.request_message.text.clone();
                }
                self.request_message = request;
            } else if !message.message_id.is_empty() {
                self.created_response_id = Some(message.message_id);
            }
        }

        tracing::debug!(
            "[⚙️ ] {} created run {}",
            self.key,
            crate::str_utils::short_id(&run_id)
        );
        self.response_mut(&run_id);
        self.emit(&run_id);
        StepOutcome::applied(String::new())
    }

    pub fn register_step(&mut self, mut step: RunStep) -> StepOutcome {
        if let Err(reason) = check_index(step.index) {
            return StepOutcome::Dropped(reason);
        }
        if step.run_id.is_empty() {
            step.run_id = self.current_run();
        } else {
            self.adopt_run(&step.run_id);
        }
        if self.steps_by_id.contains_key(&step.id) {
            tracing::warn!("[⚙️ ] Step {} declared twice on {}", step.id, self.key);
        }

        let run_id = step.run_id.clone();
        let mut seeded_calls = Vec::new();
        if let StepDetails::ToolCalls { tool_calls } = &step.step_details {
            if let Some(id) = tool_calls.iter().find_map(|c| non_empty(c.id.clone())) {
                self.tool_call_id_by_step.insert(step.id.clone(), id);
            }
            for (offset, call) in tool_calls.iter().enumerate() {
                let mut call = call.clone();
                if call.progress.is_none() {
                    call.progress = Some(0.01);
                }
                seeded_calls.push((step.index + offset, call));
            }
        }

        let response = self.response_mut(&run_id);
        for (index, tool_call) in seeded_calls {
            response.replace_part(index, ContentPart::ToolCall { tool_call });
        }
        self.steps_by_id.insert(step.id.clone(), step);
        self.emit(&run_id);
        StepOutcome::applied(String::new())
    }

    /// `message_delta` and `reasoning_delta` share one path: resolve the step,
    /// then merge every part at the step's content index.
    pub fn apply_message_delta(&mut self, event: MessageDeltaEvent) -> StepOutcome {
        let Some(step) = self.steps_by_id.get(&event.id) else {
            tracing::warn!(
                "[⚙️ ] Dropping delta for unknown step '{}' on {}",
                event.id,
                self.key
            );
            return StepOutcome::Dropped(DropReason::UnknownStep(event.id));
        };
        if event.delta.content.is_empty() {
            return StepOutcome::Dropped(DropReason::Empty);
        }
        let index = step.index;
        let run_id = step.run_id.clone();

        let mut appended = String::new();
        let response = self.response_mut(&run_id);
        for part in event.delta.content {
            if let ContentPart::Text { text } = &part {
                appended.push_str(text);
            }
            response.merge_part(index, part);
        }
        self.emit(&run_id);
        StepOutcome::applied(appended)
    }

    /// Tool-call argument streaming.
    pub fn apply_run_step_delta(&mut self, event: RunStepDeltaEvent) -> StepOutcome {
        let Some(step) = self.steps_by_id.get(&event.id) else {
            tracing::warn!(
                "[⚙️ ] Dropping run step delta for unknown step '{}' on {}",
                event.id,
                self.key
            );
            return StepOutcome::Dropped(DropReason::UnknownStep(event.id));
        };
        if event.delta.tool_calls.is_empty() {
            return StepOutcome::Dropped(DropReason::Empty);
        }
        let base_index = step.index;
        let run_id = step.run_id.clone();
        let step_id = event.id;

        let mut calls = Vec::with_capacity(event.delta.tool_calls.len());
        for (offset, mut call) in event.delta.tool_calls.into_iter().enumerate() {
            let index = base_index + offset;
            if let Err(reason) = check_index(index) {
                return StepOutcome::Dropped(reason);
            }
            match non_empty(call.id.clone()) {
                Some(id) => {
                    self.tool_call_id_by_step.insert(step_id.clone(), id);
                }
                None => call.id = self.tool_call_id_by_step.get(&step_id).cloned(),
            }
            calls.push((index, call));
        }

        let response = self.response_mut(&run_id);
        for (index, tool_call) in calls {
            response.merge_part(index, ContentPart::ToolCall { tool_call });
        }
        self.emit(&run_id);
        StepOutcome::applied(String::new())
    }

    pub fn apply_run_step_completed(&mut self, event: RunStepCompletedEvent) -> StepOutcome {
        let result = event.result;
        let Some(step) = self.steps_by_id.get(&result.id) else {
            tracing::warn!(
                "[⚙️ ] Dropping tool result for unknown step '{}' on {}",
                result.id,
                self.key
            );
            return StepOutcome::Dropped(DropReason::UnknownStep(result.id));
        };
        if let Err(reason) = check_index(result.index) {
            return StepOutcome::Dropped(reason);
        }
        let run_id = step.run_id.clone();
        let index = result.index;
        let mut outcome = result.tool_call;
        if non_empty(outcome.id.clone()).is_none() {
            outcome.id = self.tool_call_id_by_step.get(&result.id).cloned();
        }

        let response = self.response_mut(&run_id);
        let mut tool_call = match response.part(index) {
            Some(ContentPart::ToolCall { tool_call }) => tool_call.clone(),
            _ => ToolCall::default(),
        };
        tool_call.complete(outcome);
        response.replace_part(index, ContentPart::ToolCall { tool_call });
        self.emit(&run_id);
        StepOutcome::applied(String::new())
    }

    /// Agent updates replace whatever sits at their index.
    pub fn apply_agent_update(&mut self, event: AgentUpdateEvent) -> StepOutcome {
        let update = event.agent_update;
        if let Err(reason) = check_index(update.index) {
            return StepOutcome::Dropped(reason);
        }
        let run_id = match non_empty(update.run_id.clone()) {
            Some(run_id) => {
                self.adopt_run(&run_id);
                run_id
            }
            None => self.current_run(),
        };
        let index = update.index;
        self.response_mut(&run_id).replace_part(
            index,
            ContentPart::AgentUpdate {
                agent_update: update,
            },
        );
        self.emit(&run_id);
        StepOutcome::applied(String::new())
    }

    pub fn apply_typed_chunk(&mut self, chunk: TypedChunk) -> StepOutcome {
        if let Err(reason) = check_index(chunk.index) {
            return StepOutcome::Dropped(reason);
        }
        let run_id = self.current_run();
        let mut appended = String::new();
        if let ContentPart::Text { text } = &chunk.part {
            appended.push_str(text);
        }
        let response = self.response_mut(&run_id);
        if let Some(message_id) = non_empty(chunk.message_id) {
            response.message_id = message_id;
        }
        response.merge_part(chunk.index, chunk.part);
        self.emit(&run_id);
        StepOutcome::applied(appended)
    }

    /// Legacy chunks never declare steps. Each part kind gets a synthetic step
    /// on first sight, taking the next free content slot, and the delta then
    /// follows the regular message-delta path.
    pub fn apply_legacy_delta(&mut self, event: MessageDeltaEvent) -> StepOutcome {
        let mut grouped: Vec<(String, Vec<ContentPart>)> = Vec::new();
        for part in event.delta.content {
            let step_id = match &part {
                ContentPart::Text { .. } => event.id.clone(),
                other => format!("{}:{}", event.id, other.kind()),
            };
            match grouped.iter_mut().find(|(id, _)| *id == step_id) {
                Some((_, parts)) => parts.push(part),
                None => grouped.push((step_id, vec![part])),
            }
        }
        if grouped.is_empty() {
            return StepOutcome::Dropped(DropReason::Empty);
        }

        let mut appended = String::new();
        for (step_id, content) in grouped {
            if !self.steps_by_id.contains_key(&step_id) {
                let run_id = self.current_run();
                let index = self.legacy_steps;
                self.legacy_steps += 1;
                self.steps_by_id.insert(
                    step_id.clone(),
                    RunStep {
                        id: step_id.clone(),
                        run_id,
                        index,
                        step_details: StepDetails::default(),
                    },
                );
            }
            let outcome = self.apply_message_delta(MessageDeltaEvent {
                id: step_id,
                delta: MessageDelta { content },
            });
            if let StepOutcome::Applied { appended_text } = outcome {
                appended.push_str(&appended_text);
            }
        }
        StepOutcome::applied(appended)
    }

    /// Non-streaming fallback: the frame carries the whole text so far.
    pub fn apply_plain(&mut self, message: PlainMessage) -> StepOutcome {
        let run_id = self.current_run();
        let response = self.response_mut(&run_id);
        let previous = response.text.clone();
        response.content = vec![Some(ContentPart::text(message.text.clone()))];
        response.sync_text();
        self.emit(&run_id);

        let appended = if message.text.starts_with(previous.as_str()) {
            message.text[previous.len()..].to_string()
        } else {
            message.text
        };
        StepOutcome::applied(appended)
    }

    /// Server-confirmed ids. A response carrying content is authoritative
    /// (resumed streams), otherwise only its identifiers are adopted.
    pub fn on_sync(&mut self, event: SyncEvent) -> StepOutcome {
        if let Some(conversation_id) = non_empty(event.conversation_id) {
            self.conversation_id = Some(conversation_id);
        }
        if let Some(thread_id) = non_empty(event.thread_id) {
            self.thread_id = Some(thread_id);
        }
        if let Some(request) = event.request_message {
            self.request_message = request;
        }

        let run_id = self.current_run();
        let conversation_id = self.conversation_id.clone();
        let response = self.response_mut(&run_id);
        if let Some(server) = event.response_message {
            if !server.message_id.is_empty() {
                response.message_id = server.message_id;
            }
            if server.parent_message_id.is_some() {
                response.parent_message_id = server.parent_message_id;
            }
            if !server.content.is_empty() {
                response.content = server.content;
                response.sync_text();
            }
        }
        if conversation_id.is_some() {
            response.conversation_id = conversation_id;
        }
        self.emit(&run_id);
        StepOutcome::applied(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MemoryStore;
    use crate::types::{ConnectionId, PanelId, Side};

    fn assembler(store: Arc<MemoryStore>) -> StepAssembler {
        let key = ConnectionKey {
            panel: PanelId::new(Side::Primary),
            connection: ConnectionId::new(),
        };
        let submission = Submission {
            user_message: Message {
                message_id: "u1".into(),
                text: "hi".into(),
                is_created_by_user: true,
                ..Default::default()
            },
            initial_response: Message {
                message_id: "r1".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        StepAssembler::new(key, Arc::new(submission), store)
    }

    #[test]
    fn legacy_reasoning_and_text_take_separate_slots() {
        let store = Arc::new(MemoryStore::new());
        let mut asm = assembler(store);
        asm.apply_legacy_delta(MessageDeltaEvent {
            id: LEGACY_STEP_ID.into(),
            delta: MessageDelta {
                content: vec![ContentPart::Think {
                    think: "let me see".into(),
                }],
            },
        });
        asm.apply_legacy_delta(MessageDeltaEvent {
            id: LEGACY_STEP_ID.into(),
            delta: MessageDelta {
                content: vec![ContentPart::text("Hi")],
            },
        });
        asm.apply_legacy_delta(MessageDeltaEvent {
            id: LEGACY_STEP_ID.into(),
            delta: MessageDelta {
                content: vec![ContentPart::text(" there")],
            },
        });

        let response = match asm.response() {
            Some(r) => r,
            None => panic!("no response"),
        };
        assert_eq!(response.text, "Hi there");
        assert!(matches!(response.part(0), Some(ContentPart::Think { .. })));
    }

    #[test]
    fn plain_frames_report_only_new_text() {
        let store = Arc::new(MemoryStore::new());
        let mut asm = assembler(store);
        asm.apply_plain(PlainMessage { text: "Hel".into() });
        let outcome = asm.apply_plain(PlainMessage {
            text: "Hello".into(),
        });
        assert_eq!(
            outcome,
            StepOutcome::Applied {
                appended_text: "lo".into()
            }
        );
    }

    #[test]
    fn abort_key_prefers_conversation_id() {
        let store = Arc::new(MemoryStore::new());
        let mut asm = assembler(store);
        assert_eq!(asm.abort_key(), "u1");
        asm.on_created(CreatedEvent {
            message: Some(Message {
                message_id: "u1".into(),
                conversation_id: Some("c9".into()),
                is_created_by_user: true,
                ..Default::default()
            }),
        });
        assert_eq!(asm.abort_key(), "c9");
        assert!(asm.has_created());
    }
}
