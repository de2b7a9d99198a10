use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

/// --- IDENTIFIERS ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Primary,
    Secondary,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// Identity of one panel instantiation. A new submission on the same side
/// always gets a new nonce, so callbacks of the superseded panel can be told
/// apart from the fresh one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PanelId {
    pub side: Side,
    pub nonce: Uuid,
}

impl PanelId {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            nonce: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for PanelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nonce = self.nonce.simple().to_string();
        write!(f, "{}-{}", self.side, crate::str_utils::short_id(&nonce))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.0.simple().to_string();
        write!(f, "conn-{}", crate::str_utils::short_id(&id))
    }
}

/// Scope of every piece of per-connection state. Derived once when a
/// connection attempt starts and handed to whoever needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub panel: PanelId,
    pub connection: ConnectionId,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.panel, self.connection)
    }
}

/// Key of a response message under construction: the run it belongs to,
/// scoped to one connection of one panel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub connection: ConnectionKey,
    pub run_id: String,
}

/// --- ERRORS ---

/// Failure reported by a transport, either while opening or mid-stream.
/// `status` is `None` when the failure happened before any HTTP status was seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(None, format!("connection did not open within {:?}", after))
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == Some(401)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {}: {}", status, self.message),
            None => write!(f, "transport failure: {}", self.message),
        }
    }
}

impl std::error::Error for TransportError {}

#[derive(Error, Debug)]
pub enum DuetError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection did not open within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Gave up after {attempts} connection attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Stream failed after data was received: {0}")]
    PartialStream(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Empty response: {0}")]
    EmptyResponse(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: DuetError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<DuetError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- SUBMISSION ---

/// Where a submission came from. Comparison mode tags the second request
/// explicitly instead of inferring it from the call site.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    #[default]
    User,
    AddedRequest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointOptions {
    /// Endpoint name, e.g. `openAI` or `agents`.
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Base URL; the stream is opened at `{base_url}/{endpoint}` and aborted at
    /// `{base_url}/abort`.
    pub base_url: String,
    #[serde(default, flatten)]
    pub options: Map<String, Value>,
}

/// Immutable per-request descriptor, created once per user action.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub user_message: Message,
    /// Conversation history preceding this request.
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub endpoint: EndpointOptions,
    pub initial_response: Message,
    #[serde(default)]
    pub is_regenerate: bool,
    #[serde(default)]
    pub is_continued: bool,
    #[serde(default)]
    pub is_temporary: bool,
    #[serde(default)]
    pub origin: Origin,
}

impl Submission {
    /// Messages that precede the response in every snapshot. Regenerations and
    /// continuations reuse a user message that is already part of the history.
    pub fn base_messages(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn includes_user_message(&self) -> bool {
        !self.is_regenerate && !self.is_continued
    }

    pub fn model(&self) -> Option<&str> {
        self.endpoint.model.as_deref()
    }

    pub fn is_new_conversation(&self) -> bool {
        match self.conversation_id.as_deref() {
            None => true,
            Some(id) => id.is_empty() || id == crate::constants::NEW_CONVERSATION_ID,
        }
    }
}

/// --- MESSAGE MODEL ---

/// Tool-call arguments stream as string fragments, but some servers send an
/// already-parsed object instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolArgs {
    Text(String),
    Structured(Value),
}

impl Default for ToolArgs {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl ToolArgs {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Structured(v) => v.is_null(),
        }
    }

    /// Strings concatenate; as soon as either side is structured the incoming
    /// value replaces the current one. Empty fragments never erase anything.
    pub fn merge(&mut self, incoming: ToolArgs) {
        if incoming.is_empty() {
            return;
        }
        match (self, incoming) {
            (ToolArgs::Text(current), ToolArgs::Text(more)) => current.push_str(&more),
            (slot, replacement) => *slot = replacement,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub args: ToolArgs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

impl ToolCall {
    /// Streaming merge: last non-empty id/name wins, args follow [`ToolArgs::merge`].
    pub fn merge(&mut self, delta: ToolCall) {
        if let Some(id) = non_empty(delta.id) {
            self.id = Some(id);
        }
        if let Some(name) = non_empty(delta.name) {
            self.name = Some(name);
        }
        self.args.merge(delta.args);
        if delta.output.is_some() {
            self.output = delta.output;
        }
        if delta.progress.is_some() {
            self.progress = delta.progress;
        }
        self.extra.extend(delta.extra);
    }

    /// Completion: the result's args are authoritative, output is attached and
    /// progress pinned to 1.
    pub fn complete(&mut self, result: ToolCall) {
        if let Some(id) = non_empty(result.id) {
            self.id = Some(id);
        }
        if let Some(name) = non_empty(result.name) {
            self.name = Some(name);
        }
        if !result.args.is_empty() {
            self.args = result.args;
        }
        if result.output.is_some() {
            self.output = result.output;
        }
        self.progress = Some(1.0);
        self.extra.extend(result.extra);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentUpdate {
    #[serde(default)]
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Think { think: String },
    ToolCall { tool_call: ToolCall },
    ImageUrl { image_url: Value },
    Error { error: String },
    AgentUpdate { agent_update: AgentUpdate },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Think { .. } => "think",
            Self::ToolCall { .. } => "tool_call",
            Self::ImageUrl { .. } => "image_url",
            Self::Error { .. } => "error",
            Self::AgentUpdate { .. } => "agent_update",
        }
    }

    /// Later deltas of the same type at the same index extend the part; a
    /// different type replaces it.
    pub fn merge(&mut self, incoming: ContentPart) {
        match (self, incoming) {
            (ContentPart::Text { text }, ContentPart::Text { text: more }) => text.push_str(&more),
            (ContentPart::Think { think }, ContentPart::Think { think: more }) => {
                think.push_str(&more)
            }
            (ContentPart::ToolCall { tool_call }, ContentPart::ToolCall { tool_call: delta }) => {
                tool_call.merge(delta)
            }
            (slot, replacement) => *slot = replacement,
        }
    }
}

fn parse_part_lenient(value: Value) -> Option<ContentPart> {
    if value.is_null() {
        return None;
    }
    match serde_json::from_value::<ContentPart>(value) {
        Ok(part) => Some(part),
        Err(e) => {
            tracing::warn!("[⚙️ ] Dropping unrecognized content part: {}", e);
            None
        }
    }
}

/// Content arrays may contain holes (`null`) and part types this client does
/// not know; neither should make the whole message unreadable.
fn lenient_content<'de, D>(deserializer: D) -> std::result::Result<Vec<Option<ContentPart>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|v| {
            if v.is_null() {
                None
            } else {
                parse_part_lenient(v)
            }
        })
        .collect())
}

fn one_or_many_parts<'de, D>(deserializer: D) -> std::result::Result<Vec<ContentPart>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    let items = match raw {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        single => vec![single],
    };
    Ok(items.into_iter().filter_map(parse_part_lenient).collect())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, deserialize_with = "lenient_content")]
    pub content: Vec<Option<ContentPart>>,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub unfinished: bool,
    #[serde(default)]
    pub is_created_by_user: bool,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn parts(&self) -> impl Iterator<Item = &ContentPart> {
        self.content.iter().flatten()
    }

    /// Concatenation of all TEXT parts in index order.
    pub fn text_from_parts(&self) -> String {
        let mut text = String::new();
        for part in self.parts() {
            if let ContentPart::Text { text: t } = part {
                text.push_str(t);
            }
        }
        text
    }

    pub fn has_text_parts(&self) -> bool {
        self.parts().any(|p| matches!(p, ContentPart::Text { .. }))
    }

    pub fn sync_text(&mut self) {
        self.text = self.text_from_parts();
    }

    pub fn part(&self, index: usize) -> Option<&ContentPart> {
        self.content.get(index).and_then(|p| p.as_ref())
    }

    fn slot_mut(&mut self, index: usize) -> &mut Option<ContentPart> {
        if self.content.len() <= index {
            self.content.resize(index + 1, None);
        }
        &mut self.content[index]
    }

    pub fn merge_part(&mut self, index: usize, part: ContentPart) {
        match self.slot_mut(index) {
            Some(existing) => existing.merge(part),
            slot => *slot = Some(part),
        }
        self.sync_text();
    }

    pub fn replace_part(&mut self, index: usize, part: ContentPart) {
        *self.slot_mut(index) = Some(part);
        self.sync_text();
    }

    /// Appends a terminal error part and flags the message.
    pub fn push_error(&mut self, error: impl Into<String>) {
        self.content.push(Some(ContentPart::Error {
            error: error.into(),
        }));
        self.error = true;
    }
}

/// --- RUN STEPS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDetails {
    MessageCreation {},
    ToolCalls {
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
    },
}

impl Default for StepDetails {
    fn default() -> Self {
        Self::MessageCreation {}
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunStep {
    pub id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub step_details: StepDetails,
}

/// --- WIRE FRAMES ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageDelta {
    #[serde(default, deserialize_with = "one_or_many_parts")]
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageDeltaEvent {
    /// Id of the run step the delta belongs to.
    pub id: String,
    #[serde(default)]
    pub delta: MessageDelta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunStepDelta {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunStepDeltaEvent {
    pub id: String,
    #[serde(default)]
    pub delta: RunStepDelta,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEndEvent {
    /// Id of the run step that issued the tool call.
    pub id: String,
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub tool_call: ToolCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunStepCompletedEvent {
    pub result: ToolEndEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentUpdateEvent {
    pub agent_update: AgentUpdate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CreatedEvent {
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    #[serde(default, rename = "thread_id")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub request_message: Option<Message>,
    #[serde(default)]
    pub response_message: Option<Message>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinalEvent {
    #[serde(default)]
    pub request_message: Option<Message>,
    #[serde(default)]
    pub response_message: Option<Message>,
    #[serde(default)]
    pub conversation: Option<Value>,
    #[serde(default)]
    pub run_messages: Option<Vec<Message>>,
}

impl FinalEvent {
    pub fn conversation_id(&self) -> Option<String> {
        let from_conversation = self
            .conversation
            .as_ref()
            .and_then(|c| c.get("conversationId"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        from_conversation.or_else(|| {
            self.response_message
                .as_ref()
                .and_then(|m| m.conversation_id.clone())
        })
    }
}

/// Legacy `type`-tagged content chunk targeting one content index.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedChunk {
    pub index: usize,
    pub message_id: Option<String>,
    pub part: ContentPart,
}

/// Non-streaming fallback frame carrying the full text so far.
#[derive(Debug, Clone, PartialEq)]
pub struct PlainMessage {
    pub text: String,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Default)]
pub struct LegacyDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl LegacyDelta {
    pub fn extract_reasoning(&self) -> Option<String> {
        let val = self
            .extra
            .get("reasoning")
            .or_else(|| self.extra.get("reasoning_content"))
            .or_else(|| self.extra.get("thought"))?;
        match val.as_str() {
            Some(s) if !s.is_empty() => Some(s.to_string()),
            _ => None,
        }
    }
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct LegacyChoice {
    #[serde(default)]
    pub delta: LegacyDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// OpenAI-style `{choices:[{delta:{content}}]}` chunk.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct LegacyChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<LegacyChoice>,
}

/// Typed run-step sub-events carried in `{event, data}` envelopes.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunStep(RunStep),
    MessageDelta(MessageDeltaEvent),
    ReasoningDelta(MessageDeltaEvent),
    RunStepDelta(RunStepDeltaEvent),
    RunStepCompleted(RunStepCompletedEvent),
    AgentUpdate(AgentUpdateEvent),
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStep(_) => "on_run_step",
            Self::MessageDelta(_) => "on_message_delta",
            Self::ReasoningDelta(_) => "on_reasoning_delta",
            Self::RunStepDelta(_) => "on_run_step_delta",
            Self::RunStepCompleted(_) => "on_run_step_completed",
            Self::AgentUpdate(_) => "on_agent_update",
        }
    }
}

/// The closed set of event kinds a frame can normalize to.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// `[DONE]` sentinel; nothing to apply.
    Done,
    Final(FinalEvent),
    Created(CreatedEvent),
    Run(RunEvent),
    Sync(SyncEvent),
    Content(TypedChunk),
    /// A legacy chunk (or a raw text frame) normalized into a message delta.
    Legacy(MessageDeltaEvent),
    Plain(PlainMessage),
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Final(_) => "final",
            Self::Created(_) => "created",
            Self::Run(run) => run.name(),
            Self::Sync(_) => "sync",
            Self::Content(_) => "content",
            Self::Legacy(_) => "legacy_delta",
            Self::Plain(_) => "plain",
        }
    }
}

/// --- PANEL STATUS ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PanelStatus {
    Connecting { attempt: u32 },
    Open,
    Reconnecting { attempt: u32, max: u32 },
    Completed,
    Cancelled,
    Failed { reason: String },
}

impl fmt::Display for PanelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting { attempt } => write!(f, "connecting (attempt {})", attempt + 1),
            Self::Open => write!(f, "open"),
            Self::Reconnecting { attempt, max } => write!(f, "reconnecting ({}/{})", attempt, max),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}
