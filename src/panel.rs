use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::assembler::{StepAssembler, StepOutcome};
use crate::collaborators::{AbortOutcome, AbortRequest, Collaborators, MessageStore};
use crate::connection::{ConnectionManager, ConnectionOutcome, FrameFlow, FrameHandler};
use crate::constants::{DEFAULT_SUBMISSION_TIMEOUT_MS, EMPTY_RESPONSE_PLACEHOLDER, PLAIN_TEXT_FRAME_MODELS};
use crate::debug_utils::FlightRecorder;
use crate::dispatcher::{Dispatch, EventDispatcher};
use crate::hardening::{RetryConfig, RetryPolicy};
use crate::logging::StreamMetric;
use crate::projections::abort_url;
use crate::transport::Transport;
use crate::types::{
    ConnectionId, ConnectionKey, ContentPart, DuetError, FinalEvent, Message, ObservedError,
    Origin, PanelId, PanelStatus, Side, Submission, TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub retry: RetryConfig,
    pub submission_timeout_ms: u64,
    /// Regexes matched against the model name; a match enables the raw-text
    /// frame fallback.
    pub plain_text_models: Vec<String>,
    pub debug_capture_dir: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            submission_timeout_ms: DEFAULT_SUBMISSION_TIMEOUT_MS,
            plain_text_models: PLAIN_TEXT_FRAME_MODELS.iter().map(|p| p.to_string()).collect(),
            debug_capture_dir: None,
        }
    }
}

/// State owned by one panel instantiation. Every asynchronous path holds an
/// `Arc` of its own context and checks it before mutating anything.
pub struct PanelContext {
    id: PanelId,
    submission: Arc<Submission>,
    active: AtomicBool,
    cancel: CancellationToken,
    timers: CancellationToken,
    current_connection: Mutex<Option<ConnectionId>>,
    delta_ledger: Mutex<HashMap<ConnectionId, String>>,
    abort_key: Mutex<Option<String>>,
    request_message: Mutex<Option<Message>>,
    recorder: Mutex<FlightRecorder>,
}

impl PanelContext {
    pub fn new(id: PanelId, submission: Arc<Submission>) -> Self {
        let cancel = CancellationToken::new();
        let timers = cancel.child_token();
        let recorder = FlightRecorder::new(
            id,
            submission.model().unwrap_or(&submission.endpoint.endpoint),
            submission.conversation_id.as_deref().unwrap_or_default(),
        );
        Self {
            id,
            submission,
            active: AtomicBool::new(true),
            cancel,
            timers,
            current_connection: Mutex::new(None),
            delta_ledger: Mutex::new(HashMap::new()),
            abort_key: Mutex::new(None),
            request_message: Mutex::new(None),
            recorder: Mutex::new(recorder),
        }
    }

    pub fn id(&self) -> PanelId {
        self.id
    }

    pub fn submission(&self) -> &Submission {
        &self.submission
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Synchronously marks the panel inactive, then wakes every pending wait.
    pub fn deactivate(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            tracing::debug!("[⚙️ ] {} deactivated", self.id);
        }
        self.cancel.cancel();
    }

    /// Guard evaluated before any state mutation triggered asynchronously.
    pub fn assert_active(&self) -> bool {
        let active = self.is_active();
        if !active {
            tracing::trace!("[⚙️ ] Ignoring callback for inactive panel {}", self.id);
        }
        active
    }

    /// Like [`assert_active`](Self::assert_active), and also rejects callbacks
    /// from a connection that is no longer the panel's current one.
    pub fn assert_active_connection(&self, key: ConnectionKey) -> bool {
        if key.panel != self.id || !self.assert_active() {
            return false;
        }
        let current = *lock(&self.current_connection);
        if current != Some(key.connection) {
            tracing::trace!("[⚙️ ] Ignoring stale connection {}", key);
            return false;
        }
        true
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn timers(&self) -> &CancellationToken {
        &self.timers
    }

    /// Stops the failsafe and retry timers without cancelling the panel.
    pub fn clear_timers(&self) {
        self.timers.cancel();
    }

    pub fn begin_connection(&self, connection: ConnectionId) {
        *lock(&self.current_connection) = Some(connection);
        lock(&self.delta_ledger).entry(connection).or_default();
    }

    pub fn current_connection(&self) -> Option<ConnectionId> {
        *lock(&self.current_connection)
    }

    pub fn append_delta(&self, connection: ConnectionId, text: &str) {
        lock(&self.delta_ledger)
            .entry(connection)
            .or_default()
            .push_str(text);
    }

    /// Text accumulated from deltas of one connection only.
    pub fn accumulated(&self, connection: ConnectionId) -> String {
        lock(&self.delta_ledger)
            .get(&connection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_abort_key(&self, key: String) {
        *lock(&self.abort_key) = Some(key);
    }

    /// Present once the stream produced its created message.
    pub fn abort_key(&self) -> Option<String> {
        lock(&self.abort_key).clone()
    }

    /// Marks the panel created: remembers the abort key and the server's
    /// copy of the request message.
    pub fn mark_created(&self, abort_key: String, request: &Message) {
        self.set_abort_key(abort_key);
        let mut latest = lock(&self.request_message);
        if latest.as_ref() != Some(request) {
            *latest = Some(request.clone());
        }
    }

    /// Latest request message seen on the stream, else the submitted one.
    pub fn request_message(&self) -> Message {
        lock(&self.request_message)
            .clone()
            .unwrap_or_else(|| self.submission.user_message.clone())
    }

    pub fn record(&self, decision: impl Into<String>) {
        lock(&self.recorder).record_decision(decision);
    }

    pub fn record_transport_error(&self, error: &TransportError) {
        lock(&self.recorder).record_transport_error(error);
    }

    pub fn record_stage(&self, label: &str, payload: serde_json::Value) {
        lock(&self.recorder).record_stage(label, payload);
    }

    fn recorder_snapshot(&self) -> FlightRecorder {
        lock(&self.recorder).clone()
    }
}

fn seed_response(submission: &Submission) -> Message {
    let mut response = submission.initial_response.clone();
    if response.parent_message_id.is_none() && !submission.user_message.message_id.is_empty() {
        response.parent_message_id = Some(submission.user_message.message_id.clone());
    }
    response
}

/// Fills an empty final response, in order, from its TEXT parts, then from
/// the connection's accumulated delta text. A response with no content at all
/// is flagged as an error.
pub fn recover_empty_response(response: &mut Message, accumulated: &str) -> bool {
    if !response.text.trim().is_empty() {
        return false;
    }
    let from_parts = response.text_from_parts();
    if !from_parts.trim().is_empty() {
        response.text = from_parts;
        return true;
    }
    if !accumulated.trim().is_empty() {
        tracing::warn!(
            "[⚙️ ] Final response was empty; recovered {} chars from deltas",
            accumulated.chars().count()
        );
        let index = response.content.len();
        response.replace_part(index, ContentPart::text(accumulated));
        return true;
    }
    let has_other_content = response
        .parts()
        .any(|p| !matches!(p, ContentPart::Text { .. } | ContentPart::Error { .. }));
    if has_other_content {
        return false;
    }
    tracing::warn!("[⚙️ ] Final response was empty and nothing was accumulated");
    response.push_error(EMPTY_RESPONSE_PLACEHOLDER);
    true
}

/// Keeps the server's final `text` authoritative while holding on to the
/// parts streamed on this connection. Afterwards `text` always equals the
/// concatenation of the TEXT parts.
pub fn reconcile_content(response: &mut Message, assembled: Option<&Message>) {
    if response.parts().next().is_some() {
        if !response.has_text_parts() && !response.text.is_empty() {
            let text = std::mem::take(&mut response.text);
            response.content.push(Some(ContentPart::text(text)));
        }
        response.sync_text();
        return;
    }
    let server_text = std::mem::take(&mut response.text);
    let response_id = response.message_id.clone();
    let same_message =
        |a: &&Message| a.message_id.is_empty() || response_id.is_empty() || a.message_id == response_id;
    if let Some(assembled) = assembled
        .filter(same_message)
        .filter(|a| a.parts().next().is_some())
    {
        response.content = assembled.content.clone();
        if !response.error {
            response.error = assembled.error;
        }
        let streamed = response.text_from_parts();
        if !server_text.is_empty() && streamed != server_text {
            tracing::debug!("[⚙️ ] Final text differs from streamed text; keeping the final text");
            for slot in response.content.iter_mut() {
                if matches!(slot, Some(ContentPart::Text { .. })) {
                    *slot = None;
                }
            }
            response.content.push(Some(ContentPart::text(server_text)));
        }
    } else if !server_text.is_empty() {
        response.content.push(Some(ContentPart::text(server_text)));
    }
    response.sync_text();
}

/// Message list that follows a final event. Pure: the same inputs always
/// produce the same list.
pub fn finalize_messages(
    submission: &Submission,
    request_fallback: &Message,
    assembled: Option<&Message>,
    final_event: &FinalEvent,
    accumulated: &str,
) -> Vec<Message> {
    let mut messages = submission.base_messages();
    if submission.includes_user_message() {
        let request = final_event
            .request_message
            .clone()
            .unwrap_or_else(|| request_fallback.clone());
        messages.push(request);
    }

    let mut responses = match &final_event.run_messages {
        Some(run_messages) if !run_messages.is_empty() => run_messages.clone(),
        _ => vec![final_event
            .response_message
            .clone()
            .unwrap_or_else(|| seed_response(submission))],
    };
    if let Some(last) = responses.last_mut() {
        last.unfinished = false;
        reconcile_content(last, assembled);
        recover_empty_response(last, accumulated);
    }
    messages.extend(responses);
    messages
}

#[derive(Debug)]
pub enum PanelOutcome {
    Completed { messages: Vec<Message> },
    Cancelled,
    Failed { error: ObservedError, messages: Vec<Message> },
}

impl PanelOutcome {
    pub fn messages(&self) -> &[Message] {
        match self {
            Self::Completed { messages } | Self::Failed { messages, .. } => messages,
            Self::Cancelled => &[],
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

pub struct PanelHandle {
    id: PanelId,
    join: JoinHandle<PanelOutcome>,
}

impl PanelHandle {
    pub fn id(&self) -> PanelId {
        self.id
    }

    pub async fn join(self) -> PanelOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => PanelOutcome::Failed {
                error: DuetError::Internal(
                    format!("panel task for {} ended abnormally: {}", self.id, e),
                    tracing_error::SpanTrace::capture(),
                )
                .into(),
                messages: Vec::new(),
            },
        }
    }
}

/// Frame handler of one panel: a fresh assembler per connection attempt.
struct PanelPipeline {
    ctx: Arc<PanelContext>,
    store: Arc<dyn MessageStore>,
    dispatcher: EventDispatcher,
    assembler: Option<StepAssembler>,
    metric: StreamMetric,
    final_event: Option<FinalEvent>,
}

impl PanelPipeline {
    fn new(ctx: Arc<PanelContext>, store: Arc<dyn MessageStore>, dispatcher: EventDispatcher) -> Self {
        Self {
            ctx,
            store,
            dispatcher,
            assembler: None,
            metric: StreamMetric::new(),
            final_event: None,
        }
    }
}

impl FrameHandler for PanelPipeline {
    fn on_attempt(&mut self, key: ConnectionKey, _attempt: u32) {
        self.assembler = Some(StepAssembler::new(
            key,
            Arc::clone(&self.ctx.submission),
            Arc::clone(&self.store),
        ));
        self.final_event = None;
    }

    fn on_frame(&mut self, key: ConnectionKey, raw: &str) -> FrameFlow {
        let Some(assembler) = self.assembler.as_mut() else {
            return FrameFlow::Continue;
        };
        if assembler.key() != key || !self.ctx.assert_active_connection(key) {
            return FrameFlow::Continue;
        }

        let dispatch = self.dispatcher.dispatch(raw, assembler);
        self.metric.record(&dispatch);
        match dispatch {
            Dispatch::Applied(StepOutcome::Applied { appended_text }) => {
                if !appended_text.is_empty() {
                    self.ctx.append_delta(key.connection, &appended_text);
                }
                if assembler.has_created() {
                    self.ctx
                        .mark_created(assembler.abort_key(), assembler.request_message());
                }
                FrameFlow::Continue
            }
            Dispatch::Applied(StepOutcome::Dropped(reason)) => {
                self.ctx.record(format!("dropped event: {}", reason));
                FrameFlow::Continue
            }
            Dispatch::Rejected(rejection) => {
                self.ctx.record(format!("rejected frame: {}", rejection));
                FrameFlow::Continue
            }
            Dispatch::Done => FrameFlow::Continue,
            Dispatch::Final(event) => {
                self.final_event = Some(event);
                FrameFlow::Finished
            }
        }
    }
}

type PanelMap = Arc<Mutex<HashMap<Side, Arc<PanelContext>>>>;

fn remove_if_current(panels: &PanelMap, ctx: &PanelContext) {
    let mut map = lock(panels);
    if map.get(&ctx.id().side).is_some_and(|c| c.id() == ctx.id()) {
        map.remove(&ctx.id().side);
    }
}

/// Everything a panel task needs, moved into the spawned task.
struct PanelTask {
    ctx: Arc<PanelContext>,
    collaborators: Collaborators,
    manager: ConnectionManager,
    pipeline: PanelPipeline,
    panels: PanelMap,
    capture_dir: Option<PathBuf>,
}

impl PanelTask {
    async fn run(mut self) -> PanelOutcome {
        let outcome = self.manager.run(&mut self.pipeline).await;
        let result = match outcome {
            ConnectionOutcome::Finished => match self.pipeline.final_event.take() {
                Some(event) => self.complete(event),
                None => self.fail(DuetError::Protocol("stream finished without a final event".into()).into()),
            },
            ConnectionOutcome::Closed { received_data: true } => {
                tracing::debug!("[⚙️ ] {} closed without final; finalizing locally", self.ctx.id());
                self.ctx.record("clean EOF without final");
                let event = match &self.pipeline.assembler {
                    Some(assembler) => assembler.synthesize_final(),
                    None => FinalEvent::default(),
                };
                self.complete(event)
            }
            ConnectionOutcome::Closed { received_data: false } => self.fail(
                DuetError::EmptyResponse("stream closed before any data arrived".into()).into(),
            ),
            ConnectionOutcome::Cancelled => PanelOutcome::Cancelled,
            ConnectionOutcome::Failed(error) => self.fail(error),
        };

        let label = match &result {
            PanelOutcome::Completed { .. } => "completed",
            PanelOutcome::Cancelled => "cancelled",
            PanelOutcome::Failed { .. } => "failed",
        };
        self.metric_summary(label);
        if let PanelOutcome::Completed { messages } = &result {
            self.run_side_effects(messages).await;
        }
        if let Some(dir) = &self.capture_dir {
            self.ctx.recorder_snapshot().save(dir).await;
        }
        result
    }

    fn metric_summary(&mut self, label: &str) {
        if let Some(response) = self.pipeline.assembler.as_ref().and_then(|a| a.response()) {
            self.pipeline.metric.record_tools(response);
        }
        self.pipeline.metric.log_summary(self.ctx.id(), label);
    }

    fn settle(&self, status: PanelStatus) {
        let store = &self.collaborators.store;
        store.set_status(self.ctx.id(), status);
        store.set_submitting(self.ctx.id(), false);
        self.ctx.clear_timers();
        remove_if_current(&self.panels, &self.ctx);
    }

    fn request_fallback(&self) -> Message {
        match &self.pipeline.assembler {
            Some(assembler) => assembler.request_message().clone(),
            None => self.ctx.submission().user_message.clone(),
        }
    }

    fn complete(&self, event: FinalEvent) -> PanelOutcome {
        if !self.ctx.assert_active() {
            return PanelOutcome::Cancelled;
        }
        let accumulated = self
            .ctx
            .current_connection()
            .map(|c| self.ctx.accumulated(c))
            .unwrap_or_default();
        let assembled = self.pipeline.assembler.as_ref().and_then(|a| a.response());
        let messages = finalize_messages(
            self.ctx.submission(),
            &self.request_fallback(),
            assembled,
            &event,
            &accumulated,
        );
        if let Ok(value) = serde_json::to_value(&messages) {
            self.ctx.record_stage("final_messages", value);
        }
        self.collaborators
            .store
            .set_messages(self.ctx.id(), messages.clone());
        tracing::info!("[⚙️ ] {} completed", self.ctx.id());
        self.settle(PanelStatus::Completed);
        PanelOutcome::Completed { messages }
    }

    /// Attaches the error to the in-progress response and emits it.
    fn fail(&self, error: ObservedError) -> PanelOutcome {
        if !self.ctx.assert_active() {
            return PanelOutcome::Cancelled;
        }
        let submission = self.ctx.submission();
        let mut messages = submission.base_messages();
        if submission.includes_user_message() {
            messages.push(self.request_fallback());
        }
        let mut response = self
            .pipeline
            .assembler
            .as_ref()
            .and_then(|a| a.response().cloned())
            .unwrap_or_else(|| seed_response(submission));
        response.push_error(error.inner.to_string());
        response.unfinished = false;
        messages.push(response);

        tracing::error!("[⚙️ ] {} failed: {}", self.ctx.id(), error.inner);
        self.ctx.record(format!("failed: {}", error.inner));
        self.collaborators
            .store
            .set_messages(self.ctx.id(), messages.clone());
        self.settle(PanelStatus::Failed {
            reason: error.inner.to_string(),
        });
        PanelOutcome::Failed { error, messages }
    }

    async fn run_side_effects(&self, messages: &[Message]) {
        let submission = self.ctx.submission();
        let side_effects = &self.collaborators.side_effects;
        if submission.is_new_conversation() && !submission.is_temporary {
            let conversation_id = messages
                .iter()
                .rev()
                .find_map(|m| m.conversation_id.clone())
                .filter(|id| !id.is_empty());
            if let Some(conversation_id) = conversation_id {
                side_effects.generate_title(&conversation_id).await;
            }
        }
        side_effects.refresh_balance().await;
    }
}

/// Result of an explicit cancel.
#[derive(Debug)]
pub enum CancelOutcome {
    /// Nothing reached the backend yet; torn down locally.
    Local,
    Aborted(AbortOutcome),
    /// The abort request failed; the panel is torn down regardless.
    AbortFailed(ObservedError),
}

/// Supervises the panels of one view, at most one per side.
pub struct PanelRegistry {
    transport: Arc<dyn Transport>,
    collaborators: Collaborators,
    config: StreamConfig,
    panels: PanelMap,
}

impl PanelRegistry {
    pub fn new(transport: Arc<dyn Transport>, collaborators: Collaborators, config: StreamConfig) -> Self {
        Self {
            transport,
            collaborators,
            config,
            panels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Starts a panel on `side`, superseding any panel already there.
    pub fn submit(&self, side: Side, submission: Submission) -> PanelHandle {
        let id = PanelId::new(side);
        let submission = Arc::new(submission);
        let ctx = Arc::new(PanelContext::new(id, Arc::clone(&submission)));

        let previous = lock(&self.panels).insert(side, Arc::clone(&ctx));
        if let Some(previous) = previous {
            tracing::info!("[⚙️ ] {} superseded by {}", previous.id(), id);
            previous.deactivate();
            previous.record("superseded");
            self.collaborators.store.set_submitting(previous.id(), false);
            self.collaborators
                .store
                .set_status(previous.id(), PanelStatus::Cancelled);
        }

        tracing::info!(
            "[⚙️ ] Submitting {} to {} ({})",
            id,
            submission.endpoint.endpoint,
            submission.model().unwrap_or("default model")
        );
        self.collaborators.store.set_submitting(id, true);
        self.spawn_failsafe(&ctx);

        let dispatcher = EventDispatcher::for_model(submission.model(), &self.config.plain_text_models);
        let manager = ConnectionManager::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.collaborators.tokens),
            Arc::clone(&self.collaborators.store),
            RetryPolicy::new(self.config.retry.clone()),
            Arc::clone(&ctx),
        );
        let task = PanelTask {
            pipeline: PanelPipeline::new(Arc::clone(&ctx), Arc::clone(&self.collaborators.store), dispatcher),
            ctx,
            collaborators: self.collaborators.clone(),
            manager,
            panels: Arc::clone(&self.panels),
            capture_dir: self.config.debug_capture_dir.clone(),
        };

        let span = tracing::info_span!("panel", panel = %id);
        PanelHandle {
            id,
            join: tokio::spawn(task.run().instrument(span)),
        }
    }

    /// Comparison mode: two independent panels for one prompt. The secondary
    /// request is tagged as an added request.
    pub fn submit_comparison(&self, primary: Submission, mut secondary: Submission) -> (PanelHandle, PanelHandle) {
        secondary.origin = Origin::AddedRequest;
        let first = self.submit(Side::Primary, primary);
        let second = self.submit(Side::Secondary, secondary);
        (first, second)
    }

    fn spawn_failsafe(&self, ctx: &Arc<PanelContext>) {
        let ctx = Arc::clone(ctx);
        let store = Arc::clone(&self.collaborators.store);
        let after = Duration::from_millis(self.config.submission_timeout_ms);
        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.timers().cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    if ctx.assert_active() {
                        tracing::warn!("[⚙️ ] {} still submitting after {:?}; clearing flag", ctx.id(), after);
                        ctx.record("submission failsafe fired");
                        store.set_submitting(ctx.id(), false);
                    }
                }
            }
        });
    }

    pub fn assert_panel_active(&self, panel: PanelId) -> bool {
        lock(&self.panels)
            .get(&panel.side)
            .is_some_and(|ctx| ctx.id() == panel && ctx.is_active())
    }

    pub fn active_panel(&self, side: Side) -> Option<PanelId> {
        lock(&self.panels)
            .get(&side)
            .filter(|ctx| ctx.is_active())
            .map(|ctx| ctx.id())
    }

    /// Local teardown without contacting the backend.
    pub fn unmount(&self, side: Side) -> Option<PanelId> {
        let ctx = lock(&self.panels).remove(&side)?;
        ctx.deactivate();
        self.collaborators.store.set_submitting(ctx.id(), false);
        self.collaborators.store.set_status(ctx.id(), PanelStatus::Cancelled);
        Some(ctx.id())
    }

    /// Cancels the panel on `side`: deactivation happens before anything is
    /// awaited. If the backend already created the response it is asked to
    /// abort, and a final state it returns goes through normal finalization.
    pub async fn cancel(&self, side: Side) -> Option<CancelOutcome> {
        let ctx = lock(&self.panels).remove(&side)?;
        ctx.deactivate();
        let id = ctx.id();
        let store = &self.collaborators.store;
        store.set_submitting(id, false);
        store.set_status(id, PanelStatus::Cancelled);
        ctx.record("cancelled");

        let Some(abort_key) = ctx.abort_key() else {
            tracing::info!("[⚙️ ] {} cancelled before creation; local teardown", id);
            return Some(CancelOutcome::Local);
        };

        let submission = ctx.submission();
        let request = AbortRequest {
            abort_key,
            endpoint: submission.endpoint.endpoint.clone(),
        };
        let token = self.collaborators.tokens.token().await;
        match self
            .collaborators
            .aborter
            .abort(&abort_url(submission), &request, token)
            .await
        {
            Ok(AbortOutcome::Final(event)) => {
                let accumulated = ctx
                    .current_connection()
                    .map(|c| ctx.accumulated(c))
                    .unwrap_or_default();
                let messages = finalize_messages(
                    submission,
                    &ctx.request_message(),
                    None,
                    &event,
                    &accumulated,
                );
                store.set_messages(id, messages);
                tracing::info!("[⚙️ ] {} aborted with final state", id);
                Some(CancelOutcome::Aborted(AbortOutcome::Final(event)))
            }
            Ok(outcome) => {
                tracing::info!("[⚙️ ] {} abort: {:?}", id, outcome);
                Some(CancelOutcome::Aborted(outcome))
            }
            Err(e) => {
                tracing::warn!("[⚙️ ] {} abort request failed: {}", id, e.inner);
                Some(CancelOutcome::AbortFailed(e))
            }
        }
    }
}
