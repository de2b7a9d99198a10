use futures_util::StreamExt;
use std::sync::Arc;

use crate::collaborators::{MessageStore, TokenProvider};
use crate::constants::MAX_STREAM_FRAMES;
use crate::hardening::{GiveUpReason, RetryDecision, RetryPolicy};
use crate::panel::PanelContext;
use crate::projections::project_submission;
use crate::transport::{Transport, TransportEvent};
use crate::types::{ConnectionId, ConnectionKey, DuetError, ObservedError, PanelStatus, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlow {
    Continue,
    /// The handler saw a terminal frame; the connection is closed.
    Finished,
}

/// Receives the frames of every attempt, in arrival order.
pub trait FrameHandler: Send {
    /// Called before an attempt opens. Per-connection state must be reset here.
    fn on_attempt(&mut self, key: ConnectionKey, attempt: u32);

    fn on_frame(&mut self, key: ConnectionKey, raw: &str) -> FrameFlow;
}

#[derive(Debug)]
pub enum ConnectionOutcome {
    Finished,
    /// Clean EOF without a terminal frame.
    Closed { received_data: bool },
    Cancelled,
    Failed(ObservedError),
}

enum AttemptResult {
    Finished,
    Closed { received_data: bool },
    Cancelled,
    Errored { error: TransportError, received_data: bool },
}

/// Drives the connection attempts of one panel request.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenProvider>,
    store: Arc<dyn MessageStore>,
    policy: RetryPolicy,
    ctx: Arc<PanelContext>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenProvider>,
        store: Arc<dyn MessageStore>,
        policy: RetryPolicy,
        ctx: Arc<PanelContext>,
    ) -> Self {
        Self {
            transport,
            tokens,
            store,
            policy,
            ctx,
        }
    }

    /// Marks the panel inactive. Every pending wait observes it and stops.
    pub fn cancel(&self) {
        self.ctx.deactivate();
    }

    fn set_status(&self, status: PanelStatus) {
        if self.ctx.assert_active() {
            self.store.set_status(self.ctx.id(), status);
        }
    }

    pub async fn run<H: FrameHandler>(&self, handler: &mut H) -> ConnectionOutcome {
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            if !self.ctx.assert_active() {
                return ConnectionOutcome::Cancelled;
            }
            let key = ConnectionKey {
                panel: self.ctx.id(),
                connection: ConnectionId::new(),
            };
            self.ctx.begin_connection(key.connection);
            handler.on_attempt(key, attempt);
            if attempt == 0 {
                self.set_status(PanelStatus::Connecting { attempt });
            }
            self.ctx
                .record(format!("attempt {} on {}", attempt + 1, key.connection));

            let (error, received_data) = match self.attempt(key, handler).await {
                AttemptResult::Finished => return ConnectionOutcome::Finished,
                AttemptResult::Closed { received_data } => {
                    return ConnectionOutcome::Closed { received_data }
                }
                AttemptResult::Cancelled => return ConnectionOutcome::Cancelled,
                AttemptResult::Errored {
                    error,
                    received_data,
                } => (error, received_data),
            };

            tracing::warn!(
                "[☁️  -> ⚙️ ] {} attempt {} failed: {}",
                key,
                attempt + 1,
                error
            );
            self.ctx.record_transport_error(&error);

            if error.is_unauthorized() && !refreshed && !received_data {
                refreshed = true;
                let refresh = tokio::select! {
                    biased;
                    _ = self.ctx.cancel_token().cancelled() => return ConnectionOutcome::Cancelled,
                    refresh = self.tokens.refresh() => refresh,
                };
                match refresh {
                    Ok(_) => {
                        tracing::info!("[⚙️ ] {} token refreshed, resuming", key);
                        self.ctx.record("token refreshed after 401");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("[⚙️ ] {} token refresh failed: {}", key, e.inner);
                    }
                }
            }

            match self.policy.decide(&error, attempt, received_data) {
                RetryDecision::Retry {
                    next_attempt,
                    delay,
                } => {
                    self.set_status(PanelStatus::Reconnecting {
                        attempt: next_attempt,
                        max: self.policy.max_retries(),
                    });
                    self.ctx
                        .record(format!("retry {} scheduled in {:?}", next_attempt, delay));
                    let cancelled = tokio::select! {
                        biased;
                        _ = self.ctx.timers().cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled || !self.ctx.assert_active() {
                        tracing::debug!("[⚙️ ] {} retry wait cancelled", key);
                        return ConnectionOutcome::Cancelled;
                    }
                    attempt = next_attempt;
                }
                RetryDecision::GiveUp(reason) => {
                    self.ctx.record(format!("giving up: {:?}", reason));
                    return ConnectionOutcome::Failed(Self::terminal_error(reason, error, attempt));
                }
            }
        }
    }

    fn terminal_error(reason: GiveUpReason, error: TransportError, attempt: u32) -> ObservedError {
        match reason {
            GiveUpReason::DataReceived => DuetError::PartialStream(error.to_string()).into(),
            GiveUpReason::Exhausted => DuetError::RetriesExhausted {
                attempts: attempt + 1,
                last_error: error.to_string(),
            }
            .into(),
            GiveUpReason::NotRetryable if error.is_unauthorized() => {
                DuetError::Auth(error.to_string()).into()
            }
            GiveUpReason::NotRetryable => DuetError::Transport(error).into(),
        }
    }

    async fn attempt<H: FrameHandler>(&self, key: ConnectionKey, handler: &mut H) -> AttemptResult {
        let token = self.tokens.token().await;
        let request = project_submission(self.ctx.submission(), token);
        let timeout = self.policy.connection_timeout();

        let opened = tokio::select! {
            biased;
            _ = self.ctx.cancel_token().cancelled() => return AttemptResult::Cancelled,
            opened = tokio::time::timeout(timeout, self.transport.open(&request)) => opened,
        };
        let mut frames = match opened {
            Err(_elapsed) => {
                return AttemptResult::Errored {
                    error: TransportError::timeout(timeout),
                    received_data: false,
                }
            }
            Ok(Err(error)) => {
                return AttemptResult::Errored {
                    error,
                    received_data: false,
                }
            }
            Ok(Ok(frames)) => frames,
        };

        if !self.ctx.assert_active_connection(key) {
            return AttemptResult::Cancelled;
        }
        tracing::debug!("[☁️  -> ⚙️ ] {} open", key);
        self.set_status(PanelStatus::Open);

        let mut received_data = false;
        let mut frame_count = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.cancel_token().cancelled() => return AttemptResult::Cancelled,
                next = frames.next() => next,
            };
            if !self.ctx.assert_active_connection(key) {
                return AttemptResult::Cancelled;
            }
            match next {
                None => return AttemptResult::Closed { received_data },
                Some(TransportEvent::Error(error)) => {
                    return AttemptResult::Errored {
                        error,
                        received_data,
                    }
                }
                Some(TransportEvent::Frame(raw)) => {
                    received_data = true;
                    frame_count += 1;
                    if frame_count > MAX_STREAM_FRAMES {
                        return AttemptResult::Errored {
                            error: TransportError::network(format!(
                                "stream exceeded {} frames",
                                MAX_STREAM_FRAMES
                            )),
                            received_data,
                        };
                    }
                    if handler.on_frame(key, &raw) == FrameFlow::Finished {
                        return AttemptResult::Finished;
                    }
                }
            }
        }
    }
}
