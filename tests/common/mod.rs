#![allow(dead_code)]

use async_trait::async_trait;
use duet::collaborators::{Collaborators, MemoryStore, TokenProvider};
use duet::hardening::RetryConfig;
use duet::panel::{PanelRegistry, StreamConfig};
use duet::transport::{FrameStream, StreamRequest, Transport, TransportEvent};
use duet::types::{DuetError, EndpointOptions, Message, Submission, TransportError};
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// What one call to `open` does.
#[derive(Clone, Debug)]
pub enum Script {
    /// `open` fails with this error.
    Fail(TransportError),
    /// `open` succeeds, the events are delivered, then the stream closes.
    Stream(Vec<TransportEvent>),
    /// `open` succeeds, the events are delivered, then the stream stays silent.
    StreamThenHang(Vec<TransportEvent>),
}

fn play(script: Script) -> Result<FrameStream, TransportError> {
    match script {
        Script::Fail(e) => Err(e),
        Script::Stream(events) => Ok(tokio_stream::iter(events).boxed()),
        Script::StreamThenHang(events) => Ok(tokio_stream::iter(events)
            .chain(futures_util::stream::pending())
            .boxed()),
    }
}

/// Transport fake that plays scripts in order, keyed by the `model` field
/// of the request body. The last script of a queue repeats forever.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    opens: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(scripts: Vec<Script>) -> Arc<Self> {
        let transport = Self::new();
        transport.script(MODEL, scripts);
        Arc::new(transport)
    }

    pub fn script(&self, model: &str, scripts: Vec<Script>) {
        if let Ok(mut map) = self.scripts.lock() {
            map.insert(model.to_string(), scripts.into());
        }
    }

    pub fn opens(&self, model: &str) -> usize {
        match self.opens.lock() {
            Ok(map) => map.get(model).copied().unwrap_or(0),
            Err(_) => 0,
        }
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        match self.requests.lock() {
            Ok(r) => r.clone(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, request: &StreamRequest) -> Result<FrameStream, TransportError> {
        let model = request.body["model"].as_str().unwrap_or(MODEL).to_string();
        if let Ok(mut r) = self.requests.lock() {
            r.push(request.clone());
        }
        if let Ok(mut opens) = self.opens.lock() {
            *opens.entry(model.clone()).or_default() += 1;
        }
        let script = {
            let mut map = match self.scripts.lock() {
                Ok(m) => m,
                Err(_) => return Err(TransportError::network("script lock poisoned")),
            };
            match map.get_mut(&model) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match script {
            Some(script) => play(script),
            None => Err(TransportError::network(format!("no script for {}", model))),
        }
    }
}

/// Token provider whose refresh always succeeds with `fresh-token`.
#[derive(Default)]
pub struct RefreshingToken {
    current: Mutex<Option<String>>,
    pub refreshes: AtomicUsize,
    pub fail: bool,
}

impl RefreshingToken {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for RefreshingToken {
    async fn token(&self) -> Option<String> {
        match self.current.lock() {
            Ok(t) => t.clone(),
            Err(_) => None,
        }
    }

    async fn refresh(&self) -> duet::types::Result<String> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DuetError::Auth("refresh endpoint down".into()).into());
        }
        if let Ok(mut t) = self.current.lock() {
            *t = Some("fresh-token".into());
        }
        Ok("fresh-token".into())
    }
}

pub const MODEL: &str = "test-model";

pub fn frame(raw: &str) -> TransportEvent {
    TransportEvent::Frame(raw.to_string())
}

pub fn frames(raw: &[&str]) -> Vec<TransportEvent> {
    raw.iter().map(|r| frame(r)).collect()
}

pub fn http_error(status: u16) -> TransportError {
    TransportError::new(Some(status), format!("status {}", status))
}

pub fn submission(prompt: &str, model: &str) -> Submission {
    Submission {
        user_message: Message {
            message_id: format!("user-{}", model),
            text: prompt.to_string(),
            is_created_by_user: true,
            ..Default::default()
        },
        endpoint: EndpointOptions {
            endpoint: "openAI".into(),
            model: Some(model.to_string()),
            base_url: "http://backend.test/api/ask".into(),
            options: Default::default(),
        },
        initial_response: Message {
            message_id: format!("response-{}", model),
            ..Default::default()
        },
        conversation_id: Some("c1".into()),
        ..Default::default()
    }
}

pub fn fast_config() -> StreamConfig {
    StreamConfig {
        retry: RetryConfig {
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter: 0.0,
            ..RetryConfig::default()
        },
        ..StreamConfig::default()
    }
}

pub fn registry(transport: Arc<dyn Transport>, store: Arc<MemoryStore>) -> PanelRegistry {
    PanelRegistry::new(transport, Collaborators::new(store), fast_config())
}

/// The `2+2?` exchange: created, one text step, one delta, final.
pub fn two_plus_two() -> Vec<TransportEvent> {
    frames(&[
        r#"{"message":{"messageId":"m1"}}"#,
        r#"{"event":"on_run_step","data":{"id":"s1","runId":"r1","index":0}}"#,
        r#"{"event":"on_message_delta","data":{"id":"s1","delta":{"content":[{"type":"text","text":"4"}]}}}"#,
        r#"{"final":true,"responseMessage":{"messageId":"m1","text":"4"}}"#,
    ])
}

/// Streams `words` as deltas on step `s1` of run `r1`, then a final whose
/// response text is empty, so the panel has to recover from its own deltas.
pub fn word_stream(words: &[&str]) -> Vec<TransportEvent> {
    let mut events = frames(&[
        r#"{"message":{"messageId":"m1"}}"#,
        r#"{"event":"on_run_step","data":{"id":"s1","runId":"r1","index":0}}"#,
    ]);
    for word in words {
        let delta = serde_json::json!({
            "event": "on_message_delta",
            "data": {"id": "s1", "delta": {"content": [{"type": "text", "text": word}]}}
        });
        events.push(TransportEvent::Frame(delta.to_string()));
    }
    events.push(frame(r#"{"final":true,"responseMessage":{"messageId":"m1","text":""}}"#));
    events
}

pub async fn wait_for_opens(transport: &ScriptedTransport, model: &str, n: usize) {
    for _ in 0..10_000 {
        if transport.opens(model) >= n {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("transport for {} was never opened {} times", model, n);
}
