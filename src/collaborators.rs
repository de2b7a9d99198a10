use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;

use crate::types::{
    DuetError, FinalEvent, Message, PanelId, PanelStatus, Result, Side, TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Sink for message snapshots. Calls are synchronous and must tolerate
/// re-emission of an unchanged state.
pub trait MessageStore: Send + Sync {
    fn set_messages(&self, panel: PanelId, messages: Vec<Message>);

    fn set_status(&self, _panel: PanelId, _status: PanelStatus) {}

    fn set_submitting(&self, _panel: PanelId, _submitting: bool) {}
}

#[derive(Default)]
struct MemoryStoreState {
    emissions: Vec<(PanelId, Vec<Message>)>,
    statuses: Vec<(PanelId, PanelStatus)>,
    submitting: HashMap<PanelId, bool>,
}

/// Store that keeps every emission in memory, keyed by panel.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emissions(&self, panel: PanelId) -> Vec<Vec<Message>> {
        lock(&self.state)
            .emissions
            .iter()
            .filter(|(p, _)| *p == panel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn emission_count(&self) -> usize {
        lock(&self.state).emissions.len()
    }

    pub fn latest(&self, panel: PanelId) -> Option<Vec<Message>> {
        lock(&self.state)
            .emissions
            .iter()
            .rev()
            .find(|(p, _)| *p == panel)
            .map(|(_, m)| m.clone())
    }

    /// Latest snapshot written by any panel on `side`.
    pub fn latest_for_side(&self, side: Side) -> Option<Vec<Message>> {
        lock(&self.state)
            .emissions
            .iter()
            .rev()
            .find(|(p, _)| p.side == side)
            .map(|(_, m)| m.clone())
    }

    pub fn statuses(&self, panel: PanelId) -> Vec<PanelStatus> {
        lock(&self.state)
            .statuses
            .iter()
            .filter(|(p, _)| *p == panel)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn is_submitting(&self, panel: PanelId) -> bool {
        lock(&self.state)
            .submitting
            .get(&panel)
            .copied()
            .unwrap_or(false)
    }
}

impl MessageStore for MemoryStore {
    fn set_messages(&self, panel: PanelId, messages: Vec<Message>) {
        lock(&self.state).emissions.push((panel, messages));
    }

    fn set_status(&self, panel: PanelId, status: PanelStatus) {
        lock(&self.state).statuses.push((panel, status));
    }

    fn set_submitting(&self, panel: PanelId, submitting: bool) {
        lock(&self.state).submitting.insert(panel, submitting);
    }
}

/// Bearer token source shared by all panels. A refresh performed for one
/// panel is visible to the others on their next `token()` call.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Option<String>;

    async fn refresh(&self) -> Result<String>;
}

pub struct StaticToken {
    token: Option<String>,
}

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn none() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Option<String> {
        self.token.clone()
    }

    async fn refresh(&self) -> Result<String> {
        Err(DuetError::Auth("static token cannot be refreshed".to_string()).into())
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    token: String,
}

/// Refreshes by POSTing to a refresh endpoint that answers `{"token": "..."}`.
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    refresh_url: String,
    current: RwLock<Option<String>>,
}

impl HttpTokenRefresher {
    pub fn new(client: reqwest::Client, refresh_url: impl Into<String>, initial: Option<String>) -> Self {
        Self {
            client,
            refresh_url: refresh_url.into(),
            current: RwLock::new(initial),
        }
    }
}

#[async_trait]
impl TokenProvider for HttpTokenRefresher {
    async fn token(&self) -> Option<String> {
        self.current.read().await.clone()
    }

    async fn refresh(&self) -> Result<String> {
        tracing::info!("[⚙️ ] Refreshing auth token");
        let response = self
            .client
            .post(&self.refresh_url)
            .send()
            .await
            .map_err(DuetError::Network)?;
        if !response.status().is_success() {
            return Err(DuetError::Auth(format!("token refresh rejected with {}", response.status())).into());
        }
        let body: RefreshResponse = response.json().await.map_err(DuetError::Network)?;
        *self.current.write().await = Some(body.token.clone());
        Ok(body.token)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub abort_key: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortOutcome {
    /// The backend had no generation under that key.
    NothingToAbort,
    /// The backend stopped the generation and returned its final state.
    Final(FinalEvent),
    Acknowledged(Value),
}

#[async_trait]
pub trait AbortClient: Send + Sync {
    async fn abort(&self, url: &str, request: &AbortRequest, token: Option<String>) -> Result<AbortOutcome>;
}

pub struct NoAbort;

#[async_trait]
impl AbortClient for NoAbort {
    async fn abort(&self, _url: &str, _request: &AbortRequest, _token: Option<String>) -> Result<AbortOutcome> {
        Ok(AbortOutcome::NothingToAbort)
    }
}

pub struct HttpAbortClient {
    client: reqwest::Client,
}

impl HttpAbortClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AbortClient for HttpAbortClient {
    async fn abort(&self, url: &str, request: &AbortRequest, token: Option<String>) -> Result<AbortOutcome> {
        let mut builder = self.client.post(url).json(request);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.map_err(DuetError::Network)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!("[⚙️ ] Abort found nothing to stop for {}", request.abort_key);
            return Ok(AbortOutcome::NothingToAbort);
        }
        let body = response.text().await.map_err(DuetError::Network)?;
        if !status.is_success() {
            return Err(TransportError::new(Some(status.as_u16()), body).into());
        }
        if body.trim().is_empty() {
            return Ok(AbortOutcome::Acknowledged(Value::Null));
        }
        let value: Value = serde_json::from_str(&body)?;
        let is_final = value
            .get("final")
            .map(|f| !f.is_null() && f != &Value::Bool(false))
            .unwrap_or(false);
        if is_final {
            let event: FinalEvent = serde_json::from_value(value)?;
            return Ok(AbortOutcome::Final(event));
        }
        Ok(AbortOutcome::Acknowledged(value))
    }
}

/// Follow-up work triggered by a completed stream.
#[async_trait]
pub trait SideEffects: Send + Sync {
    async fn generate_title(&self, _conversation_id: &str) {}

    async fn refresh_balance(&self) {}
}

pub struct NoSideEffects;

#[async_trait]
impl SideEffects for NoSideEffects {}

/// External collaborators shared by every panel of a registry.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn MessageStore>,
    pub tokens: Arc<dyn TokenProvider>,
    pub aborter: Arc<dyn AbortClient>,
    pub side_effects: Arc<dyn SideEffects>,
}

impl Collaborators {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            tokens: Arc::new(StaticToken::none()),
            aborter: Arc::new(NoAbort),
            side_effects: Arc::new(NoSideEffects),
        }
    }

    pub fn with_tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_aborter(mut self, aborter: Arc<dyn AbortClient>) -> Self {
        self.aborter = aborter;
        self
    }

    pub fn with_side_effects(mut self, side_effects: Arc<dyn SideEffects>) -> Self {
        self.side_effects = side_effects;
        self
    }
}
