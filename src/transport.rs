use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

use crate::constants::MAX_LINE_LENGTH;
use crate::str_utils::snippet;
use crate::types::TransportError;

/// Everything needed to open one streaming connection.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: String,
    pub body: Value,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Payload of one frame, with any `data: ` prefix already removed.
    Frame(String),
    Error(TransportError),
}

pub type FrameStream = BoxStream<'static, TransportEvent>;

/// Source of server-sent frames. The stream ends (`None`) on clean EOF.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, request: &StreamRequest) -> std::result::Result<FrameStream, TransportError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn reqwest_failure(e: reqwest::Error) -> TransportError {
    TransportError::new(e.status().map(|s| s.as_u16()), e.to_string())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &StreamRequest) -> std::result::Result<FrameStream, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request.body);
        if let Some(token) = &request.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(reqwest_failure)?;
        let status = response.status();
        if !status.is_success() {
            let err_body = match response.text().await {
                Ok(t) => t,
                Err(_) => "Unknown error (failed to read response text)".to_string(),
            };
            tracing::warn!(
                "[☁️  -> ⚙️ ] Stream open rejected with {}: {}",
                status,
                snippet(&err_body, 200)
            );
            return Err(TransportError::new(
                Some(status.as_u16()),
                snippet(&err_body, 512).into_owned(),
            ));
        }

        let bytes_stream = response
            .bytes_stream()
            .map(|r: reqwest::Result<bytes::Bytes>| r.map_err(std::io::Error::other));
        let lines = FramedRead::new(
            StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        );
        Ok(sse_frames(lines))
    }
}

/// Line-level SSE state: the pending `event:` name applies to the data lines
/// that follow it until the next blank line.
#[derive(Debug, Default)]
struct SseLineState {
    event: Option<String>,
    failed: bool,
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Builds the error for an `event: error` frame. The payload is usually
/// `{"status": 503, "message": "..."}` but may be any text.
fn error_from_payload(data: &str) -> TransportError {
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return TransportError::network(data);
    };
    let status = value
        .get("status")
        .or_else(|| value.get("code"))
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok());
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| value.get("error").and_then(Value::as_str))
        .or_else(|| {
            value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
        })
        .map(str::to_string)
        .unwrap_or_else(|| data.to_string());
    TransportError::new(status, message)
}

impl SseLineState {
    fn accept(&mut self, line: &str) -> Option<TransportEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            self.event = None;
            return None;
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(name) = field_value(line, "event") {
            self.event = Some(name.to_string());
            return None;
        }
        if field_value(line, "id").is_some() || field_value(line, "retry").is_some() {
            return None;
        }

        // Bare lines are accepted as frames; some backends skip the SSE framing.
        let data = field_value(line, "data").unwrap_or(line);
        if self.event.as_deref() == Some("error") {
            return Some(TransportEvent::Error(error_from_payload(data)));
        }
        Some(TransportEvent::Frame(data.to_string()))
    }
}

fn line_error(e: LinesCodecError) -> TransportError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => TransportError::network("Max line length exceeded"),
        LinesCodecError::Io(io) => TransportError::network(io.to_string()),
    }
}

/// Turns a line stream into frames. A read error is reported once and ends
/// the stream.
pub fn sse_frames<S>(lines: S) -> FrameStream
where
    S: Stream<Item = std::result::Result<String, LinesCodecError>> + Send + 'static,
{
    let state = (Box::pin(lines), SseLineState::default());
    stream::unfold(state, |(mut lines, mut sse)| async move {
        if sse.failed {
            return None;
        }
        loop {
            match lines.next().await? {
                Ok(line) => {
                    if let Some(event) = sse.accept(&line) {
                        return Some((event, (lines, sse)));
                    }
                }
                Err(e) => {
                    tracing::error!("[☁️  -> ⚙️ ] Line Parse Error: {}", e);
                    sse.failed = true;
                    return Some((TransportEvent::Error(line_error(e)), (lines, sse)));
                }
            }
        }
    })
    .boxed()
}
