/// HTTP statuses that are worth another connection attempt. `0` stands for
/// "the browser-style transport reported a failure without a status".
pub const RETRYABLE_STATUS_CODES: &[u16] = &[0, 408, 429, 500, 502, 503, 504];

/// Retry defaults
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_JITTER: f64 = 0.2;

/// Timer defaults
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SUBMISSION_TIMEOUT_MS: u64 = 30_000;

/// Legacy completion marker sent as a bare frame.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Step id used for deltas that arrive in the legacy `choices` format, which
/// never declares a run step of its own.
pub const LEGACY_STEP_ID: &str = "legacy_stream_step";

/// Stream guards
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;
/// Frames accepted on one connection before it is treated as runaway.
pub const MAX_STREAM_FRAMES: usize = 2_000_000;
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;
pub const MAX_CONTENT_INDEX: usize = 4_096;

/// Models known to occasionally push raw text instead of JSON frames.
pub const PLAIN_TEXT_FRAME_MODELS: &[&str] = &[
    r"gemini-[0-9.]+-flash-lite",
    r"(^|[-/])r1($|[-:])",
];

/// Shown in place of content when a stream completes with nothing to show.
pub const EMPTY_RESPONSE_PLACEHOLDER: &str = "The model returned an empty response.";

/// Path segment of the abort collaborator, relative to the endpoint base.
pub const ABORT_PATH: &str = "abort";

/// Conversation id the client uses before the server has assigned one.
pub const NEW_CONVERSATION_ID: &str = "new";
