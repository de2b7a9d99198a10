#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod assembler;
pub mod collaborators;
pub mod connection;
pub mod constants;
pub mod debug_utils;
pub mod dispatcher;
pub mod hardening;
pub mod logging;
pub mod main_helper;
pub mod panel;
pub mod projections;
pub mod redaction;
pub mod str_utils;
pub mod transport;
pub mod types;

pub use types::*;

pub use main_helper::Args;
pub use panel::{PanelOutcome, PanelRegistry, StreamConfig};
