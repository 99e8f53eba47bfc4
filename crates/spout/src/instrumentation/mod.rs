//! Observability hook: named events with JSON payloads.

mod logger;
mod monitor;

pub use logger::LoggerListener;
pub use monitor::{events, Event, Listener, Monitor};
