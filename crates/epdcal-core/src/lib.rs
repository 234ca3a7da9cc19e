//! Core types: calendar sources, occurrences, time handling, tracing setup

pub mod model;
pub mod time;
pub mod tracing;

pub use model::{redact_url, Occurrence, Source};
pub use time::{rfc3339_nano, EventInstant};
pub use tracing::{init_tracing, TracingConfig, TracingError, TracingOutputFormat};
