//! Daemon side of epdcal: configuration, refresh orchestration, headless
//! capture, battery telemetry and the HTTP API.
//!
//! The binary wires this crate together: it loads [`Config`], starts the
//! [`web`] server, builds an [`Orchestrator`] owning the panel handle, and
//! runs either one cycle (`--once`) or the cron loop.

pub mod battery;
pub mod cache;
pub mod capture;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod shutdown;
pub mod web;

pub use battery::{default_reader, BatteryReader, BatteryStatus, MockBatteryReader};
pub use cache::SnapshotCache;
pub use capture::{capture_png, CaptureOptions};
pub use config::{ics_cache_dir, preview_path, Config, DEFAULT_CONFIG_PATH};
pub use error::{ServerError, ServerResult};
pub use orchestrator::{parse_schedule, CycleOptions, Orchestrator};
pub use shutdown::{spawn_signal_listener, ShutdownHandle};
pub use web::{AppState, SharedState};
