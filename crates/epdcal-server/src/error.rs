//! Server error types.

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors from configuration, scheduling, capture and the cycle pipeline.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (config file, preview file, listener).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or is invalid. Fatal at startup.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The cron expression could not be parsed.
    #[error("invalid refresh schedule {expr:?}: {message}")]
    Schedule { expr: String, message: String },

    /// The headless capture did not produce a frame in time.
    #[error("capture timed out after {seconds}s")]
    CaptureTimeout { seconds: u64 },

    /// The headless capture failed outright.
    #[error("capture failed: {message}")]
    Capture { message: String },

    /// A feed-layer failure that aborts the cycle.
    #[error(transparent)]
    Feed(#[from] epdcal_feed::FeedError),

    /// A packing or panel failure.
    #[error(transparent)]
    Panel(#[from] epdcal_panel::PanelError),

    /// Shutdown was requested; propagated unchanged.
    #[error("operation cancelled")]
    Cancelled,
}

impl ServerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn capture(message: impl Into<String>) -> Self {
        Self::Capture {
            message: message.into(),
        }
    }

    pub fn schedule(expr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schedule {
            expr: expr.into(),
            message: message.into(),
        }
    }

    /// True when the error is the cancellation sentinel.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
            || matches!(self, Self::Panel(epdcal_panel::PanelError::Cancelled))
    }
}
