//! Error types for feed operations.

use std::fmt;
use thiserror::Error;

/// A specialized Result type for feed operations.
pub type FeedResult<T> = Result<T, FeedError>;

/// High-level classification of a feed error, used for retry decisions and
/// API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedErrorCode {
    /// Transport-level failure: connect, DNS, timeout.
    NetworkTransient,
    /// Upstream returned a non-200, non-304 status.
    HttpStatus,
    /// The disk cache is in a state that contradicts the HTTP exchange
    /// (e.g. 304 with no cached body).
    CacheCorrupt,
    /// The ICS stream or a VEVENT could not be parsed.
    ParseMalformed,
    /// An RRULE could not be parsed or expanded.
    RecurrenceRuleInvalid,
    /// Caller-supplied window or configuration is invalid.
    InvalidWindow,
    /// Operation was cancelled.
    Cancelled,
    /// Unexpected internal state.
    Internal,
}

impl FeedErrorCode {
    /// Returns true if the operation may be retried on a later cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkTransient | Self::HttpStatus)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkTransient => "network_transient",
            Self::HttpStatus => "http_status",
            Self::CacheCorrupt => "cache_corrupt",
            Self::ParseMalformed => "parse_malformed",
            Self::RecurrenceRuleInvalid => "recurrence_rule_invalid",
            Self::InvalidWindow => "invalid_window",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FeedErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An error from the fetch/parse/expand pipeline.
///
/// Messages never contain full feed URLs; callers log the redacted form.
#[derive(Debug, Error)]
pub struct FeedError {
    code: FeedErrorCode,
    message: String,
    /// The source id this error is attributed to, if known.
    source_id: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl FeedError {
    pub fn new(code: FeedErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source_id: None,
            source: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FeedErrorCode::NetworkTransient, message)
    }

    pub fn http_status(status: u16) -> Self {
        Self::new(
            FeedErrorCode::HttpStatus,
            format!("unexpected HTTP status {status}"),
        )
    }

    pub fn cache_corrupt(message: impl Into<String>) -> Self {
        Self::new(FeedErrorCode::CacheCorrupt, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(FeedErrorCode::ParseMalformed, message)
    }

    pub fn recurrence(message: impl Into<String>) -> Self {
        Self::new(FeedErrorCode::RecurrenceRuleInvalid, message)
    }

    pub fn invalid_window(message: impl Into<String>) -> Self {
        Self::new(FeedErrorCode::InvalidWindow, message)
    }

    pub fn cancelled() -> Self {
        Self::new(FeedErrorCode::Cancelled, "operation cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FeedErrorCode::Internal, message)
    }

    /// Attributes this error to a source id.
    pub fn with_source_id(mut self, id: impl Into<String>) -> Self {
        self.source_id = Some(id.into());
        self
    }

    /// Attaches the underlying cause.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(cause));
        self
    }

    pub fn code(&self) -> FeedErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn source_id(&self) -> Option<&str> {
        self.source_id.as_deref()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref id) = self.source_id {
            write!(f, "[{}] ", id)?;
        }
        write!(f, "{}: {}", self.code, self.message)
    }
}
