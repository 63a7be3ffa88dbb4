//! Structured logging boundary.
//!
//! The stage reports notable transitions to a [`RetryLog`]. The detail record
//! is computed lazily: a logger that is not going to emit anything never pays
//! for building it. A logger may fail; the failure ends the output with
//! [`BodyRetryError::Log`](crate::BodyRetryError::Log) instead of being
//! swallowed.

use crate::error::StreamError;
use serde::Serialize;
use tracing::Level;
use uuid::Uuid;

/// Emitted before each retry.
pub const EVENT_RETRY: &str = "body_retry.retry";

/// Emitted when the byte ceiling forces pass-through streaming.
pub const EVENT_OVERFLOW: &str = "body_retry.overflow";

/// Detail record attached to a log event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogDetail {
    /// Logical request identifier
    pub request_id: Uuid,
    /// Target location
    pub url: String,
    /// Ordinal of the attempt the event refers to
    pub attempt: u32,
    /// Total attempts allowed
    pub max_attempts: u32,
    /// Bytes received from the attempt's source
    pub received_bytes: u64,
    /// Delay before the next attempt, in milliseconds
    pub delay_ms: u64,
    /// Failure description, if any
    pub error: Option<String>,
}

/// Receives structured events from the stage.
pub trait RetryLog: Send + Sync {
    /// Record `event`, calling `detail` only if the record is needed.
    fn log(&self, event: &'static str, detail: &dyn Fn() -> LogDetail) -> Result<(), StreamError>;
}

/// Logger that forwards events to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl RetryLog for TracingLog {
    fn log(&self, event: &'static str, detail: &dyn Fn() -> LogDetail) -> Result<(), StreamError> {
        if !tracing::enabled!(Level::DEBUG) {
            return Ok(());
        }

        let detail = detail();
        tracing::debug!(
            event,
            request_id = %detail.request_id,
            url = %detail.url,
            attempt = detail.attempt,
            max_attempts = detail.max_attempts,
            received_bytes = detail.received_bytes,
            delay_ms = detail.delay_ms,
            error = detail.error.as_deref().unwrap_or(""),
            "body retry event"
        );
        Ok(())
    }
}
