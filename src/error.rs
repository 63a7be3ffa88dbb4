//! Error types for the body-retry stage.
//!
//! Every failure that reaches the consumer is a [`BodyRetryError`]. Failures
//! coming out of sources and transports are arbitrary boxed errors; they are
//! normalized into a [`StreamError`] at the boundary so that the rest of the
//! crate compares and reports one structured type.
//!
//! # Taxonomy
//!
//! | Variant | Retried? | Raised when |
//! |---------|----------|-------------|
//! | `PolicyRejected` | no | pre-flight gate refused the request |
//! | `Dispatch` | no | the transport call itself failed |
//! | `Stream` | while budget remains | the current attempt's source failed |
//! | `OverflowStream` | never | a source failed after pass-through began |
//! | `RetryBudgetExhausted` | no | the last permitted attempt failed |
//! | `Aborted` | no | an abort signal was active at failure time |
//! | `RetryFailed` | no | a retry came back unsuccessful or bodiless |
//! | `Log` | no | the structured logger failed |
//! | `Internal` | no | the driver panicked |

use http::StatusCode;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error produced by sources and transports.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Result type for body-retry operations.
pub type Result<T> = std::result::Result<T, BodyRetryError>;

/// A structured stream failure carrying a message and an optional cause.
///
/// Cheap to clone; the cause is shared behind an `Arc`.
#[derive(Clone)]
pub struct StreamError {
    message: String,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl StreamError {
    /// Create an error with a message and no cause.
    pub fn new(message: impl Into<String>) -> Self {
        StreamError {
            message: message.into(),
            source: None,
        }
    }

    /// Normalize an arbitrary boxed failure.
    ///
    /// A box that already holds a `StreamError` is unwrapped unchanged.
    /// Anything else becomes the cause of a new error whose message is the
    /// failure's display text.
    pub fn normalize(error: BoxError) -> Self {
        match error.downcast::<StreamError>() {
            Ok(stream_error) => *stream_error,
            Err(other) => {
                let text = other.to_string();
                let message = if text.is_empty() {
                    "unknown stream failure".to_string()
                } else {
                    text
                };
                StreamError {
                    message,
                    source: Some(Arc::from(other)),
                }
            }
        }
    }

    /// Human readable description.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamError")
            .field("message", &self.message)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for StreamError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<&str> for StreamError {
    fn from(message: &str) -> Self {
        StreamError::new(message)
    }
}

impl From<String> for StreamError {
    fn from(message: String) -> Self {
        StreamError::new(message)
    }
}

/// Why the pre-flight gate refused to enable body retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PolicyRejection {
    /// Retry budget is zero.
    #[error("non-positive retry budget")]
    NonPositiveBudget,
    /// Method is not idempotent and unsafe retries are not allowed.
    #[error("unsafe method")]
    UnsafeMethod,
    /// Payload cannot be resent unchanged and unsafe retries are not allowed.
    #[error("non-replayable payload")]
    NonReplayablePayload,
}

impl PolicyRejection {
    /// The rejection reason as a static string.
    pub fn reason(&self) -> &'static str {
        match self {
            PolicyRejection::NonPositiveBudget => "non-positive retry budget",
            PolicyRejection::UnsafeMethod => "unsafe method",
            PolicyRejection::NonReplayablePayload => "non-replayable payload",
        }
    }
}

/// Errors surfaced by the body-retry stage.
#[derive(Debug, Clone, Error)]
pub enum BodyRetryError {
    /// Pre-flight gate refused the request; the transport was never called.
    #[error("body retry rejected: {0}")]
    PolicyRejected(PolicyRejection),

    /// The transport call failed to complete.
    #[error("dispatch failed: {0}")]
    Dispatch(StreamError),

    /// The current attempt's source failed.
    #[error("body stream failed: {0}")]
    Stream(StreamError),

    /// A source failed after the byte ceiling forced pass-through streaming.
    #[error("body stream failed after overflow: {0}")]
    OverflowStream(StreamError),

    /// The last permitted attempt failed.
    #[error("retry budget exhausted after {attempts} attempts: {source}")]
    RetryBudgetExhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// Failure of the final attempt.
        source: StreamError,
    },

    /// An abort signal was already active when the failure happened.
    #[error("aborted: {source}")]
    Aborted {
        /// The failure that triggered the retry decision.
        source: StreamError,
    },

    /// A retry attempt returned an unsuccessful response or no body.
    #[error("retry of {target} failed: {reason} (status {status})")]
    RetryFailed {
        /// Target location of the request.
        target: String,
        /// Status of the retry response.
        status: StatusCode,
        /// What was wrong with the response.
        reason: &'static str,
    },

    /// The structured logger failed.
    #[error("retry logging failed: {0}")]
    Log(StreamError),

    /// The retry driver panicked.
    #[error("internal body retry failure: {0}")]
    Internal(String),
}

impl BodyRetryError {
    /// The underlying stream or dispatch failure, if this error carries one.
    pub fn stream_error(&self) -> Option<&StreamError> {
        match self {
            BodyRetryError::Dispatch(e)
            | BodyRetryError::Stream(e)
            | BodyRetryError::OverflowStream(e)
            | BodyRetryError::Log(e) => Some(e),
            BodyRetryError::RetryBudgetExhausted { source, .. }
            | BodyRetryError::Aborted { source } => Some(source),
            BodyRetryError::PolicyRejected(_)
            | BodyRetryError::RetryFailed { .. }
            | BodyRetryError::Internal(_) => None,
        }
    }

    /// Check if the error came from the pre-flight gate.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(self, BodyRetryError::PolicyRejected(_))
    }
}

impl From<PolicyRejection> for BodyRetryError {
    fn from(rejection: PolicyRejection) -> Self {
        BodyRetryError::PolicyRejected(rejection)
    }
}
