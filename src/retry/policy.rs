//! Pre-flight policy gate.
//!
//! Decides from request metadata and configuration whether body retries are
//! permitted at all. The checks run in a fixed order and the first failure
//! wins:
//!
//! 1. the retry budget is positive
//! 2. the method is idempotent, or unsafe retries are allowed
//! 3. the payload is replayable, or unsafe retries are allowed
//!
//! The gate has no side effects. On success it resolves the immutable
//! [`RetryPolicy`] used for the whole logical request.

use super::config::BodyRetryConfig;
use crate::error::PolicyRejection;
use crate::protocol::is_idempotent;
use crate::types::RequestDescriptor;
use std::time::Duration;

/// Resolved, immutable retry policy for one logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first
    pub max_attempts: u32,
    /// Delay before each retry
    pub inter_attempt_delay: Duration,
    /// Per-attempt buffering ceiling
    pub max_buffered_bytes_per_attempt: Option<u64>,
    /// Whether unsafe retries were allowed
    pub allow_unsafe_retry: bool,
}

impl RetryPolicy {
    /// Build a policy straight from a configuration, without gating.
    ///
    /// `max_attempts` is the retry budget plus the first attempt, never less
    /// than one.
    pub fn from_config(config: &BodyRetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.retry_budget.saturating_add(1),
            inter_attempt_delay: config.retry_delay(),
            max_buffered_bytes_per_attempt: config.max_buffered_bytes_per_attempt,
            allow_unsafe_retry: config.allow_unsafe_retry,
        }
    }
}

/// The pre-flight gate.
pub struct PolicyGate;

impl PolicyGate {
    /// Check whether body retries are permitted for `request`.
    ///
    /// # Examples
    ///
    /// ```
    /// use body_retry::{BodyRetryConfig, PolicyGate, PolicyRejection, RequestDescriptor};
    /// use http::Method;
    ///
    /// let url = url::Url::parse("http://example.com/data").unwrap();
    /// let config = BodyRetryConfig::default().with_retry_budget(1);
    ///
    /// let policy = PolicyGate::check(&RequestDescriptor::get(url.clone()), &config).unwrap();
    /// assert_eq!(policy.max_attempts, 2);
    ///
    /// let post = RequestDescriptor::new(Method::POST, url);
    /// assert_eq!(PolicyGate::check(&post, &config), Err(PolicyRejection::UnsafeMethod));
    /// ```
    pub fn check(
        request: &RequestDescriptor,
        config: &BodyRetryConfig,
    ) -> Result<RetryPolicy, PolicyRejection> {
        if config.retry_budget == 0 {
            return Err(PolicyRejection::NonPositiveBudget);
        }

        if !is_idempotent(&request.method) && !config.allow_unsafe_retry {
            return Err(PolicyRejection::UnsafeMethod);
        }

        if !request.payload.is_replayable() && !config.allow_unsafe_retry {
            return Err(PolicyRejection::NonReplayablePayload);
        }

        Ok(RetryPolicy::from_config(config))
    }
}
