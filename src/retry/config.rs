//! Body-retry configuration.
//!
//! Consumed once per logical request by the policy gate. Every field has a
//! default, so a partial JSON document is a valid configuration.
//!
//! # Examples
//!
//! ```
//! use body_retry::BodyRetryConfig;
//!
//! let config = BodyRetryConfig::from_json(r#"{ "retry_budget": 2 }"#).unwrap();
//! assert!(config.is_enabled());
//! assert_eq!(config.retry_delay_ms, 0);
//! assert_eq!(config.max_buffered_bytes_per_attempt, None);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the body-retry stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyRetryConfig {
    /// Additional attempts allowed beyond the first; 0 disables the stage
    pub retry_budget: u32,
    /// Delay between attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Retry non-idempotent methods and non-replayable payloads anyway
    pub allow_unsafe_retry: bool,
    /// Per-attempt buffering ceiling in bytes; `None` buffers without bound
    pub max_buffered_bytes_per_attempt: Option<u64>,
}

impl Default for BodyRetryConfig {
    fn default() -> Self {
        BodyRetryConfig {
            retry_budget: 0,
            retry_delay_ms: 0,
            allow_unsafe_retry: false,
            max_buffered_bytes_per_attempt: None,
        }
    }
}

impl BodyRetryConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Set the retry budget
    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    /// Set the inter-attempt delay in milliseconds
    pub fn with_retry_delay_ms(mut self, retry_delay_ms: u64) -> Self {
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    /// Allow retrying unsafe methods and payloads
    pub fn with_allow_unsafe_retry(mut self, allow: bool) -> Self {
        self.allow_unsafe_retry = allow;
        self
    }

    /// Set the per-attempt byte ceiling
    pub fn with_max_buffered_bytes_per_attempt(mut self, limit: u64) -> Self {
        self.max_buffered_bytes_per_attempt = Some(limit);
        self
    }

    /// Check if the stage would retry at all.
    pub fn is_enabled(&self) -> bool {
        self.retry_budget > 0
    }

    /// Inter-attempt delay as a `Duration`.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
