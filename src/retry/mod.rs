//! Body retry: buffering, retrying and pass-through streaming.
//!
//! This module holds the resilience stage itself:
//!
//! - **Gate** a request before the first dispatch
//! - **Buffer** each attempt's body until it ends cleanly
//! - **Retry** the request when a body breaks, discarding partial data
//! - **Stream through** once an attempt outgrows the byte ceiling
//!
//! # Module Organization
//!
//! ```text
//! retry/
//! ├── config     - BodyRetryConfig
//! ├── policy     - PolicyGate and RetryPolicy
//! ├── machine    - Sans-IO state machine (overflow accounting included)
//! ├── supervisor - Async driver owning the current attempt
//! ├── scheduler  - Inter-attempt delay
//! ├── log        - Structured logging boundary
//! ├── body       - Output stream types
//! └── stage      - BodyRetry entry point
//! ```
//!
//! # Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`BodyRetry`] | The pipeline stage |
//! | [`BodyRetryConfig`] | Configuration, consumed once per request |
//! | [`PolicyGate`] | Pre-flight check |
//! | [`RetryMachine`] | Pure state machine |
//! | [`RetryBody`] | Output stream of a wrapped request |
//! | [`RetryScheduler`] | Substitutable delay |
//! | [`RetryLog`] | Substitutable structured logger |
//!
//! # Examples
//!
//! ## Driving the state machine by hand
//!
//! ```
//! use body_retry::retry::{Directive, RetryMachine, RetryPolicy};
//! use body_retry::{BodyRetryConfig, StreamError};
//! use bytes::Bytes;
//!
//! let policy = RetryPolicy::from_config(&BodyRetryConfig::default().with_retry_budget(1));
//! let mut machine = RetryMachine::new(policy);
//!
//! machine.on_chunk(Bytes::from_static(b"abc"));
//! assert!(matches!(
//!     machine.on_failure(StreamError::new("connection reset"), false),
//!     Directive::Retry { next_attempt: 2, .. }
//! ));
//! assert!(machine.begin_attempt());
//! assert_eq!(machine.buffered_bytes(), 0);
//! ```

mod body;
mod config;
mod log;
mod machine;
mod policy;
mod scheduler;
mod stage;
mod supervisor;

pub use body::{ResponseBody, RetryBody};
pub use config::BodyRetryConfig;
pub use log::{LogDetail, RetryLog, TracingLog, EVENT_OVERFLOW, EVENT_RETRY};
pub use machine::{Directive, Phase, RetryMachine};
pub use policy::{PolicyGate, RetryPolicy};
pub use scheduler::{RetryScheduler, TokioScheduler};
pub use stage::{BodyRetry, RetryResponse};
