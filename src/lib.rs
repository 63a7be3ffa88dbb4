#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! # Body retry for streamed HTTP responses
//!
//! This crate implements a resilience stage that sits in front of an HTTP
//! transport and protects the *body* of a response, not just its status line.
//!
//! ## Overview
//!
//! For each logical request the stage:
//!
//! 1. **Gates** the request: retries need a positive budget, an idempotent
//!    method (unless explicitly allowed) and a replayable payload
//! 2. **Dispatches** the first attempt and returns as soon as headers arrive
//! 3. **Buffers** the body of the current attempt until it ends cleanly
//! 4. **Retries** the whole request when the body fails mid-stream, throwing
//!    away whatever was buffered
//! 5. **Streams through** once an attempt exceeds the byte ceiling; failures
//!    after that point are terminal
//!
//! A consumer closing the body at any point cancels the in-flight attempt.
//!
//! ## Key Features
//!
//! - **No mixed bytes**: the output carries the bytes of exactly one attempt
//! - **Abort aware**: a failure while the request or its context is aborted is
//!   never retried
//! - **Substitutable delay and logging**: [`RetryScheduler`] and [`RetryLog`]
//! - **Re-entrancy guard**: a nested stage passes an already wrapped request
//!   through untouched
//! - **`reqwest` transport**: [`ReqwestTransport`] out of the box
//!
//! ## Usage
//!
//! ```ignore
//! use body_retry::{BodyRetry, BodyRetryConfig, DispatchContext, ReqwestTransport, RequestDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stage = BodyRetry::new(
//!         ReqwestTransport::new(),
//!         BodyRetryConfig::default()
//!             .with_retry_budget(2)
//!             .with_retry_delay_ms(250)
//!             .with_max_buffered_bytes_per_attempt(8 * 1024 * 1024),
//!     );
//!
//!     let request = RequestDescriptor::get("http://localhost:8080/report".parse()?);
//!     let response = stage.execute(request, DispatchContext::default()).await?;
//!
//!     if let Some(body) = response.body {
//!         let bytes = body.collect_bytes().await?;
//!         println!("{} bytes", bytes.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Cancellation
//!
//! ```ignore
//! use body_retry::{AbortContext, DispatchContext};
//! use tokio_util::sync::CancellationToken;
//!
//! let signal = CancellationToken::new();
//! let ctx = DispatchContext::new(AbortContext::none().with_request_signal(signal.clone()));
//! // signal.cancel() makes the next body failure terminal
//! ```
//!
//! ## Module Structure
//!
//! - **[types]** - Request, response, payload and context types
//! - **[error]** - Error types and result handling
//! - **[retry]** - The stage, its state machine and retry driver
//! - **[transport]** - Transport boundary and the `reqwest` implementation
//! - **[protocol]** - Method idempotency and `Content-Length` handling
//! - **[logging]** - Tracing subscriber setup

pub mod error;
pub mod logging;
pub mod protocol;
pub mod retry;
pub mod transport;
pub mod types;

pub use error::{BodyRetryError, BoxError, PolicyRejection, Result, StreamError};
pub use retry::{
    BodyRetry, BodyRetryConfig, Directive, LogDetail, Phase, PolicyGate, ResponseBody,
    RetryBody, RetryLog, RetryMachine, RetryPolicy, RetryResponse, RetryScheduler,
    TokioScheduler, TracingLog,
};
pub use transport::{ReqwestTransport, Transport};
pub use types::{
    AbortContext, ByteStream, DispatchContext, MultipartPart, Payload, RequestDescriptor,
    ResponseDescriptor, SinglePassStream,
};

#[cfg(test)]
mod tests;
