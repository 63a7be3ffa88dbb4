//! The body-retry pipeline stage.
//!
//! [`BodyRetry`] sits in front of a [`Transport`]. For each logical request it:
//!
//! 1. passes the request straight through if an enclosing stage already
//!    wraps it (`DispatchContext::body_retry_active`)
//! 2. runs the [`PolicyGate`]; a rejection returns before any dispatch
//! 3. dispatches the first attempt
//! 4. returns unsuccessful or bodiless responses unchanged
//! 5. skips wrapping when `Content-Length` already exceeds the byte ceiling
//! 6. otherwise hands the body to a retry driver and returns immediately
//!    with a [`ResponseBody::Wrapped`] output
//!
//! # Examples
//!
//! ```ignore
//! use body_retry::{BodyRetry, BodyRetryConfig, DispatchContext, ReqwestTransport, RequestDescriptor};
//!
//! let stage = BodyRetry::new(
//!     ReqwestTransport::new(),
//!     BodyRetryConfig::default().with_retry_budget(2),
//! );
//! let request = RequestDescriptor::get("http://example.com/data".parse()?);
//! let response = stage.execute(request, DispatchContext::default()).await?;
//! let bytes = response.body.unwrap().collect_bytes().await?;
//! ```

use super::body::ResponseBody;
use super::config::BodyRetryConfig;
use super::log::{RetryLog, TracingLog};
use super::policy::PolicyGate;
use super::scheduler::{RetryScheduler, TokioScheduler};
use super::supervisor::{Collaborators, FirstAttempt, RetrySupervisor};
use crate::error::{BodyRetryError, Result, StreamError};
use crate::protocol::{exceeds_ceiling, expected_body_length};
use crate::transport::Transport;
use crate::types::{DispatchContext, RequestDescriptor, ResponseDescriptor};
use http::{HeaderMap, StatusCode};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Response returned by the stage.
#[derive(Debug)]
pub struct RetryResponse {
    /// Whether the first attempt was successful
    pub ok: bool,
    /// Status of the first attempt
    pub status: StatusCode,
    /// Headers of the first attempt
    pub headers: HeaderMap,
    /// Body, wrapped or passed through
    pub body: Option<ResponseBody>,
}

impl RetryResponse {
    fn unwrapped(response: ResponseDescriptor) -> Self {
        RetryResponse {
            ok: response.ok,
            status: response.status,
            headers: response.headers,
            body: response.body.map(ResponseBody::Unwrapped),
        }
    }

    /// Check if the body is protected by the retry driver.
    pub fn is_wrapped(&self) -> bool {
        self.body.as_ref().is_some_and(ResponseBody::is_wrapped)
    }
}

/// Body-retry stage over a transport.
///
/// One `BodyRetry` serves any number of requests; each call to
/// [`execute`](Self::execute) reads the configuration once and runs its own
/// retry driver. Cloning is cheap: the transport, scheduler and logger are
/// shared behind `Arc`s.
///
/// # Examples
///
/// ```
/// use body_retry::{BodyRetry, BodyRetryConfig, ReqwestTransport};
///
/// let stage = BodyRetry::new(
///     ReqwestTransport::new(),
///     BodyRetryConfig::default().with_retry_budget(3),
/// );
/// assert_eq!(stage.config().retry_budget, 3);
/// ```
#[derive(Clone)]
pub struct BodyRetry {
    config: BodyRetryConfig,
    collaborators: Collaborators,
}

impl BodyRetry {
    /// Create a stage with the tokio scheduler and tracing logger.
    ///
    /// # Arguments
    ///
    /// * `transport` - Dispatches every attempt, the first one included
    /// * `config` - Retry budget, delay, unsafe-retry switch and byte ceiling
    pub fn new(transport: impl Transport + 'static, config: BodyRetryConfig) -> Self {
        BodyRetry {
            config,
            collaborators: Collaborators {
                transport: Arc::new(transport),
                scheduler: Arc::new(TokioScheduler),
                log: Arc::new(TracingLog),
            },
        }
    }

    /// Replace the inter-attempt scheduler.
    ///
    /// The scheduler is only consulted for non-zero delays.
    pub fn with_scheduler(mut self, scheduler: impl RetryScheduler + 'static) -> Self {
        self.collaborators.scheduler = Arc::new(scheduler);
        self
    }

    /// Replace the structured logger
    pub fn with_log(mut self, log: impl RetryLog + 'static) -> Self {
        self.collaborators.log = Arc::new(log);
        self
    }

    /// The configuration in force
    pub fn config(&self) -> &BodyRetryConfig {
        &self.config
    }

    /// Execute one logical request.
    ///
    /// Returns as soon as the first attempt's headers are available. When the
    /// body is wrapped, a driver task keeps reading, buffering and retrying
    /// behind the returned [`ResponseBody::Wrapped`].
    ///
    /// # Arguments
    ///
    /// * `request` - Reproduced verbatim on every attempt
    /// * `ctx` - Abort signals and request id; a context that already carries
    ///   the body-retry marker is dispatched once and passed through
    ///
    /// # Returns
    ///
    /// The first attempt's status and headers, with the body:
    ///
    /// - unwrapped if the response is unsuccessful, or its declared length
    ///   is above the byte ceiling
    /// - absent if the transport returned no body
    /// - wrapped otherwise
    ///
    /// # Errors
    ///
    /// - [`BodyRetryError::PolicyRejected`] if the gate refuses the request;
    ///   the transport is not called.
    /// - [`BodyRetryError::Dispatch`] if the first dispatch fails.
    ///
    /// Failures of the body itself are reported through the returned body.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let response = stage.execute(request, DispatchContext::default()).await?;
    /// if let Some(body) = response.body {
    ///     let bytes = body.collect_bytes().await?;
    /// }
    /// ```
    pub async fn execute(
        &self,
        request: RequestDescriptor,
        ctx: DispatchContext,
    ) -> Result<RetryResponse> {
        if ctx.body_retry_active {
            debug!(url = %request.url, "body retry already active, passing through");
            let response = self.dispatch(&request, &ctx).await?;
            return Ok(RetryResponse::unwrapped(response));
        }

        let policy = PolicyGate::check(&request, &self.config)?;
        let inner_ctx = ctx.wrapped();
        let response = self.dispatch(&request, &inner_ctx).await?;

        let ResponseDescriptor {
            ok,
            status,
            headers,
            body,
        } = response;
        let body = match body {
            Some(body) if ok => body,
            body => {
                return Ok(RetryResponse {
                    ok,
                    status,
                    headers,
                    body: body.map(ResponseBody::Unwrapped),
                });
            }
        };

        let declared_length = expected_body_length(&request.method, status, &headers);
        if exceeds_ceiling(declared_length, policy.max_buffered_bytes_per_attempt) {
            debug!(
                url = %request.url,
                "declared length exceeds byte ceiling, not wrapping body"
            );
            return Ok(RetryResponse {
                ok,
                status,
                headers,
                body: Some(ResponseBody::Unwrapped(body)),
            });
        }

        let first = FirstAttempt {
            body,
            declared_length,
        };
        let output = RetrySupervisor::spawn(
            policy,
            request,
            inner_ctx,
            first,
            self.collaborators.clone(),
        );

        Ok(RetryResponse {
            ok,
            status,
            headers,
            body: Some(ResponseBody::Wrapped(output)),
        })
    }

    async fn dispatch(
        &self,
        request: &RequestDescriptor,
        ctx: &DispatchContext,
    ) -> Result<ResponseDescriptor> {
        self.collaborators
            .transport
            .attempt(request, ctx)
            .await
            .map_err(|e| BodyRetryError::Dispatch(StreamError::normalize(e)))
    }
}

impl fmt::Debug for BodyRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyRetry")
            .field("config", &self.config)
            .finish()
    }
}
