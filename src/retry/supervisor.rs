//! Async driver for the retry state machine.
//!
//! One `RetrySupervisor` runs per wrapped request, as a single spawned task.
//! It is the only owner of the current attempt's source, the state machine
//! and the output sender, so nothing here needs a lock.
//!
//! Each loop iteration waits for exactly one event:
//!
//! - the consumer closed the output (always checked first)
//! - the current source produced a chunk, ended, or failed
//!
//! A retry is one more iteration of the same loop with a new source in the
//! slot. The previous source is dropped before the next transport call.
//! Both suspension points of a retry, the delay and the transport call, race
//! against consumer close; a close wins and nothing more is written.

use super::body::RetryBody;
use super::log::{LogDetail, RetryLog, EVENT_OVERFLOW, EVENT_RETRY};
use super::machine::{Directive, RetryMachine};
use super::policy::RetryPolicy;
use super::scheduler::RetryScheduler;
use crate::error::{BodyRetryError, Result, StreamError};
use crate::protocol::expected_body_length;
use crate::transport::Transport;
use crate::types::{ByteStream, DispatchContext, RequestDescriptor};
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn, Instrument};

/// Chunks queued between the driver and a slow consumer.
pub(crate) const OUTPUT_CHANNEL_CAPACITY: usize = 16;

/// Collaborators shared by every attempt of a request.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) scheduler: Arc<dyn RetryScheduler>,
    pub(crate) log: Arc<dyn RetryLog>,
}

/// The first attempt's usable response.
pub(crate) struct FirstAttempt {
    pub(crate) body: ByteStream,
    pub(crate) declared_length: Option<u64>,
}

enum Event {
    Chunk(Bytes),
    End,
    Failure(StreamError),
    ConsumerClosed,
}

enum Flow {
    Continue,
    Stop,
}

/// Drives one wrapped request from its first attempt to a terminal state.
///
/// Created by [`spawn`](Self::spawn) and consumed by the task it starts.
pub(crate) struct RetrySupervisor {
    machine: RetryMachine,
    /// Current attempt's source; `None` once released
    source: Option<ByteStream>,
    /// Length the current source declared, if any
    declared_length: Option<u64>,
    request: RequestDescriptor,
    ctx: DispatchContext,
    collaborators: Collaborators,
    output: mpsc::Sender<Result<Bytes>>,
}

impl RetrySupervisor {
    /// Start driving `first` and return the output stream immediately.
    ///
    /// `ctx` is the context passed to every retry; it must already carry the
    /// body-retry marker.
    pub(crate) fn spawn(
        policy: RetryPolicy,
        request: RequestDescriptor,
        ctx: DispatchContext,
        first: FirstAttempt,
        collaborators: Collaborators,
    ) -> RetryBody {
        let (output, receiver) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let panic_output = output.clone();
        let span = tracing::debug_span!(
            "body_retry",
            request_id = %ctx.request_id,
            url = %request.url,
        );

        let supervisor = RetrySupervisor {
            machine: RetryMachine::new(policy),
            source: Some(first.body),
            declared_length: first.declared_length,
            request,
            ctx,
            collaborators,
            output,
        };

        let driver = tokio::spawn(
            async move {
                if let Err(panic) = AssertUnwindSafe(supervisor.run()).catch_unwind().await {
                    let message = panic_message(panic.as_ref());
                    warn!(%message, "body retry driver panicked");
                    let _ = panic_output
                        .send(Err(BodyRetryError::Internal(message)))
                        .await;
                }
            }
            .instrument(span),
        );

        RetryBody::new(receiver, driver)
    }

    async fn run(mut self) {
        loop {
            let event = match self.source.as_mut() {
                Some(source) => tokio::select! {
                    biased;
                    _ = self.output.closed() => Event::ConsumerClosed,
                    item = source.next() => match item {
                        Some(Ok(chunk)) => Event::Chunk(chunk),
                        Some(Err(e)) => Event::Failure(StreamError::normalize(e)),
                        None => Event::End,
                    },
                },
                None => return,
            };

            if let Flow::Stop = self.dispatch(event).await {
                return;
            }
        }
    }

    async fn dispatch(&mut self, event: Event) -> Flow {
        match event {
            Event::Chunk(chunk) => self.on_chunk(chunk).await,
            Event::End => self.on_end().await,
            Event::Failure(cause) => self.on_failure(cause).await,
            Event::ConsumerClosed => {
                self.cancel();
                Flow::Stop
            }
        }
    }

    async fn on_chunk(&mut self, chunk: Bytes) -> Flow {
        let was_overflowed = self.machine.is_overflowed();
        let directive = self.machine.on_chunk(chunk);

        if !was_overflowed && self.machine.is_overflowed() {
            let attempt = self.machine.attempt();
            debug!(attempt, "byte ceiling exceeded, streaming without retry");
            let logged = self
                .collaborators
                .log
                .log(EVENT_OVERFLOW, &|| self.detail(attempt, 0, None));
            if let Err(e) = logged {
                return self.terminate(BodyRetryError::Log(e)).await;
            }
        }

        self.apply(directive).await
    }

    async fn on_end(&mut self) -> Flow {
        if let Some(declared) = self.declared_length {
            let received = self.machine.received_bytes();
            if received < declared {
                let cause = StreamError::new(format!(
                    "body closed prematurely after {} of {} bytes",
                    received, declared
                ));
                return self.on_failure(cause).await;
            }
        }

        let directive = self.machine.on_end();
        self.apply(directive).await
    }

    async fn on_failure(&mut self, cause: StreamError) -> Flow {
        if self.output.is_closed() {
            trace!(error = %cause, "dropping failure after output closed");
            self.cancel();
            return Flow::Stop;
        }

        let aborted = self.ctx.abort.is_aborted();
        debug!(
            attempt = self.machine.attempt(),
            error = %cause,
            aborted,
            "body attempt failed"
        );
        let directive = self.machine.on_failure(cause, aborted);
        self.apply(directive).await
    }

    async fn apply(&mut self, directive: Directive) -> Flow {
        match directive {
            Directive::Nothing => Flow::Continue,
            Directive::Forward(chunks) => {
                if self.emit(chunks).await {
                    Flow::Continue
                } else {
                    self.cancel();
                    Flow::Stop
                }
            }
            Directive::Finish(chunks) => {
                if self.emit(chunks).await {
                    self.release_source();
                    trace!(attempt = self.machine.attempt(), "body completed");
                } else {
                    self.cancel();
                }
                Flow::Stop
            }
            Directive::Fail(error) => {
                self.release_source();
                debug!(%error, "body retry failed");
                let _ = self.output.send(Err(error)).await;
                Flow::Stop
            }
            Directive::Retry {
                next_attempt,
                cause,
            } => self.retry(next_attempt, cause).await,
        }
    }

    async fn retry(&mut self, next_attempt: u32, cause: StreamError) -> Flow {
        self.release_source();

        let delay = self.machine.policy().inter_attempt_delay;
        let failed_attempt = self.machine.attempt();
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let logged = self.collaborators.log.log(EVENT_RETRY, &|| {
            self.detail(failed_attempt, delay_ms, Some(&cause))
        });
        if let Err(e) = logged {
            return self.terminate(BodyRetryError::Log(e)).await;
        }

        if !delay.is_zero() {
            let closed = tokio::select! {
                biased;
                _ = self.output.closed() => true,
                _ = self.collaborators.scheduler.delay(delay) => false,
            };
            if closed {
                trace!("output closed during retry delay");
                self.cancel();
                return Flow::Stop;
            }
        }

        debug!(attempt = next_attempt, "retrying request");
        let outcome = tokio::select! {
            biased;
            _ = self.output.closed() => None,
            outcome = self.collaborators.transport.attempt(&self.request, &self.ctx) => Some(outcome),
        };

        let outcome = match outcome {
            Some(outcome) if !self.output.is_closed() => outcome,
            Some(Ok(orphan)) => {
                drop(orphan.body);
                trace!("released retry response arriving after output closed");
                self.cancel();
                return Flow::Stop;
            }
            _ => {
                trace!("output closed during retry dispatch");
                self.cancel();
                return Flow::Stop;
            }
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                return self
                    .terminate(BodyRetryError::Dispatch(StreamError::normalize(e)))
                    .await;
            }
        };

        let status = response.status;
        let declared_length =
            expected_body_length(&self.request.method, status, &response.headers);
        let body = match (response.ok, response.body) {
            (true, Some(body)) => body,
            (ok, body) => {
                drop(body);
                let reason = if ok {
                    "response has no body"
                } else {
                    "unsuccessful response"
                };
                let target = self.request.url.to_string();
                return self
                    .terminate(BodyRetryError::RetryFailed {
                        target,
                        status,
                        reason,
                    })
                    .await;
            }
        };

        if !self.machine.begin_attempt() {
            drop(body);
            return Flow::Stop;
        }
        self.source = Some(body);
        self.declared_length = declared_length;
        Flow::Continue
    }

    /// Forward chunks in order. Returns `false` if the consumer is gone.
    async fn emit(&mut self, chunks: Vec<Bytes>) -> bool {
        for chunk in chunks {
            if chunk.is_empty() {
                continue;
            }
            if self.output.send(Ok(chunk)).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Error the output with a failure raised outside the source.
    async fn terminate(&mut self, error: BodyRetryError) -> Flow {
        self.release_source();
        if let Some(error) = self.machine.fail(error) {
            debug!(%error, "body retry terminated");
            let _ = self.output.send(Err(error)).await;
        }
        Flow::Stop
    }

    fn cancel(&mut self) {
        self.machine.cancel();
        if self.source.take().is_some() {
            trace!("released source after consumer close");
        }
        self.declared_length = None;
    }

    fn release_source(&mut self) {
        self.source = None;
        self.declared_length = None;
    }

    fn detail(&self, attempt: u32, delay_ms: u64, error: Option<&StreamError>) -> LogDetail {
        LogDetail {
            request_id: self.ctx.request_id,
            url: self.request.url.to_string(),
            attempt,
            max_attempts: self.machine.policy().max_attempts,
            received_bytes: self.machine.received_bytes(),
            delay_ms,
            error: error.map(|e| e.message().to_string()),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "retry driver panicked".to_string()
    }
}
