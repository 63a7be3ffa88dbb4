//! Body-retry state machine.
//!
//! Pure, synchronous core of the retry supervisor. It performs no I/O: the
//! async driver feeds it one event at a time and carries out the returned
//! [`Directive`]. Every event kind has exactly one entry point.
//!
//! # Phases
//!
//! ```text
//!              chunk                          clean end
//!   Buffering ───────► Buffering ─────────────────────────► Completed
//!       │  │                                 (flush buffer)
//!       │  └─ buffered > ceiling ─► Streaming ─ end ─► Completed
//!       │                              └─ failure ─► Failed (never retried)
//!       │
//!       └─ failure ─┬─ eligible ─► Retrying ─ begin_attempt ─► Buffering
//!                   └─ aborted / budget spent ─► Failed
//!
//!   any phase ─ cancel ─► Cancelled
//! ```
//!
//! # Overflow accounting
//!
//! Bytes are counted per attempt. The ceiling test is strictly "greater
//! than". Once tripped, overflow is sticky for the rest of the request and
//! retrying is permanently unavailable.

use super::policy::RetryPolicy;
use crate::error::{BodyRetryError, StreamError};
use bytes::Bytes;

/// Phase of the retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accumulating the current attempt's bytes
    Buffering,
    /// Ceiling exceeded; bytes are forwarded as they arrive
    Streaming,
    /// A failed attempt is being replaced
    Retrying,
    /// Output ended cleanly
    Completed,
    /// Output ended with an error
    Failed,
    /// Consumer closed the output
    Cancelled,
}

impl Phase {
    /// Check if the output is closed in this phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }
}

/// What the driver must do after an event.
#[derive(Debug)]
pub enum Directive {
    /// Nothing to do
    Nothing,
    /// Forward these chunks, in order
    Forward(Vec<Bytes>),
    /// Forward these chunks, in order, then end the output
    Finish(Vec<Bytes>),
    /// Release the source and error the output
    Fail(BodyRetryError),
    /// Release the source and start another attempt
    Retry {
        /// Ordinal of the attempt about to be made
        next_attempt: u32,
        /// Failure that triggered the retry
        cause: StreamError,
    },
}

/// The body-retry state machine for one logical request.
#[derive(Debug)]
pub struct RetryMachine {
    /// Resolved policy
    policy: RetryPolicy,
    /// Current phase
    phase: Phase,
    /// 1-based ordinal of the current attempt
    attempt: u32,
    /// Chunks buffered for the current attempt
    chunks: Vec<Bytes>,
    /// Bytes buffered for the current attempt
    buffered_bytes: u64,
    /// Bytes received from the current attempt's source, buffered or not
    received_bytes: u64,
    /// Sticky overflow flag
    overflowed: bool,
    /// Guard against a second failure signal for the same attempt
    retry_in_progress: bool,
}

impl RetryMachine {
    /// Create a machine positioned at the first attempt.
    pub fn new(policy: RetryPolicy) -> Self {
        RetryMachine {
            policy,
            phase: Phase::Buffering,
            attempt: 1,
            chunks: Vec::new(),
            buffered_bytes: 0,
            received_bytes: 0,
            overflowed: false,
            retry_in_progress: false,
        }
    }

    /// A chunk arrived from the current source.
    pub fn on_chunk(&mut self, chunk: Bytes) -> Directive {
        let len = chunk.len() as u64;
        match self.phase {
            Phase::Streaming => {
                self.received_bytes = self.received_bytes.saturating_add(len);
                Directive::Forward(vec![chunk])
            }
            Phase::Buffering => {
                self.received_bytes = self.received_bytes.saturating_add(len);
                self.buffered_bytes = self.buffered_bytes.saturating_add(len);
                self.chunks.push(chunk);

                match self.policy.max_buffered_bytes_per_attempt {
                    Some(ceiling) if self.buffered_bytes > ceiling => {
                        self.overflowed = true;
                        self.phase = Phase::Streaming;
                        self.buffered_bytes = 0;
                        Directive::Forward(std::mem::take(&mut self.chunks))
                    }
                    _ => Directive::Nothing,
                }
            }
            _ => Directive::Nothing,
        }
    }

    /// The current source ended cleanly.
    pub fn on_end(&mut self) -> Directive {
        match self.phase {
            Phase::Buffering | Phase::Streaming => {
                self.phase = Phase::Completed;
                self.buffered_bytes = 0;
                Directive::Finish(std::mem::take(&mut self.chunks))
            }
            _ => Directive::Nothing,
        }
    }

    /// The current source failed or closed early.
    ///
    /// `aborted` is the state of the abort signals at the moment of failure.
    pub fn on_failure(&mut self, cause: StreamError, aborted: bool) -> Directive {
        if self.phase.is_terminal() || self.retry_in_progress {
            return Directive::Nothing;
        }

        self.discard_buffer();

        if self.overflowed {
            self.phase = Phase::Failed;
            return Directive::Fail(BodyRetryError::OverflowStream(cause));
        }

        if aborted {
            self.phase = Phase::Failed;
            return Directive::Fail(BodyRetryError::Aborted { source: cause });
        }

        if self.attempt >= self.policy.max_attempts {
            self.phase = Phase::Failed;
            return Directive::Fail(BodyRetryError::RetryBudgetExhausted {
                attempts: self.attempt,
                source: cause,
            });
        }

        self.retry_in_progress = true;
        self.phase = Phase::Retrying;
        Directive::Retry {
            next_attempt: self.attempt + 1,
            cause,
        }
    }

    /// Promote the next attempt after a retry produced a usable source.
    ///
    /// Returns `false`, changing nothing, unless a retry is in progress.
    pub fn begin_attempt(&mut self) -> bool {
        if self.phase != Phase::Retrying || self.overflowed {
            return false;
        }
        self.attempt += 1;
        self.discard_buffer();
        self.received_bytes = 0;
        self.retry_in_progress = false;
        self.phase = Phase::Buffering;
        true
    }

    /// End the output with an error raised outside the source.
    ///
    /// Returns `None` if the output is already closed.
    pub fn fail(&mut self, error: BodyRetryError) -> Option<BodyRetryError> {
        if self.phase.is_terminal() {
            return None;
        }
        self.discard_buffer();
        self.phase = Phase::Failed;
        Some(error)
    }

    /// The consumer closed the output.
    pub fn cancel(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        self.discard_buffer();
        self.phase = Phase::Cancelled;
    }

    fn discard_buffer(&mut self) {
        self.chunks.clear();
        self.buffered_bytes = 0;
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Ordinal of the current attempt
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Policy in force
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Bytes buffered for the current attempt
    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    /// Bytes received from the current attempt's source, kept after a
    /// failure until the next attempt begins
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Whether the byte ceiling has been exceeded
    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    /// Whether a retry decision is in flight
    pub fn is_retry_in_progress(&self) -> bool {
        self.retry_in_progress
    }
}
