//! Output side of the retry stage.
//!
//! # Types
//!
//! - **RetryBody**: the long-lived output stream of a wrapped request. Its
//!   identity is stable across every attempt; the retry driver swaps sources
//!   behind it.
//! - **ResponseBody**: what the stage hands to its caller. Either a
//!   `RetryBody`, or the transport's own stream when wrapping was skipped.
//!
//! Both yield `Result<Bytes, BodyRetryError>`, so consumers handle one item
//! type regardless of whether retries were possible.
//!
//! # Closing early
//!
//! Calling [`RetryBody::close`] or dropping the body cancels the request:
//! the driver releases the current source and stops, whatever it was doing.
//!
//! ```ignore
//! let mut body = response.body.unwrap();
//! while let Some(chunk) = body.next().await {
//!     let chunk = chunk?;
//!     if enough(&chunk) {
//!         break; // dropping `body` tears down the in-flight attempt
//!     }
//! }
//! ```

use crate::error::{BodyRetryError, Result, StreamError};
use crate::types::ByteStream;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

/// The output stream of a wrapped request.
///
/// Yields the bytes of exactly one successful attempt, or a single terminal
/// error. Never yields bytes from an attempt that later failed while still
/// buffering.
///
/// While an attempt is buffering, nothing is yielded: the first chunk shows
/// up once that attempt ends cleanly. After the byte ceiling trips, chunks
/// are yielded as they arrive.
///
/// The body implements [`Stream`]; [`next`](Self::next) is a shorthand that
/// does not need `StreamExt` in scope.
///
/// # Examples
///
/// ```ignore
/// while let Some(chunk) = body.next().await {
///     match chunk {
///         Ok(bytes) => sink.write_all(&bytes).await?,
///         Err(BodyRetryError::RetryBudgetExhausted { attempts, source }) => {
///             eprintln!("gave up after {} attempts: {}", attempts, source);
///             break;
///         }
///         Err(e) => return Err(e.into()),
///     }
/// }
/// ```
pub struct RetryBody {
    receiver: ReceiverStream<Result<Bytes>>,
    closed: bool,
    driver: Option<JoinHandle<()>>,
}

impl RetryBody {
    pub(crate) fn new(receiver: mpsc::Receiver<Result<Bytes>>, driver: JoinHandle<()>) -> Self {
        RetryBody {
            receiver: ReceiverStream::new(receiver),
            closed: false,
            driver: Some(driver),
        }
    }

    /// Receive the next chunk.
    ///
    /// Returns `None` after a clean end, after an error was delivered, or
    /// after [`close`](Self::close).
    pub async fn next(&mut self) -> Option<Result<Bytes>> {
        StreamExt::next(self).await
    }

    /// Close the output from the consumer side.
    ///
    /// The retry driver observes the close at its next suspension point and
    /// releases the current source. Chunks already queued are discarded.
    pub fn close(&mut self) {
        self.receiver.close();
        self.closed = true;
    }

    /// Check if the consumer closed the output
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read the whole body into one buffer.
    ///
    /// # Returns
    ///
    /// The concatenated bytes of the successful attempt.
    ///
    /// # Errors
    ///
    /// The terminal error of the body, if it ended with one. Bytes already
    /// read are discarded.
    pub async fn collect_bytes(mut self) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.next().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(collected.freeze())
    }

    /// Detach the driver task handle, so a caller can wait for the driver to
    /// finish after closing the body.
    pub(crate) fn take_driver(&mut self) -> Option<JoinHandle<()>> {
        self.driver.take()
    }
}

impl Stream for RetryBody {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl fmt::Debug for RetryBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryBody")
            .field("closed", &self.closed)
            .finish()
    }
}

/// Body handed to the caller of the stage.
pub enum ResponseBody {
    /// Protected by the retry driver
    Wrapped(RetryBody),
    /// The transport's stream, passed through untouched
    Unwrapped(ByteStream),
}

impl ResponseBody {
    /// Check if the body is protected by the retry driver.
    pub fn is_wrapped(&self) -> bool {
        matches!(self, ResponseBody::Wrapped(_))
    }

    /// Read the whole body into one buffer.
    pub async fn collect_bytes(mut self) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.next().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(collected.freeze())
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            ResponseBody::Wrapped(body) => Pin::new(body).poll_next(cx),
            ResponseBody::Unwrapped(stream) => stream.as_mut().poll_next(cx).map(|item| {
                item.map(|chunk| {
                    chunk.map_err(|e| BodyRetryError::Stream(StreamError::normalize(e)))
                })
            }),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Wrapped(body) => f.debug_tuple("Wrapped").field(body).finish(),
            ResponseBody::Unwrapped(_) => f.write_str("Unwrapped"),
        }
    }
}
