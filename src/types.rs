//! Core request and response types shared by the stage and transports.
//!
//! # Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`RequestDescriptor`] | The logical request, replayed verbatim on each attempt |
//! | [`Payload`] | Declared request body, replayable or single-pass |
//! | [`ResponseDescriptor`] | What a transport returns for one attempt |
//! | [`AbortContext`] | Abort signals consulted at failure time |
//! | [`DispatchContext`] | Per-call context handed to the transport |

use crate::error::BoxError;
use bytes::Bytes;
use futures::stream::BoxStream;
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

/// A response or request body as a stream of byte chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, BoxError>>;

/// A single-read stream payload.
///
/// Clones share the same underlying stream, which can be taken at most once.
/// This is what makes stream payloads non-replayable.
#[derive(Clone)]
pub struct SinglePassStream {
    inner: Arc<Mutex<Option<ByteStream>>>,
}

impl SinglePassStream {
    /// Wrap a stream.
    pub fn new(stream: ByteStream) -> Self {
        SinglePassStream {
            inner: Arc::new(Mutex::new(Some(stream))),
        }
    }

    /// Take the stream. Returns `None` once any clone has taken it.
    pub fn take(&self) -> Option<ByteStream> {
        self.inner.lock().take()
    }

    /// Check if the stream has already been consumed.
    pub fn is_consumed(&self) -> bool {
        self.inner.lock().is_none()
    }
}

impl fmt::Debug for SinglePassStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinglePassStream")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// One part of a multipart form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    /// Field name
    pub name: String,
    /// Optional file name
    pub file_name: Option<String>,
    /// Optional content type
    pub content_type: Option<String>,
    /// Part contents
    pub data: Bytes,
}

impl MultipartPart {
    /// Create a plain text field.
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        MultipartPart {
            name: name.into(),
            file_name: None,
            content_type: None,
            data: Bytes::from(value.into()),
        }
    }
}

/// Declared request payload.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    /// No body
    #[default]
    Empty,
    /// A string body
    Text(String),
    /// Key/value form pairs (url-encoded on the wire)
    Form(Vec<(String, String)>),
    /// A binary buffer
    Bytes(Bytes),
    /// A blob-like value with an optional content type
    Blob {
        /// Content type of the blob
        content_type: Option<String>,
        /// Blob contents
        data: Bytes,
    },
    /// Multipart form data
    Multipart(Vec<MultipartPart>),
    /// A single-read stream
    Stream(SinglePassStream),
}

impl Payload {
    /// Check if the payload can be resent unchanged.
    ///
    /// Every form except [`Payload::Stream`] is replayable.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Payload::Stream(_))
    }
}

/// The logical request, reproduced verbatim on every attempt.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// HTTP method
    pub method: Method,
    /// Target location
    pub url: Url,
    /// Request headers
    pub headers: HeaderMap,
    /// Declared payload
    pub payload: Payload,
}

impl RequestDescriptor {
    /// Create a request with no headers and no payload.
    pub fn new(method: Method, url: Url) -> Self {
        RequestDescriptor {
            method,
            url,
            headers: HeaderMap::new(),
            payload: Payload::Empty,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Set the headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// What a transport returns for one attempt.
pub struct ResponseDescriptor {
    /// Whether the transport considers the response successful
    pub ok: bool,
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body, absent for bodiless responses
    pub body: Option<ByteStream>,
}

impl ResponseDescriptor {
    /// A successful response with the given body.
    pub fn ok(body: ByteStream) -> Self {
        ResponseDescriptor {
            ok: true,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Some(body),
        }
    }

    /// A response with the given status and no body.
    ///
    /// `ok` follows `status.is_success()`.
    pub fn status(status: StatusCode) -> Self {
        ResponseDescriptor {
            ok: status.is_success(),
            status,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Set the headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: ByteStream) -> Self {
        self.body = Some(body);
        self
    }
}

impl fmt::Debug for ResponseDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseDescriptor")
            .field("ok", &self.ok)
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Abort signals for one logical request.
///
/// Read-only from the stage's point of view: the signals are consulted when
/// an attempt fails and are never triggered by the stage itself.
#[derive(Debug, Clone, Default)]
pub struct AbortContext {
    /// Signal attached to the request itself
    pub request_signal: Option<CancellationToken>,
    /// Signal attached to the surrounding context
    pub context_signal: Option<CancellationToken>,
}

impl AbortContext {
    /// Context with no signals.
    pub fn none() -> Self {
        Self::default()
    }

    /// Set the request signal
    pub fn with_request_signal(mut self, signal: CancellationToken) -> Self {
        self.request_signal = Some(signal);
        self
    }

    /// Set the context signal
    pub fn with_context_signal(mut self, signal: CancellationToken) -> Self {
        self.context_signal = Some(signal);
        self
    }

    /// Check if either signal is active.
    pub fn is_aborted(&self) -> bool {
        self.request_signal
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
            || self
                .context_signal
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
    }
}

/// Context handed to the transport on each attempt.
///
/// `body_retry_active` marks calls issued by a body-retry stage. A stage that
/// receives a context with the flag already set dispatches once and does not
/// wrap the body again.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Abort signals
    pub abort: AbortContext,
    /// Set when an enclosing body-retry stage already wraps this request
    pub body_retry_active: bool,
    /// Identifier of the logical request, used in logs
    pub request_id: Uuid,
}

impl DispatchContext {
    /// A fresh context for a new logical request.
    pub fn new(abort: AbortContext) -> Self {
        DispatchContext {
            abort,
            body_retry_active: false,
            request_id: Uuid::new_v4(),
        }
    }

    /// The context a body-retry stage passes down to its transport.
    pub fn wrapped(&self) -> Self {
        DispatchContext {
            abort: self.abort.clone(),
            body_retry_active: true,
            request_id: self.request_id,
        }
    }
}

impl Default for DispatchContext {
    fn default() -> Self {
        Self::new(AbortContext::none())
    }
}
