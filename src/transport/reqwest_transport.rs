//! `reqwest`-backed transport.
//!
//! Maps a [`RequestDescriptor`] onto a `reqwest` request and exposes the
//! response body as a [`ByteStream`].
//!
//! # Payload mapping
//!
//! | Payload | Wire body |
//! |---------|-----------|
//! | `Empty` | none |
//! | `Text`, `Bytes` | raw |
//! | `Form` | `application/x-www-form-urlencoded` |
//! | `Blob` | raw, with its content type |
//! | `Multipart` | `multipart/form-data` |
//! | `Stream` | streamed once; later attempts fail to dispatch |
//!
//! # Examples
//!
//! ```ignore
//! use body_retry::{BodyRetry, BodyRetryConfig, ReqwestTransport};
//!
//! let stage = BodyRetry::new(
//!     ReqwestTransport::new(),
//!     BodyRetryConfig::default().with_retry_budget(2),
//! );
//! ```

use super::Transport;
use crate::error::BoxError;
use crate::protocol::may_have_body;
use crate::types::{ByteStream, DispatchContext, Payload, RequestDescriptor, ResponseDescriptor};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use http::header::{HeaderValue, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::trace;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Transport that dispatches through a `reqwest::Client`.
///
/// Every attempt builds a fresh request from the [`RequestDescriptor`], so
/// retries resend the same method, URL, headers and payload. A `Stream`
/// payload can only be sent once; a second attempt fails to dispatch.
///
/// Responses to `HEAD`, and `204`, `304` and `1xx` responses, are reported
/// without a body.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport with a default client.
    ///
    /// # Examples
    ///
    /// ```
    /// use body_retry::ReqwestTransport;
    ///
    /// let transport = ReqwestTransport::new();
    /// ```
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Create a transport over an existing client.
    ///
    /// Use this to share a connection pool, or to set timeouts, proxies and
    /// TLS options on the client.
    ///
    /// # Arguments
    ///
    /// * `client` - The client every attempt is sent through
    ///
    /// # Examples
    ///
    /// ```
    /// use body_retry::ReqwestTransport;
    /// use std::time::Duration;
    ///
    /// let client = reqwest::Client::builder()
    ///     .connect_timeout(Duration::from_secs(5))
    ///     .build()
    ///     .unwrap();
    /// let transport = ReqwestTransport::with_client(client);
    /// ```
    pub fn with_client(client: reqwest::Client) -> Self {
        ReqwestTransport { client }
    }

    /// The underlying client
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn build(&self, request: &RequestDescriptor) -> Result<reqwest::RequestBuilder, BoxError> {
        let builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        let has_content_type = request.headers.contains_key(CONTENT_TYPE);
        let builder = match &request.payload {
            Payload::Empty => builder,
            Payload::Text(text) => builder.body(text.clone()),
            Payload::Bytes(bytes) => builder.body(bytes.clone()),
            Payload::Form(pairs) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs.iter())
                    .finish();
                let builder = if has_content_type {
                    builder
                } else {
                    builder.header(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE))
                };
                builder.body(encoded)
            }
            Payload::Blob { content_type, data } => {
                let builder = match content_type {
                    Some(content_type) if !has_content_type => {
                        builder.header(CONTENT_TYPE, HeaderValue::from_str(content_type)?)
                    }
                    _ => builder,
                };
                builder.body(data.clone())
            }
            Payload::Multipart(parts) => {
                let mut form = reqwest::multipart::Form::new();
                for part in parts {
                    let mut wire = reqwest::multipart::Part::bytes(part.data.to_vec());
                    if let Some(file_name) = &part.file_name {
                        wire = wire.file_name(file_name.clone());
                    }
                    if let Some(content_type) = &part.content_type {
                        wire = wire.mime_str(content_type)?;
                    }
                    form = form.part(part.name.clone(), wire);
                }
                builder.multipart(form)
            }
            Payload::Stream(single) => {
                let stream = single
                    .take()
                    .ok_or("stream payload was already consumed by an earlier attempt")?;
                builder.body(stream_body(stream))
            }
        };

        Ok(builder)
    }
}

/// `reqwest::Body::wrap_stream` wants a `Sync` stream; pump through a channel.
fn stream_body(mut stream: ByteStream) -> reqwest::Body {
    let (tx, rx) = mpsc::channel::<Result<bytes::Bytes, BoxError>>(8);
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(ReceiverStream::new(rx))
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn attempt(
        &self,
        request: &RequestDescriptor,
        ctx: &DispatchContext,
    ) -> Result<ResponseDescriptor, BoxError> {
        trace!(
            request_id = %ctx.request_id,
            method = %request.method,
            url = %request.url,
            "dispatching request"
        );

        let response = self.build(request)?.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body: Option<ByteStream> = if may_have_body(&request.method, status) {
            Some(Box::pin(
                response
                    .bytes_stream()
                    .map_err(|e| Box::new(e) as BoxError),
            ))
        } else {
            None
        };

        Ok(ResponseDescriptor {
            ok: status.is_success(),
            status,
            headers,
            body,
        })
    }
}
