//! Transport boundary.
//!
//! A [`Transport`] executes one attempt of a request and describes the
//! response. The retry stage calls it once up front and again for every
//! retry, passing the original [`RequestDescriptor`] each time.
//!
//! Returning `Err` means the dispatch itself failed to complete. The stage
//! treats that as terminal and never retries it. An unsuccessful status is
//! not an error at this boundary: return `Ok` with `ok: false`.
//!
//! # Implementations
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ReqwestTransport`] | Dispatches over a `reqwest::Client` |

mod reqwest_transport;

pub use reqwest_transport::ReqwestTransport;

use crate::error::BoxError;
use crate::types::{DispatchContext, RequestDescriptor, ResponseDescriptor};
use async_trait::async_trait;
use std::sync::Arc;

/// Executes one attempt of a request.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dispatch `request` and describe the response.
    ///
    /// `ctx.body_retry_active` is set when the call comes from a body-retry
    /// stage; a nested stage must not wrap the body a second time.
    async fn attempt(
        &self,
        request: &RequestDescriptor,
        ctx: &DispatchContext,
    ) -> Result<ResponseDescriptor, BoxError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn attempt(
        &self,
        request: &RequestDescriptor,
        ctx: &DispatchContext,
    ) -> Result<ResponseDescriptor, BoxError> {
        (**self).attempt(request, ctx).await
    }
}
