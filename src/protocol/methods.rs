//! Method classification.

use http::Method;

/// Methods whose repeated execution has the same effect as a single execution.
pub const IDEMPOTENT_METHODS: [Method; 6] = [
    Method::GET,
    Method::HEAD,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
    Method::TRACE,
];

/// Check if a method is idempotent.
///
/// Extension methods are never idempotent.
#[inline]
pub fn is_idempotent(method: &Method) -> bool {
    IDEMPOTENT_METHODS.contains(method)
}
