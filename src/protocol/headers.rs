//! Response header parsing.
//!
//! The stage only cares about one header: `Content-Length`. It is used twice:
//! as a fast-path check against the per-attempt byte ceiling before any
//! buffering starts, and to recognize a source that ends before delivering
//! the bytes it declared.
//!
//! Malformed values are ignored rather than rejected; the header is advisory.
//! A response that cannot carry a body (`HEAD`, `204`, `304`, `1xx`) still
//! reports the length of the representation it describes, so its header is
//! never read as a promise of body bytes.

use http::header::CONTENT_LENGTH;
use http::{HeaderMap, Method, StatusCode};

/// Parse a `Content-Length` value.
///
/// Surrounding whitespace is allowed. Anything other than a plain decimal
/// integer yields `None`.
///
/// # Examples
///
/// ```
/// use body_retry::protocol::parse_content_length;
///
/// assert_eq!(parse_content_length("1024"), Some(1024));
/// assert_eq!(parse_content_length("+5"), None);
/// assert_eq!(parse_content_length(""), None);
/// ```
pub fn parse_content_length(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse().ok()
}

/// Read the declared body length from response headers.
///
/// Returns `None` when the header is missing, not valid UTF-8, or not numeric.
pub fn declared_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_content_length)
}

/// Check whether a response to `method` with `status` can carry a body.
///
/// # Examples
///
/// ```
/// use body_retry::protocol::may_have_body;
/// use http::{Method, StatusCode};
///
/// assert!(may_have_body(&Method::GET, StatusCode::OK));
/// assert!(!may_have_body(&Method::HEAD, StatusCode::OK));
/// assert!(!may_have_body(&Method::GET, StatusCode::NOT_MODIFIED));
/// ```
pub fn may_have_body(method: &Method, status: StatusCode) -> bool {
    *method != Method::HEAD
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
        && !status.is_informational()
}

/// Number of body bytes a response promises.
///
/// `None` for responses that cannot carry a body, whatever their
/// `Content-Length` says, and for missing or malformed headers.
pub fn expected_body_length(method: &Method, status: StatusCode, headers: &HeaderMap) -> Option<u64> {
    if may_have_body(method, status) {
        declared_content_length(headers)
    } else {
        None
    }
}

/// Check whether an expected body length is above the byte ceiling.
///
/// Without a ceiling, or without a known length, the answer is `false`.
pub fn exceeds_ceiling(expected: Option<u64>, ceiling: Option<u64>) -> bool {
    match (expected, ceiling) {
        (Some(declared), Some(limit)) => declared > limit,
        _ => false,
    }
}
