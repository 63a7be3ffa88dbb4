//! HTTP protocol helpers used by the retry stage.
//!
//! Small, pure functions over `http` types: method classification and
//! response header parsing. Nothing here performs I/O.
//!
//! # Examples
//!
//! ```
//! use body_retry::protocol::{is_idempotent, parse_content_length};
//! use http::Method;
//!
//! assert!(is_idempotent(&Method::PUT));
//! assert!(!is_idempotent(&Method::POST));
//! assert_eq!(parse_content_length(" 42 "), Some(42));
//! assert_eq!(parse_content_length("forty-two"), None);
//! ```

pub mod headers;
pub mod methods;

pub use headers::{
    declared_content_length, exceeds_ceiling, expected_body_length, may_have_body,
    parse_content_length,
};
pub use methods::{is_idempotent, IDEMPOTENT_METHODS};
