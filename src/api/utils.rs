//! API utility functions
//!
//! Pure, stateless helpers for HTTP request processing, extracted from the
//! handlers for unit testing.

use http_body_util::{BodyExt, LengthLimitError, Limited};

use crate::api::error::ApiError;

/// Submission bodies must be `application/json`; a charset parameter is
/// fine, look-alike media types (`application/jsonp`, `text/json`) are not.
pub fn ensure_json_content_type(content_type: &str) -> Result<(), ApiError> {
    content_type
        .parse::<mime::Mime>()
        .ok()
        .filter(|media| media.type_() == mime::APPLICATION && media.subtype() == mime::JSON)
        .map(|_| ())
        .ok_or_else(|| {
            ApiError::Validation(format!(
                "Content-Type must be application/json, got {content_type:?}"
            ))
        })
}

/// Read a request body with a hard size cap; exceeding it is a 413.
pub async fn read_limited_body(body: axum::body::Body, max_bytes: usize) -> Result<Vec<u8>, ApiError> {
    match Limited::new(body, max_bytes).collect().await {
        Ok(collected) => Ok(collected.to_bytes().to_vec()),
        Err(err) => {
            if err.downcast_ref::<LengthLimitError>().is_some() {
                Err(ApiError::PayloadTooLarge)
            } else {
                Err(ApiError::Internal(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_content_types_pass() {
        assert!(ensure_json_content_type("application/json").is_ok());
        assert!(ensure_json_content_type("application/json; charset=utf-8").is_ok());
        assert!(ensure_json_content_type("application/json; charset=UTF-8").is_ok());
    }

    #[test]
    fn non_json_content_types_fail() {
        assert!(ensure_json_content_type("application/jsonp").is_err());
        assert!(ensure_json_content_type("text/json").is_err());
        assert!(ensure_json_content_type("text/plain").is_err());
        assert!(ensure_json_content_type("").is_err());
    }

    #[tokio::test]
    async fn body_within_limit_is_read() {
        let body = axum::body::Body::from("hello");
        let data = read_limited_body(body, 16).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let body = axum::body::Body::from(vec![0u8; 64]);
        let err = read_limited_body(body, 16).await.unwrap_err();
        assert!(matches!(err, ApiError::PayloadTooLarge));
    }
}
