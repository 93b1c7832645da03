//! Unified API error type and its HTTP mapping.

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Localized login failure message carried alongside the error string.
const LOGIN_REJECTED_MESSAGE: &str = "Неверный логин или пароль";

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    LoginRejected,
    Forbidden(String),
    NotFound(String),
    Gone(String),
    PayloadTooLarge(u64),
    RangeNotSatisfiable(u64),
    TooManyRequests(u64),
    Internal(String),
}

/// Error body shape: `error` is human-readable, `code` is the stable
/// machine-readable tag, `message` is an optional localized variant.
#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

fn json_error(
    status: StatusCode,
    headers: HeaderMap,
    error: &str,
    code: &'static str,
    message: Option<&str>,
) -> Response {
    (
        status,
        headers,
        Json(ErrorBody {
            error,
            code,
            message,
        }),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => json_error(
                StatusCode::BAD_REQUEST,
                HeaderMap::new(),
                &msg,
                "validation",
                None,
            ),
            ApiError::Unauthorized(msg) => json_error(
                StatusCode::UNAUTHORIZED,
                HeaderMap::new(),
                &msg,
                "authentication",
                None,
            ),
            ApiError::LoginRejected => json_error(
                StatusCode::UNAUTHORIZED,
                HeaderMap::new(),
                "Invalid credentials",
                "authentication",
                Some(LOGIN_REJECTED_MESSAGE),
            ),
            ApiError::Forbidden(msg) => json_error(
                StatusCode::FORBIDDEN,
                HeaderMap::new(),
                &msg,
                "authorization",
                None,
            ),
            ApiError::NotFound(msg) => json_error(
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                &msg,
                "not_found",
                None,
            ),
            ApiError::Gone(msg) => {
                json_error(StatusCode::GONE, HeaderMap::new(), &msg, "gone", None)
            }
            ApiError::PayloadTooLarge(max) => json_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                HeaderMap::new(),
                &format!("File too large. Maximum size: {max} bytes"),
                "payload_too_large",
                None,
            ),
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                json_error(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    headers,
                    "Range not satisfiable",
                    "range_not_satisfiable",
                    None,
                )
            }
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                json_error(
                    StatusCode::TOO_MANY_REQUESTS,
                    headers,
                    "Too many login attempts",
                    "rate_limited",
                    None,
                )
            }
            ApiError::Internal(msg) => json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                HeaderMap::new(),
                &msg,
                "internal",
                None,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::Value;

    async fn body_json(response: Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("parse body")
    }

    #[tokio::test]
    async fn login_rejection_carries_localized_message() {
        let response = ApiError::LoginRejected.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Invalid credentials");
        assert_eq!(body["code"], "authentication");
        assert_eq!(body["message"], "Неверный логин или пароль");
    }

    #[tokio::test]
    async fn range_error_sets_content_range_header() {
        let response = ApiError::RangeNotSatisfiable(1000).into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|value| value.to_str().ok()),
            Some("bytes */1000")
        );
        let body = body_json(response).await;
        assert_eq!(body["code"], "range_not_satisfiable");
        assert!(body.get("message").is_none());
    }

    #[tokio::test]
    async fn lockout_sets_retry_after() {
        let response = ApiError::TooManyRequests(120).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok()),
            Some("120")
        );
    }
}
