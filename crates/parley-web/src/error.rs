use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use parley_core::assistant::ChatFailure;
use parley_core::error::ParleyError;
use parley_core::response::{ChatResponse, ResponseStatus};

/// JSON API error. Always renders a `ChatResponse` body with status `error`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after_secs: Option<u64>,
    body: Option<ChatResponse>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after_secs: None,
            body: None,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }
}

/// HTTP status for a pipeline error.
pub fn status_for(err: &ParleyError) -> StatusCode {
    match err {
        // Refusals are explained to the user, not reported as failures.
        ParleyError::Unsupported(_) => StatusCode::OK,
        ParleyError::Validation(_) => StatusCode::BAD_REQUEST,
        ParleyError::AccessDenied(_) => StatusCode::FORBIDDEN,
        ParleyError::NotFound(_) => StatusCode::NOT_FOUND,
        ParleyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        ParleyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ParleyError::ActionFailed(_) => StatusCode::BAD_GATEWAY,
        ParleyError::DownstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ParleyError::Storage(_)
        | ParleyError::Llm(_)
        | ParleyError::Http(_)
        | ParleyError::Serialization(_)
        | ParleyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn retry_after(err: &ParleyError) -> Option<u64> {
    match err {
        ParleyError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
        _ => None,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self
            .body
            .unwrap_or_else(|| ChatResponse::new(ResponseStatus::Error, self.message));
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<ChatFailure> for ApiError {
    fn from(failure: ChatFailure) -> Self {
        Self {
            status: status_for(&failure.error),
            message: failure.response.message.clone(),
            retry_after_secs: retry_after(&failure.error),
            body: Some(failure.response),
        }
    }
}

impl From<ParleyError> for ApiError {
    fn from(err: ParleyError) -> Self {
        let status = status_for(&err);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("api error: {}", err);
        }
        let body = match &err {
            ParleyError::Unsupported(reason) => {
                ChatResponse::new(ResponseStatus::Unsupported, reason.clone())
            }
            _ => ChatResponse::error(&err),
        };
        Self {
            status,
            message: body.message.clone(),
            retry_after_secs: retry_after(&err),
            body: Some(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&ParleyError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ParleyError::AccessDenied("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&ParleyError::Timeout("x".into())),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&ParleyError::Config("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_unsupported_is_explained_with_ok_status() {
        use http_body_util::BodyExt;

        let response = ApiError::from(ParleyError::Unsupported(
            "deleting projects is done in the application".into(),
        ))
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "unsupported");
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ApiError::from(ParleyError::RateLimited {
            retry_after_secs: 9,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "9");
    }

    #[test]
    fn test_internal_detail_not_exposed() {
        let err = ApiError::from(ParleyError::Storage("disk /var/lib/x full".into()));
        assert!(!err.message.contains("/var/lib"));
    }
}
