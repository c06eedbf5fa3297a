use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::Json;

pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP error envelope. Every error response carries the tracing id so
/// clients can correlate with server logs.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub request_id: String,
    context: Vec<(&'static str, String)>,
    allow: Option<&'static str>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>, request_id: &str) -> Self {
        Self {
            status,
            message: message.into(),
            request_id: request_id.to_string(),
            context: Vec::new(),
            allow: None,
        }
    }

    pub fn bad_request(message: impl Into<String>, request_id: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, request_id)
    }

    pub fn unauthorized(message: impl Into<String>, request_id: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message, request_id)
    }

    pub fn not_found(message: impl Into<String>, request_id: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message, request_id)
    }

    pub fn method_not_allowed(message: impl Into<String>, request_id: &str) -> Self {
        let mut err = Self::new(StatusCode::METHOD_NOT_ALLOWED, message, request_id);
        err.allow = Some("GET, POST");
        err
    }

    pub fn service_unavailable(message: impl Into<String>, request_id: &str) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message, request_id)
    }

    pub fn bad_gateway(message: impl Into<String>, request_id: &str) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message, request_id)
    }

    pub fn internal(message: impl Into<String>, request_id: &str) -> Self {
        let message = message.into();
        tracing::error!(error = %message, request_id = %request_id, "internal error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message, request_id)
    }

    /// Attach an extra key to the response body and the error log line.
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let mut body = serde_json::json!({
            "error": self.message,
            "requestId": self.request_id,
        });
        for (key, value) in &self.context {
            body[*key] = serde_json::Value::String(value.clone());
        }
        tracing::error!(
            status = self.status.as_u16(),
            error = %self.message,
            request_id = %self.request_id,
            "request error"
        );
        let mut response = (self.status, Json(body)).into_response();
        if let Some(allow) = self.allow {
            response
                .headers_mut()
                .insert(axum::http::header::ALLOW, HeaderValue::from_static(allow));
        }
        response
    }
}
