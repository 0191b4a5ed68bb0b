// Error registry shared by the REST surface and the WebSocket protocol.
//
// Every failure carries a stable machine-readable code; REST renders it as a
// JSON error body with the request id, the socket path reuses the same codes
// inside ack/error frames.

use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tandem_common::error::EngineError;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    TokenInvalid,
    NotFound,
    AlreadyExists,
    InvalidOperation,
    HelloRequired,
    UnsupportedProtocol,
    InvalidMessage,
    UnsupportedMessage,
    HeartbeatTimeout,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::InvalidOperation => "INVALID_OPERATION",
            Self::HelloRequired => "HELLO_REQUIRED",
            Self::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::UnsupportedMessage => "UNSUPPORTED_MESSAGE",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::TokenInvalid => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::AlreadyExists => StatusCode::CONFLICT,
            Self::InvalidOperation => StatusCode::UNPROCESSABLE_ENTITY,
            Self::HelloRequired => StatusCode::BAD_REQUEST,
            Self::UnsupportedProtocol => StatusCode::UPGRADE_REQUIRED,
            Self::InvalidMessage => StatusCode::BAD_REQUEST,
            Self::UnsupportedMessage => StatusCode::BAD_REQUEST,
            Self::HeartbeatTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::HeartbeatTimeout | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::TokenInvalid => "auth token was rejected",
            Self::NotFound => "requested resource not found",
            Self::AlreadyExists => "resource already exists",
            Self::InvalidOperation => "operation references a version that does not exist",
            Self::HelloRequired => "hello must be the first frame on the socket",
            Self::UnsupportedProtocol => "client protocol version is not supported",
            Self::InvalidMessage => "frame could not be decoded",
            Self::UnsupportedMessage => "frame type is not accepted from clients",
            Self::HeartbeatTimeout => "no heartbeat received within the idle window",
            Self::InternalError => "internal server error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubError {
    code: ErrorCode,
    message: String,
    request_id: Option<String>,
}

impl HubError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<EngineError> for HubError {
    fn from(err: EngineError) -> Self {
        let code = match err {
            EngineError::NotFound(_) => ErrorCode::NotFound,
            EngineError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            EngineError::InvalidOperation(_) => ErrorCode::InvalidOperation,
        };
        Self::new(code, err.to_string())
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
