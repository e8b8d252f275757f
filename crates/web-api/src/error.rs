use application::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use domain::DomainError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &ErrorBody {
        &self.body
    }
}

impl From<DomainError> for ApiError {
    fn from(error: DomainError) -> Self {
        let message = error.to_string();
        match error {
            DomainError::DuplicateUser { .. } => {
                ApiError::new(StatusCode::CONFLICT, "DUPLICATE_USER", message)
            }
            DomainError::UserNotFound { .. } => {
                ApiError::new(StatusCode::NOT_FOUND, "USER_NOT_FOUND", message)
            }
            DomainError::ChannelNotFound { .. } => {
                ApiError::new(StatusCode::NOT_FOUND, "CHANNEL_NOT_FOUND", message)
            }
            DomainError::AccessDenied { .. } => {
                ApiError::new(StatusCode::FORBIDDEN, "ACCESS_DENIED", message)
            }
            DomainError::InvalidArgument { field, reason } => ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_ARGUMENT",
                format!("{}: {}", field, reason),
            ),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Domain(err) => err.into(),
            StoreError::Conflict { .. } => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "STATE_CONFLICT",
                error.to_string(),
            ),
            StoreError::Backend(err) => {
                tracing::error!(error = %err, "共享状态后端故障");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "BACKEND_ERROR",
                    "shared state backend unavailable",
                )
            }
            StoreError::InvalidAction(err) => {
                ApiError::new(StatusCode::BAD_REQUEST, "INVALID_ACTION", err.to_string())
            }
            StoreError::Fatal(_) | StoreError::AlreadyBound | StoreError::NotBound => {
                tracing::error!(error = %error, "Store 出现意外错误");
                ApiError::internal_server_error(error.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_client_statuses() {
        let cases = [
            (DomainError::duplicate_name("x", "bob"), StatusCode::CONFLICT),
            (DomainError::user_not_found("s"), StatusCode::NOT_FOUND),
            (DomainError::channel_not_found("x"), StatusCode::NOT_FOUND),
            (DomainError::access_denied("no"), StatusCode::FORBIDDEN),
            (
                DomainError::invalid_argument("name", "empty"),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(StoreError::from(error)).status(), status);
        }
    }

    #[test]
    fn conflict_is_retryable() {
        let error = ApiError::from(StoreError::Conflict { attempts: 17 });
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.body().code, "STATE_CONFLICT");
    }
}
