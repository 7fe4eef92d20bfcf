use archer_contracts::{ApiErrorItem, ErrorResponse};
use archer_core::ArcherError;
use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

/// Error rendered as `{errors:[...]}` with the matching status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub errors: Vec<ApiErrorItem>,
}

impl ApiError {
    pub fn new(status: StatusCode, errors: Vec<ApiErrorItem>) -> Self {
        Self { status, errors }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            vec![ApiErrorItem::invalid_request(message)],
        )
    }

    pub fn missing_param(param: &str, message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            vec![ApiErrorItem::invalid_request(message).with_param(param)],
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            vec![ApiErrorItem::invalid_request(message).with_code("not_found")],
        )
    }

    /// Details stay in the log; the caller gets a generic message.
    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            vec![ApiErrorItem::api_error("Internal server error")],
        )
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self
            .errors
            .first()
            .map(|item| item.message.as_str())
            .unwrap_or("unknown error");
        write!(f, "{}: {message}", self.status)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { errors: self.errors })).into_response()
    }
}

impl From<ArcherError> for ApiError {
    fn from(err: ArcherError) -> Self {
        match err {
            ArcherError::Validation(fields) => Self::new(
                StatusCode::BAD_REQUEST,
                fields
                    .into_iter()
                    .map(|field| {
                        ApiErrorItem::invalid_request(field.message).with_param(field.param)
                    })
                    .collect(),
            ),
            ArcherError::AlreadyTerminal { status, .. } => {
                Self::bad_request(format!("Task has already {status}"))
            }
            ArcherError::NotFound { .. } => Self::not_found(capitalize(&err.to_string())),
            other => {
                error!(error = %other, "request failed");
                Self::internal()
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

fn capitalize(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archer_core::FieldError;
    use archer_model::{TaskId, TaskStatus};

    #[test]
    fn validation_errors_keep_one_item_per_field() {
        let err = ApiError::from(ArcherError::Validation(vec![
            FieldError::new("targets", "Targets are required"),
            FieldError::new("ports", "Ports are required"),
        ]));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let params: Vec<_> = err
            .errors
            .iter()
            .map(|item| item.param.as_deref().unwrap())
            .collect();
        assert_eq!(params, vec!["targets", "ports"]);
    }

    #[test]
    fn terminal_tasks_are_conflicts() {
        let err = ApiError::from(ArcherError::AlreadyTerminal {
            task: TaskId::from_raw("abc"),
            status: TaskStatus::Completed,
        });
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.errors[0].message, "Task has already completed");
    }

    #[test]
    fn infrastructure_details_are_hidden() {
        let err = ApiError::from(ArcherError::Queue("connection refused to 10.1.1.1".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.errors[0].message, "Internal server error");
    }

    #[test]
    fn missing_rows_are_not_found() {
        let err = ApiError::from(ArcherError::not_found("scan", "abc123"));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.errors[0].message, "Scan abc123 not found");
    }
}
