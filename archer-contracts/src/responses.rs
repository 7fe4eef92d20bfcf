use serde::{Deserialize, Serialize};

/// `{ "success": true }` acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

/// Broad class of an API error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    /// The caller sent something invalid or conflicting.
    InvalidRequestError,
    /// The coordinator failed internally.
    ApiError,
}

/// One entry of an error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorItem {
    #[serde(rename = "type")]
    pub kind: ApiErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    pub message: String,
}

impl ApiErrorItem {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::InvalidRequestError,
            code: None,
            param: None,
            message: message.into(),
        }
    }

    pub fn api_error(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::ApiError,
            code: None,
            param: None,
            message: message.into(),
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// `{ "errors": [...] }` body returned on every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub errors: Vec<ApiErrorItem>,
}

impl ErrorResponse {
    pub fn single(item: ApiErrorItem) -> Self {
        Self { errors: vec![item] }
    }

    /// First message, for callers that surface one line to a human.
    pub fn first_message(&self) -> Option<&str> {
        self.errors.first().map(|item| item.message.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_items_serialize_with_type_key() {
        let body = ErrorResponse::single(
            ApiErrorItem::invalid_request("Value 'zmap' is not a valid module")
                .with_param("modules"),
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["errors"][0]["type"], "invalid_request_error");
        assert_eq!(json["errors"][0]["param"], "modules");
        assert!(json["errors"][0].get("code").is_none());
    }
}
