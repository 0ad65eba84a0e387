use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::session::RegistryError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message.
#[derive(Debug)]
pub enum ApiError {
    /// 404 - Generic not-found.
    NotFound,
    /// 404 - A specific session id was not found.
    SessionNotFound(String),
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound => "not_found",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::NotFound => "Not found.".to_string(),
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => ApiError::SessionNotFound(id),
            RegistryError::BridgeActive(id) => {
                ApiError::InvalidRequest(format!("session {id} already has an attached terminal"))
            }
            RegistryError::InvalidParams(detail) => ApiError::InvalidRequest(detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;

    async fn response_parts(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = Body::new(response.into_body())
            .collect()
            .await
            .unwrap()
            .to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    #[tokio::test]
    async fn session_not_found_body() {
        let (status, json) = response_parts(ApiError::SessionNotFound("abc".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "session_not_found");
        assert_eq!(json["error"]["message"], "Session not found: abc.");
    }

    #[tokio::test]
    async fn invalid_request_status() {
        let (status, json) = response_parts(ApiError::InvalidRequest("host must not be empty".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "invalid_request");
    }

    #[test]
    fn registry_errors_map_to_api_errors() {
        assert_eq!(
            ApiError::from(RegistryError::NotFound("x".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(RegistryError::BridgeActive("x".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(RegistryError::InvalidParams("bad".into())).code(),
            "invalid_request"
        );
    }

    #[tokio::test]
    async fn body_has_only_error_object() {
        let (_, json) = response_parts(ApiError::NotFound).await;
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("error"));
    }
}
