use crate::api::ErrorBody;

/// Transport-neutral request; the axum layer and tests both build these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, target: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            body,
        }
    }

    /// Target without its query string.
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(&self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    pub(crate) fn ok_json(body: String) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body,
        }
    }

    pub(crate) fn ok_text(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/plain; version=0.0.4; charset=utf-8",
            body,
        }
    }

    pub(crate) fn bad_request(message: &str) -> Self {
        Self::error(400, message)
    }

    pub(crate) fn not_found(message: &str) -> Self {
        Self::error(404, message)
    }

    pub(crate) fn method_not_allowed(message: &str) -> Self {
        Self::error(405, message)
    }

    pub(crate) fn payload_too_large(message: &str) -> Self {
        Self::error(413, message)
    }

    pub(crate) fn internal_server_error(message: &str) -> Self {
        Self::error(500, message)
    }

    pub(crate) fn error_with_status(status: u16, message: &str) -> Self {
        match status {
            400 => Self::bad_request(message),
            404 => Self::not_found(message),
            405 => Self::method_not_allowed(message),
            413 => Self::payload_too_large(message),
            _ => Self::internal_server_error(message),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        let body = serde_json::to_string(&ErrorBody {
            error: message.to_string(),
        })
        .unwrap_or_else(|_| String::from(r#"{"error":"internal error"}"#));
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }
}
