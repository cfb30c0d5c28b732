use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Details of a failed HTTP response
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseError {
    pub status: u16,
    pub route: String,
    /// Remote error code from the JSON body, when there is one
    pub code: Option<i64>,
    pub message: String,
    /// Field errors flattened to `(path, message)`, e.g. `("embeds.0.title", "Must be 256 or fewer")`
    pub errors: Vec<(String, String)>,
}

impl ResponseError {
    pub fn from_body(status: u16, route: impl Into<String>, body: &str) -> Self {
        let route = route.into();
        let parsed: Option<Value> = serde_json::from_str(body).ok();

        let Some(Value::Object(map)) = parsed else {
            return Self {
                status,
                route,
                code: None,
                message: body.trim().to_string(),
                errors: Vec::new(),
            };
        };

        let mut errors = Vec::new();
        if let Some(nested) = map.get("errors") {
            flatten_errors(nested, String::new(), &mut errors);
        }

        Self {
            status,
            route,
            code: map.get("code").and_then(Value::as_i64),
            message: map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            errors,
        }
    }
}

fn flatten_errors(value: &Value, path: String, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("_errors") {
                let messages: Vec<&str> = items
                    .iter()
                    .filter_map(|item| item.get("message").and_then(Value::as_str))
                    .collect();
                out.push((path.clone(), messages.join(" ")));
            }
            for (key, child) in map {
                if key == "_errors" {
                    continue;
                }
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                flatten_errors(child, child_path, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_errors(child, format!("{path}.{index}"), out);
            }
        }
        _ => {}
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.status, self.route)?;
        if let Some(code) = self.code {
            write!(f, " (error code {code})")?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        for (path, message) in &self.errors {
            write!(f, "\nIn {path}: {message}")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Forbidden: {0}")]
    Forbidden(ResponseError),

    #[error("Not found: {0}")]
    NotFound(ResponseError),

    #[error("Server error: {0}")]
    ServerError(ResponseError),

    #[error("Request failed: {0}")]
    Client(ResponseError),

    /// Still rate limited after every attempt
    #[error("Rate limited on {route} (retry after {retry_after}s, global: {global})")]
    RateLimited {
        route: String,
        retry_after: f64,
        global: bool,
    },

    #[error("Transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl HttpError {
    /// Typed error for a non-2xx response
    pub fn from_response(status: u16, route: impl Into<String>, body: &str) -> Self {
        let error = ResponseError::from_body(status, route, body);
        match status {
            403 => Self::Forbidden(error),
            404 => Self::NotFound(error),
            500.. => Self::ServerError(error),
            _ => Self::Client(error),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Forbidden(e) | Self::NotFound(e) | Self::ServerError(e) | Self::Client(e) => Some(e.status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    pub fn is_retryable_transport(&self) -> bool {
        matches!(self, Self::Transport { retryable: true, .. })
    }
}

impl From<serde_json::Error> for HttpError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HttpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(HttpError::from_response(403, "GET /x", ""), HttpError::Forbidden(_)));
        assert!(matches!(HttpError::from_response(404, "GET /x", ""), HttpError::NotFound(_)));
        assert!(matches!(HttpError::from_response(503, "GET /x", ""), HttpError::ServerError(_)));
        assert!(matches!(HttpError::from_response(400, "GET /x", ""), HttpError::Client(_)));
        assert_eq!(HttpError::from_response(418, "GET /x", "").status(), Some(418));
    }

    #[test]
    fn test_nested_errors_are_flattened() {
        let body = r#"{
            "code": 50035,
            "message": "Invalid Form Body",
            "errors": {
                "content": {"_errors": [{"code": "BASE_TYPE_MAX_LENGTH", "message": "Must be 2000 or fewer in length."}]},
                "embeds": [{"title": {"_errors": [{"code": "X", "message": "Too long."}]}}]
            }
        }"#;

        let error = ResponseError::from_body(400, "POST /channels/{channel_id}/messages", body);
        assert_eq!(error.code, Some(50035));
        assert_eq!(error.message, "Invalid Form Body");
        assert!(error
            .errors
            .contains(&("content".to_string(), "Must be 2000 or fewer in length.".to_string())));
        assert!(error
            .errors
            .contains(&("embeds.0.title".to_string(), "Too long.".to_string())));
    }

    #[test]
    fn test_plain_text_body() {
        let error = ResponseError::from_body(502, "GET /gateway", "Bad Gateway\n");
        assert_eq!(error.message, "Bad Gateway");
        assert!(error.errors.is_empty());
        assert_eq!(error.to_string(), "502 on GET /gateway: Bad Gateway");
    }
}
