//! Error types for WorkflowGuard.
//!
//! Every variant carries a stable machine-parseable code, and errors that
//! cross the API boundary are sanitized so internal details (SQL, file
//! paths, upstream response bodies) never leak to external consumers.

use thiserror::Error;

/// Result type alias for WorkflowGuard operations.
pub type Result<T> = std::result::Result<T, Error>;

/// WorkflowGuard error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Plan limit reached: {0}")]
    PlanLimit(String),

    #[error("Rate limit exceeded; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Circuit breaker open for '{0}'")]
    CircuitOpen(String),

    #[error("HubSpot error: {0}")]
    HubSpot(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the stable error code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::PlanLimit(_) => "PLAN_LIMIT",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::CircuitOpen(_) => "CIRCUIT_OPEN",
            Error::HubSpot(_) => "HUBSPOT_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// HTTP status code mapping for API responses.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::Json(_) => 400,
            Error::NotFound(_) => 404,
            Error::Forbidden(_) | Error::PlanLimit(_) => 403,
            Error::RateLimited { .. } => 429,
            Error::CircuitOpen(_) => 503,
            Error::Http(e) if e.is_timeout() => 504,
            _ => 500,
        }
    }

    /// Get a sanitized error message safe for external consumers.
    ///
    /// Hides internal details like SQL statements, file paths, and upstream
    /// response bodies that could leak sensitive information.
    pub fn external_message(&self) -> String {
        match self {
            // User-facing errors - safe to expose the message
            Error::Validation(msg) => format!("Validation error: {}", msg),
            Error::NotFound(msg) => format!("Not found: {}", msg),
            Error::Forbidden(msg) => format!("Forbidden: {}", msg),
            Error::PlanLimit(msg) => format!("Plan limit reached: {}", msg),
            Error::RateLimited { retry_after_secs } => {
                format!("Rate limit exceeded; retry after {}s", retry_after_secs)
            }
            Error::CircuitOpen(upstream) => {
                format!("Upstream '{}' is temporarily unavailable", upstream)
            }

            // Internal errors - sanitize to avoid leaking details
            Error::Storage(_) | Error::Database(_) => "A storage error occurred".to_string(),
            Error::Config(_) => "A configuration error occurred".to_string(),
            Error::Internal(_) => "An internal error occurred".to_string(),
            Error::Io(_) => "An I/O error occurred".to_string(),
            Error::Json(_) => "Invalid JSON".to_string(),
            Error::HubSpot(_) => "The HubSpot API request failed".to_string(),

            // HTTP errors - expose status class only
            Error::Http(e) => {
                if let Some(status) = e.status() {
                    format!("Upstream request failed with status {}", status.as_u16())
                } else if e.is_timeout() {
                    "Upstream request timed out".to_string()
                } else if e.is_connect() {
                    "Failed to connect to upstream server".to_string()
                } else {
                    "Upstream request failed".to_string()
                }
            }
        }
    }

    /// Convert to a JSON response body with the sanitized message.
    pub fn to_external_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.external_message(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::Validation("bad".into()).http_status(), 400);
        assert_eq!(Error::NotFound("x".into()).http_status(), 404);
        assert_eq!(Error::Forbidden("x".into()).http_status(), 403);
        assert_eq!(Error::PlanLimit("cap".into()).http_status(), 403);
        assert_eq!(Error::RateLimited { retry_after_secs: 1 }.http_status(), 429);
        assert_eq!(Error::CircuitOpen("hubspot".into()).http_status(), 503);
        assert_eq!(Error::Internal("boom".into()).http_status(), 500);
    }

    #[test]
    fn test_internal_errors_are_sanitized() {
        let err = Error::Storage("SELECT * FROM secrets failed".to_string());
        assert!(!err.external_message().contains("SELECT"));

        let err = Error::Internal("/etc/workflowguard/token leaked".to_string());
        assert!(!err.external_message().contains("/etc"));
    }

    #[test]
    fn test_external_json_shape() {
        let err = Error::NotFound("workflow 'wf-1'".to_string());
        let json = err.to_external_json();
        assert_eq!(json["error"]["code"], "NOT_FOUND");
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("wf-1"));
    }
}
