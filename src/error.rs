//! Crate-wide error type and the stable `code` strings carried on the wire.
//!
//! Corresponds to the error kinds enumerated in the boundary error design:
//! every variant here maps to exactly one `code` string that outbound
//! `error` frames and admin HTTP responses expose to clients. Clients
//! must not depend on `message` — only `code` is stable.

use thiserror::Error;

/// Crate-wide error type.
///
/// Boundary code is returned by [`AppError::code`]; the `Display` impl
/// (driven by `#[error(...)]`) is the human-readable message, which is
/// explicitly *not* part of the stable contract.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("token limit exceeded")]
    TokenLimitExceeded,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("tool validation failed: {0}")]
    ToolValidationFailed(String),

    #[error("tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// The stable `code` string carried on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::AuthFailed(_) => "auth_failed",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::Forbidden(_) => "forbidden",
            AppError::Conflict(_) => "conflict",
            AppError::RateLimited(_) => "rate_limited",
            AppError::TokenLimitExceeded => "token_limit_exceeded",
            AppError::UpstreamUnavailable(_) => "upstream_unavailable",
            AppError::ToolValidationFailed(_) => "tool_validation_failed",
            AppError::ToolExecutionFailed(_) => "tool_execution_failed",
            AppError::Internal(_) => "internal",
        }
    }

    /// Build the outbound `error` frame payload (`data` field of an
    /// `error`-typed [`crate::codec::Envelope`]).
    pub fn to_frame_data(&self) -> serde_json::Value {
        serde_json::json!({
            "message": self.to_string(),
            "error": self.to_string(),
            "code": self.code(),
        })
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(AppError::AuthFailed("x".into()).code(), "auth_failed");
        assert_eq!(AppError::Conflict("x".into()).code(), "conflict");
        assert_eq!(AppError::TokenLimitExceeded.code(), "token_limit_exceeded");
    }

    #[test]
    fn frame_data_carries_code_and_message() {
        let err = AppError::ToolValidationFailed("bad arg".into());
        let data = err.to_frame_data();
        assert_eq!(data["code"], "tool_validation_failed");
        assert!(data["message"].as_str().unwrap().contains("bad arg"));
    }
}
