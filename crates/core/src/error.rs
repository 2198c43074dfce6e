//! Errors raised by collaborators of the telemetry engine.
//!
//! Uses `thiserror` for ergonomic error definitions. Instrumentation never
//! converts these into failures of its own; they are either passed back to
//! the caller untouched (provider errors) or captured as span data
//! (validation errors).

use thiserror::Error;

/// Failure of an LLM provider call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Failure inside a validator itself (not a failed verdict).
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("validator '{validator}' could not evaluate output: {reason}")]
    Evaluation { validator: String, reason: String },

    #[error("validator '{validator}' received malformed output: {reason}")]
    MalformedOutput { validator: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        };
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn validation_error_names_validator() {
        let err = ValidationError::MalformedOutput {
            validator: "json_schema".into(),
            reason: "expected object".into(),
        };
        assert!(err.to_string().contains("json_schema"));
        assert!(err.to_string().contains("expected object"));
    }
}
