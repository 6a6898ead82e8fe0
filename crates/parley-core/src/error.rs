use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ParleyError {
    /// The `result_status` written to the audit trail for a request that
    /// terminated with this error.
    pub fn result_status(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::AccessDenied(_) => "access_denied",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout(_) => "timeout",
            Self::Unsupported(_) => "unsupported",
            Self::DownstreamUnavailable(_) => "downstream_unavailable",
            Self::ActionFailed(_) => "action_failed",
            Self::NotFound(_) => "not_found",
            Self::Storage(_)
            | Self::Llm(_)
            | Self::Http(_)
            | Self::Serialization(_)
            | Self::Config(_) => "internal_error",
        }
    }

    /// Short label used as the `error_type` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::AccessDenied(_) => "access_denied",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout(_) => "timeout",
            Self::Unsupported(_) => "unsupported",
            Self::DownstreamUnavailable(_) => "downstream_unavailable",
            Self::ActionFailed(_) => "action_failed",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage",
            Self::Llm(_) => "llm",
            Self::Http(_) => "http",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
        }
    }

    /// Returns `true` when the error is likely transient
    /// (e.g. HTTP 429/5xx, network timeouts, connection refused).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout(_) | Self::DownstreamUnavailable(_) => true,
            Self::Llm(msg) | Self::Storage(msg) | Self::ActionFailed(msg) => {
                is_transient_message(msg)
            }
            _ => false,
        }
    }
}

fn is_transient_message(msg: &str) -> bool {
    let msg_lower = msg.to_lowercase();
    for code in ["429", "500", "502", "503", "504"] {
        if msg_lower.contains(code) {
            return true;
        }
    }
    let patterns = [
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "broken pipe",
        "temporarily unavailable",
    ];
    patterns.iter().any(|p| msg_lower.contains(p))
}

pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_status_taxonomy() {
        assert_eq!(
            ParleyError::Validation("empty".into()).result_status(),
            "validation_error"
        );
        assert_eq!(
            ParleyError::RateLimited {
                retry_after_secs: 3
            }
            .result_status(),
            "rate_limited"
        );
        assert_eq!(
            ParleyError::AccessDenied("x".into()).result_status(),
            "access_denied"
        );
        assert_eq!(ParleyError::Timeout("llm".into()).result_status(), "timeout");
        assert_eq!(
            ParleyError::Config("bad".into()).result_status(),
            "internal_error"
        );
    }

    #[test]
    fn test_transient_503() {
        let err = ParleyError::ActionFailed("data api error 503: unavailable".into());
        assert!(err.is_transient());
    }

    #[test]
    fn test_transient_timeout() {
        let err = ParleyError::Llm("connection timed out".into());
        assert!(err.is_transient());
    }

    #[test]
    fn test_permanent_validation() {
        let err = ParleyError::Validation("query too long".into());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_permanent_403() {
        let err = ParleyError::ActionFailed("data api error 403: forbidden".into());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_rate_limited_display() {
        let err = ParleyError::RateLimited {
            retry_after_secs: 12,
        };
        assert_eq!(err.to_string(), "Rate limited: retry after 12s");
    }
}
