use thiserror::Error;

/// Typed error hierarchy for meao.
///
/// Use at module boundaries (provider calls, tool execution, config validation,
/// sessions). Internal/leaf functions can continue using `anyhow::Result` — the
/// `Internal` variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum MeaoError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("Rate limit exceeded")]
    RateLimit { retry_after: Option<u64> },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Context length exceeded: {0}")]
    ContextLength(String),

    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("Approval denied: {0}")]
    ApprovalDenied(String),

    #[error("Network blocked: {0}")]
    NetworkBlocked(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Channel error: {channel}: {message}")]
    Channel { channel: String, message: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using `MeaoError`.
pub type MeaoResult<T> = std::result::Result<T, MeaoError>;

impl MeaoError {
    /// Whether this error is retryable (rate limits, transient provider errors).
    pub fn is_retryable(&self) -> bool {
        match self {
            MeaoError::RateLimit { .. } => true,
            MeaoError::Provider { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether this error ends the current turn (cannot be surfaced to the
    /// model as a tool result for self-correction).
    pub fn is_turn_fatal(&self) -> bool {
        matches!(
            self,
            MeaoError::Auth(_) | MeaoError::ContextLength(_) | MeaoError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = MeaoError::Config("bad value".into());
        assert_eq!(err.to_string(), "Configuration error: bad value");
    }

    #[test]
    fn provider_error_retryable_flag() {
        let err = MeaoError::Provider {
            message: "timeout".into(),
            retryable: true,
        };
        assert!(err.is_retryable());
        let err = MeaoError::Provider {
            message: "invalid request".into(),
            retryable: false,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limit_retryable() {
        let err = MeaoError::RateLimit {
            retry_after: Some(30),
        };
        assert!(err.is_retryable());
        assert!(!err.is_turn_fatal());
    }

    #[test]
    fn auth_error_fatal_not_retryable() {
        let err = MeaoError::Auth("invalid key".into());
        assert!(!err.is_retryable());
        assert!(err.is_turn_fatal());
    }

    #[test]
    fn context_length_fatal() {
        let err = MeaoError::ContextLength("prompt too large".into());
        assert!(err.is_turn_fatal());
    }

    #[test]
    fn internal_from_anyhow() {
        let anyhow_err = anyhow::anyhow!("something broke");
        let err: MeaoError = anyhow_err.into();
        assert!(matches!(err, MeaoError::Internal(_)));
        assert!(!err.is_retryable());
    }
}
