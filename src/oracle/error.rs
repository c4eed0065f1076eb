//! Errors returned by decision oracles.

/// Errors that can occur while asking an oracle for its next action.
///
/// Any of these ends the run. [`OracleError::Timeout`] maps to the
/// `timeout` exit reason, everything else to `error`.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// The request never got a response.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Credentials were missing or rejected.
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// The backend asked us to slow down.
    #[error("Rate limit exceeded: {message}")]
    RateLimited { message: String },

    /// The backend answered with a non-success status.
    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    /// The response could not be understood.
    #[error("Malformed response: {message}")]
    Malformed { message: String },

    /// A delegated backend process failed.
    #[error("Backend failed: {message}")]
    Backend { message: String },

    /// A delegated CLI run did not finish within its deadline.
    #[error("Oracle timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// A required binary or credential is not available.
    #[error("Missing dependency: {message}")]
    MissingDependency { message: String },
}

impl OracleError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn missing_dependency(message: impl Into<String>) -> Self {
        Self::MissingDependency {
            message: message.into(),
        }
    }

    /// Returns true if this error should end the run as a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the same request may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Transport { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_error() {
        let err = OracleError::Timeout { seconds: 1800 };
        assert!(err.is_timeout());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Oracle timed out after 1800s");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(OracleError::rate_limited("slow down").is_retryable());
        assert!(OracleError::transport("connection reset").is_retryable());
        assert!(OracleError::Api {
            status: 529,
            body: "overloaded".to_string()
        }
        .is_retryable());
        assert!(!OracleError::Api {
            status: 400,
            body: "bad request".to_string()
        }
        .is_retryable());
        assert!(!OracleError::auth("invalid x-api-key").is_retryable());
        assert!(!OracleError::malformed("not json").is_timeout());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            OracleError::missing_dependency("codex not found on PATH").to_string(),
            "Missing dependency: codex not found on PATH"
        );
        assert_eq!(
            OracleError::backend("exit code 1").to_string(),
            "Backend failed: exit code 1"
        );
    }
}
