//! Core error types for TIERED.
//!
//! One taxonomy is shared by the registry, the loader and the dispatcher so
//! that retry classification and status mapping each happen in one place.

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Function, version or code absent. Terminal.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up ("function", "code", "version")
        kind: String,
        /// Identifier that was looked up
        id: String,
    },

    /// Storage backend failed in a way that may succeed on retry
    #[error("Transient storage error: {message}")]
    TransientStorage {
        /// Backend message
        message: String,
    },

    /// Circuit breaker rejected the call without contacting storage
    #[error("Circuit breaker {state} for function {id}")]
    CircuitOpen {
        /// Function id
        id: String,
        /// Breaker state at rejection time ("open" or "half-open")
        state: String,
    },

    /// A tier exceeded its execution budget
    #[error("Tier {tier} timed out after {timeout_ms}ms")]
    TierTimeout {
        /// Tier name
        tier: String,
        /// Budget that was exceeded
        timeout_ms: u64,
    },

    /// The caller's deadline passed while a load was still pending
    #[error("Deadline exceeded while loading {id}")]
    DeadlineExceeded {
        /// Function id
        id: String,
    },

    /// No backend configured for a tier
    #[error("No executor configured for tier {tier}")]
    ExecutorUnavailable {
        /// Tier name
        tier: String,
    },

    /// Code tier infrastructure (loader or runtime) is not configured
    #[error("Code execution is not available: {reason}")]
    CodeTierUnavailable {
        /// Why it is unavailable
        reason: String,
    },

    /// Input rejected before execution, one message per violated constraint
    #[error("Input validation failed: {}", errors.join("; "))]
    InputValidation {
        /// Violations in discovery order
        errors: Vec<String>,
    },

    /// No step in a cascade succeeded
    #[error("Cascade produced no successful steps ({attempted} attempted)")]
    CascadeExhausted {
        /// Number of tier executions attempted
        attempted: usize,
    },

    /// Nested dispatch exceeded the configured depth
    #[error("Cascade depth {depth} exceeds limit {limit}")]
    CascadeDepthExceeded {
        /// Depth that was reached
        depth: usize,
        /// Configured ceiling
        limit: usize,
    },

    /// Source could not be turned into an invocable handle
    #[error("Compile error for {id}: {reason}")]
    Compile {
        /// Function id
        id: String,
        /// Runtime message
        reason: String,
    },

    /// A tier executor or user code returned an error
    #[error("Execution failed: {message}")]
    Execution {
        /// Executor message
        message: String,
    },

    /// Invalid version string
    #[error("Invalid version: {reason}")]
    InvalidVersion {
        /// Reason
        reason: String,
    },

    /// Metadata that cannot be used for the requested operation
    #[error("Invalid metadata for {id}: {reason}")]
    InvalidMetadata {
        /// Function id
        id: String,
        /// Reason
        reason: String,
    },

    /// Entity already exists
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Entity kind
        kind: String,
        /// Identifier
        id: String,
    },
}

impl CoreError {
    /// Create a not-found error
    #[must_use]
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a transient storage error
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientStorage {
            message: message.into(),
        }
    }

    /// Only transient storage failures are worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStorage { .. })
    }

    /// Whether this is a not-found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// HTTP-convention status code for this error
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InputValidation { .. }
            | Self::InvalidVersion { .. }
            | Self::InvalidMetadata { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::TierTimeout { .. } | Self::DeadlineExceeded { .. } => 408,
            Self::AlreadyExists { .. } => 409,
            Self::CodeTierUnavailable { .. } => 501,
            Self::ExecutorUnavailable { .. }
            | Self::CircuitOpen { .. }
            | Self::TransientStorage { .. } => 503,
            Self::CascadeExhausted { .. }
            | Self::CascadeDepthExceeded { .. }
            | Self::Compile { .. }
            | Self::Execution { .. } => 500,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Execution {
            message: format!("JSON error: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::not_found("function", "fn_123");
        assert_eq!(format!("{}", err), "function not found: fn_123");

        let err = CoreError::InputValidation {
            errors: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Input validation failed: a; b");
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(CoreError::transient("socket reset").is_retryable());
        assert!(!CoreError::not_found("code", "f").is_retryable());
        assert!(!CoreError::Compile {
            id: "f".to_string(),
            reason: "bad".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            CoreError::InputValidation { errors: vec![] }.status_code(),
            400
        );
        assert_eq!(
            CoreError::TierTimeout {
                tier: "code".to_string(),
                timeout_ms: 5000,
            }
            .status_code(),
            408
        );
        assert_eq!(
            CoreError::CodeTierUnavailable {
                reason: "no loader".to_string(),
            }
            .status_code(),
            501
        );
        assert_eq!(
            CoreError::ExecutorUnavailable {
                tier: "generative".to_string(),
            }
            .status_code(),
            503
        );
        assert_eq!(CoreError::CascadeExhausted { attempted: 2 }.status_code(), 500);
    }

    #[test]
    fn test_error_equality() {
        let err1 = CoreError::transient("x");
        let err2 = CoreError::transient("x");
        assert_eq!(err1, err2);
        assert_ne!(err1, CoreError::transient("y"));
    }
}
