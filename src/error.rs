//! Error taxonomy shared across the dispatch core.
//!
//! Every error carries an operator-readable code and enough structured
//! context to classify it at the boundary. Stack traces and internal detail
//! stay in the logs; callers only ever see the code and message.

use thiserror::Error;

/// Result type used throughout the dispatch core.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Platform-wide error taxonomy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// Caller identity could not be established.
    #[error("unauthenticated: {subject}")]
    Unauthenticated {
        /// Subject that failed authentication.
        subject: String,
    },

    /// Caller identity is known but lacks access.
    #[error("permission denied: {subject}")]
    PermissionDenied {
        /// Subject that was denied.
        subject: String,
    },

    /// Malformed or out-of-range input.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with the input.
        message: String,
    },

    /// A required entity does not exist (no drivers, missing profile).
    #[error("not found: {what}")]
    NotFound {
        /// What could not be located.
        what: String,
    },

    /// A counted resource is at its limit; the caller may retry later.
    #[error("resource exhausted: {resource}")]
    ResourceExhausted {
        /// Resource type that hit its limit.
        resource: String,
    },

    /// The circuit for this operation is open and failing fast.
    #[error("circuit open for operation '{operation}'")]
    CircuitOpen {
        /// Operation whose circuit rejected the call.
        operation: String,
    },

    /// An operation exceeded its deadline.
    #[error("timeout in operation '{operation}'")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },

    /// A transient external failure (store read/write, adapter call).
    #[error("transient failure: {message}")]
    Transient {
        /// Short description of the failure.
        message: String,
    },

    /// Unexpected internal failure. The message is generic; detail is logged.
    #[error("internal error: {message}")]
    Internal {
        /// Generic operator-safe message.
        message: String,
    },
}

impl DispatchError {
    /// Stable operator-readable code for this error class.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated { .. } => "UNAUTHENTICATED",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Transient { .. } => "TRANSIENT",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Whether the retry wrapper is allowed to re-attempt this error.
    ///
    /// Authentication, authorization, validation, missing-entity, and
    /// open-circuit failures rethrow immediately; everything else is retried
    /// within the configured attempt budget.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Unauthenticated { .. }
                | Self::PermissionDenied { .. }
                | Self::InvalidArgument { .. }
                | Self::NotFound { .. }
                | Self::CircuitOpen { .. }
        )
    }

    /// Convenience constructor for transient store failures.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Convenience constructor for internal failures.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
