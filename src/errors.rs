//! Unified error types and result handling.
//!
//! Every failure in the crate maps onto a small taxonomy of error kinds, each
//! carrying a stable machine-readable `code` and an HTTP status for the hosting
//! router to use. The [`ErrorEnvelope`] type serializes errors into the uniform
//! `{ "errors": [...] }` body the client expects.

use serde::Serialize;
use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Per-field failure from payload validation.
    #[error("Validation failed for field '{field}': {message}")]
    FieldValidation {
        /// Name of the offending payload field
        field: String,
        /// Human-readable description of the failure
        message: String,
    },

    /// A model-level invariant was breached (e.g. a percent markup with no
    /// children).
    #[error("Invariant violation: {message}")]
    InvariantViolation {
        /// Description of the violated invariant
        message: String,
    },

    /// Entity lookup miss.
    #[error("{kind} with id {id} not found")]
    NotFound {
        /// Entity kind that was looked up
        kind: &'static str,
        /// Primary key that missed
        id: i64,
    },

    /// Authorization failure.
    #[error("Permission denied: {message}")]
    Permission {
        /// Human-readable description
        message: String,
        /// When true, the client should drop its session
        force_logout: bool,
    },

    /// Unique-together violation on create/update.
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the conflicting state
        message: String,
    },

    /// Malformed payload or unsupported operation.
    #[error("Bad request: {message}")]
    BadRequest {
        /// Description of the problem
        message: String,
    },

    /// Cross-budget or cross-parent reference.
    #[error("Integrity error: {message}")]
    Integrity {
        /// Description of the broken reference
        message: String,
    },

    /// Invalid fractional order key.
    #[error("Invalid order key '{key}': {message}")]
    InvalidOrderKey {
        /// The rejected key
        key: String,
        /// Why it was rejected
        message: String,
    },

    /// Configuration error (environment, toml file).
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem
        message: String,
    },

    /// Underlying database error.
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// JSON (de)serialization error while recording history values.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (configuration file reads).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code for the error envelope.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::FieldValidation { .. } => "field_validation",
            Self::InvariantViolation { .. } => "invariant_violation",
            Self::NotFound { .. } => "not_found",
            Self::Permission { .. } => "permission",
            Self::Conflict { .. } => "conflict",
            Self::BadRequest { .. } | Self::InvalidOrderKey { .. } => "bad_request",
            Self::Integrity { .. } => "integrity",
            Self::Config { .. } => "config",
            Self::Database(_) | Self::Serialization(_) | Self::Io(_) => "internal",
        }
    }

    /// HTTP status the hosting router should return for this error.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::FieldValidation { .. }
            | Self::InvariantViolation { .. }
            | Self::Conflict { .. }
            | Self::BadRequest { .. }
            | Self::InvalidOrderKey { .. }
            | Self::Integrity { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Permission { .. } => 403,
            Self::Config { .. } | Self::Database(_) | Self::Serialization(_) | Self::Io(_) => 500,
        }
    }

    /// Broad classification used by the envelope's `error_type` key.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::FieldValidation { .. } => "field",
            Self::Permission { .. } => "auth",
            Self::NotFound { .. } => "http",
            _ => "global",
        }
    }

    /// Serializes this error into the uniform response envelope.
    #[must_use]
    pub fn envelope(&self) -> ErrorEnvelope {
        let field = match self {
            Self::FieldValidation { field, .. } => Some(field.clone()),
            _ => None,
        };
        let force_logout = match self {
            Self::Permission { force_logout, .. } => Some(*force_logout),
            _ => None,
        };
        ErrorEnvelope {
            errors: vec![ErrorDetail {
                message: self.to_string(),
                code: self.code(),
                error_type: self.error_type(),
                field,
            }],
            force_logout,
        }
    }
}

/// One entry in the `errors` array of the response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    /// Human-readable message
    pub message: String,
    /// Stable machine-readable code
    pub code: &'static str,
    /// Broad classification (`field`, `auth`, `http`, `global`)
    pub error_type: &'static str,
    /// Offending field, for field-validation errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Uniform error response body: `{ "errors": [...] }`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    /// All errors raised by the request (currently always one)
    pub errors: Vec<ErrorDetail>,
    /// Present on auth failures that should end the session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_logout: Option<bool>,
}

/// Convenience `Result` type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_validation_envelope_carries_field_and_code() {
        let err = Error::FieldValidation {
            field: "identifier".to_string(),
            message: "may not be blank".to_string(),
        };
        assert_eq!(err.status(), 400);
        let envelope = err.envelope();
        assert_eq!(envelope.errors.len(), 1);
        assert_eq!(envelope.errors[0].code, "field_validation");
        assert_eq!(envelope.errors[0].field.as_deref(), Some("identifier"));
    }

    #[test]
    fn permission_error_surfaces_force_logout() {
        let err = Error::Permission {
            message: "session expired".to_string(),
            force_logout: true,
        };
        assert_eq!(err.status(), 403);
        assert_eq!(err.envelope().force_logout, Some(true));
    }

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            Error::NotFound {
                kind: "account",
                id: 4
            }
            .status(),
            404
        );
        assert_eq!(
            Error::Conflict {
                message: String::new()
            }
            .status(),
            400
        );
        assert_eq!(
            Error::Integrity {
                message: String::new()
            }
            .code(),
            "integrity"
        );
    }
}
