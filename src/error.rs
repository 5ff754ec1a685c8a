//! Error types for ORM operations

use thiserror::Error;

/// Validation failure for a single model field.
///
/// Carries the offending field name so API layers can point the caller at
/// the exact input that was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationError {
    /// Logical field name that failed validation
    pub field: String,
    /// Human-readable failure description
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors that can occur during model, instance, and connector operations
#[derive(Debug, Error)]
pub enum OrmError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("method not implemented by connector: {0}")]
    NotImplemented(&'static str),

    #[error("missing required connector")]
    MissingConnector,

    #[error("instance has already been deleted")]
    AlreadyDeleted,

    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("action '{action}' is not enabled for model '{model}'")]
    ActionDisabled { model: String, action: String },

    #[error("operation '{operation}' is not supported by the '{connector}' connector")]
    NotSupported {
        connector: String,
        operation: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("{0}")]
    Message(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrmError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(ValidationError::new(field, message))
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    /// True when this error is a field validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// The offending field name, when this is a validation failure.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation(v) => Some(&v.field),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_carries_field() {
        let err = OrmError::validation("age", "required field value missing: age");
        assert!(err.is_validation());
        assert_eq!(err.field(), Some("age"));
        assert_eq!(err.to_string(), "required field value missing: age");
    }

    #[test]
    fn test_operational_error_has_no_field() {
        let err = OrmError::AlreadyDeleted;
        assert!(!err.is_validation());
        assert_eq!(err.field(), None);
        assert_eq!(err.to_string(), "instance has already been deleted");
    }

    #[test]
    fn test_validation_error_from() {
        let err: OrmError = ValidationError::new("name", "invalid field: name").into();
        assert_eq!(err.field(), Some("name"));
    }
}
