//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Merge and record-shape failures                │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  tally-db errors                                                       │
//! │  └── DbError          - Local Store failures                           │
//! │                                                                         │
//! │  tally-sync errors                                                     │
//! │  └── SyncError        - Network, auth, orchestration                   │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → SyncError → CLI         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::types::EntityKind;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised by pure domain logic.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The merge engine was handed two different record types.
    #[error("Cannot merge {local} with {remote}")]
    KindMismatch { local: EntityKind, remote: EntityKind },

    /// The merge engine was handed two different records.
    #[error("Cannot merge record {local} with record {remote}")]
    IdMismatch { local: String, remote: String },

    /// A field name does not exist on the record type.
    #[error("{kind} has no field '{field}'")]
    UnknownField { kind: EntityKind, field: String },

    /// A field value has the wrong shape for the field.
    ///
    /// ## When This Occurs
    /// - Resolving a conflict with a custom value of the wrong type
    /// - Setting `amount` to text that is not a decimal number
    #[error("Field '{field}' expects {expected}, got {actual}")]
    FieldType {
        field: String,
        expected: &'static str,
        actual: String,
    },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., bad currency code, bad color).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Too many items in a collection field.
    #[error("{field} can hold at most {max} items")]
    TooMany { field: String, max: usize },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::KindMismatch {
            local: EntityKind::Book,
            remote: EntityKind::Entry,
        };
        assert_eq!(err.to_string(), "Cannot merge book with entry");

        let err = CoreError::FieldType {
            field: "amount".into(),
            expected: "money",
            actual: "text".into(),
        };
        assert_eq!(err.to_string(), "Field 'amount' expects money, got text");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "name".to_string(),
        };
        assert_eq!(validation_err.to_string(), "name is required");
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
