//! Error types for termscope.
//!
//! The four request-scoped kinds (`Validation`, `Conflict`, `NotFound`,
//! `Forbidden`) carry enough context for a caller to compose a localized
//! message through a [`Translator`](crate::i18n::Translator). Everything else
//! is an infrastructure failure.

use std::fmt;

use thiserror::Error;

use crate::i18n::Translator;

/// Result type alias using termscope's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Terminology,
    Dimension,
    /// The resolution request context itself (organization, topK).
    Context,
}

impl EntityKind {
    /// Namespace used when building translation keys.
    pub fn i18n_namespace(&self) -> &'static str {
        match self {
            Self::Terminology => "i18n_terminology",
            Self::Dimension => "i18n_dimension",
            Self::Context => "i18n_context",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminology => write!(f, "terminology"),
            Self::Dimension => write!(f, "dimension"),
            Self::Context => write!(f, "context"),
        }
    }
}

/// Which validation rule rejected the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationRule {
    /// Blank after trimming, or an empty list the scope requires.
    Required,
    /// Longer than the column allows.
    TooLong,
    /// Field may not change on a system entry.
    Immutable,
    /// Numeric input outside its accepted range.
    OutOfRange,
}

/// Why a write collided with existing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Another entry already uses the value.
    Duplicate,
    /// The entry is still referenced elsewhere.
    InUse,
}

/// Why a mutation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForbiddenReason {
    SystemEntryDelete,
}

impl fmt::Display for ForbiddenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SystemEntryDelete => write!(f, "system entries cannot be deleted"),
        }
    }
}

/// Core error type for termscope operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing required input.
    #[error("Invalid {entity} {field}: {message}")]
    Validation {
        entity: EntityKind,
        field: &'static str,
        rule: ValidationRule,
        message: String,
    },

    /// Uniqueness violation, or the entry is still referenced.
    #[error("Conflict on {entity} {field} '{value}'")]
    Conflict {
        entity: EntityKind,
        field: &'static str,
        value: String,
        reason: ConflictReason,
    },

    /// Referenced id absent in the organization scope.
    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: i64 },

    /// Mutation attempted on a protected entry.
    #[error("Forbidden: {entity} {id}: {reason}")]
    Forbidden {
        entity: EntityKind,
        id: i64,
        reason: ForbiddenReason,
    },

    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn required(entity: EntityKind, field: &'static str) -> Self {
        Error::Validation {
            entity,
            field,
            rule: ValidationRule::Required,
            message: format!("{} is required", field),
        }
    }

    pub fn too_long(entity: EntityKind, field: &'static str, max: usize) -> Self {
        Error::Validation {
            entity,
            field,
            rule: ValidationRule::TooLong,
            message: format!("{} must be {} characters or less", field, max),
        }
    }

    pub fn out_of_range(entity: EntityKind, field: &'static str, message: impl Into<String>) -> Self {
        Error::Validation {
            entity,
            field,
            rule: ValidationRule::OutOfRange,
            message: message.into(),
        }
    }

    pub fn not_found(entity: EntityKind, id: i64) -> Self {
        Error::NotFound { entity, id }
    }

    pub fn duplicate(entity: EntityKind, field: &'static str, value: impl Into<String>) -> Self {
        Error::Conflict {
            entity,
            field,
            value: value.into(),
            reason: ConflictReason::Duplicate,
        }
    }

    /// True for the four request-scoped kinds a caller can act on.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation { .. }
                | Error::Conflict { .. }
                | Error::NotFound { .. }
                | Error::Forbidden { .. }
        )
    }

    /// Translation key for the human-facing message.
    ///
    /// Keys follow `i18n_<entity>.<rule>`, e.g. `i18n_dimension.code_exists`.
    pub fn message_key(&self) -> String {
        match self {
            Error::Validation {
                entity,
                field,
                rule,
                ..
            } => {
                let ns = entity.i18n_namespace();
                match rule {
                    ValidationRule::Required => format!("{}.{}_required", ns, field),
                    ValidationRule::TooLong => format!("{}.{}_too_long", ns, field),
                    ValidationRule::Immutable => format!("{}.system_cannot_modify_{}", ns, field),
                    ValidationRule::OutOfRange => format!("{}.{}_out_of_range", ns, field),
                }
            }
            Error::Conflict {
                entity,
                field,
                reason,
                ..
            } => match reason {
                ConflictReason::Duplicate => format!("{}.{}_exists", entity.i18n_namespace(), field),
                ConflictReason::InUse => format!("{}.in_use", entity.i18n_namespace()),
            },
            Error::NotFound { entity, .. } => format!("{}.not_found", entity.i18n_namespace()),
            Error::Forbidden { entity, reason, .. } => match reason {
                ForbiddenReason::SystemEntryDelete => {
                    format!("{}.system_cannot_delete", entity.i18n_namespace())
                }
            },
            _ => "i18n_common.internal_error".to_string(),
        }
    }

    /// Compose the human-facing message through the translation collaborator.
    pub fn localized(&self, translator: &dyn Translator) -> String {
        translator.translate(&self.message_key())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
