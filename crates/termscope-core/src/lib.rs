//! # termscope-core
//!
//! Core types, traits, and abstractions for termscope.
//!
//! This crate provides the domain model (terminology entries, dimension value
//! sets, query contexts), the scope gate, distance metrics, and the
//! collaborator traits the persistence and service crates implement.

pub mod defaults;
pub mod distance;
pub mod error;
pub mod i18n;
pub mod logging;
pub mod models;
pub mod scope;
pub mod traits;

// Re-export commonly used types at crate root
pub use distance::{CosineDistance, Distance, DistanceMetric, EuclideanDistance};
pub use error::{ConflictReason, EntityKind, Error, ForbiddenReason, Result, ValidationRule};
pub use i18n::{KeyTranslator, StaticTranslator, Translator};
pub use models::*;
pub use scope::{QueryContext, ScopeAssociations, ScopeBinding, ScopeMatcher};
pub use traits::*;
