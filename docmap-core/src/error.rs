//! Error types and result types for mapping and store operations.
//!
//! Two layers of errors exist:
//!
//! - [`MappingFailure`] covers metadata, type and shape problems detected while
//!   describing types, converting values or validating query paths. These are
//!   always surfaced and never retried.
//! - [`DocMapError`] is the top-level error returned by datastore and query
//!   operations. It wraps mapping failures, malformed filter expressions and
//!   errors raised by the storage backend.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// A metadata, type or document shape problem.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingFailure {
    /// The type declares no id field but was used for an id-dependent operation.
    #[error("No field of {0} is marked as the id")]
    MissingId(String),
    /// The type declares more than one id field.
    #[error("{type_name} declares {count} id fields; exactly one is required")]
    DuplicateId { type_name: String, count: usize },
    /// A dotted field path could not be resolved against the metadata.
    #[error("The field '{segment}' could not be found in '{type_name}' while validating - {path}")]
    FieldNotFound {
        path: String,
        segment: String,
        type_name: String,
    },
    /// The stored value cannot be decoded into the declared type.
    #[error("Field '{field}' expected {expected} but found {found}")]
    IncompatibleShape {
        field: String,
        expected: String,
        found: String,
    },
    /// A polymorphic embedded value carries no discriminator and has several candidates.
    #[error("Cannot determine the concrete type of '{field}' ({type_name}); candidates are {candidates}")]
    AmbiguousPolymorphic {
        field: String,
        type_name: String,
        candidates: String,
    },
    /// A discriminator names a type that is not a variant of the declared type.
    #[error("Unknown discriminator '{discriminator}' for field '{field}'")]
    UnknownDiscriminator { field: String, discriminator: String },
    /// A reference points to an entity that has not been saved yet.
    #[error("Field '{field}' references an unsaved {type_name}; save it before referencing it")]
    UnsavedReference { field: String, type_name: String },
    /// An entity has no id value where one is required.
    #[error("{0} has no id value")]
    MissingIdValue(String),
    /// An eagerly loaded reference points to a document that does not exist.
    #[error("The referenced document {0} could not be found")]
    ReferenceNotFound(String),
    /// A field requires a user converter that has not been registered.
    #[error("No converter registered for {0}")]
    NoConverter(String),
    /// A stored symbolic value does not name a variant.
    #[error("'{value}' is not a variant of {type_name}")]
    UnknownSymbol { type_name: String, value: String },
    /// A converter rejected a value.
    #[error("Cannot convert field '{field}': {message}")]
    Conversion { field: String, message: String },
}

/// A specialized `Result` type for mapping operations.
pub type MappingResult<T> = Result<T, MappingFailure>;

/// Represents all possible errors raised by datastore and query operations.
#[derive(Error, Debug)]
pub enum DocMapError {
    /// A metadata, type or shape problem.
    #[error(transparent)]
    Mapping(#[from] MappingFailure),
    /// A malformed string condition or an unknown operator token.
    #[error("Illegal filter expression: {0}")]
    IllegalFilterExpression(String),
    /// Serialization/deserialization error when converting between document formats (BSON, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Error during store initialization or connection setup.
    #[error("Initialization error: {0}")]
    Initialization(String),
    /// The requested collection does not exist in the store.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
    /// The document violates backend constraints or has invalid structure.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// An error occurred in the underlying storage backend.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// A specialized `Result` type for datastore and query operations.
pub type DocMapResult<T> = Result<T, DocMapError>;

impl From<BsonError> for DocMapError {
    fn from(err: BsonError) -> Self {
        DocMapError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for DocMapError {
    fn from(err: SerdeJsonError) -> Self {
        DocMapError::Serialization(err.to_string())
    }
}
