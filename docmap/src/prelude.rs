//! Convenient re-exports of commonly used types from docmap.
//!
//! Import this prelude module to quickly access the most frequently used types,
//! traits and derive macros without needing to import from multiple sub-modules:
//!
//! ```ignore
//! use docmap::prelude::*;
//! ```

pub use async_trait::async_trait;

pub use docmap_core::{
    backend::{FindRequest, StoreBackend, StoreBackendBuilder},
    codec::{FieldCodec, Symbol},
    convert::TypeConverter,
    datastore::Datastore,
    error::{DocMapError, DocMapResult, MappingFailure, MappingResult},
    key::Key,
    mapper::{Mapped, Mapper, MapperBuilder},
    page::{Page, PaginationParams},
    query::{Converted, FieldCriteria, FilterOperator, Query, SortDirection},
    reference::{LazyReference, Reference, ReferenceResolver},
};
pub use docmap_macros::{Mapped, Polymorphic, Symbol};
