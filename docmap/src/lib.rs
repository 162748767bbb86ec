//! Main docmap crate providing a unified interface for object-document mapping.
//!
//! This crate is the primary entry point for users of the docmap framework.
//! It re-exports the core types, the derive macros and the storage backends.
//!
//! # Features
//!
//! - **Derived mappings** - `#[derive(Mapped)]` describes how a struct is stored
//! - **Embedded, polymorphic and symbolic values** - Nested documents with discriminators and enums stored by name
//! - **Keys and references** - Eagerly or lazily loaded pointers between entities
//! - **Validated queries** - Filters on field paths checked against the mapping metadata
//! - **Multiple backends** - In-memory and MongoDB storage behind one trait
//!
//! # Quick Start
//!
//! ```ignore
//! use docmap::{prelude::*, memory::InMemoryStore};
//!
//! #[derive(Debug, Default, Mapped)]
//! #[docmap(collection = "users")]
//! pub struct User {
//!     #[docmap(id)]
//!     pub id: Option<String>,
//!     pub name: String,
//!     pub address: Option<Address>,
//! }
//!
//! #[derive(Debug, Default, Mapped)]
//! pub struct Address {
//!     pub city: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> DocMapResult<()> {
//!     let datastore = Datastore::new(InMemoryStore::builder().build().await?);
//!
//!     let mut user = User {
//!         name: "Alice".to_string(),
//!         address: Some(Address { city: "Lisbon".to_string() }),
//!         ..Default::default()
//!     };
//!     let key = datastore.save(&mut user).await?;
//!
//!     let found = datastore
//!         .find::<User>()
//!         .filter("address.city", "Lisbon")?
//!         .as_list()
//!         .await?;
//!     println!("{key}: {found:?}");
//!
//!     datastore.shutdown().await
//! }
//! ```
//!
//! # References
//!
//! Fields of type [`Reference<T>`](reference::Reference) store a key to another entity.
//! Eager references are loaded together with their owner; fields marked
//! `#[docmap(reference(lazy))]` load on first [`resolve`](reference::Reference::resolve).
//!
//! ```ignore
//! #[derive(Debug, Default, Mapped)]
//! pub struct Post {
//!     #[docmap(id)]
//!     pub id: Option<String>,
//!     pub author: Option<Reference<User>>,
//!     #[docmap(reference(lazy))]
//!     pub editor: Option<Reference<User>>,
//! }
//!
//! let post = datastore.get::<Post, _>(id).await?.unwrap();
//! let editor = post.editor.unwrap().resolve(&datastore).await?;
//! ```
//!
//! Only [`Reference<T>`](reference::Reference) and [`Key`](key::Key) fields, or
//! containers of them, may be declared `reference` or `lazy`:
//!
//! ```
//! use docmap::prelude::*;
//!
//! #[derive(Default, Mapped)]
//! struct User {
//!     #[docmap(id)]
//!     id: Option<String>,
//! }
//!
//! #[derive(Default, Mapped)]
//! struct Post {
//!     #[docmap(id)]
//!     id: Option<String>,
//!     #[docmap(lazy)]
//!     author: Option<Reference<User>>,
//!     #[docmap(reference)]
//!     related: Vec<Key>,
//! }
//! ```
//!
//! Declaring a plain mapped value as a reference is rejected at compile time:
//!
//! ```compile_fail
//! use docmap::prelude::*;
//!
//! #[derive(Default, Mapped)]
//! struct User {
//!     #[docmap(id)]
//!     id: Option<String>,
//! }
//!
//! #[derive(Default, Mapped)]
//! struct Post {
//!     #[docmap(id)]
//!     id: Option<String>,
//!     #[docmap(reference)]
//!     author: Option<User>,
//! }
//! ```
//!
//! # Backends
//!
//! - [`memory`] - Fast in-memory storage for development and testing
//! - [`mongodb`] - Persistent MongoDB backend (requires `mongodb` feature)

pub mod prelude;

pub use docmap_core::{
    backend, codec, convert, datastore, error, key, mapper, metadata, page, query, reference,
};
pub use docmap_macros::{Mapped, Polymorphic, Symbol};

// Re-export BSON types for convenience
pub use bson;

/// In-memory storage backend implementations.
pub mod memory {
    pub use docmap_memory::{InMemoryStore, InMemoryStoreBuilder, IndexRecord};
}

/// MongoDB storage backend implementations.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docmap_mongodb::{MongoDbStore, MongoDbStoreBuilder};
}
