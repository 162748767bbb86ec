//! An object-document mapper over BSON document stores.
//!
//! This crate is the core of the docmap project and provides:
//!
//! - **Type converters** ([`convert`]) - Bidirectional conversion between Rust values and BSON primitives
//! - **Field codecs** ([`codec`]) - Per-field encoding rules for scalars, containers, symbols and keys
//! - **Class metadata** ([`metadata`]) - Immutable descriptions of how a type maps to a document shape
//! - **Object/document mapping** ([`mapper`]) - Walking object graphs to and from documents
//! - **Keys and references** ([`key`], [`reference`]) - Entity identity and eager/lazy relationships
//! - **Query building** ([`query`]) - Validated filter, sort and projection documents
//! - **Store backend abstraction** ([`backend`]) - Traits for implementing storage backends
//! - **Datastore** ([`datastore`]) - Saving, loading and deleting mapped entities
//! - **Error handling** ([`error`]) - Mapping failures and store errors
//! - **Pagination** ([`page`]) - Page results for queries
//!
//! # Example
//!
//! ```ignore
//! use docmap::{prelude::*, memory::InMemoryStore};
//! use bson::oid::ObjectId;
//!
//! #[derive(Debug, Default, Mapped)]
//! #[docmap(collection = "users")]
//! pub struct User {
//!     #[docmap(id)]
//!     pub id: Option<ObjectId>,
//!     #[docmap(indexed(unique))]
//!     pub email: String,
//!     pub age: i32,
//! }
//!
//! let datastore = Datastore::new(InMemoryStore::new());
//! let mut user = User { email: "alice@example.com".into(), age: 31, ..Default::default() };
//! let key = datastore.save(&mut user).await?;
//!
//! let adults = datastore
//!     .find::<User>()
//!     .filter("age >=", 18)?
//!     .order_by("email")?
//!     .as_list()
//!     .await?;
//! ```

// Derive output refers to `::docmap`, which must also resolve inside this crate.
#[allow(unused_extern_crates)]
extern crate self as docmap;

pub mod backend;
pub mod codec;
pub mod convert;
pub mod datastore;
pub mod error;
pub mod key;
pub mod mapper;
pub mod metadata;
pub mod page;
pub mod query;
pub mod reference;

#[cfg(test)]
pub(crate) mod testing;

pub use bson;
