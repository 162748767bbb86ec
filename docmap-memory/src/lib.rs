//! In-memory document storage backend for docmap.
//!
//! This crate provides a thread-safe, in-memory implementation of the `StoreBackend` trait.
//! It uses async-aware read-write locks for concurrent access and is ideal for development
//! and testing.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using async-aware RwLock
//! - **Filter evaluation** - Comparison, membership, pattern and logical operators over dotted paths
//! - **Sorting and projection** - Multi-key sort documents and include/exclude projections
//! - **Index and cap bookkeeping** - Unique indexes and capped collection limits are enforced
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
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = InMemoryStore::builder().build().await?;
//!     let datastore = Datastore::new(backend);
//!
//!     let mut user = User { name: "Alice".to_string(), ..Default::default() };
//!     datastore.save(&mut user).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod evaluator;
pub mod store;

pub use store::{InMemoryStore, InMemoryStoreBuilder, IndexRecord};
