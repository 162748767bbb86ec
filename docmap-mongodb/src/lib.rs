//! MongoDB backend implementation for docmap.
//!
//! This crate provides a MongoDB-based implementation of the `StoreBackend` trait.
//! Filter, sort and projection documents built by the docmap query builder are passed
//! to the driver unchanged, saves are upserts keyed by `_id`, and capped collections
//! are created through `create_collection`.
//!
//! To use this backend, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! docmap = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use docmap::{backend::StoreBackendBuilder, datastore::Datastore, mongodb::MongoDbStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoDbStore::builder("mongodb://localhost:27017", "my_database")
//!         .build()
//!         .await?;
//!     let datastore = Datastore::new(store);
//!
//!     Ok(())
//! }
//! ```

pub mod store;

pub use store::{MongoDbStore, MongoDbStoreBuilder};
