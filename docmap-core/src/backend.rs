//! Storage backend abstraction.
//!
//! This module defines the storage collaborator the mapper and query builder talk to. A
//! backend exposes named collections of BSON documents and knows nothing about mapped
//! types: every filter, projection and sort it receives is already a plain document.
//!
//! # Overview
//!
//! The [`StoreBackend`] trait provides a unified async interface for document lookup,
//! counting, upserts, removal, index creation and collection provisioning.
//! Implementations are required to be thread-safe (`Send + Sync`) and support concurrent
//! access.
//!
//! # Traits
//!
//! - [`StoreBackend`]: The core trait for storage backends
//! - [`StoreBackendBuilder`]: Factory trait for creating backend instances
//!
//! # Examples
//!
//! ```ignore
//! use docmap::backend::{FindRequest, StoreBackend};
//! use bson::doc;
//! use futures::TryStreamExt;
//!
//! let backend = MyBackendImpl::new();
//!
//! backend.insert_or_replace("users", doc! { "_id": 1, "name": "Alice" }).await?;
//!
//! let request = FindRequest::new(doc! { "name": "Alice" }).with_limit(10);
//! let found: Vec<_> = backend.find("users", request).await?.try_collect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use bson::Document;
use futures::stream::BoxStream;

use crate::error::DocMapResult;

/// A lazily consumed sequence of stored documents.
pub type DocumentCursor = BoxStream<'static, DocMapResult<Document>>;

/// Parameters of a collection lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindRequest {
    /// Documents must match this filter.
    pub filter: Document,
    /// Fields to include or exclude, if any.
    pub projection: Option<Document>,
    /// Ordered sort keys, `1` for ascending and `-1` for descending.
    pub sort: Option<Document>,
    /// Number of matching documents to skip.
    pub skip: u64,
    /// Maximum number of documents to return.
    pub limit: Option<u64>,
}

impl FindRequest {
    pub fn new(filter: Document) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn with_projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Abstract interface for document storage backends.
///
/// Implementers of this trait provide concrete storage strategies for documents, from
/// simple in-memory stores to a MongoDB deployment. The trait covers exactly what the
/// mapping layer consumes: lookups, counts, upserts, removal and collection
/// administration.
///
/// # Thread Safety
///
/// All implementations must be thread-safe and support concurrent access from multiple
/// async tasks. The exact concurrency model is implementation-specific but should be
/// documented by the implementer.
///
/// # Timeouts and Retries
///
/// The mapping layer applies no timeout or retry policy of its own. Errors returned by a
/// backend are propagated to the caller unchanged.
///
/// # Error Handling
///
/// Operations return [`DocMapResult<T>`](crate::error::DocMapResult). Storage failures
/// are reported as [`DocMapError::Backend`](crate::error::DocMapError::Backend) unless a
/// more specific variant applies.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Finds the documents of a collection matching a request.
    ///
    /// # Arguments
    ///
    /// * `collection` - The name of the collection to search. A missing collection is empty.
    /// * `request` - Filter, projection, sort, skip and limit to apply
    ///
    /// # Returns
    ///
    /// Returns a stream of matching documents in sort order, or a
    /// [`DocMapError`](crate::error::DocMapError) if the lookup could not be started.
    async fn find(&self, collection: &str, request: FindRequest) -> DocMapResult<DocumentCursor>;

    /// Counts the documents of a collection matching a filter.
    ///
    /// # Arguments
    ///
    /// * `collection` - The name of the collection
    /// * `filter` - The filter documents must match
    ///
    /// # Returns
    ///
    /// Returns the number of matching documents, or a
    /// [`DocMapError`](crate::error::DocMapError) on failure.
    async fn count(&self, collection: &str, filter: Document) -> DocMapResult<u64>;

    /// Inserts a document, replacing any stored document with the same `_id`.
    ///
    /// # Arguments
    ///
    /// * `collection` - The name of the collection. Created automatically if it doesn't exist.
    /// * `document` - The document to store. It must carry an `_id`.
    ///
    /// # Returns
    ///
    /// Returns `Ok(())` on success, or a [`DocMapError`](crate::error::DocMapError) on
    /// failure, including unique index violations.
    async fn insert_or_replace(&self, collection: &str, document: Document) -> DocMapResult<()>;

    /// Removes every document of a collection matching a filter.
    ///
    /// # Arguments
    ///
    /// * `collection` - The name of the collection
    /// * `filter` - The filter documents must match
    ///
    /// # Returns
    ///
    /// Returns the number of removed documents, or a
    /// [`DocMapError`](crate::error::DocMapError) on failure.
    async fn remove(&self, collection: &str, filter: Document) -> DocMapResult<u64>;

    /// Creates an index on a collection.
    ///
    /// # Arguments
    ///
    /// * `collection` - The name of the collection
    /// * `keys` - Indexed paths mapped to `1` (ascending) or `-1` (descending)
    /// * `options` - Index options such as `unique`, `name` and `dropDups`
    ///
    /// # Returns
    ///
    /// Returns `Ok(())` on success, or a [`DocMapError`](crate::error::DocMapError) on failure.
    ///
    /// # Note
    ///
    /// Creating an index that already exists is not an error.
    async fn create_index(
        &self,
        collection: &str,
        keys: Document,
        options: Document,
    ) -> DocMapResult<()>;

    /// Creates a collection with options unless it already exists.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the collection
    /// * `options` - Collection options such as `capped`, `size` and `max`
    ///
    /// # Returns
    ///
    /// Returns `Ok(())` on success, or a [`DocMapError`](crate::error::DocMapError) on failure.
    async fn ensure_collection(&self, name: &str, options: Document) -> DocMapResult<()>;

    /// Lists the names of all collections in the store.
    async fn list_collections(&self) -> DocMapResult<Vec<String>>;

    /// Drops a collection and all of its documents.
    ///
    /// # Warning
    ///
    /// This operation is irreversible.
    async fn drop_collection(&self, name: &str) -> DocMapResult<()>;

    /// Cleanly shuts down the backend, releasing all resources.
    ///
    /// The default implementation is a no-op, but backends with external connections
    /// should override this.
    async fn shutdown(self) -> DocMapResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

#[async_trait]
impl<B> StoreBackend for &B
where
    B: StoreBackend,
{
    async fn find(&self, collection: &str, request: FindRequest) -> DocMapResult<DocumentCursor> {
        (*self).find(collection, request).await
    }

    async fn count(&self, collection: &str, filter: Document) -> DocMapResult<u64> {
        (*self).count(collection, filter).await
    }

    async fn insert_or_replace(&self, collection: &str, document: Document) -> DocMapResult<()> {
        (*self).insert_or_replace(collection, document).await
    }

    async fn remove(&self, collection: &str, filter: Document) -> DocMapResult<u64> {
        (*self).remove(collection, filter).await
    }

    async fn create_index(
        &self,
        collection: &str,
        keys: Document,
        options: Document,
    ) -> DocMapResult<()> {
        (*self).create_index(collection, keys, options).await
    }

    async fn ensure_collection(&self, name: &str, options: Document) -> DocMapResult<()> {
        (*self).ensure_collection(name, options).await
    }

    async fn list_collections(&self) -> DocMapResult<Vec<String>> {
        (*self).list_collections().await
    }

    async fn drop_collection(&self, name: &str) -> DocMapResult<()> {
        (*self).drop_collection(name).await
    }
}

#[async_trait]
impl<B> StoreBackend for Arc<B>
where
    B: StoreBackend,
{
    async fn find(&self, collection: &str, request: FindRequest) -> DocMapResult<DocumentCursor> {
        self.as_ref().find(collection, request).await
    }

    async fn count(&self, collection: &str, filter: Document) -> DocMapResult<u64> {
        self.as_ref().count(collection, filter).await
    }

    async fn insert_or_replace(&self, collection: &str, document: Document) -> DocMapResult<()> {
        self.as_ref().insert_or_replace(collection, document).await
    }

    async fn remove(&self, collection: &str, filter: Document) -> DocMapResult<u64> {
        self.as_ref().remove(collection, filter).await
    }

    async fn create_index(
        &self,
        collection: &str,
        keys: Document,
        options: Document,
    ) -> DocMapResult<()> {
        self.as_ref().create_index(collection, keys, options).await
    }

    async fn ensure_collection(&self, name: &str, options: Document) -> DocMapResult<()> {
        self.as_ref().ensure_collection(name, options).await
    }

    async fn list_collections(&self) -> DocMapResult<Vec<String>> {
        self.as_ref().list_collections().await
    }

    async fn drop_collection(&self, name: &str) -> DocMapResult<()> {
        self.as_ref().drop_collection(name).await
    }
}

#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> DocMapResult<Self::Backend>;
}
