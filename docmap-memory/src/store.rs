//! In-memory storage implementation for docmap.
//!
//! This module provides a simple backend that keeps every collection as a list of
//! BSON documents behind an async-safe read-write lock.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::{StreamExt, stream};
use mea::rwlock::RwLock;

use docmap_core::{
    backend::{DocumentCursor, FindRequest, StoreBackend, StoreBackendBuilder},
    error::{DocMapError, DocMapResult},
    metadata::ID_KEY,
};

use crate::evaluator;

type StoreMap = HashMap<String, CollectionState>;

/// An index creation request recorded by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    /// Indexed paths mapped to their direction.
    pub keys: Document,
    /// Options such as `unique` and `name`.
    pub options: Document,
}

impl IndexRecord {
    fn is_unique(&self) -> bool {
        self.options.get_bool("unique").unwrap_or(false)
    }

    // The values a document contributes to this index, `Null` for missing paths.
    fn entry(&self, document: &Document) -> Vec<Bson> {
        self.keys
            .keys()
            .map(|path| {
                evaluator::lookup(document, path)
                    .first()
                    .map(|value| (*value).clone())
                    .unwrap_or(Bson::Null)
            })
            .collect()
    }

    fn same_entry(left: &[Bson], right: &[Bson]) -> bool {
        left.len() == right.len()
            && left
                .iter()
                .zip(right)
                .all(|(left, right)| evaluator::equal(left, right))
    }
}

#[derive(Debug, Default)]
struct CollectionState {
    documents: Vec<Document>,
    indexes: Vec<IndexRecord>,
    options: Document,
}

impl CollectionState {
    fn position_of(&self, id: &Bson) -> Option<usize> {
        self.documents.iter().position(|document| {
            document
                .get(ID_KEY)
                .is_some_and(|stored| evaluator::equal(stored, id))
        })
    }

    fn check_unique(&self, collection: &str, document: &Document, id: &Bson) -> DocMapResult<()> {
        for index in self.indexes.iter().filter(|index| index.is_unique()) {
            let entry = index.entry(document);
            let duplicate = self.documents.iter().any(|stored| {
                !stored
                    .get(ID_KEY)
                    .is_some_and(|stored_id| evaluator::equal(stored_id, id))
                    && IndexRecord::same_entry(&index.entry(stored), &entry)
            });

            if duplicate {
                return Err(DocMapError::Backend(format!(
                    "duplicate key for index {} in collection {collection}",
                    index.keys
                )));
            }
        }

        Ok(())
    }

    // Oldest documents go first once a capped collection exceeds its `max`.
    fn enforce_cap(&mut self) {
        if !self.options.get_bool("capped").unwrap_or(false) {
            return;
        }

        let max = match self.options.get("max") {
            Some(Bson::Int32(max)) => usize::try_from(*max).ok(),
            Some(Bson::Int64(max)) => usize::try_from(*max).ok(),
            _ => None,
        };

        if let Some(max) = max
            && self.documents.len() > max
        {
            let excess = self.documents.len() - max;
            log::trace!("evicting {excess} documents from a capped collection");
            self.documents.drain(..excess);
        }
    }
}

/// Thread-safe in-memory document storage backend.
///
/// This struct implements the [`StoreBackend`] trait on top of plain BSON documents.
/// Filters, sort documents and projections are evaluated by the [`evaluator`]
/// module; index and collection option requests are recorded, with unique indexes and
/// the `max` of capped collections enforced on writes.
///
/// # Thread Safety
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state, allowing
/// it to be safely shared across async tasks. Multiple clones of the same instance
/// share the same underlying data.
///
/// # Performance
///
/// Queries scan all documents in a collection. Indexes are not used for lookups.
///
/// # Example
///
/// ```ignore
/// use docmap_memory::InMemoryStore;
/// use docmap_core::backend::{FindRequest, StoreBackend};
/// use bson::doc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = InMemoryStore::new();
///
///     store.insert_or_replace("users", doc! { "_id": 1, "name": "Alice" }).await?;
///     assert_eq!(store.count("users", doc! { "name": "Alice" }).await?, 1);
///
///     Ok(())
/// }
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    /// The main storage map: collection name -> collection state
    store: Arc<RwLock<StoreMap>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory document store.
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(StoreMap::new())),
        }
    }

    /// Creates a builder for constructing an `InMemoryStore`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use docmap_memory::InMemoryStore;
    ///
    /// let store = InMemoryStore::builder().build().await.unwrap();
    /// ```
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }

    /// Returns the index requests recorded for a collection.
    pub async fn indexes(&self, collection: &str) -> Vec<IndexRecord> {
        self.store
            .read()
            .await
            .get(collection)
            .map(|state| state.indexes.clone())
            .unwrap_or_default()
    }

    /// Returns the options a collection was created with, if it exists.
    pub async fn collection_options(&self, collection: &str) -> Option<Document> {
        self.store
            .read()
            .await
            .get(collection)
            .map(|state| state.options.clone())
    }

    fn filter_documents(documents: &[Document], filter: &Document) -> DocMapResult<Vec<Document>> {
        let mut matched = Vec::new();
        for document in documents {
            if evaluator::matches(document, filter)? {
                matched.push(document.clone());
            }
        }
        Ok(matched)
    }
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn find(&self, collection: &str, request: FindRequest) -> DocMapResult<DocumentCursor> {
        let store = self.store.read().await;
        let Some(state) = store.get(collection) else {
            return Ok(stream::empty().boxed());
        };

        let mut documents = Self::filter_documents(&state.documents, &request.filter)?;
        drop(store);

        if let Some(sort) = &request.sort {
            evaluator::sort_documents(&mut documents, sort);
        }

        let skip = usize::try_from(request.skip).unwrap_or(usize::MAX);
        let limit = request
            .limit
            .and_then(|limit| usize::try_from(limit).ok())
            .unwrap_or(usize::MAX);

        let documents = documents
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|document| match &request.projection {
                Some(projection) => evaluator::project(document, projection),
                None => document,
            })
            .map(Ok)
            .collect::<Vec<_>>();

        Ok(stream::iter(documents).boxed())
    }

    async fn count(&self, collection: &str, filter: Document) -> DocMapResult<u64> {
        let store = self.store.read().await;
        let Some(state) = store.get(collection) else {
            return Ok(0);
        };

        let mut count = 0;
        for document in &state.documents {
            if evaluator::matches(document, &filter)? {
                count += 1;
            }
        }

        Ok(count)
    }

    async fn insert_or_replace(&self, collection: &str, document: Document) -> DocMapResult<()> {
        let id = document.get(ID_KEY).cloned().ok_or_else(|| {
            DocMapError::InvalidDocument(format!(
                "documents stored in {collection} must carry an {ID_KEY}"
            ))
        })?;

        let mut store = self.store.write().await;
        let state = store.entry(collection.to_string()).or_default();

        state.check_unique(collection, &document, &id)?;

        match state.position_of(&id) {
            Some(position) => state.documents[position] = document,
            None => {
                state.documents.push(document);
                state.enforce_cap();
            }
        }

        Ok(())
    }

    async fn remove(&self, collection: &str, filter: Document) -> DocMapResult<u64> {
        let mut store = self.store.write().await;
        let Some(state) = store.get_mut(collection) else {
            return Ok(0);
        };

        let mut matched = Vec::with_capacity(state.documents.len());
        for document in &state.documents {
            matched.push(evaluator::matches(document, &filter)?);
        }

        let before = state.documents.len();
        let mut matched = matched.into_iter();
        state
            .documents
            .retain(|_| !matched.next().unwrap_or(false));
        let removed = (before - state.documents.len()) as u64;

        Ok(removed)
    }

    async fn create_index(
        &self,
        collection: &str,
        keys: Document,
        options: Document,
    ) -> DocMapResult<()> {
        let mut store = self.store.write().await;
        let state = store.entry(collection.to_string()).or_default();

        if state.indexes.iter().any(|index| index.keys == keys) {
            return Ok(());
        }

        let index = IndexRecord { keys, options };
        if index.is_unique() {
            let entries = state
                .documents
                .iter()
                .map(|document| index.entry(document))
                .collect::<Vec<_>>();
            let duplicated = entries.iter().enumerate().any(|(position, entry)| {
                entries[position + 1..]
                    .iter()
                    .any(|other| IndexRecord::same_entry(entry, other))
            });
            if duplicated {
                return Err(DocMapError::Backend(format!(
                    "cannot create unique index {} on {collection}: duplicate values exist",
                    index.keys
                )));
            }
        }

        log::debug!("created index {} on {collection}", index.keys);
        state.indexes.push(index);
        Ok(())
    }

    async fn ensure_collection(&self, name: &str, options: Document) -> DocMapResult<()> {
        let mut store = self.store.write().await;
        if !store.contains_key(name) {
            store.insert(
                name.to_string(),
                CollectionState {
                    options,
                    ..CollectionState::default()
                },
            );
        }

        Ok(())
    }

    async fn list_collections(&self) -> DocMapResult<Vec<String>> {
        let mut names = self
            .store
            .read()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();

        Ok(names)
    }

    async fn drop_collection(&self, name: &str) -> DocMapResult<()> {
        self.store.write().await.remove(name);
        Ok(())
    }
}

/// Builder for constructing [`InMemoryStore`] instances.
///
/// # Example
///
/// ```ignore
/// use docmap_memory::InMemoryStore;
/// use docmap_core::backend::StoreBackendBuilder;
///
/// #[tokio::main]
/// async fn main() {
///     let store = InMemoryStore::builder().build().await.unwrap();
/// }
/// ```
#[derive(Default)]
pub struct InMemoryStoreBuilder;

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    /// Builds and returns a new [`InMemoryStore`] instance.
    async fn build(self) -> DocMapResult<Self::Backend> {
        Ok(InMemoryStore::new())
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use futures::TryStreamExt;

    use super::*;

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        for (id, name, age) in [(1, "Ada", 36), (2, "Bob", 25), (3, "Cy", 41)] {
            store
                .insert_or_replace("users", doc! { "_id": id, "name": name, "age": age })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn finds_with_sort_window_and_projection() {
        let store = seeded().await;
        let request = FindRequest::new(doc! { "age": { "$gt": 30 } })
            .with_sort(doc! { "age": -1 })
            .with_limit(1)
            .with_projection(doc! { "name": 1 });

        let found = store
            .find("users", request)
            .await
            .unwrap()
            .try_collect::<Vec<_>>()
            .await
            .unwrap();

        assert_eq!(found, vec![doc! { "_id": 3, "name": "Cy" }]);
    }

    #[tokio::test]
    async fn replaces_documents_with_the_same_id() {
        let store = seeded().await;
        store
            .insert_or_replace("users", doc! { "_id": 2, "name": "Bea", "age": 26 })
            .await
            .unwrap();

        assert_eq!(store.count("users", doc! {}).await.unwrap(), 3);
        assert_eq!(store.count("users", doc! { "name": "Bob" }).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn removes_matching_documents() {
        let store = seeded().await;
        let removed = store
            .remove("users", doc! { "age": { "$lt": 40 } })
            .await
            .unwrap();

        assert_eq!(removed, 2);
        assert_eq!(store.count("users", doc! {}).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn documents_without_ids_are_rejected() {
        let store = InMemoryStore::new();
        let result = store.insert_or_replace("users", doc! { "name": "Ada" }).await;
        assert!(matches!(result, Err(DocMapError::InvalidDocument(_))));
    }

    #[tokio::test]
    async fn unique_indexes_reject_duplicates() {
        let store = seeded().await;
        store
            .create_index("users", doc! { "name": 1 }, doc! { "unique": true })
            .await
            .unwrap();

        let result = store
            .insert_or_replace("users", doc! { "_id": 4, "name": "Ada" })
            .await;
        assert!(matches!(result, Err(DocMapError::Backend(_))));

        store
            .insert_or_replace("users", doc! { "_id": 1, "name": "Ada", "age": 37 })
            .await
            .unwrap();
        assert_eq!(store.indexes("users").await.len(), 1);
    }

    #[tokio::test]
    async fn capped_collections_evict_the_oldest_documents() {
        let store = InMemoryStore::new();
        store
            .ensure_collection("log", doc! { "capped": true, "size": 4096_i64, "max": 2_i64 })
            .await
            .unwrap();

        for id in 1..=3 {
            store.insert_or_replace("log", doc! { "_id": id }).await.unwrap();
        }

        let ids = store
            .find("log", FindRequest::new(doc! {}))
            .await
            .unwrap()
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(ids, vec![doc! { "_id": 2 }, doc! { "_id": 3 }]);
        assert_eq!(store.list_collections().await.unwrap(), vec!["log".to_string()]);
    }
}
