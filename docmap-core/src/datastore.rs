//! Main interface for persisting mapped entities.
//!
//! A [`Datastore`] binds a [`Mapper`] to a storage backend. It saves, loads, counts and
//! deletes entities, provisions indexes and capped collections from metadata, and acts
//! as the [`ReferenceResolver`] for lazy references.
//!
//! Loading an entity first prefetches the targets of its eager references, level by
//! level and batched per collection, so that the synchronous mapper can decode the whole
//! graph from memory. Reference cycles are cut with lazy placeholders.
//!
//! # Example
//!
//! ```ignore
//! use docmap::{datastore::Datastore, memory::InMemoryStore};
//!
//! let datastore = Datastore::new(InMemoryStore::new());
//! datastore.ensure_indexes::<User>().await?;
//!
//! let mut user = User { name: "Alice".into(), ..Default::default() };
//! let key = datastore.save(&mut user).await?;
//! let loaded: Option<User> = datastore.get_by_key(&key).await?;
//! ```

use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, spec::BinarySubtype, Binary, Bson, Document};
use futures::TryStreamExt;
use serde::Serialize;

use crate::{
    backend::{FindRequest, StoreBackend},
    error::{DocMapError, DocMapResult, MappingFailure},
    key::{compare_ids, Key},
    mapper::{LoadedReferences, Mapped, Mapper},
    metadata::{ClassMetadata, FieldShape, IndexSpec, MappedRef, ID_KEY},
    query::{Query, QueryValue},
    reference::ReferenceResolver,
};

/// Index options as understood by the storage backend.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    unique: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    drop_dups: bool,
}

/// Options of a capped collection.
#[derive(Debug, Serialize)]
struct CappedOptions {
    capped: bool,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<u64>,
}

fn to_document<S: Serialize>(value: &S) -> DocMapResult<Document> {
    match bson::ser::serialize_to_bson(value)? {
        Bson::Document(document) => Ok(document),
        other => Err(DocMapError::Serialization(format!(
            "expected options to serialize to a document, got {other}"
        ))),
    }
}

/// A store of mapped entities bound to a specific backend implementation.
///
/// # Type Parameters
///
/// * `B` - The backend implementation type
#[derive(Debug)]
pub struct Datastore<B> {
    backend: B,
    mapper: Arc<Mapper>,
}

impl<B: StoreBackend> Datastore<B> {
    /// Creates a datastore with a default mapper.
    pub fn new(backend: B) -> Self {
        Self::with_mapper(backend, Mapper::new())
    }

    /// Creates a datastore with a configured mapper.
    pub fn with_mapper(backend: B, mapper: Mapper) -> Self {
        Self {
            backend,
            mapper: Arc::new(mapper),
        }
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Registers a type's metadata ahead of use, so that
    /// [`ensure_all_indexes`](Self::ensure_all_indexes) covers it.
    pub fn map<T: Mapped>(&self) -> &Self {
        self.mapper.describe::<T>();
        self
    }

    /// Starts a query over all entities of type `T`.
    pub fn find<T: Mapped>(&self) -> Query<'_, T, B> {
        Query::new(self)
    }

    /// Starts a query with one string condition, such as `find_by("age >", 18)`.
    ///
    /// # Errors
    ///
    /// Fails like [`Query::filter`].
    pub fn find_by<T: Mapped, V: QueryValue>(
        &self,
        condition: &str,
        value: V,
    ) -> DocMapResult<Query<'_, T, B>> {
        let mut query = Query::new(self);
        query.filter(condition, value)?;
        Ok(query)
    }

    /// Loads the entity with the given id, converted like the type's id field.
    pub async fn get<T: Mapped, I: QueryValue>(&self, id: I) -> DocMapResult<Option<T>> {
        self.mapper.describe::<T>().id_field()?;
        self.find_by::<T, I>(ID_KEY, id)?.get().await
    }

    /// Loads the entity a key points to.
    ///
    /// Returns `None` when no such document exists or when the key names another
    /// collection than `T`'s.
    pub async fn get_by_key<T: Mapped>(&self, key: &Key) -> DocMapResult<Option<T>> {
        let class = self.mapper.describe::<T>();
        class.id_field()?;

        let kind = key.resolve_kind(self.mapper.metadata());
        if kind != class.collection {
            log::warn!(
                "{key} does not belong to {}, which is stored in '{}'",
                class.name,
                class.collection
            );
            return Ok(None);
        }

        let request = FindRequest::new(doc! { ID_KEY: key.id().clone() }).with_limit(1);
        match self
            .backend
            .find(&class.collection, request)
            .await?
            .try_next()
            .await?
        {
            Some(document) => self.materialize(document).await.map(Some),
            None => Ok(None),
        }
    }

    /// Saves an entity, replacing any stored document with the same id.
    ///
    /// An entity without an id value gets a generated one: a new [`ObjectId`] for
    /// `ObjectId` ids, its hex form for `String` ids and a random UUID for UUID ids.
    /// The generated id is written back only once the document has been stored.
    /// Pre-persist hooks run before conversion and post-persist hooks after the write.
    ///
    /// # Errors
    ///
    /// Fails if the type has no single id field, if an id cannot be generated for its
    /// type, if a referenced entity is unsaved, or if the backend rejects the write.
    pub async fn save<T: Mapped>(&self, entity: &mut T) -> DocMapResult<Key> {
        let collection = self.mapper.describe::<T>().collection.clone();
        self.save_in(&collection, entity).await
    }

    /// Saves an entity into the named collection instead of its own.
    ///
    /// The returned key names that collection.
    pub async fn save_in<T: Mapped>(&self, collection: &str, entity: &mut T) -> DocMapResult<Key> {
        let class = self.mapper.describe::<T>();
        let id_field = class.id_field()?;

        entity.pre_persist();
        let generated = match self.mapper.id_of(entity)? {
            Some(_) => None,
            None => Some(
                generate_id(id_field.declared_type)
                    .ok_or_else(|| MappingFailure::MissingIdValue(class.name.to_string()))?,
            ),
        };

        let mut document = self.mapper.to_document(entity)?;
        if let Some(id) = &generated {
            document.remove(ID_KEY);
            let mut with_id = doc! { ID_KEY: id.clone() };
            with_id.extend(document);
            document = with_id;
        }

        log::trace!("saving {} into '{collection}'", class.name);
        self.backend
            .insert_or_replace(collection, document.clone())
            .await?;
        if let Some(id) = generated {
            self.mapper.assign_id(entity, id)?;
        }
        entity.post_persist(&document);

        let key = self.mapper.key_of(entity)?;
        if collection == class.collection {
            Ok(key)
        } else {
            Ok(Key::new(collection, key.id().clone()))
        }
    }

    /// Saves entities in order, stopping at the first failure.
    pub async fn save_all<T: Mapped>(&self, entities: &mut [T]) -> DocMapResult<Vec<Key>> {
        let mut keys = Vec::with_capacity(entities.len());
        for entity in entities.iter_mut() {
            keys.push(self.save(entity).await?);
        }
        Ok(keys)
    }

    /// Deletes a saved entity, returning the number of removed documents.
    pub async fn delete<T: Mapped>(&self, entity: &T) -> DocMapResult<u64> {
        let class = self.mapper.describe::<T>();
        let id = self
            .mapper
            .id_of(entity)?
            .ok_or_else(|| MappingFailure::MissingIdValue(class.name.to_string()))?;

        self.backend
            .remove(&class.collection, doc! { ID_KEY: id })
            .await
    }

    /// Deletes the entity of type `T` with the given id.
    pub async fn delete_by_id<T: Mapped, I: QueryValue>(&self, id: I) -> DocMapResult<u64> {
        self.mapper.describe::<T>().id_field()?;
        let query = self.find_by::<T, I>(ID_KEY, id)?;
        self.delete_matching(&query).await
    }

    /// Deletes every entity matching a query's filter.
    pub async fn delete_matching<T: Mapped>(&self, query: &Query<'_, T, B>) -> DocMapResult<u64> {
        self.backend
            .remove(query.collection(), query.filter_document().clone())
            .await
    }

    /// Counts all stored entities of type `T`.
    pub async fn count<T: Mapped>(&self) -> DocMapResult<u64> {
        self.find::<T>().count_all().await
    }

    /// Starts a query over entities of type `T` stored in the named collection.
    pub fn find_in<T: Mapped>(&self, collection: impl Into<String>) -> Query<'_, T, B> {
        Query::in_collection(self, self.mapper.describe::<T>(), collection.into())
    }

    /// Loads the entity of type `T` with the given id from the named collection.
    pub async fn get_in<T: Mapped, I: QueryValue>(
        &self,
        collection: &str,
        id: I,
    ) -> DocMapResult<Option<T>> {
        self.mapper.describe::<T>().id_field()?;
        let mut query = self.find_in::<T>(collection);
        query.filter(ID_KEY, id)?;
        query.get().await
    }

    /// Deletes the document with the given id, converted like `T`'s id field, from
    /// the named collection.
    pub async fn delete_in<T: Mapped, I: QueryValue>(&self, collection: &str, id: I) -> DocMapResult<u64> {
        self.mapper.describe::<T>().id_field()?;
        let mut query = self.find_in::<T>(collection);
        query.filter(ID_KEY, id)?;
        self.delete_matching(&query).await
    }

    /// Counts all documents in the named collection.
    pub async fn count_in(&self, collection: &str) -> DocMapResult<u64> {
        self.backend.count(collection, Document::new()).await
    }

    /// The key of a saved entity.
    pub fn key_of<T: Mapped>(&self, entity: &T) -> DocMapResult<Key> {
        Ok(self.mapper.key_of(entity)?)
    }

    /// Creates the indexes declared on `T` and on the types it embeds.
    pub async fn ensure_indexes<T: Mapped>(&self) -> DocMapResult<()> {
        let class = self.mapper.describe::<T>();
        self.ensure_indexes_for(&class).await
    }

    /// Creates the indexes of every entity type described so far.
    pub async fn ensure_all_indexes(&self) -> DocMapResult<()> {
        for class in self.mapper.metadata().mapped_classes() {
            if class.id_field().is_ok() {
                self.ensure_indexes_for(&class).await?;
            }
        }
        Ok(())
    }

    async fn ensure_indexes_for(&self, class: &ClassMetadata) -> DocMapResult<()> {
        let mut indexes = Vec::new();
        self.collect_indexes(class, "", &mut Vec::new(), &mut indexes);

        for (path, spec) in indexes {
            let options = to_document(&IndexOptions {
                name: spec.name.as_deref(),
                unique: spec.unique,
                drop_dups: spec.drop_dups,
            })?;
            log::debug!("ensuring index on {}.{path}", class.collection);
            self.backend
                .create_index(
                    &class.collection,
                    doc! { path: spec.direction.as_bson() },
                    options,
                )
                .await?;
        }
        Ok(())
    }

    // Embedded types contribute their indexes under the embedding field's path.
    fn collect_indexes(
        &self,
        class: &ClassMetadata,
        prefix: &str,
        visiting: &mut Vec<MappedRef>,
        out: &mut Vec<(String, IndexSpec)>,
    ) {
        for field in class.fields() {
            let path = format!("{prefix}{}", field.stored_name);
            if let Some(index) = &field.index {
                out.push((path.clone(), index.clone()));
            }

            let targets = match field.shape.terminal() {
                FieldShape::Embedded(target) => vec![*target],
                FieldShape::Polymorphic { variants, .. } => variants.clone(),
                _ => Vec::new(),
            };
            for target in targets {
                if visiting.contains(&target) {
                    continue;
                }
                visiting.push(target);
                let embedded = self.mapper.metadata().describe_ref(&target);
                self.collect_indexes(&embedded, &format!("{path}."), visiting, out);
                visiting.pop();
            }
        }
    }

    /// Creates `T`'s collection as a capped collection if it declares one.
    pub async fn ensure_caps<T: Mapped>(&self) -> DocMapResult<()> {
        let class = self.mapper.describe::<T>();
        let Some(capped) = class.capped else {
            return Ok(());
        };

        let options = to_document(&CappedOptions {
            capped: true,
            size: capped.size,
            max: capped.max,
        })?;
        log::debug!("ensuring capped collection '{}'", class.collection);
        self.backend
            .ensure_collection(&class.collection, options)
            .await
    }

    /// Lists all collections in the store.
    pub async fn list_collections(&self) -> DocMapResult<Vec<String>> {
        self.backend.list_collections().await
    }

    /// Drops the collection of `T` with all its documents.
    pub async fn drop_collection<T: Mapped>(&self) -> DocMapResult<()> {
        let class = self.mapper.describe::<T>();
        self.backend.drop_collection(&class.collection).await
    }

    /// Reconstructs an entity from a stored document, loading its eager references.
    pub async fn materialize<T: Mapped>(&self, document: Document) -> DocMapResult<T> {
        let collection = self.mapper.describe::<T>().collection.clone();
        self.materialize_from(&collection, document).await
    }

    /// Like [`materialize`](Self::materialize), for a document read from `collection`.
    pub async fn materialize_from<T: Mapped>(&self, collection: &str, document: Document) -> DocMapResult<T> {
        let class = self.mapper.describe::<T>();
        let refs = self.prefetch(&class, &document).await?;

        if let Some(id) = document.get(ID_KEY) {
            refs.enter(&Key::new(collection, id.clone()));
        }
        Ok(self.mapper.from_document_with(&document, &refs)?)
    }

    /// Fetches the documents reachable through eager references, one level at a time.
    async fn prefetch(&self, class: &ClassMetadata, document: &Document) -> DocMapResult<LoadedReferences> {
        let mut refs = LoadedReferences::default();
        let mut pending = Vec::new();
        self.mapper.collect_eager_references(class, document, &mut pending);

        while !pending.is_empty() {
            let mut batches: HashMap<String, Vec<(Key, MappedRef)>> = HashMap::new();
            for (key, target) in pending.drain(..) {
                if refs.is_fetched(&key) {
                    continue;
                }
                let collection = key.kind().unwrap_or_default().to_string();
                let batch = batches.entry(collection).or_default();
                if !batch.iter().any(|(queued, _)| queued == &key) {
                    batch.push((key, target));
                }
            }

            let mut next = Vec::new();
            for (collection, batch) in batches {
                let ids = batch.iter().map(|(key, _)| key.id().clone()).collect::<Vec<_>>();
                log::debug!("prefetching {} references from '{collection}'", ids.len());

                let request = FindRequest::new(doc! { ID_KEY: { "$in": ids } });
                let found: Vec<Document> = self
                    .backend
                    .find(&collection, request)
                    .await?
                    .try_collect()
                    .await?;

                for (key, target) in batch {
                    let document = found
                        .iter()
                        .find(|candidate| {
                            candidate
                                .get(ID_KEY)
                                .is_some_and(|id| compare_ids(id, key.id()) == Ordering::Equal)
                        })
                        .cloned();
                    if let Some(document) = &document {
                        let class = self.mapper.metadata().describe_ref(&target);
                        self.mapper.collect_eager_references(&class, document, &mut next);
                    }
                    refs.insert(key, document);
                }
            }
            pending = next;
        }

        Ok(refs)
    }

    /// Cleanly shuts down the underlying backend.
    pub async fn shutdown(self) -> DocMapResult<()> {
        self.backend.shutdown().await
    }
}

fn generate_id(declared_type: &str) -> Option<Bson> {
    let declared_type = declared_type.rsplit("::").next().unwrap_or(declared_type);
    let declared_type = declared_type.trim_end_matches('>');

    if declared_type.ends_with("ObjectId") {
        Some(Bson::ObjectId(ObjectId::new()))
    } else if declared_type.ends_with("Uuid") {
        Some(Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: bson::Uuid::new().bytes().to_vec(),
        }))
    } else if declared_type.ends_with("String") {
        Some(Bson::String(ObjectId::new().to_hex()))
    } else {
        None
    }
}

#[async_trait]
impl<B: StoreBackend> ReferenceResolver for Datastore<B> {
    async fn load<T: Mapped>(&self, key: &Key) -> DocMapResult<Option<T>> {
        self.get_by_key(key).await
    }
}

#[cfg(test)]
mod tests {
    use docmap_macros::Mapped;

    use super::*;
    use crate::{reference::Reference, testing::NullBackend};

    #[derive(Debug, Default, Mapped)]
    struct Tagged {
        #[docmap(id)]
        id: Option<String>,
        #[docmap(indexed(unique, name = "label_idx"))]
        label: String,
    }

    #[derive(Debug, Default, Mapped)]
    struct Counter {
        #[docmap(id)]
        id: Option<i64>,
    }

    #[test]
    fn generates_ids_by_declared_type() {
        assert!(matches!(generate_id("core::option::Option<bson::oid::ObjectId>"), Some(Bson::ObjectId(_))));
        assert!(matches!(generate_id("core::option::Option<uuid::Uuid>"), Some(Bson::Binary(_))));
        assert!(matches!(generate_id("alloc::string::String"), Some(Bson::String(_))));
        assert_eq!(generate_id("core::option::Option<i64>"), None);
    }

    #[tokio::test]
    async fn save_assigns_generated_string_ids() {
        let datastore = Datastore::new(NullBackend);
        let mut tagged = Tagged {
            label: "a".into(),
            ..Default::default()
        };

        let key = datastore.save(&mut tagged).await.unwrap();
        let id = tagged.id.clone().unwrap();
        assert_eq!(id.len(), 24);
        assert_eq!(key, Key::new("Tagged", id));
    }

    #[tokio::test]
    async fn save_without_a_generatable_id_fails() {
        let datastore = Datastore::new(NullBackend);
        let err = datastore.save(&mut Counter::default()).await.unwrap_err();

        assert!(matches!(err, DocMapError::Mapping(MappingFailure::MissingIdValue(_))));
    }

    #[derive(Debug, Default, Mapped)]
    struct Draft {
        #[docmap(id)]
        id: Option<String>,
        cover: Option<Reference<Tagged>>,
    }

    #[tokio::test]
    async fn failed_saves_leave_the_id_unassigned() {
        let datastore = Datastore::new(NullBackend);
        let mut draft = Draft {
            id: None,
            cover: Some(Reference::new(Tagged::default())),
        };

        let err = datastore.save(&mut draft).await.unwrap_err();
        assert!(matches!(err, DocMapError::Mapping(MappingFailure::UnsavedReference { .. })));
        assert_eq!(draft.id, None);

        draft.cover = None;
        datastore.save(&mut draft).await.unwrap();
        assert!(draft.id.is_some());
    }

    #[test]
    fn index_options_omit_defaults() {
        let options = to_document(&IndexOptions {
            name: Some("label_idx"),
            unique: true,
            drop_dups: false,
        })
        .unwrap();

        assert_eq!(options, doc! { "name": "label_idx", "unique": true });
    }
}
