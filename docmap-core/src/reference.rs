//! Relationships between entities.
//!
//! A reference field is declared as [`Reference<T>`]. It is either the entity
//! itself or a [`LazyReference`] placeholder holding only the target's [`Key`].
//! Placeholders come from lazy fields, from eager fields loaded without their
//! targets, and from eager reference cycles.
//!
//! A placeholder is resolved explicitly through a [`ReferenceResolver`] (the
//! [`Datastore`](crate::datastore::Datastore) is one). The first resolution
//! performs a single lookup by id; concurrent callers wait for it and observe
//! the same result. A lookup that finds nothing is remembered as empty.
//!
//! ```ignore
//! let post: Post = datastore.get(post_id).await?.unwrap();
//! if let Some(editor) = &post.editor {
//!     let user = editor.resolve(&datastore).await?;
//! }
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, OnceLock},
};

use async_trait::async_trait;
use bson::Bson;

use crate::{
    codec::FieldCodec,
    convert::incompatible,
    error::{DocMapResult, MappingFailure, MappingResult},
    key::Key,
    mapper::{DecodeContext, EncodeContext, Mapped, Mapper, ReferenceLookup},
    metadata::{FieldShape, MappedRef},
};

/// Loads entities by key.
#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    /// Loads the entity a key points to, or `None` if no such document exists.
    async fn load<T: Mapped>(&self, key: &Key) -> DocMapResult<Option<T>>;
}

/// Field types that may be declared `#[docmap(reference)]` or `#[docmap(lazy)]`.
///
/// The derive requires this bound on such fields, so that only references and
/// keys, possibly inside options, boxes, lists or string-keyed maps, can be
/// stored as pointers.
#[diagnostic::on_unimplemented(
    message = "`{Self}` cannot be declared as a reference",
    label = "not a `Reference<_>` or `Key`",
    note = "only `Reference<T>` and `Key` fields, or containers of them, may use `reference` or `lazy`"
)]
pub trait ReferenceField {}

impl<T: Mapped> ReferenceField for Reference<T> {}
impl ReferenceField for Key {}
impl<V: ReferenceField> ReferenceField for Option<V> {}
impl<V: ReferenceField> ReferenceField for Box<V> {}
impl<V: ReferenceField> ReferenceField for Arc<V> {}
impl<V: ReferenceField> ReferenceField for Vec<V> {}
impl<V: ReferenceField> ReferenceField for HashMap<String, V> {}
impl<V: ReferenceField> ReferenceField for BTreeMap<String, V> {}

/// A field pointing at another entity.
pub enum Reference<T> {
    /// The referenced entity itself.
    Entity(Arc<T>),
    /// A placeholder resolved on demand.
    Lazy(LazyReference<T>),
}

impl<T: Mapped> Reference<T> {
    pub fn new(entity: T) -> Self {
        Reference::Entity(Arc::new(entity))
    }

    pub fn lazy(key: Key) -> Self {
        Reference::Lazy(LazyReference::new(key))
    }

    /// The key of the referenced entity.
    ///
    /// # Errors
    ///
    /// Returns [`MappingFailure::MissingIdValue`] if the entity has not been saved.
    pub fn key(&self, mapper: &Mapper) -> MappingResult<Key> {
        match self {
            Reference::Entity(entity) => mapper.key_of(entity.as_ref()),
            Reference::Lazy(lazy) => Ok(lazy.key().clone()),
        }
    }

    /// Whether the target is available without a lookup.
    pub fn is_resolved(&self) -> bool {
        match self {
            Reference::Entity(_) => true,
            Reference::Lazy(lazy) => lazy.is_resolved(),
        }
    }

    /// The target if it is available without a lookup.
    pub fn get(&self) -> Option<Arc<T>> {
        match self {
            Reference::Entity(entity) => Some(entity.clone()),
            Reference::Lazy(lazy) => lazy.peek(),
        }
    }

    /// Returns the target, loading it on first access.
    pub async fn resolve<R: ReferenceResolver>(&self, resolver: &R) -> DocMapResult<Option<Arc<T>>> {
        match self {
            Reference::Entity(entity) => Ok(Some(entity.clone())),
            Reference::Lazy(lazy) => lazy.resolve(resolver).await,
        }
    }
}

impl<T> Clone for Reference<T> {
    fn clone(&self) -> Self {
        match self {
            Reference::Entity(entity) => Reference::Entity(entity.clone()),
            Reference::Lazy(lazy) => Reference::Lazy(lazy.clone()),
        }
    }
}

impl<T: PartialEq> PartialEq for Reference<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Reference::Entity(left), Reference::Entity(right)) => left == right,
            (Reference::Lazy(left), Reference::Lazy(right)) => left.key() == right.key(),
            _ => false,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Entity(entity) => f.debug_tuple("Entity").field(entity).finish(),
            Reference::Lazy(lazy) => f.debug_tuple("Lazy").field(&lazy.key).finish(),
        }
    }
}

impl<T: Mapped> FieldCodec for Reference<T> {
    fn shape() -> FieldShape {
        FieldShape::Reference(MappedRef::of::<T>())
    }

    fn encode(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        let key = self.key(ctx.mapper).map_err(|err| match err {
            MappingFailure::MissingIdValue(type_name) => MappingFailure::UnsavedReference {
                field: ctx.field.name.clone(),
                type_name,
            },
            other => other,
        })?;
        Ok(Bson::Document(key.to_storage_reference(ctx.mapper.metadata())))
    }

    fn decode(value: Bson, ctx: &DecodeContext<'_>) -> MappingResult<Self> {
        let Bson::Document(reference) = value else {
            return Err(incompatible(ctx.field, "a stored reference", &value));
        };
        let key = Key::from_storage_reference(&reference)?;
        if ctx.field.lazy {
            return Ok(Reference::lazy(key));
        }

        match ctx.refs.lookup(&key) {
            ReferenceLookup::Found(document) => {
                if !ctx.refs.enter(&key) {
                    return Ok(Reference::lazy(key));
                }
                let entity = ctx.mapper.from_document_with::<T>(document, ctx.refs);
                ctx.refs.leave(&key);
                Ok(Reference::Entity(Arc::new(entity?)))
            }
            ReferenceLookup::Missing => Err(MappingFailure::ReferenceNotFound(key.to_string())),
            ReferenceLookup::NotFetched => Ok(Reference::lazy(key)),
        }
    }
}

struct LazyState<T> {
    value: OnceLock<Option<Arc<T>>>,
    gate: mea::mutex::Mutex<()>,
}

/// An unresolved reference that loads its target at most once.
///
/// Clones share resolution state.
pub struct LazyReference<T> {
    key: Key,
    state: Arc<LazyState<T>>,
}

impl<T> Clone for LazyReference<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Mapped> LazyReference<T> {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            state: Arc::new(LazyState {
                value: OnceLock::new(),
                gate: mea::mutex::Mutex::new(()),
            }),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Whether a lookup has completed, including one that found nothing.
    pub fn is_resolved(&self) -> bool {
        self.state.value.get().is_some()
    }

    /// The loaded target, without triggering a lookup.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.state.value.get().cloned().flatten()
    }

    /// Loads the target on first call; later calls return the same result.
    ///
    /// # Errors
    ///
    /// Propagates resolver errors. A failed lookup leaves the reference
    /// unresolved so a later call may retry it.
    pub async fn resolve<R: ReferenceResolver>(&self, resolver: &R) -> DocMapResult<Option<Arc<T>>> {
        if let Some(value) = self.state.value.get() {
            return Ok(value.clone());
        }

        let _guard = self.state.gate.lock().await;
        if let Some(value) = self.state.value.get() {
            return Ok(value.clone());
        }

        log::trace!("resolving lazy reference {}", self.key);
        let loaded = resolver.load::<T>(&self.key).await?.map(Arc::new);
        if loaded.is_none() {
            log::debug!("lazy reference {} points to a missing document", self.key);
        }

        Ok(self.state.value.get_or_init(|| loaded).clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use docmap_macros::Mapped;
    use futures::future::join_all;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Default, Mapped)]
    #[docmap(collection = "users")]
    struct User {
        #[docmap(id)]
        id: i64,
        name: String,
    }

    #[derive(Default)]
    struct CountingResolver {
        lookups: AtomicUsize,
        exists: bool,
    }

    #[async_trait]
    impl ReferenceResolver for CountingResolver {
        async fn load<T: Mapped>(&self, key: &Key) -> DocMapResult<Option<T>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !self.exists {
                return Ok(None);
            }

            let mapper = Mapper::new();
            let document = bson::doc! { "_id": key.id().clone(), "name": "loaded" };
            Ok(Some(mapper.from_document(&document)?))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_access_performs_one_lookup() {
        let resolver = Arc::new(CountingResolver {
            exists: true,
            ..Default::default()
        });
        let reference = Reference::<User>::lazy(Key::new("users", 7_i64));

        let tasks = (0..8).map(|_| {
            let reference = reference.clone();
            let resolver = resolver.clone();
            tokio::spawn(async move { reference.resolve(resolver.as_ref()).await })
        });
        let results = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(resolver.lookups.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|user| Arc::ptr_eq(user, &results[0])));
        assert_eq!(results[0].id, 7);
        assert!(reference.is_resolved());
        assert_eq!(reference.get().unwrap().name, "loaded");
    }

    #[tokio::test]
    async fn missing_target_resolves_to_empty_once() {
        let resolver = CountingResolver::default();
        let reference = LazyReference::<User>::new(Key::new("users", 1_i64));

        assert!(!reference.is_resolved());
        assert!(reference.resolve(&resolver).await.unwrap().is_none());
        assert!(reference.resolve(&resolver).await.unwrap().is_none());
        assert!(reference.is_resolved());
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), 1);
    }

    fn require_reference_field<V: ReferenceField>() {}

    #[test]
    fn references_and_keys_in_containers_are_reference_fields() {
        require_reference_field::<Reference<User>>();
        require_reference_field::<Option<Reference<User>>>();
        require_reference_field::<Vec<Reference<User>>>();
        require_reference_field::<BTreeMap<String, Reference<User>>>();
        require_reference_field::<Option<Box<Key>>>();
        require_reference_field::<HashMap<String, Vec<Key>>>();
    }

    #[test]
    fn entity_references_are_resolved() {
        let reference = Reference::new(User {
            id: 3,
            name: "Ann".into(),
        });

        assert!(reference.is_resolved());
        assert_eq!(reference.key(&Mapper::new()).unwrap(), Key::new("users", 3_i64));
    }
}
