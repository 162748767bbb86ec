//! Object/document mapping.
//!
//! The [`Mapper`] walks a [`Mapped`] value field by field, in declaration order,
//! producing a [`Document`]; and rebuilds values from documents the same way.
//!
//! - The id field is stored under [`ID_KEY`].
//! - Plain fields go through the converter registry. Absent values are not
//!   stored unless the field is marked `store_null`.
//! - Embedded values become nested documents. Polymorphic values additionally
//!   record their concrete type under the discriminator key.
//! - References are stored as `{"$ref": collection, "$id": id}` pairs.
//!
//! On load, fields missing from the document keep their default value and keys
//! without a matching field are ignored.

use std::{
    any::TypeId,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use bson::{doc, Bson, Document};
use parking_lot::Mutex;

use crate::{
    codec::FieldCodec,
    convert::{incompatible, ConverterRegistry, TypeConverter},
    error::{DocMapResult, MappingFailure, MappingResult},
    key::Key,
    metadata::{
        ClassDescriptor, ClassMetadata, FieldMetadata, FieldRole, FieldShape, MappedRef,
        MetadataRegistry, ID_KEY,
    },
};

/// A type that maps to and from a document.
///
/// Implemented with `#[derive(Mapped)]`:
///
/// ```ignore
/// #[derive(Debug, Default, Mapped)]
/// #[docmap(collection = "posts", post_load = "loaded")]
/// pub struct Post {
///     #[docmap(id)]
///     pub id: Option<ObjectId>,
///     #[docmap(rename = "t", indexed)]
///     pub title: String,
///     pub author: Option<Reference<User>>,
///     #[docmap(reference(lazy))]
///     pub editor: Option<Reference<User>>,
///     #[docmap(transient)]
///     pub dirty: bool,
/// }
/// ```
pub trait Mapped: Default + Send + Sync + 'static {
    /// The static field table for this type.
    fn descriptor() -> ClassDescriptor;

    /// Writes each persistable field through the writer.
    fn write_fields(&self, writer: &mut FieldWriter<'_>) -> MappingResult<()>;

    /// Reads each persistable field present in the document.
    fn read_fields(&mut self, reader: &FieldReader<'_>) -> MappingResult<()>;

    /// Invoked before the entity is converted for saving.
    fn pre_persist(&mut self) {}

    /// Invoked after the entity has been saved, with the stored document.
    fn post_persist(&mut self, _document: &Document) {}

    /// Invoked after the entity has been loaded, with the raw document.
    fn post_load(&mut self, _document: &Document) {}
}

/// Mapper configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MapperOptions {
    /// Key recording the concrete type of polymorphic embedded values.
    pub discriminator_key: String,
    /// Store embedded values that encode to an empty document.
    pub store_empty_embedded: bool,
    /// Validate query field paths against metadata.
    pub validate_queries: bool,
}

impl Default for MapperOptions {
    fn default() -> Self {
        Self {
            discriminator_key: "className".to_string(),
            store_empty_embedded: false,
            validate_queries: true,
        }
    }
}

/// Builder for [`Mapper`] instances.
#[derive(Debug, Default)]
pub struct MapperBuilder {
    options: MapperOptions,
    converters: ConverterRegistry,
}

impl MapperBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_discriminator_key(mut self, key: impl Into<String>) -> Self {
        self.options.discriminator_key = key.into();
        self
    }

    pub fn with_store_empty_embedded(mut self, store: bool) -> Self {
        self.options.store_empty_embedded = store;
        self
    }

    pub fn with_query_validation(mut self, validate: bool) -> Self {
        self.options.validate_queries = validate;
        self
    }

    /// Registers a converter for values of type `T`.
    pub fn converter<T, C>(mut self, converter: C) -> Self
    where
        T: 'static,
        C: TypeConverter<T>,
    {
        self.converters.register::<T, C>(converter);
        self
    }

    pub fn build(self) -> Mapper {
        Mapper {
            options: self.options,
            converters: self.converters,
            metadata: MetadataRegistry::new(),
        }
    }
}

/// Converts mapped values to documents and back.
#[derive(Debug, Default)]
pub struct Mapper {
    options: MapperOptions,
    converters: ConverterRegistry,
    metadata: MetadataRegistry,
}

impl Mapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> MapperBuilder {
        MapperBuilder::new()
    }

    pub fn options(&self) -> &MapperOptions {
        &self.options
    }

    pub fn converters(&self) -> &ConverterRegistry {
        &self.converters
    }

    pub fn metadata(&self) -> &MetadataRegistry {
        &self.metadata
    }

    pub fn describe<T: Mapped>(&self) -> Arc<ClassMetadata> {
        self.metadata.describe::<T>()
    }

    /// Serializes an entity or embedded value to a document.
    pub fn to_document<T: Mapped>(&self, value: &T) -> MappingResult<Document> {
        let metadata = self.describe::<T>();
        let mut writer = FieldWriter::new(self, &metadata, false);
        value.write_fields(&mut writer)?;
        Ok(writer.finish())
    }

    /// Reconstructs a value without prefetched references; eager reference
    /// fields come back as unresolved placeholders.
    pub fn from_document<T: Mapped>(&self, document: &Document) -> MappingResult<T> {
        self.from_document_with(document, &LoadedReferences::default())
    }

    /// Reconstructs a value, materializing eager references from `refs`.
    pub fn from_document_with<T: Mapped>(
        &self,
        document: &Document,
        refs: &LoadedReferences,
    ) -> MappingResult<T> {
        let metadata = self.describe::<T>();
        let mut value = T::default();
        value.read_fields(&FieldReader {
            mapper: self,
            class: &metadata,
            document,
            refs,
        })?;
        value.post_load(document);
        Ok(value)
    }

    /// Renders a value as JSON through its document form.
    pub fn to_json<T: Mapped>(&self, value: &T) -> DocMapResult<serde_json::Value> {
        let document = self.to_document(value)?;
        Ok(serde_json::to_value(&document)?)
    }

    /// The stored id of an entity, or `None` if it has not been assigned.
    ///
    /// # Errors
    ///
    /// Fails if the type does not declare exactly one id field.
    pub fn id_of<T: Mapped>(&self, entity: &T) -> MappingResult<Option<Bson>> {
        let metadata = self.describe::<T>();
        metadata.id_field()?;

        let mut writer = FieldWriter::new(self, &metadata, true);
        entity.write_fields(&mut writer)?;
        Ok(writer
            .finish()
            .remove(ID_KEY)
            .filter(|id| !matches!(id, Bson::Null)))
    }

    /// The key identifying a saved entity.
    pub fn key_of<T: Mapped>(&self, entity: &T) -> MappingResult<Key> {
        let id = self
            .id_of(entity)?
            .ok_or_else(|| MappingFailure::MissingIdValue(self.describe::<T>().name.to_string()))?;
        let key = Key::of::<T>(id);
        key.resolve_kind(&self.metadata);
        Ok(key)
    }

    /// Writes a stored id back into an entity's id field.
    pub fn assign_id<T: Mapped>(&self, entity: &mut T, id: Bson) -> MappingResult<()> {
        let metadata = self.describe::<T>();
        metadata.id_field()?;

        let document = doc! { ID_KEY: id };
        entity.read_fields(&FieldReader {
            mapper: self,
            class: &metadata,
            document: &document,
            refs: &LoadedReferences::default(),
        })
    }

    /// Encodes a nested value as a document.
    ///
    /// Against a field referencing `T`, such as a query operand, the value
    /// stands for its key and is encoded as a stored reference instead.
    pub fn encode_embedded<T: Mapped>(&self, value: &T, field: &FieldMetadata) -> MappingResult<Bson> {
        match field.shape.terminal() {
            FieldShape::Reference(target) if target.id() == TypeId::of::<T>() => {
                let key = self.key_of(value).map_err(|err| match err {
                    MappingFailure::MissingIdValue(type_name) => MappingFailure::UnsavedReference {
                        field: field.name.clone(),
                        type_name,
                    },
                    other => other,
                })?;
                Ok(Bson::Document(key.to_storage_reference(&self.metadata)))
            }
            _ => self.to_document(value).map(Bson::Document),
        }
    }

    /// Encodes one variant of a polymorphic value, recording its canonical name.
    pub fn encode_polymorphic<T: Mapped>(&self, value: &T, _field: &FieldMetadata) -> MappingResult<Bson> {
        let mut document = self.to_document(value)?;
        document.insert(
            self.options.discriminator_key.clone(),
            self.describe::<T>().name,
        );
        Ok(Bson::Document(document))
    }

    pub fn decode_embedded<T: Mapped>(&self, value: Bson, ctx: &DecodeContext<'_>) -> MappingResult<T> {
        match value {
            Bson::Document(document) => {
                if let Ok(discriminator) = document.get_str(&self.options.discriminator_key) {
                    let expected = self.describe::<T>().name;
                    if discriminator != expected {
                        log::warn!(
                            "field '{}' is stored as {} but declared as {}; reading it as {}",
                            ctx.field.name,
                            discriminator,
                            expected,
                            expected
                        );
                    }
                }
                self.from_document_with(&document, ctx.refs)
            }
            other => Err(incompatible(ctx.field, "an embedded document", &other)),
        }
    }

    /// Picks the variant of a polymorphic value to decode.
    ///
    /// The discriminator decides when present. Without one, a single candidate
    /// is used; several candidates are ambiguous.
    pub fn select_variant(
        &self,
        value: &Bson,
        variants: &[MappedRef],
        field: &FieldMetadata,
    ) -> MappingResult<TypeId> {
        let Bson::Document(document) = value else {
            return Err(incompatible(field, "an embedded document", value));
        };

        match document.get(&self.options.discriminator_key) {
            Some(Bson::String(discriminator)) => variants
                .iter()
                .find(|variant| {
                    self.metadata.describe_ref(variant).name == discriminator
                        || variant.name() == discriminator
                })
                .map(MappedRef::id)
                .ok_or_else(|| MappingFailure::UnknownDiscriminator {
                    field: field.name.clone(),
                    discriminator: discriminator.clone(),
                }),
            _ if variants.len() == 1 => Ok(variants[0].id()),
            _ => Err(MappingFailure::AmbiguousPolymorphic {
                field: field.name.clone(),
                type_name: field.declared_type.to_string(),
                candidates: variants
                    .iter()
                    .map(|variant| self.metadata.describe_ref(variant).name)
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    /// Collects the keys of eager references reachable from a document without
    /// crossing another reference.
    pub fn collect_eager_references(
        &self,
        class: &ClassMetadata,
        document: &Document,
        out: &mut Vec<(Key, MappedRef)>,
    ) {
        for field in class.fields() {
            if let Some(value) = document.get(&field.stored_name) {
                self.collect_from_value(field, &field.shape, value, out);
            }
        }
    }

    fn collect_from_value(
        &self,
        field: &FieldMetadata,
        shape: &FieldShape,
        value: &Bson,
        out: &mut Vec<(Key, MappedRef)>,
    ) {
        match (shape, value) {
            (FieldShape::List(inner), Bson::Array(items)) => {
                for item in items {
                    self.collect_from_value(field, inner, item, out);
                }
            }
            (FieldShape::List(inner), single) => self.collect_from_value(field, inner, single, out),
            (FieldShape::Map(inner), Bson::Document(entries)) => {
                for entry in entries.values() {
                    self.collect_from_value(field, inner, entry, out);
                }
            }
            (FieldShape::Reference(target), Bson::Document(reference)) if !field.lazy => {
                if let Ok(key) = Key::from_storage_reference(reference) {
                    out.push((key, *target));
                }
            }
            (FieldShape::Embedded(target), Bson::Document(embedded)) => {
                let class = self.metadata.describe_ref(target);
                self.collect_eager_references(&class, embedded, out);
            }
            (FieldShape::Polymorphic { variants, .. }, Bson::Document(embedded)) => {
                let target = self
                    .select_variant(value, variants, field)
                    .ok()
                    .and_then(|id| variants.iter().find(|variant| variant.id() == id));
                if let Some(target) = target {
                    let class = self.metadata.describe_ref(target);
                    self.collect_eager_references(&class, embedded, out);
                }
            }
            _ => {}
        }
    }
}

/// Context handed to [`FieldCodec::encode`].
pub struct EncodeContext<'a> {
    pub mapper: &'a Mapper,
    pub field: &'a FieldMetadata,
}

/// Context handed to [`FieldCodec::decode`].
pub struct DecodeContext<'a> {
    pub mapper: &'a Mapper,
    pub field: &'a FieldMetadata,
    pub refs: &'a LoadedReferences,
}

/// Accumulates the document of one mapped value.
pub struct FieldWriter<'a> {
    mapper: &'a Mapper,
    class: &'a ClassMetadata,
    document: Document,
    id_only: bool,
}

impl<'a> FieldWriter<'a> {
    fn new(mapper: &'a Mapper, class: &'a ClassMetadata, id_only: bool) -> Self {
        Self {
            mapper,
            class,
            document: Document::new(),
            id_only,
        }
    }

    fn field(&self, name: &str) -> MappingResult<&'a FieldMetadata> {
        let class: &'a ClassMetadata = self.class;
        class
            .fields()
            .iter()
            .find(|field| field.name == name)
            .ok_or_else(|| MappingFailure::FieldNotFound {
                path: name.to_string(),
                segment: name.to_string(),
                type_name: class.name.to_string(),
            })
    }

    fn skips(&self, field: &FieldMetadata) -> bool {
        self.id_only && !field.is_id()
    }

    pub fn write<V: FieldCodec>(&mut self, name: &str, value: &V) -> MappingResult<()> {
        let field = self.field(name)?;
        if self.skips(field) {
            return Ok(());
        }
        if value.is_null() {
            if field.store_null {
                self.document.insert(field.stored_name.clone(), Bson::Null);
            }
            return Ok(());
        }

        let encoded = value.encode(&EncodeContext {
            mapper: self.mapper,
            field,
        })?;
        self.insert(field, encoded);
        Ok(())
    }

    /// Writes a field through the converter registered for its exact type.
    pub fn write_converted<V: Send + Sync + 'static>(&mut self, name: &str, value: &V) -> MappingResult<()> {
        let field = self.field(name)?;
        if self.skips(field) {
            return Ok(());
        }

        let encoded = self.mapper.converters().encode_custom(value, field)?;
        self.insert(field, encoded);
        Ok(())
    }

    fn insert(&mut self, field: &FieldMetadata, value: Bson) {
        let empty_embedded = field.role == FieldRole::Embedded
            && matches!(&value, Bson::Document(document) if document.is_empty());
        if empty_embedded && !self.mapper.options().store_empty_embedded {
            return;
        }
        if matches!(value, Bson::Null) && !field.store_null {
            return;
        }
        self.document.insert(field.stored_name.clone(), value);
    }

    fn finish(self) -> Document {
        let mut document = self.document;
        match document.remove(ID_KEY) {
            Some(id) => {
                let mut ordered = doc! { ID_KEY: id };
                ordered.extend(document);
                ordered
            }
            None => document,
        }
    }
}

/// Reads fields of one mapped value from its document.
pub struct FieldReader<'a> {
    mapper: &'a Mapper,
    class: &'a ClassMetadata,
    document: &'a Document,
    refs: &'a LoadedReferences,
}

impl<'a> FieldReader<'a> {
    fn field(&self, name: &str) -> MappingResult<&'a FieldMetadata> {
        let class: &'a ClassMetadata = self.class;
        class
            .fields()
            .iter()
            .find(|field| field.name == name)
            .ok_or_else(|| MappingFailure::FieldNotFound {
                path: name.to_string(),
                segment: name.to_string(),
                type_name: class.name.to_string(),
            })
    }

    fn stored(&self, field: &FieldMetadata) -> Option<Bson> {
        match self.document.get(&field.stored_name) {
            None | Some(Bson::Null) => None,
            Some(value) => Some(value.clone()),
        }
    }

    /// Decodes a field, or returns `None` if the document does not hold it.
    pub fn read<V: FieldCodec>(&self, name: &str) -> MappingResult<Option<V>> {
        let field = self.field(name)?;
        match self.stored(field) {
            Some(value) => V::decode(
                value,
                &DecodeContext {
                    mapper: self.mapper,
                    field,
                    refs: self.refs,
                },
            )
            .map(Some),
            None => Ok(None),
        }
    }

    /// Decodes a field through the converter registered for its exact type.
    pub fn read_converted<V: Send + Sync + 'static>(&self, name: &str) -> MappingResult<Option<V>> {
        let field = self.field(name)?;
        match self.stored(field) {
            Some(value) => self.mapper.converters().decode_custom(value, field).map(Some),
            None => Ok(None),
        }
    }
}

/// Outcome of looking a key up in [`LoadedReferences`].
#[derive(Debug)]
pub enum ReferenceLookup<'a> {
    /// The referenced document was fetched.
    Found(&'a Document),
    /// The key was looked up and no document exists.
    Missing,
    /// The key was never looked up.
    NotFetched,
}

/// Documents prefetched for eager references, used during one load.
#[derive(Debug, Default)]
pub struct LoadedReferences {
    documents: HashMap<Key, Document>,
    fetched: HashSet<Key>,
    active: Mutex<Vec<Key>>,
}

impl LoadedReferences {
    /// Records the result of fetching a key.
    pub fn insert(&mut self, key: Key, document: Option<Document>) {
        if let Some(document) = document {
            self.documents.insert(key.clone(), document);
        }
        self.fetched.insert(key);
    }

    pub fn is_fetched(&self, key: &Key) -> bool {
        self.fetched.contains(key)
    }

    pub fn lookup(&self, key: &Key) -> ReferenceLookup<'_> {
        match self.documents.get(key) {
            Some(document) => ReferenceLookup::Found(document),
            None if self.fetched.contains(key) => ReferenceLookup::Missing,
            None => ReferenceLookup::NotFetched,
        }
    }

    /// Marks a key as being decoded. Returns `false` if it already is, which
    /// means the references form a cycle.
    pub fn enter(&self, key: &Key) -> bool {
        let mut active = self.active.lock();
        if active.contains(key) {
            return false;
        }
        active.push(key.clone());
        true
    }

    pub fn leave(&self, key: &Key) {
        let mut active = self.active.lock();
        if let Some(position) = active.iter().rposition(|entry| entry == key) {
            active.remove(position);
        }
    }
}
