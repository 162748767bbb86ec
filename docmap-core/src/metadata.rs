//! Class metadata: how a mapped type lays out as a document.
//!
//! Every mapped type provides a statically declared [`ClassDescriptor`] (normally
//! generated by `#[derive(Mapped)]`). The [`MetadataRegistry`] turns descriptors
//! into immutable [`ClassMetadata`] on first use and caches them for the lifetime
//! of the registry. Metadata is data only; it holds no references to instances.
//!
//! Dotted field paths used by queries are resolved one segment at a time with
//! [`MetadataRegistry::resolve_path`], following embedded and referenced types.

use std::{
    any::{type_name, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use parking_lot::RwLock;

use crate::{
    codec::FieldCodec,
    error::{MappingFailure, MappingResult},
    mapper::Mapped,
    query::SortDirection,
};

/// Reserved key holding the id of every entity document.
pub const ID_KEY: &str = "_id";

/// Identity of a Rust type.
#[derive(Debug, Clone, Copy)]
pub struct TypeRef {
    pub id: TypeId,
    pub name: &'static str,
}

impl TypeRef {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }
}

impl PartialEq for TypeRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeRef {}

/// A mapped type known only through its descriptor function.
///
/// This is how metadata points at embedded, referenced and polymorphic variant
/// types without requiring them to be described up front.
#[derive(Clone, Copy)]
pub struct MappedRef {
    pub type_ref: TypeRef,
    describe: fn() -> ClassDescriptor,
}

impl MappedRef {
    pub fn of<T: Mapped>() -> Self {
        Self {
            type_ref: TypeRef::of::<T>(),
            describe: T::descriptor,
        }
    }

    pub fn id(&self) -> TypeId {
        self.type_ref.id
    }

    pub fn name(&self) -> &'static str {
        self.type_ref.name
    }

    pub fn descriptor(&self) -> ClassDescriptor {
        (self.describe)()
    }
}

impl PartialEq for MappedRef {
    fn eq(&self, other: &Self) -> bool {
        self.type_ref == other.type_ref
    }
}

impl Eq for MappedRef {}

impl fmt::Debug for MappedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_ref.name)
    }
}

/// The structural shape of a field's declared type.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldShape {
    /// A value stored through the converter registry. Carries the type name.
    Scalar(&'static str),
    /// An enum-like value stored by its canonical name.
    Symbol(&'static str),
    /// A raw [`Key`](crate::key::Key).
    Key,
    /// A nested mapped type stored inline.
    Embedded(MappedRef),
    /// One of several mapped types stored inline with a discriminator.
    Polymorphic {
        name: &'static str,
        variants: Vec<MappedRef>,
    },
    /// A pointer to another entity stored as a key.
    Reference(MappedRef),
    /// A sequence of elements.
    List(Box<FieldShape>),
    /// A string-keyed map of values.
    Map(Box<FieldShape>),
}

impl FieldShape {
    /// The innermost element shape, looking through lists and maps.
    pub fn terminal(&self) -> &FieldShape {
        match self {
            FieldShape::List(inner) | FieldShape::Map(inner) => inner.terminal(),
            other => other,
        }
    }

    /// The element or value shape of a container.
    pub fn element(&self) -> Option<&FieldShape> {
        match self {
            FieldShape::List(inner) | FieldShape::Map(inner) => Some(inner),
            _ => None,
        }
    }

    /// A human readable name for the shape's type.
    pub fn label(&self) -> &'static str {
        match self {
            FieldShape::Scalar(name) | FieldShape::Symbol(name) => name,
            FieldShape::Key => "Key",
            FieldShape::Embedded(target) | FieldShape::Reference(target) => target.name(),
            FieldShape::Polymorphic { name, .. } => name,
            FieldShape::List(_) => "list",
            FieldShape::Map(_) => "map",
        }
    }

    /// Whether a value of shape `value` can be compared against a field of this shape.
    pub fn accepts(&self, value: &FieldShape) -> bool {
        match (self.terminal(), value.terminal()) {
            (FieldShape::Reference(target), FieldShape::Embedded(other))
            | (FieldShape::Reference(target), FieldShape::Reference(other)) => target == other,
            (FieldShape::Reference(_), FieldShape::Key) => true,
            (FieldShape::Polymorphic { variants, .. }, FieldShape::Embedded(other)) => {
                variants.contains(other)
            }
            (field, value) => field.label() == value.label(),
        }
    }
}

/// The role a field plays in its owner's document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    Plain,
    Id,
    Embedded,
    Reference,
}

/// Index requested on a single field.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub direction: SortDirection,
    pub unique: bool,
    pub name: Option<String>,
    pub drop_dups: bool,
}

impl Default for IndexSpec {
    fn default() -> Self {
        Self {
            direction: SortDirection::Asc,
            unique: false,
            name: None,
            drop_dups: false,
        }
    }
}

/// Capped collection settings for an entity's collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CappedSpec {
    pub size: u64,
    pub max: Option<u64>,
}

/// Which lifecycle hooks a type binds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleHooks {
    pub pre_persist: bool,
    pub post_persist: bool,
    pub post_load: bool,
}

/// Static declaration of one persistable field.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    name: &'static str,
    stored_name: Option<String>,
    declared_type: &'static str,
    shape: FieldShape,
    role: Option<FieldRole>,
    lazy: bool,
    index: Option<IndexSpec>,
    store_null: bool,
    converted: bool,
}

impl FieldDescriptor {
    /// Declares a field whose type encodes itself.
    pub fn of<V: FieldCodec>(name: &'static str) -> Self {
        Self {
            name,
            stored_name: None,
            declared_type: type_name::<V>(),
            shape: V::shape(),
            role: None,
            lazy: false,
            index: None,
            store_null: false,
            converted: false,
        }
    }

    /// Declares a field stored through a user-registered converter.
    pub fn converted<V: 'static>(name: &'static str) -> Self {
        Self {
            shape: FieldShape::Scalar(type_name::<V>()),
            declared_type: type_name::<V>(),
            converted: true,
            ..Self::of::<bson::Bson>(name)
        }
    }

    pub fn id(mut self) -> Self {
        self.role = Some(FieldRole::Id);
        self
    }

    pub fn embedded(mut self) -> Self {
        self.role = Some(FieldRole::Embedded);
        self
    }

    pub fn reference(mut self) -> Self {
        self.role = Some(FieldRole::Reference);
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn rename(mut self, stored_name: impl Into<String>) -> Self {
        self.stored_name = Some(stored_name.into());
        self
    }

    pub fn indexed(mut self, index: IndexSpec) -> Self {
        self.index = Some(index);
        self
    }

    pub fn store_null(mut self) -> Self {
        self.store_null = true;
        self
    }
}

/// Static declaration of a mapped type.
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    type_ref: TypeRef,
    name: &'static str,
    collection: Option<String>,
    fields: Vec<FieldDescriptor>,
    hooks: LifecycleHooks,
    capped: Option<CappedSpec>,
}

impl ClassDescriptor {
    /// Starts a descriptor for `T` under the given canonical name.
    ///
    /// The canonical name is what polymorphic values record as their
    /// discriminator and the default collection name.
    pub fn new<T: 'static>(name: &'static str) -> Self {
        Self {
            type_ref: TypeRef::of::<T>(),
            name,
            collection: None,
            fields: Vec::new(),
            hooks: LifecycleHooks::default(),
            capped: None,
        }
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn capped(mut self, capped: CappedSpec) -> Self {
        self.capped = Some(capped);
        self
    }
}

/// Immutable description of one persistable field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMetadata {
    /// The Rust field name.
    pub name: String,
    /// The key the field is stored under.
    pub stored_name: String,
    pub declared_type: &'static str,
    pub shape: FieldShape,
    pub role: FieldRole,
    pub lazy: bool,
    pub index: Option<IndexSpec>,
    pub store_null: bool,
    pub converted: bool,
    pub declaring_type: TypeRef,
}

impl FieldMetadata {
    fn from_descriptor(mut descriptor: FieldDescriptor, declaring_type: TypeRef) -> Self {
        let points = matches!(
            descriptor.shape.terminal(),
            FieldShape::Reference(_) | FieldShape::Key
        );
        if !points && (descriptor.role == Some(FieldRole::Reference) || descriptor.lazy) {
            log::warn!(
                "field {}.{} is a {} and cannot be stored as a reference; mapping it by its shape",
                declaring_type.name,
                descriptor.name,
                descriptor.shape.label()
            );
            descriptor.role = None;
            descriptor.lazy = false;
        }

        let role = descriptor.role.unwrap_or(match descriptor.shape.terminal() {
            FieldShape::Embedded(_) | FieldShape::Polymorphic { .. } => FieldRole::Embedded,
            FieldShape::Reference(_) => FieldRole::Reference,
            _ => FieldRole::Plain,
        });
        let stored_name = match role {
            FieldRole::Id => ID_KEY.to_string(),
            _ => descriptor
                .stored_name
                .unwrap_or_else(|| descriptor.name.to_string()),
        };

        Self {
            name: descriptor.name.to_string(),
            stored_name,
            declared_type: descriptor.declared_type,
            shape: descriptor.shape,
            role,
            lazy: descriptor.lazy,
            index: descriptor.index,
            store_null: descriptor.store_null,
            converted: descriptor.converted,
            declaring_type,
        }
    }

    /// Metadata for a path that is not backed by any mapped field.
    pub fn detached(path: &str) -> Self {
        Self {
            name: path.to_string(),
            stored_name: path.to_string(),
            declared_type: type_name::<bson::Bson>(),
            shape: FieldShape::Scalar(type_name::<bson::Bson>()),
            role: FieldRole::Plain,
            lazy: false,
            index: None,
            store_null: false,
            converted: false,
            declaring_type: TypeRef::of::<()>(),
        }
    }

    pub fn is_id(&self) -> bool {
        self.role == FieldRole::Id
    }

    /// The element or value shape for collection and map fields.
    pub fn element_shape(&self) -> Option<&FieldShape> {
        self.shape.element()
    }
}

/// Immutable description of a mapped type.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassMetadata {
    pub type_ref: TypeRef,
    /// Canonical name, also used as discriminator value.
    pub name: &'static str,
    pub collection: String,
    pub hooks: LifecycleHooks,
    pub capped: Option<CappedSpec>,
    fields: Vec<FieldMetadata>,
}

impl ClassMetadata {
    pub fn from_descriptor(descriptor: ClassDescriptor) -> Self {
        let type_ref = descriptor.type_ref;

        Self {
            type_ref,
            name: descriptor.name,
            collection: descriptor
                .collection
                .unwrap_or_else(|| descriptor.name.to_string()),
            hooks: descriptor.hooks,
            capped: descriptor.capped,
            fields: descriptor
                .fields
                .into_iter()
                .map(|field| FieldMetadata::from_descriptor(field, type_ref))
                .collect(),
        }
    }

    /// Persistable fields in declaration order.
    pub fn fields(&self) -> &[FieldMetadata] {
        &self.fields
    }

    /// Looks up a field by Rust name, stored name, or the reserved id key.
    pub fn field(&self, name: &str) -> Option<&FieldMetadata> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .or_else(|| self.fields.iter().find(|field| field.stored_name == name))
    }

    /// The single id field.
    ///
    /// # Errors
    ///
    /// Returns [`MappingFailure::MissingId`] or [`MappingFailure::DuplicateId`]
    /// unless exactly one field is marked as the id.
    pub fn id_field(&self) -> MappingResult<&FieldMetadata> {
        let mut ids = self.fields.iter().filter(|field| field.is_id());

        match (ids.next(), ids.count()) {
            (Some(field), 0) => Ok(field),
            (None, _) => Err(MappingFailure::MissingId(self.name.to_string())),
            (Some(_), extra) => Err(MappingFailure::DuplicateId {
                type_name: self.name.to_string(),
                count: extra + 1,
            }),
        }
    }
}

/// A dotted path resolved against metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    /// The path rewritten with stored field names.
    pub stored_path: String,
    /// The terminal field.
    pub field: FieldMetadata,
    /// The type declaring the terminal field.
    pub class: Arc<ClassMetadata>,
}

/// Cache of class metadata keyed by type identity.
///
/// Reads take a shared lock. Metadata for a type is built outside the lock on
/// first use; if two callers race, the first insert wins and the other copy is
/// dropped.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    classes: RwLock<HashMap<TypeId, Arc<ClassMetadata>>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn describe<T: Mapped>(&self) -> Arc<ClassMetadata> {
        self.describe_ref(&MappedRef::of::<T>())
    }

    pub fn describe_ref(&self, mapped: &MappedRef) -> Arc<ClassMetadata> {
        if let Some(metadata) = self.classes.read().get(&mapped.id()) {
            return metadata.clone();
        }

        let built = Arc::new(ClassMetadata::from_descriptor(mapped.descriptor()));
        log::debug!(
            "described {} as '{}' with {} fields",
            mapped.name(),
            built.collection,
            built.fields.len()
        );

        self.classes
            .write()
            .entry(mapped.id())
            .or_insert(built)
            .clone()
    }

    /// Returns whether metadata for the type has been built.
    pub fn is_described(&self, id: TypeId) -> bool {
        self.classes.read().contains_key(&id)
    }

    /// All metadata built so far.
    pub fn mapped_classes(&self) -> Vec<Arc<ClassMetadata>> {
        self.classes.read().values().cloned().collect()
    }

    /// Resolves a dotted path one segment at a time.
    ///
    /// Positional segments (`0`, `$`) after a list field and key segments after a
    /// map field are carried through unchecked. Embedded and referenced types are
    /// followed; for polymorphic values the first variant declaring the next
    /// segment is used.
    ///
    /// # Errors
    ///
    /// Returns [`MappingFailure::FieldNotFound`] naming the first segment that
    /// cannot be resolved.
    pub fn resolve_path(&self, root: &Arc<ClassMetadata>, path: &str) -> MappingResult<ResolvedPath> {
        let segments = path.split('.').collect::<Vec<_>>();
        let not_found = |segment: &str, type_name: &str| MappingFailure::FieldNotFound {
            path: path.to_string(),
            segment: segment.to_string(),
            type_name: type_name.to_string(),
        };

        let mut class = root.clone();
        let mut stored = Vec::with_capacity(segments.len());
        let mut index = 0;

        loop {
            let segment = segments[index];
            let field = class
                .field(segment)
                .cloned()
                .ok_or_else(|| not_found(segment, class.name))?;
            stored.push(field.stored_name.clone());
            index += 1;

            let mut shape = &field.shape;
            while let FieldShape::List(inner) | FieldShape::Map(inner) = shape {
                if let Some(next) = segments.get(index) {
                    let positional = *next == "$" || next.parse::<usize>().is_ok();
                    if matches!(shape, FieldShape::Map(_)) || positional {
                        stored.push(next.to_string());
                        index += 1;
                    }
                }
                shape = inner.as_ref();
            }

            let Some(&next) = segments.get(index) else {
                return Ok(ResolvedPath {
                    stored_path: stored.join("."),
                    field,
                    class,
                });
            };

            class = match shape {
                FieldShape::Embedded(target) | FieldShape::Reference(target) => {
                    self.describe_ref(target)
                }
                FieldShape::Polymorphic { name, variants } => variants
                    .iter()
                    .map(|variant| self.describe_ref(variant))
                    .find(|variant| variant.field(next).is_some())
                    .ok_or_else(|| not_found(next, *name))?,
                _ => return Err(not_found(next, field.declared_type)),
            };
        }
    }
}
