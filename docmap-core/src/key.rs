//! Entity identity.
//!
//! A [`Key`] names a persisted entity by its collection (kind) and id. A key can
//! be created from a collection name or from a mapped type; in the latter case
//! the collection name is looked up in metadata on first use and then cached.
//!
//! Keys compare by type name when both sides know their type, otherwise by
//! collection name, and then by id.

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    sync::OnceLock,
};

use bson::{doc, Bson, Document};

use crate::{
    convert::{integral, I64_LOWER, I64_UPPER},
    error::{MappingFailure, MappingResult},
    mapper::Mapped,
    metadata::{MappedRef, MetadataRegistry},
};

const REF_KEY: &str = "$ref";
const REF_ID_KEY: &str = "$id";

#[derive(Clone)]
pub struct Key {
    kind: OnceLock<String>,
    kind_class: Option<MappedRef>,
    id: Bson,
}

impl Key {
    /// A key for an entity in the named collection.
    pub fn new(kind: impl Into<String>, id: impl Into<Bson>) -> Self {
        Self {
            kind: OnceLock::from(kind.into()),
            kind_class: None,
            id: id.into(),
        }
    }

    /// A key for an entity of type `T`; its collection is resolved lazily.
    pub fn of<T: Mapped>(id: impl Into<Bson>) -> Self {
        Self {
            kind: OnceLock::new(),
            kind_class: Some(MappedRef::of::<T>()),
            id: id.into(),
        }
    }

    /// The collection name, if known yet.
    pub fn kind(&self) -> Option<&str> {
        self.kind.get().map(String::as_str)
    }

    pub fn kind_class(&self) -> Option<&MappedRef> {
        self.kind_class.as_ref()
    }

    pub fn id(&self) -> &Bson {
        &self.id
    }

    /// Returns the collection name, looking it up from the key's type once.
    pub fn resolve_kind(&self, registry: &MetadataRegistry) -> &str {
        self.kind.get_or_init(|| match &self.kind_class {
            Some(class) => registry.describe_ref(class).collection.clone(),
            None => String::new(),
        })
    }

    /// The stored `{"$ref": collection, "$id": id}` form of this key.
    pub fn to_storage_reference(&self, registry: &MetadataRegistry) -> Document {
        doc! {
            REF_KEY: self.resolve_kind(registry),
            REF_ID_KEY: self.id.clone(),
        }
    }

    /// Reads a key back from its stored form.
    pub fn from_storage_reference(reference: &Document) -> MappingResult<Self> {
        let shape_error = || MappingFailure::IncompatibleShape {
            field: REF_KEY.to_string(),
            expected: "a {$ref, $id} reference".to_string(),
            found: reference.to_string(),
        };

        let kind = reference.get_str(REF_KEY).map_err(|_| shape_error())?;
        let id = reference.get(REF_ID_KEY).ok_or_else(shape_error)?;
        Ok(Self::new(kind, id.clone()))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_kind = match (&self.kind_class, &other.kind_class) {
            (Some(left), Some(right)) => left.name().cmp(right.name()),
            _ => self.kind().cmp(&other.kind()),
        };

        by_kind.then_with(|| compare_ids(&self.id, &other.id))
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_id(&self.id, state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match (self.kind(), &self.kind_class) {
            (Some(kind), _) => kind,
            (None, Some(class)) => class.name(),
            (None, None) => "",
        };
        write!(f, "Key{{kind={kind}, id={}}}", self.id)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn number(id: &Bson) -> Option<f64> {
    match id {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn rank(id: &Bson) -> u8 {
    match id {
        Bson::Null => 0,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => 1,
        Bson::String(_) => 2,
        Bson::ObjectId(_) => 3,
        Bson::Binary(_) => 4,
        Bson::Boolean(_) => 5,
        Bson::DateTime(_) => 6,
        _ => 7,
    }
}

/// Total order over ids. Numbers compare by value regardless of width.
pub(crate) fn compare_ids(left: &Bson, right: &Bson) -> Ordering {
    rank(left).cmp(&rank(right)).then_with(|| match (left, right) {
        (Bson::String(a), Bson::String(b)) => a.cmp(b),
        (Bson::ObjectId(a), Bson::ObjectId(b)) => a.bytes().cmp(&b.bytes()),
        (Bson::Binary(a), Bson::Binary(b)) => a.bytes.cmp(&b.bytes),
        (Bson::Boolean(a), Bson::Boolean(b)) => a.cmp(b),
        (Bson::DateTime(a), Bson::DateTime(b)) => a.cmp(b),
        (a, b) => compare_numbers(a, b).unwrap_or_else(|| a.to_string().cmp(&b.to_string())),
    })
}

// Integral values compare exactly; an i64 never equals a double outside its range.
fn compare_numbers(left: &Bson, right: &Bson) -> Option<Ordering> {
    let mixed = |int: i64, float: f64| {
        if float >= I64_UPPER {
            Ordering::Less
        } else if float < I64_LOWER {
            Ordering::Greater
        } else {
            (int as f64).total_cmp(&float)
        }
    };

    match (integral(left), integral(right)) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        (Some(x), None) => Some(mixed(x, number(right)?)),
        (None, Some(y)) => Some(mixed(y, number(left)?).reverse()),
        (None, None) => Some(number(left)?.total_cmp(&number(right)?)),
    }
}

fn hash_id<H: Hasher>(id: &Bson, state: &mut H) {
    rank(id).hash(state);
    match id {
        Bson::String(v) => v.hash(state),
        Bson::ObjectId(v) => v.bytes().hash(state),
        Bson::Binary(v) => v.bytes.hash(state),
        Bson::Boolean(v) => v.hash(state),
        Bson::DateTime(v) => v.timestamp_millis().hash(state),
        other => match (integral(other), number(other)) {
            (Some(v), _) => v.hash(state),
            (None, Some(v)) => v.to_bits().hash(state),
            _ => other.to_string().hash(state),
        },
    }
}
