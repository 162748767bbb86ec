//! Per-field encoding rules.
//!
//! [`FieldCodec`] is implemented by every type that may appear as a field of a
//! mapped type: natively storable scalars, `char`, containers (`Option`, `Vec`,
//! string-keyed maps, `Box`, `Arc`), [`Key`], [`Reference`](crate::reference::Reference),
//! and any type deriving `Mapped`, `Polymorphic` or `Symbol`.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use bson::{oid::ObjectId, Binary, Bson, DateTime, Document};

use crate::{
    convert::incompatible,
    error::{MappingFailure, MappingResult},
    key::Key,
    mapper::{EncodeContext, DecodeContext},
    metadata::FieldShape,
};

/// Encoding of a field value to and from its stored BSON shape.
pub trait FieldCodec: Sized + Send + Sync + 'static {
    /// The structural shape recorded in field metadata.
    fn shape() -> FieldShape;

    fn encode(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson>;

    fn decode(value: Bson, ctx: &DecodeContext<'_>) -> MappingResult<Self>;

    /// Whether the value represents an absent value that should not be stored.
    fn is_null(&self) -> bool {
        false
    }
}

macro_rules! storable_codec {
    ($($ty:ty),* $(,)?) => {$(
        impl FieldCodec for $ty {
            fn shape() -> FieldShape {
                FieldShape::Scalar(std::any::type_name::<$ty>())
            }

            fn encode(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
                ctx.mapper.converters().encode(self, ctx.field)
            }

            fn decode(value: Bson, ctx: &DecodeContext<'_>) -> MappingResult<Self> {
                ctx.mapper.converters().decode(value, ctx.field)
            }
        }
    )*};
}

storable_codec!(
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    u64,
    f32,
    f64,
    String,
    DateTime,
    chrono::DateTime<chrono::Utc>,
    ObjectId,
    bson::Uuid,
    uuid::Uuid,
    Binary,
    Document,
);

impl FieldCodec for Bson {
    fn shape() -> FieldShape {
        FieldShape::Scalar(std::any::type_name::<Bson>())
    }

    fn encode(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        ctx.mapper.converters().encode(self, ctx.field)
    }

    fn decode(value: Bson, ctx: &DecodeContext<'_>) -> MappingResult<Self> {
        ctx.mapper.converters().decode(value, ctx.field)
    }

    fn is_null(&self) -> bool {
        matches!(self, Bson::Null)
    }
}

impl FieldCodec for char {
    fn shape() -> FieldShape {
        FieldShape::Scalar("char")
    }

    fn encode(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        ctx.mapper.converters().encode_custom(self, ctx.field)
    }

    fn decode(value: Bson, ctx: &DecodeContext<'_>) -> MappingResult<Self> {
        ctx.mapper.converters().decode_custom(value, ctx.field)
    }
}

impl<T: FieldCodec> FieldCodec for Option<T> {
    fn shape() -> FieldShape {
        T::shape()
    }

    fn encode(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        match self {
            Some(value) => value.encode(ctx),
            None => Ok(Bson::Null),
        }
    }

    fn decode(value: Bson, ctx: &DecodeContext<'_>) -> MappingResult<Self> {
        match value {
            Bson::Null => Ok(None),
            value => T::decode(value, ctx).map(Some),
        }
    }

    fn is_null(&self) -> bool {
        self.as_ref().is_none_or(FieldCodec::is_null)
    }
}

impl<T: FieldCodec> FieldCodec for Box<T> {
    fn shape() -> FieldShape {
        T::shape()
    }

    fn encode(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        self.as_ref().encode(ctx)
    }

    fn decode(value: Bson, ctx: &DecodeContext<'_>) -> MappingResult<Self> {
        T::decode(value, ctx).map(Box::new)
    }

    fn is_null(&self) -> bool {
        self.as_ref().is_null()
    }
}

impl<T: FieldCodec> FieldCodec for Arc<T> {
    fn shape() -> FieldShape {
        T::shape()
    }

    fn encode(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        self.as_ref().encode(ctx)
    }

    fn decode(value: Bson, ctx: &DecodeContext<'_>) -> MappingResult<Self> {
        T::decode(value, ctx).map(Arc::new)
    }

    fn is_null(&self) -> bool {
        self.as_ref().is_null()
    }
}

impl<T: FieldCodec> FieldCodec for Vec<T> {
    fn shape() -> FieldShape {
        FieldShape::List(Box::new(T::shape()))
    }

    fn encode(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        self.iter()
            .map(|item| item.encode(ctx))
            .collect::<MappingResult<Vec<_>>>()
            .map(Bson::Array)
    }

    // A lone value where a list is declared reads as a one-element list.
    fn decode(value: Bson, ctx: &DecodeContext<'_>) -> MappingResult<Self> {
        match value {
            Bson::Array(items) => items
                .into_iter()
                .map(|item| T::decode(item, ctx))
                .collect(),
            Bson::Null => Ok(Vec::new()),
            single => Ok(vec![T::decode(single, ctx)?]),
        }
    }
}

fn encode_entries<'a, T: FieldCodec>(
    entries: impl Iterator<Item = (&'a String, &'a T)>,
    ctx: &EncodeContext<'_>,
) -> MappingResult<Bson> {
    let mut document = Document::new();
    for (key, value) in entries {
        document.insert(key.clone(), value.encode(ctx)?);
    }
    Ok(Bson::Document(document))
}

fn decode_entries<T: FieldCodec>(
    value: Bson,
    ctx: &DecodeContext<'_>,
) -> MappingResult<Vec<(String, T)>> {
    match value {
        Bson::Document(document) => document
            .into_iter()
            .map(|(key, value)| T::decode(value, ctx).map(|value| (key, value)))
            .collect(),
        other => Err(incompatible(ctx.field, "a document of entries", &other)),
    }
}

impl<T: FieldCodec> FieldCodec for HashMap<String, T> {
    fn shape() -> FieldShape {
        FieldShape::Map(Box::new(T::shape()))
    }

    fn encode(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        encode_entries(self.iter(), ctx)
    }

    fn decode(value: Bson, ctx: &DecodeContext<'_>) -> MappingResult<Self> {
        decode_entries(value, ctx).map(|entries| entries.into_iter().collect())
    }
}

impl<T: FieldCodec> FieldCodec for BTreeMap<String, T> {
    fn shape() -> FieldShape {
        FieldShape::Map(Box::new(T::shape()))
    }

    fn encode(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        encode_entries(self.iter(), ctx)
    }

    fn decode(value: Bson, ctx: &DecodeContext<'_>) -> MappingResult<Self> {
        decode_entries(value, ctx).map(|entries| entries.into_iter().collect())
    }
}

impl FieldCodec for Key {
    fn shape() -> FieldShape {
        FieldShape::Key
    }

    fn encode(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        Ok(Bson::Document(self.to_storage_reference(ctx.mapper.metadata())))
    }

    fn decode(value: Bson, ctx: &DecodeContext<'_>) -> MappingResult<Self> {
        match value {
            Bson::Document(reference) => Key::from_storage_reference(&reference),
            other => Err(incompatible(ctx.field, "a stored reference", &other)),
        }
    }
}

/// Enum-like values stored by their canonical name.
///
/// Usually derived with `#[derive(Symbol)]`, which also provides the matching
/// [`FieldCodec`] through [`encode_symbol`] and [`decode_symbol`].
pub trait Symbol: Sized {
    fn name(&self) -> &'static str;

    fn from_name(name: &str) -> Option<Self>;
}

pub fn encode_symbol<S: Symbol>(value: &S, _ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
    Ok(Bson::String(value.name().to_string()))
}

pub fn decode_symbol<S: Symbol>(value: Bson, ctx: &DecodeContext<'_>) -> MappingResult<S> {
    match value {
        Bson::String(name) => S::from_name(&name).ok_or_else(|| MappingFailure::UnknownSymbol {
            type_name: std::any::type_name::<S>().to_string(),
            value: name,
        }),
        other => Err(incompatible(ctx.field, "a symbol name", &other)),
    }
}
