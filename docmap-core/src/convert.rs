//! Conversion between Rust values and BSON primitives.
//!
//! Values the store supports natively (numbers, booleans, strings, binary blobs,
//! date/times and object ids) implement [`Storable`] and pass straight through.
//! Anything else can be made persistable by registering a [`TypeConverter`] on the
//! [`ConverterRegistry`]. A registered converter takes precedence over the
//! built-in conversion for the exact same type.
//!
//! ```ignore
//! struct Cents;
//!
//! impl TypeConverter<Money> for Cents {
//!     fn encode(&self, value: &Money, _: &FieldMetadata) -> MappingResult<Bson> {
//!         Ok(Bson::Int64(value.cents))
//!     }
//!
//!     fn decode(&self, value: Bson, field: &FieldMetadata) -> MappingResult<Money> {
//!         Ok(Money { cents: i64::from_bson(value, field)? })
//!     }
//! }
//!
//! let mapper = Mapper::builder().converter::<Money, _>(Cents).build();
//! ```

use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    fmt,
};

use bson::{
    oid::ObjectId,
    spec::BinarySubtype,
    Binary, Bson, DateTime, Document,
};

use crate::{
    error::{MappingFailure, MappingResult},
    metadata::FieldMetadata,
};

/// A pluggable, stateless conversion strategy for values of type `T`.
///
/// Implementations must be pure: `decode(encode(v))` yields a value logically
/// equal to `v` for every `v` in the converter's domain.
pub trait TypeConverter<T>: Send + Sync + 'static {
    /// Converts a value into its stored representation.
    fn encode(&self, value: &T, field: &FieldMetadata) -> MappingResult<Bson>;

    /// Reconstructs a value from its stored representation.
    ///
    /// # Errors
    ///
    /// Returns [`MappingFailure::IncompatibleShape`] when the stored value cannot
    /// represent a `T`.
    fn decode(&self, value: Bson, field: &FieldMetadata) -> MappingResult<T>;
}

/// Types stored natively by the document store.
pub trait Storable: Sized + Send + Sync + 'static {
    /// Converts the value into a BSON primitive.
    fn to_bson(&self, field: &FieldMetadata) -> MappingResult<Bson>;

    /// Reads the value back from a BSON primitive.
    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self>;
}

/// Builds the failure raised when a stored value has the wrong shape.
pub fn incompatible(field: &FieldMetadata, expected: &str, found: &Bson) -> MappingFailure {
    MappingFailure::IncompatibleShape {
        field: field.name.clone(),
        expected: expected.to_string(),
        found: format!("{:?}", found.element_type()),
    }
}

/// Registry of user converters keyed by the exact type they convert.
pub struct ConverterRegistry {
    converters: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ConverterRegistry {
    /// Creates a registry with no converters at all.
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    /// Registers a converter for `T`, replacing any previous one.
    pub fn register<T, C>(&mut self, converter: C) -> &mut Self
    where
        T: 'static,
        C: TypeConverter<T>,
    {
        let boxed: Box<dyn TypeConverter<T>> = Box::new(converter);
        self.converters.insert(TypeId::of::<T>(), Box::new(boxed));
        self
    }

    /// Returns the converter registered for exactly `T`.
    pub fn lookup<T: 'static>(&self) -> Option<&dyn TypeConverter<T>> {
        self.converters
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<Box<dyn TypeConverter<T>>>())
            .map(|converter| converter.as_ref())
    }

    /// Returns whether a converter is registered for `T`.
    pub fn contains<T: 'static>(&self) -> bool {
        self.converters.contains_key(&TypeId::of::<T>())
    }

    /// Encodes a natively storable value, preferring a registered converter.
    pub fn encode<T: Storable>(&self, value: &T, field: &FieldMetadata) -> MappingResult<Bson> {
        match self.lookup::<T>() {
            Some(converter) => converter.encode(value, field),
            None => value.to_bson(field),
        }
    }

    /// Decodes a natively storable value, preferring a registered converter.
    pub fn decode<T: Storable>(&self, value: Bson, field: &FieldMetadata) -> MappingResult<T> {
        match self.lookup::<T>() {
            Some(converter) => converter.decode(value, field),
            None => T::from_bson(value, field),
        }
    }

    /// Encodes a value that can only be stored through a registered converter.
    ///
    /// # Errors
    ///
    /// Returns [`MappingFailure::NoConverter`] if nothing is registered for `T`.
    pub fn encode_custom<T: 'static>(&self, value: &T, field: &FieldMetadata) -> MappingResult<Bson> {
        self.lookup::<T>()
            .ok_or_else(|| MappingFailure::NoConverter(type_name::<T>().to_string()))?
            .encode(value, field)
    }

    /// Decodes a value that can only be stored through a registered converter.
    pub fn decode_custom<T: 'static>(&self, value: Bson, field: &FieldMetadata) -> MappingResult<T> {
        self.lookup::<T>()
            .ok_or_else(|| MappingFailure::NoConverter(type_name::<T>().to_string()))?
            .decode(value, field)
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register::<char, _>(CharConverter);
        registry
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("converters", &self.converters.len())
            .finish()
    }
}

/// Stores a `char` as a one-character string.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharConverter;

impl TypeConverter<char> for CharConverter {
    fn encode(&self, value: &char, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(Bson::String(value.to_string()))
    }

    fn decode(&self, value: Bson, field: &FieldMetadata) -> MappingResult<char> {
        match value {
            Bson::String(text) => text.chars().next().ok_or_else(|| MappingFailure::IncompatibleShape {
                field: field.name.clone(),
                expected: "a single character".to_string(),
                found: "an empty string".to_string(),
            }),
            other => Err(incompatible(field, "a single character", &other)),
        }
    }
}

// Doubles in [-2^63, 2^63) convert to i64 without saturating.
pub(crate) const I64_LOWER: f64 = -9.223372036854775808e18;
pub(crate) const I64_UPPER: f64 = 9.223372036854775808e18;

/// Reads any integral BSON number, accepting doubles without a fractional part
/// that fit in an `i64`.
pub(crate) fn integral(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) if v.fract() == 0.0 && (I64_LOWER..I64_UPPER).contains(v) => Some(*v as i64),
        _ => None,
    }
}

macro_rules! storable_int32 {
    ($($ty:ty),*) => {$(
        impl Storable for $ty {
            fn to_bson(&self, _field: &FieldMetadata) -> MappingResult<Bson> {
                Ok(Bson::Int32(i32::from(*self)))
            }

            fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
                integral(&value)
                    .and_then(|v| <$ty>::try_from(v).ok())
                    .ok_or_else(|| incompatible(field, stringify!($ty), &value))
            }
        }
    )*};
}

storable_int32!(i8, i16, i32, u8, u16);

impl Storable for i64 {
    fn to_bson(&self, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(Bson::Int64(*self))
    }

    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
        integral(&value).ok_or_else(|| incompatible(field, "i64", &value))
    }
}

impl Storable for u32 {
    fn to_bson(&self, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(Bson::Int64(i64::from(*self)))
    }

    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
        integral(&value)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| incompatible(field, "u32", &value))
    }
}

impl Storable for u64 {
    fn to_bson(&self, field: &FieldMetadata) -> MappingResult<Bson> {
        i64::try_from(*self)
            .map(Bson::Int64)
            .map_err(|_| MappingFailure::Conversion {
                field: field.name.clone(),
                message: format!("{self} does not fit in a 64-bit signed integer"),
            })
    }

    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
        integral(&value)
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| incompatible(field, "u64", &value))
    }
}

impl Storable for f64 {
    fn to_bson(&self, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(Bson::Double(*self))
    }

    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
        match value {
            Bson::Double(v) => Ok(v),
            Bson::Int32(v) => Ok(f64::from(v)),
            Bson::Int64(v) => Ok(v as f64),
            other => Err(incompatible(field, "f64", &other)),
        }
    }
}

impl Storable for f32 {
    fn to_bson(&self, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(Bson::Double(f64::from(*self)))
    }

    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
        f64::from_bson(value, field).map(|v| v as f32)
    }
}

impl Storable for bool {
    fn to_bson(&self, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(Bson::Boolean(*self))
    }

    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
        match value {
            Bson::Boolean(v) => Ok(v),
            other => Err(incompatible(field, "bool", &other)),
        }
    }
}

impl Storable for String {
    fn to_bson(&self, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(Bson::String(self.clone()))
    }

    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
        match value {
            Bson::String(v) | Bson::Symbol(v) => Ok(v),
            other => Err(incompatible(field, "a string", &other)),
        }
    }
}

impl Storable for DateTime {
    fn to_bson(&self, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(Bson::DateTime(*self))
    }

    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
        match value {
            Bson::DateTime(v) => Ok(v),
            other => Err(incompatible(field, "a date/time", &other)),
        }
    }
}

impl Storable for chrono::DateTime<chrono::Utc> {
    fn to_bson(&self, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(Bson::DateTime(DateTime::from_chrono(*self)))
    }

    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
        DateTime::from_bson(value, field).map(|v| v.to_chrono())
    }
}

impl Storable for ObjectId {
    fn to_bson(&self, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(Bson::ObjectId(*self))
    }

    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
        match value {
            Bson::ObjectId(v) => Ok(v),
            other => Err(incompatible(field, "an object id", &other)),
        }
    }
}

impl Storable for bson::Uuid {
    fn to_bson(&self, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: self.bytes().to_vec(),
        }))
    }

    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
        match &value {
            Bson::Binary(binary) if binary.subtype == BinarySubtype::Uuid => binary
                .bytes
                .as_slice()
                .try_into()
                .map(bson::Uuid::from_bytes)
                .map_err(|_| incompatible(field, "a 16 byte uuid", &value)),
            _ => Err(incompatible(field, "a uuid", &value)),
        }
    }
}

impl Storable for uuid::Uuid {
    fn to_bson(&self, field: &FieldMetadata) -> MappingResult<Bson> {
        bson::Uuid::from_bytes(*self.as_bytes()).to_bson(field)
    }

    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
        bson::Uuid::from_bson(value, field).map(|v| uuid::Uuid::from_bytes(v.bytes()))
    }
}

impl Storable for Binary {
    fn to_bson(&self, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(Bson::Binary(self.clone()))
    }

    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
        match value {
            Bson::Binary(v) => Ok(v),
            other => Err(incompatible(field, "binary data", &other)),
        }
    }
}

impl Storable for Document {
    fn to_bson(&self, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(Bson::Document(self.clone()))
    }

    fn from_bson(value: Bson, field: &FieldMetadata) -> MappingResult<Self> {
        match value {
            Bson::Document(v) => Ok(v),
            other => Err(incompatible(field, "a document", &other)),
        }
    }
}

impl Storable for Bson {
    fn to_bson(&self, _field: &FieldMetadata) -> MappingResult<Bson> {
        Ok(self.clone())
    }

    fn from_bson(value: Bson, _field: &FieldMetadata) -> MappingResult<Self> {
        Ok(value)
    }
}
