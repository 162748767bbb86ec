//! Query construction and execution for mapped types.
//!
//! A [`Query`] accumulates a filter document, a sort document, a projection and a
//! result window for one mapped type, validating every field path against the type's
//! metadata and converting every literal to its stored shape.
//!
//! # Query Building
//!
//! Conditions can be written as strings or through the fluent field selector:
//!
//! ```ignore
//! use docmap::prelude::*;
//!
//! let mut query = datastore.find::<User>();
//! query
//!     .filter("age >=", 18)?
//!     .field("address.city")
//!     .equal("Paris")?
//!     .order("-age,name")?
//!     .limit(10);
//!
//! let users = query.as_list().await?;
//! ```
//!
//! # Condition Syntax
//!
//! A string condition is a field path optionally followed by one operator token:
//!
//! - Comparison: `=`, `==`, `!=`, `<>`, `>`, `>=`, `<`, `<=`
//! - Membership: `in`, `nin`, `all`
//! - Structure: `exists`, `size`
//!
//! A missing token means equality. Anything else is an
//! [`IllegalFilterExpression`](crate::error::DocMapError::IllegalFilterExpression),
//! raised before the query is modified.
//!
//! # Filter Documents
//!
//! Equality terms are written as `path: value`; every other operator as
//! `path: { $op: value }`. Several operators on the same path share one operator
//! document, so `filter("age >", 18)` followed by `filter("age <", 65)` produces
//! `{ age: { $gt: 18, $lt: 65 } }`.

use std::{any::type_name, fmt, marker::PhantomData, str::FromStr, sync::Arc};

use bson::{doc, Bson, Document};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};

use crate::{
    backend::{FindRequest, StoreBackend},
    codec::FieldCodec,
    datastore::Datastore,
    error::{DocMapError, DocMapResult, MappingResult},
    key::Key,
    mapper::{EncodeContext, Mapped},
    metadata::{ClassMetadata, FieldMetadata, FieldShape, ID_KEY},
    page::{Page, PaginationParams},
};

/// Sort direction for query results and indexes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending order (A to Z, 0 to 9, earliest to latest).
    #[default]
    Asc,
    /// Descending order (Z to A, 9 to 0, latest to earliest).
    Desc,
}

impl SortDirection {
    /// The stored form used in sort and index key documents.
    pub fn as_bson(self) -> Bson {
        match self {
            SortDirection::Asc => Bson::Int32(1),
            SortDirection::Desc => Bson::Int32(-1),
        }
    }
}

/// Field comparison operators for filter documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    /// Equal to (exact match).
    Equal,
    /// Not equal to.
    NotEqual,
    /// Greater than.
    GreaterThan,
    /// Greater than or equal to.
    GreaterThanOrEqual,
    /// Less than.
    LessThan,
    /// Less than or equal to.
    LessThanOrEqual,
    /// Value is one of the given values.
    In,
    /// Value is none of the given values.
    NotIn,
    /// Array contains all of the given values.
    All,
    /// Field is present (or absent).
    Exists,
    /// Array has the given length.
    Size,
    /// Numeric value has the given remainder for a divisor.
    Modulo,
    /// String value matches a regular expression.
    Pattern,
}

impl FilterOperator {
    /// The operator key used in filter documents.
    pub fn symbol(self) -> &'static str {
        match self {
            FilterOperator::Equal => "$eq",
            FilterOperator::NotEqual => "$ne",
            FilterOperator::GreaterThan => "$gt",
            FilterOperator::GreaterThanOrEqual => "$gte",
            FilterOperator::LessThan => "$lt",
            FilterOperator::LessThanOrEqual => "$lte",
            FilterOperator::In => "$in",
            FilterOperator::NotIn => "$nin",
            FilterOperator::All => "$all",
            FilterOperator::Exists => "$exists",
            FilterOperator::Size => "$size",
            FilterOperator::Modulo => "$mod",
            FilterOperator::Pattern => "$regex",
        }
    }

    fn takes_sequence(self) -> bool {
        matches!(self, FilterOperator::In | FilterOperator::NotIn | FilterOperator::All)
    }

    // Operands of these operators are not values of the field itself.
    fn checks_operand_type(self) -> bool {
        !matches!(
            self,
            FilterOperator::Exists | FilterOperator::Size | FilterOperator::Modulo | FilterOperator::Pattern
        )
    }
}

impl FromStr for FilterOperator {
    type Err = DocMapError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token.to_ascii_lowercase().as_str() {
            "=" | "==" => Ok(FilterOperator::Equal),
            "!=" | "<>" => Ok(FilterOperator::NotEqual),
            ">" => Ok(FilterOperator::GreaterThan),
            ">=" => Ok(FilterOperator::GreaterThanOrEqual),
            "<" => Ok(FilterOperator::LessThan),
            "<=" => Ok(FilterOperator::LessThanOrEqual),
            "in" => Ok(FilterOperator::In),
            "nin" => Ok(FilterOperator::NotIn),
            "all" => Ok(FilterOperator::All),
            "exists" => Ok(FilterOperator::Exists),
            "size" => Ok(FilterOperator::Size),
            _ => Err(DocMapError::IllegalFilterExpression(format!(
                "unknown operator '{token}'"
            ))),
        }
    }
}

/// Splits a string condition into its field path and operator.
///
/// # Errors
///
/// Returns [`DocMapError::IllegalFilterExpression`] for an empty condition, an unknown
/// operator token or trailing tokens.
pub fn parse_condition(condition: &str) -> DocMapResult<(&str, FilterOperator)> {
    let mut parts = condition.split_whitespace();
    let Some(path) = parts.next() else {
        return Err(DocMapError::IllegalFilterExpression(
            "a condition needs a field path".to_string(),
        ));
    };

    let operator = match parts.next() {
        Some(token) => token.parse()?,
        None => FilterOperator::Equal,
    };

    match parts.next() {
        Some(_) => Err(DocMapError::IllegalFilterExpression(format!(
            "'{condition}' has more than a field path and one operator"
        ))),
        None => Ok((path, operator)),
    }
}

const OPERATOR_KEYS: &[&str] = &[
    "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$all", "$exists", "$size",
    "$mod", "$regex", "$options",
];

fn is_operator_document(value: &Bson) -> bool {
    match value {
        Bson::Document(document) => {
            !document.is_empty() && document.keys().all(|key| OPERATOR_KEYS.contains(&key.as_str()))
        }
        _ => false,
    }
}

/// A value usable as a query operand.
///
/// Implemented for every [`FieldCodec`] type and for string slices.
pub trait QueryValue {
    /// The structural shape of the value, compared against the queried field.
    fn value_shape(&self) -> FieldShape;

    /// Converts the value to its stored shape for the given field.
    fn encode_value(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson>;
}

impl<V: FieldCodec> QueryValue for V {
    fn value_shape(&self) -> FieldShape {
        V::shape()
    }

    fn encode_value(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        if self.is_null() {
            return Ok(Bson::Null);
        }
        self.encode(ctx)
    }
}

impl QueryValue for &str {
    fn value_shape(&self) -> FieldShape {
        String::shape()
    }

    fn encode_value(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        self.to_string().encode(ctx)
    }
}

impl QueryValue for Vec<&str> {
    fn value_shape(&self) -> FieldShape {
        <Vec<String>>::shape()
    }

    fn encode_value(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        self.iter()
            .map(|value| value.encode_value(ctx))
            .collect::<MappingResult<Vec<_>>>()
            .map(Bson::Array)
    }
}

/// An operand stored through the converter registered for `V`.
///
/// Fields declared `#[docmap(convert)]` have no built-in encoding, so their
/// literals are wrapped to go through the same converter as stored values:
///
/// ```ignore
/// query.filter("price >=", Converted(Money::from_cents(500)))?;
/// query.field("price").has_any_of(vec![Converted(low), Converted(high)])?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Converted<V>(pub V);

impl<V: Send + Sync + 'static> QueryValue for Converted<V> {
    fn value_shape(&self) -> FieldShape {
        FieldShape::Scalar(type_name::<V>())
    }

    fn encode_value(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        ctx.mapper.converters().encode_custom(&self.0, ctx.field)
    }
}

impl<V: Send + Sync + 'static> QueryValue for Vec<Converted<V>> {
    fn value_shape(&self) -> FieldShape {
        FieldShape::List(Box::new(FieldShape::Scalar(type_name::<V>())))
    }

    fn encode_value(&self, ctx: &EncodeContext<'_>) -> MappingResult<Bson> {
        self.iter()
            .map(|value| value.encode_value(ctx))
            .collect::<MappingResult<Vec<_>>>()
            .map(Bson::Array)
    }
}

/// A query over the documents of one mapped type.
///
/// The builder is owned by a single caller; it is not meant to be shared between tasks
/// while it is being modified. Executing a query does not consume it, and each
/// execution issues a fresh lookup.
pub struct Query<'a, T, B> {
    datastore: &'a Datastore<B>,
    class: Arc<ClassMetadata>,
    collection: String,
    filter: Document,
    sort: Document,
    projection: Document,
    skip: u64,
    limit: Option<u64>,
    validate: bool,
    _entity: PhantomData<fn() -> T>,
}

impl<T, B> Clone for Query<'_, T, B> {
    fn clone(&self) -> Self {
        Self {
            datastore: self.datastore,
            class: self.class.clone(),
            collection: self.collection.clone(),
            filter: self.filter.clone(),
            sort: self.sort.clone(),
            projection: self.projection.clone(),
            skip: self.skip,
            limit: self.limit,
            validate: self.validate,
            _entity: PhantomData,
        }
    }
}

impl<T, B> fmt::Debug for Query<'_, T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("collection", &self.collection)
            .field("filter", &self.filter)
            .field("sort", &self.sort)
            .field("projection", &self.projection)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .finish()
    }
}

impl<'a, T: Mapped, B: StoreBackend> Query<'a, T, B> {
    pub(crate) fn new(datastore: &'a Datastore<B>) -> Self {
        let class = datastore.mapper().describe::<T>();
        let collection = class.collection.clone();
        Self::in_collection(datastore, class, collection)
    }

    /// A query over documents of `T` stored in another collection than its own.
    pub(crate) fn in_collection(
        datastore: &'a Datastore<B>,
        class: Arc<ClassMetadata>,
        collection: String,
    ) -> Self {
        Self {
            datastore,
            class,
            collection,
            filter: Document::new(),
            sort: Document::new(),
            projection: Document::new(),
            skip: 0,
            limit: None,
            validate: datastore.mapper().options().validate_queries,
            _entity: PhantomData,
        }
    }

    /// An empty query on the same type, for building `or` branches.
    pub fn branch(&self) -> Self {
        Self {
            filter: Document::new(),
            sort: Document::new(),
            projection: Document::new(),
            skip: 0,
            limit: None,
            ..self.clone()
        }
    }

    /// The metadata of the queried type.
    pub fn class(&self) -> &ClassMetadata {
        &self.class
    }

    /// The collection this query reads.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn filter_document(&self) -> &Document {
        &self.filter
    }

    pub fn sort_document(&self) -> &Document {
        &self.sort
    }

    pub fn projection_document(&self) -> &Document {
        &self.projection
    }

    /// The lookup this query issues, without executing it.
    pub fn find_request(&self) -> FindRequest {
        let mut request = FindRequest::new(self.filter.clone()).with_skip(self.skip);
        if !self.projection.is_empty() {
            request = request.with_projection(self.projection.clone());
        }
        if !self.sort.is_empty() {
            request = request.with_sort(self.sort.clone());
        }
        if let Some(limit) = self.limit {
            request = request.with_limit(limit);
        }
        request
    }

    /// Skips path validation for paths not described by metadata.
    ///
    /// Unresolvable paths are then used verbatim and their values are stored
    /// without field-specific conversion.
    pub fn disable_validation(&mut self) -> &mut Self {
        self.validate = false;
        self
    }

    pub fn enable_validation(&mut self) -> &mut Self {
        self.validate = true;
        self
    }

    /// Adds a condition written as `"path"` or `"path operator"`.
    ///
    /// # Errors
    ///
    /// Returns [`DocMapError::IllegalFilterExpression`] for a malformed condition and a
    /// [`MappingFailure`](crate::error::MappingFailure) for an unknown path or a value that
    /// cannot be converted. The query is left unchanged on error.
    pub fn filter<V: QueryValue>(&mut self, condition: &str, value: V) -> DocMapResult<&mut Self> {
        let (path, operator) = parse_condition(condition)?;
        self.add_condition(path, operator, &value)
    }

    /// Selects a field path for a fluent condition.
    pub fn field(&mut self, path: impl Into<String>) -> FieldCriteria<'_, 'a, T, B> {
        FieldCriteria {
            query: self,
            path: path.into(),
        }
    }

    /// Matches documents for which a server-side JavaScript expression holds.
    pub fn where_expression(&mut self, expression: impl Into<String>) -> &mut Self {
        self.filter.insert("$where", expression.into());
        self
    }

    /// Adds a disjunction of independently built branches.
    ///
    /// Repeated calls extend the same disjunction.
    pub fn or<I>(&mut self, branches: I) -> &mut Self
    where
        I: IntoIterator<Item = Query<'a, T, B>>,
    {
        let mut alternatives = branches
            .into_iter()
            .map(|branch| Bson::Document(branch.filter))
            .collect::<Vec<_>>();

        match self.filter.get_mut("$or") {
            Some(Bson::Array(existing)) => existing.append(&mut alternatives),
            _ => {
                self.filter.insert("$or", alternatives);
            }
        }
        self
    }

    /// Sorts ascending by a path, after any sort keys already added.
    pub fn order_by(&mut self, path: &str) -> DocMapResult<&mut Self> {
        self.sort(path, SortDirection::Asc)
    }

    /// Sorts descending by a path, after any sort keys already added.
    pub fn order_by_desc(&mut self, path: &str) -> DocMapResult<&mut Self> {
        self.sort(path, SortDirection::Desc)
    }

    /// Appends a sort key. Sorting again by a path already present moves it last.
    pub fn sort(&mut self, path: &str, direction: SortDirection) -> DocMapResult<&mut Self> {
        let (stored_path, _) = self.resolve(path)?;
        self.push_sort(stored_path, direction);
        Ok(self)
    }

    /// Adds sort keys from a comma separated list; a leading `-` sorts descending.
    ///
    /// ```ignore
    /// query.order("-age,name")?;
    /// ```
    pub fn order(&mut self, keys: &str) -> DocMapResult<&mut Self> {
        let mut resolved = Vec::new();
        for key in keys.split(',').map(str::trim).filter(|key| !key.is_empty()) {
            let (path, direction) = match key.strip_prefix('-') {
                Some(path) => (path, SortDirection::Desc),
                None => (key, SortDirection::Asc),
            };
            resolved.push((self.resolve(path)?.0, direction));
        }

        for (stored_path, direction) in resolved {
            self.push_sort(stored_path, direction);
        }
        Ok(self)
    }

    fn push_sort(&mut self, stored_path: String, direction: SortDirection) {
        self.sort.remove(&stored_path);
        self.sort.insert(stored_path, direction.as_bson());
    }

    pub fn skip(&mut self, skip: u64) -> &mut Self {
        self.skip = skip;
        self
    }

    pub fn limit(&mut self, limit: u64) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    /// Restricts loaded documents to the named fields.
    ///
    /// Combining `include` and `exclude` on one query is left to the backend to accept
    /// or reject.
    pub fn include(&mut self, path: &str) -> DocMapResult<&mut Self> {
        let (stored_path, _) = self.resolve(path)?;
        self.projection.insert(stored_path, 1);
        Ok(self)
    }

    /// Omits the named field from loaded documents.
    pub fn exclude(&mut self, path: &str) -> DocMapResult<&mut Self> {
        let (stored_path, _) = self.resolve(path)?;
        self.projection.insert(stored_path, 0);
        Ok(self)
    }

    fn resolve(&self, path: &str) -> DocMapResult<(String, FieldMetadata)> {
        let registry = self.datastore.mapper().metadata();
        match registry.resolve_path(&self.class, path) {
            Ok(resolved) => Ok((resolved.stored_path, resolved.field)),
            Err(_) if !self.validate => Ok((path.to_string(), FieldMetadata::detached(path))),
            Err(err) => Err(err.into()),
        }
    }

    fn add_condition<V: QueryValue + ?Sized>(
        &mut self,
        path: &str,
        operator: FilterOperator,
        value: &V,
    ) -> DocMapResult<&mut Self> {
        let (stored_path, field) = self.resolve(path)?;
        let operand = self.operand(&field, operator, value)?;
        self.push(stored_path, operator, operand);
        Ok(self)
    }

    fn operand<V: QueryValue + ?Sized>(
        &self,
        field: &FieldMetadata,
        operator: FilterOperator,
        value: &V,
    ) -> DocMapResult<Bson> {
        let mapper = self.datastore.mapper();

        if self.validate && operator.checks_operand_type() {
            let shape = value.value_shape();
            if !field.shape.accepts(&shape) {
                log::warn!(
                    "Datatypes for the query may be inconsistent; searching with an instance of {} when the field {}.{} is a {}",
                    shape.label(),
                    self.class.name,
                    field.name,
                    field.declared_type
                );
            }
        }

        let encoded = value.encode_value(&EncodeContext { mapper, field })?;
        Ok(match encoded {
            Bson::Array(items) => Bson::Array(items),
            single if operator.takes_sequence() => Bson::Array(vec![single]),
            single => single,
        })
    }

    fn push(&mut self, path: String, operator: FilterOperator, operand: Bson) {
        let unmerged = match self.filter.get_mut(&path) {
            Some(current) if is_operator_document(&*current) => {
                if let Bson::Document(operators) = current {
                    operators.insert(operator.symbol(), operand);
                }
                None
            }
            // A literal already on the path becomes an explicit $eq next to the new operator.
            Some(current) if operator != FilterOperator::Equal => {
                let literal = std::mem::replace(current, Bson::Null);
                *current = Bson::Document(doc! {
                    FilterOperator::Equal.symbol(): literal,
                    operator.symbol(): operand,
                });
                None
            }
            _ => Some(operand),
        };

        if let Some(operand) = unmerged {
            match operator {
                FilterOperator::Equal => self.filter.insert(path, operand),
                _ => self.filter.insert(path, doc! { operator.symbol(): operand }),
            };
        }
    }

    fn stream(&self, request: FindRequest) -> BoxStream<'a, DocMapResult<T>> {
        let datastore = self.datastore;
        let collection = self.collection.clone();
        let source = collection.clone();

        futures::stream::once(async move { datastore.backend().find(&collection, request).await })
            .try_flatten()
            .and_then(move |document| {
                let source = source.clone();
                async move { datastore.materialize_from::<T>(&source, document).await }
            })
            .boxed()
    }

    fn key_stream(&self, request: FindRequest) -> BoxStream<'a, DocMapResult<Key>> {
        let datastore = self.datastore;
        let collection = self.collection.clone();
        let request = request.with_projection(doc! { ID_KEY: 1 });

        futures::stream::once(async move {
            let cursor = datastore.backend().find(&collection, request).await?;
            Ok::<_, DocMapError>(cursor.map(move |document| {
                let document = document?;
                let id = document.get(ID_KEY).cloned().ok_or_else(|| {
                    DocMapError::InvalidDocument(format!("a document in '{collection}' has no {ID_KEY}"))
                })?;
                Ok(Key::new(collection.clone(), id))
            }))
        })
        .try_flatten()
        .boxed()
    }

    /// Streams matching entities. Every call issues a new lookup.
    pub fn fetch(&self) -> BoxStream<'a, DocMapResult<T>> {
        self.stream(self.find_request())
    }

    /// Streams the keys of matching entities, loading only their ids.
    pub fn fetch_keys(&self) -> BoxStream<'a, DocMapResult<Key>> {
        self.key_stream(self.find_request())
    }

    pub async fn as_list(&self) -> DocMapResult<Vec<T>> {
        self.fetch().try_collect().await
    }

    pub async fn as_key_list(&self) -> DocMapResult<Vec<Key>> {
        self.fetch_keys().try_collect().await
    }

    /// Counts matching documents, ignoring sort, projection and window.
    pub async fn count_all(&self) -> DocMapResult<u64> {
        self.datastore
            .backend()
            .count(&self.collection, self.filter.clone())
            .await
    }

    /// The first match, or `None` if nothing matches.
    pub async fn get(&self) -> DocMapResult<Option<T>> {
        self.stream(self.find_request().with_limit(1))
            .try_next()
            .await
    }

    /// The key of the first match, or `None` if nothing matches.
    pub async fn get_key(&self) -> DocMapResult<Option<Key>> {
        self.key_stream(self.find_request().with_limit(1))
            .try_next()
            .await
    }

    /// Loads one page of matches. The page window replaces the query's skip and limit.
    pub async fn page(&self, params: &PaginationParams) -> DocMapResult<Page<T>> {
        let count = usize::try_from(self.count_all().await?).unwrap_or(usize::MAX);
        let request = self
            .find_request()
            .with_skip(params.offset() as u64)
            .with_limit(params.per_page() as u64);
        let items = self.stream(request).try_collect().await?;

        Ok(Page::new(items, count, params))
    }
}

/// Fluent conditions on one field path.
///
/// Every verb validates the path, converts its operand and returns the query for
/// chaining.
pub struct FieldCriteria<'q, 'a, T, B> {
    query: &'q mut Query<'a, T, B>,
    path: String,
}

impl<'q, 'a, T: Mapped, B: StoreBackend> FieldCriteria<'q, 'a, T, B> {
    fn apply<V: QueryValue + ?Sized>(
        self,
        operator: FilterOperator,
        value: &V,
    ) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.query.add_condition(&self.path, operator, value)?;
        Ok(self.query)
    }

    pub fn equal<V: QueryValue>(self, value: V) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::Equal, &value)
    }

    pub fn not_equal<V: QueryValue>(self, value: V) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::NotEqual, &value)
    }

    pub fn less_than<V: QueryValue>(self, value: V) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::LessThan, &value)
    }

    pub fn less_than_or_equal<V: QueryValue>(self, value: V) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::LessThanOrEqual, &value)
    }

    pub fn greater_than<V: QueryValue>(self, value: V) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::GreaterThan, &value)
    }

    pub fn greater_than_or_equal<V: QueryValue>(self, value: V) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::GreaterThanOrEqual, &value)
    }

    pub fn exists(self) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::Exists, &true)
    }

    pub fn not_exists(self) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::Exists, &false)
    }

    /// Matches string values against a regular expression.
    pub fn matches_pattern(self, pattern: &str) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::Pattern, &pattern)
    }

    /// Matches string values against a regular expression with flags such as `i`.
    pub fn matches_pattern_with(
        self,
        pattern: &str,
        options: &str,
    ) -> DocMapResult<&'q mut Query<'a, T, B>> {
        let path = self.path.clone();
        let query = self.apply(FilterOperator::Pattern, &pattern)?;
        let (stored_path, _) = query.resolve(&path)?;
        if let Some(Bson::Document(operators)) = query.filter.get_mut(&stored_path) {
            operators.insert("$options", options);
        }
        Ok(query)
    }

    /// Matches arrays with exactly `size` elements.
    pub fn has_size(self, size: i32) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::Size, &size)
    }

    /// Matches numbers leaving `remainder` when divided by `divisor`.
    pub fn has_modulo(self, divisor: i64, remainder: i64) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::Modulo, &vec![divisor, remainder])
    }

    /// Matches values equal to any of the given values. A single value is treated as a
    /// one-element list.
    pub fn has_any_of<V: QueryValue>(self, values: V) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::In, &values)
    }

    pub fn has_none_of<V: QueryValue>(self, values: V) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::NotIn, &values)
    }

    /// Matches arrays containing all of the given values.
    pub fn has_all_of<V: QueryValue>(self, values: V) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::All, &values)
    }

    /// Matches arrays containing the given element.
    pub fn has_this_one<V: QueryValue>(self, value: V) -> DocMapResult<&'q mut Query<'a, T, B>> {
        self.apply(FilterOperator::Equal, &value)
    }

    /// Adds a JavaScript condition to the query; the selected path is not used.
    pub fn where_expression(self, expression: impl Into<String>) -> DocMapResult<&'q mut Query<'a, T, B>> {
        let query = self.query;
        Ok(query.where_expression(expression))
    }
}

#[cfg(test)]
mod tests {
    use docmap_macros::{Mapped, Symbol};

    use super::*;
    use crate::{error::MappingFailure, testing::NullBackend};

    #[derive(Debug, Clone, Copy, PartialEq, Default, Symbol)]
    enum Level {
        #[default]
        Low,
        High,
    }

    #[derive(Debug, Default, Mapped)]
    struct Address {
        city: String,
        #[docmap(rename = "zip")]
        postal_code: String,
    }

    #[derive(Debug, Default, Mapped)]
    #[docmap(collection = "users")]
    struct User {
        #[docmap(id)]
        id: i64,
        #[docmap(rename = "n")]
        name: String,
        age: i64,
        initial: char,
        level: Level,
        tags: Vec<String>,
        address: Option<Address>,
    }

    fn datastore() -> Datastore<NullBackend> {
        Datastore::new(NullBackend)
    }

    #[test]
    fn parses_every_operator_token() {
        let table = [
            ("=", FilterOperator::Equal),
            ("==", FilterOperator::Equal),
            (">", FilterOperator::GreaterThan),
            (">=", FilterOperator::GreaterThanOrEqual),
            ("<", FilterOperator::LessThan),
            ("<=", FilterOperator::LessThanOrEqual),
            ("!=", FilterOperator::NotEqual),
            ("<>", FilterOperator::NotEqual),
            ("in", FilterOperator::In),
            ("NIN", FilterOperator::NotIn),
            ("all", FilterOperator::All),
            ("exists", FilterOperator::Exists),
            ("size", FilterOperator::Size),
        ];

        for (token, operator) in table {
            assert_eq!(token.parse::<FilterOperator>().unwrap(), operator, "token {token}");
        }
        assert_eq!(parse_condition("age").unwrap(), ("age", FilterOperator::Equal));
        assert!(matches!(
            parse_condition("age ~"),
            Err(DocMapError::IllegalFilterExpression(_))
        ));
        assert!(matches!(
            parse_condition("age > 3"),
            Err(DocMapError::IllegalFilterExpression(_))
        ));
        assert!(matches!(
            parse_condition("  "),
            Err(DocMapError::IllegalFilterExpression(_))
        ));
    }

    #[test]
    fn unknown_operator_leaves_the_query_unchanged() {
        let datastore = datastore();
        let mut query = datastore.find::<User>();
        query.filter("age >", 18_i64).unwrap();
        let before = query.filter_document().clone();

        assert!(query.filter("age =~", 30_i64).is_err());
        assert_eq!(query.filter_document(), &before);
    }

    #[test]
    fn operators_on_one_path_compose() {
        let datastore = datastore();
        let mut query = datastore.find::<User>();
        query
            .filter("age >=", 18_i64)
            .unwrap()
            .filter("age <", 65_i64)
            .unwrap()
            .filter("name", "Ada")
            .unwrap();

        assert_eq!(
            query.filter_document(),
            &doc! { "age": { "$gte": 18_i64, "$lt": 65_i64 }, "n": "Ada" }
        );
    }

    #[test]
    fn equality_folds_into_existing_operators() {
        let datastore = datastore();
        let mut query = datastore.find::<User>();
        query.filter("age", 30_i64).unwrap().filter("age !=", 31_i64).unwrap();

        assert_eq!(
            query.filter_document(),
            &doc! { "age": { "$eq": 30_i64, "$ne": 31_i64 } }
        );
    }

    #[test]
    fn validates_nested_paths_and_uses_stored_names() {
        let datastore = datastore();
        let mut query = datastore.find::<User>();

        let err = query.filter("address.street", "Main").unwrap_err();
        assert!(matches!(
            err,
            DocMapError::Mapping(MappingFailure::FieldNotFound { ref segment, .. }) if segment == "street"
        ));

        query.filter("address.postal_code", "75001").unwrap();
        assert_eq!(query.filter_document(), &doc! { "address.zip": "75001" });
    }

    #[test]
    fn disabled_validation_accepts_unknown_paths() {
        let datastore = datastore();
        let mut query = datastore.find::<User>();
        query
            .disable_validation()
            .filter("extra.flag", true)
            .unwrap();

        assert_eq!(query.filter_document(), &doc! { "extra.flag": true });
    }

    #[test]
    fn literals_are_converted_like_stored_values() {
        let datastore = datastore();
        let mut query = datastore.find::<User>();
        query
            .filter("level", Level::High)
            .unwrap()
            .filter("initial", 'A')
            .unwrap();

        assert_eq!(query.filter_document(), &doc! { "level": "High", "initial": "A" });
    }

    #[test]
    fn membership_operators_wrap_single_values() {
        let datastore = datastore();
        let mut single = datastore.find::<User>();
        single.field("age").has_any_of(5_i64).unwrap();
        let mut listed = datastore.find::<User>();
        listed.field("age").has_any_of(vec![5_i64]).unwrap();

        assert_eq!(single.filter_document(), listed.filter_document());
        assert_eq!(single.filter_document(), &doc! { "age": { "$in": [5_i64] } });
    }

    #[test]
    fn fluent_verbs_build_operator_documents() {
        let datastore = datastore();
        let mut query = datastore.find::<User>();
        query
            .field("tags")
            .has_size(2)
            .unwrap()
            .field("age")
            .has_modulo(4, 0)
            .unwrap()
            .field("name")
            .matches_pattern_with("^a", "i")
            .unwrap()
            .field("address")
            .not_exists()
            .unwrap()
            .field("tags")
            .has_this_one("rust")
            .unwrap();

        assert_eq!(
            query.filter_document(),
            &doc! {
                "tags": { "$size": 2, "$eq": "rust" },
                "age": { "$mod": [4_i64, 0_i64] },
                "n": { "$regex": "^a", "$options": "i" },
                "address": { "$exists": false },
            }
        );
    }

    #[test]
    fn sort_keys_keep_call_order() {
        let datastore = datastore();
        let mut query = datastore.find::<User>();
        query.order_by("age").unwrap().order_by_desc("name").unwrap();
        assert_eq!(query.sort_document(), &doc! { "age": 1, "n": -1 });

        let mut listed = datastore.find::<User>();
        listed.order("age, -name").unwrap();
        assert_eq!(listed.sort_document(), query.sort_document());
    }

    #[test]
    fn sorting_again_by_a_path_moves_it_last() {
        let datastore = datastore();
        let mut query = datastore.find::<User>();
        query
            .order_by("age")
            .unwrap()
            .order_by("name")
            .unwrap()
            .order_by_desc("age")
            .unwrap();
        assert_eq!(query.sort_document(), &doc! { "n": 1, "age": -1 });
        assert_eq!(query.sort_document().keys().collect::<Vec<_>>(), ["n", "age"]);

        query.order("name").unwrap();
        assert_eq!(query.sort_document().keys().collect::<Vec<_>>(), ["age", "n"]);
    }

    #[test]
    fn or_collects_branch_filters() {
        let datastore = datastore();
        let mut query = datastore.find::<User>();
        let mut young = query.branch();
        young.filter("age <", 18_i64).unwrap();
        let mut named = query.branch();
        named.filter("name", "Ada").unwrap();

        query.or([young, named]);

        assert_eq!(
            query.filter_document(),
            &doc! { "$or": [{ "age": { "$lt": 18_i64 } }, { "n": "Ada" }] }
        );
    }

    #[test]
    fn projection_and_window_reach_the_request() {
        let datastore = datastore();
        let mut query = datastore.find::<User>();
        query.include("name").unwrap().skip(5).limit(10);

        let request = query.find_request();
        assert_eq!(request.projection, Some(doc! { "n": 1 }));
        assert_eq!(request.skip, 5);
        assert_eq!(request.limit, Some(10));
        assert_eq!(request.sort, None);
    }
}
