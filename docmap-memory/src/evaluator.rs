//! Filter, sort and projection evaluation for in-memory documents.
//!
//! Filters use the operator document format produced by the docmap query builder:
//! plain values match by equality, `{ "$op": operand }` documents apply operators, and
//! `$or`, `$and` and `$nor` combine nested filters at the top level. Dotted paths
//! descend into embedded documents and fan out over arrays, so a condition on
//! `tags` or `items.name` matches when any element satisfies it.

use std::cmp::Ordering;

use bson::{Bson, Document};
use regex::RegexBuilder;

use docmap_core::error::{DocMapError, DocMapResult};

/// Returns `true` if `document` satisfies every condition of `filter`.
pub fn matches(document: &Document, filter: &Document) -> DocMapResult<bool> {
    for (key, condition) in filter {
        let satisfied = match key.as_str() {
            "$or" => {
                let mut any = false;
                for branch in branches(key, condition)? {
                    if matches(document, branch)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$and" => {
                let mut all = true;
                for branch in branches(key, condition)? {
                    if !matches(document, branch)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$nor" => {
                let mut none = true;
                for branch in branches(key, condition)? {
                    if matches(document, branch)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            "$where" => {
                return Err(DocMapError::Backend(
                    "$where expressions are not supported by the in-memory store".to_string(),
                ));
            }
            operator if operator.starts_with('$') => {
                return Err(DocMapError::IllegalFilterExpression(format!(
                    "unsupported top-level operator '{operator}'"
                )));
            }
            path => matches_condition(&lookup(document, path), condition)?,
        };

        if !satisfied {
            return Ok(false);
        }
    }

    Ok(true)
}

fn branches<'a>(operator: &str, condition: &'a Bson) -> DocMapResult<Vec<&'a Document>> {
    let Bson::Array(items) = condition else {
        return Err(DocMapError::IllegalFilterExpression(format!(
            "{operator} expects an array of filters"
        )));
    };

    items
        .iter()
        .map(|item| match item {
            Bson::Document(branch) => Ok(branch),
            other => Err(DocMapError::IllegalFilterExpression(format!(
                "{operator} branch is not a document: {other}"
            ))),
        })
        .collect()
}

fn is_operator_document(condition: &Bson) -> Option<&Document> {
    match condition {
        Bson::Document(operators)
            if !operators.is_empty()
                && !operators.contains_key("$ref")
                && operators.keys().all(|key| key.starts_with('$')) =>
        {
            Some(operators)
        }
        _ => None,
    }
}

fn matches_condition(values: &[&Bson], condition: &Bson) -> DocMapResult<bool> {
    let Some(operators) = is_operator_document(condition) else {
        return Ok(matches_equal(values, condition));
    };

    for (operator, operand) in operators {
        let satisfied = match operator.as_str() {
            "$eq" => matches_equal(values, operand),
            "$ne" => !matches_equal(values, operand),
            "$gt" => matches_ordering(values, operand, |ordering| ordering.is_gt()),
            "$gte" => matches_ordering(values, operand, |ordering| ordering.is_ge()),
            "$lt" => matches_ordering(values, operand, |ordering| ordering.is_lt()),
            "$lte" => matches_ordering(values, operand, |ordering| ordering.is_le()),
            "$in" => sequence(operator, operand)?
                .iter()
                .any(|candidate| matches_equal(values, candidate)),
            "$nin" => !sequence(operator, operand)?
                .iter()
                .any(|candidate| matches_equal(values, candidate)),
            "$all" => {
                let wanted = sequence(operator, operand)?;
                !wanted.is_empty()
                    && wanted
                        .iter()
                        .all(|candidate| matches_equal(values, candidate))
            }
            "$exists" => truthy(operand) == !values.is_empty(),
            "$size" => {
                let size = integer(operator, operand)?;
                values.iter().any(|value| match value {
                    Bson::Array(items) => items.len() as i64 == size,
                    _ => false,
                })
            }
            "$mod" => matches_modulo(values, operand)?,
            "$regex" => {
                let options = operators.get_str("$options").unwrap_or_default();
                matches_pattern(values, operand, options)?
            }
            "$options" => true,
            other => {
                return Err(DocMapError::IllegalFilterExpression(format!(
                    "unsupported operator '{other}'"
                )));
            }
        };

        if !satisfied {
            return Ok(false);
        }
    }

    Ok(true)
}

fn sequence<'a>(operator: &str, operand: &'a Bson) -> DocMapResult<&'a [Bson]> {
    match operand {
        Bson::Array(items) => Ok(items),
        other => Err(DocMapError::IllegalFilterExpression(format!(
            "{operator} expects an array but found {other}"
        ))),
    }
}

fn integer(operator: &str, operand: &Bson) -> DocMapResult<i64> {
    match operand {
        Bson::Int32(value) => Ok(i64::from(*value)),
        Bson::Int64(value) => Ok(*value),
        Bson::Double(value) if value.fract() == 0.0 && (-9.223372036854775808e18..9.223372036854775808e18).contains(value) => {
            Ok(*value as i64)
        }
        other => Err(DocMapError::IllegalFilterExpression(format!(
            "{operator} expects an integer but found {other}"
        ))),
    }
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(flag) => *flag,
        Bson::Int32(value) => *value != 0,
        Bson::Int64(value) => *value != 0,
        Bson::Double(value) => *value != 0.0,
        Bson::Null => false,
        _ => true,
    }
}

fn matches_equal(values: &[&Bson], target: &Bson) -> bool {
    if values.is_empty() {
        return matches!(target, Bson::Null);
    }
    values.iter().any(|value| equal(value, target))
}

fn matches_ordering(values: &[&Bson], operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    values.iter().any(|value| {
        type_order(value) == type_order(operand) && accept(compare(value, operand))
    })
}

fn matches_modulo(values: &[&Bson], operand: &Bson) -> DocMapResult<bool> {
    let terms = sequence("$mod", operand)?;
    let [divisor, remainder] = terms else {
        return Err(DocMapError::IllegalFilterExpression(
            "$mod expects [divisor, remainder]".to_string(),
        ));
    };
    let divisor = integer("$mod", divisor)?;
    let remainder = integer("$mod", remainder)?;
    if divisor == 0 {
        return Err(DocMapError::IllegalFilterExpression(
            "$mod divisor cannot be zero".to_string(),
        ));
    }

    Ok(values.iter().any(|value| {
        let number = match value {
            Bson::Int32(number) => i64::from(*number),
            Bson::Int64(number) => *number,
            Bson::Double(number) => *number as i64,
            _ => return false,
        };
        number.wrapping_rem(divisor) == remainder
    }))
}

fn matches_pattern(values: &[&Bson], operand: &Bson, options: &str) -> DocMapResult<bool> {
    let pattern = match operand {
        Bson::String(pattern) => pattern,
        other => {
            return Err(DocMapError::IllegalFilterExpression(format!(
                "$regex expects a pattern but found {other}"
            )));
        }
    };

    let regex = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|err| DocMapError::IllegalFilterExpression(err.to_string()))?;

    Ok(values.iter().any(|value| match value {
        Bson::String(text) => regex.is_match(text),
        _ => false,
    }))
}

/// Collects every value reachable through a dotted path.
///
/// Arrays met along the way are searched element by element. A terminal array is
/// returned itself followed by its elements.
pub fn lookup<'a>(document: &'a Document, path: &str) -> Vec<&'a Bson> {
    let segments = path.split('.').collect::<Vec<_>>();
    let mut values = Vec::new();

    if let Some((head, rest)) = segments.split_first()
        && let Some(value) = document.get(*head)
    {
        descend(value, rest, &mut values);
    }

    values
}

fn descend<'a>(value: &'a Bson, segments: &[&str], out: &mut Vec<&'a Bson>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        if let Bson::Array(items) = value {
            out.extend(items.iter());
        }
        return;
    };

    match value {
        Bson::Document(document) => {
            if let Some(next) = document.get(*head) {
                descend(next, rest, out);
            }
        }
        Bson::Array(items) => {
            if let Ok(position) = head.parse::<usize>()
                && let Some(item) = items.get(position)
            {
                descend(item, rest, out);
            }
            for item in items.iter().filter(|item| matches!(item, Bson::Document(_))) {
                descend(item, segments, out);
            }
        }
        _ => {}
    }
}

/// Structural equality that treats numbers of different widths as equal values.
pub fn equal(left: &Bson, right: &Bson) -> bool {
    match (left, right) {
        (Bson::Array(left), Bson::Array(right)) => {
            left.len() == right.len() && left.iter().zip(right).all(|(l, r)| equal(l, r))
        }
        (Bson::Document(left), Bson::Document(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .zip(right)
                    .all(|((lk, lv), (rk, rv))| lk == rk && equal(lv, rv))
        }
        _ if is_number(left) && is_number(right) => compare(left, right) == Ordering::Equal,
        _ => left == right,
    }
}

fn is_number(value: &Bson) -> bool {
    matches!(value, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_))
}

// Cross-type ordering rank, lowest first.
fn type_order(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 255,
        _ => 12,
    }
}

/// Total order over stored values used for sorting and range operators.
pub fn compare(left: &Bson, right: &Bson) -> Ordering {
    let by_type = type_order(left).cmp(&type_order(right));
    if by_type != Ordering::Equal {
        return by_type;
    }

    match (left, right) {
        (Bson::Int32(l), Bson::Int32(r)) => l.cmp(r),
        (Bson::Int64(l), Bson::Int64(r)) => l.cmp(r),
        (Bson::Int32(l), Bson::Int64(r)) => i64::from(*l).cmp(r),
        (Bson::Int64(l), Bson::Int32(r)) => l.cmp(&i64::from(*r)),
        (l, r) if is_number(l) && is_number(r) => {
            as_f64(l).partial_cmp(&as_f64(r)).unwrap_or(Ordering::Equal)
        }
        (Bson::String(l), Bson::String(r)) => l.cmp(r),
        (Bson::Document(l), Bson::Document(r)) => {
            for ((lk, lv), (rk, rv)) in l.iter().zip(r) {
                let ordering = lk.cmp(rk).then_with(|| compare(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            l.len().cmp(&r.len())
        }
        (Bson::Array(l), Bson::Array(r)) => {
            for (lv, rv) in l.iter().zip(r) {
                let ordering = compare(lv, rv);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            l.len().cmp(&r.len())
        }
        (Bson::Binary(l), Bson::Binary(r)) => l.bytes.cmp(&r.bytes),
        (Bson::ObjectId(l), Bson::ObjectId(r)) => l.bytes().cmp(&r.bytes()),
        (Bson::Boolean(l), Bson::Boolean(r)) => l.cmp(r),
        (Bson::DateTime(l), Bson::DateTime(r)) => l.cmp(r),
        (Bson::Timestamp(l), Bson::Timestamp(r)) => (l.time, l.increment).cmp(&(r.time, r.increment)),
        _ => Ordering::Equal,
    }
}

fn as_f64(value: &Bson) -> f64 {
    match value {
        Bson::Int32(value) => f64::from(*value),
        Bson::Int64(value) => *value as f64,
        Bson::Double(value) => *value,
        _ => f64::NAN,
    }
}

/// Sorts documents by a sort document of `path: 1 | -1` entries, in key order.
pub fn sort_documents(documents: &mut [Document], sort: &Document) {
    let keys = sort
        .iter()
        .map(|(path, direction)| (path.as_str(), is_descending(direction)))
        .collect::<Vec<_>>();

    documents.sort_by(|left, right| {
        for (path, descending) in &keys {
            let left_value = lookup(left, path).first().copied().unwrap_or(&Bson::Null);
            let right_value = lookup(right, path).first().copied().unwrap_or(&Bson::Null);
            let ordering = compare(left_value, right_value);
            let ordering = if *descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn is_descending(direction: &Bson) -> bool {
    match direction {
        Bson::Int32(value) => *value < 0,
        Bson::Int64(value) => *value < 0,
        Bson::Double(value) => *value < 0.0,
        Bson::String(value) => value.eq_ignore_ascii_case("desc"),
        _ => false,
    }
}

/// Applies an inclusion or exclusion projection.
///
/// A projection with any truthy flag keeps only the listed paths and `_id` unless
/// `_id` is switched off. Otherwise the listed paths are removed.
pub fn project(document: Document, projection: &Document) -> Document {
    if projection.is_empty() {
        return document;
    }

    let including = projection.values().any(truthy);

    if including {
        let mut projected = Document::new();
        let keep_id = projection.get("_id").is_none_or(truthy);
        if keep_id && let Some(id) = document.get("_id") {
            projected.insert("_id", id.clone());
        }
        for (path, flag) in projection {
            if path != "_id" && truthy(flag) {
                let segments = path.split('.').collect::<Vec<_>>();
                include(&document, &mut projected, &segments);
            }
        }
        projected
    } else {
        let mut projected = document;
        for (path, flag) in projection {
            if !truthy(flag) {
                let segments = path.split('.').collect::<Vec<_>>();
                exclude(&mut projected, &segments);
            }
        }
        projected
    }
}

fn include(source: &Document, target: &mut Document, segments: &[&str]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let Some(value) = source.get(*head) else {
        return;
    };

    if rest.is_empty() {
        target.insert(*head, value.clone());
    } else if let Bson::Document(inner) = value {
        let mut nested = match target.remove(*head) {
            Some(Bson::Document(nested)) => nested,
            _ => Document::new(),
        };
        include(inner, &mut nested, rest);
        target.insert(*head, nested);
    }
}

fn exclude(target: &mut Document, segments: &[&str]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        target.remove(*head);
    } else if let Some(Bson::Document(inner)) = target.get_mut(*head) {
        exclude(inner, rest);
    }
}
