// ============================================================================
// Query Evaluation (filter / sort / pipeline)
// ============================================================================
//
// The subset of server-side query semantics the in-memory store needs:
// equality and comparison filters, compound sorts, and the
// $match / $sort / $skip / $limit / $project pipeline stages.
//
// ============================================================================

use crate::core::{DbError, Result};
use bson::{Bson, Document};
use std::cmp::Ordering;

/// Canonical type order used when comparing values of different BSON types
fn type_rank(value: &Bson) -> u8 {
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
        Bson::MaxKey => 13,
        _ => 12,
    }
}

pub(crate) fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

pub(crate) fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(*v as i64),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}

/// Total order over BSON values, numbers compared across widths
pub fn compare_bson(a: &Bson, b: &Bson) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        (Bson::Binary(x), Bson::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then_with(|| x.bytes.cmp(&y.bytes)),
        (Bson::Array(x), Bson::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_bson(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Document(x), Bson::Document(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_bson(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

/// Resolve a dotted path (`a.b.c`) inside a document
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

fn is_operator_doc(value: &Bson) -> Option<&Document> {
    match value {
        Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$')) => Some(d),
        _ => None,
    }
}

fn values_equal(field: Option<&Bson>, expected: &Bson) -> bool {
    match field {
        Some(Bson::Array(items)) if !matches!(expected, Bson::Array(_)) => items
            .iter()
            .any(|item| compare_bson(item, expected) == Ordering::Equal),
        Some(value) => compare_bson(value, expected) == Ordering::Equal,
        None => matches!(expected, Bson::Null),
    }
}

fn matches_operator(field: Option<&Bson>, op: &str, arg: &Bson) -> Result<bool> {
    let ordered = |want: &[Ordering]| match field {
        Some(value) if type_rank(value) == type_rank(arg) => {
            want.contains(&compare_bson(value, arg))
        }
        _ => false,
    };

    let matched = match op {
        "$eq" => values_equal(field, arg),
        "$ne" => !values_equal(field, arg),
        "$gt" => ordered(&[Ordering::Greater]),
        "$gte" => ordered(&[Ordering::Greater, Ordering::Equal]),
        "$lt" => ordered(&[Ordering::Less]),
        "$lte" => ordered(&[Ordering::Less, Ordering::Equal]),
        "$in" | "$nin" => {
            let Bson::Array(candidates) = arg else {
                return Err(DbError::remote("find", format!("{} needs an array", op)));
            };
            let found = candidates.iter().any(|c| values_equal(field, c));
            if op == "$in" { found } else { !found }
        }
        "$exists" => {
            let want = match arg {
                Bson::Boolean(b) => *b,
                other => as_i64(other).is_some_and(|n| n != 0),
            };
            field.is_some() == want
        }
        other => {
            return Err(DbError::remote(
                "find",
                format!("unknown operator: {}", other),
            ));
        }
    };
    Ok(matched)
}

/// Evaluate a query filter against a document
pub fn matches(filter: &Document, doc: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let Bson::Array(clauses) = condition else {
                    return Err(DbError::remote("find", format!("{} must be an array", key)));
                };
                let mut results = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    let Bson::Document(sub) = clause else {
                        return Err(DbError::remote(
                            "find",
                            format!("{} entries must be objects", key),
                        ));
                    };
                    results.push(matches(sub, doc)?);
                }
                match key.as_str() {
                    "$and" => results.iter().all(|r| *r),
                    "$or" => results.iter().any(|r| *r),
                    _ => !results.iter().any(|r| *r),
                }
            }
            _ => {
                let field = lookup(doc, key);
                match is_operator_doc(condition) {
                    Some(ops) => {
                        let mut all = true;
                        for (op, arg) in ops {
                            if !matches_operator(field, op, arg)? {
                                all = false;
                                break;
                            }
                        }
                        all
                    }
                    None => values_equal(field, condition),
                }
            }
        };

        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Stable sort by a `{ field: 1 | -1, ... }` sort document
pub fn sort_documents(docs: &mut [Document], spec: &Document) -> Result<()> {
    let mut keys = Vec::with_capacity(spec.len());
    for (field, direction) in spec {
        let dir = as_i64(direction).ok_or_else(|| {
            DbError::remote("find", format!("invalid sort direction for '{}'", field))
        })?;
        if dir != 1 && dir != -1 {
            return Err(DbError::remote(
                "find",
                format!("sort direction for '{}' must be 1 or -1", field),
            ));
        }
        keys.push((field.clone(), dir));
    }

    docs.sort_by(|a, b| {
        for (field, dir) in &keys {
            let null = Bson::Null;
            let l = lookup(a, field).unwrap_or(&null);
            let r = lookup(b, field).unwrap_or(&null);
            let ord = compare_bson(l, r);
            if ord != Ordering::Equal {
                return if *dir < 0 { ord.reverse() } else { ord };
            }
        }
        Ordering::Equal
    });
    Ok(())
}

fn project(doc: &Document, spec: &Document) -> Document {
    let inclusion = spec
        .iter()
        .any(|(k, v)| k != "_id" && as_i64(v).map_or(matches!(v, Bson::Boolean(true)), |n| n != 0));
    let keep_id = spec
        .get("_id")
        .map_or(true, |v| as_i64(v).map_or(matches!(v, Bson::Boolean(true)), |n| n != 0));

    let mut out = Document::new();
    if inclusion {
        if keep_id {
            if let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
        }
        for (key, _) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
            if let Some(value) = doc.get(key) {
                out.insert(key.clone(), value.clone());
            }
        }
    } else {
        for (key, value) in doc {
            let excluded = if key == "_id" { !keep_id } else { spec.contains_key(key) };
            if !excluded {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

fn stage_count(stage: &str, value: &Bson) -> Result<usize> {
    as_i64(value)
        .filter(|n| *n >= 0)
        .map(|n| n as usize)
        .ok_or_else(|| DbError::remote("aggregate", format!("{} must be a non-negative integer", stage)))
}

/// Run an aggregation pipeline over an already-materialized input
pub fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Document]) -> Result<Vec<Document>> {
    for stage in pipeline {
        let mut iter = stage.iter();
        let (name, arg) = match (iter.next(), iter.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(DbError::remote(
                    "aggregate",
                    "a pipeline stage must contain exactly one field",
                ));
            }
        };

        docs = match (name.as_str(), arg) {
            ("$match", Bson::Document(filter)) => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(filter, &doc)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            ("$sort", Bson::Document(spec)) => {
                sort_documents(&mut docs, spec)?;
                docs
            }
            ("$skip", value) => {
                let n = stage_count("$skip", value)?;
                docs.into_iter().skip(n).collect()
            }
            ("$limit", value) => {
                let n = stage_count("$limit", value)?;
                docs.into_iter().take(n).collect()
            }
            ("$project", Bson::Document(spec)) => docs.iter().map(|d| project(d, spec)).collect(),
            (other, _) => {
                return Err(DbError::remote(
                    "aggregate",
                    format!("Unrecognized pipeline stage name: '{}'", other),
                ));
            }
        };
    }
    Ok(docs)
}

/// Default index name: `field_direction` pairs joined by `_` (`x_1`, `y_-1`)
pub fn index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(field, direction)| {
            let dir = match direction {
                Bson::String(s) => s.clone(),
                other => as_i64(other).map_or_else(|| other.to_string(), |n| n.to_string()),
            };
            format!("{}_{}", field, dir)
        })
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_numeric_comparison_across_widths() {
        assert_eq!(compare_bson(&Bson::Int32(3), &Bson::Int64(3)), Ordering::Equal);
        assert_eq!(compare_bson(&Bson::Int32(2), &Bson::Double(2.5)), Ordering::Less);
        assert_eq!(
            compare_bson(&Bson::Null, &Bson::Int32(0)),
            Ordering::Less
        );
    }

    #[test]
    fn test_equality_and_operators() {
        let doc = doc! { "_id": 4, "filename": "a.txt", "meta": { "size": 10 } };
        assert!(matches(&doc! {}, &doc).unwrap());
        assert!(matches(&doc! { "_id": 4i64 }, &doc).unwrap());
        assert!(matches(&doc! { "meta.size": { "$gte": 10, "$lt": 11 } }, &doc).unwrap());
        assert!(matches(&doc! { "_id": { "$in": [1, 2, 4] } }, &doc).unwrap());
        assert!(!matches(&doc! { "filename": "b.txt" }, &doc).unwrap());
        assert!(matches(&doc! { "missing": { "$exists": false } }, &doc).unwrap());
        assert!(
            matches(&doc! { "$or": [ { "_id": 1 }, { "filename": "a.txt" } ] }, &doc).unwrap()
        );
    }

    #[test]
    fn test_unknown_operator_is_remote_error() {
        let err = matches(&doc! { "x": { "$near": 1 } }, &doc! { "x": 1 }).unwrap_err();
        assert!(err.is_remote());
    }

    #[test]
    fn test_sort_compound() {
        let mut docs = vec![
            doc! { "a": 1, "b": 2 },
            doc! { "a": 0, "b": 5 },
            doc! { "a": 1, "b": 1 },
        ];
        sort_documents(&mut docs, &doc! { "a": 1, "b": -1 }).unwrap();
        let pairs: Vec<(i32, i32)> = docs
            .iter()
            .map(|d| (d.get_i32("a").unwrap(), d.get_i32("b").unwrap()))
            .collect();
        assert_eq!(pairs, vec![(0, 5), (1, 2), (1, 1)]);
    }

    #[test]
    fn test_pipeline_stages() {
        let docs: Vec<Document> = (0..10).map(|i| doc! { "_id": i, "v": i * 2 }).collect();
        let out = run_pipeline(
            docs,
            &[
                doc! { "$match": { "_id": { "$gte": 2 } } },
                doc! { "$sort": { "_id": -1 } },
                doc! { "$skip": 1 },
                doc! { "$limit": 2 },
                doc! { "$project": { "v": 1, "_id": 0 } },
            ],
        )
        .unwrap();
        assert_eq!(out, vec![doc! { "v": 16 }, doc! { "v": 14 }]);
    }

    #[test]
    fn test_unknown_stage() {
        let err = run_pipeline(vec![], &[doc! { "$bogus": {} }]).unwrap_err();
        assert!(err.is_remote());
    }

    #[test]
    fn test_index_name() {
        assert_eq!(index_name(&doc! { "x": 1 }), "x_1");
        assert_eq!(index_name(&doc! { "y": -1 }), "y_-1");
        assert_eq!(index_name(&doc! { "a": 1, "b": -1 }), "a_1_b_-1");
    }
}
