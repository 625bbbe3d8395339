//! Change detection and intra-batch deduplication.
//!
//! Values are normalised before comparison: null, a missing field and a blank
//! string are all "empty", strings are trimmed and RFC 3339 timestamps compare
//! by instant. Objects and arrays are compared structurally, never through
//! their serialised form.

use std::collections::HashSet;

use chrono::DateTime;
use serde_json::{Number, Value};

use crate::record::Record;

/// Identity and audit timestamp fields never count as a change.
pub const STANDARD_IGNORED_FIELDS: &[&str] =
    &["id", "createdAt", "updatedAt", "created_at", "updated_at"];

enum Normalized<'a> {
    Empty,
    Str(&'a str),
    Other(&'a Value),
}

fn normalize(value: Option<&Value>) -> Normalized<'_> {
    match value {
        None | Some(Value::Null) => Normalized::Empty,
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Normalized::Empty
            } else {
                Normalized::Str(trimmed)
            }
        }
        Some(other) => Normalized::Other(other),
    }
}

fn strings_equal(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }

    match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if a == b {
        return true;
    }

    match (a.as_i64(), b.as_i64()) {
        (Some(a), Some(b)) => a == b,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

/// Structural equality: arrays are order-sensitive, objects compare key sets
/// and values recursively.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| deep_equal(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(key, a)| b.get(key).is_some_and(|b| deep_equal(a, b)))
        }
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        _ => a == b,
    }
}

fn normalized_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (normalize(a), normalize(b)) {
        (Normalized::Empty, Normalized::Empty) => true,
        (Normalized::Str(a), Normalized::Str(b)) => strings_equal(a, b),
        (Normalized::Other(a), Normalized::Other(b)) => deep_equal(a, b),
        _ => false,
    }
}

/// Equality after normalisation.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    normalized_equal(Some(a), Some(b))
}

fn is_ignored(field: &str, ignore_fields: &[&str]) -> bool {
    STANDARD_IGNORED_FIELDS.contains(&field) || ignore_fields.contains(&field)
}

/// Whether any non-ignored field of `new_record` differs from `existing`.
pub fn has_changes(new_record: &Record, existing: &Record, ignore_fields: &[&str]) -> bool {
    new_record
        .iter()
        .filter(|(field, _)| !is_ignored(field, ignore_fields))
        .any(|(field, value)| !normalized_equal(Some(value), existing.get(field)))
}

/// The fields of `new_record` that differ from `existing`, in `new_record` order.
pub fn change_set(new_record: &Record, existing: &Record, ignore_fields: &[&str]) -> Record {
    new_record
        .iter()
        .filter(|(field, _)| !is_ignored(field, ignore_fields))
        .filter(|(field, value)| !normalized_equal(Some(*value), existing.get(field.as_str())))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect()
}

fn canonical_component(value: &Value) -> Option<String> {
    match normalize(Some(value)) {
        Normalized::Empty => None,
        Normalized::Str(s) => Some(format!("s:{}", s)),
        Normalized::Other(Value::Number(n)) => match n.as_i64() {
            Some(i) => Some(format!("n:{}", i)),
            None => n.as_f64().map(|f| format!("n:{}", f)),
        },
        Normalized::Other(other) => Some(format!("v:{}", other)),
    }
}

/// Signature of `record` for one uniqueness group. `None` when any field of the
/// group is empty, since stores do not enforce uniqueness over nulls.
pub fn group_signature(record: &Record, group_index: usize, group: &[String]) -> Option<String> {
    if group.is_empty() {
        return None;
    }

    let mut signature = format!("{}", group_index);
    for field in group {
        let component = canonical_component(record.get(field)?)?;
        signature.push('\u{1f}');
        signature.push_str(&component);
    }
    Some(signature)
}

/// Signatures of every uniqueness group `record` fully populates.
pub fn constraint_signatures(record: &Record, constraints: &[Vec<String>]) -> Vec<String> {
    constraints
        .iter()
        .enumerate()
        .filter_map(|(index, group)| group_signature(record, index, group))
        .collect()
}

/// Drops every record that shares any uniqueness group signature with an
/// earlier kept record. A kept record seeds all of its signatures.
pub fn deduplicate(records: Vec<Record>, constraints: &[Vec<String>]) -> Vec<Record> {
    if constraints.is_empty() {
        return records;
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(records.len());

    for record in records {
        let signatures = constraint_signatures(&record, constraints);
        if signatures.iter().any(|signature| seen.contains(signature)) {
            continue;
        }
        seen.extend(signatures);
        kept.push(record);
    }

    kept
}
