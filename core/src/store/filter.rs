use serde_json::Value;

use crate::{compare::values_equal, record::Record};

/// Conditions a store evaluates when finding records.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Filter::Eq(field.into(), value)
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In(field.into(), values)
    }

    /// Bound values the filter needs once rendered as a parameterised query.
    pub fn placeholder_count(&self) -> usize {
        match self {
            Filter::Eq(_, _) => 1,
            Filter::In(_, values) => values.len(),
            Filter::And(filters) | Filter::Or(filters) => {
                filters.iter().map(Filter::placeholder_count).sum()
            }
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::Eq(field, expected) => {
                record.get(field).is_some_and(|actual| values_equal(actual, expected))
            }
            Filter::In(field, values) => record
                .get(field)
                .is_some_and(|actual| values.iter().any(|expected| values_equal(actual, expected))),
            Filter::And(filters) => filters.iter().all(|filter| filter.matches(record)),
            Filter::Or(filters) => filters.iter().any(|filter| filter.matches(record)),
        }
    }
}
