//! Statically declared field mapping per record kind.
//!
//! A [`ModelSchema`] is built once at startup and drives record normalisation,
//! SQL literal rendering and uniqueness checks. Normalisation only looks at
//! the top-level keys of a record; nested values are passed through as data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::record::Record;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Scalar,
    /// Stored in a JSON typed column.
    Json,
    /// Stored in a native array column of scalars.
    ScalarArray,
    DateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    ToOne,
    ToMany,
    ManyToMany,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSpec {
    pub kind: RelationKind,
    /// Column on this model holding the related identity (to-one only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
    /// Identity field on the related model.
    #[serde(default = "default_id_field")]
    pub references: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Storage column when it differs from the field name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,

    #[serde(default)]
    pub ignored: bool,

    #[serde(default)]
    pub kind: FieldKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<RelationSpec>,
}

impl FieldSpec {
    pub fn scalar() -> Self {
        Self::default()
    }

    pub fn json() -> Self {
        Self { kind: FieldKind::Json, ..Self::default() }
    }

    pub fn scalar_array() -> Self {
        Self { kind: FieldKind::ScalarArray, ..Self::default() }
    }

    pub fn date_time() -> Self {
        Self { kind: FieldKind::DateTime, ..Self::default() }
    }

    pub fn ignored() -> Self {
        Self { ignored: true, ..Self::default() }
    }

    pub fn to_one(foreign_key: impl Into<String>) -> Self {
        Self {
            relation: Some(RelationSpec {
                kind: RelationKind::ToOne,
                foreign_key: Some(foreign_key.into()),
                references: default_id_field(),
            }),
            ..Self::default()
        }
    }

    pub fn to_many() -> Self {
        Self::relation(RelationKind::ToMany)
    }

    pub fn many_to_many() -> Self {
        Self::relation(RelationKind::ManyToMany)
    }

    fn relation(kind: RelationKind) -> Self {
        Self {
            relation: Some(RelationSpec {
                kind,
                foreign_key: None,
                references: default_id_field(),
            }),
            ..Self::default()
        }
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

fn default_id_field() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSchema {
    pub name: String,
    pub table: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    /// Field groups the store enforces as unique, by storage column.
    #[serde(default)]
    pub unique_constraints: Vec<Vec<String>>,
}

impl ModelSchema {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            id_field: default_id_field(),
            fields: BTreeMap::new(),
            unique_constraints: Vec::new(),
        }
    }

    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn unique(mut self, group: &[&str]) -> Self {
        self.unique_constraints.push(group.iter().map(|field| field.to_string()).collect());
        self
    }

    /// The spec for a storage column, looked up by column name or field name.
    pub fn spec_for_column(&self, column: &str) -> Option<&FieldSpec> {
        self.fields.get(column).filter(|spec| spec.column.is_none()).or_else(|| {
            self.fields.values().find(|spec| spec.column.as_deref() == Some(column))
        })
    }

    pub fn column_kind(&self, column: &str) -> FieldKind {
        self.spec_for_column(column).map(|spec| spec.kind).unwrap_or_default()
    }

    /// Maps a caller record to the shape the store expects: leading underscores
    /// are stripped from keys, ignored fields and to-many relations dropped,
    /// to-one relation objects flattened to their foreign key column and fields
    /// renamed to their storage column.
    pub fn normalize_record(&self, record: Record) -> Record {
        let mut normalized = Record::with_capacity(record.len());

        for (key, value) in record {
            let field = key.trim_start_matches('_');
            if field.is_empty() {
                continue;
            }

            let Some(spec) = self.fields.get(field) else {
                normalized.insert(field.to_string(), value);
                continue;
            };

            if spec.ignored {
                continue;
            }

            match &spec.relation {
                None => {
                    let column = spec.column.as_deref().unwrap_or(field);
                    normalized.insert(column.to_string(), value);
                }
                Some(RelationSpec { kind: RelationKind::ToOne, foreign_key, references }) => {
                    let Some(foreign_key) = foreign_key else {
                        debug!("{}.{} has no foreign key column, dropping", self.name, field);
                        continue;
                    };
                    let related_id = match value {
                        Value::Object(mut related) => {
                            related.remove(references.as_str()).unwrap_or(Value::Null)
                        }
                        other => other,
                    };
                    // an explicit foreign key in the same record wins
                    if !normalized.contains_key(foreign_key.as_str()) {
                        normalized.insert(foreign_key.clone(), related_id);
                    }
                }
                Some(_) => {
                    debug!(
                        "{}.{} is a to-many relation, not written with the record",
                        self.name, field
                    );
                }
            }
        }

        normalized
    }

    pub fn normalize_records(&self, records: Vec<Record>) -> Vec<Record> {
        records.into_iter().map(|record| self.normalize_record(record)).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::record::record_from;

    fn post_schema() -> ModelSchema {
        ModelSchema::new("Post", "posts")
            .field("author", FieldSpec::to_one("author_id"))
            .field("tags", FieldSpec::many_to_many())
            .field("comments", FieldSpec::to_many())
            .field("cache", FieldSpec::ignored())
            .field("title", FieldSpec::scalar().with_column("post_title"))
            .field("meta", FieldSpec::json())
            .unique(&["slug"])
    }

    #[test]
    fn test_normalize_record() {
        let record = record_from(json!({
            "_id": 1,
            "title": "Hello",
            "author": { "id": 7, "name": "A" },
            "tags": [{ "id": 1 }],
            "comments": [],
            "cache": "x",
            "meta": { "_keep": true },
            "slug": "hello",
        }));

        let normalized = post_schema().normalize_record(record);
        assert_eq!(
            normalized,
            record_from(json!({
                "id": 1,
                "post_title": "Hello",
                "author_id": 7,
                "meta": { "_keep": true },
                "slug": "hello",
            }))
        );
    }

    #[test]
    fn test_to_one_scalar_and_null() {
        let schema = post_schema();
        assert_eq!(
            schema.normalize_record(record_from(json!({ "author": 3 }))),
            record_from(json!({ "author_id": 3 }))
        );
        assert_eq!(
            schema.normalize_record(record_from(json!({ "author": null }))),
            record_from(json!({ "author_id": null }))
        );
    }

    #[test]
    fn test_explicit_foreign_key_wins() {
        let normalized = post_schema()
            .normalize_record(record_from(json!({ "author_id": 5, "author": { "id": 9 } })));
        assert_eq!(normalized, record_from(json!({ "author_id": 5 })));
    }

    #[test]
    fn test_spec_for_column() {
        let schema = post_schema();
        assert_eq!(schema.column_kind("meta"), FieldKind::Json);
        assert!(schema.spec_for_column("post_title").is_some());
        assert!(schema.spec_for_column("title").is_none());
        assert_eq!(schema.column_kind("unknown"), FieldKind::Scalar);
    }

    #[test]
    fn test_schema_from_yaml() {
        let yaml = r#"
          name: User
          table: users
          fields:
            profile:
              kind: json
            roles:
              kind: scalar_array
          unique_constraints:
            - [email]
        "#;

        let schema: ModelSchema = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(schema.id_field, "id");
        assert_eq!(schema.column_kind("roles"), FieldKind::ScalarArray);
        assert_eq!(schema.unique_constraints, vec![vec!["email".to_string()]]);
    }
}
