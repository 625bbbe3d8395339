//! SQL text generation for relational providers.
//!
//! Statements are rendered with inline literals rather than bind parameters so
//! a whole chunk travels as one raw statement. Every literal goes through
//! [`escape_literal`], which follows the target provider's literal syntax.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::{
    database::capabilities::Provider,
    model::{FieldKind, ModelSchema},
    record::Record,
    store::{Filter, RecordUpdate},
};

/// Reserved SQL keywords that need quoting.
pub const RESERVED_KEYWORDS: &[&str] = &[
    "all", "and", "as", "asc", "by", "case", "check", "column", "default", "desc", "distinct",
    "else", "end", "from", "group", "having", "in", "index", "key", "limit", "not", "null",
    "offset", "or", "order", "primary", "references", "select", "table", "then", "to", "union",
    "user", "when", "where",
];

fn is_simple_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Quotes an identifier if it's a reserved keyword or would not survive case folding.
pub fn quote_identifier(provider: Provider, name: &str) -> String {
    if is_simple_identifier(name) && !RESERVED_KEYWORDS.contains(&name) {
        return name.to_string();
    }

    match provider {
        Provider::Mysql => format!("`{}`", name.replace('`', "``")),
        Provider::SqlServer => format!("[{}]", name.replace(']', "]]")),
        Provider::Postgres | Provider::Sqlite | Provider::MongoDb => {
            format!("\"{}\"", name.replace('"', "\"\""))
        }
    }
}

/// Formats a table name, handling schema.table format.
pub fn format_table_name(provider: Provider, table_name: &str) -> String {
    table_name
        .split('.')
        .map(|part| quote_identifier(provider, part.trim_matches('"')))
        .collect::<Vec<_>>()
        .join(".")
}

fn quote_string(provider: Provider, value: &str) -> String {
    let escaped = value.replace('\'', "''");
    match provider {
        Provider::Mysql => format!("'{}'", escaped.replace('\\', "\\\\")),
        _ => format!("'{}'", escaped),
    }
}

fn bool_literal(provider: Provider, value: bool) -> String {
    match (provider, value) {
        (Provider::Postgres, true) => "TRUE".to_string(),
        (Provider::Postgres, false) => "FALSE".to_string(),
        (_, true) => "1".to_string(),
        (_, false) => "0".to_string(),
    }
}

fn json_literal(provider: Provider, value: &Value) -> String {
    let quoted = quote_string(provider, &value.to_string());
    match provider {
        Provider::Postgres => format!("{}::jsonb", quoted),
        Provider::Mysql => format!("CAST({} AS JSON)", quoted),
        _ => quoted,
    }
}

fn array_literal(provider: Provider, items: &[Value]) -> String {
    match provider {
        Provider::Postgres if items.is_empty() => "'{}'".to_string(),
        Provider::Postgres => {
            let elements = items
                .iter()
                .map(|item| escape_literal(provider, item, FieldKind::Scalar))
                .collect::<Vec<_>>()
                .join(", ");
            format!("ARRAY[{}]", elements)
        }
        // no native arrays, stored as JSON text
        _ => quote_string(provider, &Value::Array(items.to_vec()).to_string()),
    }
}

fn datetime_literal(provider: Provider, value: &str) -> String {
    let Ok(parsed) = DateTime::parse_from_rfc3339(value.trim()) else {
        return quote_string(provider, value);
    };
    let utc = parsed.with_timezone(&Utc);

    match provider {
        Provider::Postgres => {
            format!("'{}'::timestamptz", utc.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        Provider::Mysql | Provider::SqlServer => {
            format!("'{}'", utc.format("%Y-%m-%d %H:%M:%S%.3f"))
        }
        Provider::Sqlite | Provider::MongoDb => {
            format!("'{}'", utc.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
    }
}

/// Renders `value` as a literal for a column of `kind`.
///
/// Objects and arrays in a scalar column are written as JSON. Scalar array
/// columns use the provider's native array form where it has one.
pub fn escape_literal(provider: Provider, value: &Value, kind: FieldKind) -> String {
    match (kind, value) {
        (_, Value::Null) => "NULL".to_string(),
        (FieldKind::ScalarArray, Value::Array(items)) => array_literal(provider, items),
        (_, Value::Array(_)) | (_, Value::Object(_)) => json_literal(provider, value),
        (FieldKind::Json, scalar) => json_literal(provider, scalar),
        (FieldKind::DateTime, Value::String(s)) => datetime_literal(provider, s),
        (_, Value::Bool(b)) => bool_literal(provider, *b),
        (_, Value::Number(n)) => n.to_string(),
        (_, Value::String(s)) => quote_string(provider, s),
    }
}

fn kind_of(schema: Option<&ModelSchema>, column: &str) -> FieldKind {
    schema.map(|schema| schema.column_kind(column)).unwrap_or_default()
}

fn id_list(provider: Provider, ids: &[Value]) -> String {
    ids.iter()
        .map(|id| escape_literal(provider, id, FieldKind::Scalar))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renders a filter as a `WHERE` condition.
pub fn render_filter(provider: Provider, filter: &Filter) -> String {
    match filter {
        Filter::Eq(field, Value::Null) => {
            format!("{} IS NULL", quote_identifier(provider, field))
        }
        Filter::Eq(field, value) => format!(
            "{} = {}",
            quote_identifier(provider, field),
            escape_literal(provider, value, FieldKind::Scalar)
        ),
        Filter::In(_, values) if values.is_empty() => "1 = 0".to_string(),
        Filter::In(field, values) => {
            format!("{} IN ({})", quote_identifier(provider, field), id_list(provider, values))
        }
        Filter::And(filters) if filters.is_empty() => "1 = 1".to_string(),
        Filter::Or(filters) if filters.is_empty() => "1 = 0".to_string(),
        Filter::And(filters) => join_filters(provider, filters, " AND "),
        Filter::Or(filters) => join_filters(provider, filters, " OR "),
    }
}

fn join_filters(provider: Provider, filters: &[Filter], separator: &str) -> String {
    if filters.len() == 1 {
        return render_filter(provider, &filters[0]);
    }
    let rendered =
        filters.iter().map(|filter| render_filter(provider, filter)).collect::<Vec<_>>();
    format!("({})", rendered.join(separator))
}

pub fn build_select_sql(provider: Provider, table: &str, filter: &Filter) -> String {
    format!(
        "SELECT * FROM {} WHERE {}",
        format_table_name(provider, table),
        render_filter(provider, filter)
    )
}

/// Columns in first-seen order across `records`.
fn collect_columns<'a>(records: impl IntoIterator<Item = &'a Record>) -> Vec<&'a str> {
    let mut columns: Vec<&str> = Vec::new();
    for record in records {
        for column in record.keys() {
            if !columns.contains(&column.as_str()) {
                columns.push(column);
            }
        }
    }
    columns
}

/// Builds a multi-row `INSERT`. Columns missing from a row take the column
/// default. `None` when there is nothing to insert.
pub fn build_insert_sql(
    provider: Provider,
    table: &str,
    records: &[Record],
    skip_duplicates: bool,
    schema: Option<&ModelSchema>,
) -> Option<String> {
    let columns = collect_columns(records);
    if columns.is_empty() {
        return None;
    }

    // sqlite has no DEFAULT keyword inside VALUES
    let missing = if provider == Provider::Sqlite { "NULL" } else { "DEFAULT" };

    let rows = records
        .iter()
        .map(|record| {
            let values = columns
                .iter()
                .map(|column| match record.get(*column) {
                    Some(value) => escape_literal(provider, value, kind_of(schema, column)),
                    None => missing.to_string(),
                })
                .collect::<Vec<_>>();
            format!("({})", values.join(", "))
        })
        .collect::<Vec<_>>();

    let formatted_columns =
        columns.iter().map(|col| quote_identifier(provider, col)).collect::<Vec<_>>().join(", ");
    let formatted_table = format_table_name(provider, table);

    let query = match (skip_duplicates, provider) {
        (true, Provider::Mysql) => format!(
            "INSERT IGNORE INTO {} ({}) VALUES {}",
            formatted_table,
            formatted_columns,
            rows.join(", ")
        ),
        (true, Provider::Postgres | Provider::Sqlite) => format!(
            "INSERT INTO {} ({}) VALUES {} ON CONFLICT DO NOTHING",
            formatted_table,
            formatted_columns,
            rows.join(", ")
        ),
        _ => format!(
            "INSERT INTO {} ({}) VALUES {}",
            formatted_table,
            formatted_columns,
            rows.join(", ")
        ),
    };

    Some(query)
}

/// Builds a single-row `UPDATE ... WHERE id = ...`. `None` when `data` only
/// holds the identity field.
pub fn build_update_sql(
    provider: Provider,
    table: &str,
    id_field: &str,
    id: &Value,
    data: &Record,
    schema: Option<&ModelSchema>,
) -> Option<String> {
    let set_clauses = data
        .iter()
        .filter(|(column, _)| column.as_str() != id_field)
        .map(|(column, value)| {
            format!(
                "{} = {}",
                quote_identifier(provider, column),
                escape_literal(provider, value, kind_of(schema, column))
            )
        })
        .collect::<Vec<_>>();

    if set_clauses.is_empty() {
        return None;
    }

    Some(format!(
        "UPDATE {} SET {} WHERE {} = {}",
        format_table_name(provider, table),
        set_clauses.join(", "),
        quote_identifier(provider, id_field),
        escape_literal(provider, id, FieldKind::Scalar)
    ))
}

/// Builds one set-based `UPDATE` for a chunk of identity-targeted updates.
///
/// Every column touched by any update gets a
/// `col = CASE id WHEN <id> THEN <value> ... ELSE col END` clause listing only
/// the updates that set it, so rows keep their current value otherwise.
/// `None` when no update carries a column besides the identity.
pub fn build_case_update_sql(
    provider: Provider,
    schema: &ModelSchema,
    updates: &[RecordUpdate],
) -> Option<String> {
    let id_field = schema.id_field.as_str();
    let columns: Vec<&str> = collect_columns(updates.iter().map(|update| &update.data))
        .into_iter()
        .filter(|column| *column != id_field)
        .collect();

    if updates.is_empty() || columns.is_empty() {
        return None;
    }

    let quoted_id = quote_identifier(provider, id_field);

    let set_clauses = columns
        .iter()
        .map(|column| {
            let kind = schema.column_kind(column);
            let quoted_column = quote_identifier(provider, column);
            let branches = updates
                .iter()
                .filter_map(|update| {
                    update.data.get(*column).map(|value| {
                        format!(
                            "WHEN {} THEN {}",
                            escape_literal(provider, &update.id, FieldKind::Scalar),
                            escape_literal(provider, value, kind)
                        )
                    })
                })
                .collect::<Vec<_>>();

            format!(
                "{} = CASE {} {} ELSE {} END",
                quoted_column,
                quoted_id,
                branches.join(" "),
                quoted_column
            )
        })
        .collect::<Vec<_>>();

    let ids: Vec<Value> = updates.iter().map(|update| update.id.clone()).collect();

    Some(format!(
        "UPDATE {} SET {} WHERE {} IN ({})",
        format_table_name(provider, &schema.table),
        set_clauses.join(", "),
        quoted_id,
        id_list(provider, &ids)
    ))
}

pub fn build_delete_sql(provider: Provider, table: &str, id_field: &str, ids: &[Value]) -> String {
    if ids.is_empty() {
        return format!("DELETE FROM {} WHERE 1 = 0", format_table_name(provider, table));
    }

    format!(
        "DELETE FROM {} WHERE {} IN ({})",
        format_table_name(provider, table),
        quote_identifier(provider, id_field),
        id_list(provider, ids)
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{model::FieldSpec, record::record_from};

    fn update(id: Value, data: Value) -> RecordUpdate {
        RecordUpdate { id, data: record_from(data) }
    }

    #[test]
    fn test_case_update_sql() {
        let schema = ModelSchema::new("Task", "tasks");
        let updates = vec![
            update(json!(1), json!({ "id": 1, "status": "x" })),
            update(json!(2), json!({ "id": 2, "status": "y" })),
        ];

        let sql = build_case_update_sql(Provider::Postgres, &schema, &updates).unwrap();

        assert_eq!(
            sql,
            "UPDATE tasks SET status = CASE id WHEN 1 THEN 'x' WHEN 2 THEN 'y' ELSE status END \
             WHERE id IN (1, 2)"
        );
        assert_eq!(sql.matches("CASE id").count(), 1);
    }

    #[test]
    fn test_case_update_partial_columns() {
        let schema = ModelSchema::new("Task", "tasks");
        let updates = vec![
            update(json!(1), json!({ "status": "x" })),
            update(json!(2), json!({ "priority": 3 })),
        ];

        let sql = build_case_update_sql(Provider::Mysql, &schema, &updates).unwrap();

        assert!(sql.contains("status = CASE id WHEN 1 THEN 'x' ELSE status END"));
        assert!(sql.contains("priority = CASE id WHEN 2 THEN 3 ELSE priority END"));
        assert!(sql.ends_with("WHERE id IN (1, 2)"));
    }

    #[test]
    fn test_case_update_nothing_to_set() {
        let schema = ModelSchema::new("Task", "tasks");
        assert!(build_case_update_sql(Provider::Postgres, &schema, &[]).is_none());
        assert!(build_case_update_sql(
            Provider::Postgres,
            &schema,
            &[update(json!(1), json!({ "id": 1 }))]
        )
        .is_none());
    }

    #[test]
    fn test_case_update_json_and_array_columns() {
        let schema = ModelSchema::new("User", "users")
            .field("profile", FieldSpec::json())
            .field("roles", FieldSpec::scalar_array());
        let updates =
            vec![update(json!(1), json!({ "profile": { "bio": "it's" }, "roles": ["a", "b"] }))];

        let sql = build_case_update_sql(Provider::Postgres, &schema, &updates).unwrap();
        assert!(sql.contains(r#"WHEN 1 THEN '{"bio":"it''s"}'::jsonb"#));
        assert!(sql.contains("WHEN 1 THEN ARRAY['a', 'b']"));

        let sql = build_case_update_sql(Provider::Mysql, &schema, &updates).unwrap();
        assert!(sql.contains(r#"CAST('{"bio":"it''s"}' AS JSON)"#));
        assert!(sql.contains(r#"WHEN 1 THEN '["a","b"]'"#));
    }

    #[test]
    fn test_escape_literal() {
        let pg = Provider::Postgres;
        assert_eq!(escape_literal(pg, &json!(null), FieldKind::Scalar), "NULL");
        assert_eq!(escape_literal(pg, &json!(true), FieldKind::Scalar), "TRUE");
        assert_eq!(escape_literal(Provider::Sqlite, &json!(false), FieldKind::Scalar), "0");
        assert_eq!(escape_literal(pg, &json!(1.5), FieldKind::Scalar), "1.5");
        assert_eq!(escape_literal(pg, &json!("O'Brien"), FieldKind::Scalar), "'O''Brien'");
        assert_eq!(escape_literal(Provider::Mysql, &json!(r"a\b"), FieldKind::Scalar), r"'a\\b'");
        assert_eq!(escape_literal(pg, &json!([]), FieldKind::ScalarArray), "'{}'");
        assert_eq!(escape_literal(pg, &json!("x"), FieldKind::Json), r#"'"x"'::jsonb"#);
    }

    #[test]
    fn test_datetime_literal() {
        let value = json!("2024-03-01T10:00:00+02:00");
        assert_eq!(
            escape_literal(Provider::Postgres, &value, FieldKind::DateTime),
            "'2024-03-01T08:00:00.000Z'::timestamptz"
        );
        assert_eq!(
            escape_literal(Provider::Mysql, &value, FieldKind::DateTime),
            "'2024-03-01 08:00:00.000'"
        );
        assert_eq!(
            escape_literal(Provider::Postgres, &json!("not a date"), FieldKind::DateTime),
            "'not a date'"
        );
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier(Provider::Postgres, "status"), "status");
        assert_eq!(quote_identifier(Provider::Postgres, "user"), "\"user\"");
        assert_eq!(quote_identifier(Provider::Postgres, "createdAt"), "\"createdAt\"");
        assert_eq!(quote_identifier(Provider::Mysql, "order"), "`order`");
        assert_eq!(quote_identifier(Provider::SqlServer, "key"), "[key]");
        assert_eq!(format_table_name(Provider::Postgres, "app.user"), "app.\"user\"");
    }

    #[test]
    fn test_render_filter() {
        let filter = Filter::Or(vec![
            Filter::And(vec![Filter::eq("org", json!(1)), Filter::eq("slug", json!("a"))]),
            Filter::is_in("id", vec![json!(4), json!(5)]),
            Filter::eq("deletedAt", Value::Null),
        ]);

        assert_eq!(
            render_filter(Provider::Postgres, &filter),
            "((org = 1 AND slug = 'a') OR id IN (4, 5) OR \"deletedAt\" IS NULL)"
        );
        assert_eq!(render_filter(Provider::Postgres, &Filter::is_in("id", vec![])), "1 = 0");
    }

    #[test]
    fn test_insert_sql() {
        let records = vec![
            record_from(json!({ "email": "a@x.com", "name": "A" })),
            record_from(json!({ "email": "b@x.com" })),
        ];

        assert_eq!(
            build_insert_sql(Provider::Postgres, "users", &records, true, None).unwrap(),
            "INSERT INTO users (email, name) VALUES ('a@x.com', 'A'), ('b@x.com', DEFAULT) \
             ON CONFLICT DO NOTHING"
        );
        assert!(build_insert_sql(Provider::Mysql, "users", &records, true, None)
            .unwrap()
            .starts_with("INSERT IGNORE INTO users"));
        assert!(build_insert_sql(Provider::Sqlite, "users", &records, false, None)
            .unwrap()
            .ends_with("('b@x.com', NULL)"));
        assert!(build_insert_sql(Provider::Postgres, "users", &[], false, None).is_none());
    }

    #[test]
    fn test_update_and_delete_sql() {
        let data = record_from(json!({ "id": 7, "name": "B" }));
        assert_eq!(
            build_update_sql(Provider::Postgres, "users", "id", &json!(7), &data, None).unwrap(),
            "UPDATE users SET name = 'B' WHERE id = 7"
        );
        assert_eq!(
            build_delete_sql(Provider::Postgres, "users", "id", &[json!(1), json!("2")]),
            "DELETE FROM users WHERE id IN (1, '2')"
        );
    }
}
