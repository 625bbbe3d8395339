use serde_json::{Map, Value};

/// An ordered field name to value mapping, as handed to and returned by a store.
pub type Record = Map<String, Value>;

/// Unwraps a JSON object into a record. Anything else yields an empty record.
pub fn record_from(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

/// The identity value of a record, ignoring explicit nulls.
pub fn identity_of<'a>(record: &'a Record, id_field: &str) -> Option<&'a Value> {
    record.get(id_field).filter(|value| !value.is_null())
}
