use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use super::{first_failure, ModelBatch, WriteOptions};
use crate::{
    context::BatchError,
    helpers::partition,
    metrics::store::ops,
    record::{identity_of, Record},
    store::{Filter, StoreError},
};

/// Most values sent in a single `IN` list.
pub const MAX_IN_LIST_VALUES: usize = 10_000;

impl ModelBatch<'_> {
    /// Finds records whose `field` is one of `values`, splitting long value
    /// lists into several queries. Results come back in query order with
    /// records returned by more than one query kept once.
    pub async fn find_many_in(
        &self,
        field: &str,
        values: Vec<Value>,
    ) -> Result<Vec<Record>, BatchError> {
        if values.is_empty() {
            return Ok(Vec::new());
        }

        let chunk_size =
            MAX_IN_LIST_VALUES.min(self.context.capabilities().max_placeholders).max(1);
        let chunks = partition(values, chunk_size)?;
        debug!(
            "{} find_many_in {} - {} query(ies) of up to {} value(s)",
            self.schema.name,
            field,
            chunks.len(),
            chunk_size
        );

        let operations = chunks
            .into_iter()
            .map(|chunk| move || self.find_chunk(Filter::is_in(field, chunk)))
            .collect();

        let result =
            self.run_chunks(ops::FIND_MANY, operations, WriteOptions::default(), true).await;
        if let Some(e) = first_failure(result.errors) {
            return Err(e);
        }

        let id_field = self.schema.id_field.as_str();
        let mut seen = HashSet::new();
        let records = result
            .results
            .into_iter()
            .flat_map(|(_, records)| records)
            .filter(|record| match identity_of(record, id_field) {
                Some(id) => seen.insert(id.to_string()),
                None => true,
            })
            .collect();

        Ok(records)
    }

    async fn find_chunk(&self, filter: Filter) -> Result<Vec<Record>, StoreError> {
        let store = self.store();
        let table = self.schema.table.as_str();
        self.call(ops::FIND_MANY, || store.find_many(table, &filter)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        config::BatchOptions,
        context::BatchContext,
        model::ModelSchema,
        record::record_from,
        store::memory::{MemoryStore, StoreCall, StoreOperation},
    };

    fn context(store: Arc<MemoryStore>) -> BatchContext {
        let mut context = BatchContext::configure(Some(store), BatchOptions::default()).unwrap();
        context.register_model(ModelSchema::new("Task", "tasks")).unwrap();
        context
    }

    #[tokio::test]
    async fn test_long_lists_are_split_and_deduplicated() {
        let store = Arc::new(MemoryStore::new());
        store.seed(
            "tasks",
            (1..=3).map(|id| record_from(json!({ "id": id, "status": "open" }))).collect(),
        );
        let context = context(store.clone());

        // id 2 appears in the first and the last query
        let mut values: Vec<Value> = (1..=3).map(|id| json!(id)).collect();
        values.extend((100..20_100).map(|id| json!(id)));
        values.push(json!(2));

        let records = context.model("Task").unwrap().find_many_in("id", values).await.unwrap();

        let ids: Vec<Value> = records.iter().map(|record| record["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);

        let queries = store.calls_of(StoreOperation::FindMany);
        assert_eq!(queries.len(), 3);
        match &queries[0] {
            StoreCall::FindMany { filter: Filter::In(field, values), .. } => {
                assert_eq!(field, "id");
                assert_eq!(values.len(), MAX_IN_LIST_VALUES);
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chunks_respect_placeholder_limit() {
        let store = Arc::new(MemoryStore::new().with_engine("sqlite"));
        let context = context(store.clone());

        let values = (0..2000).map(|id| json!(id)).collect();
        let records = context.model("Task").unwrap().find_many_in("id", values).await.unwrap();

        assert!(records.is_empty());
        assert_eq!(store.calls_of(StoreOperation::FindMany).len(), 3);
    }
}
