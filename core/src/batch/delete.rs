use serde_json::Value;
use tokio::time::Instant;
use tracing::info;

use super::{first_failure, ModelBatch, WriteOptions};
use crate::{
    context::BatchError,
    database::batch_size::{optimal_chunk_size, OperationKind},
    helpers::{format_duration, partition},
    metrics::store::{ops, record_outcome},
    store::StoreError,
};

impl ModelBatch<'_> {
    /// Deletes records by identity, one `IN` list per chunk.
    ///
    /// The first failed chunk aborts the chunks not yet dispatched and its
    /// error is returned; rows deleted by earlier chunks stay deleted.
    pub async fn delete_by_ids(
        &self,
        ids: Vec<Value>,
        options: WriteOptions,
    ) -> Result<u64, BatchError> {
        let started = Instant::now();
        let ids: Vec<Value> = ids.into_iter().filter(|id| !id.is_null()).collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let requested = ids.len();
        let chunks = partition(ids, optimal_chunk_size(self.provider(), OperationKind::Delete))?;
        let operations =
            chunks.iter().map(|chunk| move || self.delete_chunk(chunk.as_slice())).collect();

        let result = self.run_chunks(ops::DELETE_MANY, operations, options, true).await;
        if let Some(e) = first_failure(result.errors) {
            return Err(e);
        }

        let deleted: u64 = result.results.iter().map(|(_, count)| count).sum();
        record_outcome(ops::DELETE_MANY, "deleted", deleted as usize);

        info!(
            "{} delete_by_ids - deleted {} of {} requested - took {}",
            self.schema.name,
            deleted,
            requested,
            format_duration(started.elapsed())
        );

        Ok(deleted)
    }

    async fn delete_chunk(&self, ids: &[Value]) -> Result<u64, StoreError> {
        let store = self.store();
        let (table, id_field) = (self.schema.table.as_str(), self.schema.id_field.as_str());
        self.call(ops::DELETE_MANY, || store.delete_many(table, id_field, ids)).await
    }
}
