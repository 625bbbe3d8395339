use std::ops::Range;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{FailedWrite, ModelBatch, WriteOptions};
use crate::{
    context::BatchError,
    database::{
        batch_size::{optimal_chunk_size, OperationKind},
        sql::build_case_update_sql,
    },
    events::BatchEvent,
    helpers::{format_duration, partition_ranges},
    metrics::store::{ops, record_outcome},
    record::{identity_of, Record},
    store::{RecordUpdate, StoreError},
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateManyReport {
    pub updated: usize,
    /// Updates dropped because they carried no identity value.
    pub missing_identity: usize,
    pub failed: usize,
    pub errors: Vec<FailedWrite>,
}

/// Updates written and failures for one chunk.
#[derive(Default)]
struct ChunkUpdate {
    updated: usize,
    /// Updates whose identity matched no stored row.
    unmatched: usize,
    errors: Vec<FailedWrite>,
}

impl ModelBatch<'_> {
    /// Applies identity-targeted updates.
    ///
    /// Relational stores get one `UPDATE ... SET col = CASE id ... END` per
    /// chunk. Document stores get one transaction per small chunk, falling
    /// back to record-by-record updates when the transaction fails.
    pub async fn update_many_by_id(
        &self,
        updates: Vec<Record>,
        options: WriteOptions,
    ) -> Result<UpdateManyReport, BatchError> {
        let started = Instant::now();
        let id_field = self.schema.id_field.as_str();
        let submitted = updates.len();

        let updates: Vec<RecordUpdate> = self
            .schema
            .normalize_records(updates)
            .into_iter()
            .filter_map(|record| {
                let id = identity_of(&record, id_field)?.clone();
                let data = record.into_iter().filter(|(field, _)| field != id_field).collect();
                Some(RecordUpdate { id, data })
            })
            .collect();

        let missing_identity = submitted - updates.len();
        if missing_identity > 0 {
            debug!(
                "{} update_many_by_id - dropped {} update(s) without {}",
                self.schema.name, missing_identity, id_field
            );
        }

        let mut report = self.apply_updates(updates, options).await?;
        report.missing_identity = missing_identity;

        info!(
            "{} update_many_by_id - updated {} of {} record(s), {} failed - took {}",
            self.schema.name,
            report.updated,
            submitted,
            report.failed,
            format_duration(started.elapsed())
        );

        Ok(report)
    }

    pub(super) async fn apply_updates(
        &self,
        updates: Vec<RecordUpdate>,
        options: WriteOptions,
    ) -> Result<UpdateManyReport, BatchError> {
        if updates.is_empty() {
            return Ok(UpdateManyReport::default());
        }

        let relational = self.provider().is_relational();
        let kind =
            if relational { OperationKind::Update } else { OperationKind::TransactionalWrite };
        let ranges = partition_ranges(updates.len(), optimal_chunk_size(self.provider(), kind))?;
        let updates = updates.as_slice();

        let operation = if relational { ops::EXECUTE_RAW } else { ops::TRANSACTION };
        let chunks = ranges
            .iter()
            .cloned()
            .enumerate()
            .map(|(chunk_index, range)| {
                move || self.update_chunk(relational, chunk_index, range, updates)
            })
            .collect();

        let result = self.run_chunks(operation, chunks, options, false).await;

        let mut report = UpdateManyReport::default();
        for (_, chunk) in result.results {
            report.updated += chunk.updated;
            report.failed += chunk.unmatched + chunk.errors.len();
            report.errors.extend(chunk.errors);
        }

        let chunk_errors = self.chunk_failures(operation, &ranges, result.errors);
        report.failed += chunk_errors.iter().map(FailedWrite::record_count).sum::<usize>();
        report.errors.extend(chunk_errors);

        record_outcome(ops::UPDATE, "updated", report.updated);
        record_outcome(ops::UPDATE, "failed", report.failed);

        Ok(report)
    }

    async fn update_chunk(
        &self,
        relational: bool,
        chunk_index: usize,
        range: Range<usize>,
        updates: &[RecordUpdate],
    ) -> Result<ChunkUpdate, StoreError> {
        let chunk = &updates[range.clone()];
        if relational {
            self.case_update_chunk(chunk_index, range, chunk).await
        } else {
            Ok(self.transactional_update_chunk(chunk_index, range, chunk).await)
        }
    }

    /// The affected-row count reported by the store is taken as the number of
    /// identities that matched. Any shortfall is counted as failed.
    async fn case_update_chunk(
        &self,
        chunk_index: usize,
        range: Range<usize>,
        chunk: &[RecordUpdate],
    ) -> Result<ChunkUpdate, StoreError> {
        let Some(sql) = build_case_update_sql(self.provider(), self.schema, chunk) else {
            debug!("{} - chunk {} has no columns to update", self.schema.name, chunk_index);
            return Ok(ChunkUpdate { updated: chunk.len(), ..Default::default() });
        };

        let store = self.store();
        let affected = self.call(ops::EXECUTE_RAW, || store.execute_raw_unsafe(&sql)).await?;
        let updated = usize::try_from(affected).unwrap_or(usize::MAX).min(chunk.len());
        let unmatched = chunk.len() - updated;

        if unmatched == 0 {
            debug!(
                "{} - chunk {} set-based update touched {} row(s)",
                self.schema.name, chunk_index, affected
            );
            return Ok(ChunkUpdate { updated, ..Default::default() });
        }

        let message = format!("{} of {} update(s) matched no stored row", unmatched, chunk.len());
        warn!(
            "{} - chunk {} (records {}..{}) {}",
            self.schema.name, chunk_index, range.start, range.end, message
        );

        Ok(ChunkUpdate {
            updated,
            unmatched,
            errors: vec![FailedWrite {
                operation: ops::EXECUTE_RAW,
                records: range,
                id: None,
                message,
            }],
        })
    }

    /// Never fails as a whole: a failed transaction degrades to per-record
    /// updates and only those individual failures are reported.
    async fn transactional_update_chunk(
        &self,
        chunk_index: usize,
        range: Range<usize>,
        chunk: &[RecordUpdate],
    ) -> ChunkUpdate {
        let store = self.store();
        let table = self.schema.table.as_str();
        let id_field = self.schema.id_field.as_str();

        let transaction =
            self.call(ops::TRANSACTION, || store.transaction(table, id_field, chunk)).await;

        let e = match transaction {
            Ok(()) => return ChunkUpdate { updated: chunk.len(), ..Default::default() },
            Err(e) => e,
        };

        self.reporter().report(&BatchEvent::TransactionFallback {
            model: self.schema.name.clone(),
            chunk_index,
            records: range.clone(),
            message: e.message,
        });

        let mut outcome = ChunkUpdate::default();
        for (offset, update) in chunk.iter().enumerate() {
            let single =
                self.call(ops::UPDATE, || store.update(table, id_field, &update.id, &update.data));

            match single.await {
                Ok(()) => outcome.updated += 1,
                Err(e) => {
                    self.reporter().report(&BatchEvent::RecordFailed {
                        model: self.schema.name.clone(),
                        id: update.id.clone(),
                        message: e.message.clone(),
                    });

                    let position = range.start + offset;
                    outcome.errors.push(FailedWrite {
                        operation: ops::UPDATE,
                        records: position..position + 1,
                        id: Some(update.id.clone()),
                        message: e.message,
                    });
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::{
        config::BatchOptions,
        context::BatchContext,
        events::ChannelReporter,
        model::{FieldSpec, ModelSchema},
        record::record_from,
        store::memory::{MemoryStore, StoreCall, StoreOperation},
    };

    fn tasks() -> ModelSchema {
        ModelSchema::new("Task", "tasks").field("cache", FieldSpec::ignored())
    }

    fn context(store: Arc<MemoryStore>) -> BatchContext {
        let mut context = BatchContext::configure(Some(store), BatchOptions::default()).unwrap();
        context.register_model(tasks()).unwrap();
        context
    }

    #[tokio::test]
    async fn test_relational_updates_use_one_case_statement() {
        let store = Arc::new(MemoryStore::new().with_raw_affected(2));
        let context = context(store.clone());

        let updates = vec![
            record_from(json!({ "id": 1, "status": "x", "cache": "dropped" })),
            record_from(json!({ "id": 2, "status": "y" })),
            record_from(json!({ "status": "no identity" })),
        ];

        let report = context
            .model("Task")
            .unwrap()
            .update_many_by_id(updates, WriteOptions::default())
            .await
            .unwrap();

        assert_eq!(report.updated, 2);
        assert_eq!(report.missing_identity, 1);

        let calls = store.calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            StoreCall::ExecuteRaw { sql } => {
                assert!(sql.contains("CASE id WHEN 1 THEN 'x' WHEN 2 THEN 'y' ELSE status END"));
                assert!(sql.contains("WHERE id IN (1, 2)"));
                assert!(!sql.contains("cache"));
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unmatched_identities_are_not_counted_as_updated() {
        let store = Arc::new(MemoryStore::new());
        store.seed("tasks", vec![record_from(json!({ "id": 1, "status": "new" }))]);
        let context = context(store.clone());

        let updates = [1, 998, 999]
            .iter()
            .map(|id| record_from(json!({ "id": id, "status": "x" })))
            .collect();
        let report = context
            .model("Task")
            .unwrap()
            .update_many_by_id(updates, WriteOptions::default())
            .await
            .unwrap();

        assert_eq!((report.updated, report.failed), (1, 2));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].records, 0..3);
        assert_eq!(report.errors[0].id, None);
        assert_eq!(report.errors[0].message, "2 of 3 update(s) matched no stored row");
    }

    #[tokio::test]
    async fn test_relational_chunk_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(StoreOperation::ExecuteRaw, StoreError::other("syntax error"));
        let context = context(store.clone());

        let report = context
            .model("Task")
            .unwrap()
            .update_many_by_id(
                vec![record_from(json!({ "id": 1, "status": "x" }))],
                WriteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(report.updated, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors[0].message, "syntax error");
    }

    #[tokio::test]
    async fn test_document_store_uses_transactions() {
        let store = Arc::new(MemoryStore::new().with_engine("mongodb"));
        store.seed("tasks", vec![record_from(json!({ "id": 1 })), record_from(json!({ "id": 2 }))]);
        let context = context(store.clone());

        let report = context
            .model("Task")
            .unwrap()
            .update_many_by_id(
                vec![
                    record_from(json!({ "id": 1, "status": "x" })),
                    record_from(json!({ "id": 2, "status": "y" })),
                ],
                WriteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(report.updated, 2);
        assert_eq!(store.calls_of(StoreOperation::Transaction).len(), 1);
        assert!(store.calls_of(StoreOperation::Update).is_empty());
        assert_eq!(store.rows("tasks")[1]["status"], json!("y"));
    }

    #[tokio::test]
    async fn test_transaction_failure_falls_back_per_record() {
        let store = Arc::new(MemoryStore::new().with_engine("mongodb"));
        store.seed(
            "tasks",
            (1..=3).map(|id| record_from(json!({ "id": id, "status": "new" }))).collect(),
        );
        store.fail_always(StoreOperation::Transaction, StoreError::other("transaction aborted"));
        store.fail_for_id(StoreOperation::Update, json!(2), StoreError::other("write conflict"));

        let (sender, mut receiver) = unbounded_channel();
        let mut context = BatchContext::configure_with_reporter(
            Some(store.clone()),
            BatchOptions::default(),
            Arc::new(ChannelReporter::new(sender)),
        )
        .unwrap();
        context.register_model(tasks()).unwrap();

        let updates =
            (1..=3).map(|id| record_from(json!({ "id": id, "status": "done" }))).collect();
        let report = context
            .model("Task")
            .unwrap()
            .update_many_by_id(updates, WriteOptions::default())
            .await
            .unwrap();

        assert_eq!(report.updated, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors[0].id, Some(json!(2)));
        assert_eq!(report.errors[0].records, 1..2);

        let statuses: Vec<_> =
            store.rows("tasks").iter().map(|row| row["status"].clone()).collect();
        assert_eq!(statuses, vec![json!("done"), json!("new"), json!("done")]);

        let events: Vec<BatchEvent> = std::iter::from_fn(|| receiver.try_recv().ok()).collect();
        assert!(events.iter().any(|event| matches!(event, BatchEvent::TransactionFallback { .. })));
        assert!(events.iter().any(
            |event| matches!(event, BatchEvent::RecordFailed { id, .. } if *id == json!(2))
        ));
    }

    #[tokio::test]
    async fn test_document_store_chunks_are_small() {
        let store = Arc::new(MemoryStore::new().with_engine("mongodb"));
        store.seed("tasks", (0..60).map(|id| record_from(json!({ "id": id }))).collect());
        let context = context(store.clone());

        let updates = (0..60).map(|id| record_from(json!({ "id": id, "status": "x" }))).collect();
        let report = context
            .model("Task")
            .unwrap()
            .update_many_by_id(updates, WriteOptions::default())
            .await
            .unwrap();

        assert_eq!(report.updated, 60);
        // 25 per transaction
        assert_eq!(store.calls_of(StoreOperation::Transaction).len(), 3);
    }
}
