use std::collections::HashMap;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    CreateManyReport, CreateOptions, FailedWrite, ModelBatch, UpdateManyReport, WriteOptions,
};
use crate::{
    compare::{change_set, constraint_signatures, deduplicate, group_signature},
    context::BatchError,
    events::BatchEvent,
    helpers::format_duration,
    metrics::store::{ops, record_outcome},
    record::{identity_of, Record},
    store::{Filter, RecordUpdate, StoreError},
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertReport {
    pub created: usize,
    pub updated: usize,
    /// Records matching a stored record with no changes, never written.
    pub unchanged: usize,
    /// Records that were meant to be created or updated but were not written.
    pub failed: usize,
    /// Records dropped before probing because an earlier record had the same unique key.
    pub duplicates: usize,
    /// Records classified, after duplicates were dropped.
    pub total: usize,
    pub errors: Vec<FailedWrite>,
}

/// Where each record of an upsert goes.
#[derive(Default)]
struct Classification {
    creates: Vec<Record>,
    updates: Vec<RecordUpdate>,
    unchanged: usize,
    errors: Vec<FailedWrite>,
}

impl ModelBatch<'_> {
    /// Creates records that have no stored match on any unique constraint and
    /// writes only the changed fields of those that do.
    ///
    /// Fails before touching the store when the model declares no unique
    /// constraints, and when probing for existing records fails.
    pub async fn upsert_many(
        &self,
        records: Vec<Record>,
        options: WriteOptions,
    ) -> Result<UpsertReport, BatchError> {
        let started = Instant::now();
        let constraints = &self.schema.unique_constraints;
        if constraints.is_empty() {
            return Err(BatchError::Validation(format!(
                "{} has no unique constraints, upsert cannot match existing records",
                self.schema.name
            )));
        }

        let normalized = self.schema.normalize_records(records);
        let submitted = normalized.len();
        let records = deduplicate(normalized, constraints);
        let duplicates = submitted - records.len();

        if duplicates > 0 {
            self.reporter().report(&BatchEvent::DuplicatesDropped {
                model: self.schema.name.clone(),
                count: duplicates,
            });
        }

        let mut report = UpsertReport { duplicates, total: records.len(), ..Default::default() };
        if records.is_empty() {
            return Ok(report);
        }

        let existing = self.find_existing(&records).await?;
        let classification = self.classify(records, &existing);

        report.unchanged = classification.unchanged;
        report.failed = classification.errors.len();
        report.errors = classification.errors;

        debug!(
            "{} upsert_many - {} to create, {} to update, {} unchanged",
            self.schema.name,
            classification.creates.len(),
            classification.updates.len(),
            classification.unchanged
        );

        let create_options = CreateOptions {
            skip_duplicates: false,
            parallel: options.parallel,
            concurrency: options.concurrency,
        };
        let (creates, updates) = (classification.creates, classification.updates);

        let (created, updated) = if !creates.is_empty() &&
            !updates.is_empty() &&
            self.run_parallel(options, 2)
        {
            futures::join!(
                self.insert_records(&creates, create_options),
                self.apply_updates(updates, options)
            )
        } else {
            let created = self.insert_records(&creates, create_options).await;
            let updated = self.apply_updates(updates, options).await;
            (created, updated)
        };

        self.merge_created(&mut report, created?, creates.len());
        self.merge_updated(&mut report, updated?);

        record_outcome(ops::UPDATE, "unchanged", report.unchanged);

        info!(
            "{} upsert_many - {} created, {} updated, {} unchanged, {} failed of {} - took {}",
            self.schema.name,
            report.created,
            report.updated,
            report.unchanged,
            report.failed,
            report.total,
            format_duration(started.elapsed())
        );

        Ok(report)
    }

    /// One condition per fully populated unique group of each record.
    fn probe_conditions(&self, records: &[Record]) -> Vec<Filter> {
        let constraints = &self.schema.unique_constraints;
        let mut conditions = Vec::new();

        for record in records {
            for (index, group) in constraints.iter().enumerate() {
                if group_signature(record, index, group).is_none() {
                    continue;
                }

                let mut equalities: Vec<Filter> = group
                    .iter()
                    .filter_map(|field| {
                        record.get(field).map(|value| Filter::eq(field.clone(), value.clone()))
                    })
                    .collect();

                let condition = match equalities.len() {
                    1 => equalities.remove(0),
                    _ => Filter::And(equalities),
                };
                conditions.push(condition);
            }
        }

        conditions
    }

    /// Probes the store for records matching any input record on any unique
    /// group, splitting the OR condition to stay under the placeholder limit.
    async fn find_existing(&self, records: &[Record]) -> Result<Vec<Record>, StoreError> {
        let max_placeholders = self.context.capabilities().max_placeholders;
        let budget = (max_placeholders - max_placeholders / 10).max(1);

        let mut probes: Vec<Vec<Filter>> = Vec::new();
        let mut current = Vec::new();
        let mut placeholders = 0;

        for condition in self.probe_conditions(records) {
            let needed = condition.placeholder_count();
            if !current.is_empty() && placeholders + needed > budget {
                probes.push(std::mem::take(&mut current));
                placeholders = 0;
            }
            placeholders += needed;
            current.push(condition);
        }
        if !current.is_empty() {
            probes.push(current);
        }

        debug!(
            "{} upsert_many - probing {} record(s) in {} round trip(s)",
            self.schema.name,
            records.len(),
            probes.len()
        );

        let store = self.store();
        let table = self.schema.table.as_str();
        let mut existing = Vec::new();

        for conditions in probes {
            let filter = Filter::Or(conditions);
            let found = self.call(ops::FIND_MANY, || store.find_many(table, &filter)).await?;
            existing.extend(found);
        }

        Ok(existing)
    }

    fn classify(&self, records: Vec<Record>, existing: &[Record]) -> Classification {
        let constraints = &self.schema.unique_constraints;
        let id_field = self.schema.id_field.as_str();

        let mut index: HashMap<String, usize> = HashMap::new();
        for (position, row) in existing.iter().enumerate() {
            for signature in constraint_signatures(row, constraints) {
                index.entry(signature).or_insert(position);
            }
        }

        let mut classification = Classification::default();

        for (position, record) in records.into_iter().enumerate() {
            let matched = constraint_signatures(&record, constraints)
                .iter()
                .find_map(|signature| index.get(signature).copied());

            let Some(matched) = matched else {
                classification.creates.push(record);
                continue;
            };

            let stored = &existing[matched];
            let Some(id) = identity_of(stored, id_field) else {
                warn!(
                    "{} upsert_many - stored record matching record {} has no {}",
                    self.schema.name, position, id_field
                );
                classification.errors.push(FailedWrite {
                    operation: ops::UPDATE,
                    records: position..position + 1,
                    id: None,
                    message: format!("matched stored record has no {}", id_field),
                });
                continue;
            };

            let changes = change_set(&record, stored, &[id_field]);
            if changes.is_empty() {
                classification.unchanged += 1;
            } else {
                classification.updates.push(RecordUpdate { id: id.clone(), data: changes });
            }
        }

        classification
    }

    fn merge_created(
        &self,
        report: &mut UpsertReport,
        created: CreateManyReport,
        attempted: usize,
    ) {
        report.created += created.count as usize;
        report.failed += created.failed;
        report.errors.extend(created.errors);

        // written by someone else between the probe and the insert
        if created.skipped > 0 {
            warn!(
                "{} upsert_many - {} record(s) appeared after probing and were not written",
                self.schema.name, created.skipped
            );
            report.failed += created.skipped;
            report.errors.push(FailedWrite {
                operation: ops::CREATE_MANY,
                records: 0..attempted,
                id: None,
                message: format!(
                    "{} record(s) already existed when inserted and were skipped",
                    created.skipped
                ),
            });
        }
    }

    fn merge_updated(&self, report: &mut UpsertReport, updated: UpdateManyReport) {
        report.updated += updated.updated;
        report.failed += updated.failed;
        report.errors.extend(updated.errors);
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

    fn users() -> ModelSchema {
        ModelSchema::new("User", "users").unique(&["email"])
    }

    fn context(store: Arc<MemoryStore>, schema: ModelSchema) -> BatchContext {
        let mut context = BatchContext::configure(Some(store), BatchOptions::default()).unwrap();
        context.register_model(schema).unwrap();
        context
    }

    fn seeded(engine: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new().with_engine(engine).with_schema(&users()));
        store.seed("users", vec![record_from(json!({ "id": 1, "email": "a@x.com", "name": "A" }))]);
        store
    }

    #[tokio::test]
    async fn test_unchanged_then_updated() {
        let store = seeded("postgres");
        let context = context(store.clone(), users());
        let users = context.model("User").unwrap();

        let report = users
            .upsert_many(
                vec![record_from(json!({ "email": "a@x.com", "name": "A" }))],
                WriteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            (report.created, report.updated, report.unchanged, report.total),
            (0, 0, 1, 1)
        );
        assert!(store.calls_of(StoreOperation::ExecuteRaw).is_empty());

        let report = users
            .upsert_many(
                vec![record_from(json!({ "email": "a@x.com", "name": "B" }))],
                WriteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            (report.created, report.updated, report.unchanged, report.total),
            (0, 1, 0, 1)
        );

        match &store.calls_of(StoreOperation::ExecuteRaw)[0] {
            StoreCall::ExecuteRaw { sql } => {
                assert!(sql.contains("name = CASE id WHEN 1 THEN 'B' ELSE name END"));
                assert!(!sql.contains("email"));
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_creates_and_updates_in_one_call() {
        let store = seeded("mongodb");
        let context = context(store.clone(), users());

        let report = context
            .model("User")
            .unwrap()
            .upsert_many(
                vec![
                    record_from(json!({ "email": "a@x.com", "name": "Changed" })),
                    record_from(json!({ "email": "b@x.com", "name": "New" })),
                    record_from(json!({ "email": "b@x.com", "name": "Repeat" })),
                ],
                WriteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(report.created, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.total, 2);
        assert_eq!(
            report.created + report.updated + report.unchanged + report.failed,
            report.total
        );

        let rows = store.rows("users");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], json!("Changed"));
        assert_eq!(rows[1]["name"], json!("New"));
    }

    #[tokio::test]
    async fn test_requires_unique_constraints() {
        let store = Arc::new(MemoryStore::new());
        let context = context(store.clone(), ModelSchema::new("Log", "logs"));

        let result = context
            .model("Log")
            .unwrap()
            .upsert_many(vec![record_from(json!({ "line": "x" }))], WriteOptions::default())
            .await;

        assert!(matches!(result, Err(BatchError::Validation(_))));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_probe_matches_composite_groups() {
        let schema = ModelSchema::new("Member", "members").unique(&["org", "handle"]);
        let store = Arc::new(MemoryStore::new().with_engine("mongodb").with_schema(&schema));
        store.seed("members", vec![record_from(json!({ "id": 7, "org": 1, "handle": "x" }))]);
        let context = context(store.clone(), schema);

        let report = context
            .model("Member")
            .unwrap()
            .upsert_many(
                vec![
                    record_from(json!({ "org": 1, "handle": "x", "role": "admin" })),
                    record_from(json!({ "org": 2, "handle": "x" })),
                ],
                WriteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!((report.created, report.updated), (1, 1));

        match &store.calls_of(StoreOperation::FindMany)[0] {
            StoreCall::FindMany { filter: Filter::Or(conditions), .. } => {
                assert_eq!(conditions.len(), 2);
                assert!(matches!(&conditions[0], Filter::And(parts) if parts.len() == 2));
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_is_split_under_placeholder_limit() {
        // sqlite allows 999 placeholders, 900 per probe
        let store = Arc::new(MemoryStore::new().with_engine("sqlite").with_schema(&users()));
        let context = context(store.clone(), users());

        let records =
            (0..1000).map(|i| record_from(json!({ "email": format!("{}@x.com", i) }))).collect();
        let report = context
            .model("User")
            .unwrap()
            .upsert_many(records, WriteOptions::default())
            .await
            .unwrap();

        assert_eq!(report.created, 1000);
        assert_eq!(store.calls_of(StoreOperation::FindMany).len(), 2);
    }

    #[tokio::test]
    async fn test_probe_failure_is_returned() {
        let store = seeded("postgres");
        store.fail_next(StoreOperation::FindMany, StoreError::other("relation does not exist"));
        let context = context(store.clone(), users());

        let result = context
            .model("User")
            .unwrap()
            .upsert_many(vec![record_from(json!({ "email": "c@x.com" }))], WriteOptions::default())
            .await;

        assert!(matches!(result, Err(BatchError::Store(_))));
        assert!(store.calls_of(StoreOperation::CreateMany).is_empty());
    }

    #[tokio::test]
    async fn test_failed_update_is_counted() {
        let store = seeded("postgres");
        store.fail_next(StoreOperation::ExecuteRaw, StoreError::other("permission denied"));
        let context = context(store.clone(), users());

        let report = context
            .model("User")
            .unwrap()
            .upsert_many(
                vec![
                    record_from(json!({ "email": "a@x.com", "name": "B" })),
                    record_from(json!({ "email": "c@x.com", "name": "C" })),
                ],
                WriteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!((report.created, report.updated, report.failed), (1, 0, 1));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(
            report.created + report.updated + report.unchanged + report.failed,
            report.total
        );
    }
}
