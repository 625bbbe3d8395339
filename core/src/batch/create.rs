use std::ops::Range;

use tokio::time::Instant;
use tracing::{debug, info};

use super::{FailedWrite, ModelBatch, WriteOptions};
use crate::{
    compare::deduplicate,
    context::BatchError,
    database::batch_size::create_chunk_size,
    events::BatchEvent,
    helpers::{format_duration, partition_ranges},
    metrics::store::{ops, record_outcome},
    record::Record,
    store::StoreError,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Ask the store to ignore rows violating a unique constraint.
    pub skip_duplicates: bool,
    pub parallel: Option<bool>,
    pub concurrency: Option<usize>,
}

impl CreateOptions {
    fn write_options(&self) -> WriteOptions {
        WriteOptions { parallel: self.parallel, concurrency: self.concurrency }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateManyReport {
    /// Rows the store reported as inserted.
    pub count: u64,
    /// Records dropped before writing because an earlier record had the same unique key.
    pub duplicates: usize,
    /// Records in successful chunks the store skipped as already existing.
    pub skipped: usize,
    /// Records in chunks that failed.
    pub failed: usize,
    pub errors: Vec<FailedWrite>,
}

/// Inserted count and records the store skipped for one chunk.
struct ChunkInsert {
    inserted: u64,
    skipped: usize,
}

impl ModelBatch<'_> {
    /// Inserts `records` in provider-sized chunks.
    ///
    /// Records are normalised and deduplicated on the model's unique
    /// constraints first. A chunk rejected for a uniqueness violation is retried
    /// once with skip-duplicates when the provider supports it; any other chunk
    /// error is recorded in the report without stopping the other chunks.
    pub async fn create_many(
        &self,
        records: Vec<Record>,
        options: CreateOptions,
    ) -> Result<CreateManyReport, BatchError> {
        let started = Instant::now();

        let normalized = self.schema.normalize_records(records);
        let submitted = normalized.len();
        let records = deduplicate(normalized, &self.schema.unique_constraints);
        let duplicates = submitted - records.len();

        if duplicates > 0 {
            self.reporter().report(&BatchEvent::DuplicatesDropped {
                model: self.schema.name.clone(),
                count: duplicates,
            });
        }

        let mut report = self.insert_records(&records, options).await?;
        report.duplicates = duplicates;

        info!(
            "{} create_many - inserted {} of {} record(s), {} failed - took {}",
            self.schema.name,
            report.count,
            submitted,
            report.failed,
            format_duration(started.elapsed())
        );

        Ok(report)
    }

    /// Inserts already normalised and deduplicated records.
    pub(super) async fn insert_records(
        &self,
        records: &[Record],
        options: CreateOptions,
    ) -> Result<CreateManyReport, BatchError> {
        if records.is_empty() {
            return Ok(CreateManyReport::default());
        }

        let columns_per_row = records.iter().map(|record| record.len()).max().unwrap_or(0);
        let chunk_size = create_chunk_size(self.provider(), columns_per_row);
        let ranges = partition_ranges(records.len(), chunk_size)?;

        let chunks = ranges
            .iter()
            .cloned()
            .enumerate()
            .map(|(chunk_index, range)| {
                move || self.insert_chunk(chunk_index, range, records, options.skip_duplicates)
            })
            .collect();

        let result =
            self.run_chunks(ops::CREATE_MANY, chunks, options.write_options(), false).await;

        let mut report = CreateManyReport::default();
        for (_, chunk) in &result.results {
            report.count += chunk.inserted;
            report.skipped += chunk.skipped;
        }

        report.errors = self.chunk_failures(ops::CREATE_MANY, &ranges, result.errors);
        report.failed = report.errors.iter().map(FailedWrite::record_count).sum();

        record_outcome(ops::CREATE_MANY, "created", report.count as usize);
        record_outcome(ops::CREATE_MANY, "skipped", report.skipped);
        record_outcome(ops::CREATE_MANY, "failed", report.failed);

        Ok(report)
    }

    async fn insert_chunk(
        &self,
        chunk_index: usize,
        range: Range<usize>,
        records: &[Record],
        skip_duplicates: bool,
    ) -> Result<ChunkInsert, StoreError> {
        let store = self.store();
        let table = self.schema.table.as_str();
        let chunk = &records[range.clone()];

        let first_attempt =
            self.call(ops::CREATE_MANY, || store.create_many(table, chunk, skip_duplicates)).await;

        let inserted = match first_attempt {
            Ok(inserted) => inserted,
            Err(e)
                if e.is_unique_violation() &&
                    !skip_duplicates &&
                    self.context.capabilities().supports_skip_duplicates =>
            {
                self.reporter().report(&BatchEvent::SkipDuplicatesRetry {
                    model: self.schema.name.clone(),
                    chunk_index,
                    records: range.clone(),
                    message: e.message.clone(),
                });

                self.call(ops::CREATE_MANY, || store.create_many(table, chunk, true)).await?
            }
            Err(e) => return Err(e),
        };

        let skipped = chunk.len().saturating_sub(inserted as usize);
        if skipped > 0 {
            debug!(
                "{} - chunk {} (records {}..{}) skipped {} existing record(s)",
                self.schema.name, chunk_index, range.start, range.end, skipped
            );
        }

        Ok(ChunkInsert { inserted, skipped })
    }
}
