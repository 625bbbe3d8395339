//! Batch mutation orchestrator.
//!
//! A [`ModelBatch`] binds a registered [`ModelSchema`] to its [`BatchContext`]
//! and drives normalisation, deduplication, chunking and dispatch for the
//! `create_many`, `upsert_many`, `update_many_by_id` and `delete_by_ids`
//! calls, plus the chunked `find_many_in` lookup. Partial write failures come
//! back inside the reports; only configuration and validation problems, and
//! failures of operations with no partial result, are returned as errors.

mod create;
mod delete;
mod find;
mod update;
mod upsert;

use std::{future::Future, ops::Range};

use serde_json::Value;
use tracing::{debug, error, trace};

pub use create::{CreateManyReport, CreateOptions};
pub use find::MAX_IN_LIST_VALUES;
pub use update::UpdateManyReport;
pub use upsert::UpsertReport;

use crate::{
    context::{BatchContext, BatchError},
    database::capabilities::Provider,
    events::{BatchEvent, EventReporter},
    execution::{
        parallel::{ExecutionOptions, ExecutionResult, IndexedFailure, OperationFailure},
        retry::with_retry,
    },
    metrics::store::time_store_operation,
    model::ModelSchema,
    store::{Store, StoreError},
};

/// Scheduling overrides for a single batch call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Run chunks concurrently. Defaults to the context setting when there is
    /// more than one chunk and the store has more than one connection.
    pub parallel: Option<bool>,
    /// Chunks in flight at once when running in parallel.
    pub concurrency: Option<usize>,
}

/// A write that did not make it to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedWrite {
    pub operation: &'static str,
    /// Positions of the affected records in the batch as submitted to the store.
    pub records: Range<usize>,
    /// Identity of the record when a single record failed.
    pub id: Option<Value>,
    pub message: String,
}

impl FailedWrite {
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// Batch operations for one registered record kind.
#[derive(Clone, Copy)]
pub struct ModelBatch<'a> {
    context: &'a BatchContext,
    schema: &'a ModelSchema,
}

impl<'a> ModelBatch<'a> {
    pub(crate) fn new(context: &'a BatchContext, schema: &'a ModelSchema) -> Self {
        Self { context, schema }
    }

    pub fn schema(&self) -> &'a ModelSchema {
        self.schema
    }

    fn store(&self) -> &'a dyn Store {
        self.context.store()
    }

    fn provider(&self) -> Provider {
        self.context.provider()
    }

    fn reporter(&self) -> &'a dyn EventReporter {
        self.context.reporter()
    }

    /// One store round trip: rate limited, timed and retried on transient errors.
    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        mut round_trip: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let rate_limiter = self.context.rate_limiter();

        with_retry(&self.context.options().retry, operation, self.reporter(), || {
            let pending = round_trip();
            async move {
                rate_limiter.acquire().await;
                let timer = time_store_operation(operation);
                let result = pending.await;
                let elapsed = timer.finish(result.is_ok());
                trace!("{} round trip took {:.1}ms", operation, elapsed * 1000.0);
                result
            }
        })
        .await
    }

    fn run_parallel(&self, options: WriteOptions, chunk_count: usize) -> bool {
        options.parallel.unwrap_or_else(|| {
            self.context.options().parallel_enabled() &&
                chunk_count > 1 &&
                self.store().pool_size() > 1
        })
    }

    /// Dispatches one operation per chunk through the context's executor,
    /// in waves when parallel and one at a time otherwise.
    async fn run_chunks<T, F, Fut>(
        &self,
        operation: &'static str,
        chunks: Vec<F>,
        options: WriteOptions,
        stop_on_error: bool,
    ) -> ExecutionResult<T, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let chunk_count = chunks.len();
        let parallel = self.run_parallel(options, chunk_count);
        let concurrency =
            if parallel { self.context.concurrency_for(options.concurrency) } else { 1 };

        let model = self.schema.name.as_str();
        let on_progress = |completed: usize, total: usize| {
            debug!("{} {} - {}/{} chunk(s) settled", model, operation, completed, total);
        };

        debug!(
            "{} {} - dispatching {} chunk(s), parallel: {}, concurrency: {}",
            model, operation, chunk_count, parallel, concurrency
        );

        let result = self
            .context
            .executor()
            .run(
                chunks,
                ExecutionOptions {
                    concurrency: Some(concurrency),
                    rate_limiter: None,
                    on_progress: Some(&on_progress),
                    on_error: None,
                    stop_on_error,
                },
            )
            .await;

        self.reporter().report(&BatchEvent::ChunksCompleted {
            operation,
            model: self.schema.name.clone(),
            chunks: chunk_count,
            failed: result.errors.len(),
        });

        result
    }

    /// Turns chunk failures into report entries, reporting each one.
    fn chunk_failures(
        &self,
        operation: &'static str,
        ranges: &[Range<usize>],
        errors: Vec<IndexedFailure<StoreError>>,
    ) -> Vec<FailedWrite> {
        errors
            .into_iter()
            .filter_map(|IndexedFailure { index, failure }| {
                let records = ranges[index].clone();
                let message = match failure {
                    OperationFailure::Skipped => return None,
                    other => other.to_string(),
                };

                self.reporter().report(&BatchEvent::ChunkFailed {
                    operation,
                    chunk_index: index,
                    records: records.clone(),
                    message: message.clone(),
                });

                Some(FailedWrite { operation, records, id: None, message })
            })
            .collect()
    }
}

/// The first real failure of a run, skipped operations aside.
fn first_failure(errors: Vec<IndexedFailure<StoreError>>) -> Option<BatchError> {
    errors.into_iter().find_map(|IndexedFailure { index, failure }| match failure {
        OperationFailure::Failed(e) => {
            error!("Chunk {} failed: {}", index, e);
            Some(BatchError::Store(e))
        }
        OperationFailure::Panicked(message) => {
            error!("Chunk {} panicked: {}", index, message);
            Some(BatchError::Store(StoreError::other(format!("operation panicked: {}", message))))
        }
        OperationFailure::Skipped => None,
    })
}
