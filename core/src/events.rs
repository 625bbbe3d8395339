//! Structured reporting of what happened during a batch call.
//!
//! The orchestrator never prints; it hands [`BatchEvent`]s to the
//! [`EventReporter`] installed on the context.

use std::ops::Range;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::database::capabilities::Provider;

#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    /// A chunk failed and its records were not written.
    ChunkFailed {
        operation: &'static str,
        chunk_index: usize,
        records: Range<usize>,
        message: String,
    },

    /// A chunk hit a uniqueness violation and is retried with skip-duplicates.
    SkipDuplicatesRetry {
        model: String,
        chunk_index: usize,
        records: Range<usize>,
        message: String,
    },

    /// A transactional batch failed and its updates are applied one by one.
    TransactionFallback {
        model: String,
        chunk_index: usize,
        records: Range<usize>,
        message: String,
    },

    /// A single record could not be written in the per-record fallback.
    RecordFailed { model: String, id: Value, message: String },

    /// A transient store error is being retried after a backoff.
    TransientRetry { operation: &'static str, attempt: u32, delay_ms: u64, message: String },

    /// The provider could not be detected and the most constrained one is used.
    ProviderFallback { provider: Provider },

    /// Records dropped before writing because they repeat an earlier record's unique key.
    DuplicatesDropped { model: String, count: usize },

    /// A batch operation finished dispatching all of its chunks.
    ChunksCompleted { operation: &'static str, model: String, chunks: usize, failed: usize },
}

pub trait EventReporter: Send + Sync {
    fn report(&self, event: &BatchEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl EventReporter for TracingReporter {
    fn report(&self, event: &BatchEvent) {
        match event {
            BatchEvent::ChunkFailed { operation, chunk_index, records, message } => error!(
                "{} chunk {} (records {}..{}) failed: {}",
                operation, chunk_index, records.start, records.end, message
            ),
            BatchEvent::SkipDuplicatesRetry { model, chunk_index, records, message } => warn!(
                "{} - chunk {} (records {}..{}) hit a unique constraint, skipping duplicates: {}",
                model, chunk_index, records.start, records.end, message
            ),
            BatchEvent::TransactionFallback { model, chunk_index, records, message } => warn!(
                "{} - transaction for chunk {} (records {}..{}) failed, updating one by one: {}",
                model, chunk_index, records.start, records.end, message
            ),
            BatchEvent::RecordFailed { model, id, message } => {
                error!("{} - update for record {} failed: {}", model, id, message)
            }
            BatchEvent::TransientRetry { operation, attempt, delay_ms, message } => warn!(
                "{} failed with a transient error: {}. Retrying in {}ms (attempt {})",
                operation, message, delay_ms, attempt
            ),
            BatchEvent::ProviderFallback { provider } => {
                warn!("Could not detect the database provider, using {}", provider)
            }
            BatchEvent::DuplicatesDropped { model, count } => {
                info!("{} - dropped {} duplicate record(s) before writing", model, count)
            }
            BatchEvent::ChunksCompleted { operation, model, chunks, failed } => {
                debug!(
                    "{} {} - {} chunk(s) dispatched, {} failed",
                    model, operation, chunks, failed
                );
            }
        }
    }
}

/// Forwards events to a channel the caller drains.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    sender: UnboundedSender<BatchEvent>,
}

impl ChannelReporter {
    pub fn new(sender: UnboundedSender<BatchEvent>) -> Self {
        Self { sender }
    }
}

impl EventReporter for ChannelReporter {
    fn report(&self, event: &BatchEvent) {
        if self.sender.send(event.clone()).is_err() {
            debug!("Batch event receiver dropped, discarding {:?}", event);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl EventReporter for NoopReporter {
    fn report(&self, _event: &BatchEvent) {}
}
