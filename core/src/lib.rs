// public
pub mod batch;
pub mod compare;
pub mod config;
pub mod context;
pub mod database;
pub mod events;
pub mod execution;
pub mod metrics;
pub mod model;
pub mod record;
pub mod store;

mod helpers;
pub use helpers::{format_duration, partition, partition_ranges, PartitionError};

mod logger;
pub use logger::{setup_info_logger, setup_logger};

pub use batch::{
    CreateManyReport, CreateOptions, FailedWrite, ModelBatch, UpdateManyReport, UpsertReport,
    WriteOptions,
};
pub use compare::{deduplicate, has_changes};
pub use config::{BatchOptions, RetryPolicy};
pub use context::{invalidate_provider_cache, BatchContext, BatchError};
pub use database::{
    batch_size::{optimal_chunk_size, OperationKind},
    capabilities::{ConnectionDescriptor, DatabaseCapabilities, Provider},
    postgres::{PostgresClient, PostgresStore},
};
pub use events::{BatchEvent, ChannelReporter, EventReporter, NoopReporter, TracingReporter};
pub use execution::{
    parallel::{ExecutionOptions, ExecutionResult, ParallelExecutor},
    rate_limiter::TokenBucket,
};
pub use model::{FieldKind, FieldSpec, ModelSchema};
pub use record::Record;
pub use store::{memory::MemoryStore, Filter, RecordUpdate, Store, StoreError};

// export 3rd party dependencies
pub use async_trait::async_trait;
