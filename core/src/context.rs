//! The explicitly constructed handle every batch operation runs against.
//!
//! A [`BatchContext`] owns the store, the detected provider, the validated
//! options, the rate limiter and the registered model schemas. Contexts are
//! independent of each other, so several configurations can coexist.

use std::{collections::HashMap, sync::Arc};

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use crate::{
    batch::ModelBatch,
    config::{BatchOptions, ConfigError},
    database::capabilities::{DatabaseCapabilities, Provider, ProviderCache},
    events::{BatchEvent, EventReporter, TracingReporter},
    execution::{
        parallel::ParallelExecutor,
        rate_limiter::{RateLimiterError, TokenBucket},
    },
    helpers::PartitionError,
    model::ModelSchema,
    store::{Store, StoreError},
};

static PROVIDER_CACHE: Lazy<ProviderCache> = Lazy::new(ProviderCache::new);

/// Forgets every cached provider detection result.
pub fn invalidate_provider_cache() {
    PROVIDER_CACHE.invalidate_all();
}

#[derive(thiserror::Error, Debug)]
pub enum BatchError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Model {0} is not registered with this batch context")]
    ModelNotRegistered(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Partition(#[from] PartitionError),

    #[error("{0}")]
    RateLimiter(#[from] RateLimiterError),
}

pub struct BatchContext {
    store: Arc<dyn Store>,
    provider: Provider,
    capabilities: DatabaseCapabilities,
    options: BatchOptions,
    concurrency: usize,
    rate_limiter: TokenBucket,
    reporter: Arc<dyn EventReporter>,
    executor: ParallelExecutor,
    models: HashMap<String, ModelSchema>,
}

impl BatchContext {
    /// Validates `options` and binds them to `store`, reporting through `tracing`.
    pub fn configure(
        store: Option<Arc<dyn Store>>,
        options: BatchOptions,
    ) -> Result<Self, BatchError> {
        Self::configure_with_reporter(store, options, Arc::new(TracingReporter))
    }

    pub fn configure_with_reporter(
        store: Option<Arc<dyn Store>>,
        options: BatchOptions,
        reporter: Arc<dyn EventReporter>,
    ) -> Result<Self, BatchError> {
        let store = store.ok_or(ConfigError::MissingStore)?;
        options.validate()?;

        let (provider, capabilities) = match PROVIDER_CACHE.detect(&store.descriptor()) {
            Some(provider) => (provider, provider.capabilities()),
            None => {
                let provider = Provider::MOST_CONSTRAINED;
                reporter.report(&BatchEvent::ProviderFallback { provider });
                (provider, DatabaseCapabilities::MOST_CONSTRAINED)
            }
        };

        let concurrency = match options.max_concurrency {
            Some(max_concurrency) => bound_to_pool(max_concurrency, store.pool_size()),
            None => store.pool_size().max(1),
        };
        let rate_limiter = TokenBucket::new(options.queries_per_second())?;

        info!(
            "Batch context configured - provider: {}, concurrency: {}, parallel: {}, {} queries/s",
            provider,
            concurrency,
            options.parallel_enabled(),
            options.queries_per_second()
        );

        Ok(Self {
            store,
            provider,
            capabilities,
            options,
            concurrency,
            rate_limiter,
            reporter,
            executor: ParallelExecutor::new(concurrency),
            models: HashMap::new(),
        })
    }

    /// Installs the field mapping for a record kind, replacing any schema
    /// registered under the same name.
    pub fn register_model(&mut self, schema: ModelSchema) -> Result<&mut Self, BatchError> {
        if schema.table.trim().is_empty() {
            return Err(BatchError::Validation(format!(
                "model {} has no table or collection name",
                schema.name
            )));
        }
        if schema.id_field.trim().is_empty() {
            return Err(BatchError::Validation(format!(
                "model {} has no identity field",
                schema.name
            )));
        }

        debug!("Registered model {} on table {}", schema.name, schema.table);
        self.models.insert(schema.name.clone(), schema);
        Ok(self)
    }

    pub fn model(&self, name: &str) -> Result<ModelBatch<'_>, BatchError> {
        self.models
            .get(name)
            .map(|schema| ModelBatch::new(self, schema))
            .ok_or_else(|| BatchError::ModelNotRegistered(name.to_string()))
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn capabilities(&self) -> DatabaseCapabilities {
        self.capabilities
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Concurrency used when a call does not override it.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Concurrency for a call requesting `requested`, never above the pool size.
    pub fn concurrency_for(&self, requested: Option<usize>) -> usize {
        match requested {
            Some(requested) => bound_to_pool(requested, self.store.pool_size()),
            None => self.concurrency,
        }
    }

    pub fn rate_limiter(&self) -> &TokenBucket {
        &self.rate_limiter
    }

    pub fn reporter(&self) -> &dyn EventReporter {
        self.reporter.as_ref()
    }

    pub fn executor(&self) -> &ParallelExecutor {
        &self.executor
    }

    /// Ends the context. Batch calls borrow the context, so none can be in
    /// flight once this runs.
    pub fn dispose(self) {
        info!(
            "Disposing batch context for {} with {} registered model(s)",
            self.provider,
            self.models.len()
        );
    }
}

/// Never more in flight than the pool can serve.
fn bound_to_pool(requested: usize, pool_size: usize) -> usize {
    let pool_size = pool_size.max(1);
    if requested > pool_size {
        warn!(
            "Requested concurrency {} exceeds the connection pool size {}, using {}",
            requested, pool_size, pool_size
        );
        return pool_size;
    }
    requested.max(1)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::{
        database::capabilities::ConnectionDescriptor, events::ChannelReporter,
        store::memory::MemoryStore,
    };

    fn store(memory: MemoryStore) -> Option<Arc<dyn Store>> {
        Some(Arc::new(memory))
    }

    #[test]
    fn test_configure_requires_store() {
        let result = BatchContext::configure(None, BatchOptions::default());
        assert!(matches!(result, Err(BatchError::Configuration(ConfigError::MissingStore))));
    }

    #[test]
    fn test_configure_validates_options() {
        let options = BatchOptions { max_concurrency: Some(0), ..Default::default() };
        let result = BatchContext::configure(store(MemoryStore::new()), options);
        assert!(matches!(
            result,
            Err(BatchError::Configuration(ConfigError::InvalidMaxConcurrency(0)))
        ));

        let options = BatchOptions { max_queries_per_second: Some(f64::NAN), ..Default::default() };
        assert!(BatchContext::configure(store(MemoryStore::new()), options).is_err());
    }

    #[test]
    fn test_concurrency_defaults_to_pool_size() {
        let memory = MemoryStore::new().with_pool_size(4);
        let context = BatchContext::configure(store(memory), BatchOptions::default()).unwrap();
        assert_eq!(context.concurrency(), 4);
        assert_eq!(context.provider(), Provider::Postgres);
        assert_eq!(context.rate_limiter().capacity(), 100.0);

        let options = BatchOptions { max_concurrency: Some(2), ..Default::default() };
        let context = BatchContext::configure(store(MemoryStore::new()), options).unwrap();
        assert_eq!(context.concurrency(), 2);
    }

    #[test]
    fn test_concurrency_is_bounded_by_pool_size() {
        let memory = MemoryStore::new().with_pool_size(4);
        let options = BatchOptions { max_concurrency: Some(20), ..Default::default() };
        let context = BatchContext::configure(store(memory), options).unwrap();
        assert_eq!(context.concurrency(), 4);

        assert_eq!(context.concurrency_for(None), 4);
        assert_eq!(context.concurrency_for(Some(3)), 3);
        assert_eq!(context.concurrency_for(Some(50)), 4);
        assert_eq!(context.concurrency_for(Some(0)), 1);
    }

    #[test]
    fn test_unknown_provider_falls_back_and_reports() {
        let (sender, mut receiver) = unbounded_channel();
        let memory = MemoryStore::new()
            .with_descriptor(ConnectionDescriptor::from_url("cassandra://localhost/db"));

        let context = BatchContext::configure_with_reporter(
            store(memory),
            BatchOptions::default(),
            Arc::new(ChannelReporter::new(sender)),
        )
        .unwrap();

        assert_eq!(context.provider(), Provider::MOST_CONSTRAINED);
        assert_eq!(context.capabilities(), DatabaseCapabilities::MOST_CONSTRAINED);
        assert!(!context.capabilities().supports_skip_duplicates);
        assert_eq!(
            receiver.try_recv().unwrap(),
            BatchEvent::ProviderFallback { provider: Provider::MOST_CONSTRAINED }
        );
    }

    #[test]
    fn test_model_registration() {
        let mut context =
            BatchContext::configure(store(MemoryStore::new()), BatchOptions::default()).unwrap();

        assert!(matches!(context.model("User"), Err(BatchError::ModelNotRegistered(_))));
        assert!(matches!(
            context.register_model(ModelSchema::new("Broken", " ")),
            Err(BatchError::Validation(_))
        ));

        context.register_model(ModelSchema::new("User", "users")).unwrap();
        assert_eq!(context.model("User").unwrap().schema().table, "users");

        context.dispose();
    }

    #[test]
    fn test_contexts_are_independent() {
        let first = BatchContext::configure(
            store(MemoryStore::new().with_engine("mysql")),
            BatchOptions::default(),
        )
        .unwrap();
        let second = BatchContext::configure(
            store(MemoryStore::new().with_engine("mongodb")),
            BatchOptions { max_queries_per_second: Some(5.0), ..Default::default() },
        )
        .unwrap();

        assert_eq!(first.provider(), Provider::Mysql);
        assert_eq!(second.provider(), Provider::MongoDb);
        assert_eq!(first.rate_limiter().capacity(), 100.0);
        assert_eq!(second.rate_limiter().capacity(), 5.0);
    }
}
