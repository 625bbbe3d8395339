//! Static per-provider facts and connection-based provider detection.
//!
//! Detection never fails: anything that cannot be recognised resolves to
//! [`Provider::MOST_CONSTRAINED`] and a warning is logged.

use std::{fmt, str::FromStr, sync::Arc};

use mini_moka::sync::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Postgres,
    Mysql,
    Sqlite,
    SqlServer,
    MongoDb,
}

impl Provider {
    /// Smallest parameter ceiling. Used when detection fails, together with
    /// [`DatabaseCapabilities::MOST_CONSTRAINED`].
    pub const MOST_CONSTRAINED: Provider = Provider::Sqlite;

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Postgres => "postgres",
            Provider::Mysql => "mysql",
            Provider::Sqlite => "sqlite",
            Provider::SqlServer => "sqlserver",
            Provider::MongoDb => "mongodb",
        }
    }

    pub fn is_relational(&self) -> bool {
        !matches!(self, Provider::MongoDb)
    }

    pub fn capabilities(&self) -> DatabaseCapabilities {
        capabilities_for(*self)
    }

    fn from_engine_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "cockroachdb" | "cockroach" => Some(Provider::Postgres),
            "mysql" | "mariadb" => Some(Provider::Mysql),
            "sqlite" | "sqlite3" | "file" => Some(Provider::Sqlite),
            "sqlserver" | "mssql" => Some(Provider::SqlServer),
            "mongodb" | "mongodb+srv" | "mongo" => Some(Provider::MongoDb),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Unknown database provider: {0}")]
pub struct UnknownProviderError(String);

impl FromStr for Provider {
    type Err = UnknownProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::from_engine_name(s).ok_or_else(|| UnknownProviderError(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseCapabilities {
    pub supports_skip_duplicates: bool,
    pub supports_returning: bool,
    pub max_placeholders: usize,
    pub supports_json: bool,
    pub supports_arrays: bool,
}

impl DatabaseCapabilities {
    /// Nothing optional assumed and the smallest parameter ceiling of any
    /// provider. What an undetected store is treated as.
    pub const MOST_CONSTRAINED: DatabaseCapabilities = DatabaseCapabilities {
        supports_skip_duplicates: false,
        supports_returning: false,
        max_placeholders: 999,
        supports_json: false,
        supports_arrays: false,
    };
}

pub fn capabilities_for(provider: Provider) -> DatabaseCapabilities {
    match provider {
        Provider::Postgres => DatabaseCapabilities {
            supports_skip_duplicates: true,
            supports_returning: true,
            max_placeholders: 32_767,
            supports_json: true,
            supports_arrays: true,
        },
        Provider::Mysql => DatabaseCapabilities {
            supports_skip_duplicates: true,
            supports_returning: false,
            max_placeholders: 65_535,
            supports_json: true,
            supports_arrays: false,
        },
        Provider::Sqlite => DatabaseCapabilities {
            // INSERT ... ON CONFLICT DO NOTHING
            supports_skip_duplicates: true,
            supports_returning: true,
            max_placeholders: 999,
            supports_json: true,
            supports_arrays: false,
        },
        Provider::SqlServer => DatabaseCapabilities {
            supports_skip_duplicates: false,
            supports_returning: true,
            max_placeholders: 2_100,
            supports_json: false,
            supports_arrays: false,
        },
        Provider::MongoDb => DatabaseCapabilities {
            supports_skip_duplicates: false,
            supports_returning: false,
            // no bind parameters, bounded by the 16MB command size instead
            max_placeholders: 100_000,
            supports_json: true,
            supports_arrays: true,
        },
    }
}

/// What is known about a store connection: explicit engine metadata and/or a
/// connection string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ConnectionDescriptor {
    pub engine: Option<String>,
    pub url: Option<String>,
}

impl ConnectionDescriptor {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self { engine: None, url: Some(url.into()) }
    }

    pub fn from_engine(engine: impl Into<String>) -> Self {
        Self { engine: Some(engine.into()), url: None }
    }

    /// Builds a descriptor from `DATABASE_URL`, empty when it is not set.
    pub fn from_env() -> Self {
        match crate::config::connection_string() {
            Ok(url) => Self::from_url(url),
            Err(_) => Self::default(),
        }
    }

    fn scheme(&self) -> Option<String> {
        let url = self.url.as_deref()?.trim();
        if url.is_empty() {
            return None;
        }

        match Url::parse(url) {
            Ok(parsed) => Some(parsed.scheme().to_string()),
            // `sqlserver://host;database=x` style strings are not always valid URLs
            Err(_) => url.split_once(':').map(|(scheme, _)| scheme.to_string()),
        }
    }
}

/// Detects the provider for a connection. Explicit engine metadata wins over
/// the connection string scheme. `None` when neither is recognised.
pub fn detect_provider(connection: &ConnectionDescriptor) -> Option<Provider> {
    if let Some(engine) = connection.engine.as_deref() {
        if let Some(provider) = Provider::from_engine_name(engine) {
            return Some(provider);
        }
        debug!("Unrecognised engine metadata '{}', trying connection string", engine);
    }

    let scheme = connection.scheme()?;
    let provider = Provider::from_engine_name(&scheme);
    if provider.is_none() {
        debug!("Unrecognised connection scheme '{}'", scheme);
    }
    provider
}

/// Resolves the provider for a connection, falling back to the most
/// constrained provider when it cannot be detected.
pub fn provider_for(connection: &ConnectionDescriptor) -> Provider {
    resolve(connection, detect_provider(connection))
}

fn resolve(connection: &ConnectionDescriptor, detected: Option<Provider>) -> Provider {
    detected.unwrap_or_else(|| {
        warn!(
            "Could not detect the database provider from {:?}, falling back to {}",
            connection.url.as_deref().or(connection.engine.as_deref()).unwrap_or("<none>"),
            Provider::MOST_CONSTRAINED
        );
        Provider::MOST_CONSTRAINED
    })
}

/// Memoises [`detect_provider`] per connection descriptor.
#[derive(Clone)]
pub struct ProviderCache {
    cache: Arc<Cache<ConnectionDescriptor, Option<Provider>>>,
}

impl Default for ProviderCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderCache {
    pub fn new() -> Self {
        Self { cache: Arc::new(Cache::builder().max_capacity(64).build()) }
    }

    /// The detected provider, `None` when detection failed.
    pub fn detect(&self, connection: &ConnectionDescriptor) -> Option<Provider> {
        if let Some(detected) = self.cache.get(connection) {
            return detected;
        }

        let detected = detect_provider(connection);
        self.cache.insert(connection.clone(), detected);
        detected
    }

    pub fn provider_for(&self, connection: &ConnectionDescriptor) -> Provider {
        resolve(connection, self.detect(connection))
    }

    /// The cached provider, without detecting.
    pub fn cached(&self, connection: &ConnectionDescriptor) -> Option<Provider> {
        self.cache.get(connection).flatten()
    }

    pub fn invalidate(&self, connection: &ConnectionDescriptor) {
        self.cache.invalidate(connection);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_from_scheme() {
        let cases = [
            ("postgresql://user:pw@localhost:5432/db", Provider::Postgres),
            ("postgres://localhost/db", Provider::Postgres),
            ("mysql://root@localhost/db", Provider::Mysql),
            ("file:./dev.db", Provider::Sqlite),
            ("sqlite:///tmp/dev.db", Provider::Sqlite),
            ("sqlserver://localhost:1433;database=db;user=sa", Provider::SqlServer),
            ("mongodb://localhost:27017/db", Provider::MongoDb),
            ("mongodb+srv://cluster.example.com/db", Provider::MongoDb),
        ];

        for (url, expected) in cases {
            assert_eq!(provider_for(&ConnectionDescriptor::from_url(url)), expected, "{url}");
        }
    }

    #[test]
    fn test_engine_metadata_wins() {
        let descriptor = ConnectionDescriptor {
            engine: Some("mysql".to_string()),
            url: Some("postgres://localhost/db".to_string()),
        };
        assert_eq!(provider_for(&descriptor), Provider::Mysql);
    }

    #[test]
    fn test_unknown_engine_uses_url() {
        let descriptor = ConnectionDescriptor {
            engine: Some("oracle".to_string()),
            url: Some("postgres://localhost/db".to_string()),
        };
        assert_eq!(provider_for(&descriptor), Provider::Postgres);
    }

    #[test]
    fn test_fallback_to_most_constrained() {
        assert_eq!(provider_for(&ConnectionDescriptor::default()), Provider::MOST_CONSTRAINED);
        assert_eq!(
            provider_for(&ConnectionDescriptor::from_url("redis://localhost")),
            Provider::MOST_CONSTRAINED
        );
        assert_eq!(
            provider_for(&ConnectionDescriptor::from_url("   ")),
            Provider::MOST_CONSTRAINED
        );
    }

    #[test]
    fn test_most_constrained_has_smallest_budget() {
        let constrained = DatabaseCapabilities::MOST_CONSTRAINED;
        for provider in [
            Provider::Postgres,
            Provider::Mysql,
            Provider::Sqlite,
            Provider::SqlServer,
            Provider::MongoDb,
        ] {
            assert!(capabilities_for(provider).max_placeholders >= constrained.max_placeholders);
        }
        assert_eq!(
            capabilities_for(Provider::MOST_CONSTRAINED).max_placeholders,
            constrained.max_placeholders
        );
        assert!(!constrained.supports_skip_duplicates);
        assert!(capabilities_for(Provider::Sqlite).supports_skip_duplicates);
    }

    #[test]
    fn test_cache_invalidation() {
        let cache = ProviderCache::new();
        let descriptor = ConnectionDescriptor::from_url("postgres://localhost/db");

        assert_eq!(cache.cached(&descriptor), None);
        assert_eq!(cache.provider_for(&descriptor), Provider::Postgres);
        assert_eq!(cache.cached(&descriptor), Some(Provider::Postgres));

        cache.invalidate(&descriptor);
        assert_eq!(cache.cached(&descriptor), None);
    }

    #[test]
    fn test_cache_remembers_failed_detection() {
        let cache = ProviderCache::new();
        let descriptor = ConnectionDescriptor::from_url("redis://localhost");

        assert_eq!(cache.detect(&descriptor), None);
        assert_eq!(cache.provider_for(&descriptor), Provider::MOST_CONSTRAINED);
        assert_eq!(cache.cached(&descriptor), None);
        assert_eq!(
            detect_provider(&ConnectionDescriptor::from_engine("mssql")),
            Some(Provider::SqlServer)
        );
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!("PostgreSQL".parse::<Provider>().unwrap(), Provider::Postgres);
        assert!("oracle".parse::<Provider>().is_err());
    }
}
