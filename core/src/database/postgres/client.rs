use std::time::Duration;

use bb8::{Pool, RunError};
use bb8_postgres::PostgresConnectionManager;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use serde_json::Value;
use tokio::{task, time::timeout};
use tokio_postgres::{config::SslMode, Config, Error as PgError};
use tracing::{debug, error};

use crate::config::connection_string;

pub const DEFAULT_POOL_SIZE: u32 = 10;

#[derive(thiserror::Error, Debug)]
pub enum PostgresConnectionError {
    #[error("The database connection string is wrong please check your environment: {0}")]
    DatabaseConnectionConfigWrong(#[from] std::env::VarError),

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] tokio_postgres::Error),

    #[error("Can not connect to the database please make sure your connection string is correct")]
    CanNotConnectToDatabase,

    #[error("Could not parse connection string make sure it is correctly formatted")]
    CouldNotParseConnectionString,

    #[error("Could not create tls connector")]
    CouldNotCreateTlsConnector,

    #[error("Pool size must be greater than zero")]
    InvalidPoolSize,
}

#[derive(thiserror::Error, Debug)]
pub enum PostgresError {
    #[error("PgError {0}")]
    PgError(#[from] PgError),

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] RunError<tokio_postgres::Error>),

    #[error("Statement affected {actual} row(s), expected {expected}")]
    UnexpectedRowCount { expected: u64, actual: u64 },
}

pub struct PostgresClient {
    pool: Pool<PostgresConnectionManager<MakeTlsConnector>>,
    pool_size: u32,
}

impl PostgresClient {
    /// Connects using `DATABASE_URL`.
    pub async fn new(pool_size: u32) -> Result<Self, PostgresConnectionError> {
        let connection_str = connection_string()?;
        Self::connect(&connection_str, pool_size).await
    }

    pub async fn connect(
        connection_str: &str,
        pool_size: u32,
    ) -> Result<Self, PostgresConnectionError> {
        async fn _connect(
            connection_str: &str,
            pool_size: u32,
            disable_ssl: bool,
        ) -> Result<PostgresClient, PostgresConnectionError> {
            let mut config: Config = connection_str
                .parse()
                .map_err(|_| PostgresConnectionError::CouldNotParseConnectionString)?;

            if disable_ssl {
                config.ssl_mode(SslMode::Disable);
            }

            let connector = TlsConnector::builder()
                .build()
                .map_err(|_| PostgresConnectionError::CouldNotCreateTlsConnector)?;
            let tls_connector = MakeTlsConnector::new(connector);

            let (client, connection) =
                match timeout(Duration::from_millis(5000), config.connect(tls_connector.clone()))
                    .await
                {
                    Ok(Ok((client, connection))) => (client, connection),
                    Ok(Err(e)) => {
                        // retry without ssl if ssl has been attempted and failed
                        if !disable_ssl &&
                            config.get_ssl_mode() != SslMode::Disable &&
                            !connection_str.contains("sslmode=require")
                        {
                            return Box::pin(_connect(connection_str, pool_size, true)).await;
                        }
                        error!("Error connecting to database: {}", e);
                        return Err(PostgresConnectionError::CanNotConnectToDatabase);
                    }
                    Err(e) => {
                        error!("Timeout connecting to database: {}", e);
                        return Err(PostgresConnectionError::CanNotConnectToDatabase);
                    }
                };

            let connection_handle = task::spawn(connection);

            if client.query_one("SELECT 1", &[]).await.is_err() {
                return Err(PostgresConnectionError::CanNotConnectToDatabase);
            }

            drop(client);
            match connection_handle.await {
                Ok(Ok(())) => (),
                Ok(Err(_)) | Err(_) => return Err(PostgresConnectionError::CanNotConnectToDatabase),
            }

            let manager = PostgresConnectionManager::new(config, tls_connector);
            let pool = Pool::builder().max_size(pool_size).build(manager).await?;

            debug!("Postgres pool ready with {} connection(s)", pool_size);

            Ok(PostgresClient { pool, pool_size })
        }

        if pool_size == 0 {
            return Err(PostgresConnectionError::InvalidPoolSize);
        }

        _connect(connection_str, pool_size, false).await
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    pub async fn execute(&self, sql: &str) -> Result<u64, PostgresError> {
        let conn = self.pool.get().await?;
        conn.execute(sql, &[]).await.map_err(PostgresError::PgError)
    }

    /// Runs a query whose single column is a JSON value per row.
    pub async fn query_json(&self, sql: &str) -> Result<Vec<Value>, PostgresError> {
        let conn = self.pool.get().await?;
        let rows = conn.query(sql, &[]).await.map_err(PostgresError::PgError)?;
        rows.iter().map(|row| row.try_get::<_, Value>(0).map_err(PostgresError::PgError)).collect()
    }

    /// Runs every statement in one transaction. Each must affect exactly one
    /// row, otherwise the transaction is rolled back.
    pub async fn execute_each_in_transaction(
        &self,
        statements: &[String],
    ) -> Result<(), PostgresError> {
        let mut conn = self.pool.get().await?;
        let transaction = conn.transaction().await.map_err(PostgresError::PgError)?;

        for statement in statements {
            let affected =
                transaction.execute(statement.as_str(), &[]).await.map_err(PostgresError::PgError)?;
            if affected != 1 {
                transaction.rollback().await.map_err(PostgresError::PgError)?;
                return Err(PostgresError::UnexpectedRowCount { expected: 1, actual: affected });
            }
        }

        transaction.commit().await.map_err(PostgresError::PgError)?;
        Ok(())
    }
}
