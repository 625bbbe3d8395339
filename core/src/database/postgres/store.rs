use async_trait::async_trait;
use bb8::RunError;
use serde_json::Value;
use tokio_postgres::error::SqlState;
use tracing::debug;

use crate::{
    database::{
        capabilities::{ConnectionDescriptor, Provider},
        postgres::client::{PostgresClient, PostgresConnectionError, PostgresError},
        sql::{build_delete_sql, build_insert_sql, build_select_sql, build_update_sql},
    },
    model::ModelSchema,
    record::{record_from, Record},
    store::{Filter, RecordUpdate, Store, StoreError},
};

fn is_transient_state(code: &SqlState) -> bool {
    [
        SqlState::T_R_DEADLOCK_DETECTED,
        SqlState::T_R_SERIALIZATION_FAILURE,
        SqlState::LOCK_NOT_AVAILABLE,
        SqlState::QUERY_CANCELED,
        SqlState::TOO_MANY_CONNECTIONS,
        SqlState::ADMIN_SHUTDOWN,
        SqlState::CANNOT_CONNECT_NOW,
    ]
    .contains(code)
}

impl From<PostgresError> for StoreError {
    fn from(e: PostgresError) -> Self {
        let message = e.to_string();
        match &e {
            PostgresError::PgError(pg) => match pg.as_db_error() {
                Some(db) if *db.code() == SqlState::UNIQUE_VIOLATION => {
                    StoreError::unique_violation(db.message())
                }
                Some(db) if is_transient_state(db.code()) => {
                    StoreError::transient(db.message())
                }
                Some(db) => StoreError::other(db.message()),
                // no server response: the connection dropped or timed out
                None if pg.is_closed() => StoreError::transient(message),
                None => StoreError::from_message(message),
            },
            PostgresError::ConnectionPoolError(RunError::TimedOut) => {
                StoreError::transient(message)
            }
            PostgresError::ConnectionPoolError(RunError::User(pg)) if pg.is_closed() => {
                StoreError::transient(message)
            }
            PostgresError::ConnectionPoolError(_) => StoreError::from_message(message),
            PostgresError::UnexpectedRowCount { .. } => StoreError::other(message),
        }
    }
}

/// [`Store`] over a bb8 pooled postgres connection.
///
/// Writes are rendered as SQL with inline literals. Column kinds come from
/// schemas registered with [`PostgresStore::with_schema`]; undeclared
/// columns are treated as scalars.
pub struct PostgresStore {
    client: PostgresClient,
    url: Option<String>,
    schemas: Vec<ModelSchema>,
}

impl PostgresStore {
    pub fn new(client: PostgresClient) -> Self {
        Self { client, url: None, schemas: Vec::new() }
    }

    /// Connects to `connection_str` with a pool of `pool_size` connections.
    pub async fn connect(
        connection_str: &str,
        pool_size: u32,
    ) -> Result<Self, PostgresConnectionError> {
        let client = PostgresClient::connect(connection_str, pool_size).await?;
        Ok(Self { client, url: Some(connection_str.to_string()), schemas: Vec::new() })
    }

    pub fn with_schema(mut self, schema: ModelSchema) -> Self {
        self.schemas.push(schema);
        self
    }

    fn schema_for(&self, table: &str) -> Option<&ModelSchema> {
        self.schemas.iter().find(|schema| schema.table == table)
    }

    pub fn client(&self) -> &PostgresClient {
        &self.client
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn find_many(&self, table: &str, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        let sql = format!(
            "SELECT row_to_json(r)::jsonb FROM ({}) r",
            build_select_sql(Provider::Postgres, table, filter)
        );
        debug!("PostgresStore find_many: {}", sql);

        let rows = self.client.query_json(&sql).await?;
        Ok(rows.into_iter().map(record_from).collect())
    }

    async fn create_many(
        &self,
        table: &str,
        records: &[Record],
        skip_duplicates: bool,
    ) -> Result<u64, StoreError> {
        let Some(sql) = build_insert_sql(
            Provider::Postgres,
            table,
            records,
            skip_duplicates,
            self.schema_for(table),
        ) else {
            return Ok(0);
        };

        Ok(self.client.execute(&sql).await?)
    }

    async fn update(
        &self,
        table: &str,
        id_field: &str,
        id: &Value,
        data: &Record,
    ) -> Result<(), StoreError> {
        let Some(sql) =
            build_update_sql(Provider::Postgres, table, id_field, id, data, self.schema_for(table))
        else {
            return Ok(());
        };

        match self.client.execute(&sql).await? {
            0 => Err(StoreError::other(format!("Record to update not found: {}", id))),
            _ => Ok(()),
        }
    }

    async fn delete_many(
        &self,
        table: &str,
        id_field: &str,
        ids: &[Value],
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(self.client.execute(&build_delete_sql(Provider::Postgres, table, id_field, ids)).await?)
    }

    async fn transaction(
        &self,
        table: &str,
        id_field: &str,
        updates: &[RecordUpdate],
    ) -> Result<(), StoreError> {
        let schema = self.schema_for(table);
        let statements: Vec<String> = updates
            .iter()
            .filter_map(|update| {
                let (id, data) = (&update.id, &update.data);
                build_update_sql(Provider::Postgres, table, id_field, id, data, schema)
            })
            .collect();

        Ok(self.client.execute_each_in_transaction(&statements).await?)
    }

    async fn execute_raw_unsafe(&self, sql: &str) -> Result<u64, StoreError> {
        Ok(self.client.execute(sql).await?)
    }

    fn pool_size(&self) -> usize {
        self.client.pool_size() as usize
    }

    fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            engine: Some(Provider::Postgres.as_str().to_string()),
            url: self.url.clone(),
        }
    }
}
