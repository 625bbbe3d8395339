//! The record store collaborator the batch engine drives.
//!
//! A store owns persistence; this crate only decides how to slice, order and
//! retry the calls made against it.

mod error;
mod filter;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

pub use error::{ErrorClass, StoreError, StoreErrorKind};
pub use filter::Filter;

use crate::{database::capabilities::ConnectionDescriptor, record::Record};

/// A single identity-targeted update applied inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub id: Value,
    pub data: Record,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_many(&self, table: &str, filter: &Filter) -> Result<Vec<Record>, StoreError>;

    /// Inserts `records` in one round trip and returns how many rows were written.
    /// With `skip_duplicates` rows violating a unique constraint are ignored.
    async fn create_many(
        &self,
        table: &str,
        records: &[Record],
        skip_duplicates: bool,
    ) -> Result<u64, StoreError>;

    async fn update(
        &self,
        table: &str,
        id_field: &str,
        id: &Value,
        data: &Record,
    ) -> Result<(), StoreError>;

    async fn delete_many(&self, table: &str, id_field: &str, ids: &[Value])
        -> Result<u64, StoreError>;

    /// Applies every update or none of them.
    async fn transaction(
        &self,
        table: &str,
        id_field: &str,
        updates: &[RecordUpdate],
    ) -> Result<(), StoreError>;

    async fn execute_raw_unsafe(&self, sql: &str) -> Result<u64, StoreError>;

    /// Connections available to run round trips concurrently.
    fn pool_size(&self) -> usize;

    fn descriptor(&self) -> ConnectionDescriptor;
}
