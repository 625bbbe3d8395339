use serde::{Deserialize, Serialize};

use crate::database::capabilities::{capabilities_for, Provider};

/// The type of batch operation a chunk is sized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// Writes grouped into a multi-statement transaction.
    TransactionalWrite,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::TransactionalWrite => "transactional_write",
        }
    }
}

/// Recommended chunk size per provider and operation kind.
pub fn optimal_chunk_size(provider: Provider, kind: OperationKind) -> usize {
    match (provider, kind) {
        (Provider::Postgres, OperationKind::Create) => 1000,
        (Provider::Postgres, OperationKind::Update) => 500,
        (Provider::Postgres, OperationKind::Delete) => 1000,
        (Provider::Postgres, OperationKind::TransactionalWrite) => 100,

        (Provider::Mysql, OperationKind::Create) => 1000,
        (Provider::Mysql, OperationKind::Update) => 500,
        (Provider::Mysql, OperationKind::Delete) => 1000,
        (Provider::Mysql, OperationKind::TransactionalWrite) => 100,

        (Provider::Sqlite, OperationKind::Create) => 500,
        (Provider::Sqlite, OperationKind::Update) => 250,
        (Provider::Sqlite, OperationKind::Delete) => 500,
        (Provider::Sqlite, OperationKind::TransactionalWrite) => 50,

        (Provider::SqlServer, OperationKind::Create) => 500,
        (Provider::SqlServer, OperationKind::Update) => 250,
        (Provider::SqlServer, OperationKind::Delete) => 1000,
        (Provider::SqlServer, OperationKind::TransactionalWrite) => 50,

        // multi-document transactions are bounded far below set-based SQL writes
        (Provider::MongoDb, OperationKind::Create) => 1000,
        (Provider::MongoDb, OperationKind::Update) => 100,
        (Provider::MongoDb, OperationKind::Delete) => 1000,
        (Provider::MongoDb, OperationKind::TransactionalWrite) => 25,
    }
}

/// Chunk size for a set-based insert of rows with `columns_per_row` bound values,
/// capped so a single statement stays under the provider's placeholder ceiling.
pub fn create_chunk_size(provider: Provider, columns_per_row: usize) -> usize {
    let recommended = optimal_chunk_size(provider, OperationKind::Create);
    if columns_per_row == 0 {
        return recommended;
    }

    let by_placeholders = capabilities_for(provider).max_placeholders / columns_per_row;
    recommended.min(by_placeholders).max(1)
}
