pub mod client;
mod store;

pub use client::{PostgresClient, PostgresConnectionError, PostgresError, DEFAULT_POOL_SIZE};
pub use store::PostgresStore;
