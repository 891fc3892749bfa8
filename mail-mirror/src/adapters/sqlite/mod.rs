pub mod checkpoints;
pub mod connections;
pub mod pool;
pub mod registry;
pub mod schema;
pub mod shard_store;

// Re-export the pool types so callers can do `use crate::adapters::sqlite::DbPool`
pub use pool::{DbConnection, DbPool};
pub use shard_store::ShardStore;
