//! Mail Mirror - sharded mailbox storage and sync engine
//!
//! Mirrors a remote mailbox into local SQLite shards so listing, filtering,
//! labeling and searching threads never wait on the provider.
//!
//! ## Module Organization
//!
//! - `adapters/`: SQLite pools, schemas and row-level stores
//! - `shard/`: One actor per shard, owning its store
//! - `registry/`: Per-mailbox shard directory and write placement
//! - `fanout/`: Cross-shard aggregation combinators
//! - `services/`: Mailbox operations, events and remote sync
//! - `state/`: Top-level wiring
//! - `types/`: Data structures shared across layers
//! - `config/`: Configuration management

pub mod adapters;
pub mod config;
pub mod error;
pub mod fanout;
pub mod registry;
pub mod services;
pub mod shard;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use tracing_subscriber::EnvFilter;

pub use config::MirrorConfig;
pub use error::{MirrorError, Result};
pub use services::sync::{
    CoordinatorState, LatestMessage, MailManager, ProviderRegistry, ProviderResolver,
    SyncSummary, ThreadListing, ThreadStub,
};
pub use services::{MailboxEvent, MailboxService};
pub use state::MirrorState;
pub use types::{AggregateState, Label, Sender, Thread, ThreadPage, ThreadQuery};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise debug builds log this crate at debug
/// and everything else at info; release builds log at info.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("mail_mirror=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    // A subscriber may already be installed by the embedding application
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
