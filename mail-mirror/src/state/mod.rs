//! Mirror state
//!
//! Wires the control database, shard host, registry, fan-out, mailbox service
//! and sync coordinator together from one configuration.

use std::sync::Arc;
use tracing::info;

use crate::adapters::sqlite::checkpoints;
use crate::adapters::sqlite::connections::{self, ConnectionRecord};
use crate::adapters::sqlite::pool::{create_memory_pool, create_pool};
use crate::adapters::sqlite::schema::initialize_control_schema;
use crate::adapters::sqlite::DbPool;
use crate::config::MirrorConfig;
use crate::error::{MirrorError, Result};
use crate::fanout::FanOut;
use crate::registry::ShardRegistry;
use crate::services::sync::{
    CoordinatorState, ProviderResolver, SyncCoordinator, SyncSummary, ThreadSyncWorker,
};
use crate::services::{EventBus, MailboxService};
use crate::shard::{ShardHost, ShardLocation};

const CONTROL_POOL_SIZE: u32 = 8;

pub struct MirrorState {
    config: MirrorConfig,
    pool: DbPool,
    registry: Arc<ShardRegistry>,
    mailboxes: Arc<MailboxService>,
    worker: Arc<ThreadSyncWorker>,
    coordinator: SyncCoordinator,
}

impl MirrorState {
    /// Open the on-disk mirror under the configured data directory
    pub fn open(config: MirrorConfig, resolver: Arc<dyn ProviderResolver>) -> Result<Self> {
        let data_dir = config.data_dir()?;
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("control.db");
        info!("Opening mirror control database at {:?}", db_path);

        let pool = create_pool(&db_path, CONTROL_POOL_SIZE)?;
        Self::assemble(config, pool, ShardLocation::Directory(data_dir), resolver)
    }

    /// Fully in-memory mirror (for testing)
    pub fn in_memory(config: MirrorConfig, resolver: Arc<dyn ProviderResolver>) -> Result<Self> {
        let pool = create_memory_pool()?;
        Self::assemble(config, pool, ShardLocation::InMemory, resolver)
    }

    fn assemble(
        config: MirrorConfig,
        pool: DbPool,
        location: ShardLocation,
        resolver: Arc<dyn ProviderResolver>,
    ) -> Result<Self> {
        config.validate()?;
        {
            let conn = pool.get()?;
            initialize_control_schema(&conn)?;
        }

        let host = Arc::new(ShardHost::new(location));
        let registry = Arc::new(ShardRegistry::new(
            pool.clone(),
            host,
            config.storage.max_shard_size_bytes,
            config.fanout.max_concurrency,
        ));
        let fanout = FanOut::new(registry.clone(), config.fanout.max_concurrency);
        let mailboxes = Arc::new(MailboxService::new(fanout, EventBus::new()));
        let worker = Arc::new(ThreadSyncWorker::new(
            mailboxes.clone(),
            config.sync.fetch_concurrency,
        ));
        let coordinator = SyncCoordinator::new(
            pool.clone(),
            resolver,
            worker.clone(),
            config.sync.clone(),
        );

        Ok(Self {
            config,
            pool,
            registry,
            mailboxes,
            worker,
            coordinator,
        })
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn mailboxes(&self) -> &Arc<MailboxService> {
        &self.mailboxes
    }

    pub fn worker(&self) -> &Arc<ThreadSyncWorker> {
        &self.worker
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn upsert_connection(&self, record: &ConnectionRecord) -> Result<()> {
        if record.max_page_count == Some(0) {
            return Err(MirrorError::InvalidInput(
                "max_page_count must be at least 1".into(),
            ));
        }
        connections::upsert_connection(&self.pool, record)
    }

    pub fn get_connection(&self, mailbox_id: &str) -> Result<Option<ConnectionRecord>> {
        connections::get_connection(&self.pool, mailbox_id)
    }

    /// Start a fresh sync run for a folder
    pub async fn sync_folder(&self, mailbox_id: &str, folder: &str) -> Result<SyncSummary> {
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Starting sync run {} for {}/{}", run_id, mailbox_id, folder);
        self.coordinator.run(&run_id, mailbox_id, folder).await
    }

    /// Re-drive an earlier run; finished steps are replayed, not redone
    pub async fn resume_sync(&self, run_id: &str, mailbox_id: &str, folder: &str) -> Result<SyncSummary> {
        self.coordinator.run(run_id, mailbox_id, folder).await
    }

    pub fn run_state(&self, run_id: &str) -> Result<Option<CoordinatorState>> {
        self.coordinator.run_state(run_id)
    }

    /// Drop the mailbox's shards and its sync checkpoints. A later run,
    /// even under an old run id, syncs from the first page again.
    pub async fn force_resync(&self, mailbox_id: &str) -> Result<usize> {
        let dropped = self.mailboxes.force_resync(mailbox_id).await?;
        let runs = checkpoints::clear_mailbox_runs(&self.pool, mailbox_id)?;
        info!(
            "Force resync of {}: {} shards and {} runs cleared",
            mailbox_id, dropped, runs
        );
        Ok(dropped)
    }
}
