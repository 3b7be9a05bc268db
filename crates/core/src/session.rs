//! Wiring of one configured sync pair: storages, identifiers, metadata
//! backend, database and orchestrator.

use std::sync::Arc;

use tracing::info;

use crate::config::{AppConfig, MetadataBackendKind};
use crate::db::{Database, SqliteMetadataBackend};
use crate::errors::CoreError;
use crate::metadata::{MetadataBackend, StorageMetadataBackend, SyncMetadataStore};
use crate::orchestrator::SyncOrchestrator;
use crate::runner::JobRunner;
use crate::storage::{FsStorage, Storage};
use crate::storage_id::{ensure_storage_id, metadata_file_path};

/// Everything needed to reconcile the pair described by an [`AppConfig`].
pub struct SyncSession {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub local_id: String,
    pub remote_id: String,
}

impl SyncSession {
    /// Open both trees, assign storage ids, load metadata and build the
    /// orchestrator.
    pub async fn open(config: AppConfig) -> Result<Self, CoreError> {
        config.validate()?;

        let local: Arc<dyn Storage> = Arc::new(FsStorage::open(config.local.path.clone())?);
        let remote: Arc<dyn Storage> = Arc::new(FsStorage::open(config.remote.path.clone())?);
        let local_id = ensure_storage_id(local.as_ref()).await?;
        let remote_id = ensure_storage_id(remote.as_ref()).await?;

        let db = Arc::new(Database::new(config.database_path())?);
        db.initialize()?;

        let backend: Box<dyn MetadataBackend> = match config.sync.metadata_backend {
            MetadataBackendKind::Storage => Box::new(StorageMetadataBackend::new(
                local.clone(),
                metadata_file_path(&remote_id),
            )),
            MetadataBackendKind::Sqlite => Box::new(SqliteMetadataBackend::new(db.clone())),
        };
        let metadata = Arc::new(SyncMetadataStore::open(backend).await?);

        let orchestrator = SyncOrchestrator::new(local, remote, metadata, config.ignore_policy())
            .with_auto_accept(config.auto_accept_rules());

        db.set_state("local_storage_id", &local_id)?;
        db.set_state("remote_storage_id", &remote_id)?;

        info!(
            local_id = %local_id,
            remote_id = %remote_id,
            backend = ?config.sync.metadata_backend,
            "sync session opened"
        );
        Ok(Self {
            config,
            db,
            orchestrator: Arc::new(orchestrator),
            local_id,
            remote_id,
        })
    }

    /// A job runner configured from `[sync]`.
    pub fn runner(&self) -> JobRunner {
        JobRunner::new(self.orchestrator.clone(), self.config.runner_config())
    }

    /// The configured reconciliation root.
    pub fn root(&self) -> &str {
        &self.config.sync.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunMode;

    fn config_in(dir: &std::path::Path, backend: MetadataBackendKind) -> AppConfig {
        let mut config = AppConfig::new(dir.join("local"), dir.join("remote"));
        config.daemon.data_dir = dir.join("data");
        config.sync.metadata_backend = backend;
        config
    }

    #[tokio::test]
    async fn test_open_assigns_ids_and_syncs() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), MetadataBackendKind::Storage);
        std::fs::create_dir_all(dir.path().join("local")).unwrap();
        std::fs::write(dir.path().join("local/hello.txt"), "hi").unwrap();

        let session = SyncSession::open(config.clone()).await.unwrap();
        assert_ne!(session.local_id, session.remote_id);

        session.orchestrator.update_diff(session.root()).await.unwrap();
        let stats = session.runner().run(RunMode::UntilIdle).await.unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("remote/hello.txt")).unwrap(),
            "hi"
        );

        let metadata_file = dir
            .path()
            .join("local/.treesync")
            .join(format!("sync-{}.json", session.remote_id));
        assert!(metadata_file.exists());

        // Reopening keeps the ids.
        let again = SyncSession::open(config).await.unwrap();
        assert_eq!(again.remote_id, session.remote_id);
        assert_eq!(again.orchestrator.metadata().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_backend_is_used_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), MetadataBackendKind::Sqlite);
        std::fs::create_dir_all(dir.path().join("remote")).unwrap();
        std::fs::write(dir.path().join("remote/r.txt"), "r").unwrap();

        let session = SyncSession::open(config).await.unwrap();
        session.orchestrator.update_diff("/").await.unwrap();
        assert_eq!(session.db.count_sync_metadata().unwrap(), 1);
    }
}
