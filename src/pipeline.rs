//! Process wiring
//!
//! [`Pipeline::start`] opens the SQLite store and starts the components a process
//! runs for its [`Role`]. The store doubles as the durable broker and the counter
//! store, so any number of processes pointed at the same database file cooperate.

use crate::api::start_api_server;
use crate::completion::CompletionTracker;
use crate::config::Config;
use crate::consumer::{ResultConsumer, ResultProcessor};
use crate::counter::AtomicCounterStore;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::publisher::JobPublisher;
use crate::queue::{QueueClient, spawn_failed_sweep};
use crate::service::PackageService;
use crate::types::MediaKind;
use crate::worker::DownloadWorker;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Which components a process runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// HTTP API and result consumer
    Serve,
    /// Image and video download workers
    Worker,
    /// Everything in one process
    All,
}

impl Role {
    fn serves(self) -> bool {
        matches!(self, Role::Serve | Role::All)
    }

    fn downloads(self) -> bool {
        matches!(self, Role::Worker | Role::All)
    }
}

/// Running components of one process
pub struct Pipeline {
    role: Role,
    db: Arc<Database>,
    service: Option<Arc<PackageService>>,
    consumer: Option<ResultConsumer>,
    workers: Vec<DownloadWorker>,
    api: Option<JoinHandle<Result<()>>>,
    api_shutdown: CancellationToken,
    sweep: JoinHandle<()>,
    sweep_shutdown: CancellationToken,
}

impl Pipeline {
    /// Open the store and start the components for `role`
    pub async fn start(config: Config, role: Role) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let db = Arc::new(Database::new(&config.persistence.database_path).await?);
        let client: Arc<dyn QueueClient> = db.clone();
        let counters: Arc<dyn AtomicCounterStore> = db.clone();
        let api_shutdown = CancellationToken::new();

        let mut service = None;
        let mut consumer = None;
        let mut api = None;

        if role.serves() {
            let tracker = CompletionTracker::new(counters.clone(), db.clone());
            let processor = ResultProcessor::new(
                db.clone(),
                tracker.clone(),
                config.api.file_server_uri.clone(),
            );
            consumer = Some(ResultConsumer::start(client.clone(), processor, &config));

            let publisher = JobPublisher::new(client.clone(), counters, &config);
            let package_service = Arc::new(PackageService::new(db.clone(), publisher, tracker));
            api = Some(tokio::spawn(start_api_server(
                package_service.clone(),
                config.clone(),
                api_shutdown.clone(),
            )));
            service = Some(package_service);
        }

        let mut workers = Vec::new();
        if role.downloads() {
            tokio::fs::create_dir_all(&config.workers.download_dir).await?;
            for kind in MediaKind::ALL {
                workers.push(DownloadWorker::start(client.clone(), kind, &config)?);
            }
        }

        // Each process sweeps the queues it consumes
        let mut swept = Vec::new();
        if role.serves() {
            swept.push(config.queues.result_queue.clone());
        }
        if role.downloads() {
            swept.extend(MediaKind::ALL.iter().map(|&kind| config.queues.queue_for(kind).to_string()));
        }
        let sweep_shutdown = CancellationToken::new();
        let sweep = spawn_failed_sweep(
            client,
            swept,
            config.queues.failed_retention,
            config.queues.retention_interval,
            sweep_shutdown.clone(),
        );

        tracing::info!(?role, database = %config.persistence.database_path.display(), "pipeline started");

        Ok(Self {
            role,
            db,
            service,
            consumer,
            workers,
            api,
            api_shutdown,
            sweep,
            sweep_shutdown,
        })
    }

    /// Role this pipeline was started with
    pub fn role(&self) -> Role {
        self.role
    }

    /// Shared store
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Package service, when this process serves the API
    pub fn service(&self) -> Option<&Arc<PackageService>> {
        self.service.as_ref()
    }

    /// Wait for the API server to stop on its own, which only happens on error.
    ///
    /// Never resolves for processes without an API server.
    pub async fn api_stopped(&mut self) -> Result<()> {
        let Some(api) = self.api.as_mut() else {
            return std::future::pending().await;
        };
        let joined = api.await;
        self.api = None;
        joined.map_err(|e| Error::Other(format!("API server task failed: {}", e)))?
    }

    /// Stop everything in order: the API first so no new packages arrive, then the
    /// download workers, then the result consumer. Each drains its in-flight work.
    /// The retention sweep stops last.
    pub async fn shutdown(mut self) {
        tracing::info!("shutting down");

        self.api_shutdown.cancel();
        if let Some(api) = self.api.take() {
            match api.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "API server stopped with an error"),
                Err(e) => tracing::error!(error = %e, "API server task failed"),
            }
        }

        futures::future::join_all(self.workers.iter().map(DownloadWorker::shutdown)).await;

        if let Some(consumer) = &self.consumer {
            consumer.shutdown().await;
        }

        self.sweep_shutdown.cancel();
        if let Err(e) = (&mut self.sweep).await {
            tracing::error!(error = %e, "retention sweep task failed");
        }

        drop(self.service.take());
        match Arc::try_unwrap(self.db) {
            Ok(db) => db.close().await,
            Err(_) => tracing::debug!("database still shared, leaving the pool open"),
        }

        tracing::info!("shutdown complete");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.persistence.database_path = dir.path().join("media-dl.db");
        config.workers.download_dir = dir.path().join("downloads");
        config.api.bind_address = "127.0.0.1:0".parse().unwrap();
        config
    }

    #[tokio::test]
    async fn test_worker_role_starts_both_kinds() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::start(config(&dir), Role::Worker).await.unwrap();

        assert_eq!(pipeline.role(), Role::Worker);
        assert!(pipeline.service().is_none());
        let kinds: Vec<MediaKind> = pipeline.workers.iter().map(|w| w.kind()).collect();
        assert_eq!(kinds, MediaKind::ALL.to_vec());
        assert!(dir.path().join("downloads").is_dir());

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_all_role_serves_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::start(config(&dir), Role::All).await.unwrap();

        assert!(pipeline.service().is_some());
        assert_eq!(pipeline.workers.len(), 2);

        tokio::time::timeout(std::time::Duration::from_secs(10), pipeline.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_serve_role_sweeps_parked_results() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.queues.failed_retention = std::time::Duration::ZERO;
        config.queues.retention_interval = std::time::Duration::from_millis(10);
        config.result_retry.max_attempts = 1;

        let db = Database::new(&config.persistence.database_path).await.unwrap();
        db.enqueue_batch("download-results", vec!["not json".into()], &config.result_retry)
            .await
            .unwrap();
        db.close().await;

        // The consumer dead-letters the undecodable result, then the sweep removes it
        let pipeline = Pipeline::start(config, Role::Serve).await.unwrap();
        let client: Arc<dyn QueueClient> = pipeline.database().clone();
        let mut stats = client.stats("download-results").await.unwrap();
        for _ in 0..200 {
            if stats.waiting + stats.active + stats.failed == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            stats = client.stats("download-results").await.unwrap();
        }
        assert_eq!(stats.waiting + stats.active + stats.failed, 0);

        drop(client);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.workers.concurrency = 0;

        assert!(matches!(
            Pipeline::start(config, Role::Worker).await,
            Err(Error::Config { .. })
        ));
    }
}
