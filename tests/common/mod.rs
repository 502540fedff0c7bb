//! Shared harness for the end-to-end pipeline tests
//!
//! Runs every component in-process against one SQLite file, which acts as record
//! store, durable broker and counter store, the same way separate processes share it.

#![allow(dead_code)]

use media_dl::completion::CompletionTracker;
use media_dl::consumer::{ResultConsumer, ResultProcessor};
use media_dl::{
    AtomicCounterStore, Config, Database, DownloadWorker, JobPublisher, MediaKind, Package,
    PackageId, PackageService, PackageStatus, QueueClient, RetryConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// All pipeline components wired to one database
pub struct Harness {
    pub db: Arc<Database>,
    pub config: Config,
    pub service: PackageService,
    pub processor: ResultProcessor,
    workers: Vec<DownloadWorker>,
    consumer: ResultConsumer,
    dir: TempDir,
}

pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.path().join("media-dl.db");
    config.workers.download_dir = dir.path().join("downloads");
    config.workers.concurrency = 4;
    config.workers.result_concurrency = 4;
    config.workers.request_timeout = Duration::from_secs(5);
    config.workers.head_timeout = Duration::from_secs(1);
    config.queues.poll_interval = Duration::from_millis(10);
    config.retry = RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

impl Harness {
    pub async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let db = Arc::new(Database::new(&config.persistence.database_path).await.unwrap());
        let client: Arc<dyn QueueClient> = db.clone();
        let counters: Arc<dyn AtomicCounterStore> = db.clone();

        let tracker = CompletionTracker::new(counters.clone(), db.clone());
        let processor = ResultProcessor::new(db.clone(), tracker.clone(), "http://files.test");
        let consumer = ResultConsumer::start(client.clone(), processor.clone(), &config);
        let publisher = JobPublisher::new(client.clone(), counters, &config);
        let service = PackageService::new(db.clone(), publisher, tracker);

        let workers = MediaKind::ALL
            .into_iter()
            .map(|kind| DownloadWorker::start(client.clone(), kind, &config).unwrap())
            .collect();

        Self {
            db,
            config,
            service,
            processor,
            workers,
            consumer,
            dir,
        }
    }

    pub fn client(&self) -> Arc<dyn QueueClient> {
        self.db.clone()
    }

    pub fn download_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("downloads")
    }

    /// Poll until the package reaches `status`, panicking after `timeout`
    pub async fn wait_for_status(&self, id: PackageId, status: PackageStatus, timeout: Duration) -> Package {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let package = self.service.get_package(id).await.unwrap();
            if package.status == status {
                return package;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "package {} stuck in {:?}, wanted {:?}: {:#?}",
                    id, package.status, status, package.media
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn shutdown(self) {
        for worker in &self.workers {
            worker.shutdown().await;
        }
        self.consumer.shutdown().await;
    }
}
