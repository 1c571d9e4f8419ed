//! Engine test utilities.

use super::fetcher::MockFetcher;
use larder_core::config::EngineConfig;
use larder_engine::{Engine, StaticNetwork, StaticSite};
use larder_metadata::{MetadataStore, SqliteStore};
use larder_storage::{FileStore, FilesystemBackend};
use std::sync::Arc;
use tempfile::TempDir;

/// Site every test registers.
#[allow(dead_code)]
pub const SITE: &str = "school";

/// An engine over temporary storage with a mock network.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestEngine {
    pub engine: Engine,
    pub fetcher: Arc<MockFetcher>,
    pub network: Arc<StaticNetwork>,
    pub metadata: Arc<dyn MetadataStore>,
    pub storage: Arc<dyn FileStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEngine {
    /// Online, unmetered engine with one registered site.
    pub async fn new() -> Self {
        Self::with_config(test_config(), true).await
    }

    pub async fn offline() -> Self {
        Self::with_config(test_config(), false).await
    }

    pub async fn with_config(config: EngineConfig, online: bool) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage: Arc<dyn FileStore> = Arc::new(
            FilesystemBackend::new(temp_dir.path().join("files"))
                .await
                .expect("Failed to create storage backend"),
        );
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp_dir.path().join("larder.db"), None)
                .await
                .expect("Failed to create metadata store"),
        );
        let fetcher = Arc::new(MockFetcher::new());
        let network = Arc::new(StaticNetwork::new(online, false));

        let engine = Engine::new(
            config,
            metadata.clone(),
            storage.clone(),
            fetcher.clone(),
            network.clone(),
        );
        engine.register_site(Arc::new(StaticSite::new(SITE)));

        Self {
            engine,
            fetcher,
            network,
            metadata,
            storage,
            _temp_dir: temp_dir,
        }
    }

    /// Bring the device online and let the queue drain.
    pub async fn go_online(&self) {
        self.network.set_online(true);
        self.engine.check_queue_processing().await;
        self.engine.wait_until_idle().await;
    }

    /// Contents of the local copy at `path`.
    pub fn read_local(&self, path: &str) -> Vec<u8> {
        std::fs::read(path).expect("local copy missing")
    }
}

/// Engine settings with a short retry delay.
#[allow(dead_code)]
pub fn test_config() -> EngineConfig {
    EngineConfig {
        transient_retry_delay_ms: 20,
        ..Default::default()
    }
}
