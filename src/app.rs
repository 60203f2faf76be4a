//! Core application

use std::sync::Arc;

use anyhow::Result;

use crate::api::ApiServer;
use crate::core::cli::{self, CliConfig};
use crate::core::config::{AppConfig, StorageBackend};
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::domain::dedup::TraceIdDedup;
use crate::storage::memory::MemoryStorage;
use crate::storage::TraceStorage;

pub struct CoreApp {
    pub config: AppConfig,
    pub storage: Arc<dyn TraceStorage>,
    pub dedup: Arc<TraceIdDedup>,
    pub shutdown: ShutdownService,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        Self::init_logging();
        tracing::debug!("application starting");

        let cli_config = cli::parse();
        let app = Self::init(&cli_config)?;
        Self::start_server(app).await
    }

    fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;

        let storage: Arc<dyn TraceStorage> = match config.storage {
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        };
        let dedup = Arc::new(TraceIdDedup::default());
        let shutdown = ShutdownService::new();

        Ok(Self {
            config,
            storage,
            dedup,
            shutdown,
        })
    }

    fn init_logging() {
        let default_filter = format!("info,{APP_NAME_LOWER}=info");
        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start_server(app: Self) -> Result<()> {
        app.shutdown.install_signal_handlers();
        ApiServer::new(app).start().await
    }
}
