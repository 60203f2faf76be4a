use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bytesize::ByteSize;
use clap::Parser;

use super::config::StorageBackend;
use super::constants::{
    ENV_CONFIG, ENV_HOST, ENV_MAX_REQUEST_SIZE, ENV_PORT, ENV_SEARCH_MAX_DURATION_WINDOW,
    ENV_SEARCH_MAX_SERVICE_NAMES, ENV_SEARCH_MAX_SPAN_NAMES, ENV_SEARCH_NAME_LOOKBEHIND,
    ENV_SEARCH_STEP, ENV_STORAGE_BACKEND,
};

#[derive(Parser)]
#[command(name = "tracelake")]
#[command(version, about = "Trace ingestion and Jaeger query service", long_about = None)]
pub struct Cli {
    /// Server host address
    #[arg(long, short = 'H', env = ENV_HOST)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, short = 'p', env = ENV_PORT)]
    pub port: Option<u16>,

    /// Path to config file
    #[arg(long, short = 'c', env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Storage backend (memory)
    #[arg(long, env = ENV_STORAGE_BACKEND, value_parser = parse_storage_backend)]
    pub storage: Option<StorageBackend>,

    /// Maximum size of a single trace export request (e.g. "64MiB")
    #[arg(long, env = ENV_MAX_REQUEST_SIZE, value_parser = parse_byte_size)]
    pub max_request_size: Option<u64>,

    /// Window of searching for the remaining spans of a trace after finding
    /// one span (e.g. "45s")
    #[arg(long, env = ENV_SEARCH_MAX_DURATION_WINDOW, value_parser = parse_duration_flag)]
    pub search_max_duration_window: Option<Duration>,

    /// Time range of searching for service names and span names (e.g. "72h")
    #[arg(long, env = ENV_SEARCH_NAME_LOOKBEHIND, value_parser = parse_duration_flag)]
    pub search_name_lookbehind: Option<Duration>,

    /// Width of the receding windows used when searching spans by trace id
    /// (e.g. "24h")
    #[arg(long, env = ENV_SEARCH_STEP, value_parser = parse_duration_flag)]
    pub search_step: Option<Duration>,

    /// Maximum number of service names returned by the services catalog
    #[arg(long, env = ENV_SEARCH_MAX_SERVICE_NAMES)]
    pub search_max_service_names: Option<u64>,

    /// Maximum number of span names returned by the operations catalog
    #[arg(long, env = ENV_SEARCH_MAX_SPAN_NAMES)]
    pub search_max_span_names: Option<u64>,
}

fn parse_storage_backend(s: &str) -> Result<StorageBackend, String> {
    match s.to_lowercase().as_str() {
        "memory" => Ok(StorageBackend::Memory),
        _ => Err(format!("invalid storage backend '{s}'. Valid options: memory")),
    }
}

fn parse_byte_size(s: &str) -> Result<u64, String> {
    ByteSize::from_str(s)
        .map(|b| b.as_u64())
        .map_err(|e| format!("invalid byte size '{s}': {e}"))
}

fn parse_duration_flag(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| format!("invalid duration '{s}': {e}"))
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
    pub storage: Option<StorageBackend>,
    pub max_request_size: Option<u64>,
    pub search_max_duration_window: Option<Duration>,
    pub search_name_lookbehind: Option<Duration>,
    pub search_step: Option<Duration>,
    pub search_max_service_names: Option<u64>,
    pub search_max_span_names: Option<u64>,
}

/// Parse CLI arguments
pub fn parse() -> CliConfig {
    let cli = Cli::parse();
    CliConfig {
        host: cli.host,
        port: cli.port,
        config: cli.config,
        storage: cli.storage,
        max_request_size: cli.max_request_size,
        search_max_duration_window: cli.search_max_duration_window,
        search_name_lookbehind: cli.search_name_lookbehind,
        search_step: cli.search_step,
        search_max_service_names: cli.search_max_service_names,
        search_max_span_names: cli.search_max_span_names,
    }
}
