use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::domain::search::SearchConfig;

use super::cli::CliConfig;
use super::constants::{
    CONFIG_FILE_NAME, DEFAULT_HOST, DEFAULT_MAX_REQUEST_SIZE, DEFAULT_PORT,
    DEFAULT_SEARCH_MAX_DURATION_WINDOW_SECS, DEFAULT_SEARCH_MAX_SERVICE_NAMES,
    DEFAULT_SEARCH_MAX_SPAN_NAMES, DEFAULT_SEARCH_NAME_LOOKBEHIND_SECS, DEFAULT_SEARCH_STEP_SECS,
};

// =============================================================================
// Storage Backend Enum
// =============================================================================

/// Storage backend for span rows. The columnar engine proper runs out of
/// process; the in-memory backend serves development and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

// =============================================================================
// File Config Structs (JSON deserialization)
// =============================================================================

/// Server configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Ingestion configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct InsertFileConfig {
    /// Maximum request body size, as a byte-size string ("64MiB")
    pub max_request_size: Option<String>,
}

/// Search configuration section; durations are humane strings ("45s", "24h")
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SearchFileConfig {
    pub max_duration_window: Option<String>,
    pub service_and_span_name_lookbehind: Option<String>,
    pub step: Option<String>,
    pub max_service_name_list: Option<u64>,
    pub max_span_name_list: Option<u64>,
}

/// File-based configuration (JSON)
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub server: Option<ServerFileConfig>,
    pub insert: Option<InsertFileConfig>,
    pub search: Option<SearchFileConfig>,
    pub storage: Option<StorageBackend>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl FileConfig {
    fn load_from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading config file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    fn warn_unknown_fields(&self) {
        if let serde_json::Value::Object(map) = &self.extra {
            if !map.is_empty() {
                let keys: Vec<&str> = map.keys().map(String::as_str).collect();
                tracing::warn!(
                    fields = keys.join(", "),
                    "unknown fields in config file (possible typos)"
                );
            }
        }
    }
}

// =============================================================================
// Runtime Config Structs (final merged configuration)
// =============================================================================

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Ingestion configuration
#[derive(Debug, Clone)]
pub struct InsertConfig {
    pub max_request_size: u64,
}

/// Final merged application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub insert: InsertConfig,
    pub search: SearchConfig,
    pub storage: StorageBackend,
}

impl AppConfig {
    /// Load configuration from all sources.
    ///
    /// Priority (lowest to highest):
    /// 1. Defaults
    /// 2. Config file (CLI-specified path, or `tracelake.json` in the
    ///    working directory)
    /// 3. CLI arguments (which include env var fallbacks via clap)
    pub fn load(cli: &CliConfig) -> Result<Self> {
        let file_config = match Self::config_file_path(cli)? {
            Some(path) => {
                let config = FileConfig::load_from_file(&path)?;
                config.warn_unknown_fields();
                config
            }
            None => FileConfig::default(),
        };

        let file_server = file_config.server.unwrap_or_default();
        let file_insert = file_config.insert.unwrap_or_default();
        let file_search = file_config.search.unwrap_or_default();

        let host = cli
            .host
            .clone()
            .or(file_server.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = cli.port.or(file_server.port).unwrap_or(DEFAULT_PORT);

        let max_request_size = match cli.max_request_size {
            Some(size) => size,
            None => match file_insert.max_request_size {
                Some(ref s) => parse_byte_size(s)
                    .with_context(|| format!("insert.max_request_size = {s:?}"))?,
                None => DEFAULT_MAX_REQUEST_SIZE,
            },
        };

        let search = SearchConfig {
            max_duration_window: resolve_duration(
                cli.search_max_duration_window,
                file_search.max_duration_window.as_deref(),
                "search.max_duration_window",
                Duration::from_secs(DEFAULT_SEARCH_MAX_DURATION_WINDOW_SECS),
            )?,
            service_and_span_name_lookbehind: resolve_duration(
                cli.search_name_lookbehind,
                file_search.service_and_span_name_lookbehind.as_deref(),
                "search.service_and_span_name_lookbehind",
                Duration::from_secs(DEFAULT_SEARCH_NAME_LOOKBEHIND_SECS),
            )?,
            search_step: resolve_duration(
                cli.search_step,
                file_search.step.as_deref(),
                "search.step",
                Duration::from_secs(DEFAULT_SEARCH_STEP_SECS),
            )?,
            max_service_name_list: cli
                .search_max_service_names
                .or(file_search.max_service_name_list)
                .unwrap_or(DEFAULT_SEARCH_MAX_SERVICE_NAMES),
            max_span_name_list: cli
                .search_max_span_names
                .or(file_search.max_span_name_list)
                .unwrap_or(DEFAULT_SEARCH_MAX_SPAN_NAMES),
        };

        let storage = cli.storage.or(file_config.storage).unwrap_or_default();

        let config = Self {
            server: ServerConfig { host, port },
            insert: InsertConfig { max_request_size },
            search,
            storage,
        };
        config.validate()?;

        tracing::debug!(
            host = %config.server.host,
            port = config.server.port,
            storage = %config.storage,
            max_request_size = config.insert.max_request_size,
            search_step = ?config.search.search_step,
            "configuration loaded"
        );
        Ok(config)
    }

    fn config_file_path(cli: &CliConfig) -> Result<Option<PathBuf>> {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                anyhow::bail!("config file not found: {}", path.display());
            }
            return Ok(Some(path.clone()));
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        Ok(local.exists().then_some(local))
    }

    fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("configuration error: server.host must not be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("configuration error: server.port must be greater than 0");
        }
        if self.insert.max_request_size == 0 {
            anyhow::bail!("configuration error: insert.max_request_size must be greater than 0");
        }
        if self.search.search_step.is_zero() {
            anyhow::bail!("configuration error: search.step must be greater than 0");
        }
        if self.search.max_duration_window.is_zero() {
            anyhow::bail!(
                "configuration error: search.max_duration_window must be greater than 0"
            );
        }
        Ok(())
    }
}

fn parse_byte_size(s: &str) -> Result<u64> {
    s.parse::<bytesize::ByteSize>()
        .map(|b| b.as_u64())
        .map_err(|e| anyhow::anyhow!("invalid byte size {s:?}: {e}"))
}

fn resolve_duration(
    cli_value: Option<Duration>,
    file_value: Option<&str>,
    option_name: &str,
    default: Duration,
) -> Result<Duration> {
    if let Some(d) = cli_value {
        return Ok(d);
    }
    match file_value {
        Some(s) => humantime::parse_duration(s)
            .with_context(|| format!("invalid duration for {option_name}: {s:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::load(&CliConfig::default()).unwrap();
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.insert.max_request_size, 64 * 1024 * 1024);
        assert_eq!(config.search.max_duration_window, Duration::from_secs(45));
        assert_eq!(
            config.search.service_and_span_name_lookbehind,
            Duration::from_secs(72 * 3600)
        );
        assert_eq!(config.search.search_step, Duration::from_secs(24 * 3600));
        assert_eq!(config.search.max_service_name_list, 1000);
        assert_eq!(config.storage, StorageBackend::Memory);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = CliConfig {
            port: Some(9999),
            search_step: Some(Duration::from_secs(3600)),
            max_request_size: Some(1024),
            ..Default::default()
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.search.search_step, Duration::from_secs(3600));
        assert_eq!(config.insert.max_request_size, 1024);
    }

    #[test]
    fn test_validation_rejects_zero_port() {
        let cli = CliConfig {
            port: Some(0),
            ..Default::default()
        };
        assert!(AppConfig::load(&cli).is_err());
    }

    #[test]
    fn test_file_config_parsing() {
        let json = r#"{
            "server": {"port": 4318},
            "insert": {"max_request_size": "1MiB"},
            "search": {"step": "6h", "max_service_name_list": 50}
        }"#;
        let file: FileConfig = serde_json::from_str(json).unwrap();
        assert_eq!(file.server.unwrap().port, Some(4318));
        assert_eq!(
            file.insert.unwrap().max_request_size.as_deref(),
            Some("1MiB")
        );
        let search = file.search.unwrap();
        assert_eq!(search.step.as_deref(), Some("6h"));
        assert_eq!(search.max_service_name_list, Some(50));
    }

    #[test]
    fn test_parse_byte_size_strings() {
        assert_eq!(parse_byte_size("64MiB").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_byte_size("100").unwrap(), 100);
        assert!(parse_byte_size("many bytes").is_err());
    }
}
