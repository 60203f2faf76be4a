// =============================================================================
// Application Identity
// =============================================================================

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "tracelake";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "tracelake.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "TRACELAKE_CONFIG";

// =============================================================================
// Environment Variables - Server
// =============================================================================

/// Environment variable for server host
pub const ENV_HOST: &str = "TRACELAKE_HOST";

/// Environment variable for server port
pub const ENV_PORT: &str = "TRACELAKE_PORT";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "TRACELAKE_LOG";

/// Environment variable for the storage backend
pub const ENV_STORAGE_BACKEND: &str = "TRACELAKE_STORAGE_BACKEND";

// =============================================================================
// Environment Variables - Ingestion
// =============================================================================

/// Environment variable for the maximum trace export request size
pub const ENV_MAX_REQUEST_SIZE: &str = "TRACELAKE_MAX_REQUEST_SIZE";

// =============================================================================
// Environment Variables - Search
// =============================================================================

pub const ENV_SEARCH_MAX_DURATION_WINDOW: &str = "TRACELAKE_SEARCH_MAX_DURATION_WINDOW";
pub const ENV_SEARCH_NAME_LOOKBEHIND: &str = "TRACELAKE_SEARCH_NAME_LOOKBEHIND";
pub const ENV_SEARCH_STEP: &str = "TRACELAKE_SEARCH_STEP";
pub const ENV_SEARCH_MAX_SERVICE_NAMES: &str = "TRACELAKE_SEARCH_MAX_SERVICE_NAMES";
pub const ENV_SEARCH_MAX_SPAN_NAMES: &str = "TRACELAKE_SEARCH_MAX_SPAN_NAMES";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default server port
pub const DEFAULT_PORT: u16 = 10428;

// =============================================================================
// Ingestion Defaults
// =============================================================================

/// Default upper bound on a single trace export request body (64 MiB)
pub const DEFAULT_MAX_REQUEST_SIZE: u64 = 64 * 1024 * 1024;

// =============================================================================
// Search Defaults
// =============================================================================

/// Default padding around discovered span times (see SearchConfig)
pub const DEFAULT_SEARCH_MAX_DURATION_WINDOW_SECS: u64 = 45;

/// Default lookbehind of the service/operation catalogs (3 days)
pub const DEFAULT_SEARCH_NAME_LOOKBEHIND_SECS: u64 = 3 * 24 * 3600;

/// Default step of receding trace-by-id scans (24 hours)
pub const DEFAULT_SEARCH_STEP_SECS: u64 = 24 * 3600;

/// Default cap on the service catalog cardinality
pub const DEFAULT_SEARCH_MAX_SERVICE_NAMES: u64 = 1000;

/// Default cap on the operations catalog cardinality
pub const DEFAULT_SEARCH_MAX_SPAN_NAMES: u64 = 1000;
