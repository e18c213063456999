// Centralized constants for the anvil build tool to avoid magic numbers

/// Directory (under the project root) holding content/binary outputs
pub const OUT_DIR_NAME: &str = "build-out";

/// Directory (under the project root) holding generated code
pub const GEN_DIR_NAME: &str = "build-gen";

/// Directory (under the project root) holding the rule cache index
pub const CACHE_DIR_NAME: &str = ".build-cache";

/// File name of the cache index inside the cache directory
pub const CACHE_INDEX_FILE: &str = "index.json";

/// Implicit module file name inside a module directory
pub const MODULE_FILE_NAME: &str = "BUILD";

/// Default port for the build report server
pub const DEFAULT_REPORT_PORT: u16 = 8080;

/// Default maximum number of attempts when posting a report delta
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default initial backoff for report requests in milliseconds
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Default maximum backoff limit in milliseconds
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 5000;

/// Timeout applied to every report HTTP request in seconds
pub const REPORT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Number of reports returned by the index endpoint
pub const REPORT_INDEX_LIMIT: usize = 50;

/// Pending wake-ups buffered between log sinks and the report delivery task
pub const REMOTE_SINK_CHANNEL_SIZE: usize = 64;
