// logsieve - util/constants.rs
//
// Single source of truth for all named constants, limits, and defaults.
// Every configurable value has a default plus an allowed range so that
// config loading can validate against the same numbers the code uses.

// =============================================================================
// Application metadata
// =============================================================================

/// Application display name.
pub const APP_NAME: &str = "logsieve";

/// Application identifier used for config/data directories.
pub const APP_ID: &str = "logsieve";

/// Current application version.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Processing chunk sizes
// =============================================================================

/// Entities evaluated per chunk by a realtime-priority processor.
/// Small chunks keep the first results flowing to the view quickly.
pub const DEFAULT_REALTIME_CHUNK_SIZE: usize = 256;

/// Entities evaluated per chunk by a default-priority processor.
pub const DEFAULT_CHUNK_SIZE: usize = 1_024;

/// Entities evaluated per chunk by a background-priority processor.
pub const DEFAULT_BACKGROUND_CHUNK_SIZE: usize = 4_096;

/// Minimum user-configurable chunk size.
pub const MIN_CHUNK_SIZE: usize = 1;

/// Maximum user-configurable chunk size.
pub const MAX_CHUNK_SIZE: usize = 65_536;

// =============================================================================
// Combiner queue
// =============================================================================

/// Capacity of the bounded queue between filters and the combiner.
///
/// When the queue is full, filter workers block instead of dropping deltas.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Minimum user-configurable queue capacity.
pub const MIN_QUEUE_CAPACITY: usize = 1;

/// Maximum user-configurable queue capacity.
pub const MAX_QUEUE_CAPACITY: usize = 16_384;

// =============================================================================
// Memory usage policy
// =============================================================================

/// Default quota for the fixed policy (MiB).
pub const DEFAULT_QUOTA_MB: u64 = 512;

/// Minimum user-configurable fixed quota (MiB).
pub const MIN_QUOTA_MB: u64 = 1;

/// Maximum user-configurable fixed quota (MiB).
pub const MAX_QUOTA_MB: u64 = 1_048_576; // 1 TiB

/// Default share of available system memory granted by the adaptive policy.
pub const DEFAULT_ADAPTIVE_PERCENT: u8 = 25;

/// Minimum adaptive share (percent).
pub const MIN_ADAPTIVE_PERCENT: u8 = 1;

/// Maximum adaptive share (percent).
pub const MAX_ADAPTIVE_PERCENT: u8 = 90;

/// Floor of the adaptive quota so a momentarily starved host does not
/// disable every cache.
pub const MIN_ADAPTIVE_QUOTA_BYTES: u64 = 64 * 1_024 * 1_024; // 64 MiB

/// Quota used by the adaptive policy when system memory cannot be read.
pub const DEFAULT_ADAPTIVE_FALLBACK_BYTES: u64 = 512 * 1_024 * 1_024; // 512 MiB

/// How long a system memory reading stays valid (ms).
pub const MEMORY_SAMPLE_REFRESH_MS: u64 = 1_000;

/// Longest a new pass waits for usage to fall back under quota (ms).
pub const DEFAULT_MAX_PAUSE_MS: u64 = 2_000;

/// Maximum user-configurable pause (ms).
pub const MAX_PAUSE_MS: u64 = 60_000;

/// How often a paused worker re-checks usage and its cancel state (ms).
pub const PAUSE_CHECK_INTERVAL_MS: u64 = 50;

// =============================================================================
// Size estimation
// =============================================================================

/// Fixed per-entity overhead added to its payload bytes (Arc header,
/// flags, cache slot, map slot in the group).
pub const ENTITY_BASE_SIZE: usize = 128;

/// Estimated cost of one retained source index in a filter's match set.
pub const MATCH_SET_SLOT_SIZE: usize = 40;

// =============================================================================
// Diagnostics
// =============================================================================

/// Per-item skips logged at warn level in a single pass before the
/// remainder are demoted to debug.
pub const MAX_ITEM_WARNINGS_LOGGED: usize = 100;

/// Separator placed between text properties when several are searched.
pub const TEXT_PROPERTY_SEPARATOR: &str = "$$";

// =============================================================================
// Ingestion (binary only)
// =============================================================================

/// Number of records wrapped before they are appended as one source batch.
pub const INGEST_BATCH_SIZE: usize = 500;

/// Longest the binary waits for the pipeline to settle (seconds).
pub const SETTLE_TIMEOUT_SECS: u64 = 300;

// =============================================================================
// Logging
// =============================================================================

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Maximum length of a message preview included in debug output.
pub const DEBUG_MAX_LINE_PREVIEW: usize = 200;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration file name.
pub const CONFIG_FILE_NAME: &str = "config.toml";
