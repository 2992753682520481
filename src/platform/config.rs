// logsieve - platform/config.rs
//
// Platform-specific configuration directory resolution and config.toml
// loading with startup validation.
//
// Uses the `directories` crate for XDG (Linux), AppData (Windows),
// Library (macOS) compliance.

use crate::core::policy::MemoryUsagePolicy;
use crate::core::processor::ProcessingPriority;
use crate::util::constants;
use crate::util::error::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolved platform paths for logsieve configuration and data.
#[derive(Debug, Clone)]
pub struct PlatformPaths {
    /// Configuration directory (e.g. ~/.config/logsieve/ or %APPDATA%\logsieve\config\)
    pub config_dir: PathBuf,

    /// Data directory for log files.
    pub data_dir: PathBuf,
}

impl PlatformPaths {
    /// Resolve platform-appropriate paths.
    ///
    /// Falls back to current directory if platform dirs cannot be determined.
    pub fn resolve() -> Self {
        if let Some(proj_dirs) = ProjectDirs::from("", "", constants::APP_ID) {
            let config_dir = proj_dirs.config_dir().to_path_buf();
            let data_dir = proj_dirs.data_dir().to_path_buf();

            tracing::debug!(
                config = %config_dir.display(),
                data = %data_dir.display(),
                "Platform paths resolved"
            );

            Self {
                config_dir,
                data_dir,
            }
        } else {
            tracing::warn!("Could not determine platform directories, using current directory");
            let fallback = PathBuf::from(".");
            Self {
                config_dir: fallback.clone(),
                data_dir: fallback,
            }
        }
    }

    /// Full path of the default config file.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(constants::CONFIG_FILE_NAME)
    }
}

// =============================================================================
// config.toml loading and validation
// =============================================================================

/// Raw deserialisable shape of config.toml.
///
/// Unknown keys are silently ignored for forward compatibility.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct RawConfig {
    /// `[processing]` section.
    pub processing: ProcessingSection,
    /// `[memory]` section.
    pub memory: MemorySection,
    /// `[logging]` section.
    pub logging: LoggingSection,
}

/// `[processing]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct ProcessingSection {
    /// Chunk size for realtime-priority filters.
    pub realtime_chunk_size: Option<usize>,
    /// Chunk size for default-priority filters.
    pub default_chunk_size: Option<usize>,
    /// Chunk size for background-priority filters.
    pub background_chunk_size: Option<usize>,
    /// Capacity of the filter-to-combiner queue.
    pub queue_capacity: Option<usize>,
}

/// `[memory]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// "unlimited", "fixed" or "adaptive".
    pub policy: Option<String>,
    /// Quota for the fixed policy, in MiB.
    pub quota_mb: Option<u64>,
    /// Share of available memory for the adaptive policy.
    pub adaptive_percent: Option<u8>,
    /// Longest pause before a pass proceeds over quota, in ms.
    pub max_pause_ms: Option<u64>,
}

/// `[logging]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub level: Option<String>,
    /// Log file path (empty = stderr only).
    pub file: Option<String>,
}

/// Validated application configuration derived from `config.toml`.
///
/// Invalid values produce actionable warnings and fall back to defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // -- Processing --
    pub realtime_chunk_size: usize,
    pub default_chunk_size: usize,
    pub background_chunk_size: usize,
    pub queue_capacity: usize,

    // -- Memory --
    pub memory_policy: MemoryUsagePolicy,
    pub max_pause: Duration,

    // -- Logging --
    /// Logging level string (for init before tracing is available).
    pub log_level: Option<String>,
    /// Log file path.
    pub log_file: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            realtime_chunk_size: constants::DEFAULT_REALTIME_CHUNK_SIZE,
            default_chunk_size: constants::DEFAULT_CHUNK_SIZE,
            background_chunk_size: constants::DEFAULT_BACKGROUND_CHUNK_SIZE,
            queue_capacity: constants::DEFAULT_QUEUE_CAPACITY,
            memory_policy: MemoryUsagePolicy::Unlimited,
            max_pause: Duration::from_millis(constants::DEFAULT_MAX_PAUSE_MS),
            log_level: None,
            log_file: None,
        }
    }
}

impl AppConfig {
    /// Configured chunk size for a priority.
    pub fn chunk_size(&self, priority: ProcessingPriority) -> usize {
        match priority {
            ProcessingPriority::Realtime => self.realtime_chunk_size,
            ProcessingPriority::Default => self.default_chunk_size,
            ProcessingPriority::Background => self.background_chunk_size,
        }
    }
}

/// Load and validate `config.toml` from the given config directory.
///
/// Returns `AppConfig` with validated values and a list of non-fatal warnings.
/// If the file does not exist, returns defaults with no warnings (first-run).
/// If the file is unreadable or unparseable, returns defaults with a warning
/// so the pipeline still starts but the user is informed.
pub fn load_config(config_dir: &Path) -> (AppConfig, Vec<String>) {
    let config_path = config_dir.join(constants::CONFIG_FILE_NAME);

    if !config_path.exists() {
        tracing::debug!(path = %config_path.display(), "No config.toml found; using defaults");
        return (AppConfig::default(), Vec::new());
    }

    match load_config_file(&config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            let msg = format!("{e}. Using defaults.");
            tracing::warn!("{}", msg);
            (AppConfig::default(), vec![msg])
        }
    }
}

/// Load and validate an explicitly named config file.
///
/// Unlike [`load_config`], a missing or unparseable file is an error.
pub fn load_config_file(path: &Path) -> Result<(AppConfig, Vec<String>), ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let raw: RawConfig = toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
        path: path.to_path_buf(),
        source: e,
    })?;
    tracing::info!(path = %path.display(), "Loaded config.toml");
    Ok(validate(raw))
}

fn out_of_range(field: &str, value: impl ToString, expected: String, fallback: impl std::fmt::Display) -> String {
    format!(
        "{}. Using default ({fallback}).",
        ConfigError::ValueOutOfRange {
            field: field.to_string(),
            value: value.to_string(),
            expected,
        }
    )
}

fn validate_chunk(field: &str, value: Option<usize>, slot: &mut usize, warnings: &mut Vec<String>) {
    if let Some(size) = value {
        if (constants::MIN_CHUNK_SIZE..=constants::MAX_CHUNK_SIZE).contains(&size) {
            *slot = size;
        } else {
            warnings.push(out_of_range(
                field,
                size,
                format!("{}-{}", constants::MIN_CHUNK_SIZE, constants::MAX_CHUNK_SIZE),
                *slot,
            ));
        }
    }
}

/// Validate each raw field against named constants, accumulating all
/// problems instead of stopping at the first.
pub fn validate(raw: RawConfig) -> (AppConfig, Vec<String>) {
    let mut warnings: Vec<String> = Vec::new();
    let mut config = AppConfig::default();

    // -- Processing --
    validate_chunk(
        "[processing] realtime_chunk_size",
        raw.processing.realtime_chunk_size,
        &mut config.realtime_chunk_size,
        &mut warnings,
    );
    validate_chunk(
        "[processing] default_chunk_size",
        raw.processing.default_chunk_size,
        &mut config.default_chunk_size,
        &mut warnings,
    );
    validate_chunk(
        "[processing] background_chunk_size",
        raw.processing.background_chunk_size,
        &mut config.background_chunk_size,
        &mut warnings,
    );

    if let Some(capacity) = raw.processing.queue_capacity {
        if (constants::MIN_QUEUE_CAPACITY..=constants::MAX_QUEUE_CAPACITY).contains(&capacity) {
            config.queue_capacity = capacity;
        } else {
            warnings.push(out_of_range(
                "[processing] queue_capacity",
                capacity,
                format!(
                    "{}-{}",
                    constants::MIN_QUEUE_CAPACITY,
                    constants::MAX_QUEUE_CAPACITY
                ),
                constants::DEFAULT_QUEUE_CAPACITY,
            ));
        }
    }

    // -- Memory: quota and percent are validated even when another policy
    // is selected, so a later policy switch does not surface stale errors.
    let mut quota_mb = constants::DEFAULT_QUOTA_MB;
    if let Some(mb) = raw.memory.quota_mb {
        if (constants::MIN_QUOTA_MB..=constants::MAX_QUOTA_MB).contains(&mb) {
            quota_mb = mb;
        } else {
            warnings.push(out_of_range(
                "[memory] quota_mb",
                mb,
                format!("{}-{}", constants::MIN_QUOTA_MB, constants::MAX_QUOTA_MB),
                constants::DEFAULT_QUOTA_MB,
            ));
        }
    }

    let mut percent = constants::DEFAULT_ADAPTIVE_PERCENT;
    if let Some(p) = raw.memory.adaptive_percent {
        if (constants::MIN_ADAPTIVE_PERCENT..=constants::MAX_ADAPTIVE_PERCENT).contains(&p) {
            percent = p;
        } else {
            warnings.push(out_of_range(
                "[memory] adaptive_percent",
                p,
                format!(
                    "{}-{}",
                    constants::MIN_ADAPTIVE_PERCENT,
                    constants::MAX_ADAPTIVE_PERCENT
                ),
                constants::DEFAULT_ADAPTIVE_PERCENT,
            ));
        }
    }

    if let Some(ref policy) = raw.memory.policy {
        match policy.to_lowercase().as_str() {
            "unlimited" => config.memory_policy = MemoryUsagePolicy::Unlimited,
            "fixed" => {
                config.memory_policy = MemoryUsagePolicy::Fixed {
                    quota_bytes: quota_mb * 1_024 * 1_024,
                }
            }
            "adaptive" => config.memory_policy = MemoryUsagePolicy::Adaptive { percent },
            other => warnings.push(format!(
                "[memory] policy = \"{other}\" is not recognised. \
                 Valid values: unlimited, fixed, adaptive. Using default (unlimited).",
            )),
        }
    }

    if let Some(ms) = raw.memory.max_pause_ms {
        if ms <= constants::MAX_PAUSE_MS {
            config.max_pause = Duration::from_millis(ms);
        } else {
            warnings.push(out_of_range(
                "[memory] max_pause_ms",
                ms,
                format!("0-{}", constants::MAX_PAUSE_MS),
                constants::DEFAULT_MAX_PAUSE_MS,
            ));
        }
    }

    // -- Logging: level --
    if let Some(ref level) = raw.logging.level {
        let valid = ["error", "warn", "info", "debug", "trace"];
        if valid.contains(&level.to_lowercase().as_str()) {
            config.log_level = Some(level.clone());
        } else {
            warnings.push(format!(
                "[logging] level = \"{level}\" is not recognised. \
                 Valid values: error, warn, info, debug, trace. Using default (info).",
            ));
        }
    }

    // -- Logging: file --
    if let Some(ref file) = raw.logging.file {
        if !file.is_empty() {
            config.log_file = Some(file.clone());
        }
    }

    if !warnings.is_empty() {
        tracing::warn!(
            count = warnings.len(),
            "Config validation produced warnings"
        );
    }

    (config, warnings)
}
