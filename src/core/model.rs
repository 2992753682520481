// logsieve - core/model.rs
//
// Core data model types. Pure data definitions with no I/O and no
// threading. These are the shared vocabulary across all layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

// =============================================================================
// Record (immutable raw log entry)
// =============================================================================

/// A single raw log entry as handed over by an external reader.
///
/// Records are immutable once created. The pipeline only ever holds them
/// behind an `Arc` inside an [`Entity`](crate::core::entity::Entity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Timestamp in UTC. `None` when the source had no parseable timestamp.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    /// Normalised level.
    #[serde(default)]
    pub level: Level,

    /// Message text, including any continuation lines.
    pub message: String,

    /// Process ID, when the format carries one.
    #[serde(default)]
    pub process_id: Option<u32>,

    /// Thread ID, when the format carries one.
    #[serde(default)]
    pub thread_id: Option<u32>,

    /// Arbitrary additional key/value fields.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Record {
    /// Create a record with just a level and a message.
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            level,
            message: message.into(),
            process_id: None,
            thread_id: None,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style timestamp setter.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Builder-style process/thread setter.
    pub fn with_ids(mut self, process_id: Option<u32>, thread_id: Option<u32>) -> Self {
        self.process_id = process_id;
        self.thread_id = thread_id;
        self
    }

    /// Estimated heap + inline footprint in bytes.
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.message.len()
            + self
                .fields
                .iter()
                .map(|(k, v)| k.len() + v.len() + 3 * std::mem::size_of::<usize>())
                .sum::<usize>()
    }
}

// =============================================================================
// Level
// =============================================================================

/// Normalised log levels, ordered from most to least severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
    Verbose,
    #[default]
    Undefined,
}

impl Level {
    /// Returns all variants in display order (most severe first).
    pub fn all() -> &'static [Level] {
        &[
            Level::Fatal,
            Level::Error,
            Level::Warning,
            Level::Info,
            Level::Debug,
            Level::Verbose,
            Level::Undefined,
        ]
    }

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Level::Fatal => "Fatal",
            Level::Error => "Error",
            Level::Warning => "Warning",
            Level::Info => "Info",
            Level::Debug => "Debug",
            Level::Verbose => "Verbose",
            Level::Undefined => "Undefined",
        }
    }

    /// Short label for compact output.
    pub fn short_label(&self) -> &'static str {
        match self {
            Level::Fatal => "FATL",
            Level::Error => "ERR",
            Level::Warning => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DBG",
            Level::Verbose => "VERB",
            Level::Undefined => "???",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fatal" | "critical" | "crit" => Ok(Level::Fatal),
            "error" | "err" => Ok(Level::Error),
            "warning" | "warn" => Ok(Level::Warning),
            "info" | "information" => Ok(Level::Info),
            "debug" | "dbg" => Ok(Level::Debug),
            "verbose" | "trace" => Ok(Level::Verbose),
            "undefined" | "unknown" => Ok(Level::Undefined),
            other => Err(format!("unrecognised level '{other}'")),
        }
    }
}

// =============================================================================
// Combination mode
// =============================================================================

/// How several result sets (or conditions) are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CombinationMode {
    /// Keep only what every participant accepts.
    #[default]
    Intersection,
    /// Keep what at least one participant accepts.
    Union,
}

impl FromStr for CombinationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "intersection" | "and" | "all" => Ok(CombinationMode::Intersection),
            "union" | "or" | "any" => Ok(CombinationMode::Union),
            other => Err(format!("unrecognised combination mode '{other}'")),
        }
    }
}

impl std::fmt::Display for CombinationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CombinationMode::Intersection => "intersection",
            CombinationMode::Union => "union",
        })
    }
}
