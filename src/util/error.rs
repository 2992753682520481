// logsieve - util/error.rs
//
// Typed error hierarchy with context-preserving error chains.
// Errors are grouped by the layer that raises them; every leaf enum
// converts into `LogSieveError` so callers at the session boundary can
// use a single `Result` type.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Top-level error type for all logsieve operations.
#[derive(Debug)]
pub enum LogSieveError {
    /// Record group operation failed.
    Group(GroupError),

    /// An entity reference could not be used.
    Entity(EntityError),

    /// Processor lifecycle operation failed.
    Processor(ProcessorError),

    /// Filter construction failed.
    Filter(FilterError),

    /// Configuration loading or validation failed.
    Config(ConfigError),

    /// I/O error with path context.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: io::Error,
    },
}

impl fmt::Display for LogSieveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group(e) => write!(f, "Group error: {e}"),
            Self::Entity(e) => write!(f, "Entity error: {e}"),
            Self::Processor(e) => write!(f, "Processor error: {e}"),
            Self::Filter(e) => write!(f, "Filter error: {e}"),
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::Io {
                path,
                operation,
                source,
            } => write!(
                f,
                "I/O error during {operation} on '{}': {source}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for LogSieveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Group(e) => Some(e),
            Self::Entity(e) => Some(e),
            Self::Processor(e) => Some(e),
            Self::Filter(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Io { source, .. } => Some(source),
        }
    }
}

// ---------------------------------------------------------------------------
// Group errors
// ---------------------------------------------------------------------------

/// Errors raised while wrapping records into a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// The group was closed when its session ended.
    Closed { group: u64 },

    /// Reserving room for another entity failed.
    AllocationFailed { group: u64, requested: usize },
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed { group } => write!(f, "Record group {group} is closed"),
            Self::AllocationFailed { group, requested } => write!(
                f,
                "Record group {group}: allocation of {requested} entity slot(s) failed"
            ),
        }
    }
}

impl std::error::Error for GroupError {}

impl From<GroupError> for LogSieveError {
    fn from(e: GroupError) -> Self {
        Self::Group(e)
    }
}

// ---------------------------------------------------------------------------
// Entity errors
// ---------------------------------------------------------------------------

/// Errors raised when an entity handle is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    /// The entity was released, or its group was closed or dropped.
    Stale { entity: u64, group: u64 },
}

impl fmt::Display for EntityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stale { entity, group } => write!(
                f,
                "Stale reference to entity {entity} of record group {group}"
            ),
        }
    }
}

impl std::error::Error for EntityError {}

impl From<EntityError> for LogSieveError {
    fn from(e: EntityError) -> Self {
        Self::Entity(e)
    }
}

// ---------------------------------------------------------------------------
// Per-item match errors
// ---------------------------------------------------------------------------

/// Recoverable failure evaluating a predicate against one entity.
///
/// Never fatal: the entity is skipped and the pass continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// The entity became stale while the pass was running.
    Stale(EntityError),

    /// The entity cannot be compared by this predicate.
    Uncomparable { entity: u64, reason: String },
}

impl fmt::Display for MatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stale(e) => write!(f, "{e}"),
            Self::Uncomparable { entity, reason } => {
                write!(f, "Entity {entity} cannot be compared: {reason}")
            }
        }
    }
}

impl std::error::Error for MatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Stale(e) => Some(e),
            Self::Uncomparable { .. } => None,
        }
    }
}

impl From<EntityError> for MatchError {
    fn from(e: EntityError) -> Self {
        Self::Stale(e)
    }
}

// ---------------------------------------------------------------------------
// Processor errors
// ---------------------------------------------------------------------------

/// Errors related to processor lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// `process()` was called before a source was attached.
    NotAttached { processor: u64 },

    /// The processor is already bound to another source.
    AlreadyAttached {
        processor: u64,
        current: u64,
        requested: u64,
    },

    /// The processor hit an internal fault and cannot resume.
    Faulted { processor: u64, reason: String },

    /// A state transition outside the lifecycle graph was requested.
    InvalidTransition {
        processor: u64,
        from: &'static str,
        to: &'static str,
    },
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAttached { processor } => {
                write!(f, "Processor {processor} has no source attached")
            }
            Self::AlreadyAttached {
                processor,
                current,
                requested,
            } => write!(
                f,
                "Processor {processor} is attached to source {current}, cannot attach to {requested}"
            ),
            Self::Faulted { processor, reason } => {
                write!(f, "Processor {processor} faulted: {reason}")
            }
            Self::InvalidTransition {
                processor,
                from,
                to,
            } => write!(f, "Processor {processor}: invalid transition {from} -> {to}"),
        }
    }
}

impl std::error::Error for ProcessorError {}

impl From<ProcessorError> for LogSieveError {
    fn from(e: ProcessorError) -> Self {
        Self::Processor(e)
    }
}

// ---------------------------------------------------------------------------
// Filter errors
// ---------------------------------------------------------------------------

/// Errors related to building filter criteria.
#[derive(Debug)]
pub enum FilterError {
    /// User-provided regex is invalid.
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRegex { pattern, source } => {
                write!(f, "Invalid filter regex '{pattern}': {source}")
            }
        }
    }
}

impl std::error::Error for FilterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidRegex { source, .. } => Some(source),
        }
    }
}

impl From<FilterError> for LogSieveError {
    fn from(e: FilterError) -> Self {
        Self::Filter(e)
    }
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

/// Errors related to configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// TOML parsing failed.
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A config value is out of the allowed range.
    ValueOutOfRange {
        field: String,
        value: String,
        expected: String,
    },

    /// I/O error reading config file.
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TomlParse { path, source } => {
                write!(f, "Config parse error '{}': {source}", path.display())
            }
            Self::ValueOutOfRange {
                field,
                value,
                expected,
            } => write!(
                f,
                "Config '{field}' = '{value}' is out of range. Expected: {expected}"
            ),
            Self::Io { path, source } => {
                write!(f, "Config I/O error '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TomlParse { source, .. } => Some(source),
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ConfigError> for LogSieveError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

/// Convenience type alias for logsieve results.
pub type Result<T> = std::result::Result<T, LogSieveError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_stale_entity_converts_and_keeps_source() {
        let stale = EntityError::Stale {
            entity: 7,
            group: 2,
        };
        let top: LogSieveError = stale.clone().into();
        assert!(top.to_string().contains("entity 7"));
        assert!(top.source().is_some());

        let item: MatchError = stale.into();
        assert!(matches!(item, MatchError::Stale(_)));
    }

    #[test]
    fn test_processor_error_display() {
        let e = ProcessorError::AlreadyAttached {
            processor: 1,
            current: 3,
            requested: 4,
        };
        assert_eq!(
            e.to_string(),
            "Processor 1 is attached to source 3, cannot attach to 4"
        );
    }
}
