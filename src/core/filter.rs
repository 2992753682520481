// logsieve - core/filter.rs
//
// Filter criteria and the per-entity predicate.
// Core layer: pure logic, no threading or I/O.
//
// Evaluation order for one entity:
//   1. marked entities match outright when `include_marked` is set,
//   2. the text condition (inclusive patterns OR substring search, vetoed
//      by any exclusive pattern),
//   3. the remaining conditions (level, process, thread, time, custom),
//      combined with the text condition per the effective combination mode.

use crate::core::entity::Entity;
use crate::core::model::{CombinationMode, Level, Record};
use crate::core::policy::CacheRetention;
use crate::core::processor::Processor;
use crate::core::view::FilteredView;
use crate::util::constants::TEXT_PROPERTY_SEPARATOR;
use crate::util::error::{FilterError, MatchError, ProcessorError};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

/// Entity property that contributes to the searchable text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TextProperty {
    Message,
    /// A named field, looked up case-insensitively.
    Field(String),
}

/// User-supplied predicate evaluated after the built-in conditions.
pub type CustomPredicate = Arc<dyn Fn(&Entity) -> Result<bool, MatchError> + Send + Sync>;

/// Complete predicate of one filter.
#[derive(Clone, Default)]
pub struct FilterCriteria {
    /// Levels to include (empty = all).
    pub levels: HashSet<Level>,

    /// Exact process ID. Entities without one do not match.
    pub process_id: Option<u32>,

    /// Exact thread ID. Entities without one do not match.
    pub thread_id: Option<u32>,

    /// Start of time range (inclusive). None = no lower bound.
    pub time_start: Option<DateTime<Utc>>,

    /// End of time range (inclusive). None = no upper bound.
    pub time_end: Option<DateTime<Utc>>,

    /// Substring text search (case-insensitive). Empty = no search.
    pub text_search: String,

    /// Properties forming the searchable text (empty = message only).
    pub text_properties: Vec<TextProperty>,

    /// Marked entities always match.
    pub include_marked: bool,

    /// How the text condition combines with the rest. None = auto.
    pub text_combination: Option<CombinationMode>,

    inclusive_patterns: Vec<Regex>,
    exclusive_patterns: Vec<Regex>,
    custom: Option<CustomPredicate>,
}

fn compile(pattern: &str) -> Result<Regex, FilterError> {
    Regex::new(pattern).map_err(|e| FilterError::InvalidRegex {
        pattern: pattern.to_string(),
        source: e,
    })
}

impl FilterCriteria {
    /// Criteria that match every entity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pattern; any inclusive match satisfies the text condition.
    pub fn add_inclusive_pattern(&mut self, pattern: &str) -> Result<(), FilterError> {
        self.inclusive_patterns.push(compile(pattern)?);
        Ok(())
    }

    /// Add a pattern; any exclusive match rejects the entity.
    pub fn add_exclusive_pattern(&mut self, pattern: &str) -> Result<(), FilterError> {
        self.exclusive_patterns.push(compile(pattern)?);
        Ok(())
    }

    /// Replace the inclusive patterns. Nothing changes if one is invalid.
    pub fn set_inclusive_patterns<S: AsRef<str>>(
        &mut self,
        patterns: &[S],
    ) -> Result<(), FilterError> {
        self.inclusive_patterns = patterns
            .iter()
            .map(|p| compile(p.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    /// Replace the exclusive patterns. Nothing changes if one is invalid.
    pub fn set_exclusive_patterns<S: AsRef<str>>(
        &mut self,
        patterns: &[S],
    ) -> Result<(), FilterError> {
        self.exclusive_patterns = patterns
            .iter()
            .map(|p| compile(p.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    pub fn inclusive_patterns(&self) -> &[Regex] {
        &self.inclusive_patterns
    }

    pub fn exclusive_patterns(&self) -> &[Regex] {
        &self.exclusive_patterns
    }

    /// Install a custom predicate.
    pub fn set_custom<F>(&mut self, predicate: F)
    where
        F: Fn(&Entity) -> Result<bool, MatchError> + Send + Sync + 'static,
    {
        self.custom = Some(Arc::new(predicate));
    }

    /// Level-only criteria.
    pub fn levels(levels: impl IntoIterator<Item = Level>) -> Self {
        Self {
            levels: levels.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Criteria for errors and worse.
    pub fn errors_only() -> Self {
        Self::levels([Level::Fatal, Level::Error])
    }

    /// Set the case-insensitive substring search.
    pub fn with_text_search(mut self, text: impl Into<String>) -> Self {
        self.text_search = text.into();
        self
    }

    /// Require an exact process ID.
    pub fn with_process_id(mut self, process_id: u32) -> Self {
        self.process_id = Some(process_id);
        self
    }

    fn has_text_condition(&self) -> bool {
        !self.inclusive_patterns.is_empty()
            || !self.exclusive_patterns.is_empty()
            || !self.text_search.is_empty()
    }

    fn has_inclusive_text(&self) -> bool {
        !self.inclusive_patterns.is_empty() || !self.text_search.is_empty()
    }

    fn has_other_conditions(&self) -> bool {
        !self.levels.is_empty()
            || self.process_id.is_some()
            || self.thread_id.is_some()
            || self.time_start.is_some()
            || self.time_end.is_some()
            || self.custom.is_some()
    }

    /// False when the criteria would accept every entity unevaluated.
    pub fn is_active(&self) -> bool {
        self.has_text_condition() || self.has_other_conditions()
    }

    /// Whether marks may influence the outcome (and so require
    /// re-evaluation when they change). Custom predicates may read marks.
    pub fn depends_on_marks(&self) -> bool {
        (self.include_marked && self.is_active()) || self.custom.is_some()
    }

    /// Combination of the text condition with the other conditions.
    ///
    /// Auto resolves to union when inclusive text and a process or thread
    /// ID are both set, otherwise to intersection.
    pub fn effective_text_combination(&self) -> CombinationMode {
        match self.text_combination {
            Some(mode) => mode,
            None if self.has_inclusive_text()
                && (self.process_id.is_some() || self.thread_id.is_some()) =>
            {
                CombinationMode::Union
            }
            None => CombinationMode::Intersection,
        }
    }

    fn searchable_text(&self, entity: &Entity, record: &Record) -> Result<String, MatchError> {
        if self.text_properties.is_empty() {
            return Ok(record.message.clone());
        }
        let mut text = String::with_capacity(record.message.len());
        for (i, property) in self.text_properties.iter().enumerate() {
            if i > 0 {
                text.push_str(TEXT_PROPERTY_SEPARATOR);
            }
            match property {
                TextProperty::Message => text.push_str(&record.message),
                TextProperty::Field(name) => {
                    if let Some(value) = entity.field(name)? {
                        text.push_str(value);
                    }
                }
            }
        }
        Ok(text)
    }

    fn text_matches(
        &self,
        entity: &Entity,
        record: &Record,
        retention: &dyn CacheRetention,
    ) -> Result<bool, MatchError> {
        let text = self.searchable_text(entity, record)?;

        let mut matched = !self.has_inclusive_text()
            || self.inclusive_patterns.iter().any(|re| re.is_match(&text));
        if !matched && !self.text_search.is_empty() {
            let needle = self.text_search.to_lowercase();
            matched = if self.text_properties.is_empty() {
                entity.normalized_message(retention)?.contains(&needle)
            } else {
                text.to_lowercase().contains(&needle)
            };
        }

        if matched && self.exclusive_patterns.iter().any(|re| re.is_match(&text)) {
            return Ok(false);
        }
        Ok(matched)
    }

    fn other_conditions_match(&self, entity: &Entity, record: &Record) -> Result<bool, MatchError> {
        if !self.levels.is_empty() && !self.levels.contains(&record.level) {
            return Ok(false);
        }
        if self.process_id.is_some() && record.process_id != self.process_id {
            return Ok(false);
        }
        if self.thread_id.is_some() && record.thread_id != self.thread_id {
            return Ok(false);
        }
        // Entities without timestamps are excluded by any time bound.
        if let Some(start) = self.time_start {
            match record.timestamp {
                Some(ts) if ts >= start => {}
                _ => return Ok(false),
            }
        }
        if let Some(end) = self.time_end {
            match record.timestamp {
                Some(ts) if ts <= end => {}
                _ => return Ok(false),
            }
        }
        match &self.custom {
            Some(predicate) => predicate(entity),
            None => Ok(true),
        }
    }

    /// Evaluate the predicate against one entity.
    ///
    /// `retention` decides whether the normalized message computed for the
    /// substring search may be cached on the entity.
    pub fn matches(
        &self,
        entity: &Entity,
        retention: &dyn CacheRetention,
    ) -> Result<bool, MatchError> {
        let record = entity.record()?;
        if !self.is_active() {
            return Ok(true);
        }
        if self.include_marked && entity.is_marked()? {
            return Ok(true);
        }

        let has_text = self.has_text_condition();
        let text_matched = has_text && self.text_matches(entity, record, retention)?;
        let union = self.effective_text_combination() == CombinationMode::Union;

        if has_text && text_matched && union {
            return Ok(true);
        }
        if !self.has_other_conditions() {
            return Ok(!has_text || text_matched);
        }
        if !self.other_conditions_match(entity, record)? {
            return Ok(false);
        }
        Ok(!has_text || text_matched || union)
    }
}

impl std::fmt::Debug for FilterCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterCriteria")
            .field("levels", &self.levels)
            .field("process_id", &self.process_id)
            .field("thread_id", &self.thread_id)
            .field("time_start", &self.time_start)
            .field("time_end", &self.time_end)
            .field("text_search", &self.text_search)
            .field("text_properties", &self.text_properties)
            .field("include_marked", &self.include_marked)
            .field("text_combination", &self.text_combination)
            .field(
                "inclusive_patterns",
                &self
                    .inclusive_patterns
                    .iter()
                    .map(Regex::as_str)
                    .collect::<Vec<_>>(),
            )
            .field(
                "exclusive_patterns",
                &self
                    .exclusive_patterns
                    .iter()
                    .map(Regex::as_str)
                    .collect::<Vec<_>>(),
            )
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

/// A processor whose output is the ordered subset of its source that
/// satisfies a [`FilterCriteria`].
pub trait Filter: Processor {
    fn criteria(&self) -> Arc<FilterCriteria>;

    /// Live list of this filter's matches, in source order. It is cleared
    /// when a new pass starts and stops changing once cancelled.
    fn filtered(&self) -> FilteredView;

    /// Replace the predicate. A live pass restarts from the beginning of
    /// the source; an idle or cancelled filter uses it on its next pass.
    fn set_criteria(&mut self, criteria: FilterCriteria) -> Result<(), ProcessorError>;

    /// Re-evaluate specific source positions after their marks changed.
    /// Ignored when the criteria cannot depend on marks.
    fn invalidate(&self, indices: &[usize]);
}

/// Evaluate `criteria` over a slice of entities, returning the indices of
/// matching entities. Entities that fail evaluation are skipped.
pub fn apply_filters(
    entities: &[Entity],
    criteria: &FilterCriteria,
    retention: &dyn CacheRetention,
) -> Vec<usize> {
    if !criteria.is_active() {
        return (0..entities.len())
            .filter(|&i| !entities[i].is_stale())
            .collect();
    }
    entities
        .iter()
        .enumerate()
        .filter(|(_, entity)| criteria.matches(entity, retention).unwrap_or(false))
        .map(|(idx, _)| idx)
        .collect()
}
