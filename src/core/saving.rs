// logsieve - core/saving.rs
//
// Snapshot handed to an external exporter. The entity list is frozen at
// construction; only the destination may change before the export runs.

use crate::core::entity::Entity;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Output format parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SavingFormat {
    #[default]
    Plain,
    /// Structured output; maps property names to output keys.
    Json { property_map: BTreeMap<String, String> },
}

/// Immutable export request over a snapshot of entities.
#[derive(Debug, Clone)]
pub struct SavingOptions {
    entities: Arc<[Entity]>,
    destination: Option<String>,
    format: SavingFormat,
}

impl SavingOptions {
    pub fn new(entities: impl Into<Arc<[Entity]>>) -> Self {
        Self {
            entities: entities.into(),
            destination: None,
            format: SavingFormat::Plain,
        }
    }

    /// Structured export with a property-name to output-key map.
    pub fn json(
        entities: impl Into<Arc<[Entity]>>,
        property_map: BTreeMap<String, String>,
    ) -> Self {
        Self {
            format: SavingFormat::Json { property_map },
            ..Self::new(entities)
        }
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn format(&self) -> &SavingFormat {
        &self.format
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.destination = Some(destination.into());
    }

    /// True only for a non-blank destination.
    pub fn has_destination(&self) -> bool {
        self.destination
            .as_deref()
            .is_some_and(|d| !d.trim().is_empty())
    }

    /// Output key for `property`; unmapped properties keep their name.
    pub fn output_key<'a>(&'a self, property: &'a str) -> &'a str {
        match &self.format {
            SavingFormat::Json { property_map } => property_map
                .get(property)
                .map(String::as_str)
                .unwrap_or(property),
            SavingFormat::Plain => property,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::group::RecordGroup;
    use crate::core::model::{Level, Record};

    #[test]
    fn test_snapshot_is_frozen() {
        let group = RecordGroup::new(1, None);
        let mut entities = vec![group.wrap(Record::new(Level::Info, "a")).unwrap()];
        let options = SavingOptions::new(entities.clone());
        entities.push(group.wrap(Record::new(Level::Info, "b")).unwrap());
        assert_eq!(options.len(), 1);
        assert_eq!(options.format(), &SavingFormat::Plain);
    }

    #[test]
    fn test_destination_must_be_non_blank() {
        let mut options = SavingOptions::new(Vec::new());
        assert!(!options.has_destination());
        options.set_destination("   ");
        assert!(!options.has_destination());
        options.set_destination("out.json");
        assert!(options.has_destination());
        assert_eq!(options.destination(), Some("out.json"));
    }

    #[test]
    fn test_json_property_map_falls_back_to_name() {
        let map = BTreeMap::from([("message".to_string(), "msg".to_string())]);
        let options = SavingOptions::json(Vec::new(), map);
        assert_eq!(options.output_key("message"), "msg");
        assert_eq!(options.output_key("level"), "level");
    }
}
