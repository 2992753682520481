// logsieve - core/change.rs
//
// Change notifications exchanged between filters, the combiner and view
// observers. Observers apply them strictly in delivery order.

use crate::core::entity::Entity;
use crate::core::processor::ProcessorId;
use std::ops::Range;

/// Index-accurate change to a live filtered view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewChange {
    /// `entities` were inserted starting at view position `index`.
    Added { index: usize, entities: Vec<Entity> },

    /// `entities` were removed starting at view position `index`.
    Removed { index: usize, entities: Vec<Entity> },

    /// The view was rebuilt; re-read it. `len` is its new length.
    Reset { len: usize },
}

impl ViewChange {
    /// Number of entities the change touches (the new length for a reset).
    pub fn len(&self) -> usize {
        match self {
            Self::Added { entities, .. } | Self::Removed { entities, .. } => entities.len(),
            Self::Reset { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One output delta from a filter, tagged with the pass generation it was
/// produced in so the consumer can discard work superseded by a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDelta {
    pub processor: ProcessorId,
    pub generation: u64,
    pub kind: DeltaKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaKind {
    /// A full pass is starting; discard this filter's previous matches.
    Reset,

    /// Source positions in `range` were evaluated; `matches` lists the
    /// ones that satisfied the predicate, ascending.
    Matched {
        range: Range<usize>,
        matches: Vec<usize>,
    },

    /// Specific source positions were re-evaluated: `(index, matched)`.
    Revised { changes: Vec<(usize, bool)> },

    /// The filter faulted and will produce nothing further.
    Faulted { reason: String },
}
