// logsieve - core/mod.rs
//
// Core pipeline types: records, entities, groups, sources, the processor
// lifecycle, filter predicates and live filtered lists.
// Dependencies: util, standard library, serde/chrono/regex.
// Must NOT depend on: app, platform.

pub mod change;
pub mod entity;
pub mod filter;
pub mod group;
pub mod model;
pub mod policy;
pub mod processor;
pub mod saving;
pub mod source;
pub mod view;
