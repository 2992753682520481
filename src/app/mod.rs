// logsieve - app/mod.rs
//
// Application layer: session ownership, filter workers, the combiner and
// memory governance.
// Dependencies: core, platform, util.

pub mod combiner;
pub mod log_filter;
pub mod memory;
pub mod session;
