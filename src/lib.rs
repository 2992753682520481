// logsieve - lib.rs
//
// Library entry point. The `logsieve` binary in `main.rs` is a thin CLI
// over this surface; integration tests use it directly.

pub mod app;
pub mod core;
pub mod platform;
pub mod util;
