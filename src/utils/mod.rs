//! Process-level helpers for the binary

pub mod logging;
pub mod terminal;

pub use logging::init_tracing;
pub use terminal::RawModeGuard;
