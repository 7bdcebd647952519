//! Process-wide observability wiring.

pub mod logging;
