// Licensed under the MIT License.

//! Mapping of the simulator's logging level onto the tracing stack.

use tracing_subscriber::filter::LevelFilter;

/// How much the simulator says while it runs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum LoggingLevel {
    /// No output at all.
    Silent,
    /// Protocol violations and internal failures only.
    #[default]
    Error,
    /// Errors plus per-command progress.
    Info,
}

/// Installs a process-wide subscriber for `level`.
///
/// A single subscriber serialises output across all controller and host
/// threads. Does nothing if a subscriber is already installed, so embedders
/// with their own tracing setup keep it.
pub fn apply(level: LoggingLevel) {
    let filter = match level {
        LoggingLevel::Silent => LevelFilter::OFF,
        LoggingLevel::Error => LevelFilter::ERROR,
        LoggingLevel::Info => LevelFilter::INFO,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(filter)
        .try_init();
}
