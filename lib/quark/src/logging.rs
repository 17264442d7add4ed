//! Logging bootstrap. Re-exports the `slog` surface so downstream code can
//! write `logging::debug!(self.log, "..."; "key" => value)` without naming
//! the backend crate, plus helpers to build the process console logger.

pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Level, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the terminal logger used by binaries. Output goes to stderr so
/// payload dumps and tool output on stdout stay machine-readable.
pub fn init(level: Level) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity(level));
    builder.destination(Destination::Stderr);
    builder.build().expect("Failed to build terminal logger")
}

/// A logger that drops everything. Used by objects constructed without a
/// parent logger, same as a channel with no endpoint logger.
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}

/// Parses a console log level name. Accepts the `fatal` alias for critical.
pub fn level_from_str(name: &str) -> Option<Level> {
    match name {
        "trace" => Some(Level::Trace),
        "debug" => Some(Level::Debug),
        "info" => Some(Level::Info),
        "warn" | "warning" => Some(Level::Warning),
        "error" => Some(Level::Error),
        "fatal" | "critical" => Some(Level::Critical),
        _ => None,
    }
}

fn severity(level: Level) -> Severity {
    match level {
        Level::Trace => Severity::Trace,
        Level::Debug => Severity::Debug,
        Level::Info => Severity::Info,
        Level::Warning => Severity::Warning,
        Level::Error => Severity::Error,
        Level::Critical => Severity::Critical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_str() {
        assert_eq!(level_from_str("trace"), Some(Level::Trace));
        assert_eq!(level_from_str("warn"), Some(Level::Warning));
        assert_eq!(level_from_str("fatal"), Some(Level::Critical));
        assert_eq!(level_from_str("loud"), None);
    }
}
