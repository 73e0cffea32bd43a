//! Structured logging, built the way `flux::logging` builds it: a
//! `sloggers` terminal config feeding a `slog::Logger`. Re-exported here so
//! the rest of the crate can `use crate::logging;` and call the macros
//! exactly as `neutronium::net::channel::Channel` does.

pub use slog::{debug, error, info, o, trace, warn, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the root logger for a MyCP process. `verbose` maps to `trace`
/// level; otherwise `info`/`debug` depending on the `MYCP_LOG` env var,
/// falling back to `info`.
pub fn init(verbose: bool) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.destination(Destination::Stderr);

    let level = if verbose {
        Severity::Trace
    } else {
        match std::env::var("MYCP_LOG").as_deref() {
            Ok("trace") => Severity::Trace,
            Ok("debug") => Severity::Debug,
            Ok("warn") => Severity::Warning,
            Ok("error") => Severity::Error,
            _ => Severity::Info,
        }
    };
    builder.level(level);

    builder.build().expect("terminal logger config is always valid")
}

/// A logger that discards everything, used in tests and as a default when
/// no logger is supplied.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}
