use slog::{o, Discard, Logger};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Terminal logger for binaries and tests; library code always receives its
/// logger from the caller.
pub fn term_logger() -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.build().expect("terminal logger construction")
}

/// A logger that drops everything.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
