pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the terminal logging sink. Verbose mode lowers the severity floor
/// to debug; everything goes to stderr so stdout stays clean.
pub fn init(verbose: bool) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(if verbose { Severity::Debug } else { Severity::Info });
    builder.destination(Destination::Stderr);

    builder.build().expect("Logger construction failed")
}

/// A sink that drops everything. Stands in when logging is disabled.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
