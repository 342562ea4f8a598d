//! Stderr logger for the binary.

use std::io::{IsTerminal, Write};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

struct StderrLogger {
    color: bool,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("[{:>5}] {}: {}", record.level(), record.target(), record.args());
        let mut stderr = std::io::stderr().lock();
        let _ = if self.color {
            let color = match record.level() {
                Level::Error => 31, // Red
                Level::Warn => 93,  // BrightYellow
                Level::Info => 34,  // Blue
                Level::Debug => 32, // Green
                Level::Trace => 90, // BrightBlack
            };
            writeln!(stderr, "\u{1B}[{color}m{line}\u{1B}[0m")
        } else {
            writeln!(stderr, "{line}")
        };
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the stderr logger with the given maximum level.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    let logger = StderrLogger {
        color: std::io::stderr().is_terminal(),
    };
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level);
    Ok(())
}
