//! File logger for diagnosing runs after the fact.
//!
//! Writes to `~/.relay/relay.log`, truncated at startup. Three levels:
//! WARN for recoverable surprises, INFO for run milestones, DEBUG for
//! per-operation traces. DEBUG is off unless `--debug` or `RELAY_DEBUG=1`
//! is set.

use std::fmt::Arguments;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Initialize logging; `debug` (or `RELAY_DEBUG=1`) enables DEBUG output.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var("RELAY_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    DEBUG_ENABLED.store(debug || env_debug, Ordering::SeqCst);

    if let Some(relay_dir) = dirs::home_dir().map(|h| h.join(".relay")) {
        let _ = std::fs::create_dir_all(&relay_dir);
        let path = relay_dir.join("relay.log");
        // Each invocation starts a fresh log
        let _ = std::fs::write(&path, "");
        LOG_PATH.set(path).ok();
    }
}

pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Append one line at the given level. DEBUG lines are dropped unless
/// debug mode is on; everything is a no-op before `init_with_debug`.
pub fn write_line(level: LogLevel, args: Arguments<'_>) {
    if level == LogLevel::Debug && !is_debug() {
        return;
    }
    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.tag(), args);
        }
    }
}

/// Log a run milestone at INFO level.
#[macro_export]
macro_rules! rlog {
    ($($arg:tt)*) => {
        $crate::log::write_line($crate::log::LogLevel::Info, format_args!($($arg)*))
    };
}

/// Log a recoverable surprise at WARN level.
#[macro_export]
macro_rules! rlog_warn {
    ($($arg:tt)*) => {
        $crate::log::write_line($crate::log::LogLevel::Warn, format_args!($($arg)*))
    };
}

/// Log a per-operation trace, emitted only in debug mode.
#[macro_export]
macro_rules! rlog_debug {
    ($($arg:tt)*) => {
        $crate::log::write_line($crate::log::LogLevel::Debug, format_args!($($arg)*))
    };
}
