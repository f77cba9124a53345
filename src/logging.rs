//! Logger capability threaded through the pool, loops, dispatcher and jobs.
//!
//! Library code never logs through ambient state: every component that logs
//! holds an `Arc<dyn Logger>` handed to it at construction. The default
//! [`TracingLogger`] forwards to `tracing`, so the usual subscriber setup
//! applies.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Leveled logging sink.
///
/// Messages arrive pre-formatted as [`fmt::Arguments`], so callers use
/// `format_args!` the way they would use `println!`.
pub trait Logger: Send + Sync {
    fn info(&self, args: fmt::Arguments<'_>);
    fn error(&self, args: fmt::Arguments<'_>);
}

/// Forwards to the `tracing` macros under the `tubeworker` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, args: fmt::Arguments<'_>) {
        tracing::info!(target: "tubeworker", "{}", args);
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        tracing::error!(target: "tubeworker", "{}", args);
    }
}

/// Level of a captured log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
}

/// A captured log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: Level,
    pub message: String,
}

/// Keeps every line in memory. Useful in tests and for applications that
/// want to inspect what the worker reported.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    lines: Mutex<Vec<LogLine>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far.
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Messages logged at the error level.
    pub fn errors(&self) -> Vec<String> {
        self.messages(Level::Error)
    }

    /// Messages logged at the info level.
    pub fn infos(&self) -> Vec<String> {
        self.messages(Level::Info)
    }

    /// Whether any error line contains `needle`.
    pub fn has_error_containing(&self, needle: &str) -> bool {
        self.errors().iter().any(|line| line.contains(needle))
    }

    fn messages(&self, level: Level) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|line| line.level == level)
            .map(|line| line.message)
            .collect()
    }

    fn push(&self, level: Level, args: fmt::Arguments<'_>) {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(LogLine {
                level,
                message: args.to_string(),
            });
    }
}

impl Logger for RecordingLogger {
    fn info(&self, args: fmt::Arguments<'_>) {
        self.push(Level::Info, args);
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        self.push(Level::Error, args);
    }
}

/// The logger used when none is configured.
pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger)
}
