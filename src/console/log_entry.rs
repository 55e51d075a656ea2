// src/console/log_entry.rs
//! Log entries and levels

use serde::{Deserialize, Serialize};
use std::fmt;

/// Log level, numbered like the Android log priorities scripts expect
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
    Assert,
}

impl LogLevel {
    /// Numeric priority (2 = verbose .. 7 = assert)
    pub fn priority(self) -> i32 {
        match self {
            LogLevel::Verbose => 2,
            LogLevel::Debug => 3,
            LogLevel::Info => 4,
            LogLevel::Warn => 5,
            LogLevel::Error => 6,
            LogLevel::Assert => 7,
        }
    }

    /// Map a numeric priority back to a level; unknown values are `Debug`
    pub fn from_priority(priority: i32) -> Self {
        match priority {
            2 => LogLevel::Verbose,
            3 => LogLevel::Debug,
            4 => LogLevel::Info,
            5 => LogLevel::Warn,
            6 => LogLevel::Error,
            7 => LogLevel::Assert,
            _ => LogLevel::Debug,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Verbose => "V",
            LogLevel::Debug => "D",
            LogLevel::Info => "I",
            LogLevel::Warn => "W",
            LogLevel::Error => "E",
            LogLevel::Assert => "A",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single console line. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic id, unique per console
    pub id: u64,

    pub level: LogLevel,

    pub content: String,

    /// Whether the entry terminates a line
    pub new_line: bool,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.level, self.content)
    }
}
