// src/console/mod.rs
//! Console sink
//!
//! - **LogEntry**: immutable log line with a per-console monotonic id
//! - **Console**: bounded buffer, ordered fan-out to subscribers, optional
//!   parent console for mirroring, blocking `raw_input`

pub mod console_impl;
pub mod log_entry;

pub use console_impl::{
    Console, ConsoleEvent, LogListener, OverflowPolicy, Subscription, INPUT_SURFACE_TIMEOUT,
};
pub use log_entry::{LogEntry, LogLevel};
