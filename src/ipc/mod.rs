// src/ipc/mod.rs
//! Cross-process surface
//!
//! Newline-delimited JSON over any async byte stream: TCP in the binary,
//! an in-memory duplex in tests.
//!
//! ```text
//! IpcClient ──Request──▶ IpcServer ──▶ EngineController
//!     ▲                      │
//!     └── replies, log and task events
//! ```

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{Request, ServerMessage, SourceSpec};
pub use server::IpcServer;
