//! Switchboard - distributed object-processing coordinator
//!
//! A switchboard splits input files into work items and hands them to a
//! dynamic population of client processes. Clients may need a server to do
//! their work; the switchboard assigns each client the least-loaded server
//! that will take it. Every item is logged as it is handed out and returned,
//! so an interrupted run resumes where it stopped.
//!
//! # Architecture
//!
//! - **Switchboard**: peer registry, work queue, liveness, and per-file output
//! - **Peers**: local client and server runners, plus remote handles
//! - **Fault tolerance**: retry and failover wrappers around server handles
//! - **Transport**: framed MessagePack calls over TCP
//! - **Codecs**: text, JSON lines, and MessagePack for inputs, outputs, and logs

pub mod codec;
pub mod config;
pub mod distributed;
pub mod error;
pub mod fault;
pub mod peer;
pub mod switchboard;
pub mod util;
pub mod work;

// Re-export commonly used types
pub use config::SwitchboardConfig;
pub use error::{CallResult, SwitchboardError};
pub use switchboard::Switchboard;
pub use work::{Payload, WorkItem};

/// Result type used throughout the switchboard
pub type Result<T> = anyhow::Result<T>;
