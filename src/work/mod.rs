//! Work items
//!
//! A work item is one object read from a submitted input file, tagged with the
//! id of that file and its sequence number within it. The pair forms the
//! item's identity ([`ItemId`]), assigned once at read time and never reused.
//! Only the payload and the processed flag change after creation.

pub mod item;

pub use item::{ItemId, WorkItem};

/// Opaque value carried between the coordinator and clients
pub type Payload = serde_json::Value;
