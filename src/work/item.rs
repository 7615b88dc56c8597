use super::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a work item: owning file and sequence number within that file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId {
    pub file_id: u32,
    pub number: u64,
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.number)
    }
}

/// A payload plus its immutable identity and a processed flag
///
/// The identity fields are private so that nothing outside this module can
/// renumber an item once it has been read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    number: u64,
    file_id: u32,
    #[serde(default)]
    processed: bool,
    payload: Payload,
}

impl WorkItem {
    /// Create an unprocessed item
    pub fn new(file_id: u32, number: u64, payload: Payload) -> Self {
        Self {
            number,
            file_id,
            processed: false,
            payload,
        }
    }

    pub fn id(&self) -> ItemId {
        ItemId {
            file_id: self.file_id,
            number: self.number,
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn processed(&self) -> bool {
        self.processed
    }

    pub fn set_processed(&mut self, processed: bool) {
        self.processed = processed;
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Replace the payload, typically with a client's result
    pub fn set_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "item {} of file {} ({})",
            self.number,
            self.file_id,
            if self.processed { "processed" } else { "unprocessed" }
        )
    }
}
