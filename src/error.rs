//! Error taxonomy for coordinator and peer calls
//!
//! Every call that crosses a peer boundary returns [`CallResult`]. Only
//! [`SwitchboardError::Transport`] is transient: the retry and failover
//! decorators in [`crate::fault`] re-issue calls for that variant and pass
//! every other variant straight through to the caller.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the coordinator and by peer handles
#[derive(Error, Debug)]
pub enum SwitchboardError {
    /// A peer's self-description failed, or a server declared an invalid capacity
    #[error("registration failed: {message}")]
    Registration { message: String },

    /// A client id that is not currently registered
    #[error("invalid client ID: {0}")]
    UnrecognizedClient(u32),

    /// A server id that is not currently registered
    #[error("invalid server ID: {0}")]
    UnrecognizedServer(u32),

    /// A client reported a work item it does not hold
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    /// The call channel failed (connect, timeout, broken frame)
    #[error("transport failure: {message}")]
    Transport { message: String },

    /// Log replay or input re-read failed while opening a file
    #[error("recovery of {path} failed: {message}")]
    Recovery { path: PathBuf, message: String },

    /// A server's service reported an application-level failure
    #[error("service error: {message}")]
    Service { message: String },

    /// Local I/O on input, log, or output streams
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for every call that crosses a peer boundary
pub type CallResult<T> = std::result::Result<T, SwitchboardError>;

impl SwitchboardError {
    pub fn registration(message: impl Into<String>) -> Self {
        Self::Registration {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self::Service {
            message: message.into(),
        }
    }

    /// Whether re-issuing the same call could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Convert to the serializable form carried by the TCP protocol
    pub fn to_wire(&self) -> WireError {
        let kind = match self {
            Self::Registration { .. } => WireErrorKind::Registration,
            Self::UnrecognizedClient(_) => WireErrorKind::UnrecognizedClient,
            Self::UnrecognizedServer(_) => WireErrorKind::UnrecognizedServer,
            Self::Protocol { .. } => WireErrorKind::Protocol,
            Self::Transport { .. } => WireErrorKind::Transport,
            Self::Recovery { .. } | Self::Io(_) => WireErrorKind::Io,
            Self::Service { .. } => WireErrorKind::Service,
        };
        let id = match self {
            Self::UnrecognizedClient(id) | Self::UnrecognizedServer(id) => Some(*id),
            _ => None,
        };
        WireError {
            kind,
            id,
            message: self.to_string(),
        }
    }
}

/// Error category carried over the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WireErrorKind {
    Registration,
    UnrecognizedClient,
    UnrecognizedServer,
    Protocol,
    Transport,
    Service,
    Io,
}

/// Serializable mirror of [`SwitchboardError`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub id: Option<u32>,
    pub message: String,
}

impl From<WireError> for SwitchboardError {
    fn from(wire: WireError) -> Self {
        match wire.kind {
            WireErrorKind::Registration => Self::Registration {
                message: wire.message,
            },
            WireErrorKind::UnrecognizedClient => Self::UnrecognizedClient(wire.id.unwrap_or(0)),
            WireErrorKind::UnrecognizedServer => Self::UnrecognizedServer(wire.id.unwrap_or(0)),
            WireErrorKind::Protocol => Self::Protocol {
                message: wire.message,
            },
            WireErrorKind::Transport => Self::Transport {
                message: wire.message,
            },
            WireErrorKind::Service => Self::Service {
                message: wire.message,
            },
            WireErrorKind::Io => Self::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                wire.message,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_transient() {
        assert!(SwitchboardError::transport("connection refused").is_transient());
        assert!(!SwitchboardError::UnrecognizedClient(3).is_transient());
        assert!(!SwitchboardError::protocol("not assigned").is_transient());
        assert!(!SwitchboardError::registration("bad capacity").is_transient());
    }

    #[test]
    fn test_wire_keeps_kind_and_id() {
        let wire = SwitchboardError::UnrecognizedServer(7).to_wire();
        assert_eq!(wire.kind, WireErrorKind::UnrecognizedServer);
        assert_eq!(wire.id, Some(7));

        match SwitchboardError::from(wire) {
            SwitchboardError::UnrecognizedServer(id) => assert_eq!(id, 7),
            other => panic!("Wrong error variant: {:?}", other),
        }
    }

    #[test]
    fn test_wire_transport_stays_transient() {
        let wire = SwitchboardError::transport("timed out").to_wire();
        assert!(SwitchboardError::from(wire).is_transient());
    }
}
