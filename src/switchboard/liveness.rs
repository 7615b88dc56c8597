//! Coordinator-side liveness detection
//!
//! One keep-alive task per registered peer pings it every interval. A peer
//! that fails `max_retries + 1` consecutive pings is presumed dead; a peer
//! that answers `false` is shutting down on its own. Either way the task
//! reports a [`PeerDeath`] on a channel and exits. The switchboard's
//! supervisor task receives the report and runs the cleanup.

use crate::peer::PeerHandle;
use log::{debug, warn};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Client,
    Server,
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Report from a keep-alive task that its peer is gone
#[derive(Debug, Clone)]
pub struct PeerDeath {
    pub kind: PeerKind,
    pub id: u32,
    /// The peer answered `false` rather than failing
    pub natural: bool,
    pub last_error: Option<String>,
}

/// Ping settings for one keep-alive task
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    pub interval: Duration,
    pub max_retries: u32,
    pub call_timeout: Duration,
}

impl KeepAlive {
    /// Start pinging `peer`; the task ends after reporting its death
    pub fn spawn(
        self,
        kind: PeerKind,
        id: u32,
        peer: PeerHandle,
        deaths: mpsc::UnboundedSender<PeerDeath>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let death = self.run(kind, id, &peer).await;
            // the receiver is gone only when the switchboard is
            let _ = deaths.send(death);
        })
    }

    async fn run(&self, kind: PeerKind, id: u32, peer: &PeerHandle) -> PeerDeath {
        let tries = self.max_retries + 1;
        let mut tries_left = tries;
        loop {
            let last_error = match tokio::time::timeout(self.call_timeout, peer.alive()).await {
                Ok(Ok(true)) => {
                    tries_left = tries;
                    None
                }
                Ok(Ok(false)) => {
                    debug!("{} No. {}: shutting down", kind, id);
                    return PeerDeath {
                        kind,
                        id,
                        natural: true,
                        last_error: None,
                    };
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("no answer within {:?}", self.call_timeout)),
            };

            if let Some(error) = last_error {
                tries_left -= 1;
                warn!(
                    "{} No. {}: liveness ping failed ({}); {} of {} tries left",
                    kind, id, error, tries_left, tries
                );
                if tries_left == 0 {
                    return PeerDeath {
                        kind,
                        id,
                        natural: false,
                        last_error: Some(error),
                    };
                }
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}
