//! Peer-local lifecycle
//!
//! ```text
//!            die(false)             alive() -> false
//!  Running ─────────────► Dying ─────────────────────► Dead
//!     │                     │                           ▲
//!     │      die(true)      │        die(true)          │
//!     └─────────────────────┴───────────────────────────┘
//! ```
//!
//! `alive()` answers `true` while running and counts as a renewal of the
//! coordinator's liveness; the first call after a graceful `die` answers
//! `false` and completes the shutdown.

use log::debug;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Running,
    /// Graceful shutdown requested; waiting for the final liveness ping
    Dying,
    Dead,
}

/// Outcome of waiting for the coordinator's next liveness ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renewal {
    Renewed,
    TimedOut,
    /// The peer started shutting down while waiting
    Dying,
}

/// Shared lifecycle state of one local peer
#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<PeerState>,
    renewals: watch::Sender<u64>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(PeerState::Running);
        let (renewals, _) = watch::channel(0);
        Self { state, renewals }
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    /// Whether a shutdown has been requested
    pub fn time_to_die(&self) -> bool {
        self.state() != PeerState::Running
    }

    pub fn is_dead(&self) -> bool {
        self.state() == PeerState::Dead
    }

    /// Answer a liveness ping
    pub fn alive(&self) -> bool {
        let mut answer = false;
        self.state.send_modify(|state| match state {
            PeerState::Running => answer = true,
            PeerState::Dying => *state = PeerState::Dead,
            PeerState::Dead => {}
        });
        if answer {
            self.renewals.send_modify(|n| *n += 1);
        }
        answer
    }

    pub fn die(&self, immediate: bool) {
        self.state.send_modify(|state| {
            *state = match (*state, immediate) {
                (PeerState::Dead, _) | (_, true) => PeerState::Dead,
                _ => PeerState::Dying,
            }
        });
    }

    /// Wait until a shutdown is requested
    pub async fn until_time_to_die(&self) {
        let mut rx = self.state.subscribe();
        // the sender lives in self, so wait_for cannot fail
        let _ = rx.wait_for(|s| *s != PeerState::Running).await;
    }

    /// Wait for a shutdown request, then for the final liveness ping
    ///
    /// A graceful shutdown that never gets its final ping is forced after
    /// `grace`.
    pub async fn wait_until_dead(&self, grace: Duration) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s != PeerState::Running).await;
        if tokio::time::timeout(grace, rx.wait_for(|s| *s == PeerState::Dead))
            .await
            .is_err()
        {
            debug!("no final liveness ping within {:?}; shutting down", grace);
            self.die(true);
        }
    }

    /// Listener over this lifecycle's liveness renewals
    pub fn renewal_watch(&self) -> RenewalWatch {
        RenewalWatch {
            renewals: self.renewals.subscribe(),
            state: self.state.subscribe(),
        }
    }
}

/// Receives liveness renewals for one listener task
pub struct RenewalWatch {
    renewals: watch::Receiver<u64>,
    state: watch::Receiver<PeerState>,
}

impl RenewalWatch {
    /// Wait up to `timeout` for the next renewal
    pub async fn next(&mut self, timeout: Duration) -> Renewal {
        if *self.state.borrow() != PeerState::Running {
            return Renewal::Dying;
        }
        tokio::select! {
            changed = self.renewals.changed() => match changed {
                Ok(()) => Renewal::Renewed,
                Err(_) => Renewal::Dying,
            },
            _ = self.state.wait_for(|s| *s != PeerState::Running) => Renewal::Dying,
            _ = tokio::time::sleep(timeout) => Renewal::TimedOut,
        }
    }
}
