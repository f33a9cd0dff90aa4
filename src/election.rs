//! Leader election boundary.
//!
//! Election itself (lease acquisition, renewal, fencing) lives outside
//! this crate; peers only consume a stream of [`LeaderState`] transitions.
//! The stock source is a statically configured leader, which is what
//! single-process deployments and the test harness drive directly.

use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderState {
    pub leader: Option<String>,
}

impl LeaderState {
    pub fn led_by(leader: impl Into<String>) -> Self {
        Self {
            leader: Some(leader.into()),
        }
    }

    pub fn leaderless() -> Self {
        Self { leader: None }
    }

    pub fn leader_name(&self) -> &str {
        self.leader.as_deref().unwrap_or("")
    }
}

/// A channel carrying leadership transitions. Keep the sender around to
/// publish changes; every subsystem holds a receiver.
pub fn channel(initial: LeaderState) -> (watch::Sender<LeaderState>, watch::Receiver<LeaderState>) {
    watch::channel(initial)
}

/// Election source for a fixed, configured leader.
pub fn static_leader(
    leader: Option<&str>,
) -> (watch::Sender<LeaderState>, watch::Receiver<LeaderState>) {
    let state = match leader {
        Some(name) => LeaderState::led_by(name),
        None => LeaderState::leaderless(),
    };
    channel(state)
}
