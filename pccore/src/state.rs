//! Peer session state machine.
//!
//! Only the edges listed in [`PeerState::apply`] exist. Everything else is an
//! [`InvalidTransition`], which callers treat as a programming error or a late
//! event for a session that already moved on.

use serde::Serialize;

/// Lifecycle state of one peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    #[default]
    Idle,
    /// Acquiring local media and building the connection object.
    Initializing,
    /// Connection object exists, no negotiation yet.
    Ready,
    /// Offer/answer exchange and ICE in progress.
    Connecting,
    Connected,
    /// Transport lost without a fatal failure; may self-heal.
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn is_negotiating_or_live(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Disconnected
        )
    }

    pub fn can_restart_ice(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// Apply a transition, returning the new state.
    pub fn apply(self, transition: &PeerTransition) -> Result<PeerState, InvalidTransition> {
        use PeerState::*;
        use PeerTransition as T;

        let next = match (self, transition) {
            (Idle, T::Initialize) => Initializing,
            (Initializing, T::Initialized) => Ready,
            (Ready, T::Negotiate) => Connecting,
            (Connecting | Disconnected, T::TransportConnected) => Connected,
            (Connecting | Connected, T::TransportDisconnected) => Disconnected,
            (Connecting | Connected | Disconnected, T::Fail { .. }) => Failed,
            (Failed, T::TeardownComplete) => Idle,
            (current, T::Close) if current != Closed => Closed,
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current,
                    attempted: format!("{:?}", transition),
                });
            }
        };
        Ok(next)
    }

    /// Whether `self -> next` is one of the machine's edges, regardless of trigger.
    pub fn is_edge(self, next: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, next),
            (Idle, Initializing)
                | (Initializing, Ready)
                | (Ready, Connecting)
                | (Connecting, Connected)
                | (Disconnected, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connecting, Failed)
                | (Connected, Failed)
                | (Disconnected, Failed)
                | (Failed, Idle)
        ) || (self != Closed && next == Closed)
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Triggers understood by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerTransition {
    Initialize,
    Initialized,
    Negotiate,
    TransportConnected,
    TransportDisconnected,
    Fail { reason: String },
    TeardownComplete,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: PeerState,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn fail() -> PeerTransition {
        PeerTransition::Fail {
            reason: "ice failed".into(),
        }
    }

    /// Flow: Idle → Initializing → Ready → Connecting → Connected → Closed
    #[test]
    fn test_happy_path() {
        let mut state = PeerState::Idle;
        for t in [
            PeerTransition::Initialize,
            PeerTransition::Initialized,
            PeerTransition::Negotiate,
            PeerTransition::TransportConnected,
            PeerTransition::Close,
        ] {
            state = state.apply(&t).unwrap();
        }
        assert_eq!(state, PeerState::Closed);
    }

    #[test]
    fn test_disconnected_can_self_heal() {
        let state = PeerState::Connected
            .apply(&PeerTransition::TransportDisconnected)
            .unwrap();
        assert_eq!(state, PeerState::Disconnected);
        let healed = state.apply(&PeerTransition::TransportConnected).unwrap();
        assert_eq!(healed, PeerState::Connected);
    }

    #[test]
    fn test_failure_tears_down_to_idle() {
        let failed = PeerState::Connecting.apply(&fail()).unwrap();
        assert_eq!(failed, PeerState::Failed);
        assert_eq!(
            failed.apply(&PeerTransition::TeardownComplete).unwrap(),
            PeerState::Idle
        );
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(PeerState::Idle.apply(&PeerTransition::Negotiate).is_err());
        assert!(PeerState::Ready.apply(&fail()).is_err());
        assert!(
            PeerState::Initializing
                .apply(&PeerTransition::TransportConnected)
                .is_err()
        );
        assert!(PeerState::Closed.apply(&PeerTransition::Close).is_err());
        assert!(PeerState::Failed.apply(&PeerTransition::Negotiate).is_err());
    }

    #[test]
    fn test_closed_is_reachable_from_every_live_state() {
        for state in [
            PeerState::Idle,
            PeerState::Initializing,
            PeerState::Ready,
            PeerState::Connecting,
            PeerState::Connected,
            PeerState::Disconnected,
            PeerState::Failed,
        ] {
            assert_eq!(state.apply(&PeerTransition::Close).unwrap(), PeerState::Closed);
        }
    }

    #[test]
    fn test_restart_ice_only_while_negotiating_or_connected() {
        assert!(PeerState::Connecting.can_restart_ice());
        assert!(PeerState::Connected.can_restart_ice());
        assert!(!PeerState::Disconnected.can_restart_ice());
        assert!(!PeerState::Ready.can_restart_ice());
    }

    #[test]
    fn test_random_walk_only_follows_edges() {
        let triggers = [
            PeerTransition::Initialize,
            PeerTransition::Initialized,
            PeerTransition::Negotiate,
            PeerTransition::TransportConnected,
            PeerTransition::TransportDisconnected,
            fail(),
            PeerTransition::TeardownComplete,
            PeerTransition::Close,
        ];
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _walk in 0..200 {
            let mut state = PeerState::Idle;
            for _step in 0..64 {
                let trigger = &triggers[rng.random_range(0..triggers.len())];
                match state.apply(trigger) {
                    Ok(next) => {
                        assert!(
                            state.is_edge(next),
                            "disallowed edge {state} -> {next} via {trigger:?}"
                        );
                        state = next;
                    }
                    Err(err) => assert_eq!(err.current_state, state),
                }
                if state.is_terminal() {
                    break;
                }
            }
        }
    }
}
