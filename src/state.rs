//! Peer lifecycle state machine.
//!
//! A peer moves forward through a fixed order of phases. The current phase is
//! kept in an atomic word so API handlers, the update loop and readers can
//! observe it without taking the API mutex.
//!
//! ```text
//! Uninitialized → AcceptingInit → ActivatingNodes → NodeWaitingForClusterJoin → IsNode
//!        └──────────────┴────────────────┴──────────────────┴──────────────────┴──→ Failed
//! ```

use crate::core::error::{CoordinatorError, CoordinatorResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Lifecycle phase of a peer, totally ordered by declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum State {
    Uninitialized = 0,
    AcceptingInit = 1,
    ActivatingNodes = 2,
    NodeWaitingForClusterJoin = 3,
    IsNode = 4,
    Failed = 5,
}

impl State {
    /// Decode the numeric wire form.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Uninitialized),
            1 => Some(Self::AcceptingInit),
            2 => Some(Self::ActivatingNodes),
            3 => Some(Self::NodeWaitingForClusterJoin),
            4 => Some(Self::IsNode),
            5 => Some(Self::Failed),
            _ => None,
        }
    }

    /// Numeric wire form.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl From<State> for u32 {
    fn from(state: State) -> Self {
        state.as_u32()
    }
}

impl TryFrom<u32> for State {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        State::from_u32(value).ok_or_else(|| format!("unknown state {}", value))
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "Uninitialized",
            Self::AcceptingInit => "AcceptingInit",
            Self::ActivatingNodes => "ActivatingNodes",
            Self::NodeWaitingForClusterJoin => "NodeWaitingForClusterJoin",
            Self::IsNode => "IsNode",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Thread-safe holder of the current [`State`].
#[derive(Debug)]
pub struct StateMachine {
    current: AtomicU32,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a state machine in `Uninitialized`.
    pub fn new() -> Self {
        Self {
            current: AtomicU32::new(State::Uninitialized.as_u32()),
        }
    }

    /// Load the current state.
    pub fn get(&self) -> State {
        // Only values written by `advance` are ever stored.
        State::from_u32(self.current.load(Ordering::Acquire)).unwrap_or(State::Failed)
    }

    /// Fail with FailedPrecondition unless the current state is one of `allowed`.
    pub fn require(&self, allowed: &[State]) -> CoordinatorResult<()> {
        let current = self.get();
        if allowed.contains(&current) {
            return Ok(());
        }
        Err(CoordinatorError::failed_precondition(format!(
            "peer is in state {}, required one of {:?}",
            current, allowed
        )))
    }

    /// Atomically move to `next`.
    ///
    /// `next` must be strictly greater than the current state. `Failed` is
    /// reachable from every state except itself.
    pub fn advance(&self, next: State) -> CoordinatorResult<()> {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            let from = State::from_u32(current).unwrap_or(State::Failed);
            if next <= from {
                tracing::error!(from = %from, to = %next, "invalid state transition");
                return Err(CoordinatorError::InvalidStateTransition { from, to: next });
            }
            match self.current.compare_exchange(
                current,
                next.as_u32(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!(from = %from, to = %next, "state advanced");
                    return Ok(());
                }
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const ALL: [State; 6] = [
        State::Uninitialized,
        State::AcceptingInit,
        State::ActivatingNodes,
        State::NodeWaitingForClusterJoin,
        State::IsNode,
        State::Failed,
    ];

    fn machine_in(state: State) -> StateMachine {
        let sm = StateMachine::new();
        if state != State::Uninitialized {
            sm.advance(state).unwrap();
        }
        sm
    }

    #[test]
    fn test_new_is_uninitialized() {
        assert_eq!(StateMachine::new().get(), State::Uninitialized);
    }

    #[test]
    fn test_advance_forward() {
        let sm = StateMachine::new();
        sm.advance(State::AcceptingInit).unwrap();
        sm.advance(State::NodeWaitingForClusterJoin).unwrap();
        sm.advance(State::IsNode).unwrap();
        assert_eq!(sm.get(), State::IsNode);
    }

    #[test]
    fn test_advance_rejects_non_monotone() {
        for from in ALL {
            for to in ALL {
                let sm = machine_in(from);
                let result = sm.advance(to);
                if to > from {
                    assert!(result.is_ok(), "{} -> {} should succeed", from, to);
                    assert_eq!(sm.get(), to);
                } else {
                    assert!(
                        matches!(result, Err(CoordinatorError::InvalidStateTransition { .. })),
                        "{} -> {} should fail",
                        from,
                        to
                    );
                    assert_eq!(sm.get(), from);
                }
            }
        }
    }

    #[test]
    fn test_failed_is_absorbing() {
        let sm = machine_in(State::Failed);
        for to in ALL {
            assert!(sm.advance(to).is_err());
        }
        assert_eq!(sm.get(), State::Failed);
    }

    #[test]
    fn test_require_matches_membership() {
        for current in ALL {
            let sm = machine_in(current);
            for allowed in ALL {
                let result = sm.require(&[allowed]);
                assert_eq!(result.is_ok(), current == allowed);
            }
            assert!(sm.require(&ALL).is_ok());
            assert!(sm.require(&[]).is_err());
        }
    }

    #[test]
    fn test_require_error_code() {
        let sm = machine_in(State::IsNode);
        let err = sm.require(&[State::AcceptingInit]).unwrap_err();
        assert!(matches!(err, CoordinatorError::FailedPrecondition { .. }));
    }

    #[test]
    fn test_concurrent_advance_single_winner() {
        let sm = Arc::new(machine_in(State::AcceptingInit));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sm = Arc::clone(&sm);
                std::thread::spawn(move || sm.advance(State::ActivatingNodes).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(sm.get(), State::ActivatingNodes);
    }

    #[test]
    fn test_state_json_is_integer() {
        assert_eq!(serde_json::to_string(&State::IsNode).unwrap(), "4");
        let parsed: State = serde_json::from_str("2").unwrap();
        assert_eq!(parsed, State::ActivatingNodes);
        assert!(serde_json::from_str::<State>("9").is_err());
    }
}
