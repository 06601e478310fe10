//! Partition worker lifecycle.
//!
//! # State Transitions
//!
//! ```text
//! Initializing -> Receiving -> Processing -> Checkpointing -> Receiving (loop)
//!      |             |            |               |
//!      |             +------------+---------------+--> LeaseLost
//!      v             v            v               v
//!   Closing <--------+------------+---------------+
//!      |
//!      v
//!   Closed
//! ```
//!
//! `LeaseLost` and `Closed` are terminal. A worker that loses its lease still
//! runs its cleanup (receiver close, handler stop) before reporting; the
//! reported state stays `LeaseLost`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Initializing,
    Receiving,
    Processing,
    Checkpointing,
    LeaseLost,
    Closing,
    Closed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Initializing => "initializing",
            WorkerState::Receiving => "receiving",
            WorkerState::Processing => "processing",
            WorkerState::Checkpointing => "checkpointing",
            WorkerState::LeaseLost => "lease_lost",
            WorkerState::Closing => "closing",
            WorkerState::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::LeaseLost | WorkerState::Closed)
    }

    /// Whether the worker is between claim and shutdown.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            WorkerState::Initializing
                | WorkerState::Receiving
                | WorkerState::Processing
                | WorkerState::Checkpointing
        )
    }

    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Initializing, Receiving)
                | (Receiving, Processing)
                | (Processing, Checkpointing)
                | (Checkpointing, Receiving)
                | (Initializing | Receiving | Processing | Checkpointing, LeaseLost)
                | (Initializing | Receiving | Processing | Checkpointing, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_cycle() {
        let path = [
            WorkerState::Initializing,
            WorkerState::Receiving,
            WorkerState::Processing,
            WorkerState::Checkpointing,
            WorkerState::Receiving,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for next in [
            WorkerState::Initializing,
            WorkerState::Receiving,
            WorkerState::Closing,
            WorkerState::Closed,
        ] {
            assert!(!WorkerState::LeaseLost.can_transition_to(next));
            assert!(!WorkerState::Closed.can_transition_to(next));
        }
        assert!(WorkerState::LeaseLost.is_terminal());
        assert!(WorkerState::Closed.is_terminal());
    }

    #[test]
    fn test_no_skipping_processing() {
        assert!(!WorkerState::Receiving.can_transition_to(WorkerState::Checkpointing));
        assert!(!WorkerState::Closing.can_transition_to(WorkerState::Receiving));
    }

    #[test]
    fn test_any_active_state_can_close_or_lose_lease() {
        for state in [
            WorkerState::Initializing,
            WorkerState::Receiving,
            WorkerState::Processing,
            WorkerState::Checkpointing,
        ] {
            assert!(state.is_active());
            assert!(state.can_transition_to(WorkerState::Closing));
            assert!(state.can_transition_to(WorkerState::LeaseLost));
        }
    }
}
