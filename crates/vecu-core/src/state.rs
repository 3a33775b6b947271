//! ECU lifecycle state.
//!
//! The state gates what the main loop and the diagnostic sessions may
//! do. It is shared process-wide through a single atomic; transitions
//! are announcements, not synchronization points, so relaxed ordering
//! is sufficient.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle states of the simulated ECU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EcuState {
    /// Initial state; NVRAM not yet loaded.
    Boot = 0,
    /// Normal operation; the application runs every cycle.
    Application = 1,
    /// A programming session was entered; the application is held off
    /// while the tester drives the reprogramming sequence.
    UpdatePending = 2,
    /// Terminal failure state; the main loop exits.
    Bricked = 3,
}

impl fmt::Display for EcuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EcuState::Boot => "BOOT",
            EcuState::Application => "APPLICATION",
            EcuState::UpdatePending => "UPDATE_PENDING",
            EcuState::Bricked => "BRICKED",
        };
        f.write_str(name)
    }
}

/// Process-wide shared lifecycle state.
pub struct SharedEcuState(AtomicU8);

impl SharedEcuState {
    pub fn new(initial: EcuState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> EcuState {
        match self.0.load(Ordering::Relaxed) {
            0 => EcuState::Boot,
            1 => EcuState::Application,
            2 => EcuState::UpdatePending,
            3 => EcuState::Bricked,
            // Only `store` writes this atomic, and it only writes
            // discriminants of `EcuState`.
            other => unreachable!("invalid ECU state byte {other}"),
        }
    }

    pub fn store(&self, state: EcuState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }
}

impl Default for SharedEcuState {
    fn default() -> Self {
        Self::new(EcuState::Boot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_boot() {
        let state = SharedEcuState::default();
        assert_eq!(state.load(), EcuState::Boot);
    }

    #[test]
    fn store_load_round_trip() {
        let state = SharedEcuState::default();
        for s in [
            EcuState::Application,
            EcuState::UpdatePending,
            EcuState::Bricked,
            EcuState::Boot,
        ] {
            state.store(s);
            assert_eq!(state.load(), s);
        }
    }

    #[test]
    fn display_matches_log_vocabulary() {
        assert_eq!(EcuState::UpdatePending.to_string(), "UPDATE_PENDING");
    }
}
