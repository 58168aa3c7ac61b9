//! Central legal-transition table for the machine run state.
//!
//! Every state change in the controller goes through [`check_transition`]
//! so the legality rules live in one place instead of being scattered
//! through the command handlers.

use crate::models::{CncState, CommandError};

/// Returns true when moving from `from` to `to` is permitted.
pub fn is_legal(from: CncState, to: CncState) -> bool {
    use CncState::*;

    if from == to {
        return true;
    }

    match (from, to) {
        // Stop and fault paths are reachable from everywhere.
        (_, Stopped) | (_, Error) => true,

        (Idle, Running) | (Idle, Jog) | (Idle, Homing) => true,

        // Motion states finish back in IDLE.
        (Running, Idle) | (Jog, Idle) | (Homing, Idle) => true,

        // Only an explicit reset leaves STOPPED or ERROR.
        (Stopped, Idle) | (Error, Idle) => true,

        _ => false,
    }
}

/// Checks a transition and produces the rejection the command executor
/// hands back to the caller. State is untouched on rejection.
pub fn check_transition(from: CncState, to: CncState) -> Result<(), CommandError> {
    if is_legal(from, to) {
        Ok(())
    } else {
        Err(CommandError::invalid_state(
            from,
            format!("transition to {} is not permitted", to),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CncState::*;

    const ALL: [CncState; 6] = [Idle, Running, Jog, Homing, Stopped, Error];

    #[test]
    fn idle_reaches_motion_states() {
        assert!(is_legal(Idle, Running));
        assert!(is_legal(Idle, Jog));
        assert!(is_legal(Idle, Homing));
    }

    #[test]
    fn motion_states_finish_in_idle() {
        assert!(is_legal(Running, Idle));
        assert!(is_legal(Jog, Idle));
        assert!(is_legal(Homing, Idle));
    }

    #[test]
    fn every_state_can_stop_or_fault() {
        for from in ALL {
            assert!(is_legal(from, Stopped), "{from} -> STOPPED");
            assert!(is_legal(from, Error), "{from} -> ERROR");
        }
    }

    #[test]
    fn stopped_and_error_only_exit_to_idle() {
        for to in [Running, Jog, Homing] {
            assert!(!is_legal(Stopped, to), "STOPPED -> {to}");
            assert!(!is_legal(Error, to), "ERROR -> {to}");
        }
        assert!(is_legal(Stopped, Idle));
        assert!(is_legal(Error, Idle));
    }

    #[test]
    fn motion_states_do_not_cross_over() {
        assert!(!is_legal(Running, Jog));
        assert!(!is_legal(Jog, Running));
        assert!(!is_legal(Homing, Running));
        assert!(!is_legal(Jog, Homing));
    }

    #[test]
    fn self_transition_is_always_legal() {
        for state in ALL {
            assert!(is_legal(state, state));
        }
    }

    #[test]
    fn rejection_names_the_current_state() {
        let err = check_transition(Error, Running).unwrap_err();
        match err {
            crate::models::CommandError::InvalidState { state, .. } => assert_eq!(state, Error),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
