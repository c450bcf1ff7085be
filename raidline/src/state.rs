//! Controller lifecycle states and the transition function.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ControllerState {
    /// Not yet started, or quiesced after shutdown.
    #[default]
    Unknown,
    /// Reset announced to the firmware; submissions are held off.
    ResetAlert,
    HardReset,
    SoftReset,
    /// Renegotiating transport and capabilities after a reset.
    BringUp,
    Operational,
    /// Reset budget exhausted. Terminal.
    Dead,
    /// Graceful shutdown in progress.
    BringDown,
}

impl ControllerState {
    pub const ALL: [ControllerState; 8] = [
        ControllerState::Unknown,
        ControllerState::ResetAlert,
        ControllerState::HardReset,
        ControllerState::SoftReset,
        ControllerState::BringUp,
        ControllerState::Operational,
        ControllerState::Dead,
        ControllerState::BringDown,
    ];

    pub fn accepts_submissions(self) -> bool {
        self == ControllerState::Operational
    }

    /// One of the reset stages.
    pub fn is_resetting(self) -> bool {
        matches!(
            self,
            ControllerState::ResetAlert
                | ControllerState::HardReset
                | ControllerState::SoftReset
                | ControllerState::BringUp
        )
    }
}

/// Inputs to [`transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Start,
    ResetRequested,
    FatalError,
    AlertCleared,
    AlertTimedOut,
    SoftResetSelected,
    ResetSucceeded,
    ResetFailed,
    RetriesExhausted,
    BringUpComplete,
    BringUpFailed,
    ShutdownRequested,
    Quiesced,
}

impl Event {
    pub const ALL: [Event; 13] = [
        Event::Start,
        Event::ResetRequested,
        Event::FatalError,
        Event::AlertCleared,
        Event::AlertTimedOut,
        Event::SoftResetSelected,
        Event::ResetSucceeded,
        Event::ResetFailed,
        Event::RetriesExhausted,
        Event::BringUpComplete,
        Event::BringUpFailed,
        Event::ShutdownRequested,
        Event::Quiesced,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal transition: {event:?} in {from:?}")]
pub struct IllegalTransition {
    pub from: ControllerState,
    pub event: Event,
}

/// The complete edge set. Anything not listed is rejected.
pub fn transition(
    from: ControllerState,
    event: Event,
) -> Result<ControllerState, IllegalTransition> {
    use ControllerState::*;
    use Event::*;

    let to = match (from, event) {
        (Unknown, Start | ResetRequested) => ResetAlert,
        (ResetAlert, AlertCleared | AlertTimedOut) => HardReset,
        (HardReset, ResetFailed) => HardReset,
        (HardReset, RetriesExhausted) => Dead,
        (HardReset, SoftResetSelected) => SoftReset,
        (HardReset, ResetSucceeded) => BringUp,
        (SoftReset, ResetSucceeded) => BringUp,
        (SoftReset, ResetFailed) => HardReset,
        (BringUp, BringUpComplete) => Operational,
        (BringUp, BringUpFailed) => HardReset,
        (Operational, FatalError | ResetRequested) => ResetAlert,
        (Operational, ShutdownRequested) => BringDown,
        (BringDown, Quiesced) => Unknown,
        _ => return Err(IllegalTransition { from, event }),
    };
    Ok(to)
}

/// Reason a reset sequence was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// First bring-up.
    Start,
    /// Error or unit-check interrupt.
    Fatal,
    /// Heartbeat watchdog.
    Lockup,
    /// An abort-by-tag did not complete.
    AbortTimeout,
    /// Explicit caller request.
    Requested,
}

impl ResetReason {
    /// Event that starts the sequence from `Operational`.
    pub fn event(self) -> Event {
        match self {
            ResetReason::Fatal => Event::FatalError,
            _ => Event::ResetRequested,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};

    use super::*;

    #[test]
    fn lifecycle_happy_path() {
        let mut s = ControllerState::Unknown;
        for event in [
            Event::Start,
            Event::AlertCleared,
            Event::ResetSucceeded,
            Event::BringUpComplete,
            Event::ShutdownRequested,
            Event::Quiesced,
        ] {
            s = transition(s, event).unwrap();
        }
        assert_eq!(s, ControllerState::Unknown);
    }

    #[test]
    fn soft_reset_path() {
        let s = transition(ControllerState::HardReset, Event::SoftResetSelected).unwrap();
        assert_eq!(s, ControllerState::SoftReset);
        assert_eq!(
            transition(s, Event::ResetFailed).unwrap(),
            ControllerState::HardReset
        );
        assert_eq!(
            transition(s, Event::ResetSucceeded).unwrap(),
            ControllerState::BringUp
        );
    }

    #[test]
    fn dead_is_terminal() {
        for event in Event::ALL {
            assert!(transition(ControllerState::Dead, event).is_err());
        }
    }

    #[test]
    fn exactly_the_listed_edges_are_legal() {
        let legal: usize = ControllerState::ALL
            .iter()
            .flat_map(|&s| Event::ALL.iter().map(move |&e| transition(s, e)))
            .filter(Result::is_ok)
            .count();
        // 13 edges, three of which accept two events.
        assert_eq!(legal, 16);

        let err = transition(ControllerState::Operational, Event::ResetSucceeded).unwrap_err();
        assert_eq!(err.from, ControllerState::Operational);
        assert_eq!(err.event, Event::ResetSucceeded);
    }

    #[test]
    fn every_state_reaches_operational_or_dead() {
        for start in ControllerState::ALL {
            let mut seen = HashSet::new();
            let mut queue = VecDeque::from([start]);
            let mut settled = false;
            while let Some(s) = queue.pop_front() {
                if matches!(s, ControllerState::Operational | ControllerState::Dead) {
                    settled = true;
                    break;
                }
                if !seen.insert(s) {
                    continue;
                }
                queue.extend(Event::ALL.iter().filter_map(|&e| transition(s, e).ok()));
            }
            assert!(settled, "{start:?} cannot settle");
        }
    }

    #[test]
    fn only_operational_accepts_submissions() {
        for s in ControllerState::ALL {
            assert_eq!(s.accepts_submissions(), s == ControllerState::Operational);
        }
        assert!(ControllerState::BringUp.is_resetting());
        assert!(!ControllerState::BringDown.is_resetting());
    }
}
