//! Locate-missing-face flow, modeled as an explicit state machine.
//!
//! The UI drives this with discrete events; there are no ad hoc booleans to
//! fall out of sync. Detection and persistence happen elsewhere (the
//! service); this tracks only where the flow stands.

use kindred_core::types::FaceBoxId;

/// Why a locate attempt failed, as surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateFailure {
    /// Retryable: tap somewhere else or adjust zoom.
    NoFaceFound,
    /// A face already exists at that location.
    DuplicateRegion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocateState {
    #[default]
    Idle,
    AwaitingTap,
    /// A tap landed; detection is running.
    Detecting,
    /// A face was found; its box is being written and the label picker
    /// will open for it.
    Applying(FaceBoxId),
    Error(LocateFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateEvent {
    /// User entered locate mode.
    Enter,
    /// User tapped the photo.
    Tap,
    /// Detection produced a box.
    FaceFound(FaceBoxId),
    Failed(LocateFailure),
    /// The box write finished and the picker opened.
    Applied,
    /// User dismissed the error (back to tapping) or left the mode.
    Dismiss,
    Exit,
}

impl LocateState {
    /// Advance the flow. Events that make no sense in the current state
    /// leave it unchanged; a stale detection result after the user exits
    /// must not revive the flow.
    pub fn on(self, event: LocateEvent) -> LocateState {
        use LocateEvent as E;
        use LocateState as S;

        match (self, event) {
            (S::Idle, E::Enter) => S::AwaitingTap,
            (S::AwaitingTap, E::Tap) => S::Detecting,
            (S::Detecting, E::FaceFound(id)) => S::Applying(id),
            (S::Detecting, E::Failed(failure)) => S::Error(failure),
            (S::Applying(_), E::Applied) => S::AwaitingTap,
            (S::Error(_), E::Dismiss) => S::AwaitingTap,
            (_, E::Exit) => S::Idle,
            (state, _) => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let id = FaceBoxId::new();
        let mut state = LocateState::default();
        state = state.on(LocateEvent::Enter);
        assert_eq!(state, LocateState::AwaitingTap);
        state = state.on(LocateEvent::Tap);
        assert_eq!(state, LocateState::Detecting);
        state = state.on(LocateEvent::FaceFound(id));
        assert_eq!(state, LocateState::Applying(id));
        state = state.on(LocateEvent::Applied);
        // Ready for the next tap without re-entering the mode.
        assert_eq!(state, LocateState::AwaitingTap);
    }

    #[test]
    fn test_failure_is_dismissable_and_retryable() {
        let state = LocateState::Detecting.on(LocateEvent::Failed(LocateFailure::NoFaceFound));
        assert_eq!(state, LocateState::Error(LocateFailure::NoFaceFound));
        assert_eq!(state.on(LocateEvent::Dismiss), LocateState::AwaitingTap);
    }

    #[test]
    fn test_stale_result_after_exit_is_ignored() {
        let state = LocateState::Detecting.on(LocateEvent::Exit);
        assert_eq!(state, LocateState::Idle);
        // The detection that was in flight resolves late; nothing happens.
        assert_eq!(
            state.on(LocateEvent::FaceFound(FaceBoxId::new())),
            LocateState::Idle
        );
    }

    #[test]
    fn test_double_tap_while_detecting_is_inert() {
        let state = LocateState::Detecting.on(LocateEvent::Tap);
        assert_eq!(state, LocateState::Detecting);
    }
}
