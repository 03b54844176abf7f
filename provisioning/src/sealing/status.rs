// Licensed under the Apache-2.0 license

use bkps_error::{raise_err, BkpsResult};
use serde_derive::{Deserialize, Serialize};
use smlang::statemachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SealingKeyStatus {
    Pending,
    Enabled,
    Disabled,
}

statemachine! {
    transitions: {
        // CurrentState Event = NextState
        *Absent + CreatePending = Pending,
        Absent + CreateActive = Enabled,
        Pending + Activate = Enabled,
        Pending + Disable = Disabled,
        Enabled + Disable = Disabled,
    }
}

/// No guards or actions, transitions only.
struct Lifecycle;

impl StateMachineContext for Lifecycle {}

impl From<SealingKeyStatus> for States {
    fn from(status: SealingKeyStatus) -> Self {
        match status {
            SealingKeyStatus::Pending => States::Pending,
            SealingKeyStatus::Enabled => States::Enabled,
            SealingKeyStatus::Disabled => States::Disabled,
        }
    }
}

/// Lifecycle events of a sealing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealingKeyEvent {
    CreatePending,
    CreateActive,
    Activate,
    Disable,
}

impl From<SealingKeyEvent> for Events {
    fn from(event: SealingKeyEvent) -> Self {
        match event {
            SealingKeyEvent::CreatePending => Events::CreatePending,
            SealingKeyEvent::CreateActive => Events::CreateActive,
            SealingKeyEvent::Activate => Events::Activate,
            SealingKeyEvent::Disable => Events::Disable,
        }
    }
}

/// Status after `event` is applied to a key in `current`, `None` meaning
/// the key does not exist yet.
pub fn next_status(
    current: Option<SealingKeyStatus>,
    event: SealingKeyEvent,
) -> BkpsResult<SealingKeyStatus> {
    let mut sm = match current {
        Some(status) => StateMachine::new_with_state(Lifecycle, status.into()),
        None => StateMachine::new(Lifecycle),
    };
    let next = match sm.process_event(event.into()) {
        Ok(States::Pending) => SealingKeyStatus::Pending,
        Ok(States::Enabled) => SealingKeyStatus::Enabled,
        Ok(States::Disabled) => SealingKeyStatus::Disabled,
        Ok(States::Absent) | Err(_) => raise_err!(
            SEALING_KEY_INVALID_TRANSITION,
            "Sealing key cannot go from {current:?} on {event:?}."
        ),
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bkps_error::ErrorKind;

    #[test]
    fn test_lifecycle() {
        let pending = next_status(None, SealingKeyEvent::CreatePending).unwrap();
        assert_eq!(pending, SealingKeyStatus::Pending);
        let enabled = next_status(Some(pending), SealingKeyEvent::Activate).unwrap();
        assert_eq!(enabled, SealingKeyStatus::Enabled);
        assert_eq!(
            next_status(Some(enabled), SealingKeyEvent::Disable).unwrap(),
            SealingKeyStatus::Disabled
        );
        assert_eq!(
            next_status(Some(SealingKeyStatus::Pending), SealingKeyEvent::Disable).unwrap(),
            SealingKeyStatus::Disabled
        );
        assert_eq!(
            next_status(None, SealingKeyEvent::CreateActive).unwrap(),
            SealingKeyStatus::Enabled
        );
    }

    #[test]
    fn test_rejected_transitions() {
        for (current, event) in [
            (Some(SealingKeyStatus::Disabled), SealingKeyEvent::Activate),
            (Some(SealingKeyStatus::Enabled), SealingKeyEvent::Activate),
            (Some(SealingKeyStatus::Disabled), SealingKeyEvent::Disable),
            (None, SealingKeyEvent::Disable),
        ] {
            assert_eq!(
                next_status(current, event).unwrap_err().kind(),
                ErrorKind::SEALING_KEY_INVALID_TRANSITION
            );
        }
    }
}
