//! Device states and the precondition table
//!
//! Every public entry point of the state machine names an [`Operation`] and
//! asks [`check`] whether the current [`DeviceState`] permits it before doing
//! anything else. A rejected call has no side effects.

use crate::error::DriverError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Uninitialized,
    Matched,
    Configured,
    PipesOpen,
    Enabled,
    Disabled,
    Closing,
    Closed,
}

impl DeviceState {
    /// States in which pipes exist and are usable
    pub fn has_pipes(self) -> bool {
        matches!(
            self,
            DeviceState::PipesOpen | DeviceState::Enabled | DeviceState::Disabled
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Entry points subject to the precondition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Match,
    Configure,
    OpenPipes,
    BringUp,
    BringDown,
    Transmit,
    Control,
    Detach,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Match => "match",
            Operation::Configure => "configure",
            Operation::OpenPipes => "open pipes",
            Operation::BringUp => "bring up",
            Operation::BringDown => "bring down",
            Operation::Transmit => "transmit",
            Operation::Control => "control transfer",
            Operation::Detach => "detach",
        };
        f.write_str(s)
    }
}

/// Precondition table
pub fn check(state: DeviceState, op: Operation) -> Result<(), DriverError> {
    use DeviceState::*;

    let permitted = match op {
        Operation::Match => state == Uninitialized,
        Operation::Configure => state == Matched,
        Operation::OpenPipes => state == Configured,
        Operation::BringUp => matches!(state, PipesOpen | Disabled),
        Operation::BringDown => state == Enabled,
        Operation::Transmit => state == Enabled,
        Operation::Control => state.has_pipes(),
        Operation::Detach => true,
    };

    if permitted {
        return Ok(());
    }

    match (op, state) {
        (Operation::BringUp, Uninitialized | Matched | Configured) => {
            Err(DriverError::NotReady(state))
        }
        (Operation::Transmit, _) => Err(DriverError::NotReady(state)),
        _ => Err(DriverError::InvalidState {
            operation: op,
            state,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [DeviceState; 8] = [
        DeviceState::Uninitialized,
        DeviceState::Matched,
        DeviceState::Configured,
        DeviceState::PipesOpen,
        DeviceState::Enabled,
        DeviceState::Disabled,
        DeviceState::Closing,
        DeviceState::Closed,
    ];

    #[test]
    fn test_bring_up_table() {
        for state in ALL_STATES {
            let result = check(state, Operation::BringUp);
            match state {
                DeviceState::PipesOpen | DeviceState::Disabled => assert!(result.is_ok()),
                DeviceState::Uninitialized | DeviceState::Matched | DeviceState::Configured => {
                    assert_eq!(result, Err(DriverError::NotReady(state)))
                }
                _ => assert!(matches!(result, Err(DriverError::InvalidState { .. }))),
            }
        }
    }

    #[test]
    fn test_transmit_only_when_enabled() {
        for state in ALL_STATES {
            let result = check(state, Operation::Transmit);
            if state == DeviceState::Enabled {
                assert!(result.is_ok());
            } else {
                assert_eq!(result, Err(DriverError::NotReady(state)));
            }
        }
    }

    #[test]
    fn test_detach_always_permitted() {
        for state in ALL_STATES {
            assert!(check(state, Operation::Detach).is_ok());
        }
    }

    #[test]
    fn test_bring_down_requires_enabled() {
        assert!(check(DeviceState::Enabled, Operation::BringDown).is_ok());
        assert_eq!(
            check(DeviceState::Disabled, Operation::BringDown),
            Err(DriverError::InvalidState {
                operation: Operation::BringDown,
                state: DeviceState::Disabled
            })
        );
    }
}
