//! VM lifecycle state types.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::ToSchema;

use crate::error::Error;

/// VM lifecycle states, as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Domain is running.
    Running,

    /// Domain is defined but not running.
    #[serde(rename = "shutoff")]
    ShutOff,

    /// Domain is suspended in memory.
    Paused,

    /// Domain terminated abnormally.
    Crashed,
}

impl VmState {
    /// Check if the VM is currently running.
    pub fn is_running(&self) -> bool {
        matches!(self, VmState::Running)
    }

    /// Check if the VM is fully stopped.
    pub fn is_shut_off(&self) -> bool {
        matches!(self, VmState::ShutOff)
    }

    /// Check if the VM can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, VmState::ShutOff | VmState::Crashed)
    }

    /// Check if the VM can be stopped or rebooted.
    pub fn can_stop(&self) -> bool {
        matches!(self, VmState::Running)
    }

    /// Check if devices may be attached or detached (hot or cold).
    pub fn accepts_devices(&self) -> bool {
        matches!(self, VmState::Running | VmState::ShutOff)
    }

    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            VmState::Running => "running",
            VmState::ShutOff => "shutoff",
            VmState::Paused => "paused",
            VmState::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A state-changing lifecycle action accepted by `POST /vms/:id/action`.
///
/// Delete is not listed here; it has its own endpoint and cascade rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    /// ShutOff/Crashed -> Running.
    Start,
    /// Running -> ShutOff.
    Stop,
    /// Running -> Running.
    Reboot,
    /// Running -> Paused.
    Pause,
    /// Paused -> Running.
    Resume,
}

impl LifecycleAction {
    /// Check whether the action is legal from `state`.
    pub fn allowed_from(&self, state: VmState) -> bool {
        match self {
            LifecycleAction::Start => state.can_start(),
            LifecycleAction::Stop | LifecycleAction::Reboot | LifecycleAction::Pause => {
                state.can_stop()
            }
            LifecycleAction::Resume => matches!(state, VmState::Paused),
        }
    }

    /// State the VM is in once the driver confirms the action.
    pub fn target_state(&self) -> VmState {
        match self {
            LifecycleAction::Start | LifecycleAction::Reboot | LifecycleAction::Resume => {
                VmState::Running
            }
            LifecycleAction::Stop => VmState::ShutOff,
            LifecycleAction::Pause => VmState::Paused,
        }
    }

    /// Human description of the states the action accepts.
    pub fn expected_states(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "shutoff or crashed",
            LifecycleAction::Stop | LifecycleAction::Reboot | LifecycleAction::Pause => "running",
            LifecycleAction::Resume => "paused",
        }
    }

    /// Get the action name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Reboot => "reboot",
            LifecycleAction::Pause => "pause",
            LifecycleAction::Resume => "resume",
        }
    }
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LifecycleAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "start" => Ok(LifecycleAction::Start),
            "stop" | "shutdown" => Ok(LifecycleAction::Stop),
            "reboot" | "restart" => Ok(LifecycleAction::Reboot),
            "pause" | "suspend" => Ok(LifecycleAction::Pause),
            "resume" => Ok(LifecycleAction::Resume),
            other => Err(Error::validation(format!(
                "unknown action '{}': expected start, stop, reboot, pause or resume",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_state_predicates() {
        // (state, can_start, can_stop, accepts_devices)
        let cases = [
            (VmState::Running, false, true, true),
            (VmState::ShutOff, true, false, true),
            (VmState::Paused, false, false, false),
            (VmState::Crashed, true, false, false),
        ];

        for (state, start, stop, devices) in cases {
            assert_eq!(state.can_start(), start, "{:?}.can_start()", state);
            assert_eq!(state.can_stop(), stop, "{:?}.can_stop()", state);
            assert_eq!(state.accepts_devices(), devices, "{:?}.accepts_devices()", state);
        }
    }

    #[test]
    fn test_action_transitions() {
        use LifecycleAction::*;

        assert!(Start.allowed_from(VmState::ShutOff));
        assert!(Start.allowed_from(VmState::Crashed));
        assert!(!Start.allowed_from(VmState::Running));
        assert!(Stop.allowed_from(VmState::Running));
        assert!(!Stop.allowed_from(VmState::Paused));
        assert!(Reboot.allowed_from(VmState::Running));
        assert!(!Reboot.allowed_from(VmState::ShutOff));
        assert!(Resume.allowed_from(VmState::Paused));
        assert!(!Resume.allowed_from(VmState::Running));

        assert_eq!(Start.target_state(), VmState::Running);
        assert_eq!(Stop.target_state(), VmState::ShutOff);
        assert_eq!(Reboot.target_state(), VmState::Running);
        assert_eq!(Pause.target_state(), VmState::Paused);
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("start".parse::<LifecycleAction>().unwrap(), LifecycleAction::Start);
        assert_eq!("REBOOT".parse::<LifecycleAction>().unwrap(), LifecycleAction::Reboot);
        assert_eq!("shutdown".parse::<LifecycleAction>().unwrap(), LifecycleAction::Stop);
        assert!(matches!(
            "delete".parse::<LifecycleAction>(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(serde_json::to_string(&VmState::ShutOff).unwrap(), "\"shutoff\"");
        let state: VmState = serde_json::from_str("\"crashed\"").unwrap();
        assert_eq!(state, VmState::Crashed);
    }
}
