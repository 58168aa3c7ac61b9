use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

pub type CommandResult = Result<CommandResponse, CommandError>;

/// Run state of the machine. Exactly one is active at any time.
///
/// The wire encoding is the numeric code the dashboard switches on:
/// 0=IDLE, 1=RUNNING, 2=JOG, 3=HOMING, 4=STOPPED, 5=ERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CncState {
    Idle = 0,
    Running = 1,
    Jog = 2,
    Homing = 3,
    Stopped = 4,
    Error = 5,
}

impl CncState {
    pub fn from_code(code: u8) -> Option<CncState> {
        match code {
            0 => Some(CncState::Idle),
            1 => Some(CncState::Running),
            2 => Some(CncState::Jog),
            3 => Some(CncState::Homing),
            4 => Some(CncState::Stopped),
            5 => Some(CncState::Error),
            _ => None,
        }
    }
}

impl Serialize for CncState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for CncState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let code = u8::deserialize(deserializer)?;
        CncState::from_code(code).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid machine state code {}", code))
        })
    }
}

impl std::fmt::Display for CncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CncState::Idle => "IDLE",
            CncState::Running => "RUNNING",
            CncState::Jog => "JOG",
            CncState::Homing => "HOMING",
            CncState::Stopped => "STOPPED",
            CncState::Error => "ERROR",
        };
        write!(f, "{}", name)
    }
}

pub mod error_id {
    pub const NONE: u16 = 0;
    pub const ESTOP: u16 = 1;
    pub const LIMIT_FAULT: u16 = 2;
    pub const MOTION_TIMEOUT: u16 = 3;
    pub const HOMING_FAILED: u16 = 4;
    pub const JOB_FILE_FAULT: u16 = 5;
}

/// Canonical machine status record. Mutated only by the command executor,
/// the safety monitor and the motion tasks; read by the broadcaster and the
/// HTTP query endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineState {
    pub state: CncState,
    pub is_paused: bool,
    pub is_homed: bool,

    pub current_x: f32,
    pub current_y: f32,

    pub current_project: String,
    pub current_line: u32,
    pub total_lines: u32,
    pub job_progress: f32,
    /// Active job run time in milliseconds. Frozen while paused.
    pub job_run_time: u64,

    #[serde(rename = "errorID")]
    pub error_id: u16,

    pub estop_on: bool,
    pub limit_x_on: bool,
    pub limit_y_on: bool,
    pub hot_wire_on: bool,
    pub fan_on: bool,
    pub hot_wire_power: f32,
    pub fan_power: f32,
}

impl Default for MachineState {
    fn default() -> Self {
        MachineState {
            state: CncState::Idle,
            is_paused: false,
            is_homed: false,
            current_x: 0.0,
            current_y: 0.0,
            current_project: String::new(),
            current_line: 0,
            total_lines: 0,
            job_progress: 0.0,
            job_run_time: 0,
            error_id: error_id::NONE,
            estop_on: false,
            limit_x_on: false,
            limit_y_on: false,
            hot_wire_on: false,
            fan_on: false,
            hot_wire_power: 0.0,
            fan_power: 0.0,
        }
    }
}

impl MachineState {
    pub fn is_busy(&self) -> bool {
        matches!(
            self.state,
            CncState::Running | CncState::Jog | CncState::Homing
        )
    }

    /// Clears everything tied to motion and the active job. Used by reset.
    pub fn clear_for_reset(&mut self) {
        self.state = CncState::Idle;
        self.is_paused = false;
        self.error_id = error_id::NONE;
        self.hot_wire_on = false;
        self.fan_on = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedMode {
    Work,
    Rapid,
}

impl FromStr for SpeedMode {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "work" => Ok(SpeedMode::Work),
            "rapid" => Ok(SpeedMode::Rapid),
            other => Err(CommandError::InvalidParameter(format!(
                "unknown speed mode '{}'",
                other
            ))),
        }
    }
}

/// One operator request, created per HTTP call and consumed by the
/// command executor.
#[derive(Debug, Clone)]
pub enum Command {
    Jog {
        dx: f32,
        dy: f32,
        speed_mode: SpeedMode,
    },
    Home,
    Zero,
    Start,
    Pause,
    Stop,
    Reset,
    SetWire {
        on: bool,
    },
    SetFan {
        on: bool,
    },
    EmergencyStop,
    SelectProject {
        file: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    Success,
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("command not allowed in state {state}: {reason}")]
    InvalidState { state: CncState, reason: String },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("no project selected")]
    NoProjectSelected,
    #[error("hardware fault {error_id}: {message}")]
    HardwareFault { error_id: u16, message: String },
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
}

impl CommandError {
    pub fn invalid_state(state: CncState, reason: impl Into<String>) -> Self {
        CommandError::InvalidState {
            state,
            reason: reason.into(),
        }
    }
}

#[derive(Debug)]
pub struct CommandEnvelope {
    pub command: Command,
    pub response: oneshot::Sender<CommandResult>,
}

impl CommandEnvelope {
    pub fn new(command: Command) -> (Self, oneshot::Receiver<CommandResult>) {
        let (tx, rx) = oneshot::channel();
        (
            CommandEnvelope {
                command,
                response: tx,
            },
            rx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_match_the_dashboard() {
        let expected = [
            (CncState::Idle, 0),
            (CncState::Running, 1),
            (CncState::Jog, 2),
            (CncState::Homing, 3),
            (CncState::Stopped, 4),
            (CncState::Error, 5),
        ];
        for (state, code) in expected {
            assert_eq!(serde_json::to_value(state).unwrap(), serde_json::json!(code));
            assert_eq!(CncState::from_code(code), Some(state));
        }
        assert_eq!(CncState::from_code(6), None);
        assert!(serde_json::from_value::<CncState>(serde_json::json!(6)).is_err());
    }

    #[test]
    fn status_wire_uses_numeric_state_and_error_id_key() {
        let mut machine = MachineState::default();
        machine.state = CncState::Running;
        machine.error_id = error_id::MOTION_TIMEOUT;

        let wire = serde_json::to_value(&machine).unwrap();
        assert_eq!(wire["state"], 1);
        assert_eq!(wire["errorID"], 3);
        assert!(wire.get("errorId").is_none());
        assert_eq!(wire["isPaused"], false);
        assert_eq!(wire["currentX"], 0.0);
    }
}
