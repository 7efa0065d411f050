//! Machine state owned by the orchestrator.

use crate::coordinates::PhysicalPosition;
use serde::Serialize;

/// Lifecycle state of the gantry as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum MachineStatus {
    /// No link to the controller.
    #[default]
    Disconnected,
    /// Link open, position not referenced.
    Connected,
    /// Homing cycle completed, mode setup pending.
    Homed,
    /// Homed and ready for motion.
    Idle,
    /// A motion command is in flight.
    Moving,
    /// Feed hold after an emergency stop.
    Hold,
    /// Controller fault; requires reset.
    Alarm,
    /// Outcome of the last command is unknown; requires a status refresh.
    Unknown,
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MachineStatus::Disconnected => "Disconnected",
            MachineStatus::Connected => "Connected",
            MachineStatus::Homed => "Homed",
            MachineStatus::Idle => "Idle",
            MachineStatus::Moving => "Moving",
            MachineStatus::Hold => "Hold",
            MachineStatus::Alarm => "Alarm",
            MachineStatus::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

impl MachineStatus {
    /// True in states that accept a motion request.
    pub fn accepts_motion(self) -> bool {
        matches!(self, MachineStatus::Homed | MachineStatus::Idle)
    }
}

/// Current machine state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MachineState {
    /// Lifecycle state.
    pub status: MachineStatus,
    /// Last verified position (mm).
    pub position: PhysicalPosition,
    /// True once a homing cycle has succeeded on this connection.
    pub homed: bool,
    /// Description of the most recent failure.
    pub last_error: Option<String>,
}

/// Point-in-time copy of the machine state handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    /// Lifecycle state.
    pub status: MachineStatus,
    /// Last verified position (mm).
    pub position: PhysicalPosition,
    /// Cell under the tool head, once homed.
    pub cell: Option<String>,
    /// True once homed on this connection.
    pub homed: bool,
    /// Description of the most recent failure.
    pub last_error: Option<String>,
}

impl std::fmt::Display for StateSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.status, self.position)?;
        if let Some(cell) = &self.cell {
            write!(f, " [{}]", cell)?;
        }
        if let Some(error) = &self.last_error {
            write!(f, " (last error: {})", error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_disconnected() {
        let state = MachineState::default();
        assert_eq!(state.status, MachineStatus::Disconnected);
        assert!(!state.homed);
        assert_eq!(state.position, PhysicalPosition::ORIGIN);
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = StateSnapshot {
            status: MachineStatus::Idle,
            position: PhysicalPosition::new(25.0, 25.0),
            cell: Some("A1".into()),
            homed: true,
            last_error: None,
        };
        assert_eq!(snapshot.to_string(), "Idle at (25.000, 25.000) [A1]");
    }
}
