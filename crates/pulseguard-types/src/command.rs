//! Operator command channel.

use serde::{Deserialize, Serialize};

/// Commands an operator-facing collaborator may issue to the safety core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OperatorCommand {
    Arm,
    Start { protocol_id: String },
    Stop,
    Pause,
    Resume,
    EmergencyStop,
    ClearFault,
    ClearEmergency,
}

impl OperatorCommand {
    /// Short verb used in logs and rejection messages.
    pub fn verb(&self) -> &'static str {
        match self {
            OperatorCommand::Arm => "arm",
            OperatorCommand::Start { .. } => "start",
            OperatorCommand::Stop => "stop",
            OperatorCommand::Pause => "pause",
            OperatorCommand::Resume => "resume",
            OperatorCommand::EmergencyStop => "emergency stop",
            OperatorCommand::ClearFault => "clear fault",
            OperatorCommand::ClearEmergency => "clear emergency",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_command_roundtrip() {
        let cmd = OperatorCommand::Start {
            protocol_id: "sweep".into(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"command\":\"start\""));
        let back: OperatorCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn unit_commands_parse_from_tag() {
        let cmd: OperatorCommand = serde_json::from_str(r#"{"command":"emergency_stop"}"#).unwrap();
        assert_eq!(cmd, OperatorCommand::EmergencyStop);
        assert_eq!(cmd.verb(), "emergency stop");
    }
}
