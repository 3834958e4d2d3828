//! Relay wire protocol
//!
//! Every frame is one JSON object `{"event": "<kebab-name>", "data": {...}}`.
//! Clients and agents share the same vocabulary.

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::sandbox::SessionId;

/// Relay-assigned identity of one WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Binary payload carried as a base64 string on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Binary(pub Vec<u8>);

impl Binary {
    /// Whether the payload has no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Binary {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Serialize for Binary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Binary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// Frames sent by clients and agents to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum RelayCommand {
    /// Enter a session's room
    Join {
        /// Room to join
        session_id: SessionId,
    },
    /// Leave a session's room
    Leave {
        /// Room to leave
        session_id: SessionId,
    },
    /// The agent is connected
    AgentReady {
        /// Session the agent serves
        session_id: SessionId,
    },
    /// The agent's interactive shell is running
    ShellReady {
        /// Session the agent serves
        session_id: SessionId,
    },
    /// Run a command in the sandbox
    CommandInput {
        /// Target sandbox
        session_id: SessionId,
        /// Shell command line
        command: String,
    },
    /// Write a file inside the sandbox
    SendFile {
        /// Target sandbox
        session_id: SessionId,
        /// Destination path relative to the agent's work root
        path: String,
        /// File content
        content: String,
    },
    /// Extract an archive inside the sandbox
    SendZip {
        /// Target sandbox
        #[serde(default)]
        session_id: Option<SessionId>,
        /// Zip archive bytes
        #[serde(default)]
        bytes: Option<Binary>,
        /// Extraction directory relative to the agent's work root
        #[serde(default)]
        dest_path: String,
    },
    /// A chunk of shell output from an agent
    Output {
        /// Stream the chunk came from
        #[serde(rename = "type")]
        kind: OutputKind,
        /// Output text
        data: String,
    },
}

impl RelayCommand {
    /// Event name as it appears on the wire
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::AgentReady { .. } => "agent-ready",
            Self::ShellReady { .. } => "shell-ready",
            Self::CommandInput { .. } => "command-input",
            Self::SendFile { .. } => "send-file",
            Self::SendZip { .. } => "send-zip",
            Self::Output { .. } => "output",
        }
    }
}

/// Frames sent by the relay to clients and agents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum RelayEvent {
    /// The sandbox's agent is connected
    AgentReady,
    /// The sandbox's shell is ready for input
    ShellReady,
    /// Another connection joined the room
    ClientJoined {
        /// The joining connection
        client_id: ConnectionId,
    },
    /// Shell or command output
    Output {
        /// Stream the chunk came from
        #[serde(rename = "type")]
        kind: OutputKind,
        /// Output text
        data: String,
    },
    /// A file to write inside the sandbox
    FileReceived {
        /// Destination path relative to the work root
        path: String,
        /// File content
        content: String,
    },
    /// An archive to extract inside the sandbox
    ZipReceived {
        /// Zip archive bytes
        bytes: Binary,
        /// Extraction directory relative to the work root
        dest_path: String,
    },
}

impl RelayEvent {
    /// Stdout chunk
    #[must_use]
    pub fn stdout(data: impl Into<String>) -> Self {
        Self::Output {
            kind: OutputKind::Stdout,
            data: data.into(),
        }
    }

    /// Stderr chunk
    #[must_use]
    pub fn stderr(data: impl Into<String>) -> Self {
        Self::Output {
            kind: OutputKind::Stderr,
            data: data.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_input_wire_format() -> Result<(), serde_json::Error> {
        let frame = json!({
            "event": "command-input",
            "data": {"sessionId": "s1", "command": "ls -la"}
        });
        let command: RelayCommand = serde_json::from_value(frame)?;
        assert_eq!(
            command,
            RelayCommand::CommandInput {
                session_id: SessionId::from("s1"),
                command: "ls -la".to_string(),
            }
        );
        Ok(())
    }

    #[test]
    fn test_send_zip_fields_are_optional() -> Result<(), serde_json::Error> {
        let frame = json!({"event": "send-zip", "data": {"destPath": "site"}});
        let command: RelayCommand = serde_json::from_value(frame)?;
        let RelayCommand::SendZip {
            session_id, bytes, ..
        } = command
        else {
            panic!("expected send-zip");
        };
        assert!(session_id.is_none());
        assert!(bytes.is_none());
        Ok(())
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let frame = json!({
            "event": "send-zip",
            "data": {"sessionId": "s1", "bytes": "not base64!!", "destPath": ""}
        });
        assert!(serde_json::from_value::<RelayCommand>(frame).is_err());
    }

    #[test]
    fn test_event_wire_format() -> Result<(), serde_json::Error> {
        assert_eq!(
            serde_json::to_value(RelayEvent::AgentReady)?,
            json!({"event": "agent-ready"})
        );
        assert_eq!(
            serde_json::to_value(RelayEvent::stderr("Error: boom\n"))?,
            json!({"event": "output", "data": {"type": "stderr", "data": "Error: boom\n"}})
        );
        assert_eq!(
            serde_json::to_value(RelayEvent::ZipReceived {
                bytes: Binary(b"PK".to_vec()),
                dest_path: "out".to_string(),
            })?,
            json!({"event": "zip-received", "data": {"bytes": "UEs=", "destPath": "out"}})
        );
        assert_eq!(
            serde_json::to_value(RelayEvent::ClientJoined {
                client_id: ConnectionId::new(7)
            })?,
            json!({"event": "client-joined", "data": {"clientId": 7}})
        );
        Ok(())
    }

    #[test]
    fn test_agent_output_frame() -> Result<(), serde_json::Error> {
        let frame = r#"{"event":"output","data":{"type":"stdout","data":"$ "}}"#;
        let command: RelayCommand = serde_json::from_str(frame)?;
        assert_eq!(command.name(), "output");
        assert!(matches!(
            command,
            RelayCommand::Output {
                kind: OutputKind::Stdout,
                ..
            }
        ));
        Ok(())
    }
}
