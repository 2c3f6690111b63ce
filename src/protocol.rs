//! Wire protocol for the relay channel.
//!
//! Every WebSocket frame carries exactly one JSON object with a required
//! `type` field. The envelope is modeled as a tagged sum type so that adding
//! a message kind is a compile-time decision rather than a silent
//! unknown-branch fallthrough.

use serde::{Deserialize, Serialize};

/// Maximum serialized envelope size (1 MiB). Anything larger is summarized
/// before forwarding; inline file content near this limit must use the
/// filename-reference download path instead.
pub const MAX_ENVELOPE_BYTES: usize = 1024 * 1024;

/// Command literals understood by the agent.
pub const CMD_PING: &str = "ping";
pub const CMD_DOWNLOAD: &str = "download";
pub const CMD_LIST_FILES: &str = "list_files";
pub const CMD_DELETE_FILE: &str = "delete_file";

/// One message unit exchanged between client, server, and agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Client-issued command, fanned out to every connected agent.
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        /// Base64 blob for the inline `download` command.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    /// Agent reply to a command.
    Response {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    /// Server-initiated fetch: the agent pulls `file` from the secure-file
    /// endpoint and persists it locally.
    Download { file: String },
    DownloadComplete { file: String },
    DownloadFailed { file: String, error: String },
    /// Terminal state of an async download, broadcast to clients.
    StatusUpdate { status: String, file: String },
    /// Broadcast on agent connect/disconnect.
    AgentStatus { connected: bool },
    /// Agent-side file listing.
    AgentFiles { files: Vec<String> },
    Error { message: String },
}

impl Envelope {
    /// Wire name of this envelope's `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Command { .. } => "command",
            Envelope::Response { .. } => "response",
            Envelope::Download { .. } => "download",
            Envelope::DownloadComplete { .. } => "download_complete",
            Envelope::DownloadFailed { .. } => "download_failed",
            Envelope::StatusUpdate { .. } => "status_update",
            Envelope::AgentStatus { .. } => "agent_status",
            Envelope::AgentFiles { .. } => "agent_files",
            Envelope::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error {
            message: message.into(),
        }
    }

    pub fn response_ok(message: impl Into<String>) -> Self {
        Envelope::Response {
            status: "ok".to_string(),
            message: Some(message.into()),
            command: None,
        }
    }

    pub fn response_success(message: impl Into<String>) -> Self {
        Envelope::Response {
            status: "success".to_string(),
            message: Some(message.into()),
            command: None,
        }
    }

    pub fn response_error(message: impl Into<String>) -> Self {
        Envelope::Response {
            status: "error".to_string(),
            message: Some(message.into()),
            command: None,
        }
    }

    /// Attach the originating command name to a response so clients can
    /// match replies to requests. No-op for other envelope kinds.
    pub fn with_command(self, command: &str) -> Self {
        match self {
            Envelope::Response {
                status, message, ..
            } => Envelope::Response {
                status,
                message,
                command: Some(command.to_string()),
            },
            other => other,
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize for sending, applying the size ceiling.
    ///
    /// An oversized envelope is replaced by a reduced one carrying only the
    /// original `type` tag, a `truncated` status, and a notice. The original
    /// payload is dropped, never forwarded.
    pub fn encode_frame(&self) -> String {
        let full = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        if full.len() <= MAX_ENVELOPE_BYTES {
            return full;
        }
        serde_json::json!({
            "type": self.type_name(),
            "status": "truncated",
            "message": format!(
                "message of {} bytes exceeded the {} byte limit and was truncated",
                full.len(),
                MAX_ENVELOPE_BYTES
            ),
        })
        .to_string()
    }
}

/// Minimal acknowledgement sent back to an agent for each inbound message.
pub fn ack_frame() -> String {
    serde_json::json!({ "status": "ok" }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        let env = Envelope::Command {
            command: "download".to_string(),
            filename: Some("report.pdf".to_string()),
            content: Some("aGVsbG8=".to_string()),
        };
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"type\":\"command\""));
        let back = Envelope::parse(&text).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn test_type_tags_match_wire_names() {
        let cases = [
            (
                Envelope::Command {
                    command: "ping".into(),
                    filename: None,
                    content: None,
                },
                "command",
            ),
            (
                Envelope::DownloadComplete {
                    file: "a.txt".into(),
                },
                "download_complete",
            ),
            (
                Envelope::AgentStatus { connected: true },
                "agent_status",
            ),
            (
                Envelope::AgentFiles { files: vec![] },
                "agent_files",
            ),
        ];
        for (env, tag) in cases {
            assert_eq!(env.type_name(), tag);
            let val: serde_json::Value =
                serde_json::from_str(&serde_json::to_string(&env).unwrap()).unwrap();
            assert_eq!(val["type"], tag);
        }
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert!(Envelope::parse(r#"{"type":"mystery"}"#).is_err());
        assert!(Envelope::parse("not json").is_err());
        assert!(Envelope::parse(r#"{"command":"ping"}"#).is_err());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let env = Envelope::Command {
            command: "ping".to_string(),
            filename: None,
            content: None,
        };
        let text = serde_json::to_string(&env).unwrap();
        assert_eq!(text, r#"{"type":"command","command":"ping"}"#);
    }

    #[test]
    fn test_with_command_tags_responses_only() {
        let env = Envelope::response_ok("pong").with_command("ping");
        assert_eq!(
            serde_json::to_string(&env).unwrap(),
            r#"{"type":"response","status":"ok","message":"pong","command":"ping"}"#
        );
        let env = Envelope::AgentStatus { connected: true }.with_command("ping");
        assert_eq!(env, Envelope::AgentStatus { connected: true });
    }

    #[test]
    fn test_oversize_envelope_is_summarized() {
        let env = Envelope::Command {
            command: "download".to_string(),
            filename: Some("big.bin".to_string()),
            content: Some("x".repeat(MAX_ENVELOPE_BYTES + 1)),
        };
        let frame = env.encode_frame();
        assert!(frame.len() < 4096);
        let val: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(val["type"], "command");
        assert_eq!(val["status"], "truncated");
        assert!(val["message"].as_str().unwrap().contains("truncated"));
    }

    #[test]
    fn test_small_envelope_kept_verbatim() {
        let env = Envelope::AgentStatus { connected: false };
        assert_eq!(
            env.encode_frame(),
            r#"{"type":"agent_status","connected":false}"#
        );
    }

    #[test]
    fn test_ack_frame_shape() {
        let val: serde_json::Value = serde_json::from_str(&ack_frame()).unwrap();
        assert_eq!(val, serde_json::json!({ "status": "ok" }));
    }
}
