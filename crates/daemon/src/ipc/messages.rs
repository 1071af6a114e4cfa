//! IPC message types for CLI-daemon communication.
//!
//! Requests and responses are externally tagged JSON objects, one per line.
//! `Viewer` wraps a forwarding-protocol [`Message`] in either direction.

use protocol::messages::base64_bytes;
use protocol::{ErrorCode, Message};
use serde::{Deserialize, Serialize};

use crate::session::{CreateSessionRequest, Session};

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List sessions. Live ones only unless `all` is set.
    ListSessions {
        #[serde(default)]
        all: bool,
    },
    CreateSession(CreateSessionRequest),
    KillSession {
        session_id: String,
    },
    ResizeSession {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    RestartSession {
        session_id: String,
    },
    /// Most recent backlog chunks of a live session.
    RecentOutput {
        session_id: String,
        #[serde(default)]
        chunks: Option<usize>,
    },
    /// Plain-text snapshot of the session's pane.
    Capture {
        session_id: String,
        #[serde(default)]
        lines: Option<u32>,
    },
    /// Types text followed by Enter into the session.
    SendKeys {
        session_id: String,
        text: String,
    },
    /// Forwarding-protocol message. Turns the connection into a viewer.
    Viewer(Message),
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        running: bool,
        uptime_secs: u64,
        /// Number of live sessions.
        session_count: usize,
        /// Number of connected viewers.
        viewer_count: usize,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    Sessions {
        sessions: Vec<Session>,
    },
    /// A created or restarted session.
    Session(Session),
    SessionKilled {
        session_id: String,
    },
    SessionResized {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    Output {
        session_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Capture {
        session_id: String,
        text: String,
    },
    KeysSent {
        session_id: String,
    },
    /// Forwarding-protocol message pushed to a viewer connection.
    Viewer(Message),
    /// An error occurred processing the request.
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl IpcResponse {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        IpcResponse::Error {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionKind;
    use protocol::messages::{TerminalJoin, TerminalOutput};

    #[test]
    fn test_unit_requests_are_plain_strings() {
        assert_eq!(serde_json::to_string(&IpcRequest::Ping).unwrap(), r#""Ping""#);
        assert_eq!(serde_json::to_string(&IpcRequest::Stop).unwrap(), r#""Stop""#);
        assert_eq!(serde_json::to_string(&IpcResponse::Pong).unwrap(), r#""Pong""#);
    }

    #[test]
    fn test_list_sessions_all_defaults_to_false() {
        let request: IpcRequest = serde_json::from_str(r#"{"ListSessions":{}}"#).unwrap();
        assert_eq!(request, IpcRequest::ListSessions { all: false });
    }

    #[test]
    fn test_create_session_request_uses_type_key() {
        let json = r#"{"CreateSession":{"type":"shell","workdir":"/tmp"}}"#;
        let request: IpcRequest = serde_json::from_str(json).unwrap();
        match request {
            IpcRequest::CreateSession(req) => {
                assert_eq!(req.kind, SessionKind::Shell);
                assert_eq!(req.workdir, std::path::PathBuf::from("/tmp"));
                assert!(req.id.is_none());
                assert!(req.flags.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_session_type_is_rejected() {
        let json = r#"{"CreateSession":{"type":"vim","workdir":"/tmp"}}"#;
        assert!(serde_json::from_str::<IpcRequest>(json).is_err());
    }

    #[test]
    fn test_viewer_request_wraps_protocol_message() {
        let request = IpcRequest::Viewer(Message::TerminalJoin(TerminalJoin {
            session_id: "abc".to_string(),
        }));
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"Viewer":{"type":"TerminalJoin","data":{"session_id":"abc"}}}"#
        );
    }

    #[test]
    fn test_output_is_base64() {
        let response = IpcResponse::Output {
            session_id: "abc".to_string(),
            data: b"hi".to_vec(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""data":"aGk=""#));

        let pushed = IpcResponse::Viewer(Message::TerminalOutput(TerminalOutput {
            session_id: "abc".to_string(),
            data: b"hi".to_vec(),
        }));
        let back: IpcResponse =
            serde_json::from_str(&serde_json::to_string(&pushed).unwrap()).unwrap();
        assert_eq!(back, pushed);
    }

    #[test]
    fn test_error_response() {
        let response = IpcResponse::error(ErrorCode::NotFound, "session not found: x");
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("NotFound"));
        assert!(json.contains("session not found: x"));
    }
}
