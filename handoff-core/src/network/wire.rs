//! Gossipsub Wire Frames
//!
//! JSON frames published on the directory topic and on per-session topics.

use serde::{Deserialize, Serialize};

use crate::sync::Envelope;

/// Topic every device announces its hosted session on
pub const DIRECTORY_TOPIC: &str = "handoff/directory";

/// Topic carrying join handshakes and channel frames for one session
pub fn session_topic(session_id: &str) -> String {
    format!("handoff/session/{}", session_id)
}

/// Frames on [`DIRECTORY_TOPIC`]. The controller is the publishing peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DirectoryFrame {
    Announce {
        session_id: String,
        display_name: String,
        controller_display_name: String,
    },
    Withdraw {
        session_id: String,
    },
}

/// Frames on a session topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SessionFrame {
    JoinRequest {
        request_id: u64,
        display_name: String,
    },
    JoinResponse {
        request_id: u64,
        participant: String,
        accepted: bool,
    },
    Frame {
        channel: String,
        envelope: Envelope,
    },
}

impl DirectoryFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

impl SessionFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncMessage;

    #[test]
    fn test_directory_frame_shape() {
        let frame = DirectoryFrame::Withdraw {
            session_id: "ABCDEFGH".to_string(),
        };
        let json: serde_json::Value = serde_json::from_slice(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(json["kind"], "Withdraw");
        assert_eq!(json["session_id"], "ABCDEFGH");
    }

    #[test]
    fn test_frame_carries_flat_envelope() {
        let frame = SessionFrame::Frame {
            channel: "Media".to_string(),
            envelope: SyncMessage::PositionData { drag_position: 0.5 }.to_envelope(),
        };
        let json: serde_json::Value = serde_json::from_slice(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(json["kind"], "Frame");
        assert_eq!(json["envelope"]["Type"], "PositionData");
        assert_eq!(json["envelope"]["DragPosition"], "0.5");

        assert_eq!(SessionFrame::from_bytes(&frame.to_bytes().unwrap()).unwrap(), frame);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(SessionFrame::from_bytes(b"{\"kind\":\"Nope\"}").is_err());
        assert!(DirectoryFrame::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_session_topic() {
        assert_eq!(session_topic("ABCDEFGH"), "handoff/session/ABCDEFGH");
    }
}
