//! WebSocket progress channel message types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Pong,
    Subscribe { job_ids: Vec<Uuid> },
    Unsubscribe { job_ids: Vec<Uuid> },
    SubscribeAll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ping {
        server_ts: i64,
    },
    Progress {
        job_id: Uuid,
        progress: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        frame: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fps: Option<f32>,
        time: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f32>,
    },
    StatusChange {
        job_id: Uuid,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
}

impl ServerMessage {
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Self::Ping { .. } => None,
            Self::Progress { job_id, .. } | Self::StatusChange { job_id, .. } => Some(*job_id),
        }
    }

    /// Progress events are droppable under backpressure; pings and status
    /// changes are not.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::Progress { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_are_tagged() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","job_ids":[]}"#).unwrap();
        assert_eq!(msg, ClientMessage::Subscribe { job_ids: vec![] });
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"subscribe_all"}"#).unwrap();
        assert_eq!(msg, ClientMessage::SubscribeAll);
    }

    #[test]
    fn status_change_omits_absent_error() {
        let msg = ServerMessage::StatusChange {
            job_id: Uuid::nil(),
            status: JobStatus::Ready,
            error_message: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"status_change""#));
        assert!(!json.contains("error_message"));
    }
}
