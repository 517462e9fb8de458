use serde::Deserialize;
use serde::Serialize;

use crate::event::Event;
use crate::run::RunKind;
use crate::run::RunStatus;
use crate::Millis;

/// `POST /sessions` request body (`spec.md` §6.1).
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub kind: RunKind,
    pub workspace_path: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `GET /sessions` row shape and the `{ runId, kind, status }` response to
/// `POST /sessions`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub run_id: String,
    pub kind: RunKind,
    pub status: RunStatus,
    pub workspace_path: String,
    pub created_at: Millis,
    pub updated_at: Millis,
}

/// `PUT /sessions` body (`spec.md` §6.1, §4.7.7).
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LayoutAction {
    pub action: LayoutActionKind,
    pub run_id: String,
    pub client_id: String,
    #[serde(default)]
    pub tile_id: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LayoutActionKind {
    SetLayout,
    RemoveLayout,
}

/// Client -> server socket events (`spec.md` §6.2).
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "client:hello")]
    ClientHello {
        client_id: String,
        auth_token: String,
    },
    #[serde(rename = "run:attach")]
    RunAttach { run_id: String, from_seq: i64 },
    #[serde(rename = "run:input")]
    RunInput { run_id: String, bytes: String },
    #[serde(rename = "run:resize")]
    RunResize { run_id: String, cols: u16, rows: u16 },
    #[serde(rename = "run:close")]
    RunClose { run_id: String },
}

/// Server -> client socket events (`spec.md` §6.2).
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename = "client:hello")]
    ClientHelloAck {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id_hint: Option<String>,
    },
    #[serde(rename = "run:event")]
    RunEvent {
        run_id: String,
        seq: i64,
        channel: String,
        #[serde(rename = "type")]
        event_type: String,
        payload: serde_json::Value,
        ts: Millis,
    },
    #[serde(rename = "run:status")]
    RunStatus {
        run_id: String,
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "run:error")]
    RunError { run_id: String, error: String },
}

impl From<Event> for ServerMessage {
    fn from(e: Event) -> Self {
        ServerMessage::RunEvent {
            run_id: e.run_id,
            seq: e.seq,
            channel: e.channel,
            event_type: e.event_type,
            payload: e.payload,
            ts: e.ts,
        }
    }
}

/// Message size cap per `spec.md` §6.2: 1 MiB per frame.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn run_event_serializes_with_type_tag() {
        let msg = ServerMessage::RunEvent {
            run_id: "pty-1".to_string(),
            seq: 3,
            channel: "pty:stdout".to_string(),
            event_type: "chunk".to_string(),
            payload: serde_json::json!({"bytes": "aGk="}),
            ts: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&msg).expect("serializes");
        assert_eq!(value["type"], "run:event");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["channel"], "pty:stdout");
    }

    #[test]
    fn run_attach_deserializes_from_wire_shape() {
        let raw = serde_json::json!({
            "type": "run:attach",
            "runId": "pty-1",
            "fromSeq": 1,
        });
        let msg: ClientMessage = serde_json::from_value(raw).expect("deserializes");
        match msg {
            ClientMessage::RunAttach { run_id, from_seq } => {
                assert_eq!(run_id, "pty-1");
                assert_eq!(from_seq, 1);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
