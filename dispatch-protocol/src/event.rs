use serde::Deserialize;
use serde::Serialize;

use crate::Millis;

/// An immutable, seq-numbered record appended to a run's log (`spec.md`
/// §3.1). `(run_id, seq)` is the composite primary key in `dispatch-store`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub run_id: String,
    pub seq: i64,
    pub channel: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub ts: Millis,
}

impl Event {
    pub fn new(
        run_id: impl Into<String>,
        channel: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Event {
            run_id: run_id.into(),
            seq: 0,
            channel: channel.into(),
            event_type: event_type.into(),
            payload,
            ts: crate::now_millis(),
        }
    }
}

/// Well-known channel tags (`spec.md` §3.1, §4.4).
pub mod channel {
    pub const PTY_STDOUT: &str = "pty:stdout";
    pub const PTY_STDERR: &str = "pty:stderr";
    pub const PTY_EXIT: &str = "pty:exit";
    pub const CLAUDE_MESSAGE: &str = "claude:message";
    pub const FILE_EDITOR: &str = "fileeditor";
    pub const SYSTEM: &str = "system";
}

/// Well-known event type tags (`spec.md` §3.1, §4.4, §4.5, §4.7.8).
pub mod event_type {
    pub const CHUNK: &str = "chunk";
    pub const EXIT: &str = "exit";
    pub const RESIZE: &str = "resize";
    pub const META: &str = "meta";
    pub const OVERFLOW: &str = "overflow";
    pub const ERROR: &str = "error";
    pub const HOST_RESTART: &str = "host-restart";
    pub const START_TURN: &str = "startTurn";
    pub const TEXT: &str = "text";
    pub const TOOL_USE: &str = "toolUse";
    pub const TOOL_RESULT: &str = "toolResult";
    pub const END_TURN: &str = "endTurn";
    pub const OPEN: &str = "open";
    pub const SAVE: &str = "save";
    pub const CLOSE: &str = "close";
}
