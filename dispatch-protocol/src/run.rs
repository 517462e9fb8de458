use serde::Deserialize;
use serde::Serialize;

use crate::Millis;

/// The closed set of adapter kinds a run can be created with. The registry
/// (`dispatch-adapters`) is open to new factories, but the wire-level kind
/// tag is this fixed enumeration; unrecognized strings never reach it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RunKind {
    Pty,
    Claude,
    FileEditor,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Pty => "pty",
            RunKind::Claude => "claude",
            RunKind::FileEditor => "file-editor",
        }
    }

    /// Whether this kind's adapter can service `resume` (`spec.md` §4.7.6).
    /// PTY shells have no resumable backing state; the other two kinds do.
    pub fn supports_resume(self) -> bool {
        match self {
            RunKind::Pty => false,
            RunKind::Claude | RunKind::FileEditor => true,
        }
    }
}

impl std::str::FromStr for RunKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pty" => Ok(RunKind::Pty),
            "claude" => Ok(RunKind::Claude),
            "file-editor" => Ok(RunKind::FileEditor),
            _ => Err(()),
        }
    }
}

/// `spec.md` §3.1: monotonic except for the explicit `stopped -> running`
/// transition permitted only via resume.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Starting,
    Running,
    Stopped,
    Crashed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Stopped => "stopped",
            RunStatus::Crashed => "crashed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Stopped | RunStatus::Crashed)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(RunStatus::Starting),
            "running" => Ok(RunStatus::Running),
            "stopped" => Ok(RunStatus::Stopped),
            "crashed" => Ok(RunStatus::Crashed),
            _ => Err(()),
        }
    }
}

/// Durable metadata for one run (C2's row shape, `spec.md` §3.1 + §6.3).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: String,
    pub kind: RunKind,
    pub workspace_path: String,
    pub status: RunStatus,
    pub metadata: serde_json::Value,
    pub created_at: Millis,
    pub updated_at: Millis,
}

impl Run {
    pub fn new(run_id: String, kind: RunKind, workspace_path: String, metadata: serde_json::Value) -> Self {
        let now = crate::now_millis();
        Run {
            run_id,
            kind,
            workspace_path,
            status: RunStatus::Starting,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }
}
