//! Claude adapter (`spec.md` §4.4.2): spawns the external `claude` CLI once
//! per turn, framed as newline-delimited `stream-json` on stdout.
//!
//! Grounded on the reference `ClaudeCodeRunner` turn loop: each `input()`
//! call is one turn, spawned with `--resume <session>` once the CLI's own
//! session id has been captured from its first `system` event so multi-turn
//! conversation history survives across turns (and, via `resumeHint`, across
//! a Session Core resume too).

use std::sync::Arc;

use async_trait::async_trait;
use dispatch_protocol::DispatchError;
use dispatch_protocol::RunKind;
use dispatch_protocol::event::channel;
use dispatch_protocol::event::event_type;
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::AdapterFactory;
use crate::AdapterHandle;
use crate::EventSink;
use crate::ExitSignal;
use crate::ExitStatus;
use crate::SinkEvent;
use crate::kill::terminate_process_group;
use crate::wait_on;

const DEFAULT_CLOSE_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Default)]
pub struct ClaudeAdapterFactory;

#[async_trait]
impl AdapterFactory for ClaudeAdapterFactory {
    fn kind(&self) -> RunKind {
        RunKind::Claude
    }

    async fn start(
        &self,
        workspace_path: &str,
        metadata: &serde_json::Value,
        sink: EventSink,
    ) -> Result<Box<dyn AdapterHandle>, DispatchError> {
        validate_credentials(metadata)?;

        let model = metadata
            .get("model")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let resume_hint = metadata
            .get("resumeHint")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let config_dir = metadata
            .get("claudeConfigDir")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let (exit_signal, exit_rx) = ExitSignal::new();
        let exit_signal = Arc::new(exit_signal);
        let current_child: Arc<Mutex<Option<tokio::process::Child>>> = Arc::new(Mutex::new(None));
        let claude_session_id: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(resume_hint));

        let (turn_tx, mut turn_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let workspace_path = workspace_path.to_string();
        let task_sink = sink.clone();
        let task_child = current_child.clone();
        let task_session_id = claude_session_id.clone();
        let task_exit = exit_signal.clone();
        tokio::spawn(async move {
            while let Some(prompt_bytes) = turn_rx.recv().await {
                let prompt = String::from_utf8_lossy(&prompt_bytes).to_string();
                if let Err(e) = run_turn(
                    &workspace_path,
                    &prompt,
                    model.as_deref(),
                    config_dir.as_deref(),
                    &task_session_id,
                    &task_child,
                    &task_sink,
                )
                .await
                {
                    warn!(error = %e, "claude turn failed");
                    let _ = task_sink.send(SinkEvent {
                        channel: channel::SYSTEM.to_string(),
                        event_type: event_type::ERROR.to_string(),
                        payload: serde_json::json!({ "message": e.to_string() }),
                    });
                }
            }
            task_exit.fire(ExitStatus {
                code: Some(0),
                reason: "closed".to_string(),
            });
        });

        Ok(Box::new(ClaudeHandle {
            turn_tx: Mutex::new(Some(turn_tx)),
            current_child,
            exit_rx,
        }))
    }
}

/// `spec.md` §4.4.2: "Missing credentials -> `start` fails with
/// `AdapterMisconfigured` (non-retryable)."
fn validate_credentials(metadata: &serde_json::Value) -> Result<(), DispatchError> {
    let has_api_key = std::env::var("ANTHROPIC_API_KEY").is_ok()
        || metadata
            .get("apiKeyPresent")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
    if has_api_key {
        return Ok(());
    }
    let config_dir = metadata
        .get("claudeConfigDir")
        .and_then(|v| v.as_str())
        .map(std::path::PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".claude")));
    match config_dir {
        Some(dir) if dir.join(".credentials.json").exists() || dir.exists() => Ok(()),
        _ => Err(DispatchError::AdapterMisconfigured(
            "no ANTHROPIC_API_KEY and no claude credentials directory found".to_string(),
        )),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_turn(
    workspace_path: &str,
    prompt: &str,
    model: Option<&str>,
    config_dir: Option<&str>,
    claude_session_id: &RwLock<Option<String>>,
    current_child: &Mutex<Option<tokio::process::Child>>,
    sink: &EventSink,
) -> Result<(), DispatchError> {
    let resume = claude_session_id.read().await.clone();

    let mut cmd = Command::new("claude");
    cmd.args(["--output-format", "stream-json", "--dangerously-skip-permissions", "-p", prompt]);
    if let Some(model) = model {
        cmd.args(["--model", model]);
    }
    if let Some(ref sid) = resume {
        cmd.args(["--resume", sid]);
    }
    if let Some(dir) = config_dir {
        cmd.env("CLAUDE_CONFIG_DIR", dir);
    }
    cmd.current_dir(workspace_path);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| DispatchError::AdapterCrashed(format!("failed to spawn claude: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| DispatchError::AdapterCrashed("claude: no stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| DispatchError::AdapterCrashed("claude: no stderr".to_string()))?;

    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(target: "claude_stderr", "{line}");
        }
    });

    *current_child.lock().await = Some(child);

    let _ = sink.send(SinkEvent {
        channel: channel::CLAUDE_MESSAGE.to_string(),
        event_type: event_type::START_TURN.to_string(),
        payload: serde_json::json!({}),
    });

    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<StreamEvent>(&line) {
            Ok(event) => handle_stream_event(event, claude_session_id, sink).await,
            Err(_) => warn!(line = %line, "unparseable claude stream event"),
        }
    }

    let status = {
        let mut guard = current_child.lock().await;
        match guard.take() {
            Some(mut child) => child.wait().await.ok(),
            None => None,
        }
    };

    let _ = sink.send(SinkEvent {
        channel: channel::CLAUDE_MESSAGE.to_string(),
        event_type: event_type::END_TURN.to_string(),
        payload: serde_json::json!({ "exitCode": status.and_then(|s| s.code()) }),
    });

    Ok(())
}

async fn handle_stream_event(
    event: StreamEvent,
    claude_session_id: &RwLock<Option<String>>,
    sink: &EventSink,
) {
    match event {
        StreamEvent::System { session_id } => {
            if let Some(sid) = session_id {
                *claude_session_id.write().await = Some(sid);
            }
        }
        StreamEvent::Assistant { message } => {
            let text = message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Other => None,
                })
                .collect::<Vec<_>>()
                .join("");
            let _ = sink.send(SinkEvent {
                channel: channel::CLAUDE_MESSAGE.to_string(),
                event_type: event_type::TEXT.to_string(),
                payload: serde_json::json!({ "text": text }),
            });
        }
        StreamEvent::ToolUse { id, name, input } => {
            let _ = sink.send(SinkEvent {
                channel: channel::CLAUDE_MESSAGE.to_string(),
                event_type: event_type::TOOL_USE.to_string(),
                payload: serde_json::json!({ "id": id, "name": name, "input": input }),
            });
        }
        StreamEvent::ToolResult { tool_use_id, content } => {
            let _ = sink.send(SinkEvent {
                channel: channel::CLAUDE_MESSAGE.to_string(),
                event_type: event_type::TOOL_RESULT.to_string(),
                payload: serde_json::json!({ "toolUseId": tool_use_id, "content": content }),
            });
        }
        StreamEvent::Result { .. } | StreamEvent::Unknown => {}
    }
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    System {
        session_id: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
struct AssistantMessage {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

struct ClaudeHandle {
    turn_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    current_child: Arc<Mutex<Option<tokio::process::Child>>>,
    exit_rx: tokio::sync::watch::Receiver<Option<ExitStatus>>,
}

#[async_trait]
impl AdapterHandle for ClaudeHandle {
    async fn input(&self, bytes: Vec<u8>) -> Result<(), DispatchError> {
        let guard = self.turn_tx.lock().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(bytes)
                .map_err(|_| DispatchError::NotLive("claude adapter gone".to_string())),
            None => Err(DispatchError::NotLive("claude adapter closed".to_string())),
        }
    }

    /// No TTY behind this adapter (`spec.md` §4.4).
    async fn resize(&self, _cols: u16, _rows: u16) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), DispatchError> {
        // Dropping the sender lets the turn-processing task drain any queued
        // turn and exit on its own once the channel is empty and closed.
        self.turn_tx.lock().await.take();

        let pid = {
            let guard = self.current_child.lock().await;
            guard.as_ref().and_then(|c| c.id())
        };
        if let Some(pid) = pid {
            terminate_process_group(pid, DEFAULT_CLOSE_GRACE).await;
        }
        Ok(())
    }

    async fn wait_exit(&self) -> ExitStatus {
        wait_on(&self.exit_rx).await
    }
}
