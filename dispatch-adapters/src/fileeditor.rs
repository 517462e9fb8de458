//! File-editor adapter (`spec.md` §4.4.3): opens a file for buffered
//! read/modify/write. No TTY, no subprocess — the adapter owns an async
//! file handle and emits one event per operation.

use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use dispatch_protocol::DispatchError;
use dispatch_protocol::RunKind;
use dispatch_protocol::event::channel;
use dispatch_protocol::event::event_type;
use tokio::fs;
use tokio::sync::Mutex;

use crate::AdapterFactory;
use crate::AdapterHandle;
use crate::EventSink;
use crate::ExitSignal;
use crate::ExitStatus;
use crate::SinkEvent;
use crate::wait_on;

#[derive(Default)]
pub struct FileEditorAdapterFactory;

#[async_trait]
impl AdapterFactory for FileEditorAdapterFactory {
    fn kind(&self) -> RunKind {
        RunKind::FileEditor
    }

    async fn start(
        &self,
        workspace_path: &str,
        metadata: &serde_json::Value,
        sink: EventSink,
    ) -> Result<Box<dyn AdapterHandle>, DispatchError> {
        let relative_path = metadata
            .get("filePath")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DispatchError::AdapterMisconfigured("metadata.filePath is required".to_string()))?;
        let file_path = resolve_under_workspace(workspace_path, relative_path)?;

        let content = match fs::read(&file_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(DispatchError::AdapterMisconfigured(format!("cannot open {}: {e}", file_path.display()))),
        };

        let _ = sink.send(SinkEvent {
            channel: channel::FILE_EDITOR.to_string(),
            event_type: event_type::OPEN.to_string(),
            payload: serde_json::json!({
                "path": relative_path,
                "bytes": base64_encode(&content),
            }),
        });

        let (exit_signal, exit_rx) = ExitSignal::new();

        Ok(Box::new(FileEditorHandle {
            file_path,
            relative_path: relative_path.to_string(),
            sink,
            exit_signal,
            exit_rx,
            closed: Mutex::new(false),
        }))
    }
}

fn resolve_under_workspace(workspace_path: &str, relative_path: &str) -> Result<PathBuf, DispatchError> {
    let candidate = Path::new(relative_path);
    let resolved = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        Path::new(workspace_path).join(candidate)
    };
    Ok(resolved)
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

struct FileEditorHandle {
    file_path: PathBuf,
    relative_path: String,
    sink: EventSink,
    exit_signal: ExitSignal,
    exit_rx: tokio::sync::watch::Receiver<Option<ExitStatus>>,
    closed: Mutex<bool>,
}

#[async_trait]
impl AdapterHandle for FileEditorHandle {
    /// Each `input` call overwrites the file with `bytes` and emits a `save`
    /// event (`spec.md` §4.4.3).
    async fn input(&self, bytes: Vec<u8>) -> Result<(), DispatchError> {
        if *self.closed.lock().await {
            return Err(DispatchError::NotLive(self.relative_path.clone()));
        }
        fs::write(&self.file_path, &bytes)
            .await
            .map_err(|e| DispatchError::AdapterCrashed(format!("write failed: {e}")))?;
        let _ = self.sink.send(SinkEvent {
            channel: channel::FILE_EDITOR.to_string(),
            event_type: event_type::SAVE.to_string(),
            payload: serde_json::json!({
                "path": self.relative_path,
                "bytes": base64_encode(&bytes),
            }),
        });
        Ok(())
    }

    /// No TTY behind this adapter (`spec.md` §4.4).
    async fn resize(&self, _cols: u16, _rows: u16) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), DispatchError> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(());
        }
        *closed = true;
        let _ = self.sink.send(SinkEvent {
            channel: channel::FILE_EDITOR.to_string(),
            event_type: event_type::CLOSE.to_string(),
            payload: serde_json::json!({ "path": self.relative_path }),
        });
        self.exit_signal.fire(ExitStatus {
            code: Some(0),
            reason: "closed".to_string(),
        });
        Ok(())
    }

    async fn wait_exit(&self) -> ExitStatus {
        wait_on(&self.exit_rx).await
    }
}
