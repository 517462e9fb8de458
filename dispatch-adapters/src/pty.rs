//! PTY adapter (`spec.md` §4.4.1): spawns a shell under a pseudo-terminal.
//!
//! Grounded on the teacher's `unified_exec` session shape (a reader task
//! draining the master fd, a writer task draining an `mpsc` channel into the
//! master side) generalized from a one-shot tool call into a long-lived
//! adapter handle.

use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use dispatch_protocol::DispatchError;
use dispatch_protocol::RunKind;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dispatch_protocol::event::channel;
use dispatch_protocol::event::event_type;
use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::AdapterFactory;
use crate::AdapterHandle;
use crate::EventSink;
use crate::ExitSignal;
use crate::ExitStatus;
use crate::SinkEvent;
use crate::wait_on;

const DEFAULT_CLOSE_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Default)]
pub struct PtyAdapterFactory;

#[async_trait]
impl AdapterFactory for PtyAdapterFactory {
    fn kind(&self) -> RunKind {
        RunKind::Pty
    }

    async fn start(
        &self,
        workspace_path: &str,
        metadata: &serde_json::Value,
        sink: EventSink,
    ) -> Result<Box<dyn AdapterHandle>, DispatchError> {
        let shell = metadata
            .get("shell")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(default_shell);
        let workspace_path = workspace_path.to_string();

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| DispatchError::AdapterMisconfigured(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.cwd(&workspace_path);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DispatchError::AdapterMisconfigured(format!("spawn failed: {e}")))?;
        // The slave end is only needed by the child; drop our copy so the
        // master's read side sees EOF once the child exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| DispatchError::AdapterMisconfigured(format!("clone reader failed: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| DispatchError::AdapterMisconfigured(format!("take writer failed: {e}")))?;

        let (input_tx, input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (exit_signal, exit_rx) = ExitSignal::new();
        let exit_signal = Arc::new(exit_signal);

        let reader_sink = sink.clone();
        let reader_handle = std::thread::Builder::new()
            .name("dispatch-pty-reader".to_string())
            .spawn(move || read_loop(reader, reader_sink))
            .map_err(|e| DispatchError::AdapterMisconfigured(format!("spawn reader failed: {e}")))?;

        let writer_handle = tokio::task::spawn_blocking(move || write_loop(writer, input_rx));

        let master = Arc::new(StdMutex::new(pair.master));
        let child = Arc::new(StdMutex::new(child));

        let waiter_child = child.clone();
        let waiter_exit = exit_signal;
        let waiter_handle = std::thread::Builder::new()
            .name("dispatch-pty-waiter".to_string())
            .spawn(move || wait_loop(waiter_child, waiter_exit))
            .map_err(|e| DispatchError::AdapterMisconfigured(format!("spawn waiter failed: {e}")))?;

        Ok(Box::new(PtyHandle {
            input_tx,
            master,
            child,
            exit_rx,
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
            _waiter_handle: waiter_handle,
        }))
    }
}

#[cfg(unix)]
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(not(unix))]
fn default_shell() -> String {
    "cmd.exe".to_string()
}

fn read_loop(mut reader: Box<dyn Read + Send>, sink: EventSink) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let bytes = BASE64.encode(&buf[..n]);
                let _ = sink.send(SinkEvent {
                    channel: channel::PTY_STDOUT.to_string(),
                    event_type: event_type::CHUNK.to_string(),
                    payload: serde_json::json!({ "bytes": bytes }),
                });
            }
            Err(e) => {
                warn!(error = %e, "pty reader failed");
                break;
            }
        }
    }
}

/// Blocks on the child's real exit status so `ExitStatus.code` reflects the
/// shell's actual exit code rather than just "the master fd hit EOF".
fn wait_loop(child: Arc<StdMutex<Box<dyn portable_pty::Child + Send + Sync>>>, exit: Arc<ExitSignal>) {
    let status = {
        let mut child = child.lock().unwrap_or_else(|p| p.into_inner());
        child.wait()
    };
    let (code, reason) = match status {
        Ok(status) => (status.exit_code().try_into().ok(), "exited".to_string()),
        Err(e) => (None, format!("wait failed: {e}")),
    };
    exit.fire(ExitStatus { code, reason });
}

fn write_loop(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = input_rx.blocking_recv() {
        if writer.write_all(&bytes).is_err() {
            break;
        }
        let _ = writer.flush();
    }
}

struct PtyHandle {
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    master: Arc<StdMutex<Box<dyn portable_pty::MasterPty + Send>>>,
    child: Arc<StdMutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    exit_rx: tokio::sync::watch::Receiver<Option<ExitStatus>>,
    _reader_handle: std::thread::JoinHandle<()>,
    _writer_handle: JoinHandle<()>,
    _waiter_handle: std::thread::JoinHandle<()>,
}

#[async_trait]
impl AdapterHandle for PtyHandle {
    async fn input(&self, bytes: Vec<u8>) -> Result<(), DispatchError> {
        self.input_tx
            .send(bytes)
            .map_err(|_| DispatchError::NotLive("pty writer gone".to_string()))
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), DispatchError> {
        let master = self.master.clone();
        tokio::task::spawn_blocking(move || {
            let master = master.lock().unwrap_or_else(|p| p.into_inner());
            master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
        })
        .await
        .map_err(|e| DispatchError::AdapterCrashed(e.to_string()))?
        .map_err(|e| DispatchError::AdapterCrashed(e.to_string()))
    }

    async fn close(&self) -> Result<(), DispatchError> {
        let pid = {
            let child = self.child.lock().unwrap_or_else(|p| p.into_inner());
            child.process_id()
        };
        match pid {
            Some(pid) => {
                crate::kill::terminate_process_group(pid, DEFAULT_CLOSE_GRACE).await;
            }
            None => {
                let child = self.child.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    let mut child = child.lock().unwrap_or_else(|p| p.into_inner());
                    child.kill()
                })
                .await;
            }
        }
        Ok(())
    }

    async fn wait_exit(&self) -> ExitStatus {
        wait_on(&self.exit_rx).await
    }
}
