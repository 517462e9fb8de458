//! In-memory adapter double for `dispatch-recorder` and `dispatch-orchestrator`
//! tests, behind the `test-support` feature.
//!
//! Grounded on the pack's `FakeSessionAdapter` shape (an `Arc<Mutex<State>>`
//! recording every call, exposed back to the test through a cloneable
//! handle) generalized from a single fake session to a fake per-kind
//! `AdapterFactory` that remembers every instance it has started so a test
//! can drive each one's sink/exit independently.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use dispatch_protocol::DispatchError;
use dispatch_protocol::RunKind;

use crate::AdapterFactory;
use crate::AdapterHandle;
use crate::EventSink;
use crate::ExitSignal;
use crate::ExitStatus;
use crate::SinkEvent;
use crate::wait_on;

struct FakeState {
    inputs: Vec<Vec<u8>>,
    resizes: Vec<(u16, u16)>,
    close_calls: u32,
    closed: bool,
}

/// A controller for one started instance: lets a test push events into the
/// run's event stream and fire the exit signal on demand.
#[derive(Clone)]
pub struct FakeAdapterHandle {
    state: Arc<Mutex<FakeState>>,
    sink: EventSink,
    exit_signal: Arc<ExitSignal>,
    exit_rx: tokio::sync::watch::Receiver<Option<ExitStatus>>,
    pub workspace_path: String,
    pub metadata: serde_json::Value,
}

impl FakeAdapterHandle {
    /// Pushes one event into the sink the run was started with, as though the
    /// underlying process produced it.
    pub fn emit(&self, channel: impl Into<String>, event_type: impl Into<String>, payload: serde_json::Value) {
        let _ = self.sink.send(SinkEvent {
            channel: channel.into(),
            event_type: event_type.into(),
            payload,
        });
    }

    /// Resolves every pending and future `wait_exit` call.
    pub fn trigger_exit(&self, code: Option<i32>, reason: impl Into<String>) {
        self.exit_signal.fire(ExitStatus {
            code,
            reason: reason.into(),
        });
    }

    pub fn inputs(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).inputs.clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).resizes.clone()
    }

    pub fn close_calls(&self) -> u32 {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).close_calls
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).closed
    }
}

#[async_trait]
impl AdapterHandle for FakeAdapterHandle {
    async fn input(&self, bytes: Vec<u8>) -> Result<(), DispatchError> {
        if self.state.lock().unwrap_or_else(|p| p.into_inner()).closed {
            return Err(DispatchError::NotLive("fake adapter closed".to_string()));
        }
        self.state.lock().unwrap_or_else(|p| p.into_inner()).inputs.push(bytes);
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), DispatchError> {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).resizes.push((cols, rows));
        Ok(())
    }

    async fn close(&self) -> Result<(), DispatchError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.close_calls += 1;
        state.closed = true;
        drop(state);
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

/// A fake factory registered for one [`RunKind`]; records every instance it
/// starts so tests can reach in and drive it after the fact.
#[derive(Clone)]
pub struct FakeAdapterFactory {
    kind: RunKind,
    instances: Arc<Mutex<Vec<FakeAdapterHandle>>>,
    fail_start: Arc<Mutex<Option<DispatchError>>>,
}

impl FakeAdapterFactory {
    pub fn new(kind: RunKind) -> Self {
        FakeAdapterFactory {
            kind,
            instances: Arc::new(Mutex::new(Vec::new())),
            fail_start: Arc::new(Mutex::new(None)),
        }
    }

    /// Makes the next `start` call fail with `err` (one-shot).
    pub fn fail_next_start(&self, err: DispatchError) {
        *self.fail_start.lock().unwrap_or_else(|p| p.into_inner()) = Some(err);
    }

    pub fn instances(&self) -> Vec<FakeAdapterHandle> {
        self.instances.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn last_instance(&self) -> Option<FakeAdapterHandle> {
        self.instances.lock().unwrap_or_else(|p| p.into_inner()).last().cloned()
    }
}

#[async_trait]
impl AdapterFactory for FakeAdapterFactory {
    fn kind(&self) -> RunKind {
        self.kind
    }

    async fn start(
        &self,
        workspace_path: &str,
        metadata: &serde_json::Value,
        sink: EventSink,
    ) -> Result<Box<dyn AdapterHandle>, DispatchError> {
        if let Some(err) = self.fail_start.lock().unwrap_or_else(|p| p.into_inner()).take() {
            return Err(err);
        }

        let (exit_signal, exit_rx) = ExitSignal::new();
        let handle = FakeAdapterHandle {
            state: Arc::new(Mutex::new(FakeState {
                inputs: Vec::new(),
                resizes: Vec::new(),
                close_calls: 0,
                closed: false,
            })),
            sink,
            exit_signal: Arc::new(exit_signal),
            exit_rx,
            workspace_path: workspace_path.to_string(),
            metadata: metadata.clone(),
        };

        self.instances.lock().unwrap_or_else(|p| p.into_inner()).push(handle.clone());
        Ok(Box::new(handle))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn start_records_instance_and_input_is_visible_to_controller() {
        let factory = FakeAdapterFactory::new(RunKind::Pty);
        let (sink, mut rx) = mpsc::unbounded_channel();

        let adapter = factory
            .start("/workspace/demo", &serde_json::json!({}), sink)
            .await
            .unwrap();
        adapter.input(b"hello".to_vec()).await.unwrap();

        let controller = factory.last_instance().unwrap();
        assert_eq!(controller.inputs(), vec![b"hello".to_vec()]);

        controller.emit("pty:stdout", "chunk", serde_json::json!({ "bytes": "aGk=" }));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.channel, "pty:stdout");
    }

    #[tokio::test]
    async fn close_fires_exit_and_rejects_further_input() {
        let factory = FakeAdapterFactory::new(RunKind::Claude);
        let (sink, _rx) = mpsc::unbounded_channel();

        let adapter = factory
            .start("/workspace/demo", &serde_json::json!({}), sink)
            .await
            .unwrap();
        adapter.close().await.unwrap();

        assert!(adapter.input(b"late".to_vec()).await.is_err());
        let status = adapter.wait_exit().await;
        assert_eq!(status.code, Some(0));
    }

    #[tokio::test]
    async fn fail_next_start_surfaces_configured_error() {
        let factory = FakeAdapterFactory::new(RunKind::FileEditor);
        factory.fail_next_start(DispatchError::AdapterMisconfigured("boom".to_string()));
        let (sink, _rx) = mpsc::unbounded_channel();

        let result = factory.start("/workspace/demo", &serde_json::json!({}), sink).await;
        assert!(result.is_err());
    }
}
