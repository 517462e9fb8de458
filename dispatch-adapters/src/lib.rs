//! The Adapter Registry and concrete adapters (C4, `spec.md` §4.4).
//!
//! An adapter turns a process/resource into a sequence of channel-tagged
//! events plus an input sink. The registry is a process-wide mapping from
//! `kind` to factory, built once at startup and never mutated afterwards
//! (`spec.md` §9: "no shared base state").

mod claude;
mod fileeditor;
mod kill;
mod pty;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

pub use claude::ClaudeAdapterFactory;
pub use fileeditor::FileEditorAdapterFactory;
pub use pty::PtyAdapterFactory;

use std::collections::HashMap;

use async_trait::async_trait;
use dispatch_protocol::DispatchError;
use dispatch_protocol::RunKind;
use tokio::sync::mpsc;
use tokio::sync::watch;

/// One `(channel, type, payload)` tuple pushed into the sink in arrival
/// order, exactly as `spec.md` §4.4 describes the adapter->sink contract.
#[derive(Debug, Clone)]
pub struct SinkEvent {
    pub channel: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

pub type EventSink = mpsc::UnboundedSender<SinkEvent>;

/// `(code, reason)` delivered exactly once when the underlying process
/// exits for any reason (`spec.md` §4.4 `onExit`).
#[derive(Debug, Clone)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub reason: String,
}

/// A live handle returned by a successful `start`. Implementors own
/// whatever concurrency unit drives the backing process (§5: "each adapter
/// runs on its own task/thread").
#[async_trait]
pub trait AdapterHandle: Send + Sync {
    async fn input(&self, bytes: Vec<u8>) -> Result<(), DispatchError>;

    /// No-op for adapters without a TTY (`spec.md` §4.4).
    async fn resize(&self, cols: u16, rows: u16) -> Result<(), DispatchError>;

    /// Requests graceful shutdown; must drain pending output into the sink
    /// before resolving.
    async fn close(&self) -> Result<(), DispatchError>;

    /// Resolves exactly once, whenever the process exits, whether or not
    /// `close` was ever called.
    async fn wait_exit(&self) -> ExitStatus;
}

#[async_trait]
pub trait AdapterFactory: Send + Sync {
    fn kind(&self) -> RunKind;

    /// Must not return a handle until the process is live and capable of
    /// accepting input (`spec.md` §4.4).
    async fn start(
        &self,
        workspace_path: &str,
        metadata: &serde_json::Value,
        sink: EventSink,
    ) -> Result<Box<dyn AdapterHandle>, DispatchError>;
}

/// Process-wide `kind -> factory` map (`spec.md` §4.4).
pub struct AdapterRegistry {
    factories: HashMap<RunKind, Box<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        AdapterRegistry {
            factories: HashMap::new(),
        }
    }

    /// Builds the registry with the three required concrete adapters
    /// (`spec.md` §4.4).
    pub fn with_builtin_adapters() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(PtyAdapterFactory::default()));
        registry.register(Box::new(ClaudeAdapterFactory::default()));
        registry.register(Box::new(FileEditorAdapterFactory::default()));
        registry
    }

    pub fn register(&mut self, factory: Box<dyn AdapterFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    /// Whether a factory is registered for `kind`, without starting anything
    /// (`spec.md` §4.7.1 step 1: "Validate kind against Adapter Registry").
    pub fn contains(&self, kind: RunKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub async fn start(
        &self,
        kind: RunKind,
        workspace_path: &str,
        metadata: &serde_json::Value,
        sink: EventSink,
    ) -> Result<Box<dyn AdapterHandle>, DispatchError> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| DispatchError::UnknownKind(kind.as_str().to_string()))?;
        factory.start(workspace_path, metadata, sink).await
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared helper: a `watch` channel that resolves `wait_exit` exactly once.
/// Grounded on the same single-shot-notification shape as the teacher's
/// `unified_exec` session exit tracking, generalized to a reusable type so
/// each concrete adapter doesn't reimplement it.
pub(crate) struct ExitSignal {
    tx: watch::Sender<Option<ExitStatus>>,
}

impl ExitSignal {
    pub(crate) fn new() -> (Self, watch::Receiver<Option<ExitStatus>>) {
        let (tx, rx) = watch::channel(None);
        (ExitSignal { tx }, rx)
    }

    pub(crate) fn fire(&self, status: ExitStatus) {
        let _ = self.tx.send(Some(status));
    }
}

pub(crate) async fn wait_on(rx: &watch::Receiver<Option<ExitStatus>>) -> ExitStatus {
    let mut rx = rx.clone();
    loop {
        if let Some(status) = rx.borrow().clone() {
            return status;
        }
        if rx.changed().await.is_err() {
            return ExitStatus {
                code: None,
                reason: "adapter dropped without exit signal".to_string(),
            };
        }
    }
}
