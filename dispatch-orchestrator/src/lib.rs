//! Session Orchestrator (C7, `spec.md` §4.7): the single coordinator that
//! mutates run status and the only component that owns the in-memory run
//! table (`runId -> Recorder`) for live runs.
//!
//! Grounded on the teacher's `ConversationManager`/`SessionManager` shape: a
//! process-wide registry guarded by a `tokio::sync::Mutex`, whose entries are
//! installed by a `create`-shaped constructor and torn down by a background
//! task that watches the child's lifecycle and removes its own entry on
//! completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dispatch_adapters::AdapterRegistry;
use dispatch_hub::SubscriptionHub;
use dispatch_hub::Subscriber;
use dispatch_hub::SubscriptionHandle;
use dispatch_protocol::DispatchError;
use dispatch_protocol::Run;
use dispatch_protocol::RunKind;
use dispatch_protocol::RunStatus;
use dispatch_protocol::event::channel;
use dispatch_protocol::event::event_type;
use dispatch_recorder::Recorder;
use dispatch_recorder::RecorderHandle;
use dispatch_store::EventStore;
use dispatch_store::SessionRepository;
use dispatch_store::WorkspaceRepository;
use tokio::sync::Mutex;
use tracing::info;
use tracing::warn;

/// `spec.md` §6.4 fields this crate is responsible for applying.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub adapter_start_timeout: Duration,
    pub pre_start_buffer_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            adapter_start_timeout: Duration::from_millis(30_000),
            pre_start_buffer_bytes: dispatch_recorder::DEFAULT_PRE_START_BUFFER_BYTES,
        }
    }
}

/// Top-level coordinator (`spec.md` §4.7). Cheaply cloneable: every field is
/// itself a handle (`Arc`/actor sender) except the run table, which is the
/// one piece of state this crate actually owns.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<AdapterRegistry>,
    store: EventStore,
    sessions: SessionRepository,
    workspaces: WorkspaceRepository,
    hub: Arc<SubscriptionHub>,
    runs: Arc<Mutex<HashMap<String, RecorderHandle>>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        registry: AdapterRegistry,
        store: EventStore,
        sessions: SessionRepository,
        workspaces: WorkspaceRepository,
        hub: Arc<SubscriptionHub>,
        config: OrchestratorConfig,
    ) -> Self {
        Orchestrator {
            registry: Arc::new(registry),
            store,
            sessions,
            workspaces,
            hub,
            runs: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// `spec.md` §4.7.8: run at process start, before any client can attach.
    /// No Recorder exists yet for any run (the process just started), so
    /// every run left in `starting`/`running` from the prior process has its
    /// invariant §3.2(4) violated; force it to `crashed` and leave an
    /// explanatory marker in its log.
    pub async fn recover_crashed_runs(&self) -> Result<usize, DispatchError> {
        let runs = self.sessions.list().await?;
        let mut recovered = 0;
        for run in runs {
            if matches!(run.status, RunStatus::Starting | RunStatus::Running) {
                let max_seq = self.store.max_seq(&run.run_id).await.unwrap_or(0);
                let ts = dispatch_protocol::now_millis();
                if let Err(e) = self
                    .store
                    .append(&run.run_id, channel::SYSTEM, event_type::HOST_RESTART, serde_json::json!({}), ts)
                    .await
                {
                    warn!(run_id = %run.run_id, error = %e, "failed to append host-restart marker");
                }
                self.sessions.set_status(&run.run_id, RunStatus::Crashed).await?;
                warn!(run_id = %run.run_id, prior_status = run.status.as_str(), max_seq, "recovered orphaned run as crashed");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// `spec.md` §4.7.1.
    pub async fn create(
        &self,
        kind: RunKind,
        workspace_path: &str,
        metadata: serde_json::Value,
    ) -> Result<String, DispatchError> {
        if !self.registry.contains(kind) {
            return Err(DispatchError::UnknownKind(kind.as_str().to_string()));
        }
        self.workspaces.resolve_and_touch(workspace_path).await?;

        let run_id = format!("{}-{}", kind.as_str(), uuid::Uuid::new_v4());
        let run = Run::new(run_id.clone(), kind, workspace_path.to_string(), metadata.clone());
        self.sessions.create(run).await?;

        match self.start_adapter_and_install(&run_id, kind, workspace_path, &metadata).await {
            Ok(()) => {
                info!(run_id = %run_id, kind = kind.as_str(), "run created");
                Ok(run_id)
            }
            Err(e) => {
                if let Err(status_err) = self.sessions.set_status(&run_id, RunStatus::Crashed).await {
                    warn!(run_id = %run_id, error = %status_err, "failed to mark failed-start run crashed");
                }
                Err(e)
            }
        }
    }

    /// `spec.md` §4.7.6. Only runs whose kind declares resume support
    /// qualify; the run must be in a terminal state; the recorder continues
    /// appending from `maxSeq + 1` because `EventStore::append` always
    /// computes `seq` from the store's own state (`spec.md` §4.1), so "no
    /// gap" falls out for free as long as no new Recorder started in the
    /// meantime (enforced by `status` being terminal and the run table not
    /// already holding an entry).
    pub async fn resume(&self, run_id: &str) -> Result<(), DispatchError> {
        let run = self
            .sessions
            .find_by_id(run_id)
            .await?
            .ok_or_else(|| DispatchError::NoSuchRun(run_id.to_string()))?;

        if !run.kind.supports_resume() {
            return Err(DispatchError::NotResumable(run_id.to_string()));
        }
        if !run.status.is_terminal() {
            return Err(DispatchError::NotResumable(format!(
                "{run_id} is not in a terminal state ({})",
                run.status.as_str()
            )));
        }
        {
            let runs = self.runs.lock().await;
            if runs.contains_key(run_id) {
                return Err(DispatchError::NotResumable(format!("{run_id} already has a live recorder")));
            }
        }

        let mut metadata = run.metadata.clone();
        if let serde_json::Value::Object(ref mut map) = metadata {
            map.insert("resumeHint".to_string(), serde_json::Value::String(run_id.to_string()));
        }

        self.start_adapter_and_install(run_id, run.kind, &run.workspace_path, &metadata).await
    }

    /// `spec.md` §4.7.2. Attaches are permitted regardless of live/stopped
    /// status; a stopped run still supports replay-only subscriptions.
    pub async fn attach(
        &self,
        run_id: &str,
        from_seq: i64,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<SubscriptionHandle, DispatchError> {
        self.sessions
            .find_by_id(run_id)
            .await?
            .ok_or_else(|| DispatchError::NoSuchRun(run_id.to_string()))?;
        let from_seq = from_seq.max(1);
        Ok(self.hub.subscribe(run_id, from_seq, subscriber).await)
    }

    pub async fn unattach(&self, handle: SubscriptionHandle) {
        self.hub.unsubscribe(handle).await;
    }

    /// `spec.md` §4.7.3.
    pub async fn input(&self, run_id: &str, bytes: Vec<u8>) -> Result<(), DispatchError> {
        self.live_recorder(run_id).await?.input(bytes).await
    }

    /// `spec.md` §4.7.4.
    pub async fn resize(&self, run_id: &str, cols: u16, rows: u16) -> Result<(), DispatchError> {
        self.live_recorder(run_id).await?.resize(cols, rows).await
    }

    /// `spec.md` §4.7.5. Idempotent: closing an already-terminal run with no
    /// live recorder is a no-op success.
    pub async fn close(&self, run_id: &str) -> Result<(), DispatchError> {
        let recorder = {
            let runs = self.runs.lock().await;
            runs.get(run_id).cloned()
        };
        match recorder {
            Some(recorder) => recorder.close().await,
            None => {
                let run = self
                    .sessions
                    .find_by_id(run_id)
                    .await?
                    .ok_or_else(|| DispatchError::NoSuchRun(run_id.to_string()))?;
                if run.status.is_terminal() {
                    Ok(())
                } else {
                    Err(DispatchError::NotLive(run_id.to_string()))
                }
            }
        }
    }

    /// `spec.md` §4.7.7.
    pub async fn set_layout(&self, run_id: &str, client_id: &str, tile_id: Option<String>) -> Result<(), DispatchError> {
        self.sessions.set_layout(run_id, client_id, tile_id).await
    }

    pub async fn find(&self, run_id: &str) -> Result<Option<Run>, DispatchError> {
        self.sessions.find_by_id(run_id).await
    }

    pub async fn list(&self) -> Result<Vec<Run>, DispatchError> {
        self.sessions.list().await
    }

    pub fn workspaces(&self) -> &WorkspaceRepository {
        &self.workspaces
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    async fn live_recorder(&self, run_id: &str) -> Result<RecorderHandle, DispatchError> {
        let runs = self.runs.lock().await;
        runs.get(run_id).cloned().ok_or_else(|| DispatchError::NotLive(run_id.to_string()))
    }

    /// Shared by `create` and `resume`: start the adapter under the
    /// configured deadline, spawn the Recorder, install it in the run table,
    /// and arrange for its own removal once the Recorder finishes
    /// (`spec.md` §5: "Inside `Orchestrator.create` while `adapter.start`
    /// initializes" is the suspension point this wraps in a timeout).
    async fn start_adapter_and_install(
        &self,
        run_id: &str,
        kind: RunKind,
        workspace_path: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), DispatchError> {
        let (sink_tx, sink_rx) = tokio::sync::mpsc::unbounded_channel();
        let start = self.registry.start(kind, workspace_path, metadata, sink_tx);
        let adapter = match tokio::time::timeout(self.config.adapter_start_timeout, start).await {
            Ok(Ok(adapter)) => adapter,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(DispatchError::AdapterTimeout),
        };

        let (handle, finished) = Recorder::spawn(
            run_id.to_string(),
            adapter,
            sink_rx,
            self.store.clone(),
            self.sessions.clone(),
            self.hub.clone(),
            self.config.pre_start_buffer_bytes,
        );

        self.runs.lock().await.insert(run_id.to_string(), handle);

        let runs = self.runs.clone();
        let reap_run_id = run_id.to_string();
        tokio::spawn(async move {
            let _ = finished.await;
            runs.lock().await.remove(&reap_run_id);
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use dispatch_adapters::fake::FakeAdapterFactory;
    use dispatch_hub::DeliverOutcome;
    use dispatch_hub::DropReason;
    use dispatch_protocol::Event;
    use pretty_assertions::assert_eq;

    use super::*;

    struct RecordingSubscriber {
        received: StdMutex<Vec<i64>>,
        dropped: StdMutex<Option<DropReason>>,
    }

    impl RecordingSubscriber {
        fn new() -> Arc<Self> {
            Arc::new(RecordingSubscriber {
                received: StdMutex::new(Vec::new()),
                dropped: StdMutex::new(None),
            })
        }

        fn seqs(&self) -> Vec<i64> {
            self.received.lock().unwrap_or_else(|p| p.into_inner()).clone()
        }
    }

    #[async_trait]
    impl Subscriber for RecordingSubscriber {
        async fn deliver(&self, event: Event) -> DeliverOutcome {
            self.received.lock().unwrap_or_else(|p| p.into_inner()).push(event.seq);
            DeliverOutcome::Ok
        }

        async fn on_dropped(&self, reason: DropReason) {
            *self.dropped.lock().unwrap_or_else(|p| p.into_inner()) = Some(reason);
        }
    }

    async fn new_test_orchestrator() -> (Orchestrator, FakeAdapterFactory, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, sessions, workspaces) = dispatch_store::open(dir.path().join("dispatch.sqlite")).expect("open store");
        let hub = Arc::new(SubscriptionHub::new(store.clone()));

        let factory = FakeAdapterFactory::new(RunKind::Pty);
        let mut registry = AdapterRegistry::new();
        registry.register(Box::new(factory.clone()));

        let orchestrator = Orchestrator::new(
            registry,
            store,
            sessions,
            workspaces,
            hub,
            OrchestratorConfig::default(),
        );
        (orchestrator, factory, dir)
    }

    #[tokio::test]
    async fn create_auto_creates_workspace_and_marks_run_running_after_flush() {
        let (orch, factory, _dir) = new_test_orchestrator().await;

        let run_id = orch.create(RunKind::Pty, "/w/demo", serde_json::json!({})).await.unwrap();
        assert!(run_id.starts_with("pty-"));

        let ws = orch.workspaces().get("/w/demo").await.unwrap().unwrap();
        assert_eq!(ws.name, "demo");

        let controller = factory.last_instance().unwrap();
        controller.emit("pty:stdout", "chunk", serde_json::json!({"bytes": "aGk="}));

        let mut run = None;
        for _ in 0..50 {
            run = orch.find(&run_id).await.unwrap();
            if matches!(run.as_ref().map(|r| r.status), Some(RunStatus::Running)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(run.unwrap().status, RunStatus::Running);
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected_before_any_row_is_inserted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, sessions, workspaces) = dispatch_store::open(dir.path().join("dispatch.sqlite")).expect("open store");
        let hub = Arc::new(SubscriptionHub::new(store.clone()));
        // Registry with no adapters registered at all: even though `RunKind`
        // is a closed compile-time enum, an embedder building a registry by
        // hand can still omit a kind (`spec.md` §4.4: "registry MUST reject
        // start for unknown kinds").
        let registry = AdapterRegistry::new();
        let orch = Orchestrator::new(registry, store, sessions.clone(), workspaces, hub, OrchestratorConfig::default());

        let err = orch.create(RunKind::Pty, "/w/demo", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownKind(_)));

        assert!(sessions.list().await.unwrap().is_empty(), "unknown kind must not insert a run row");
    }

    #[tokio::test]
    async fn two_subscribers_attach_and_see_identical_order() {
        let (orch, factory, _dir) = new_test_orchestrator().await;
        let run_id = orch.create(RunKind::Pty, "/w/demo", serde_json::json!({})).await.unwrap();
        let controller = factory.last_instance().unwrap();

        for _ in 0..50 {
            if matches!(orch.find(&run_id).await.unwrap().map(|r| r.status), Some(RunStatus::Running)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let a = RecordingSubscriber::new();
        let b = RecordingSubscriber::new();
        let _ha = orch.attach(&run_id, 1, a.clone()).await.unwrap();
        let _hb = orch.attach(&run_id, 1, b.clone()).await.unwrap();

        orch.input(&run_id, b"echo hi\n".to_vec()).await.unwrap();
        for seq in 0..3 {
            controller.emit("pty:stdout", "chunk", serde_json::json!({"i": seq}));
        }

        for _ in 0..50 {
            if a.seqs().len() == 3 && b.seqs().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(a.seqs(), b.seqs());
        assert_eq!(controller.inputs(), vec![b"echo hi\n".to_vec()]);
    }

    #[tokio::test]
    async fn catch_up_after_reconnect_delivers_exactly_the_missed_range() {
        let (orch, factory, _dir) = new_test_orchestrator().await;
        let run_id = orch.create(RunKind::Pty, "/w/demo", serde_json::json!({})).await.unwrap();
        let controller = factory.last_instance().unwrap();

        for _ in 0..50 {
            if matches!(orch.find(&run_id).await.unwrap().map(|r| r.status), Some(RunStatus::Running)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for seq in 0..10 {
            controller.emit("pty:stdout", "chunk", serde_json::json!({"i": seq}));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let max_seq = orch.store().max_seq(&run_id).await.unwrap();
        assert_eq!(max_seq, 10);

        let subscriber = RecordingSubscriber::new();
        let _handle = orch.attach(&run_id, max_seq - 4, subscriber.clone()).await.unwrap();
        for _ in 0..50 {
            if subscriber.seqs().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(subscriber.seqs(), (max_seq - 4..=max_seq).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn close_transitions_to_stopped_and_is_idempotent() {
        let (orch, factory, _dir) = new_test_orchestrator().await;
        let run_id = orch.create(RunKind::Pty, "/w/demo", serde_json::json!({})).await.unwrap();
        let controller = factory.last_instance().unwrap();

        for _ in 0..50 {
            if matches!(orch.find(&run_id).await.unwrap().map(|r| r.status), Some(RunStatus::Running)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        orch.close(&run_id).await.unwrap();
        assert!(controller.is_closed());

        let mut run = None;
        for _ in 0..50 {
            run = orch.find(&run_id).await.unwrap();
            if matches!(run.as_ref().map(|r| r.status), Some(RunStatus::Stopped)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(run.unwrap().status, RunStatus::Stopped);

        // Idempotent: now that the Recorder has finished and removed itself
        // from the run table, closing again must still succeed.
        orch.close(&run_id).await.unwrap();
    }

    #[tokio::test]
    async fn input_after_close_reports_not_live() {
        let (orch, factory, _dir) = new_test_orchestrator().await;
        let run_id = orch.create(RunKind::Pty, "/w/demo", serde_json::json!({})).await.unwrap();
        for _ in 0..50 {
            if matches!(orch.find(&run_id).await.unwrap().map(|r| r.status), Some(RunStatus::Running)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = factory.last_instance().unwrap();
        orch.close(&run_id).await.unwrap();

        for _ in 0..50 {
            if orch.runs.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = orch.input(&run_id, b"too late".to_vec()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotLive(_)));
    }

    #[tokio::test]
    async fn resume_rejected_for_non_resumable_kind() {
        let (orch, _factory, _dir) = new_test_orchestrator().await;
        let run_id = orch.create(RunKind::Pty, "/w/demo", serde_json::json!({})).await.unwrap();
        orch.close(&run_id).await.unwrap();
        for _ in 0..50 {
            if matches!(orch.find(&run_id).await.unwrap().map(|r| r.status), Some(RunStatus::Stopped)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = orch.resume(&run_id).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotResumable(_)));
    }

    #[tokio::test]
    async fn resume_continues_seq_without_gap_for_resumable_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, sessions, workspaces) = dispatch_store::open(dir.path().join("dispatch.sqlite")).expect("open store");
        let hub = Arc::new(SubscriptionHub::new(store.clone()));
        let factory = FakeAdapterFactory::new(RunKind::FileEditor);
        let mut registry = AdapterRegistry::new();
        registry.register(Box::new(factory.clone()));
        let orch = Orchestrator::new(registry, store, sessions, workspaces, hub, OrchestratorConfig::default());

        let run_id = orch
            .create(RunKind::FileEditor, "/w/demo", serde_json::json!({"filePath": "a.txt"}))
            .await
            .unwrap();
        let controller = factory.last_instance().unwrap();
        for seq in 0..3 {
            controller.emit("fileeditor", "save", serde_json::json!({"i": seq}));
        }
        for _ in 0..50 {
            if orch.store().max_seq(&run_id).await.unwrap() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        orch.close(&run_id).await.unwrap();
        for _ in 0..50 {
            if matches!(orch.find(&run_id).await.unwrap().map(|r| r.status), Some(RunStatus::Stopped)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let prev_max = orch.store().max_seq(&run_id).await.unwrap();

        orch.resume(&run_id).await.unwrap();
        let resumed_controller = factory.last_instance().unwrap();
        resumed_controller.emit("fileeditor", "save", serde_json::json!({"resumed": true}));

        let mut events = Vec::new();
        for _ in 0..50 {
            events = orch.store().read(&run_id, 1, 100).await.unwrap();
            if events.len() as i64 > prev_max {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let first_post_resume = events.iter().find(|e| e.seq == prev_max + 1);
        assert!(first_post_resume.is_some(), "expected seq {} present, got {events:?}", prev_max + 1);
    }

    #[tokio::test]
    async fn recover_crashed_runs_marks_orphaned_live_rows_crashed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, sessions, workspaces) = dispatch_store::open(dir.path().join("dispatch.sqlite")).expect("open store");
        let run = Run::new("pty-orphan".to_string(), RunKind::Pty, "/w/demo".to_string(), serde_json::json!({}));
        sessions.create(run).await.unwrap();
        sessions.set_status("pty-orphan", RunStatus::Running).await.unwrap();
        store
            .append("pty-orphan", "pty:stdout", "chunk", serde_json::json!({}), 1)
            .await
            .unwrap();

        let hub = Arc::new(SubscriptionHub::new(store.clone()));
        let registry = AdapterRegistry::with_builtin_adapters();
        let orch = Orchestrator::new(registry, store.clone(), sessions.clone(), workspaces, hub, OrchestratorConfig::default());

        let recovered = orch.recover_crashed_runs().await.unwrap();
        assert_eq!(recovered, 1);

        let run = sessions.find_by_id("pty-orphan").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Crashed);

        let events = store.read("pty-orphan", 1, 10).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, "host-restart");
        assert_eq!(events.last().unwrap().seq, 2);

        let err = orch.resume("pty-orphan").await.unwrap_err();
        assert!(matches!(err, DispatchError::NotResumable(_)));
    }
}
