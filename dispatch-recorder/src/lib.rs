//! Event Recorder (C5, `spec.md` §4.5): the per-run owner of a live adapter
//! handle and the sole writer of that run's event log.
//!
//! Grounded on the teacher's `RolloutRecorder` writer-task shape, generalized
//! here from "one task owns a file" to "one task owns an adapter handle plus
//! the store/hub pipeline downstream of it". The recorder does not call
//! `AdapterRegistry::start` itself (that belongs to the orchestrator, which
//! owns the start-timeout suspension point per `spec.md` §5); it is handed an
//! already-started [`AdapterHandle`] plus the sink receiver the adapter was
//! started with, so any output the adapter pushed while `start()` was still
//! resolving is already queued in that receiver (`spec.md` §4.5.1).

use std::collections::VecDeque;
use std::sync::Arc;

use dispatch_adapters::AdapterHandle;
use dispatch_adapters::ExitStatus;
use dispatch_adapters::SinkEvent;
use dispatch_hub::SubscriptionHub;
use dispatch_protocol::DispatchError;
use dispatch_protocol::Event;
use dispatch_protocol::RunStatus;
use dispatch_protocol::event::channel;
use dispatch_protocol::event::event_type;
use dispatch_store::EventStore;
use dispatch_store::SessionRepository;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::info;
use tracing::warn;

/// Default pre-start buffer budget (`spec.md` §6.4 `preStartBufferBytes`).
pub const DEFAULT_PRE_START_BUFFER_BYTES: usize = 1024 * 1024;

/// A thin handle the orchestrator keeps in its run table. Input/resize/close
/// forward straight to the adapter the recorder owns; the recorder itself has
/// no public mutation surface beyond that (`spec.md` §4.5: "Owns the adapter
/// handle").
#[derive(Clone)]
pub struct RecorderHandle {
    run_id: String,
    adapter: Arc<dyn AdapterHandle>,
}

impl RecorderHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn input(&self, bytes: Vec<u8>) -> Result<(), DispatchError> {
        self.adapter.input(bytes).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), DispatchError> {
        self.adapter.resize(cols, rows).await
    }

    pub async fn close(&self) -> Result<(), DispatchError> {
        self.adapter.close().await
    }
}

pub struct Recorder;

impl Recorder {
    /// Spawns the recorder's background task and returns a handle for
    /// routing client input plus a `finished` signal the orchestrator can
    /// await to know when to drop the run from its live table (`spec.md`
    /// §4.7: the orchestrator "owns the run table").
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        run_id: String,
        adapter: Box<dyn AdapterHandle>,
        sink_rx: mpsc::UnboundedReceiver<SinkEvent>,
        store: EventStore,
        sessions: SessionRepository,
        hub: Arc<SubscriptionHub>,
        pre_start_buffer_bytes: usize,
    ) -> (RecorderHandle, oneshot::Receiver<()>) {
        let adapter: Arc<dyn AdapterHandle> = Arc::from(adapter);
        let (finished_tx, finished_rx) = oneshot::channel();

        let task_adapter = adapter.clone();
        let task_run_id = run_id.clone();
        tokio::spawn(async move {
            run(
                task_run_id,
                task_adapter,
                sink_rx,
                store,
                sessions,
                hub,
                pre_start_buffer_bytes,
            )
            .await;
            let _ = finished_tx.send(());
        });

        (RecorderHandle { run_id, adapter }, finished_rx)
    }
}

fn approx_size(ev: &SinkEvent) -> usize {
    ev.channel.len() + ev.event_type.len() + serde_json::to_vec(&ev.payload).map(|b| b.len()).unwrap_or(0)
}

async fn append_and_publish(
    run_id: &str,
    ev: &SinkEvent,
    store: &EventStore,
    hub: &SubscriptionHub,
) -> Result<(), DispatchError> {
    let ts = dispatch_protocol::now_millis();
    let seq = store
        .append(run_id, &ev.channel, &ev.event_type, ev.payload.clone(), ts)
        .await?;
    hub.publish(Event {
        run_id: run_id.to_string(),
        seq,
        channel: ev.channel.clone(),
        event_type: ev.event_type.clone(),
        payload: ev.payload.clone(),
        ts,
    })
    .await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run(
    run_id: String,
    adapter: Arc<dyn AdapterHandle>,
    mut sink_rx: mpsc::UnboundedReceiver<SinkEvent>,
    store: EventStore,
    sessions: SessionRepository,
    hub: Arc<SubscriptionHub>,
    pre_start_buffer_bytes: usize,
) {
    // Phase 1 (`spec.md` §4.5.1): drain whatever the adapter already pushed
    // into the sink while `start()` was resolving, bounding the buffer by
    // `preStartBufferBytes` and dropping the oldest event on overflow.
    let mut buffered: VecDeque<SinkEvent> = VecDeque::new();
    let mut buffered_bytes = 0usize;
    let mut dropped_bytes = 0usize;
    let mut dropped_events = 0usize;
    while let Ok(ev) = sink_rx.try_recv() {
        buffered_bytes += approx_size(&ev);
        buffered.push_back(ev);
        while buffered_bytes > pre_start_buffer_bytes {
            let Some(oldest) = buffered.pop_front() else { break };
            buffered_bytes -= approx_size(&oldest);
            dropped_bytes += approx_size(&oldest);
            dropped_events += 1;
        }
    }

    // Phase 2 (`spec.md` §4.5.2): flush the buffer in arrival order, append
    // the overflow marker if anything was dropped, then mark the run live.
    for ev in buffered.drain(..) {
        if let Err(e) = append_and_publish(&run_id, &ev, &store, &hub).await {
            return fail_run(&run_id, e, &adapter, &store, &sessions, &hub).await;
        }
    }
    if dropped_events > 0 {
        let overflow = SinkEvent {
            channel: channel::SYSTEM.to_string(),
            event_type: event_type::OVERFLOW.to_string(),
            payload: serde_json::json!({ "droppedBytes": dropped_bytes, "droppedEvents": dropped_events }),
        };
        if let Err(e) = append_and_publish(&run_id, &overflow, &store, &hub).await {
            return fail_run(&run_id, e, &adapter, &store, &sessions, &hub).await;
        }
    }

    if let Err(e) = sessions.set_status(&run_id, RunStatus::Running).await {
        warn!(run_id = %run_id, error = %e, "failed to mark run running after flush");
    } else {
        info!(run_id = %run_id, "run is live");
    }

    // Phase 3: live loop. Each iteration either appends one more sink event
    // or learns the adapter has exited; on exit, any events the adapter
    // queued concurrently with the exit signal are drained best-effort before
    // the terminal event is appended, keeping ordering sane for the common
    // case where output fully precedes process death (`spec.md` §4.4 `close`:
    // "must drain pending output into sink before resolving").
    loop {
        tokio::select! {
            msg = sink_rx.recv() => {
                match msg {
                    Some(ev) => {
                        if let Err(e) = append_and_publish(&run_id, &ev, &store, &hub).await {
                            return fail_run(&run_id, e, &adapter, &store, &sessions, &hub).await;
                        }
                    }
                    None => {
                        let status = adapter.wait_exit().await;
                        return finish_run(&run_id, status, &store, &sessions, &hub).await;
                    }
                }
            }
            status = adapter.wait_exit() => {
                while let Ok(ev) = sink_rx.try_recv() {
                    if let Err(e) = append_and_publish(&run_id, &ev, &store, &hub).await {
                        return fail_run(&run_id, e, &adapter, &store, &sessions, &hub).await;
                    }
                }
                return finish_run(&run_id, status, &store, &sessions, &hub).await;
            }
        }
    }
}

/// `spec.md` §4.5 exit step: append the final `system/exit` event, set
/// terminal status, then let the Hub know no more events are coming.
async fn finish_run(
    run_id: &str,
    status: ExitStatus,
    store: &EventStore,
    sessions: &SessionRepository,
    hub: &SubscriptionHub,
) {
    let clean = matches!(status.code, Some(0));
    let exit_event = SinkEvent {
        channel: channel::SYSTEM.to_string(),
        event_type: event_type::EXIT.to_string(),
        payload: serde_json::json!({ "code": status.code, "reason": status.reason }),
    };
    if let Err(e) = append_and_publish(run_id, &exit_event, store, hub).await {
        warn!(run_id = %run_id, error = %e, "failed to append final exit event");
    }

    let terminal = if clean { RunStatus::Stopped } else { RunStatus::Crashed };
    if let Err(e) = sessions.set_status(run_id, terminal).await {
        warn!(run_id = %run_id, error = %e, "failed to persist terminal status");
    }
    info!(run_id = %run_id, status = terminal.as_str(), "run finished");
    hub.close_run(run_id).await;
}

/// `spec.md` §4.5 error policy: best-effort error event, request adapter
/// close, force status to crashed, close the fan-out stream.
async fn fail_run(
    run_id: &str,
    cause: DispatchError,
    adapter: &Arc<dyn AdapterHandle>,
    store: &EventStore,
    sessions: &SessionRepository,
    hub: &SubscriptionHub,
) {
    tracing::error!(run_id = %run_id, error = %cause, "event store append failed, run is a total loss");
    // Append is exactly what just failed, so this attempt will often fail
    // too; its own failure is swallowed, matching "attempts to emit ...
    // (best-effort)" rather than skipping the attempt outright.
    let _ = store_error_event_best_effort(run_id, &cause, store, hub).await;
    let _ = adapter.close().await;
    if let Err(e) = sessions.set_status(run_id, RunStatus::Crashed).await {
        warn!(run_id = %run_id, error = %e, "failed to persist crashed status after store failure");
    }
    hub.close_run(run_id).await;
}

/// Best-effort append of the `(system, error)` event `spec.md` §4.5 calls
/// for; swallows its own failure (the store is exactly what just failed, so
/// this is expected to fail too in the common case).
async fn store_error_event_best_effort(
    run_id: &str,
    cause: &DispatchError,
    store: &EventStore,
    hub: &SubscriptionHub,
) -> Result<(), DispatchError> {
    let ts = dispatch_protocol::now_millis();
    let seq = store
        .append(run_id, channel::SYSTEM, event_type::ERROR, serde_json::json!({ "message": cause.to_string() }), ts)
        .await?;
    hub.publish(Event {
        run_id: run_id.to_string(),
        seq,
        channel: channel::SYSTEM.to_string(),
        event_type: event_type::ERROR.to_string(),
        payload: serde_json::json!({ "message": cause.to_string() }),
        ts,
    })
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use dispatch_adapters::fake::FakeAdapterFactory;
    use dispatch_adapters::AdapterFactory;
    use dispatch_protocol::RunKind;
    use pretty_assertions::assert_eq;

    use super::*;

    async fn new_test_env() -> (EventStore, SessionRepository, Arc<SubscriptionHub>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, sessions, _ws) = dispatch_store::open(dir.path().join("dispatch.sqlite")).expect("open store");
        let hub = Arc::new(SubscriptionHub::new(store.clone()));
        (store, sessions, hub, dir)
    }

    async fn seed_run(sessions: &SessionRepository, run_id: &str) {
        let run = dispatch_protocol::Run::new(
            run_id.to_string(),
            RunKind::Pty,
            "/workspace".to_string(),
            serde_json::json!({}),
        );
        sessions.create(run).await.expect("seed run row");
    }

    #[tokio::test]
    async fn pre_start_events_flush_in_order_then_run_goes_live() {
        let (store, sessions, hub, _dir) = new_test_env().await;
        seed_run(&sessions, "pty-1").await;

        let factory = FakeAdapterFactory::new(RunKind::Pty);
        let (sink, sink_rx) = tokio::sync::mpsc::unbounded_channel();
        let adapter = factory.start("/workspace", &serde_json::json!({}), sink).await.unwrap();
        let controller = factory.last_instance().unwrap();

        // Emit before the recorder task has been spawned, simulating output
        // produced while `adapter.start()` was still resolving.
        controller.emit("pty:stdout", "chunk", serde_json::json!({"bytes": "aGk="}));
        controller.emit("pty:stdout", "chunk", serde_json::json!({"bytes": "dGhlcmU="}));

        let (_handle, _finished) =
            Recorder::spawn("pty-1".to_string(), adapter, sink_rx, store.clone(), sessions.clone(), hub, DEFAULT_PRE_START_BUFFER_BYTES);

        let mut events = Vec::new();
        for _ in 0..50 {
            events = store.read("pty-1", 1, 10).await.unwrap();
            if events.len() >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);

        let mut run = None;
        for _ in 0..50 {
            run = sessions.find_by_id("pty-1").await.unwrap();
            if matches!(run.as_ref().map(|r| r.status), Some(RunStatus::Running)) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(run.unwrap().status, RunStatus::Running);
    }

    #[tokio::test]
    async fn overflowing_pre_start_buffer_drops_oldest_and_appends_overflow_marker() {
        let (store, sessions, hub, _dir) = new_test_env().await;
        seed_run(&sessions, "pty-1").await;

        let factory = FakeAdapterFactory::new(RunKind::Pty);
        let (sink, sink_rx) = tokio::sync::mpsc::unbounded_channel();
        let adapter = factory.start("/workspace", &serde_json::json!({}), sink).await.unwrap();
        let controller = factory.last_instance().unwrap();

        let big_payload = "x".repeat(40);
        for _ in 0..3 {
            controller.emit("pty:stdout", "chunk", serde_json::json!({"bytes": big_payload}));
        }

        let (_handle, _finished) = Recorder::spawn(
            "pty-1".to_string(),
            adapter,
            sink_rx,
            store.clone(),
            sessions.clone(),
            hub,
            50, // tiny budget: only the newest event plus the overflow marker should survive
        );

        let mut events = Vec::new();
        for _ in 0..50 {
            events = store.read("pty-1", 1, 10).await.unwrap();
            if events.iter().any(|e| e.event_type == "overflow") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(events.iter().any(|e| e.event_type == "overflow"));
        assert!(events.len() < 4, "expected some pre-start events to be dropped, got {events:?}");
    }

    #[tokio::test]
    async fn adapter_exit_appends_exit_event_and_sets_terminal_status() {
        let (store, sessions, hub, _dir) = new_test_env().await;
        seed_run(&sessions, "pty-1").await;

        let factory = FakeAdapterFactory::new(RunKind::Pty);
        let (sink, sink_rx) = tokio::sync::mpsc::unbounded_channel();
        let adapter = factory.start("/workspace", &serde_json::json!({}), sink).await.unwrap();
        let controller = factory.last_instance().unwrap();

        let (_handle, finished) =
            Recorder::spawn("pty-1".to_string(), adapter, sink_rx, store.clone(), sessions.clone(), hub, DEFAULT_PRE_START_BUFFER_BYTES);

        controller.trigger_exit(Some(0), "exited");
        finished.await.expect("recorder task completes");

        let events = store.read("pty-1", 1, 10).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, "exit");

        let run = sessions.find_by_id("pty-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Stopped);
    }

    #[tokio::test]
    async fn non_zero_exit_marks_run_crashed() {
        let (store, sessions, hub, _dir) = new_test_env().await;
        seed_run(&sessions, "pty-1").await;

        let factory = FakeAdapterFactory::new(RunKind::Pty);
        let (sink, sink_rx) = tokio::sync::mpsc::unbounded_channel();
        let adapter = factory.start("/workspace", &serde_json::json!({}), sink).await.unwrap();
        let controller = factory.last_instance().unwrap();

        let (_handle, finished) =
            Recorder::spawn("pty-1".to_string(), adapter, sink_rx, store.clone(), sessions.clone(), hub, DEFAULT_PRE_START_BUFFER_BYTES);

        controller.trigger_exit(Some(1), "exited with error");
        finished.await.expect("recorder task completes");

        let run = sessions.find_by_id("pty-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Crashed);
    }

    #[tokio::test]
    async fn recorder_handle_forwards_input_resize_close_to_adapter() {
        let (store, sessions, hub, _dir) = new_test_env().await;
        seed_run(&sessions, "pty-1").await;

        let factory = FakeAdapterFactory::new(RunKind::Pty);
        let (sink, sink_rx) = tokio::sync::mpsc::unbounded_channel();
        let adapter = factory.start("/workspace", &serde_json::json!({}), sink).await.unwrap();
        let controller = factory.last_instance().unwrap();

        let (handle, finished) =
            Recorder::spawn("pty-1".to_string(), adapter, sink_rx, store.clone(), sessions.clone(), hub, DEFAULT_PRE_START_BUFFER_BYTES);

        handle.input(b"echo hi\n".to_vec()).await.unwrap();
        handle.resize(120, 40).await.unwrap();
        assert_eq!(controller.inputs(), vec![b"echo hi\n".to_vec()]);
        assert_eq!(controller.resizes(), vec![(120, 40)]);

        handle.close().await.unwrap();
        finished.await.expect("recorder task completes");
        assert!(controller.is_closed());
    }
}
