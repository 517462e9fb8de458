//! Embedded persistence for the Session Core: the Event Store (C1), the
//! Session Repository (C2), and the Workspace Repository (C3).
//!
//! All three share one SQLite file and one writer thread (`actor.rs`) per
//! `spec.md` §4.1/§5: "the Event Store may serialize writes globally (a
//! single write task wrapping the embedded DB)". Each repository is a thin,
//! cheaply-cloneable handle over that shared actor so callers can hold just
//! the repository they need without reaching into the others.

mod actor;
mod schema;

use std::path::PathBuf;
use std::sync::Arc;

use actor::ActorHandle;
use actor::Command;
use dispatch_protocol::DispatchError;
use dispatch_protocol::Event;
use dispatch_protocol::Run;
use dispatch_protocol::RunStatus;
use dispatch_protocol::Workspace;
use dispatch_protocol::WorkspacePatch;

/// Opens (creating if absent) the SQLite file at `db_path` and spawns its
/// writer thread. Clone the returned handles freely; they are cheap (an
/// `mpsc::Sender` each) and all route to the same connection.
pub fn open(db_path: impl Into<PathBuf>) -> Result<(EventStore, SessionRepository, WorkspaceRepository), DispatchError> {
    let actor = Arc::new(ActorHandle::spawn(db_path.into())?);
    Ok((
        EventStore { actor: actor.clone() },
        SessionRepository { actor: actor.clone() },
        WorkspaceRepository { actor },
    ))
}

/// C1: append-only persistent log keyed by `runId` (`spec.md` §4.1).
#[derive(Clone)]
pub struct EventStore {
    actor: Arc<ActorHandle>,
}

impl EventStore {
    /// Assigns `seq = maxSeq(runId) + 1`, persists, and returns the seq.
    /// Callers (only the Event Recorder) must not call this concurrently
    /// for the same `runId`; this crate does not itself re-check that,
    /// trusting the single-writer contract the recorder gives (`spec.md`
    /// §4.1, §5).
    pub async fn append(
        &self,
        run_id: &str,
        channel: &str,
        event_type: &str,
        payload: serde_json::Value,
        ts: i64,
    ) -> Result<i64, DispatchError> {
        let run_id = run_id.to_string();
        let channel = channel.to_string();
        let event_type = event_type.to_string();
        self.actor
            .call(|reply| Command::AppendEvent {
                run_id,
                channel,
                event_type,
                payload,
                ts,
                reply,
            })
            .await
    }

    /// Bounded scan ordered by `seq` ascending (`spec.md` §4.1).
    pub async fn read(&self, run_id: &str, from_seq: i64, limit: i64) -> Result<Vec<Event>, DispatchError> {
        let run_id = run_id.to_string();
        self.actor
            .call(|reply| Command::ReadEvents {
                run_id,
                from_seq,
                limit,
                reply,
            })
            .await
    }

    pub async fn max_seq(&self, run_id: &str) -> Result<i64, DispatchError> {
        let run_id = run_id.to_string();
        self.actor.call(|reply| Command::MaxSeq { run_id, reply }).await
    }
}

/// C2: durable run metadata; the orchestrator is the sole status-writer.
#[derive(Clone)]
pub struct SessionRepository {
    actor: Arc<ActorHandle>,
}

impl SessionRepository {
    pub async fn create(&self, run: Run) -> Result<(), DispatchError> {
        self.actor.call(|reply| Command::CreateRun { run, reply }).await
    }

    pub async fn find_by_id(&self, run_id: &str) -> Result<Option<Run>, DispatchError> {
        let run_id = run_id.to_string();
        self.actor.call(|reply| Command::FindRun { run_id, reply }).await
    }

    /// Insertion order (`spec.md` §4.2).
    pub async fn list(&self) -> Result<Vec<Run>, DispatchError> {
        self.actor.call(|reply| Command::ListRuns { reply }).await
    }

    pub async fn find_by_kind(&self, kind: &str) -> Result<Vec<Run>, DispatchError> {
        let kind = kind.to_string();
        self.actor.call(|reply| Command::ListRunsByKind { kind, reply }).await
    }

    pub async fn set_status(&self, run_id: &str, status: RunStatus) -> Result<(), DispatchError> {
        let run_id = run_id.to_string();
        self.actor
            .call(|reply| Command::SetStatus { run_id, status, reply })
            .await
    }

    pub async fn update_metadata(&self, run_id: &str, patch: serde_json::Value) -> Result<(), DispatchError> {
        let run_id = run_id.to_string();
        self.actor
            .call(|reply| Command::UpdateMetadata { run_id, patch, reply })
            .await
    }

    pub async fn set_layout(
        &self,
        run_id: &str,
        client_id: &str,
        tile_id: Option<String>,
    ) -> Result<(), DispatchError> {
        let run_id = run_id.to_string();
        let client_id = client_id.to_string();
        self.actor
            .call(|reply| Command::SetLayout {
                run_id,
                client_id,
                tile_id,
                reply,
            })
            .await
    }
}

/// C3: workspace records consumed when creating/attaching a run.
#[derive(Clone)]
pub struct WorkspaceRepository {
    actor: Arc<ActorHandle>,
}

impl WorkspaceRepository {
    pub async fn create(
        &self,
        path: &str,
        name: Option<String>,
        theme_override: Option<String>,
    ) -> Result<Workspace, DispatchError> {
        let path = path.to_string();
        self.actor
            .call(|reply| Command::CreateWorkspace {
                path,
                name,
                theme_override,
                reply,
            })
            .await
    }

    pub async fn get(&self, path: &str) -> Result<Option<Workspace>, DispatchError> {
        let path = path.to_string();
        self.actor.call(|reply| Command::GetWorkspace { path, reply }).await
    }

    /// Creates the workspace with defaults if it does not already exist,
    /// then touches `lastActive`. Used by the orchestrator on `create`
    /// (`spec.md` §4.7.1 step 2: "missing workspace is auto-created").
    pub async fn resolve_and_touch(&self, path: &str) -> Result<Workspace, DispatchError> {
        match self.get(path).await? {
            Some(_) => {
                self.touch(path).await?;
            }
            None => {
                self.create(path, None, None).await?;
                self.touch(path).await?;
            }
        }
        self.get(path)
            .await?
            .ok_or_else(|| DispatchError::StoreUnavailable("workspace vanished after create".to_string()))
    }

    pub async fn touch(&self, path: &str) -> Result<(), DispatchError> {
        let path = path.to_string();
        self.actor.call(|reply| Command::TouchWorkspace { path, reply }).await
    }

    pub async fn update(&self, path: &str, patch: WorkspacePatch) -> Result<Workspace, DispatchError> {
        let path = path.to_string();
        self.actor
            .call(|reply| Command::UpdateWorkspace { path, patch, reply })
            .await
    }

    /// Ordered `lastActive desc` then `updatedAt desc` (`spec.md` §4.3).
    pub async fn list(&self) -> Result<Vec<Workspace>, DispatchError> {
        self.actor.call(|reply| Command::ListWorkspaces { reply }).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), DispatchError> {
        let path = path.to_string();
        self.actor.call(|reply| Command::DeleteWorkspace { path, reply }).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use dispatch_protocol::RunKind;

    async fn new_test_store() -> (EventStore, SessionRepository, WorkspaceRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("dispatch.sqlite");
        let (events, runs, workspaces) = open(db_path).expect("open store");
        (events, runs, workspaces, dir)
    }

    #[tokio::test]
    async fn append_assigns_gapless_monotone_seq() {
        let (events, _runs, _ws, _dir) = new_test_store().await;
        let seq1 = events
            .append("pty-1", "pty:stdout", "chunk", serde_json::json!({"bytes": "a"}), 1)
            .await
            .expect("append 1");
        let seq2 = events
            .append("pty-1", "pty:stdout", "chunk", serde_json::json!({"bytes": "b"}), 2)
            .await
            .expect("append 2");
        assert_eq!(seq1, 1);
        assert_eq!(seq2, 2);

        let read = events.read("pty-1", 1, 10).await.expect("read");
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].seq, 1);
        assert_eq!(read[1].seq, 2);
    }

    #[tokio::test]
    async fn read_from_seq_returns_suffix_only() {
        let (events, _runs, _ws, _dir) = new_test_store().await;
        for i in 0..5 {
            events
                .append("pty-1", "pty:stdout", "chunk", serde_json::json!({"i": i}), i)
                .await
                .expect("append");
        }
        let tail = events.read("pty-1", 4, 10).await.expect("read");
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[tokio::test]
    async fn run_create_rejects_duplicate_id() {
        let (_events, runs, _ws, _dir) = new_test_store().await;
        let run = Run::new("pty-1".to_string(), RunKind::Pty, "/w/a".to_string(), serde_json::json!({}));
        runs.create(run.clone()).await.expect("first create");
        let err = runs.create(run).await.expect_err("duplicate should conflict");
        assert!(matches!(err, DispatchError::Conflict(_)));
    }

    #[tokio::test]
    async fn workspace_create_is_idempotence_checked() {
        let (_events, _runs, ws, _dir) = new_test_store().await;
        ws.create("/w/a", None, None).await.expect("create");
        let err = ws.create("/w/a", None, None).await.expect_err("dup should conflict");
        assert!(matches!(err, DispatchError::Conflict(_)));

        let resolved = ws.get("/w/a").await.expect("get").expect("present");
        assert_eq!(resolved.name, "a");
    }

    #[tokio::test]
    async fn resolve_and_touch_creates_missing_workspace() {
        let (_events, _runs, ws, _dir) = new_test_store().await;
        let resolved = ws.resolve_and_touch("/w/new").await.expect("auto-create");
        assert_eq!(resolved.name, "new");
        assert!(resolved.last_active.is_some());
    }

    #[tokio::test]
    async fn concurrent_appends_stay_gapless() {
        let (events, _runs, _ws, _dir) = new_test_store().await;
        let mut handles = Vec::new();
        for i in 0..20 {
            let events = events.clone();
            handles.push(tokio::spawn(async move {
                events
                    .append("pty-1", "pty:stdout", "chunk", serde_json::json!({"i": i}), i)
                    .await
                    .expect("append")
            }));
        }
        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.expect("join"));
        }
        seqs.sort_unstable();
        let expected: Vec<i64> = (1..=20).collect();
        assert_eq!(seqs, expected);
    }
}
