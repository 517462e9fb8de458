//! Single-writer actor wrapping the embedded SQLite connection.
//!
//! `spec.md` §4.1/§5: "the Event Store may serialize writes globally (a
//! single write task wrapping the embedded DB)". We take that option: one
//! background thread owns the one `rusqlite::Connection` and processes
//! commands off an mpsc queue strictly in order, the same shape as the
//! rollout recorder's writer task this crate is grounded on.

use std::path::Path;
use std::path::PathBuf;

use dispatch_protocol::DispatchError;
use dispatch_protocol::Event;
use dispatch_protocol::Run;
use dispatch_protocol::RunStatus;
use dispatch_protocol::Workspace;
use dispatch_protocol::WorkspacePatch;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

type Reply<T> = oneshot::Sender<Result<T, DispatchError>>;

pub(crate) enum Command {
    AppendEvent {
        run_id: String,
        channel: String,
        event_type: String,
        payload: serde_json::Value,
        ts: i64,
        reply: Reply<i64>,
    },
    ReadEvents {
        run_id: String,
        from_seq: i64,
        limit: i64,
        reply: Reply<Vec<Event>>,
    },
    MaxSeq {
        run_id: String,
        reply: Reply<i64>,
    },
    CreateRun {
        run: Run,
        reply: Reply<()>,
    },
    FindRun {
        run_id: String,
        reply: Reply<Option<Run>>,
    },
    ListRuns {
        reply: Reply<Vec<Run>>,
    },
    ListRunsByKind {
        kind: String,
        reply: Reply<Vec<Run>>,
    },
    SetStatus {
        run_id: String,
        status: RunStatus,
        reply: Reply<()>,
    },
    UpdateMetadata {
        run_id: String,
        patch: serde_json::Value,
        reply: Reply<()>,
    },
    SetLayout {
        run_id: String,
        client_id: String,
        tile_id: Option<String>,
        reply: Reply<()>,
    },
    CreateWorkspace {
        path: String,
        name: Option<String>,
        theme_override: Option<String>,
        reply: Reply<Workspace>,
    },
    GetWorkspace {
        path: String,
        reply: Reply<Option<Workspace>>,
    },
    TouchWorkspace {
        path: String,
        reply: Reply<()>,
    },
    UpdateWorkspace {
        path: String,
        patch: WorkspacePatch,
        reply: Reply<Workspace>,
    },
    ListWorkspaces {
        reply: Reply<Vec<Workspace>>,
    },
    DeleteWorkspace {
        path: String,
        reply: Reply<()>,
    },
}

#[derive(Clone)]
pub(crate) struct ActorHandle {
    tx: mpsc::Sender<Command>,
}

impl ActorHandle {
    pub(crate) fn spawn(db_path: PathBuf) -> Result<Self, DispatchError> {
        let (tx, rx) = mpsc::channel(256);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("dispatch-store-writer".to_string())
            .spawn(move || run_writer(db_path, rx, ready_tx))
            .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| DispatchError::StoreUnavailable("writer thread died during open".to_string()))??;

        Ok(ActorHandle { tx })
    }

    pub(crate) async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| DispatchError::StoreUnavailable("writer thread gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| DispatchError::StoreUnavailable("writer thread dropped reply".to_string()))?
    }
}

fn run_writer(
    db_path: PathBuf,
    mut rx: mpsc::Receiver<Command>,
    ready_tx: std::sync::mpsc::Sender<Result<(), DispatchError>>,
) {
    let conn = match open_connection(&db_path) {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    while let Some(cmd) = rx.blocking_recv() {
        handle_command(&conn, cmd);
    }
}

fn open_connection(db_path: &Path) -> Result<Connection, DispatchError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(DispatchError::Io)?;
    }
    let conn = Connection::open(db_path)
        .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    crate::schema::run_migrations(&conn)
        .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    Ok(conn)
}

fn handle_command(conn: &Connection, cmd: Command) {
    match cmd {
        Command::AppendEvent {
            run_id,
            channel,
            event_type,
            payload,
            ts,
            reply,
        } => {
            let _ = reply.send(append_event(conn, &run_id, &channel, &event_type, &payload, ts));
        }
        Command::ReadEvents {
            run_id,
            from_seq,
            limit,
            reply,
        } => {
            let _ = reply.send(read_events(conn, &run_id, from_seq, limit));
        }
        Command::MaxSeq { run_id, reply } => {
            let _ = reply.send(max_seq(conn, &run_id));
        }
        Command::CreateRun { run, reply } => {
            let _ = reply.send(create_run(conn, &run));
        }
        Command::FindRun { run_id, reply } => {
            let _ = reply.send(find_run(conn, &run_id));
        }
        Command::ListRuns { reply } => {
            let _ = reply.send(list_runs(conn, None));
        }
        Command::ListRunsByKind { kind, reply } => {
            let _ = reply.send(list_runs(conn, Some(&kind)));
        }
        Command::SetStatus {
            run_id,
            status,
            reply,
        } => {
            let _ = reply.send(set_status(conn, &run_id, status));
        }
        Command::UpdateMetadata {
            run_id,
            patch,
            reply,
        } => {
            let _ = reply.send(update_metadata(conn, &run_id, patch));
        }
        Command::SetLayout {
            run_id,
            client_id,
            tile_id,
            reply,
        } => {
            let _ = reply.send(set_layout(conn, &run_id, &client_id, tile_id));
        }
        Command::CreateWorkspace {
            path,
            name,
            theme_override,
            reply,
        } => {
            let _ = reply.send(create_workspace(conn, &path, name, theme_override));
        }
        Command::GetWorkspace { path, reply } => {
            let _ = reply.send(get_workspace(conn, &path));
        }
        Command::TouchWorkspace { path, reply } => {
            let _ = reply.send(touch_workspace(conn, &path));
        }
        Command::UpdateWorkspace { path, patch, reply } => {
            let _ = reply.send(update_workspace(conn, &path, patch));
        }
        Command::ListWorkspaces { reply } => {
            let _ = reply.send(list_workspaces(conn));
        }
        Command::DeleteWorkspace { path, reply } => {
            let _ = reply.send(delete_workspace(conn, &path));
        }
    }
}

// --- events -----------------------------------------------------------

fn max_seq(conn: &Connection, run_id: &str) -> Result<i64, DispatchError> {
    conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) FROM events WHERE run_id = ?1",
        params![run_id],
        |row| row.get(0),
    )
    .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))
}

fn append_event(
    conn: &Connection,
    run_id: &str,
    channel: &str,
    event_type: &str,
    payload: &serde_json::Value,
    ts: i64,
) -> Result<i64, DispatchError> {
    let next_seq = max_seq(conn, run_id)? + 1;
    let payload_bytes =
        serde_json::to_vec(payload).map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    conn.execute(
        "INSERT INTO events (run_id, seq, channel, type, payload, ts) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![run_id, next_seq, channel, event_type, payload_bytes, ts],
    )
    .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    Ok(next_seq)
}

fn read_events(
    conn: &Connection,
    run_id: &str,
    from_seq: i64,
    limit: i64,
) -> Result<Vec<Event>, DispatchError> {
    let mut stmt = conn
        .prepare(
            "SELECT run_id, seq, channel, type, payload, ts FROM events
             WHERE run_id = ?1 AND seq >= ?2 ORDER BY seq ASC LIMIT ?3",
        )
        .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;

    let rows = stmt
        .query_map(params![run_id, from_seq, limit], row_to_event)
        .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row.map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?);
    }
    Ok(events)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let payload_bytes: Vec<u8> = row.get(4)?;
    let payload = serde_json::from_slice(&payload_bytes).unwrap_or(serde_json::Value::Null);
    Ok(Event {
        run_id: row.get(0)?,
        seq: row.get(1)?,
        channel: row.get(2)?,
        event_type: row.get(3)?,
        payload,
        ts: row.get(5)?,
    })
}

// --- runs (C2) ----------------------------------------------------------

fn create_run(conn: &Connection, run: &Run) -> Result<(), DispatchError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT run_id FROM runs WHERE run_id = ?1",
            params![run.run_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    if existing.is_some() {
        return Err(DispatchError::Conflict(format!("run {} already exists", run.run_id)));
    }

    let metadata_bytes =
        serde_json::to_vec(&run.metadata).map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    conn.execute(
        "INSERT INTO runs (run_id, kind, workspace_path, status, metadata_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run.run_id,
            run.kind.as_str(),
            run.workspace_path,
            run.status.as_str(),
            metadata_bytes,
            run.created_at,
            run.updated_at,
        ],
    )
    .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    Ok(())
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let kind_str: String = row.get(1)?;
    let status_str: String = row.get(3)?;
    let metadata_bytes: Vec<u8> = row.get(4)?;
    Ok(Run {
        run_id: row.get(0)?,
        kind: kind_str.parse().unwrap_or(dispatch_protocol::RunKind::Pty),
        workspace_path: row.get(2)?,
        status: status_str.parse().unwrap_or(dispatch_protocol::RunStatus::Crashed),
        metadata: serde_json::from_slice(&metadata_bytes).unwrap_or(serde_json::Value::Null),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn find_run(conn: &Connection, run_id: &str) -> Result<Option<Run>, DispatchError> {
    conn.query_row(
        "SELECT run_id, kind, workspace_path, status, metadata_json, created_at, updated_at
         FROM runs WHERE run_id = ?1",
        params![run_id],
        row_to_run,
    )
    .optional()
    .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))
}

fn list_runs(conn: &Connection, kind: Option<&str>) -> Result<Vec<Run>, DispatchError> {
    let sql = match kind {
        Some(_) => {
            "SELECT run_id, kind, workspace_path, status, metadata_json, created_at, updated_at
             FROM runs WHERE kind = ?1 ORDER BY created_at ASC"
        }
        None => {
            "SELECT run_id, kind, workspace_path, status, metadata_json, created_at, updated_at
             FROM runs ORDER BY created_at ASC"
        }
    };
    let mut stmt = conn.prepare(sql).map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    let rows = match kind {
        Some(k) => stmt.query_map(params![k], row_to_run),
        None => stmt.query_map(params![], row_to_run),
    }
    .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;

    let mut runs = Vec::new();
    for row in rows {
        runs.push(row.map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?);
    }
    Ok(runs)
}

fn set_status(conn: &Connection, run_id: &str, status: RunStatus) -> Result<(), DispatchError> {
    let updated = conn
        .execute(
            "UPDATE runs SET status = ?1, updated_at = ?2 WHERE run_id = ?3",
            params![status.as_str(), dispatch_protocol::now_millis(), run_id],
        )
        .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    if updated == 0 {
        return Err(DispatchError::NoSuchRun(run_id.to_string()));
    }
    Ok(())
}

fn update_metadata(
    conn: &Connection,
    run_id: &str,
    patch: serde_json::Value,
) -> Result<(), DispatchError> {
    let current: Option<Vec<u8>> = conn
        .query_row(
            "SELECT metadata_json FROM runs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    let Some(current_bytes) = current else {
        return Err(DispatchError::NoSuchRun(run_id.to_string()));
    };
    let mut current_value: serde_json::Value =
        serde_json::from_slice(&current_bytes).unwrap_or(serde_json::Value::Object(Default::default()));
    if let (Some(current_obj), serde_json::Value::Object(patch_obj)) =
        (current_value.as_object_mut(), patch)
    {
        for (k, v) in patch_obj {
            current_obj.insert(k, v);
        }
    }
    let new_bytes =
        serde_json::to_vec(&current_value).map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    conn.execute(
        "UPDATE runs SET metadata_json = ?1, updated_at = ?2 WHERE run_id = ?3",
        params![new_bytes, dispatch_protocol::now_millis(), run_id],
    )
    .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    Ok(())
}

fn set_layout(
    conn: &Connection,
    run_id: &str,
    client_id: &str,
    tile_id: Option<String>,
) -> Result<(), DispatchError> {
    match tile_id {
        Some(tile_id) => {
            conn.execute(
                "INSERT INTO run_layouts (run_id, client_id, tile_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT(run_id, client_id) DO UPDATE SET tile_id = excluded.tile_id",
                params![run_id, client_id, tile_id],
            )
            .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
        }
        None => {
            conn.execute(
                "DELETE FROM run_layouts WHERE run_id = ?1 AND client_id = ?2",
                params![run_id, client_id],
            )
            .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
        }
    }
    Ok(())
}

// --- workspaces (C3) -----------------------------------------------------

fn row_to_workspace(row: &rusqlite::Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        path: row.get(0)?,
        name: row.get(1)?,
        theme_override: row.get(2)?,
        last_active: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn create_workspace(
    conn: &Connection,
    path: &str,
    name: Option<String>,
    theme_override: Option<String>,
) -> Result<Workspace, DispatchError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT path FROM workspaces WHERE path = ?1",
            params![path],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    if existing.is_some() {
        return Err(DispatchError::Conflict(format!("workspace {path} already exists")));
    }

    let now = dispatch_protocol::now_millis();
    let name = name.unwrap_or_else(|| Workspace::derive_name(path));
    conn.execute(
        "INSERT INTO workspaces (path, name, theme_override, last_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, NULL, ?4, ?4)",
        params![path, name, theme_override, now],
    )
    .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;

    Ok(Workspace {
        path: path.to_string(),
        name,
        theme_override,
        last_active: None,
        created_at: now,
        updated_at: now,
    })
}

fn get_workspace(conn: &Connection, path: &str) -> Result<Option<Workspace>, DispatchError> {
    conn.query_row(
        "SELECT path, name, theme_override, last_active, created_at, updated_at
         FROM workspaces WHERE path = ?1",
        params![path],
        row_to_workspace,
    )
    .optional()
    .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))
}

fn touch_workspace(conn: &Connection, path: &str) -> Result<(), DispatchError> {
    let now = dispatch_protocol::now_millis();
    conn.execute(
        "UPDATE workspaces SET last_active = ?1, updated_at = ?1 WHERE path = ?2",
        params![now, path],
    )
    .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    Ok(())
}

fn update_workspace(
    conn: &Connection,
    path: &str,
    patch: WorkspacePatch,
) -> Result<Workspace, DispatchError> {
    let Some(mut current) = get_workspace(conn, path)? else {
        return Err(DispatchError::NoSuchRun(path.to_string()));
    };
    if let Some(name) = patch.name {
        current.name = name;
    }
    if patch.theme_override.is_some() {
        current.theme_override = patch.theme_override;
    }
    current.updated_at = dispatch_protocol::now_millis();
    conn.execute(
        "UPDATE workspaces SET name = ?1, theme_override = ?2, updated_at = ?3 WHERE path = ?4",
        params![current.name, current.theme_override, current.updated_at, path],
    )
    .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    Ok(current)
}

fn list_workspaces(conn: &Connection) -> Result<Vec<Workspace>, DispatchError> {
    let mut stmt = conn
        .prepare(
            "SELECT path, name, theme_override, last_active, created_at, updated_at
             FROM workspaces ORDER BY last_active DESC, updated_at DESC",
        )
        .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    let rows = stmt
        .query_map(params![], row_to_workspace)
        .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?);
    }
    Ok(out)
}

fn delete_workspace(conn: &Connection, path: &str) -> Result<(), DispatchError> {
    conn.execute("DELETE FROM workspaces WHERE path = ?1", params![path])
        .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
    Ok(())
}
