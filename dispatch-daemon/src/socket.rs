//! Socket/event facade (C8, `spec.md` §6.2): one `axum` WebSocket
//! connection per client, JSON-framed `ClientMessage`/`ServerMessage`
//! exactly as specified. Grounded on the teacher's
//! `app-server::outgoing_message::OutgoingMessageSender` shape: an `mpsc`
//! channel plus a background task that serializes outgoing messages onto
//! the socket, so handling an incoming message never blocks on socket I/O.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dispatch_hub::DeliverOutcome;
use dispatch_hub::DropReason;
use dispatch_hub::Subscriber;
use dispatch_hub::SubscriptionHandle;
use dispatch_protocol::ClientMessage;
use dispatch_protocol::Event;
use dispatch_protocol::MAX_FRAME_BYTES;
use dispatch_protocol::ServerMessage;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;

use crate::state::AppState;

/// Per-subscriber delivery queue capacity, in messages rather than bytes:
/// `dispatch-hub`'s own per-subscriber window (`spec.md` §6.4
/// `subscriberWindowBytes`) already enforces the byte-bounded backpressure
/// contract upstream of this; this channel only needs to be bounded at all
/// so a stalled socket write reports `Backpressure` back to the Hub instead
/// of growing unboundedly here.
const OUTGOING_QUEUE_CAPACITY: usize = 256;

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state)).into_response()
}

struct Connection {
    client_id: Mutex<Option<String>>,
    subscriptions: Mutex<HashMap<String, SubscriptionHandle>>,
    outgoing: mpsc::UnboundedSender<String>,
}

struct WsSubscriber {
    run_id: String,
    tx: mpsc::Sender<ServerMessage>,
}

#[async_trait]
impl Subscriber for WsSubscriber {
    async fn deliver(&self, event: Event) -> DeliverOutcome {
        match self.tx.try_send(ServerMessage::from(event)) {
            Ok(()) => DeliverOutcome::Ok,
            Err(mpsc::error::TrySendError::Full(_)) => DeliverOutcome::Backpressure,
            Err(mpsc::error::TrySendError::Closed(_)) => DeliverOutcome::Ok,
        }
    }

    async fn on_dropped(&self, reason: DropReason) {
        let wire_reason = match reason {
            DropReason::Slow => "Slow",
            DropReason::ReplayFailed => "replay-failed",
            DropReason::RunClosed => return,
        };
        let _ = self
            .tx
            .send(ServerMessage::RunError {
                run_id: self.run_id.clone(),
                error: wire_reason.to_string(),
            })
            .await;
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = futures_util::StreamExt::split(socket);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if futures_util::SinkExt::send(&mut ws_sink, Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let conn = Arc::new(Connection {
        client_id: Mutex::new(None),
        subscriptions: Mutex::new(HashMap::new()),
        outgoing: out_tx,
    });

    while let Some(msg) = futures_util::StreamExt::next(&mut ws_stream).await {
        let Ok(msg) = msg else { break };
        let Message::Text(text) = msg else { continue };
        if text.len() > MAX_FRAME_BYTES {
            warn!(bytes = text.len(), "dropping oversized client frame");
            continue;
        }
        let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
        match parsed {
            Ok(client_msg) => handle_client_message(&conn, &state, client_msg).await,
            Err(e) => warn!(error = %e, "failed to parse client message"),
        }
    }

    let subs = conn.subscriptions.lock().await;
    for (_run_id, handle) in subs.iter() {
        state.orchestrator.unattach(handle.clone()).await;
    }
    drop(subs);
    writer_task.abort();
}

async fn handle_client_message(conn: &Arc<Connection>, state: &AppState, msg: ClientMessage) {
    match msg {
        ClientMessage::ClientHello { client_id, auth_token } => {
            let ok = state.auth.validate(&auth_token).await.is_some();
            if ok {
                *conn.client_id.lock().await = Some(client_id.clone());
                info!(client_id, "socket authenticated");
            }
            send(conn, ServerMessage::ClientHelloAck { ok, session_id_hint: None });
        }
        ClientMessage::RunAttach { run_id, from_seq } => {
            if !authenticated(conn).await {
                send(conn, ServerMessage::RunError { run_id, error: "Unauthorized".to_string() });
                return;
            }
            let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTGOING_QUEUE_CAPACITY);
            let subscriber = Arc::new(WsSubscriber { run_id: run_id.clone(), tx });
            match state.orchestrator.attach(&run_id, from_seq, subscriber).await {
                Ok(handle) => {
                    let mut subs = conn.subscriptions.lock().await;
                    if let Some(previous) = subs.insert(run_id.clone(), handle) {
                        state.orchestrator.unattach(previous).await;
                    }
                    drop(subs);
                    let outgoing = conn.outgoing.clone();
                    tokio::spawn(async move {
                        while let Some(server_msg) = rx.recv().await {
                            if let Ok(text) = serde_json::to_string(&server_msg) {
                                let _ = outgoing.send(text);
                            }
                        }
                    });
                }
                Err(e) => send(conn, ServerMessage::RunError { run_id, error: e.code().to_string() }),
            }
        }
        ClientMessage::RunInput { run_id, bytes } => {
            if !authenticated(conn).await {
                return;
            }
            let decoded = match BASE64.decode(bytes.as_bytes()) {
                Ok(b) => b,
                Err(_) => bytes.into_bytes(),
            };
            if let Err(e) = state.orchestrator.input(&run_id, decoded).await {
                send(conn, ServerMessage::RunError { run_id, error: e.code().to_string() });
            }
        }
        ClientMessage::RunResize { run_id, cols, rows } => {
            if !authenticated(conn).await {
                return;
            }
            if let Err(e) = state.orchestrator.resize(&run_id, cols, rows).await {
                send(conn, ServerMessage::RunError { run_id, error: e.code().to_string() });
            }
        }
        ClientMessage::RunClose { run_id } => {
            if !authenticated(conn).await {
                return;
            }
            if let Err(e) = state.orchestrator.close(&run_id).await {
                send(conn, ServerMessage::RunError { run_id, error: e.code().to_string() });
            }
        }
    }
}

async fn authenticated(conn: &Connection) -> bool {
    conn.client_id.lock().await.is_some()
}

fn send(conn: &Connection, msg: ServerMessage) {
    if let Ok(text) = serde_json::to_string(&msg) {
        let _ = conn.outgoing.send(text);
    }
}
