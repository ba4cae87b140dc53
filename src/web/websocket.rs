//! Push channel with Socket.IO-style request/reply events.
//!
//! Every frame is `{"event": <name>, "data": <object>}`. Bus events are
//! forwarded as they happen; nothing is replayed, so clients refetch state on
//! (re)connect.

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::WebState;
use crate::core::error::WipeError;
use crate::core::events::{Event, SystemStatus};
use crate::core::models::{MemberStatus, WipeJob};

#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerFrame {
    pub event: String,
    pub data: Value,
}

impl ServerFrame {
    fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }

    fn error(message: impl Into<String>, code: &str) -> Self {
        Self::new("error", json!({ "message": message.into(), "code": code }))
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WebState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: WebState) {
    let client_id = Uuid::now_v7().to_string();
    let mut events = state.ctx.events.subscribe();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(64);

    state.clients.fetch_add(1, Ordering::SeqCst);
    debug!(client_id = %client_id, "WebSocket client connected");

    let hello = ServerFrame::new(
        "status",
        json!({ "message": "connected", "client_id": client_id }),
    );
    if send(&mut socket, &hello).await {
        publish_system_status(&state).await;

        loop {
            tokio::select! {
                incoming = socket.recv() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!(error = %e, "WebSocket receive error");
                            break;
                        }
                    };

                    let reply = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(frame) => handle_frame(&state, frame, &out_tx).await,
                        Err(e) => Some(ServerFrame::error(format!("malformed frame: {}", e), "parse_error")),
                    };
                    if let Some(reply) = reply {
                        if !send(&mut socket, &reply).await {
                            break;
                        }
                    }
                }
                event = events.next() => {
                    let Some(event) = event else { break };
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(frame) = out_rx.recv() => {
                    if !send(&mut socket, &frame).await {
                        break;
                    }
                }
            }
        }
    }

    state.clients.fetch_sub(1, Ordering::SeqCst);
    publish_system_status(&state).await;
    debug!(client_id = %client_id, "WebSocket client disconnected");
}

async fn send(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(_) => true,
    }
}

async fn publish_system_status(state: &WebState) {
    state.ctx.events.publish(Event::SystemStatus(SystemStatus {
        connected_clients: state.clients.load(Ordering::SeqCst),
        active_jobs: state.ctx.coordinator.active_jobs().await,
        devices: state.ctx.registry.len().await,
        timestamp: Utc::now(),
    }));
}

/// Answer one client request. Long-running requests reply later through `out`.
pub async fn handle_frame(
    state: &WebState,
    frame: ClientFrame,
    out: &mpsc::Sender<ServerFrame>,
) -> Option<ServerFrame> {
    let ctx = &state.ctx;

    let reply = match frame.event.as_str() {
        "ping" => ServerFrame::new("pong", json!({ "timestamp": Utc::now() })),
        "request_device_status" => ServerFrame::new(
            "device_status",
            json!({ "devices": ctx.registry.list().await }),
        ),
        "request_blockchain_status" => match ctx.ledger.status().await {
            Ok(status) => ServerFrame::new("blockchain_status", to_value(status)),
            Err(e) => wipe_error_frame("blockchain_status", &e),
        },
        "request_certificate_verification" => {
            let Some(certificate_id) = frame.data.get("certificate_id").and_then(Value::as_str) else {
                return Some(ServerFrame::error("certificate_id is required", "invalid_params"));
            };
            match ctx.ledger.verify(certificate_id).await {
                Ok(verification) => ServerFrame::new("verification_result", to_value(verification)),
                Err(e) => ServerFrame::new(
                    "verification_result",
                    json!({
                        "certificate_id": certificate_id,
                        "valid": false,
                        "chain_valid": false,
                        "error": e.to_string(),
                        "code": e.code(),
                    }),
                ),
            }
        }
        "start_wipe_process" => {
            let Some(device_id) = frame.data.get("device_id").and_then(Value::as_str) else {
                return Some(ServerFrame::error("device_id is required", "invalid_params"));
            };
            let method = frame.data.get("wipe_method").and_then(Value::as_str);

            match ctx.coordinator.start_device_wipe(device_id, method).await {
                Ok(job_id) => {
                    watch_wipe(state, job_id.clone(), device_id.to_string(), out.clone());
                    ServerFrame::new(
                        "wipe_progress",
                        json!({
                            "job_id": job_id,
                            "device_id": device_id,
                            "progress": 0,
                            "message": "wipe started",
                        }),
                    )
                }
                Err(e) => ServerFrame::new(
                    "wipe_error",
                    json!({ "device_id": device_id, "error": e.to_string(), "code": e.code() }),
                ),
            }
        }
        other => ServerFrame::error(format!("unknown event: {}", other), "unknown_event"),
    };

    Some(reply)
}

/// Relay one job's progress to the requesting socket until it finishes.
fn watch_wipe(state: &WebState, job_id: String, device_id: String, out: mpsc::Sender<ServerFrame>) {
    let mut events = state.ctx.events.subscribe();
    let coordinator = state.ctx.coordinator.clone();

    tokio::spawn(async move {
        let done = coordinator.wait(&job_id);
        tokio::pin!(done);

        let finished = loop {
            tokio::select! {
                job = &mut done => break job,
                event = events.next() => match event {
                    Some(Event::ProgressUpdate(update)) if update.job_id == job_id => {
                        let frame = ServerFrame::new(
                            "wipe_progress",
                            json!({
                                "job_id": update.job_id,
                                "device_id": update.device_id,
                                "progress": update.device_progress,
                                "message": update.message,
                            }),
                        );
                        if out.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Some(_) => {}
                    None => break (&mut done).await,
                },
            }
        };

        let _ = out.send(completion_frame(&device_id, finished)).await;
    });
}

fn completion_frame(device_id: &str, finished: Result<WipeJob, WipeError>) -> ServerFrame {
    let job = match finished {
        Ok(job) => job,
        Err(e) => {
            return ServerFrame::new(
                "wipe_error",
                json!({ "device_id": device_id, "error": e.to_string(), "code": e.code() }),
            );
        }
    };

    match job.member(device_id) {
        Some(member) if member.status == MemberStatus::Wiped && member.certificate_id.is_some() => {
            ServerFrame::new(
                "wipe_complete",
                json!({
                    "job_id": job.job_id,
                    "device_id": device_id,
                    "method": member.method,
                    "certificate_id": member.certificate_id,
                }),
            )
        }
        member => ServerFrame::new(
            "wipe_error",
            json!({
                "job_id": job.job_id,
                "device_id": device_id,
                "error": member
                    .and_then(|m| m.error.clone())
                    .unwrap_or_else(|| "wipe did not complete".to_string()),
            }),
        ),
    }
}

fn wipe_error_frame(event: &str, err: &WipeError) -> ServerFrame {
    ServerFrame::new(event, json!({ "error": err.to_string(), "code": err.code() }))
}

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
