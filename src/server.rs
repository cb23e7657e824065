use crate::acquisition::{AcquisitionControl, ReconnectRequest};
use crate::hub::BroadcastHub;
use crate::supervisor::{LinkState, LinkStatus};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Events a client may lag behind before it is dropped.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub acquisition: AcquisitionControl,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/health", get(health))
        .route("/api/modbus/reconnect", post(reconnect))
        .with_state(state)
}

/// Serves until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (tx, mut rx) = mpsc::channel(SUBSCRIBER_BUFFER);
    let Some(id) = hub.subscribe(tx) else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    info!(clients = hub.subscriber_count(), "WebSocket client connected");

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(payload) => {
                    if socket.send(Message::Text(payload.to_string())).await.is_err() {
                        break;
                    }
                }
                // pruned by the hub
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(message)) => debug!(?message, "Ignoring client message"),
            },
        }
    }

    hub.unsubscribe(id);
    info!(clients = hub.subscriber_count(), "WebSocket client disconnected");
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    modbus: bool,
    link_state: LinkState,
    retry_count: u32,
    clients: usize,
    timestamp: DateTime<Utc>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let LinkStatus { state: link_state, retry_count } = state.acquisition.status();
    Json(HealthResponse {
        status: "ok",
        modbus: link_state == LinkState::Connected,
        link_state,
        retry_count,
        clients: state.hub.subscriber_count(),
        timestamp: Utc::now(),
    })
}

async fn reconnect(State(state): State<AppState>) -> Response {
    match state.acquisition.request_reconnect() {
        ReconnectRequest::Accepted => {
            info!("Reconnect requested over HTTP");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "accepted": true, "message": "reconnecting" })),
            )
                .into_response()
        }
        ReconnectRequest::NotDisabled(link_state) => (
            StatusCode::CONFLICT,
            Json(json!({
                "accepted": false,
                "linkState": link_state,
                "message": "acquisition is not disabled",
            })),
        )
            .into_response(),
        ReconnectRequest::Stopped => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "accepted": false, "message": "acquisition has stopped" })),
        )
            .into_response(),
    }
}
