use crate::error::RentalError;
use crate::lifecycle::RentalLifecycle;
use crate::models::{DeviceSnapshot, LeaseRecord};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_BODY_BYTES: usize = 16 * 1024;
const VIEWER_BUFFER: usize = 16;

#[derive(Clone)]
struct AppState {
    lifecycle: Arc<RentalLifecycle>,
}

#[derive(Deserialize)]
struct StartRequest {
    console_id: i64,
    duration_minutes: i64,
}

#[derive(Deserialize)]
struct ExtendRequest {
    console_id: i64,
    add_minutes: i64,
}

#[derive(Deserialize)]
struct ConsoleRequest {
    console_id: i64,
}

#[derive(Deserialize)]
struct PriceRequest {
    console_id: i64,
    price_per_hour: i64,
}

/// API Response
#[derive(Serialize)]
struct ApiResponse {
    status: String,
    message: String,
}

#[derive(Serialize)]
struct LeaseResponse {
    status: &'static str,
    transaction: Option<LeaseRecord>,
}

#[derive(Serialize)]
struct ResendResponse {
    status: &'static str,
    command: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    status: &'static str,
    kind: &'static str,
    message: String,
}

/// Maps each domain failure onto one HTTP status.
struct ApiError(RentalError);

impl From<RentalError> for ApiError {
    fn from(e: RentalError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, kind) = match &self.0 {
            RentalError::InvalidDuration => (StatusCode::BAD_REQUEST, "invalid_duration"),
            RentalError::InvalidPrice => (StatusCode::BAD_REQUEST, "invalid_price"),
            RentalError::DeviceNotFound(_) => (StatusCode::NOT_FOUND, "device_not_found"),
            RentalError::AlreadyRunning(_) => (StatusCode::CONFLICT, "already_running"),
            RentalError::NotRunning(_) => (StatusCode::CONFLICT, "not_running"),
            RentalError::EndpointUnavailable(_) => (StatusCode::BAD_GATEWAY, "endpoint_unavailable"),
            RentalError::StoreFailure(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_failure"),
        };
        let body = ErrorResponse {
            status: "error",
            kind,
            message: self.0.to_string(),
        };
        (code, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Root handler
async fn root_handler() -> Json<ApiResponse> {
    Json(ApiResponse {
        status: "success".to_string(),
        message: "Console rental service is running.".to_string(),
    })
}

async fn status(State(state): State<AppState>) -> ApiResult<Vec<DeviceSnapshot>> {
    Ok(Json(state.lifecycle.snapshot().await?))
}

async fn start(
    State(state): State<AppState>,
    Json(body): Json<StartRequest>,
) -> ApiResult<LeaseResponse> {
    let lease = state
        .lifecycle
        .start_rental(body.console_id, body.duration_minutes)
        .await?;
    Ok(Json(LeaseResponse {
        status: "ok",
        transaction: Some(lease),
    }))
}

async fn extend(
    State(state): State<AppState>,
    Json(body): Json<ExtendRequest>,
) -> ApiResult<LeaseResponse> {
    let lease = state
        .lifecycle
        .extend_rental(body.console_id, body.add_minutes)
        .await?;
    Ok(Json(LeaseResponse {
        status: "ok",
        transaction: lease,
    }))
}

async fn stop(
    State(state): State<AppState>,
    Json(body): Json<ConsoleRequest>,
) -> ApiResult<ApiResponse> {
    state.lifecycle.stop_rental(body.console_id).await?;
    Ok(Json(ApiResponse {
        status: "ok".to_string(),
        message: format!("Console {} stopped.", body.console_id),
    }))
}

async fn update_price(
    State(state): State<AppState>,
    Json(body): Json<PriceRequest>,
) -> ApiResult<ApiResponse> {
    state
        .lifecycle
        .update_price(body.console_id, body.price_per_hour)
        .await?;
    Ok(Json(ApiResponse {
        status: "ok".to_string(),
        message: format!(
            "Console {} now costs {} per hour.",
            body.console_id, body.price_per_hour
        ),
    }))
}

async fn resend(
    State(state): State<AppState>,
    Json(body): Json<ConsoleRequest>,
) -> ApiResult<ResendResponse> {
    let command = state.lifecycle.resend_command(body.console_id).await?;
    Ok(Json(ResendResponse {
        status: "ok",
        command,
    }))
}

async fn transactions(
    State(state): State<AppState>,
    Path(console_id): Path<i64>,
) -> ApiResult<Vec<LeaseRecord>> {
    Ok(Json(state.lifecycle.transactions(console_id).await?))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| viewer_session(socket, state.lifecycle))
}

fn text_frame(payload: &[u8]) -> Message {
    Message::Text(String::from_utf8_lossy(payload).into_owned().into())
}

fn is_ping(text: &str) -> bool {
    let text = text.trim();
    text == "ping" || text == r#"{"type":"ping"}"#
}

/// Sends one status frame; a failure is logged and reported as `false`.
async fn push_frame<S>(sink: &mut S, viewer: Uuid, payload: &[u8], what: &str) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match sink.send(text_frame(payload)).await {
        Ok(()) => true,
        Err(e) => {
            debug!("{} to viewer {} failed: {}", what, viewer, e);
            false
        }
    }
}

/// One connected viewer. The subscription lives exactly as long as this
/// loop keeps reading from the socket.
async fn viewer_session(socket: WebSocket, lifecycle: Arc<RentalLifecycle>) {
    let (mut sender, mut receiver) = socket.split();
    let (id, mut updates) = lifecycle.hub().subscribe(VIEWER_BUFFER);
    info!("Viewer {} connected ({} total).", id, lifecycle.hub().size());

    match lifecycle.snapshot_payload().await {
        Ok(payload) => {
            if !push_frame(&mut sender, id, &payload, "initial snapshot").await {
                lifecycle.hub().remove(id);
                return;
            }
        }
        Err(e) => warn!("Initial snapshot for viewer {} failed: {}", id, e),
    }

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(payload) = update else { break };
                push_frame(&mut sender, id, &payload, "update").await;
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) if is_ping(text.as_str()) => {
                    match lifecycle.snapshot_payload().await {
                        Ok(payload) => {
                            push_frame(&mut sender, id, &payload, "ping reply").await;
                        }
                        Err(e) => warn!("Snapshot for viewer {} failed: {}", id, e),
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    lifecycle.hub().remove(id);
    info!("Viewer {} disconnected.", id);
}

pub fn router(lifecycle: Arc<RentalLifecycle>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/api/status", get(status))
        .route("/api/start", post(start))
        .route("/api/extend", post(extend))
        .route("/api/stop", post(stop))
        .route("/api/price", post(update_price))
        .route("/api/resend", post(resend))
        .route("/api/transactions/{console_id}", get(transactions))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(AppState { lifecycle })
}

/// Serves the API on `listener` until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    lifecycle: Arc<RentalLifecycle>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("REST API listening on {}", addr);
    }
    axum::serve(listener, router(lifecycle))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

/// Run the HTTP server on `port`.
pub async fn run_rest_server(
    lifecycle: Arc<RentalLifecycle>,
    port: u16,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    serve(listener, lifecycle, shutdown).await
}
