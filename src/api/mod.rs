//! HTTP control surface
//!
//! Translates requests into registry/session operations. Session operations
//! block on the hardware, so they run on the blocking pool.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Request, State,
    },
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::bus::{ChannelSink, SharedFanOut};
use crate::device::{DeviceClass, DeviceInfo, DeviceSession, Line, PageData};
use crate::error::{Error, HardwareError};
use crate::registry::SharedRegistry;

/// Messages buffered per event stream before deliveries start failing.
const EVENT_BUFFER: usize = 64;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub fanout: SharedFanOut,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(registry: SharedRegistry, fanout: SharedFanOut, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            fanout,
            shutdown,
        }
    }
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] Error),

    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Response status for a core outcome.
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::PageNotFound(_) | Error::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        Error::AlreadyExists(_) => StatusCode::CONFLICT,
        Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::LineOutOfRange(_) => StatusCode::RANGE_NOT_SATISFIABLE,
        Error::Hardware {
            source: HardwareError::OutOfMemory,
            ..
        } => StatusCode::PAYLOAD_TOO_LARGE,
        Error::Hardware { .. } | Error::DuplicateDevice(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Core(e) => status_for(e),
            Self::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

fn ok() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

/// Run `f` on the device of the class named in the path, off the async runtime.
async fn on_device<T, F>(state: &AppState, class: &str, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&DeviceSession) -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let class: DeviceClass = class.parse()?;
    let registry = state.registry.clone();
    let result = tokio::task::spawn_blocking(move || registry.with_class(class, f)).await?;
    Ok(result?)
}

/// Build the router with all control surface routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/devices", get(devices_handler))
        .route("/device/{class}/page", post(add_page_handler))
        .route("/device/{class}/page/update", post(set_page_handler))
        .route("/device/{class}/page/remove", post(remove_page_handler))
        .route("/device/{class}/line", post(set_line_handler))
        .route("/events", get(events_handler))
        .route("/shutdown", post(shutdown_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            reject_after_shutdown,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Once shutdown was requested, refuse everything still reaching the router.
async fn reject_after_shutdown(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.shutdown.is_cancelled() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "shutting down".to_string(),
            }),
        )
            .into_response();
    }
    next.run(request).await
}

/// GET /status - Text snapshot of every connected device
pub async fn status_handler(State(state): State<AppState>) -> Result<String, ApiError> {
    let registry = state.registry.clone();
    let infos = tokio::task::spawn_blocking(move || registry.device_infos()).await?;

    if infos.is_empty() {
        return Ok("no devices connected\n".to_string());
    }
    Ok(infos.iter().map(ToString::to_string).collect())
}

/// GET /devices - JSON snapshot of every connected device
pub async fn devices_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<DeviceInfo>>, ApiError> {
    let registry = state.registry.clone();
    let infos = tokio::task::spawn_blocking(move || registry.device_infos()).await?;
    Ok(Json(infos))
}

/// Add page request body
#[derive(Debug, Deserialize)]
pub struct AddPageRequest {
    pub page: u32,
    #[serde(default)]
    pub activate: bool,
    #[serde(flatten)]
    pub data: PageData,
}

/// POST /device/{class}/page - Add a page
pub async fn add_page_handler(
    State(state): State<AppState>,
    Path(class): Path<String>,
    Json(req): Json<AddPageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let AddPageRequest {
        page,
        activate,
        data,
    } = req;
    on_device(&state, &class, move |session| {
        session.add_page(page, data, activate)
    })
    .await?;
    Ok((StatusCode::CREATED, ok()))
}

/// Set page request body
#[derive(Debug, Deserialize)]
pub struct SetPageRequest {
    pub page: u32,
    #[serde(flatten)]
    pub data: PageData,
}

/// POST /device/{class}/page/update - Replace a page's content
pub async fn set_page_handler(
    State(state): State<AppState>,
    Path(class): Path<String>,
    Json(req): Json<SetPageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let SetPageRequest { page, data } = req;
    on_device(&state, &class, move |session| session.set_page(page, data)).await?;
    Ok(ok())
}

/// Remove page request body
#[derive(Debug, Deserialize)]
pub struct RemovePageRequest {
    pub page: u32,
}

/// POST /device/{class}/page/remove - Remove a page
pub async fn remove_page_handler(
    State(state): State<AppState>,
    Path(class): Path<String>,
    Json(req): Json<RemovePageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    on_device(&state, &class, move |session| session.remove_page(req.page)).await?;
    Ok(ok())
}

/// Set line request body
#[derive(Debug, Deserialize)]
pub struct SetLineRequest {
    pub page: u32,
    /// 0 = top, 1 = middle, 2 = bottom. Kept wide so out-of-range values
    /// reach the range check instead of failing to decode.
    pub line: i64,
    pub content: String,
}

/// POST /device/{class}/line - Change one line of a page
pub async fn set_line_handler(
    State(state): State<AppState>,
    Path(class): Path<String>,
    Json(req): Json<SetLineRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let line = Line::try_from(req.line)?;
    on_device(&state, &class, move |session| {
        session.set_line(req.page, line, req.content)
    })
    .await?;
    Ok(ok())
}

/// GET /events - WebSocket stream of button edges
pub async fn events_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

async fn stream_events(socket: WebSocket, state: AppState) {
    let (mut outgoing, mut incoming) = socket.split();
    let (sink, mut rx) = ChannelSink::new(EVENT_BUFFER);
    let id = state.fanout.subscribe(Arc::new(sink));
    info!(sink = %id, "event stream opened");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = outgoing.send(Message::Close(None)).await;
                break;
            }
            message = rx.recv() => match message {
                Some(text) => {
                    if outgoing.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            frame = incoming.next() => match frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(other)) => debug!(sink = %id, "ignoring client message: {:?}", other),
            },
        }
    }

    state.fanout.unsubscribe(id);
    info!(sink = %id, "event stream closed");
}

/// POST /shutdown - Stop accepting requests and shut the server down
pub async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Shutdown requested");
    state.shutdown.cancel();
    (StatusCode::ACCEPTED, ok())
}
