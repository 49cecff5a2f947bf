use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::principal::{OpenResolver, PrincipalError, PrincipalResolver};
use crate::rooms::{parse_device_id, RoomHub, RoomKey, Roster};
use crate::session::{serve_connection, ConnectParams, Handshake};

#[derive(Clone)]
pub struct AppState {
    pub hub: RoomHub,
    pub resolver: Arc<dyn PrincipalResolver>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(hub: RoomHub) -> Self {
        Self {
            hub,
            resolver: Arc::new(OpenResolver),
            metrics: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PrincipalResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_metrics(mut self, metrics: PrometheusHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .route("/ws-debug", get(ws_debug_handler))
        .route("/rooms/:room/roster", get(roster_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Principal(PrincipalError),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::Principal(err) => {
                let status = match err {
                    PrincipalError::Unauthorized => StatusCode::UNAUTHORIZED,
                    PrincipalError::RoomMismatch { .. } => StatusCode::FORBIDDEN,
                };
                (status, err.reason(), err.to_string())
            }
        };
        (
            status,
            Json(ApiErrorBody {
                error,
                message: Some(message),
            }),
        )
            .into_response()
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let handshake = Handshake::from_request(params, &headers, state.resolver.as_ref());
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| serve_connection(socket, hub, handshake))
}

async fn roster_handler(
    State(state): State<AppState>,
    Path(room): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Roster>, ApiError> {
    let room = RoomKey::parse(&room).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    state
        .resolver
        .authorize(&headers, &room)
        .map_err(ApiError::Principal)?;
    Ok(Json(state.hub.roster(&room)))
}

#[derive(Debug, Serialize)]
struct WsDebug {
    raw: Option<String>,
    stripped: String,
    lower: String,
    is_acc: bool,
    room: Option<RoomKey>,
    device_id: Option<String>,
    error: Option<String>,
}

/// Shows how `/ws` would interpret the given parameters.
async fn ws_debug_handler(Query(params): Query<ConnectParams>) -> Json<WsDebug> {
    let stripped = params.room.as_deref().unwrap_or_default().trim().to_string();
    let lower = stripped.to_ascii_lowercase();
    let room = RoomKey::parse(&stripped);
    let device = parse_device_id(params.device_id.as_deref().unwrap_or_default());
    let error = match (&room, &device) {
        (Err(err), _) | (_, Err(err)) => Some(err.to_string()),
        _ => None,
    };
    Json(WsDebug {
        is_acc: lower.starts_with("acc:"),
        raw: params.room,
        stripped,
        lower,
        room: room.ok(),
        device_id: device.ok(),
        error,
    })
}
