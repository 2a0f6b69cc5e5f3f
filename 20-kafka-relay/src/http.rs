use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection, ws::WebSocketUpgrade},
    http::{
        HeaderValue, Method, StatusCode, Uri,
        header::{ACCEPT, CONTENT_TYPE, ORIGIN},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    connection,
    dispatch::{DispatchQueue, EnqueueError},
    hub::HubHandle,
    message::MessagePayload,
};

const ACCEPTED: &str = "Message received and added to the processing queue";

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<DispatchQueue>,
    /// `None` when the stream endpoint is disabled.
    pub hub: Option<HubHandle>,
    pub mailbox_capacity: usize,
}

/// Body of every JSON response the service sends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusBody {
    pub status: String,
    pub message: String,
}

impl StatusBody {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            status: "fail".to_string(),
            message: message.into(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let mut api = Router::new()
        .route("/healthchecker", get(health_checker))
        .route("/receive-message", post(receive_message));

    if state.hub.is_some() {
        api = api.route("/ws", get(stream_upgrade));
    }

    Router::new()
        .nest("/api", api)
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS policy for browser clients served from `origin`.
pub fn cors_layer(origin: &str) -> Result<CorsLayer> {
    let origin = HeaderValue::from_str(origin)
        .with_context(|| format!("invalid client origin '{origin}'"))?;

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([ORIGIN, CONTENT_TYPE, ACCEPT])
        .allow_credentials(true))
}

async fn health_checker() -> Json<StatusBody> {
    Json(StatusBody::success("Kafka relay is up"))
}

async fn receive_message(
    State(state): State<AppState>,
    payload: Result<Json<MessagePayload>, JsonRejection>,
) -> Response {
    let Ok(Json(payload)) = payload else {
        return fail(StatusCode::BAD_REQUEST, "Invalid request payload");
    };

    match state.queue.enqueue(payload) {
        Ok(()) => (StatusCode::OK, Json(StatusBody::success(ACCEPTED))).into_response(),
        Err(EnqueueError::Invalid(error)) => fail(StatusCode::BAD_REQUEST, error.to_string()),
        Err(error) => fail(StatusCode::SERVICE_UNAVAILABLE, error.to_string()),
    }
}

async fn stream_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let Some(hub) = state.hub else {
        return fail(StatusCode::NOT_FOUND, "stream endpoint is disabled");
    };
    let capacity = state.mailbox_capacity;

    ws.on_upgrade(move |socket| connection::serve(socket, hub, capacity))
}

async fn not_found(uri: Uri) -> Response {
    fail(
        StatusCode::NOT_FOUND,
        format!("path: {} does not exist on this server", uri.path()),
    )
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(StatusBody::fail(message))).into_response()
}
