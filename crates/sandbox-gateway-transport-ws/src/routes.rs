use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use sandbox_gateway_core::relay::Readiness;
use sandbox_gateway_core::sandbox::{Sandbox, SandboxStatus, SessionId};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;
use crate::relay_socket::{agent_socket, client_socket};
use crate::state::AppState;

/// Response to a successful create
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSandbox {
    /// Session id
    pub id: SessionId,
    /// Lifecycle status
    pub status: SandboxStatus,
    /// Relay URL to join
    pub relay_endpoint: String,
    /// Host port bound to the preview port
    pub preview_port: Option<u16>,
}

/// Sandbox record plus relay readiness
#[derive(Debug, Serialize)]
pub struct SandboxView {
    /// Lifecycle record
    #[serde(flatten)]
    pub sandbox: Sandbox,
    /// Readiness flags of the sandbox's room
    pub readiness: Readiness,
}

/// Response to a successful delete
#[derive(Debug, Serialize)]
pub struct Deleted {
    /// Always `true`
    pub success: bool,
    /// Confirmation text
    pub message: String,
}

/// Response of the health probe
#[derive(Debug, Serialize)]
pub struct Health {
    /// Always `"ok"`
    pub status: &'static str,
    /// Tracked sandboxes
    pub sandboxes: usize,
    /// Live relay rooms
    pub rooms: usize,
}

/// Build the full router: control surface plus relay endpoints
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sandboxes", get(list_sandboxes).post(create_sandbox))
        .route("/sandboxes/{id}", get(get_sandbox).delete(delete_sandbox))
        .route("/relay", get(client_socket))
        .route("/relay/agent", get(agent_socket))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        sandboxes: state.manager.registry().len().await,
        rooms: state.relay.room_count().await,
    })
}

async fn create_sandbox(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<CreatedSandbox>), ApiError> {
    let sandbox = state.manager.create().await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedSandbox {
            id: sandbox.id,
            status: sandbox.status,
            relay_endpoint: sandbox.relay_endpoint,
            preview_port: sandbox.preview_port,
        }),
    ))
}

async fn list_sandboxes(State(state): State<AppState>) -> Json<Vec<Sandbox>> {
    Json(state.manager.list().await)
}

async fn get_sandbox(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<SandboxView>, ApiError> {
    let sandbox = state.manager.get_status(&id).await?;
    let readiness = state.relay.readiness(&id).await;
    Ok(Json(SandboxView { sandbox, readiness }))
}

async fn delete_sandbox(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<Deleted>, ApiError> {
    state
        .manager
        .terminate(&id)
        .await
        .map_err(ApiError::Terminate)?;
    if state.relay.close_room(&id).await {
        info!(session_id = %id, "Relay room closed");
    }
    Ok(Json(Deleted {
        success: true,
        message: format!("Sandbox {id} terminated"),
    }))
}
