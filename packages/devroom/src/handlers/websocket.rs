use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{error, warn};

use crate::AppState;
use crate::session::{SessionError, WorkspaceSession};
use crate::ws;

#[derive(Deserialize)]
pub struct WorkspaceQuery {
    user: String,
}

/// Attach a member to a workspace. The session is loaded before the upgrade
/// so a missing project or a stranger gets a plain HTTP error.
pub async fn workspace_ws_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WorkspaceQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let user = match state.store.fetch_user(&query.user).await {
        Ok(Some(user)) => user,
        Ok(None) => return (StatusCode::NOT_FOUND, "Unknown user").into_response(),
        Err(e) => {
            error!("Failed to look up user {}: {:#}", query.user, e);
            state.metrics.store_error();
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let session = match WorkspaceSession::attach(state.session_deps(), &id, user).await {
        Ok(session) => session,
        Err(e @ SessionError::NotFound(_)) => {
            return (StatusCode::NOT_FOUND, e.to_string()).into_response();
        }
        Err(e @ SessionError::NotMember { .. }) => {
            warn!("Rejected workspace connection: {}", e);
            return (StatusCode::FORBIDDEN, e.to_string()).into_response();
        }
        Err(e @ SessionError::LoadFailed { .. }) => {
            error!("{}", e);
            state.metrics.store_error();
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let metrics = state.metrics.clone();
    ws.on_upgrade(move |socket| ws::handle_workspace_ws(socket, session, metrics))
}
