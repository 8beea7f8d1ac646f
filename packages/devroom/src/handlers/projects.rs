use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::AppState;
use crate::file_tree::FileTree;
use crate::models::{Message, Project, Sender};
use crate::protocol::{AgentResponse, RelayEvent};
use crate::sandbox::SandboxStatus;

type ApiError = (StatusCode, String);

fn internal(e: anyhow::Error) -> ApiError {
    error!("Store error: {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn project_not_found(id: &str) -> ApiError {
    (StatusCode::NOT_FOUND, format!("Project {} not found", id))
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    name: String,
    owner: String,
}

pub async fn create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Project name is required".into()));
    }

    match state.store.fetch_user(&req.owner).await.map_err(internal)? {
        Some(_) => {}
        None => {
            return Err((
                StatusCode::NOT_FOUND,
                format!("User {} not found", req.owner),
            ));
        }
    }

    let project = state
        .store
        .create_project(name, &req.owner)
        .await
        .map_err(internal)?;
    info!("Created project {} ({})", project.name, project.id);
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    state
        .store
        .fetch_project(&id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| project_not_found(&id))
}

#[derive(Deserialize)]
pub struct ListProjectsQuery {
    user: String,
}

pub async fn list_projects(
    State(state): State<AppState>,
    Query(query): Query<ListProjectsQuery>,
) -> Result<Json<Vec<Project>>, ApiError> {
    let projects = state
        .store
        .list_projects(&query.user)
        .await
        .map_err(internal)?;
    Ok(Json(projects))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUsersRequest {
    project_id: String,
    users: Vec<String>,
}

pub async fn add_users(
    State(state): State<AppState>,
    Json(req): Json<AddUsersRequest>,
) -> Result<Json<Project>, ApiError> {
    state
        .store
        .add_members(&req.project_id, &req.users)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| project_not_found(&req.project_id))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFileTreeRequest {
    project_id: String,
    file_tree: FileTree,
}

pub async fn update_file_tree(
    State(state): State<AppState>,
    Json(req): Json<UpdateFileTreeRequest>,
) -> Result<Json<Project>, ApiError> {
    if state
        .store
        .fetch_project(&req.project_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(project_not_found(&req.project_id));
    }

    state
        .store
        .persist_file_tree(&req.project_id, &req.file_tree)
        .await
        .map_err(internal)?;

    state
        .store
        .fetch_project(&req.project_id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| project_not_found(&req.project_id))
}

pub async fn sandbox_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SandboxStatus>, ApiError> {
    if state.store.fetch_project(&id).await.map_err(internal)?.is_none() {
        return Err(project_not_found(&id));
    }

    let status = match state.sandboxes.get(&id).await {
        Some(handle) => handle.status(),
        None => SandboxStatus::default(),
    };
    Ok(Json(status))
}

/// Deliver an agent reply to a project room.
///
/// The body is the agent's raw document. It is stored in parsed form (or as
/// the fallback when it does not parse) and relayed verbatim to every
/// connected member, each of whom parses it on arrival. A new file tree is
/// persisted and remounted here, once, rather than by every session.
pub async fn post_agent_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: String,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    if state.store.fetch_project(&id).await.map_err(internal)?.is_none() {
        return Err(project_not_found(&id));
    }

    let timestamp = Utc::now();
    let response = AgentResponse::parse_or_fallback(&payload);
    if let Some(tree) = &response.file_tree {
        state
            .store
            .persist_file_tree(&id, tree)
            .await
            .map_err(internal)?;
        remount_if_mounted(&state, &id, tree.clone()).await;
    }

    let message = Message::agent(response, timestamp);
    state
        .store
        .append_message(&id, &message)
        .await
        .map_err(internal)?;

    state
        .relay
        .broadcast(
            &id,
            RelayEvent::ProjectMessage {
                sender: Sender::Agent,
                message: payload,
                timestamp,
            },
        )
        .await;

    Ok((StatusCode::ACCEPTED, Json(message)))
}

/// Queue a remount of the workspace sandbox. The controller may be busy with
/// an install for minutes, so the request does not wait for it.
async fn remount_if_mounted(state: &AppState, id: &str, tree: FileTree) {
    let Some(sandbox) = state.sandboxes.get(id).await else {
        return;
    };
    // A run in progress mounts the tree it was given; queue ours behind it
    let status = sandbox.status();
    if !status.mounted && status.instance.is_none() {
        return;
    }

    let id = id.to_string();
    tokio::spawn(async move {
        if let Err(e) = sandbox.mount(tree).await {
            warn!("Remount after agent update failed for {}: {}", id, e);
        }
    });
}
