use axum::{Json, extract::State, http::StatusCode};
use serde::Deserialize;
use tracing::error;

use crate::AppState;
use crate::models::User;

#[derive(Deserialize)]
pub struct CreateUserRequest {
    email: String,
}

pub async fn list_users(
    State(state): State<AppState>,
) -> Result<Json<Vec<User>>, (StatusCode, String)> {
    state.store.list_users().await.map(Json).map_err(|e| {
        error!("Failed to list users: {:#}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

/// Register a user by email. Registering an existing email returns the
/// existing user.
pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<User>, (StatusCode, String)> {
    let email = req.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Invalid email address: {:?}", req.email),
        ));
    }

    state.store.create_user(email).await.map(Json).map_err(|e| {
        error!("Failed to create user {}: {:#}", email, e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}
