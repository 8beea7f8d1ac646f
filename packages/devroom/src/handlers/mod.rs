pub mod health;
pub mod projects;
pub mod users;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use health::{health_handler, health_live_handler, metrics_handler};
pub use projects::{
    add_users, create_project, get_project, list_projects, post_agent_message, sandbox_status,
    update_file_tree,
};
pub use users::{create_user, list_users};
pub use websocket::workspace_ws_handler;
