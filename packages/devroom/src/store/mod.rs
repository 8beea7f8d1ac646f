//! Project and user persistence.
//!
//! Sessions load a project and its message log once on attach and write
//! back file trees and messages fire-and-forget. Two implementations: SQLite
//! for real deployments and an in-memory map for tests and `--ephemeral`.

use anyhow::Result;
use async_trait::async_trait;

use crate::file_tree::FileTree;
use crate::models::{Message, Project, User};

mod memory;
mod sqlite;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn fetch_project(&self, id: &str) -> Result<Option<Project>>;

    /// Projects `user_id` is a member of, oldest first
    async fn list_projects(&self, user_id: &str) -> Result<Vec<Project>>;

    /// New project with an empty tree and `owner` as its only member
    async fn create_project(&self, name: &str, owner: &str) -> Result<Project>;

    /// Add existing users as members. Unknown ids and existing members are
    /// skipped. `None` when the project does not exist.
    async fn add_members(&self, id: &str, user_ids: &[String]) -> Result<Option<Project>>;

    /// Overwrite the stored tree. Errors when the project does not exist.
    async fn persist_file_tree(&self, id: &str, tree: &FileTree) -> Result<()>;

    async fn list_users(&self) -> Result<Vec<User>>;

    async fn fetch_user(&self, id: &str) -> Result<Option<User>>;

    /// The user registered under `email`, created if needed
    async fn create_user(&self, email: &str) -> Result<User>;

    async fn append_message(&self, project_id: &str, message: &Message) -> Result<()>;

    /// Full log of a project in append order
    async fn fetch_messages(&self, project_id: &str) -> Result<Vec<Message>>;
}
