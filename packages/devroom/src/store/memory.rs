use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::file_tree::FileTree;
use crate::models::{Message, Project, User};

use super::ProjectStore;

#[derive(Default)]
struct Inner {
    users: Vec<User>,
    projects: Vec<Project>,
    messages: HashMap<String, Vec<Message>>,
}

/// Store that lives and dies with the process
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn fetch_project(&self, id: &str) -> Result<Option<Project>> {
        let inner = self.inner.read().await;
        Ok(inner.projects.iter().find(|p| p.id == id).cloned())
    }

    async fn list_projects(&self, user_id: &str) -> Result<Vec<Project>> {
        let inner = self.inner.read().await;
        Ok(inner
            .projects
            .iter()
            .filter(|p| p.is_member(user_id))
            .cloned()
            .collect())
    }

    async fn create_project(&self, name: &str, owner: &str) -> Result<Project> {
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            members: vec![owner.to_string()],
            file_tree: FileTree::new(),
        };
        self.inner.write().await.projects.push(project.clone());
        Ok(project)
    }

    async fn add_members(&self, id: &str, user_ids: &[String]) -> Result<Option<Project>> {
        let mut inner = self.inner.write().await;
        let Inner {
            users, projects, ..
        } = &mut *inner;

        let Some(project) = projects.iter_mut().find(|p| p.id == id) else {
            return Ok(None);
        };
        for user_id in user_ids {
            let known = users.iter().any(|u| &u.id == user_id);
            if known && !project.is_member(user_id) {
                project.members.push(user_id.clone());
            }
        }
        Ok(Some(project.clone()))
    }

    async fn persist_file_tree(&self, id: &str, tree: &FileTree) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(project) = inner.projects.iter_mut().find(|p| p.id == id) else {
            bail!("Project {} not found", id);
        };
        project.file_tree = tree.clone();
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.inner.read().await.users.clone())
    }

    async fn fetch_user(&self, id: &str) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner.users.iter().find(|u| u.id == id).cloned())
    }

    async fn create_user(&self, email: &str) -> Result<User> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.users.iter().find(|u| u.email == email) {
            return Ok(existing.clone());
        }
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
        };
        inner.users.push(user.clone());
        Ok(user)
    }

    async fn append_message(&self, project_id: &str, message: &Message) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.projects.iter().any(|p| p.id == project_id) {
            bail!("Project {} not found", project_id);
        }
        inner
            .messages
            .entry(project_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn fetch_messages(&self, project_id: &str) -> Result<Vec<Message>> {
        let inner = self.inner.read().await;
        Ok(inner.messages.get(project_id).cloned().unwrap_or_default())
    }
}
