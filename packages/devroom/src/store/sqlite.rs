use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::DateTime;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use uuid::Uuid;

use crate::file_tree::FileTree;
use crate::models::{Message, Project, User};

use super::ProjectStore;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn members(&self, project_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT user_id FROM project_members WHERE project_id = ? ORDER BY added_at, rowid",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load project members")?;

        Ok(rows.iter().map(|r| r.get("user_id")).collect())
    }

    async fn project_from_row(&self, row: &SqliteRow) -> Result<Project> {
        let id: String = row.get("id");
        let raw_tree: String = row.get("file_tree");
        let file_tree: FileTree = serde_json::from_str(&raw_tree)
            .with_context(|| format!("Corrupt file tree for project {}", id))?;
        let members = self.members(&id).await?;

        Ok(Project {
            name: row.get("name"),
            members,
            file_tree,
            id,
        })
    }
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let sender: String = row.get("sender");
    let body: String = row.get("body");
    let created_at: i64 = row.get("created_at");

    Ok(Message {
        sender: serde_json::from_str(&sender).context("Corrupt message sender")?,
        body: serde_json::from_str(&body).context("Corrupt message body")?,
        timestamp: DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
    })
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn fetch_project(&self, id: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT id, name, file_tree FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch project")?;

        match row {
            Some(row) => Ok(Some(self.project_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list_projects(&self, user_id: &str) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.name, p.file_tree
            FROM projects p
            JOIN project_members m ON m.project_id = p.id
            WHERE m.user_id = ?
            ORDER BY p.created_at, p.rowid
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list projects")?;

        let mut projects = Vec::with_capacity(rows.len());
        for row in &rows {
            projects.push(self.project_from_row(row).await?);
        }
        Ok(projects)
    }

    async fn create_project(&self, name: &str, owner: &str) -> Result<Project> {
        let id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO projects (id, name, file_tree) VALUES (?, ?, '{}')")
            .bind(&id)
            .bind(name)
            .execute(&mut *tx)
            .await
            .context("Failed to insert project")?;

        sqlx::query("INSERT INTO project_members (project_id, user_id) VALUES (?, ?)")
            .bind(&id)
            .bind(owner)
            .execute(&mut *tx)
            .await
            .context("Failed to add project owner")?;

        tx.commit().await?;

        Ok(Project {
            id,
            name: name.to_string(),
            members: vec![owner.to_string()],
            file_tree: FileTree::new(),
        })
    }

    async fn add_members(&self, id: &str, user_ids: &[String]) -> Result<Option<Project>> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        for user_id in user_ids {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO project_members (project_id, user_id)
                SELECT ?, id FROM users WHERE id = ?
                "#,
            )
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to add project member")?;
        }

        self.fetch_project(id).await
    }

    async fn persist_file_tree(&self, id: &str, tree: &FileTree) -> Result<()> {
        let raw = serde_json::to_string(tree)?;
        let result = sqlx::query(
            "UPDATE projects SET file_tree = ?, updated_at = unixepoch() WHERE id = ?",
        )
        .bind(raw)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to persist file tree")?;

        if result.rows_affected() == 0 {
            bail!("Project {} not found", id);
        }
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT id, email FROM users ORDER BY created_at, rowid")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list users")?;

        Ok(rows
            .iter()
            .map(|r| User {
                id: r.get("id"),
                email: r.get("email"),
            })
            .collect())
    }

    async fn fetch_user(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, email FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| User {
            id: r.get("id"),
            email: r.get("email"),
        }))
    }

    async fn create_user(&self, email: &str) -> Result<User> {
        sqlx::query("INSERT INTO users (id, email) VALUES (?, ?) ON CONFLICT(email) DO NOTHING")
            .bind(Uuid::new_v4().to_string())
            .bind(email)
            .execute(&self.pool)
            .await
            .context("Failed to insert user")?;

        let row = sqlx::query("SELECT id, email FROM users WHERE email = ?")
            .bind(email)
            .fetch_one(&self.pool)
            .await?;

        Ok(User {
            id: row.get("id"),
            email: row.get("email"),
        })
    }

    async fn append_message(&self, project_id: &str, message: &Message) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (project_id, sender, body, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(serde_json::to_string(&message.sender)?)
        .bind(serde_json::to_string(&message.body)?)
        .bind(message.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert message")?;

        Ok(())
    }

    async fn fetch_messages(&self, project_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT sender, body, created_at FROM messages WHERE project_id = ? ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch messages")?;

        rows.iter().map(message_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sender;
    use crate::protocol::AgentResponse;
    use crate::store::test_helpers::test_sqlite_store;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn project_round_trip() {
        let store = test_sqlite_store().await;
        let owner = store.create_user("owner@example.com").await.unwrap();
        let friend = store.create_user("friend@example.com").await.unwrap();

        let project = store.create_project("demo", &owner.id).await.unwrap();
        let tree: FileTree = [("index.js", "console.log(1)")].into_iter().collect();
        store.persist_file_tree(&project.id, &tree).await.unwrap();
        store
            .add_members(&project.id, &[friend.id.clone(), "ghost".into()])
            .await
            .unwrap();

        let loaded = store.fetch_project(&project.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "demo");
        assert_eq!(loaded.file_tree, tree);
        assert_eq!(loaded.members, vec![owner.id.clone(), friend.id.clone()]);

        let listed = store.list_projects(&friend.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, project.id);
    }

    #[tokio::test]
    async fn missing_project() {
        let store = test_sqlite_store().await;
        assert!(store.fetch_project("nope").await.unwrap().is_none());
        assert!(store.add_members("nope", &[]).await.unwrap().is_none());
        assert!(
            store
                .persist_file_tree("nope", &FileTree::new())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn create_user_returns_existing_for_same_email() {
        let store = test_sqlite_store().await;
        let a = store.create_user("a@example.com").await.unwrap();
        let b = store.create_user("a@example.com").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list_users().await.unwrap(), vec![a.clone()]);
        assert_eq!(store.fetch_user(&a.id).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn messages_round_trip_in_order() {
        let store = test_sqlite_store().await;
        let owner = store.create_user("owner@example.com").await.unwrap();
        let project = store.create_project("demo", &owner.id).await.unwrap();
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();

        let chat = Message::chat(Sender::from(&owner), "hello", at);
        let agent = Message::agent(
            AgentResponse {
                text: "done".into(),
                file_tree: Some([("a.txt", "hi")].into_iter().collect()),
            },
            at,
        );
        store.append_message(&project.id, &chat).await.unwrap();
        store.append_message(&project.id, &agent).await.unwrap();

        let log = store.fetch_messages(&project.id).await.unwrap();
        assert_eq!(log, vec![chat, agent]);
    }

    #[tokio::test]
    async fn message_for_unknown_project_is_rejected() {
        let store = test_sqlite_store().await;
        let msg = Message::chat(Sender::Agent, "x", Utc::now());
        assert!(store.append_message("nope", &msg).await.is_err());
    }
}
