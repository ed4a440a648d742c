//! `rusqlite`-backed [`WorkspaceStore`], for persistence across restarts.
//!
//! Grounded on `database/mod.rs`'s `Database::open` idiom: WAL mode, one
//! table, a `tokio::sync::Mutex<Connection>` guarding the single
//! connection (this crate does not expect SQLite contention heavy enough
//! to warrant a connection pool).

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::error::{OrchestratorError, Result};
use crate::workspace::{Workspace, WorkspaceStatus};

use super::{FieldUpdate, FieldValue, Page, WorkspaceStore};

pub struct SqliteWorkspaceStore {
    conn: Mutex<Connection>,
}

impl SqliteWorkspaceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| OrchestratorError::new(crate::error::ErrorKind::Unknown, format!("create data dir: {e}")))?;
        }
        let conn = Connection::open(path).map_err(|e| OrchestratorError::new(crate::error::ErrorKind::Unknown, format!("open sqlite: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(|e| OrchestratorError::new(crate::error::ErrorKind::Unknown, format!("enable WAL: {e}")))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| OrchestratorError::new(crate::error::ErrorKind::Unknown, format!("open sqlite: {e}")))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                project_path TEXT NOT NULL,
                claude_key TEXT,
                status TEXT NOT NULL,
                active_tasks INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_workspaces_owner ON workspaces(owner_id, deleted);
            "#,
        ).map_err(|e| OrchestratorError::new(crate::error::ErrorKind::Unknown, format!("init schema: {e}")))
    }
}

fn row_to_workspace(row: &Row) -> rusqlite::Result<Workspace> {
    let status_str: String = row.get("status")?;
    let status = status_str.parse::<WorkspaceStatus>().unwrap_or(WorkspaceStatus::Inactive);
    let created_ts: i64 = row.get("created_at")?;
    let updated_ts: i64 = row.get("updated_at")?;
    Ok(Workspace {
        id: row.get("id")?,
        name: row.get("name")?,
        owner_id: row.get("owner_id")?,
        project_path: row.get("project_path")?,
        claude_key: row.get("claude_key")?,
        status,
        active_tasks: row.get("active_tasks")?,
        deleted: row.get::<_, i64>("deleted")? != 0,
        created_at: timestamp_to_utc(created_ts),
        updated_at: timestamp_to_utc(updated_ts),
    })
}

fn timestamp_to_utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn sqlite_err(op: &str, e: rusqlite::Error) -> OrchestratorError {
    if matches!(e, rusqlite::Error::SqliteFailure(ref err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation) {
        return OrchestratorError::conflict(format!("{op}: {e}"));
    }
    OrchestratorError::new(crate::error::ErrorKind::Unknown, format!("{op}: {e}"))
}

#[async_trait]
impl WorkspaceStore for SqliteWorkspaceStore {
    async fn create(&self, workspace: Workspace) -> Result<Workspace> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO workspaces (id, name, owner_id, project_path, claude_key, status, active_tasks, deleted, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
            params![
                workspace.id,
                workspace.name,
                workspace.owner_id,
                workspace.project_path,
                workspace.claude_key,
                workspace.status.as_str(),
                workspace.active_tasks,
                workspace.created_at.timestamp(),
                workspace.updated_at.timestamp(),
            ],
        ).map_err(|e| sqlite_err("create workspace", e))?;
        Ok(workspace)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Workspace>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM workspaces WHERE id = ?1 AND deleted = 0",
            params![id],
            row_to_workspace,
        ).optional().map_err(|e| sqlite_err("get workspace", e))
    }

    async fn get_by_owner_id(&self, owner_id: &str, page: u64, page_size: u64) -> Result<Page<Workspace>> {
        let conn = self.conn.lock().await;
        let total: u64 = conn.query_row(
                "SELECT COUNT(*) FROM workspaces WHERE owner_id = ?1 AND deleted = 0",
                params![owner_id],
                |r| r.get(0),
            ).map_err(|e| sqlite_err("count workspaces", e))?;

        let offset = page.saturating_sub(1) * page_size;
        let mut stmt = conn.prepare(
                "SELECT * FROM workspaces WHERE owner_id = ?1 AND deleted = 0
                 ORDER BY created_at ASC LIMIT ?2 OFFSET ?3",
            ).map_err(|e| sqlite_err("list workspaces", e))?;
        let items = stmt.query_map(params![owner_id, page_size, offset], row_to_workspace).map_err(|e| sqlite_err("list workspaces", e))?.collect::<rusqlite::Result<Vec<_>>>().map_err(|e| sqlite_err("list workspaces", e))?;

        Ok(Page { items, total })
    }

    async fn exists_by_name(&self, owner_id: &str, name: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM workspaces WHERE owner_id = ?1 AND name = ?2 AND deleted = 0",
                params![owner_id, name],
                |r| r.get(0),
            ).map_err(|e| sqlite_err("check workspace name", e))?;
        Ok(count > 0)
    }

    async fn update(&self, id: &str, update: FieldUpdate) -> Result<Workspace> {
        let conn = self.conn.lock().await;
        for value in update.values() {
            match value {
                FieldValue::Name(name) => conn.execute(
                    "UPDATE workspaces SET name = ?1, updated_at = ?2 WHERE id = ?3",
                    params![name, Utc::now().timestamp(), id],
                ),
                FieldValue::Status(status) => {
                    conn.execute(
                        "UPDATE workspaces SET status = ?1, updated_at = ?2 WHERE id = ?3",
                        params![status.as_str(), Utc::now().timestamp(), id],
                    )
                }
                FieldValue::ActiveTasks(n) => conn.execute(
                    "UPDATE workspaces SET active_tasks = ?1, updated_at = ?2 WHERE id = ?3",
                    params![n, Utc::now().timestamp(), id],
                ),
                FieldValue::ActiveTasksDelta(delta) => conn.execute(
                    "UPDATE workspaces SET active_tasks = MAX(0, active_tasks + ?1), updated_at = ?2 WHERE id = ?3",
                    params![delta, Utc::now().timestamp(), id],
                ),
                FieldValue::ClaudeKey(key) => conn.execute(
                    "UPDATE workspaces SET claude_key = ?1, updated_at = ?2 WHERE id = ?3",
                    params![key, Utc::now().timestamp(), id],
                ),
                FieldValue::UpdatedAt(at) => conn.execute(
                    "UPDATE workspaces SET updated_at = ?1 WHERE id = ?2",
                    params![at.timestamp(), id],
                ),
            }.map_err(|e| sqlite_err("update workspace", e))?;
        }

        conn.query_row(
            "SELECT * FROM workspaces WHERE id = ?1",
            params![id],
            row_to_workspace,
        ).optional().map_err(|e| sqlite_err("update workspace", e))?.ok_or_else(|| OrchestratorError::not_found(format!("workspace {id} not found")))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
                "UPDATE workspaces SET deleted = 1, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().timestamp(), id],
            ).map_err(|e| sqlite_err("delete workspace", e))?;
        if changed == 0 {
            return Err(OrchestratorError::not_found(format!("workspace {id} not found")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_fetch_round_trips() {
        let store = SqliteWorkspaceStore::open_in_memory().unwrap();
        let ws = Workspace::new_for_test("ws-1", "demo", "owner-a", "/tmp/p");
        store.create(ws).await.unwrap();

        let fetched = store.get_by_id("ws-1").await.unwrap().unwrap();
        assert_eq!(fetched.name, "demo");
        assert_eq!(fetched.status, WorkspaceStatus::Active);
    }

    #[tokio::test]
    async fn duplicate_id_is_a_conflict() {
        let store = SqliteWorkspaceStore::open_in_memory().unwrap();
        let ws = Workspace::new_for_test("ws-1", "demo", "owner-a", "/tmp/p");
        store.create(ws.clone()).await.unwrap();
        let err = store.create(ws).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn soft_delete_hides_from_get() {
        let store = SqliteWorkspaceStore::open_in_memory().unwrap();
        store.create(Workspace::new_for_test("ws-1", "demo", "owner-a", "/tmp/p")).await.unwrap();
        store.delete("ws-1").await.unwrap();
        assert!(store.get_by_id("ws-1").await.unwrap().is_none());
    }
}
