//! In-memory [`WorkspaceStore`] for unit tests.
//!
//! Plays the same role the daemon's `Connection::open_in_memory()` plays
//! for its SQLite-backed stores: a same-process stand-in with the real
//! trait's semantics, so C6/C7/C8 unit tests never need a live database.

use dashmap::DashMap;

use crate::error::{OrchestratorError, Result};
use crate::workspace::Workspace;

use super::{FieldUpdate, FieldValue, Page, WorkspaceStore};
use async_trait::async_trait;
use chrono::Utc;

#[derive(Default)]
pub struct InMemoryWorkspaceStore {
    records: DashMap<String, Workspace>,
}

impl InMemoryWorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkspaceStore for InMemoryWorkspaceStore {
    async fn create(&self, workspace: Workspace) -> Result<Workspace> {
        if self.records.contains_key(&workspace.id) {
            return Err(OrchestratorError::conflict(format!(
                "workspace {} already exists",
                workspace.id
            )));
        }
        self.records.insert(workspace.id.clone(), workspace.clone());
        Ok(workspace)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Workspace>> {
        Ok(self.records.get(id).map(|e| e.value().clone()).filter(|w| !w.deleted))
    }

    async fn get_by_owner_id(&self, owner_id: &str, page: u64, page_size: u64) -> Result<Page<Workspace>> {
        let mut matching: Vec<Workspace> = self.records.iter().map(|e| e.value().clone()).filter(|w| w.owner_id == owner_id && !w.deleted).collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let total = matching.len() as u64;
        let start = (page.saturating_sub(1)) * page_size;
        let items = matching.into_iter().skip(start as usize).take(page_size as usize).collect();

        Ok(Page { items, total })
    }

    async fn exists_by_name(&self, owner_id: &str, name: &str) -> Result<bool> {
        Ok(self.records.iter().any(|e| e.owner_id == owner_id && e.name == name && !e.deleted))
    }

    async fn update(&self, id: &str, update: FieldUpdate) -> Result<Workspace> {
        let mut entry = self.records.get_mut(id).ok_or_else(|| OrchestratorError::not_found(format!("workspace {id} not found")))?;

        for value in update.into_values() {
            apply_field(&mut entry, value);
        }
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut entry = self.records.get_mut(id).ok_or_else(|| OrchestratorError::not_found(format!("workspace {id} not found")))?;
        entry.deleted = true;
        entry.updated_at = Utc::now();
        Ok(())
    }
}

fn apply_field(workspace: &mut Workspace, value: FieldValue) {
    match value {
        FieldValue::Name(name) => workspace.name = name,
        FieldValue::Status(status) => workspace.status = status,
        FieldValue::ActiveTasks(n) => workspace.active_tasks = n,
        FieldValue::ActiveTasksDelta(delta) => {
            workspace.active_tasks = (workspace.active_tasks + delta).max(0)
        }
        FieldValue::ClaudeKey(key) => workspace.claude_key = key,
        FieldValue::UpdatedAt(at) => workspace.updated_at = at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceStatus;
    use std::collections::HashMap;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = InMemoryWorkspaceStore::new();
        let ws = Workspace::new_for_test("ws-1", "demo", "owner-a", "/tmp/p");
        store.create(ws).await.unwrap();

        let fetched = store.get_by_id("ws-1").await.unwrap().unwrap();
        assert_eq!(fetched.name, "demo");
    }

    #[tokio::test]
    async fn deleted_workspace_is_not_returned() {
        let store = InMemoryWorkspaceStore::new();
        let ws = Workspace::new_for_test("ws-1", "demo", "owner-a", "/tmp/p");
        store.create(ws).await.unwrap();
        store.delete("ws-1").await.unwrap();
        assert!(store.get_by_id("ws-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn active_tasks_delta_never_goes_negative() {
        let store = InMemoryWorkspaceStore::new();
        let ws = Workspace::new_for_test("ws-1", "demo", "owner-a", "/tmp/p");
        store.create(ws).await.unwrap();

        let mut update: FieldUpdate = HashMap::new();
        update.insert("active_tasks", FieldValue::ActiveTasksDelta(-5));
        let updated = store.update("ws-1", update).await.unwrap();
        assert_eq!(updated.active_tasks, 0);
    }

    #[tokio::test]
    async fn exists_by_name_is_owner_scoped() {
        let store = InMemoryWorkspaceStore::new();
        store.create(Workspace::new_for_test("ws-1", "demo", "owner-a", "/tmp/p")).await.unwrap();

        assert!(store.exists_by_name("owner-a", "demo").await.unwrap());
        assert!(!store.exists_by_name("owner-b", "demo").await.unwrap());
    }

    #[tokio::test]
    async fn pagination_splits_results() {
        let store = InMemoryWorkspaceStore::new();
        for i in 0..5 {
            store.create(Workspace::new_for_test(&format!("ws-{i}"), &format!("demo-{i}"), "owner-a", "/tmp/p")).await.unwrap();
        }

        let page1 = store.get_by_owner_id("owner-a", 1, 2).await.unwrap();
        assert_eq!(page1.items.len(), 2);
        assert_eq!(page1.total, 5);

        let page3 = store.get_by_owner_id("owner-a", 3, 2).await.unwrap();
        assert_eq!(page3.items.len(), 1);
    }

    #[tokio::test]
    async fn status_update_applies_single_field() {
        let store = InMemoryWorkspaceStore::new();
        store.create(Workspace::new_for_test("ws-1", "demo", "owner-a", "/tmp/p")).await.unwrap();

        let mut update: FieldUpdate = HashMap::new();
        update.insert("status", FieldValue::Status(WorkspaceStatus::Archived));
        let updated = store.update("ws-1", update).await.unwrap();
        assert_eq!(updated.status, WorkspaceStatus::Archived);
    }
}
