//! Storage collaborator  — the persistence layer for [`Workspace`] records.
//!
//! Expressed as the [`WorkspaceStore`] async trait; the core depends on the
//! trait only, never a concrete backend. Two reference implementations are
//! carried as supporting (non-core) modules: [`memory::InMemoryWorkspaceStore`]
//! for unit tests, and [`sqlite::SqliteWorkspaceStore`] for real persistence
//! across restarts, grounded on `database/mod.rs`'s `rusqlite` + WAL idiom.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::workspace::{Workspace, WorkspaceStatus};

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

/// A single field change for [`WorkspaceStore::update`]'s partial update
/// contract ("the core never writes the full record on update — only
/// the changed fields").
#[derive(Debug, Clone)]
pub enum FieldValue {
    Name(String),
    Status(WorkspaceStatus),
    ActiveTasks(i64),
    ActiveTasksDelta(i64),
    ClaudeKey(Option<String>),
    UpdatedAt(DateTime<Utc>),
}

pub type FieldUpdate = HashMap<&'static str, FieldValue>;

/// Persistence contract for [`Workspace`] records.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn create(&self, workspace: Workspace) -> Result<Workspace>;

    async fn get_by_id(&self, id: &str) -> Result<Option<Workspace>>;

    async fn get_by_owner_id(&self, owner_id: &str, page: u64, page_size: u64) -> Result<Page<Workspace>>;

    async fn exists_by_name(&self, owner_id: &str, name: &str) -> Result<bool>;

    /// Applies only the fields present in `update` (partial update).
    async fn update(&self, id: &str, update: FieldUpdate) -> Result<Workspace>;

    /// Soft-delete: the record is marked deleted, not physically removed.
    async fn delete(&self, id: &str) -> Result<()>;
}
