//! The [`Workspace`] record  — the persisted entity owned by the
//! storage collaborator and mutated only by C7 or by C6 reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted lifecycle status of a workspace. `Archived` is terminal:
/// nothing transitions a workspace out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Active,
    Inactive,
    Archived,
}

impl WorkspaceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Inactive => "inactive",
            WorkspaceStatus::Archived => "archived",
        }
    }
}

impl std::str::FromStr for WorkspaceStatus {
    type Err = crate::error::OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WorkspaceStatus::Active),
            "inactive" => Ok(WorkspaceStatus::Inactive),
            "archived" => Ok(WorkspaceStatus::Archived),
            other => Err(crate::error::OrchestratorError::state(format!(
                "unknown workspace status: {other}"
            ))),
        }
    }
}

/// A named, owner-scoped logical environment mapping a host project
/// directory into an ephemeral container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub project_path: String,
    /// Opaque secret, masked on every read by C7. Stored verbatim.
    pub claude_key: Option<String>,
    pub status: WorkspaceStatus,
    pub active_tasks: i64,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    /// Constructs a brand-new, `active` workspace ("Create enters `active`").
    pub fn new(id: String, name: String, owner_id: String, project_path: String, claude_key: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            owner_id,
            project_path,
            claude_key,
            status: WorkspaceStatus::Active,
            active_tasks: 0,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[cfg(test)]
    pub fn new_for_test(id: &str, name: &str, owner_id: &str, project_path: &str) -> Self {
        Self::new(id.to_string(), name.to_string(), owner_id.to_string(), project_path.to_string(), None)
    }

    /// Masks `claude_key` for external read paths : keeps a small
    /// prefix/suffix and replaces the middle with asterisks.
    pub fn masked_claude_key(&self) -> Option<String> {
        self.claude_key.as_ref().map(|key| mask_secret(key))
    }
}

fn mask_secret(key: &str) -> String {
    const VISIBLE: usize = 4;
    let len = key.chars().count();
    if len <= VISIBLE * 2 {
        return "*".repeat(len);
    }
    let prefix: String = key.chars().take(VISIBLE).collect();
    let suffix: String = key.chars().skip(len - VISIBLE).collect();
    format!("{prefix}{}{suffix}", "*".repeat(len - VISIBLE * 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_middle_of_long_key() {
        let masked = mask_secret("sk-ant-abcdefghijklmnop");
        assert!(masked.starts_with("sk-a"));
        assert!(masked.ends_with("mnop"));
        assert!(masked.contains('*'));
    }

    #[test]
    fn masks_short_key_entirely() {
        let masked = mask_secret("short");
        assert_eq!(masked, "*****");
    }

    #[test]
    fn new_workspace_starts_active_with_no_tasks() {
        let ws = Workspace::new_for_test("ws-1", "demo", "owner-a", "/tmp/p");
        assert_eq!(ws.status, WorkspaceStatus::Active);
        assert_eq!(ws.active_tasks, 0);
        assert!(!ws.deleted);
    }
}
