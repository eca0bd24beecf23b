//! Collaborator interfaces for the authoritative menu backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NavResult;
use crate::menu::{MenuCollection, UpdateDelta};

/// Menu version reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub version: u64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Response of the sync endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// False when the server could not produce a delta.
    pub success: bool,
    #[serde(default)]
    pub has_conflicts: bool,
    /// Ids in conflict.
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub menu_updates: Vec<UpdateDelta>,
    #[serde(default)]
    pub tool_updates: Vec<UpdateDelta>,
}

/// Authoritative source of menu and tools configuration.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Full menu configuration.
    async fn menu_config(&self) -> NavResult<Vec<MenuCollection>>;

    /// Full tools configuration.
    async fn tools_config(&self) -> NavResult<MenuCollection>;

    /// Current server-side menu version.
    async fn server_version(&self) -> NavResult<ServerVersion>;

    /// Deltas from `local_version` to the server's version.
    async fn sync_menu_config(&self, local_version: u64) -> NavResult<SyncResponse>;
}

/// Source of user roles and granted permissions.
#[async_trait]
pub trait PermissionSource: Send + Sync {
    async fn user_permissions(&self, user_id: &str) -> NavResult<Vec<String>>;

    async fn user_role(&self, user_id: &str) -> NavResult<String>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn sync_response_wire_format() {
        let json = r#"{
            "success": true,
            "hasConflicts": true,
            "conflicts": ["menu-1"],
            "menuUpdates": [{"action": "remove", "item": "menu-2", "targetVersion": 3}]
        }"#;
        let resp: SyncResponse = serde_json::from_str(json).unwrap();
        assert!(resp.has_conflicts);
        assert_eq!(resp.conflicts, vec!["menu-1"]);
        assert_eq!(resp.menu_updates.len(), 1);
        assert!(resp.tool_updates.is_empty());
    }

    #[test]
    fn server_version_timestamp_defaults() {
        let v: ServerVersion = serde_json::from_str(r#"{"version": 4}"#).unwrap();
        assert_eq!(v.version, 4);
    }
}
