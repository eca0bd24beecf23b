//! Incremental updates to resolved menu trees.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::catalog::MenuNode;
use super::resolver::{ResolvedCollection, ResolvedMenuTree, resolve_node};
use crate::error::DeltaError;
use crate::permissions::EffectivePermissions;

/// Collection used for adds when neither the delta nor the tree names one.
pub const DEFAULT_COLLECTION: &str = "main";

/// What an update does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaAction {
    Add,
    Update,
    Remove,
}

impl DeltaAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Remove => "remove",
        }
    }
}

/// The subject of an update: a full node, or just its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeltaItem {
    Node(MenuNode),
    Ref { id: String },
    Id(String),
}

impl DeltaItem {
    pub fn id(&self) -> &str {
        match self {
            Self::Node(node) => &node.id,
            Self::Ref { id } | Self::Id(id) => id,
        }
    }

    pub fn node(&self) -> Option<&MenuNode> {
        match self {
            Self::Node(node) => Some(node),
            _ => None,
        }
    }
}

/// One change to apply to a resolved tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDelta {
    pub action: DeltaAction,
    pub item: DeltaItem,
    /// Collection for adds; defaults to the tree's first collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Version the change belongs to.
    #[serde(default)]
    pub target_version: u64,
}

impl UpdateDelta {
    pub fn add(node: MenuNode, target_version: u64) -> Self {
        Self {
            action: DeltaAction::Add,
            item: DeltaItem::Node(node),
            collection: None,
            target_version,
        }
    }

    pub fn update(node: MenuNode, target_version: u64) -> Self {
        Self {
            action: DeltaAction::Update,
            item: DeltaItem::Node(node),
            collection: None,
            target_version,
        }
    }

    pub fn remove(id: impl Into<String>, target_version: u64) -> Self {
        Self {
            action: DeltaAction::Remove,
            item: DeltaItem::Id(id.into()),
            collection: None,
            target_version,
        }
    }

    pub fn in_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }
}

impl ResolvedMenuTree {
    /// Apply `deltas` in order, returning a new tree.
    ///
    /// All-or-nothing: on error `self` is untouched and no partial tree
    /// escapes. `add` and `update` upsert by id; an upsert the subject may
    /// not see removes the id instead. Removing an unknown id is a no-op.
    pub fn apply_deltas(
        &self,
        deltas: &[UpdateDelta],
        permissions: &EffectivePermissions,
    ) -> Result<ResolvedMenuTree, DeltaError> {
        let mut next = self.clone();
        for delta in deltas {
            next.apply_one(delta, permissions)?;
        }
        debug!(deltas = deltas.len(), "menu deltas applied");
        Ok(next)
    }

    /// Return a copy with one entry's enabled flag changed.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<ResolvedMenuTree, DeltaError> {
        let mut next = self.clone();
        let menu = next.find_mut(id).ok_or_else(|| DeltaError::UnknownItem {
            id: id.to_string(),
        })?;
        menu.enabled = enabled;
        Ok(next)
    }

    fn apply_one(
        &mut self,
        delta: &UpdateDelta,
        permissions: &EffectivePermissions,
    ) -> Result<(), DeltaError> {
        if delta.action == DeltaAction::Remove {
            if !self.remove(delta.item.id()) {
                debug!(id = %delta.item.id(), "remove of absent menu item ignored");
            }
            return Ok(());
        }

        let node = delta.item.node().ok_or_else(|| DeltaError::MissingPayload {
            action: delta.action.as_str().to_string(),
            id: delta.item.id().to_string(),
        })?;

        let Some(resolved) = resolve_node(permissions, node) else {
            self.remove(&node.id);
            return Ok(());
        };

        if let Some(existing) = self.find_mut(&node.id) {
            *existing = resolved;
            return Ok(());
        }

        let target = delta
            .collection
            .clone()
            .or_else(|| self.collections.first().map(|c| c.name.clone()))
            .unwrap_or_else(|| DEFAULT_COLLECTION.to_string());

        match self.collections.iter_mut().find(|c| c.name == target) {
            Some(collection) => collection.items.push(resolved),
            None => self.collections.push(ResolvedCollection {
                name: target,
                items: vec![resolved],
            }),
        }
        Ok(())
    }
}
