//! Permission-filtered menu trees.
//!
//! Resolution is a pure function of the effective permissions and the menu
//! collections: no I/O, no caching. Callers own fetching and caching.

use serde::{Deserialize, Serialize};

use super::catalog::{MenuCollection, MenuNode};
use crate::permissions::EffectivePermissions;

/// A visible menu entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedMenu {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Visible but not clickable when false.
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ResolvedMenu>,
}

/// Resolved entries of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCollection {
    pub name: String,
    pub items: Vec<ResolvedMenu>,
}

/// Read-only snapshot of everything the subject may see.
///
/// Never mutated in place: updates produce a new tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedMenuTree {
    pub collections: Vec<ResolvedCollection>,
}

/// Resolve `collections` for the given permissions.
///
/// Collections are kept even when empty so consumers can tell "nothing
/// visible" from "unknown collection".
pub fn resolve_menus(
    permissions: &EffectivePermissions,
    collections: &[MenuCollection],
) -> ResolvedMenuTree {
    ResolvedMenuTree {
        collections: collections
            .iter()
            .map(|c| ResolvedCollection {
                name: c.name.clone(),
                items: c
                    .items
                    .iter()
                    .filter_map(|n| resolve_node(permissions, n))
                    .collect(),
            })
            .collect(),
    }
}

/// Resolve a single node and its subtree.
///
/// A node needs its own permission. Containers additionally need at least
/// one visible descendant; they are never collapsed into their only child.
pub fn resolve_node(permissions: &EffectivePermissions, node: &MenuNode) -> Option<ResolvedMenu> {
    if let Some(required) = &node.required_permission
        && !permissions.allows(required)
    {
        return None;
    }

    let children: Vec<ResolvedMenu> = node
        .children
        .iter()
        .filter_map(|c| resolve_node(permissions, c))
        .collect();

    if node.is_container() && children.is_empty() {
        return None;
    }

    Some(ResolvedMenu {
        id: node.id.clone(),
        display_name: node.display_name.clone(),
        path: node.path.clone(),
        icon: node.icon.clone(),
        enabled: node.enabled,
        children,
    })
}

impl ResolvedMenuTree {
    /// A collection by name.
    pub fn collection(&self, name: &str) -> Option<&ResolvedCollection> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// A visible entry by id.
    pub fn find(&self, id: &str) -> Option<&ResolvedMenu> {
        self.collections
            .iter()
            .flat_map(|c| c.items.iter())
            .find_map(|m| find_menu(m, id))
    }

    /// Every visible id in depth-first order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for collection in &self.collections {
            for item in &collection.items {
                collect_ids(item, &mut ids);
            }
        }
        ids
    }

    /// Number of visible entries at any depth.
    pub fn visible_count(&self) -> usize {
        self.ids().len()
    }

    /// True when nothing is visible.
    pub fn is_empty(&self) -> bool {
        self.collections.iter().all(|c| c.items.is_empty())
    }

    pub(crate) fn find_mut(&mut self, id: &str) -> Option<&mut ResolvedMenu> {
        self.collections
            .iter_mut()
            .flat_map(|c| c.items.iter_mut())
            .find_map(|m| find_menu_mut(m, id))
    }

    /// Remove an entry anywhere in the tree. Returns whether it existed.
    pub(crate) fn remove(&mut self, id: &str) -> bool {
        self.collections
            .iter_mut()
            .any(|c| remove_from(&mut c.items, id))
    }
}

fn find_menu<'a>(menu: &'a ResolvedMenu, id: &str) -> Option<&'a ResolvedMenu> {
    if menu.id == id {
        return Some(menu);
    }
    menu.children.iter().find_map(|c| find_menu(c, id))
}

fn find_menu_mut<'a>(menu: &'a mut ResolvedMenu, id: &str) -> Option<&'a mut ResolvedMenu> {
    if menu.id == id {
        return Some(menu);
    }
    menu.children.iter_mut().find_map(|c| find_menu_mut(c, id))
}

fn remove_from(items: &mut Vec<ResolvedMenu>, id: &str) -> bool {
    if let Some(pos) = items.iter().position(|m| m.id == id) {
        items.remove(pos);
        return true;
    }
    items.iter_mut().any(|m| remove_from(&mut m.children, id))
}

fn collect_ids(menu: &ResolvedMenu, ids: &mut Vec<String>) {
    ids.push(menu.id.clone());
    for child in &menu.children {
        collect_ids(child, ids);
    }
}
