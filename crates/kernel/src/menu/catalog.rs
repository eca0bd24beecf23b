//! Menu catalog - the static declaration of navigable menu nodes.
//!
//! Nodes are grouped into named collections (`bottom`, `tools`, `fashion`,
//! `admin`). Each node owns its children. The catalog also indexes node paths
//! so page guards can look up the permissions a route requires.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// A menu node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuNode {
    /// Unique key across the catalog.
    pub id: String,
    /// Human-readable label.
    pub display_name: String,
    /// Page path; absent for pure containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Permission needed to see the node (absent = public).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_permission: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<MenuNode>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl MenuNode {
    /// A public leaf node.
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            path: None,
            icon: None,
            required_permission: None,
            children: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.required_permission = Some(permission.into());
        self
    }

    pub fn with_children(mut self, children: Vec<MenuNode>) -> Self {
        self.children = children;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// A node with children and either no own permission or no page.
    pub fn is_container(&self) -> bool {
        !self.children.is_empty() && (self.required_permission.is_none() || self.path.is_none())
    }
}

/// A named group of top-level menu nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuCollection {
    pub name: String,
    #[serde(default)]
    pub items: Vec<MenuNode>,
}

impl MenuCollection {
    pub fn new(name: impl Into<String>, items: Vec<MenuNode>) -> Self {
        Self {
            name: name.into(),
            items,
        }
    }
}

/// On-disk catalog layout.
#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    collections: Vec<MenuCollection>,
}

/// Result of matching a page path against the catalog.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// Id of the matched node.
    pub node_id: String,
    /// Permissions along the path from the collection root to the node.
    pub required: Vec<String>,
    /// Path parameters extracted (e.g., {"id": "42"})
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct Route {
    pattern: String,
    node_id: String,
    required: Vec<String>,
}

/// Validated catalog of menu collections.
#[derive(Debug, Clone, Default)]
pub struct MenuCatalog {
    collections: Vec<MenuCollection>,
    /// Route patterns, most specific first.
    routes: Vec<Route>,
}

impl MenuCatalog {
    /// Validate collections and build the route index.
    ///
    /// # Errors
    /// Empty or duplicate node ids anywhere in the catalog.
    pub fn new(collections: Vec<MenuCollection>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for collection in &collections {
            for node in &collection.items {
                check_ids(node, &collection.name, &mut seen)?;
            }
        }

        let mut catalog = Self {
            collections,
            routes: Vec::new(),
        };
        catalog.build_routes();
        Ok(catalog)
    }

    /// The platform's default navigation.
    pub fn builtin() -> Self {
        let bottom = MenuCollection::new(
            "bottom",
            vec![
                MenuNode::new("word-slash", "Word Slash")
                    .with_path("/pages/word-slash/index")
                    .with_icon("book")
                    .with_permission("view_word_learning"),
                MenuNode::new("tools", "Tools")
                    .with_path("/pages/tools/index")
                    .with_icon("wrench")
                    .with_permission("access_dev_tools"),
                MenuNode::new("fashion", "Fashion")
                    .with_path("/pages/fashion/index")
                    .with_icon("star")
                    .with_permission("access_fashion_content"),
                MenuNode::new("profile", "Profile")
                    .with_path("/pages/profile/index")
                    .with_icon("user")
                    .with_permission("view_own_profile"),
            ],
        );

        let tools = MenuCollection::new(
            "tools",
            vec![
                MenuNode::new("tool-dictionary", "Dictionary")
                    .with_path("/tools/dictionary")
                    .with_icon("search")
                    .with_permission("view_word_learning"),
                MenuNode::new("tool-pronunciation", "Pronunciation")
                    .with_path("/tools/pronunciation")
                    .with_icon("sound")
                    .with_permission("view_word_learning"),
                MenuNode::new("tool-api-tester", "API Tester")
                    .with_path("/tools/api-tester")
                    .with_icon("code")
                    .with_permission("access_dev_tools"),
                MenuNode::new("tool-json-viewer", "JSON Viewer")
                    .with_path("/tools/json-viewer")
                    .with_icon("code")
                    .with_permission("access_dev_tools"),
            ],
        );

        let fashion = MenuCollection::new(
            "fashion",
            vec![
                MenuNode::new("fashion-daily-words", "Daily Words")
                    .with_path("/fashion/daily-words")
                    .with_permission("access_fashion_content"),
                MenuNode::new("fashion-article", "Article")
                    .with_path("/fashion/article/:id")
                    .with_permission("access_fashion_content"),
                MenuNode::new("fashion-community", "Community Picks")
                    .with_path("/fashion/community")
                    .with_permission("access_community"),
            ],
        );

        let admin = MenuCollection::new(
            "admin",
            vec![MenuNode::new("admin-console", "Admin Console")
                .with_icon("settings")
                .with_children(vec![
                    MenuNode::new("admin-users", "Users")
                        .with_path("/admin/users")
                        .with_permission("manage_users"),
                    MenuNode::new("admin-words", "Word Bank")
                        .with_path("/admin/words")
                        .with_permission("manage_word_bank"),
                    MenuNode::new("admin-stats", "Statistics")
                        .with_path("/admin/stats")
                        .with_permission("view_statistics"),
                ])],
        );

        // Built-in ids are unique, so validation cannot fail; build directly.
        let mut catalog = Self {
            collections: vec![bottom, tools, fashion, admin],
            routes: Vec::new(),
        };
        catalog.build_routes();
        catalog
    }

    /// Parse a TOML catalog document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let file: CatalogFile =
            toml::from_str(source).map_err(|e| ConfigError::parse("menu catalog", e))?;
        Self::new(file.collections)
    }

    /// Parse a YAML catalog document.
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        let file: CatalogFile =
            serde_yml::from_str(source).map_err(|e| ConfigError::parse("menu catalog", e))?;
        Self::new(file.collections)
    }

    /// Load from a `.toml`, `.yaml` or `.yml` file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            details: e.to_string(),
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml_str(&source),
            _ => Self::from_toml_str(&source),
        }
    }

    /// All collections in declaration order.
    pub fn collections(&self) -> &[MenuCollection] {
        &self.collections
    }

    /// A collection by name.
    pub fn collection(&self, name: &str) -> Option<&MenuCollection> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// A node by id, searching every collection depth-first.
    pub fn find(&self, id: &str) -> Option<&MenuNode> {
        self.collections
            .iter()
            .flat_map(|c| c.items.iter())
            .find_map(|n| find_node(n, id))
    }

    /// Match a page path against node paths.
    pub fn match_path(&self, path: &str) -> Option<RouteMatch> {
        self.routes.iter().find_map(|route| {
            match_pattern(&route.pattern, path).map(|params| RouteMatch {
                node_id: route.node_id.clone(),
                required: route.required.clone(),
                params,
            })
        })
    }

    fn build_routes(&mut self) {
        let mut routes = Vec::new();
        for collection in &self.collections {
            for node in &collection.items {
                collect_routes(node, &[], &mut routes);
            }
        }

        // Fewer params = more specific = first; then deeper paths first
        routes.sort_by_key(|r: &Route| {
            let param_count = r.pattern.matches(':').count();
            let segment_count = r.pattern.matches('/').count();
            (param_count, -(segment_count as i32))
        });

        debug!(routes = routes.len(), "built menu route table");
        self.routes = routes;
    }
}

fn check_ids(
    node: &MenuNode,
    collection: &str,
    seen: &mut HashSet<String>,
) -> Result<(), ConfigError> {
    if node.id.trim().is_empty() {
        return Err(ConfigError::EmptyMenuId {
            collection: collection.to_string(),
        });
    }
    if !seen.insert(node.id.clone()) {
        return Err(ConfigError::DuplicateMenuId {
            id: node.id.clone(),
        });
    }
    for child in &node.children {
        check_ids(child, collection, seen)?;
    }
    Ok(())
}

fn find_node<'a>(node: &'a MenuNode, id: &str) -> Option<&'a MenuNode> {
    if node.id == id {
        return Some(node);
    }
    node.children.iter().find_map(|c| find_node(c, id))
}

fn collect_routes(node: &MenuNode, inherited: &[String], routes: &mut Vec<Route>) {
    let mut required = inherited.to_vec();
    if let Some(perm) = &node.required_permission {
        required.push(perm.clone());
    }

    if let Some(path) = &node.path {
        routes.push(Route {
            pattern: path.clone(),
            node_id: node.id.clone(),
            required: required.clone(),
        });
    }

    for child in &node.children {
        collect_routes(child, &required, routes);
    }
}

/// Match a route pattern against a path, extracting parameters.
///
/// Pattern: "/fashion/article/:id"
/// Path: "/fashion/article/42"
/// Result: Some({"id": "42"})
fn match_pattern(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let path_parts: Vec<&str> = path.split('/').collect();

    if pattern_parts.len() != path_parts.len() {
        return None;
    }

    let mut params = HashMap::new();

    for (pat, actual) in pattern_parts.iter().zip(path_parts.iter()) {
        if let Some(param_name) = pat.strip_prefix(':') {
            params.insert(param_name.to_string(), actual.to_string());
        } else if pat != actual {
            return None;
        }
    }

    Some(params)
}
