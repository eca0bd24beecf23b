//! Static role → permission table with inheritance.
//!
//! Roles inherit from other roles; the literal `*` (as a permission or as an
//! inherits target) grants every permission. Compiling the table orders roles
//! with Kahn's algorithm so parents are flattened before their children and
//! any inheritance cycle is reported at load time.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Marker granting every permission.
pub const WILDCARD: &str = "*";

/// How a list of permissions is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// At least one permission must be held.
    #[default]
    Any,
    /// Every permission must be held.
    All,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::All => "all",
        }
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "all" => Ok(Self::All),
            other => Err(format!("unknown permission mode '{other}', expected any|all")),
        }
    }
}

/// A role's own permissions and the roles it inherits from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub inherits: Vec<String>,
}

/// Declared permission table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionTable {
    #[serde(default)]
    pub roles: BTreeMap<String, RoleDefinition>,
}

impl PermissionTable {
    /// Built-in roles of the learning platform.
    pub fn builtin() -> Self {
        let mut table = Self::default();
        table.define("guest", &["view_public_content"], &[]);
        table.define(
            "student",
            &["view_word_learning", "access_community"],
            &["guest"],
        );
        table.define(
            "vip_student",
            &["access_fashion_content", "view_own_profile"],
            &["student"],
        );
        table.define(
            "teacher",
            &[
                "view_own_profile",
                "manage_classes",
                "view_student_progress",
                "access_dev_tools",
            ],
            &["student"],
        );
        table.define("admin", &[WILDCARD], &[]);
        table
    }

    /// Add or replace a role definition.
    pub fn define(&mut self, role: &str, permissions: &[&str], inherits: &[&str]) {
        self.roles.insert(
            role.to_string(),
            RoleDefinition {
                permissions: permissions.iter().map(|p| p.to_string()).collect(),
                inherits: inherits.iter().map(|r| r.to_string()).collect(),
            },
        );
    }

    /// Parse a TOML table document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::parse("permission table", e))
    }

    /// Parse a YAML table document.
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        serde_yml::from_str(source).map_err(|e| ConfigError::parse("permission table", e))
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

    /// Flatten inheritance into per-role effective permission sets.
    ///
    /// # Errors
    /// - a role inherits from an undeclared role
    /// - inheritance forms a cycle
    pub fn compile(&self) -> Result<EffectivePermissionTable, ConfigError> {
        let order = self.inheritance_order()?;

        let mut effective: HashMap<String, EffectivePermissions> =
            HashMap::with_capacity(self.roles.len());

        for role in &order {
            let Some(def) = self.roles.get(role) else {
                continue;
            };

            let mut perms = EffectivePermissions::from_permissions(def.permissions.iter().cloned());
            for parent in &def.inherits {
                if parent == WILDCARD {
                    perms.all = true;
                } else if let Some(inherited) = effective.get(parent) {
                    perms.merge(inherited);
                }
            }

            effective.insert(role.clone(), perms);
        }

        debug!(roles = effective.len(), "permission table compiled");
        Ok(EffectivePermissionTable { roles: effective })
    }

    /// Roles ordered so that every parent precedes its children.
    fn inheritance_order(&self) -> Result<Vec<String>, ConfigError> {
        // in_degree[r] = number of parents r must wait for
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();

        for name in self.roles.keys() {
            in_degree.insert(name, 0);
            children.entry(name.as_str()).or_default();
        }

        for (name, def) in &self.roles {
            for parent in def.inherits.iter().filter(|p| p.as_str() != WILDCARD) {
                if !self.roles.contains_key(parent) {
                    return Err(ConfigError::UnknownParentRole {
                        role: name.clone(),
                        parent: parent.clone(),
                    });
                }
                if let Some(degree) = in_degree.get_mut(name.as_str()) {
                    *degree += 1;
                }
                children.entry(parent.as_str()).or_default().push(name.as_str());
            }
        }

        // BTreeMap iteration keeps the output deterministic
        let mut queue: VecDeque<&str> = self
            .roles
            .keys()
            .map(String::as_str)
            .filter(|r| in_degree.get(r) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.roles.len());

        while let Some(role) = queue.pop_front() {
            order.push(role.to_string());

            if let Some(kids) = children.get(role) {
                for child in kids {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(*child);
                        }
                    }
                }
            }
        }

        if order.len() != self.roles.len() {
            let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            let unplaced: BTreeSet<&str> = self
                .roles
                .keys()
                .map(String::as_str)
                .filter(|r| !placed.contains(r))
                .collect();
            // Roles that merely inherit from a cycle are unplaced too.
            let in_cycle: Vec<&str> = unplaced
                .iter()
                .copied()
                .filter(|r| on_cycle(r, &children, &unplaced))
                .collect();

            return Err(ConfigError::InheritanceCycle {
                roles: in_cycle.join(", "),
            });
        }

        Ok(order)
    }
}

/// Whether `start` can reach itself through unplaced roles.
fn on_cycle<'a>(
    start: &str,
    children: &HashMap<&'a str, Vec<&'a str>>,
    unplaced: &BTreeSet<&'a str>,
) -> bool {
    let mut stack: Vec<&'a str> = children.get(start).cloned().unwrap_or_default();
    let mut seen = HashSet::new();
    while let Some(role) = stack.pop() {
        if role == start {
            return true;
        }
        if !unplaced.contains(role) || !seen.insert(role) {
            continue;
        }
        if let Some(kids) = children.get(role) {
            stack.extend(kids.iter().copied());
        }
    }
    false
}

/// A flattened, deduplicated permission set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePermissions {
    /// Wildcard-all: every check passes.
    pub all: bool,
    /// Explicit permissions.
    pub set: BTreeSet<String>,
}

impl EffectivePermissions {
    /// Build from a list; a `*` entry sets wildcard-all.
    pub fn from_permissions<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut perms = Self::default();
        for p in permissions {
            let p = p.into();
            if p == WILDCARD {
                perms.all = true;
            } else {
                perms.set.insert(p);
            }
        }
        perms
    }

    /// Union `other` into `self`.
    pub fn merge(&mut self, other: &EffectivePermissions) {
        self.all |= other.all;
        self.set.extend(other.set.iter().cloned());
    }

    /// Whether a single permission is held.
    pub fn allows(&self, permission: &str) -> bool {
        self.all || self.set.contains(permission)
    }

    /// Check a list of permissions. An empty list always passes.
    pub fn allows_all_of<S: AsRef<str>>(&self, permissions: &[S], mode: PermissionMode) -> bool {
        if self.all || permissions.is_empty() {
            return true;
        }
        match mode {
            PermissionMode::Any => permissions.iter().any(|p| self.allows(p.as_ref())),
            PermissionMode::All => permissions.iter().all(|p| self.allows(p.as_ref())),
        }
    }

    /// Number of explicit permissions.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// True when nothing is granted.
    pub fn is_empty(&self) -> bool {
        !self.all && self.set.is_empty()
    }
}

/// Compiled table of effective permissions per role.
#[derive(Debug, Clone, Default)]
pub struct EffectivePermissionTable {
    roles: HashMap<String, EffectivePermissions>,
}

impl EffectivePermissionTable {
    /// Effective permissions of a declared role.
    pub fn role(&self, role: &str) -> Option<&EffectivePermissions> {
        self.roles.get(role)
    }

    /// Role permissions unioned with directly granted permissions.
    ///
    /// Unknown roles contribute nothing.
    pub fn for_subject<S: AsRef<str>>(&self, role: &str, granted: &[S]) -> EffectivePermissions {
        let mut perms = self.roles.get(role).cloned().unwrap_or_default();
        perms.merge(&EffectivePermissions::from_permissions(
            granted.iter().map(|g| g.as_ref().to_string()),
        ));
        perms
    }

    /// Declared role names, sorted.
    pub fn role_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.roles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
