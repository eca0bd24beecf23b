//! Error types for menu resolution, caching, and synchronization.
//!
//! Configuration errors are fatal and surface at load time. Network and
//! cache failures are caught at the coordinator boundary and turned into
//! state transitions or a full reload. Version conflicts are state, not
//! errors, and a denied permission is simply `false`.

use thiserror::Error;

/// Errors raised while loading or compiling static configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Role inheritance forms a cycle.
    #[error("circular role inheritance detected involving roles: {roles}")]
    InheritanceCycle { roles: String },

    /// A role inherits from a role that is not declared.
    #[error("role '{role}': inherits from '{parent}' which is not defined")]
    UnknownParentRole { role: String, parent: String },

    /// Two menu nodes share an id.
    #[error("menu id '{id}' is declared more than once")]
    DuplicateMenuId { id: String },

    /// A menu node has an empty id.
    #[error("collection '{collection}': menu node with empty id")]
    EmptyMenuId { collection: String },

    /// A configuration document could not be parsed.
    #[error("failed to parse {source_name}: {details}")]
    Parse {
        source_name: String,
        details: String,
    },

    /// A configuration file could not be read.
    #[error("failed to read {path}: {details}")]
    Io { path: String, details: String },
}

impl ConfigError {
    /// Create a parse error for the named source.
    pub fn parse(source_name: impl Into<String>, details: impl ToString) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            details: details.to_string(),
        }
    }
}

/// Errors from the cache layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The cache is full and no expired entries could be swept.
    #[error("cache capacity of {capacity} entries exceeded writing '{key}'")]
    CapacityExceeded { key: String, capacity: usize },

    /// A value could not be serialized or deserialized.
    #[error("cache value for '{key}' could not be encoded: {details}")]
    Encoding { key: String, details: String },

    /// An invalidation pattern failed to compile.
    #[error("invalid cache key pattern '{pattern}': {details}")]
    InvalidPattern { pattern: String, details: String },
}

/// Errors applying an incremental update to a resolved menu tree.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeltaError {
    /// A remove (or status change) targeted an id that is not in the tree.
    #[error("menu item '{id}' not found")]
    UnknownItem { id: String },

    /// An add or update carried only an id.
    #[error("{action} of '{id}' is missing the menu item payload")]
    MissingPayload { action: String, id: String },
}

/// Errors validating inbound push notifications.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
    /// The event name is not part of the push protocol.
    #[error("unknown push event '{name}'")]
    UnknownEvent { name: String },

    /// The payload did not match the event's required shape.
    #[error("invalid payload for push event '{name}': {details}")]
    InvalidPayload { name: String, details: String },
}

/// Top-level error for navigation operations.
///
/// Cloneable so a single in-flight sync result can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum NavError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("network error: {0}")]
    Network(String),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("update error: {0}")]
    Delta(#[from] DeltaError),

    #[error("push error: {0}")]
    Push(#[from] PushError),

    /// The task driving an in-flight sync was dropped before finishing.
    #[error("in-flight sync was abandoned before completing")]
    SyncAbandoned,
}

impl NavError {
    /// Wrap a collaborator failure as a network error.
    pub fn network(err: impl std::fmt::Display) -> Self {
        Self::Network(err.to_string())
    }
}

/// Result type alias using NavError.
pub type NavResult<T> = Result<T, NavError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn config_error_messages_name_the_culprit() {
        let err = ConfigError::UnknownParentRole {
            role: "student".to_string(),
            parent: "learner".to_string(),
        };
        assert!(err.to_string().contains("learner"));

        let err = ConfigError::InheritanceCycle {
            roles: "a, b".to_string(),
        };
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn nav_error_wraps_sources() {
        let err: NavError = DeltaError::UnknownItem {
            id: "menu-9".to_string(),
        }
        .into();
        assert!(matches!(err, NavError::Delta(_)));
        assert!(err.to_string().contains("menu-9"));
    }
}
