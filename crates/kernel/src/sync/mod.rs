//! Menu version synchronization.
//!
//! The coordinator keeps resolved snapshots in step with the authoritative
//! backend, reached through the [`ConfigSource`] seam.

mod coordinator;
mod http;
mod source;
mod state;

pub use coordinator::{
    MENU_CONFIG_PREFIX, MENU_TOOLS_PREFIX, MENU_VERSION_KEY, MenuCoordinator, menus_key, tools_key,
};
pub use http::{HttpConfigSource, HttpPermissionSource};
pub use source::{ConfigSource, PermissionSource, ServerVersion, SyncResponse};
pub use state::{MenuEvent, SyncErrors, SyncOutcome, SyncState, UpdateOutcome, VersionInfo};
