//! Role-based permissions.
//!
//! - [`PermissionTable`]: declared roles, their permissions and inheritance
//! - [`EffectivePermissionTable`]: the table flattened at load time
//! - [`PermissionService`]: cached checks for the current subject

mod service;
mod table;

pub use service::{PERMISSION_KEY_PREFIX, PermissionService, RESOLVED_KEY_PREFIX, Subject};
pub use table::{
    EffectivePermissionTable, EffectivePermissions, PermissionMode, PermissionTable,
    RoleDefinition, WILDCARD,
};
