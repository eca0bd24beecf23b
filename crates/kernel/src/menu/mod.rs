//! Menu system for navigation.
//!
//! - Catalog: static menu collections, each node tagged with a permission
//! - Resolver: prunes the catalog to what a permission set may see
//! - Deltas: incremental add/update/remove against a resolved tree

mod catalog;
mod delta;
mod resolver;

pub use catalog::{MenuCatalog, MenuCollection, MenuNode, RouteMatch};
pub use delta::{DEFAULT_COLLECTION, DeltaAction, DeltaItem, UpdateDelta};
pub use resolver::{
    ResolvedCollection, ResolvedMenu, ResolvedMenuTree, resolve_menus, resolve_node,
};
