//! Permission checking for the current subject, backed by the cache layer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::table::{EffectivePermissionTable, EffectivePermissions, PermissionMode};
use crate::cache::CacheLayer;
use crate::menu::{MenuCatalog, ResolvedMenuTree, resolve_menus};

/// Cache key prefix for permission check results.
pub const PERMISSION_KEY_PREFIX: &str = "perm:";

/// Cache key prefix for catalog resolutions.
pub const RESOLVED_KEY_PREFIX: &str = "menu:resolved:";

/// Default TTL for cached check results (60 seconds).
const CHECK_TTL_SECS: u64 = 60;

/// The user whose permissions are being checked.
#[derive(Debug, Clone)]
pub struct Subject {
    pub role: String,
    pub granted: Vec<String>,
    pub effective: EffectivePermissions,
}

/// Permission service with cached lookups.
///
/// Clone is cheap; clones share the subject and cache.
#[derive(Clone)]
pub struct PermissionService {
    inner: Arc<PermissionServiceInner>,
}

struct PermissionServiceInner {
    table: Arc<EffectivePermissionTable>,
    catalog: Arc<MenuCatalog>,
    cache: CacheLayer,
    subject: RwLock<Subject>,
}

impl PermissionService {
    /// Create a service for `role` plus directly granted permissions.
    pub fn new(
        table: Arc<EffectivePermissionTable>,
        catalog: Arc<MenuCatalog>,
        cache: CacheLayer,
        role: &str,
        granted: Vec<String>,
    ) -> Self {
        if table.role(role).is_none() {
            warn!(role = %role, "role not in permission table, using granted permissions only");
        }
        let subject = Subject {
            role: role.to_string(),
            effective: table.for_subject(role, &granted),
            granted,
        };

        Self {
            inner: Arc::new(PermissionServiceInner {
                table,
                catalog,
                cache,
                subject: RwLock::new(subject),
            }),
        }
    }

    /// Current subject.
    pub fn subject(&self) -> Subject {
        self.inner.subject.read().clone()
    }

    /// Current effective permissions.
    pub fn effective(&self) -> EffectivePermissions {
        self.inner.subject.read().effective.clone()
    }

    /// Replace the subject and drop every cached check and resolution.
    pub fn set_subject(&self, role: &str, granted: Vec<String>) -> EffectivePermissions {
        let effective = self.inner.table.for_subject(role, &granted);
        {
            let mut subject = self.inner.subject.write();
            subject.role = role.to_string();
            subject.granted = granted;
            subject.effective = effective.clone();
        }

        let mut dropped = 0;
        for prefix in [PERMISSION_KEY_PREFIX, RESOLVED_KEY_PREFIX] {
            // Prefix patterns cannot fail to parse.
            dropped += self.inner.cache.invalidate(prefix).unwrap_or(0);
        }
        debug!(role = %role, dropped, "permission subject replaced");

        effective
    }

    /// Whether the subject holds `permission`.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.has_permissions(&[permission], PermissionMode::All)
    }

    /// Check a list of permissions under `mode`.
    pub fn has_permissions<S: AsRef<str>>(&self, permissions: &[S], mode: PermissionMode) -> bool {
        let subject = self.inner.subject.read().clone();
        if subject.effective.all {
            return true;
        }

        let key = check_key(&subject.role, mode, permissions);
        if let Some(cached) = self.inner.cache.get_json::<bool>(&key) {
            return cached;
        }

        let allowed = subject.effective.allows_all_of(permissions, mode);
        if let Err(e) =
            self.inner
                .cache
                .set_json(&key, &allowed, Duration::from_secs(CHECK_TTL_SECS))
        {
            debug!(key = %key, error = %e, "permission check result not cached");
        }
        allowed
    }

    /// Whether the subject may open the page at `path`.
    ///
    /// The page and every menu ancestor must be permitted. Paths not in the
    /// catalog are public.
    pub fn check_page_permission(&self, path: &str) -> bool {
        let Some(route) = self.inner.catalog.match_path(path) else {
            debug!(path = %path, "page not in catalog, treating as public");
            return true;
        };
        self.has_permissions(&route.required, PermissionMode::All)
    }

    /// Resolve the static catalog for the subject, caching the result.
    pub fn resolve_catalog(&self) -> ResolvedMenuTree {
        let subject = self.inner.subject.read().clone();
        let key = format!("{RESOLVED_KEY_PREFIX}{}", subject.role);

        if let Some(tree) = self.inner.cache.get_json::<ResolvedMenuTree>(&key) {
            return tree;
        }

        let tree = resolve_menus(&subject.effective, self.inner.catalog.collections());
        if let Err(e) = self.inner.cache.set_json(&key, &tree, Duration::ZERO) {
            debug!(key = %key, error = %e, "resolved catalog not cached");
        }
        tree
    }

    /// The catalog checks run against.
    pub fn catalog(&self) -> &MenuCatalog {
        &self.inner.catalog
    }
}

impl std::fmt::Debug for PermissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionService")
            .field("role", &self.inner.subject.read().role)
            .finish()
    }
}

fn check_key<S: AsRef<str>>(role: &str, mode: PermissionMode, permissions: &[S]) -> String {
    let mut sorted: Vec<&str> = permissions.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    format!(
        "{PERMISSION_KEY_PREFIX}{role}:{}:{}",
        mode.as_str(),
        sorted.join(",")
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::permissions::PermissionTable;

    fn service(role: &str, granted: &[&str]) -> (PermissionService, CacheLayer) {
        let cache = CacheLayer::new(CacheConfig::default());
        let table = Arc::new(PermissionTable::builtin().compile().unwrap());
        let catalog = Arc::new(MenuCatalog::builtin());
        let svc = PermissionService::new(
            table,
            catalog,
            cache.clone(),
            role,
            granted.iter().map(|s| s.to_string()).collect(),
        );
        (svc, cache)
    }

    #[test]
    fn checks_are_cached() {
        let (svc, cache) = service("student", &[]);
        assert!(svc.has_permission("view_word_learning"));
        assert!(svc.has_permission("view_word_learning"));

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
    }

    #[test]
    fn check_key_is_order_independent() {
        assert_eq!(
            check_key("student", PermissionMode::Any, &["b", "a"]),
            check_key("student", PermissionMode::Any, &["a", "b"])
        );
    }

    #[test]
    fn set_subject_drops_cached_checks() {
        let (svc, _) = service("student", &[]);
        assert!(!svc.has_permission("view_own_profile"));

        svc.set_subject("student", vec!["view_own_profile".to_string()]);
        assert!(svc.has_permission("view_own_profile"));
    }

    #[test]
    fn page_permission_follows_catalog() {
        let (svc, _) = service("student", &[]);
        assert!(svc.check_page_permission("/pages/word-slash/index"));
        assert!(!svc.check_page_permission("/pages/fashion/index"));
        assert!(!svc.check_page_permission("/admin/users"));
        assert!(svc.check_page_permission("/not/in/catalog"));
    }

    #[test]
    fn admin_passes_every_page() {
        let (svc, _) = service("admin", &[]);
        assert!(svc.check_page_permission("/admin/users"));
        assert!(svc.has_permissions(&["x", "y"], PermissionMode::All));
    }

    #[test]
    fn resolve_catalog_uses_cache() {
        let (svc, cache) = service("student", &[]);
        let first = svc.resolve_catalog();
        let second = svc.resolve_catalog();
        assert_eq!(first, second);
        assert_eq!(cache.stats().hit_count, 1);
    }
}
