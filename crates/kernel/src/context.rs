//! Navigation context: one per signed-in user, constructed at startup.
//!
//! Wires the permission table, menu catalog, cache, coordinator and push
//! listener together and exposes the operations UI consumers need.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::cache::{CacheConfig, CacheHealth, CacheLayer, CacheStats, Clock, SystemClock};
use crate::error::NavResult;
use crate::menu::{MenuCatalog, ResolvedMenuTree};
use crate::metrics::Metrics;
use crate::permissions::{PermissionMode, PermissionService, PermissionTable};
use crate::push::{PushEvent, PushHandler, PushListener};
use crate::sync::{
    ConfigSource, MenuCoordinator, MenuEvent, PermissionSource, SyncErrors, SyncOutcome,
    SyncState, VersionInfo,
};

/// Builder for [`NavContext`].
pub struct NavContextBuilder {
    config_source: Arc<dyn ConfigSource>,
    permission_source: Arc<dyn PermissionSource>,
    table: PermissionTable,
    catalog: MenuCatalog,
    cache_config: CacheConfig,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
    push_events: Option<mpsc::Receiver<PushEvent>>,
}

impl NavContextBuilder {
    /// Use a permission table other than the built-in one.
    pub fn permission_table(mut self, table: PermissionTable) -> Self {
        self.table = table;
        self
    }

    /// Use a menu catalog other than the built-in one.
    pub fn catalog(mut self, catalog: MenuCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Attach a push channel; a listener is spawned during `init`.
    pub fn push_events(mut self, events: mpsc::Receiver<PushEvent>) -> Self {
        self.push_events = Some(events);
        self
    }

    /// Load the user's role and permissions and the initial menus.
    pub async fn init(self, user_id: &str) -> NavResult<NavContext> {
        let table = Arc::new(self.table.compile()?);
        let metrics = self.metrics.unwrap_or_default();
        let cache = CacheLayer::with_metrics(self.cache_config, self.clock, Arc::clone(&metrics));

        let (role, granted) = tokio::join!(
            self.permission_source.user_role(user_id),
            self.permission_source.user_permissions(user_id)
        );
        let (role, granted) = (role?, granted?);

        let permissions = PermissionService::new(
            table,
            Arc::new(self.catalog),
            cache.clone(),
            &role,
            granted,
        );
        let coordinator = MenuCoordinator::new(
            self.config_source,
            cache.clone(),
            Arc::clone(&metrics),
            &role,
            permissions.effective(),
        );
        coordinator.init().await?;

        let context = NavContext {
            inner: Arc::new(ContextInner {
                user_id: user_id.to_string(),
                permission_source: self.permission_source,
                permissions,
                coordinator,
                cache,
                metrics: Arc::clone(&metrics),
                listener: Mutex::new(None),
            }),
        };

        if let Some(events) = self.push_events {
            let handler = Arc::new(WeakContext(Arc::downgrade(&context.inner)));
            *context.inner.listener.lock() = Some(PushListener::spawn(handler, events, metrics));
        }

        info!(
            user = %user_id,
            role = %role,
            version = context.version_info().current,
            "navigation context ready"
        );
        Ok(context)
    }
}

/// Navigation state for one user.
///
/// Clone is cheap; clones share state.
#[derive(Clone)]
pub struct NavContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    user_id: String,
    permission_source: Arc<dyn PermissionSource>,
    permissions: PermissionService,
    coordinator: MenuCoordinator,
    cache: CacheLayer,
    metrics: Arc<Metrics>,
    listener: Mutex<Option<PushListener>>,
}

impl NavContext {
    /// Start building a context with the built-in table and catalog.
    pub fn builder(
        config_source: Arc<dyn ConfigSource>,
        permission_source: Arc<dyn PermissionSource>,
    ) -> NavContextBuilder {
        NavContextBuilder {
            config_source,
            permission_source,
            table: PermissionTable::builtin(),
            catalog: MenuCatalog::builtin(),
            cache_config: CacheConfig::default(),
            clock: Arc::new(SystemClock),
            metrics: None,
            push_events: None,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// Menus visible to the user, as last synced.
    pub fn resolve_menus(&self) -> ResolvedMenuTree {
        self.inner.coordinator.menus()
    }

    /// Tools visible to the user, as last synced.
    pub fn tools(&self) -> ResolvedMenuTree {
        self.inner.coordinator.tools()
    }

    /// The static catalog resolved for the user.
    pub fn resolve_catalog(&self) -> ResolvedMenuTree {
        self.inner.permissions.resolve_catalog()
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.inner.permissions.has_permission(permission)
    }

    pub fn has_permissions<S: AsRef<str>>(&self, permissions: &[S], mode: PermissionMode) -> bool {
        self.inner.permissions.has_permissions(permissions, mode)
    }

    pub fn check_page_permission(&self, path: &str) -> bool {
        self.inner.permissions.check_page_permission(path)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn cache_health(&self) -> CacheHealth {
        self.inner.cache.health()
    }

    pub fn version_info(&self) -> VersionInfo {
        self.inner.coordinator.version_info()
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.coordinator.sync_state()
    }

    pub fn errors(&self) -> SyncErrors {
        self.inner.coordinator.errors()
    }

    /// Subscribe to menu and state change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<MenuEvent> {
        self.inner.coordinator.subscribe()
    }

    /// Reconcile menus with the server.
    pub async fn sync(&self) -> NavResult<SyncOutcome> {
        self.inner.coordinator.sync_menu_version().await
    }

    /// Refetch the user's role and permissions and reload menus.
    pub async fn refresh_permissions(&self) -> NavResult<()> {
        let granted = self
            .inner
            .permission_source
            .user_permissions(&self.inner.user_id)
            .await?;
        self.apply_permission_change(granted).await
    }

    /// Whether the push channel last reported `connected`.
    pub fn push_connected(&self) -> bool {
        self.inner
            .listener
            .lock()
            .as_ref()
            .is_some_and(PushListener::is_connected)
    }

    pub fn coordinator(&self) -> &MenuCoordinator {
        &self.inner.coordinator
    }

    pub fn permissions(&self) -> &PermissionService {
        &self.inner.permissions
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Stop the push listener and drop everything cached.
    pub fn dispose(&self) {
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.stop();
        }
        self.inner.cache.clear();
        info!(user = %self.inner.user_id, "navigation context disposed");
    }

    async fn apply_permission_change(&self, granted: Vec<String>) -> NavResult<()> {
        let role = match self.inner.permission_source.user_role(&self.inner.user_id).await {
            Ok(role) => role,
            Err(e) => {
                let current = self.inner.permissions.subject().role;
                warn!(error = %e, role = %current, "role lookup failed, keeping current role");
                current
            }
        };

        let effective = self.inner.permissions.set_subject(&role, granted);
        self.inner.coordinator.set_permissions(&role, effective).await
    }
}

#[async_trait]
impl PushHandler for NavContext {
    async fn handle_push(&self, event: PushEvent) -> NavResult<()> {
        match event {
            PushEvent::PermissionChanged {
                user_id,
                permissions,
            } if user_id == self.inner.user_id => {
                info!(user = %user_id, "own permissions changed");
                self.apply_permission_change(permissions).await
            }
            other => self.inner.coordinator.handle_push(other).await,
        }
    }
}

impl std::fmt::Debug for NavContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavContext")
            .field("user_id", &self.inner.user_id)
            .field("coordinator", &self.inner.coordinator)
            .finish()
    }
}

/// Push handler that does not keep the context alive.
struct WeakContext(Weak<ContextInner>);

#[async_trait]
impl PushHandler for WeakContext {
    async fn handle_push(&self, event: PushEvent) -> NavResult<()> {
        match self.0.upgrade() {
            Some(inner) => NavContext { inner }.handle_push(event).await,
            None => Ok(()),
        }
    }
}
