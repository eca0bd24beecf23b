//! Version/sync coordinator.
//!
//! Owns the resolved menu and tools snapshots, the local version, and the
//! sync state machine (`Idle → Syncing → Idle | Conflicted | Error`).
//!
//! Concurrency rules:
//! - Only one sync runs at a time. Concurrent callers await the in-flight
//!   sync's result instead of starting another.
//! - Every mutating operation takes a generation number. A result is only
//!   committed if no newer operation has started since; otherwise it is
//!   discarded.
//! - Snapshot replacement is all-or-nothing. A failed incremental batch is
//!   never cached; a full reload replaces it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::source::ConfigSource;
use super::state::{MenuEvent, SyncErrors, SyncOutcome, SyncState, UpdateOutcome, VersionInfo};
use crate::cache::{CacheLayer, CacheStats};
use crate::error::{CacheError, NavError, NavResult};
use crate::menu::{MenuCatalog, ResolvedMenuTree, UpdateDelta, resolve_menus};
use crate::metrics::Metrics;
use crate::permissions::EffectivePermissions;
use crate::push::{PushEvent, PushHandler};

/// Cache key of the local menu version.
pub const MENU_VERSION_KEY: &str = "menu:version";

/// Cache key prefix of resolved menu snapshots.
pub const MENU_CONFIG_PREFIX: &str = "menu:config:";

/// Cache key prefix of resolved tools snapshots.
pub const MENU_TOOLS_PREFIX: &str = "menu:tools:";

/// Buffered change notifications per subscriber.
const EVENT_CAPACITY: usize = 64;

type SharedSyncResult = Option<NavResult<SyncOutcome>>;

/// Menu version/sync coordinator.
///
/// Clone is cheap; clones share state.
#[derive(Clone)]
pub struct MenuCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    source: Arc<dyn ConfigSource>,
    cache: CacheLayer,
    metrics: Arc<Metrics>,
    state: RwLock<CoordinatorState>,
    generation: AtomicU64,
    /// Receiver for the in-flight sync's result, if one is running.
    inflight: Mutex<Option<watch::Receiver<SharedSyncResult>>>,
    events: broadcast::Sender<MenuEvent>,
}

struct CoordinatorState {
    sync_state: SyncState,
    version: VersionInfo,
    errors: SyncErrors,
    role: String,
    permissions: EffectivePermissions,
    menus: ResolvedMenuTree,
    tools: ResolvedMenuTree,
}

/// Changes staged by an operation, applied only if it is still current.
#[derive(Default)]
struct Commit {
    menus: Option<ResolvedMenuTree>,
    tools: Option<ResolvedMenuTree>,
    version: Option<u64>,
    /// Set by a sync that reported conflicts.
    conflicts: Option<Vec<String>>,
    /// Set by a successful sync.
    resolve_conflicts: bool,
    /// Cache write failures abort the commit instead of being logged.
    strict_cache: bool,
}

#[derive(Debug, Clone, Copy)]
enum Activity {
    Syncing,
    Loading,
}

enum Flight {
    Leader(watch::Sender<SharedSyncResult>),
    Follower(watch::Receiver<SharedSyncResult>),
}

/// Releases the in-flight slot when the leading sync ends or is dropped.
struct InflightGuard<'a> {
    inner: &'a CoordinatorInner,
    completed: bool,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        *self.inner.inflight.lock() = None;
        if !self.completed {
            let mut state = self.inner.state.write();
            if state.sync_state == SyncState::Syncing {
                warn!("in-flight sync dropped before completing");
                state.sync_state = SyncState::Idle;
            }
        }
    }
}

impl MenuCoordinator {
    /// Create a coordinator for a subject's role and effective permissions.
    ///
    /// Snapshots start empty; call [`init`](Self::init) to load them.
    pub fn new(
        source: Arc<dyn ConfigSource>,
        cache: CacheLayer,
        metrics: Arc<Metrics>,
        role: &str,
        permissions: EffectivePermissions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(CoordinatorInner {
                source,
                cache,
                metrics,
                state: RwLock::new(CoordinatorState {
                    sync_state: SyncState::Idle,
                    version: VersionInfo::default(),
                    errors: SyncErrors::default(),
                    role: role.to_string(),
                    permissions,
                    menus: ResolvedMenuTree::default(),
                    tools: ResolvedMenuTree::default(),
                }),
                generation: AtomicU64::new(0),
                inflight: Mutex::new(None),
                events,
            }),
        }
    }

    /// Load snapshots, preferring cached ones over a fetch.
    pub async fn init(&self) -> NavResult<()> {
        let generation = self.begin();
        let role = self.inner.state.read().role.clone();

        let cached_menus = self.inner.cache.get_json::<ResolvedMenuTree>(&menus_key(&role));
        let cached_tools = self.inner.cache.get_json::<ResolvedMenuTree>(&tools_key(&role));
        if let (Some(menus), Some(tools)) = (cached_menus, cached_tools) {
            let version = self.inner.cache.get_json::<u64>(MENU_VERSION_KEY);
            info!(role = %role, version = ?version, "menus restored from cache");
            self.commit(
                generation,
                Commit {
                    menus: Some(menus),
                    tools: Some(tools),
                    version,
                    ..Commit::default()
                },
            )?;
            return Ok(());
        }

        let version = match self.inner.source.server_version().await {
            Ok(v) => Some(v.version),
            Err(e) => {
                warn!(error = %e, "server version unavailable during init");
                None
            }
        };

        self.reload_with(generation, version).await?;
        info!(role = %role, version = self.version_info().current, "menus loaded");
        Ok(())
    }

    /// Reconcile the local version with the server's.
    ///
    /// Concurrent calls share one in-flight sync. Failures move the state
    /// machine to `Error`, set `errors().syncing`, and are returned; there is
    /// no automatic retry.
    pub async fn sync_menu_version(&self) -> NavResult<SyncOutcome> {
        let flight = {
            let mut slot = self.inner.inflight.lock();
            match slot.as_ref() {
                Some(rx) => Flight::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Flight::Leader(tx)
                }
            }
        };

        match flight {
            Flight::Follower(mut rx) => {
                debug!("sync already in flight, awaiting its result");
                match rx.wait_for(Option::is_some).await {
                    Ok(result) => (*result).clone().unwrap_or(Err(NavError::SyncAbandoned)),
                    Err(_) => Err(NavError::SyncAbandoned),
                }
            }
            Flight::Leader(tx) => {
                let mut guard = InflightGuard {
                    inner: &self.inner,
                    completed: false,
                };
                let result = self.run_sync().await;
                guard.completed = true;
                tx.send_replace(Some(result.clone()));
                result
            }
        }
    }

    /// Apply an ordered batch of deltas to the menu snapshot.
    ///
    /// The batch applies whole or not at all. If any delta or the cache
    /// write fails, menus and tools are refetched in full instead.
    pub async fn incremental_update_menus(&self, deltas: &[UpdateDelta]) -> NavResult<UpdateOutcome> {
        self.incremental_with_version(deltas, None).await
    }

    /// Change one tool's enabled flag, or reload tools when not incremental.
    pub async fn update_tool_status(
        &self,
        tool_id: &str,
        enabled: bool,
        incremental: bool,
    ) -> NavResult<UpdateOutcome> {
        let generation = self.begin();
        if !incremental {
            return Ok(if self.reload_with(generation, None).await? {
                UpdateOutcome::Reloaded
            } else {
                UpdateOutcome::Superseded
            });
        }

        let tools = self.inner.state.read().tools.clone();
        let staged = tools
            .set_enabled(tool_id, enabled)
            .map_err(NavError::from)
            .and_then(|tools| {
                self.commit(
                    generation,
                    Commit {
                        tools: Some(tools),
                        strict_cache: true,
                        ..Commit::default()
                    },
                )
                .map_err(NavError::from)
            });

        match staged {
            Ok(true) => {
                debug!(tool = %tool_id, enabled, "tool status updated");
                Ok(UpdateOutcome::Applied { updates: 1 })
            }
            Ok(false) => Ok(UpdateOutcome::Superseded),
            Err(e) => {
                warn!(tool = %tool_id, error = %e, "tool status update failed, reloading");
                self.inner.metrics.record_incremental(true);
                self.reload_with(generation, None).await?;
                Ok(UpdateOutcome::ReloadedAfterFailure)
            }
        }
    }

    /// Refetch menus and tools from the authoritative source.
    pub async fn full_reload(&self) -> NavResult<()> {
        let generation = self.begin();
        self.reload_with(generation, None).await.map(|_| ())
    }

    /// Replace the subject's permissions and reload everything.
    pub async fn set_permissions(&self, role: &str, permissions: EffectivePermissions) -> NavResult<()> {
        let generation = self.begin();
        {
            let mut state = self.inner.state.write();
            state.role = role.to_string();
            state.permissions = permissions;
        }

        for prefix in [MENU_CONFIG_PREFIX, MENU_TOOLS_PREFIX] {
            // Prefix patterns cannot fail to parse.
            self.inner.cache.invalidate(prefix).ok();
        }

        info!(role = %role, "permissions changed, reloading menus");
        self.reload_with(generation, None).await?;
        self.refresh_cache_stats();
        Ok(())
    }

    /// Sweep expired cache entries (and `pattern`, if given), then publish stats.
    pub fn handle_cache_invalidated(&self, pattern: Option<&str>) -> NavResult<usize> {
        let mut removed = self.inner.cache.clear_expired();
        if let Some(pattern) = pattern {
            removed += self.inner.cache.invalidate(pattern)?;
        }
        debug!(removed, pattern = ?pattern, "cache invalidated by push");
        self.refresh_cache_stats();
        Ok(removed)
    }

    /// Publish current cache statistics to subscribers.
    pub fn refresh_cache_stats(&self) -> CacheStats {
        let stats = self.inner.cache.stats();
        self.emit(MenuEvent::CacheStatsRefreshed(stats.clone()));
        stats
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<MenuEvent> {
        self.inner.events.subscribe()
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.state.read().sync_state
    }

    pub fn version_info(&self) -> VersionInfo {
        self.inner.state.read().version.clone()
    }

    pub fn errors(&self) -> SyncErrors {
        self.inner.state.read().errors.clone()
    }

    /// Current resolved menu snapshot.
    pub fn menus(&self) -> ResolvedMenuTree {
        self.inner.state.read().menus.clone()
    }

    /// Current resolved tools snapshot.
    pub fn tools(&self) -> ResolvedMenuTree {
        self.inner.state.read().tools.clone()
    }

    pub fn role(&self) -> String {
        self.inner.state.read().role.clone()
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.inner.cache
    }

    fn begin(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn run_sync(&self) -> NavResult<SyncOutcome> {
        let started = Instant::now();
        let generation = self.begin();
        let (local, conflicted) = {
            let mut state = self.inner.state.write();
            state.errors.syncing = None;
            state.sync_state = SyncState::Syncing;
            (state.version.current, state.version.has_conflicts)
        };
        self.emit(MenuEvent::StateChanged {
            state: SyncState::Syncing,
        });

        let result = self.sync_steps(generation, local, conflicted).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(outcome) => {
                info!(outcome = outcome.label(), local, "menu sync finished");
                self.inner.metrics.record_sync(outcome.label(), elapsed);
            }
            Err(e) => {
                self.fail(generation, Activity::Syncing, e);
                self.inner.metrics.record_sync("error", elapsed);
            }
        }
        result
    }

    async fn sync_steps(
        &self,
        generation: u64,
        local: u64,
        conflicted: bool,
    ) -> NavResult<SyncOutcome> {
        let server = self.inner.source.server_version().await?;

        // Unresolved conflicts always go back to the sync endpoint.
        if server.version <= local && !conflicted {
            if server.version < local {
                warn!(
                    local,
                    server = server.version,
                    "server menu version is behind local, keeping local"
                );
            }
            let applied = self.commit(
                generation,
                Commit {
                    resolve_conflicts: true,
                    ..Commit::default()
                },
            )?;
            return Ok(if applied {
                SyncOutcome::UpToDate { version: local }
            } else {
                SyncOutcome::Superseded
            });
        }

        let response = self.inner.source.sync_menu_config(local).await?;

        if response.has_conflicts {
            warn!(
                local,
                server = server.version,
                conflicts = ?response.conflicts,
                "server reported menu conflicts"
            );
            let items = response.conflicts.clone();
            let applied = self.commit(
                generation,
                Commit {
                    conflicts: Some(response.conflicts),
                    ..Commit::default()
                },
            )?;
            return Ok(if applied {
                SyncOutcome::Conflicted { items }
            } else {
                SyncOutcome::Superseded
            });
        }

        if !response.success {
            info!(local, server = server.version, "no delta available, reloading in full");
            return self.reload_for_sync(generation, server.version).await;
        }

        let updates = response.menu_updates.len() + response.tool_updates.len();
        match self.apply_incremental(
            generation,
            &response.menu_updates,
            &response.tool_updates,
            Some(server.version),
            true,
        ) {
            Ok(true) => Ok(SyncOutcome::Applied {
                version: server.version,
                updates,
            }),
            Ok(false) => Ok(SyncOutcome::Superseded),
            Err(e) => {
                warn!(error = %e, "sync deltas failed to apply, falling back to full reload");
                self.inner.metrics.record_incremental(true);
                self.reload_for_sync(generation, server.version).await
            }
        }
    }

    async fn reload_for_sync(&self, generation: u64, version: u64) -> NavResult<SyncOutcome> {
        let (menus, tools) = self.fetch_full().await?;
        let applied = self.commit(
            generation,
            Commit {
                menus: Some(menus),
                tools: Some(tools),
                version: Some(version),
                resolve_conflicts: true,
                ..Commit::default()
            },
        )?;
        if !applied {
            return Ok(SyncOutcome::Superseded);
        }
        self.inner.metrics.record_full_reload();
        Ok(SyncOutcome::Reloaded { version })
    }

    async fn incremental_with_version(
        &self,
        deltas: &[UpdateDelta],
        version: Option<u64>,
    ) -> NavResult<UpdateOutcome> {
        let generation = self.begin();
        let target = deltas
            .iter()
            .map(|d| d.target_version)
            .chain(version)
            .max()
            .filter(|v| *v > 0);

        match self.apply_incremental(generation, deltas, &[], target, false) {
            Ok(true) => {
                self.inner.metrics.record_incremental(false);
                Ok(UpdateOutcome::Applied {
                    updates: deltas.len(),
                })
            }
            Ok(false) => Ok(UpdateOutcome::Superseded),
            Err(e) => {
                warn!(error = %e, deltas = deltas.len(), "incremental update failed, falling back to full reload");
                self.inner.metrics.record_incremental(true);
                self.reload_with(generation, target).await?;
                Ok(UpdateOutcome::ReloadedAfterFailure)
            }
        }
    }

    /// Stage deltas against the current snapshots and commit them.
    fn apply_incremental(
        &self,
        generation: u64,
        menu_deltas: &[UpdateDelta],
        tool_deltas: &[UpdateDelta],
        version: Option<u64>,
        resolve_conflicts: bool,
    ) -> NavResult<bool> {
        let (menus, tools, permissions) = {
            let state = self.inner.state.read();
            (
                state.menus.clone(),
                state.tools.clone(),
                state.permissions.clone(),
            )
        };

        let menus = if menu_deltas.is_empty() {
            None
        } else {
            Some(menus.apply_deltas(menu_deltas, &permissions)?)
        };
        let tools = if tool_deltas.is_empty() {
            None
        } else {
            Some(tools.apply_deltas(tool_deltas, &permissions)?)
        };

        let applied = self.commit(
            generation,
            Commit {
                menus,
                tools,
                version,
                resolve_conflicts,
                strict_cache: true,
                ..Commit::default()
            },
        )?;
        Ok(applied)
    }

    /// Fetch, resolve, and commit both snapshots.
    async fn reload_with(&self, generation: u64, version: Option<u64>) -> NavResult<bool> {
        let result = match self.fetch_full().await {
            Ok((menus, tools)) => self
                .commit(
                    generation,
                    Commit {
                        menus: Some(menus),
                        tools: Some(tools),
                        version,
                        ..Commit::default()
                    },
                )
                .map_err(NavError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(applied) => {
                if applied {
                    self.inner.metrics.record_full_reload();
                    self.refresh_cache_stats();
                }
                Ok(applied)
            }
            Err(e) => {
                self.fail(generation, Activity::Loading, &e);
                Err(e)
            }
        }
    }

    async fn fetch_full(&self) -> NavResult<(ResolvedMenuTree, ResolvedMenuTree)> {
        let (menus, tools) = tokio::join!(
            self.inner.source.menu_config(),
            self.inner.source.tools_config()
        );
        let (menus, tools) = (menus?, tools?);

        // Ids must be unique for deltas to address a single node.
        let menus = MenuCatalog::new(menus).inspect_err(|e| {
            warn!(error = %e, "rejecting malformed menu configuration");
        })?;
        let tools = MenuCatalog::new(vec![tools]).inspect_err(|e| {
            warn!(error = %e, "rejecting malformed tools configuration");
        })?;

        let permissions = self.inner.state.read().permissions.clone();
        Ok((
            resolve_menus(&permissions, menus.collections()),
            resolve_menus(&permissions, tools.collections()),
        ))
    }

    /// Apply staged changes if `generation` is still the latest operation.
    ///
    /// Returns `Ok(false)` when the result was discarded.
    fn commit(&self, generation: u64, commit: Commit) -> Result<bool, CacheError> {
        let mut events = Vec::new();

        let applied = {
            let mut state = self.inner.state.write();

            if self.inner.generation.load(Ordering::SeqCst) != generation {
                debug!(generation, "discarding result of superseded operation");
                if state.sync_state == SyncState::Syncing {
                    state.sync_state = SyncState::Idle;
                    events.push(MenuEvent::StateChanged {
                        state: SyncState::Idle,
                    });
                }
                false
            } else {
                self.write_snapshots(&state, &commit)?;
                let next_version = commit_version(&state, &commit);

                let previous = state.sync_state;
                let snapshots_changed = commit.menus.is_some() || commit.tools.is_some();

                if let Some(menus) = commit.menus {
                    state.menus = menus;
                }
                if let Some(tools) = commit.tools {
                    state.tools = tools;
                }
                if snapshots_changed {
                    state.errors.loading = None;
                }

                let version_changed = match next_version {
                    Some(v) => {
                        state.version.current = v;
                        true
                    }
                    None => false,
                };

                if let Some(items) = commit.conflicts {
                    state.version.has_conflicts = true;
                    state.version.conflict_items = items.into_iter().collect();
                } else if commit.resolve_conflicts {
                    state.version.has_conflicts = false;
                    state.version.conflict_items.clear();
                    state.errors.syncing = None;
                }

                state.sync_state = if state.version.has_conflicts {
                    SyncState::Conflicted
                } else {
                    SyncState::Idle
                };

                if state.sync_state != previous {
                    events.push(MenuEvent::StateChanged {
                        state: state.sync_state,
                    });
                }
                if snapshots_changed || version_changed {
                    events.push(MenuEvent::MenusChanged {
                        version: state.version.current,
                    });
                }
                true
            }
        };

        for event in events {
            self.emit(event);
        }
        Ok(applied)
    }

    fn write_snapshots(&self, state: &CoordinatorState, commit: &Commit) -> Result<(), CacheError> {
        let cache = &self.inner.cache;
        let menus_key = menus_key(&state.role);
        let tools_key = tools_key(&state.role);

        if let Some(menus) = &commit.menus
            && let Err(e) = cache.set_json(&menus_key, menus, Duration::ZERO)
        {
            if commit.strict_cache {
                return Err(e);
            }
            warn!(key = %menus_key, error = %e, "menu snapshot not cached");
        }

        if let Some(tools) = &commit.tools
            && let Err(e) = cache.set_json(&tools_key, tools, Duration::ZERO)
        {
            if commit.strict_cache {
                // Never leave the new menus cached next to a failed batch.
                if commit.menus.is_some()
                    && cache
                        .set_json(&menus_key, &state.menus, Duration::ZERO)
                        .is_err()
                {
                    cache.invalidate_key(&menus_key);
                }
                return Err(e);
            }
            warn!(key = %tools_key, error = %e, "tools snapshot not cached");
        }

        if let Some(version) = commit_version(state, commit)
            && let Err(e) = cache.set_json(MENU_VERSION_KEY, &version, Duration::ZERO)
        {
            warn!(error = %e, version, "menu version not cached");
        }

        Ok(())
    }

    fn fail(&self, generation: u64, activity: Activity, err: &NavError) {
        let changed = {
            let mut state = self.inner.state.write();
            match activity {
                Activity::Syncing => state.errors.syncing = Some(err.to_string()),
                Activity::Loading => state.errors.loading = Some(err.to_string()),
            }
            if self.inner.generation.load(Ordering::SeqCst) == generation
                && state.sync_state != SyncState::Error
            {
                state.sync_state = SyncState::Error;
                true
            } else {
                false
            }
        };

        error!(activity = ?activity, error = %err, "menu coordinator operation failed");
        if changed {
            self.emit(MenuEvent::StateChanged {
                state: SyncState::Error,
            });
        }
    }

    fn emit(&self, event: MenuEvent) {
        // No subscribers is fine.
        self.inner.events.send(event).ok();
    }
}

#[async_trait]
impl PushHandler for MenuCoordinator {
    async fn handle_push(&self, event: PushEvent) -> NavResult<()> {
        match event {
            PushEvent::Connected => info!("push channel connected"),
            PushEvent::Disconnected => warn!("push channel disconnected"),
            PushEvent::MenuUpdated {
                incremental,
                action,
                updates,
                version,
            } => {
                debug!(incremental, action = ?action, updates = updates.len(), version, "menu updated");
                if incremental {
                    self.incremental_with_version(&updates, Some(version)).await?;
                } else {
                    let generation = self.begin();
                    self.reload_with(generation, Some(version)).await?;
                }
            }
            PushEvent::ToolStatusChanged {
                tool_id,
                enabled,
                incremental,
            } => {
                self.update_tool_status(&tool_id, enabled, incremental).await?;
            }
            PushEvent::CacheInvalidated { pattern } => {
                self.handle_cache_invalidated(pattern.as_deref())?;
            }
            PushEvent::PermissionChanged { user_id, .. } => {
                info!(user = %user_id, "permissions changed, reloading menus");
                self.full_reload().await?;
                self.refresh_cache_stats();
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MenuCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("MenuCoordinator")
            .field("role", &state.role)
            .field("state", &state.sync_state)
            .field("version", &state.version.current)
            .finish()
    }
}

/// The version a commit advances to, if any.
///
/// While conflicts are unresolved the local version is held until a
/// conflict-free sync commits.
fn commit_version(state: &CoordinatorState, commit: &Commit) -> Option<u64> {
    let held = state.version.has_conflicts && !commit.resolve_conflicts;
    commit
        .version
        .filter(|v| *v > state.version.current && !held)
}

/// Cache key of a role's menu snapshot.
pub fn menus_key(role: &str) -> String {
    format!("{MENU_CONFIG_PREFIX}{role}")
}

/// Cache key of a role's tools snapshot.
pub fn tools_key(role: &str) -> String {
    format!("{MENU_TOOLS_PREFIX}{role}")
}
