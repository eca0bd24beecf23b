//! Wordnav test utilities.
//!
//! Helpers for integration testing: menu fixtures and scripted collaborator
//! sources that count calls and fail on demand.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;

use wordnav_kernel::error::{NavError, NavResult};
use wordnav_kernel::menu::{MenuCollection, MenuNode};
use wordnav_kernel::permissions::EffectivePermissions;
use wordnav_kernel::sync::{ConfigSource, PermissionSource, ServerVersion, SyncResponse};

/// Permissions of a plain student: word learning and community.
pub fn student_permissions() -> EffectivePermissions {
    EffectivePermissions::from_permissions(["view_word_learning", "access_community"])
}

/// Menu configuration served by [`ScriptedSource`] by default.
///
/// `main` holds `menu-1` (word learning), `menu-2` (community), `menu-3`
/// (user admin) and a `menu-group` container with one community child.
pub fn sample_menu_config() -> Vec<MenuCollection> {
    vec![MenuCollection::new(
        "main",
        vec![
            MenuNode::new("menu-1", "Word Slash")
                .with_path("/pages/word-slash/index")
                .with_permission("view_word_learning"),
            MenuNode::new("menu-2", "Community")
                .with_path("/pages/community/index")
                .with_permission("access_community"),
            MenuNode::new("menu-3", "Users")
                .with_path("/pages/admin/users")
                .with_permission("manage_users"),
            MenuNode::new("menu-group", "More").with_children(vec![
                MenuNode::new("menu-group-forum", "Forum")
                    .with_path("/pages/forum/index")
                    .with_permission("access_community"),
            ]),
        ],
    )]
}

/// Tools configuration served by [`ScriptedSource`] by default.
pub fn sample_tools() -> MenuCollection {
    MenuCollection::new(
        "tools",
        vec![
            MenuNode::new("tool-dictionary", "Dictionary")
                .with_path("/pages/tools/dictionary")
                .with_permission("view_word_learning"),
            MenuNode::new("tool-api-tester", "API Tester")
                .with_path("/pages/tools/api-tester")
                .with_permission("access_dev_tools"),
        ],
    )
}

/// Handshake for holding a sync request open.
///
/// `entered` is notified when the request arrives; the request then waits
/// for `release`.
#[derive(Debug, Default)]
pub struct SyncGate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Debug)]
struct Script {
    menus: Vec<MenuCollection>,
    tools: MenuCollection,
    server_version: u64,
    sync_response: SyncResponse,
    fail_menu_config: bool,
    fail_server_version: bool,
    fail_sync: bool,
    gate: Option<Arc<SyncGate>>,
}

/// In-memory [`ConfigSource`] with scripted responses.
#[derive(Debug)]
pub struct ScriptedSource {
    script: Mutex<Script>,
    menu_config_calls: AtomicUsize,
    tools_config_calls: AtomicUsize,
    server_version_calls: AtomicUsize,
    sync_calls: AtomicUsize,
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new(sample_menu_config(), sample_tools())
    }
}

impl ScriptedSource {
    /// Serve `menus` and `tools` at server version 1.
    pub fn new(menus: Vec<MenuCollection>, tools: MenuCollection) -> Self {
        Self {
            script: Mutex::new(Script {
                menus,
                tools,
                server_version: 1,
                sync_response: SyncResponse {
                    success: true,
                    ..SyncResponse::default()
                },
                fail_menu_config: false,
                fail_server_version: false,
                fail_sync: false,
                gate: None,
            }),
            menu_config_calls: AtomicUsize::new(0),
            tools_config_calls: AtomicUsize::new(0),
            server_version_calls: AtomicUsize::new(0),
            sync_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_server_version(&self, version: u64) {
        self.script.lock().server_version = version;
    }

    pub fn set_sync_response(&self, response: SyncResponse) {
        self.script.lock().sync_response = response;
    }

    pub fn set_menus(&self, menus: Vec<MenuCollection>) {
        self.script.lock().menus = menus;
    }

    pub fn set_tools(&self, tools: MenuCollection) {
        self.script.lock().tools = tools;
    }

    pub fn fail_menu_config(&self, fail: bool) {
        self.script.lock().fail_menu_config = fail;
    }

    pub fn fail_server_version(&self, fail: bool) {
        self.script.lock().fail_server_version = fail;
    }

    pub fn fail_sync(&self, fail: bool) {
        self.script.lock().fail_sync = fail;
    }

    /// Hold the next sync request until the returned gate is released.
    pub fn gate_next_sync(&self) -> Arc<SyncGate> {
        let gate = Arc::new(SyncGate::default());
        self.script.lock().gate = Some(Arc::clone(&gate));
        gate
    }

    pub fn menu_config_calls(&self) -> usize {
        self.menu_config_calls.load(Ordering::SeqCst)
    }

    pub fn tools_config_calls(&self) -> usize {
        self.tools_config_calls.load(Ordering::SeqCst)
    }

    pub fn server_version_calls(&self) -> usize {
        self.server_version_calls.load(Ordering::SeqCst)
    }

    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for ScriptedSource {
    async fn menu_config(&self) -> NavResult<Vec<MenuCollection>> {
        self.menu_config_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock();
        if script.fail_menu_config {
            return Err(NavError::network("menu config unavailable"));
        }
        Ok(script.menus.clone())
    }

    async fn tools_config(&self) -> NavResult<MenuCollection> {
        self.tools_config_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.lock().tools.clone())
    }

    async fn server_version(&self) -> NavResult<ServerVersion> {
        self.server_version_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock();
        if script.fail_server_version {
            return Err(NavError::network("version endpoint unavailable"));
        }
        Ok(ServerVersion {
            version: script.server_version,
            timestamp: Utc::now(),
        })
    }

    async fn sync_menu_config(&self, _local_version: u64) -> NavResult<SyncResponse> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.script.lock().gate.take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let script = self.script.lock();
        if script.fail_sync {
            return Err(NavError::network("sync endpoint unavailable"));
        }
        Ok(script.sync_response.clone())
    }
}

/// In-memory [`PermissionSource`] keyed by user id.
#[derive(Debug, Default)]
pub struct StaticPermissionSource {
    users: Mutex<HashMap<String, (String, Vec<String>)>>,
}

impl StaticPermissionSource {
    /// A source knowing a single user.
    pub fn with_user(user_id: &str, role: &str, permissions: &[&str]) -> Self {
        let source = Self::default();
        source.set_user(user_id, role, permissions);
        source
    }

    /// Add or replace a user.
    pub fn set_user(&self, user_id: &str, role: &str, permissions: &[&str]) {
        self.users.lock().insert(
            user_id.to_string(),
            (
                role.to_string(),
                permissions.iter().map(|p| p.to_string()).collect(),
            ),
        );
    }
}

#[async_trait]
impl PermissionSource for StaticPermissionSource {
    async fn user_permissions(&self, user_id: &str) -> NavResult<Vec<String>> {
        self.users
            .lock()
            .get(user_id)
            .map(|(_, perms)| perms.clone())
            .ok_or_else(|| NavError::network(format!("unknown user '{user_id}'")))
    }

    async fn user_role(&self, user_id: &str) -> NavResult<String> {
        self.users
            .lock()
            .get(user_id)
            .map(|(role, _)| role.clone())
            .ok_or_else(|| NavError::network(format!("unknown user '{user_id}'")))
    }
}
