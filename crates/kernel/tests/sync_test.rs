#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Version sync, incremental updates and their failure paths.

mod common;

use std::sync::Arc;
use std::time::Duration;

use wordnav_kernel::cache::{CacheConfig, CacheLayer};
use wordnav_kernel::error::{ConfigError, NavError};
use wordnav_kernel::menu::{
    DeltaAction, DeltaItem, MenuCollection, MenuNode, ResolvedMenuTree, UpdateDelta,
};
use wordnav_kernel::permissions::EffectivePermissions;
use wordnav_kernel::push::{PushEvent, PushHandler};
use wordnav_kernel::sync::{
    MenuEvent, SyncOutcome, SyncResponse, SyncState, UpdateOutcome, menus_key, tools_key,
};
use wordnav_test_utils::ScriptedSource;

use common::{coordinator, coordinator_with_cache, ready_coordinator};

fn renamed_menu_1(version: u64) -> UpdateDelta {
    UpdateDelta::update(
        MenuNode::new("menu-1", "Word Slash 2")
            .with_path("/pages/word-slash/index")
            .with_permission("view_word_learning"),
        version,
    )
}

fn delta_response(updates: Vec<UpdateDelta>) -> SyncResponse {
    SyncResponse {
        success: true,
        menu_updates: updates,
        ..SyncResponse::default()
    }
}

#[tokio::test]
async fn init_resolves_menus_and_tools() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;

    assert_eq!(
        coordinator.menus().ids(),
        vec!["menu-1", "menu-2", "menu-group", "menu-group-forum"]
    );
    assert_eq!(coordinator.tools().ids(), vec!["tool-dictionary"]);
    assert_eq!(coordinator.version_info().current, 1);
    assert_eq!(coordinator.sync_state(), SyncState::Idle);
    assert_eq!(source.menu_config_calls(), 1);
    assert_eq!(source.tools_config_calls(), 1);
}

#[tokio::test]
async fn init_prefers_cached_snapshots() {
    let source = Arc::new(ScriptedSource::default());
    let cache = CacheLayer::new(CacheConfig::default());

    let first = coordinator_with_cache(&source, cache.clone());
    first.init().await.unwrap();

    let second = coordinator_with_cache(&source, cache.clone());
    second.init().await.unwrap();

    assert_eq!(source.menu_config_calls(), 1);
    assert_eq!(second.menus(), first.menus());
    assert_eq!(second.version_info().current, 1);
}

#[tokio::test]
async fn init_failure_is_reported() {
    let source = Arc::new(ScriptedSource::default());
    source.fail_menu_config(true);
    let coordinator = coordinator(&source);

    let err = coordinator.init().await.unwrap_err();
    assert!(matches!(err, NavError::Network(_)));
    assert_eq!(coordinator.sync_state(), SyncState::Error);
    assert!(coordinator.errors().loading.is_some());
}

#[tokio::test]
async fn duplicate_backend_ids_are_rejected() {
    let source = Arc::new(ScriptedSource::default());
    source.set_menus(vec![MenuCollection::new(
        "main",
        vec![
            MenuNode::new("menu-1", "Word Slash").with_path("/pages/word-slash/index"),
            MenuNode::new("menu-1", "Word Slash Again"),
        ],
    )]);
    let coordinator = coordinator(&source);

    let err = coordinator.init().await.unwrap_err();
    assert!(matches!(
        err,
        NavError::Config(ConfigError::DuplicateMenuId { ref id }) if id == "menu-1"
    ));
    assert_eq!(coordinator.sync_state(), SyncState::Error);
    assert!(coordinator.errors().loading.is_some());
    assert!(coordinator.menus().ids().is_empty());
}

#[tokio::test]
async fn sync_applies_server_delta() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;

    source.set_server_version(2);
    source.set_sync_response(delta_response(vec![renamed_menu_1(2)]));

    let outcome = coordinator.sync_menu_version().await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Applied {
            version: 2,
            updates: 1
        }
    );
    assert_eq!(coordinator.version_info().current, 2);
    assert_eq!(
        coordinator.menus().find("menu-1").unwrap().display_name,
        "Word Slash 2"
    );
    assert_eq!(coordinator.sync_state(), SyncState::Idle);

    let cached: ResolvedMenuTree = coordinator.cache().get_json(&menus_key("student")).unwrap();
    assert_eq!(cached, coordinator.menus());
}

#[tokio::test]
async fn sync_is_idempotent() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;

    source.set_server_version(2);
    source.set_sync_response(delta_response(vec![renamed_menu_1(2)]));
    coordinator.sync_menu_version().await.unwrap();
    let after_first = coordinator.menus();

    let outcome = coordinator.sync_menu_version().await.unwrap();
    assert_eq!(outcome, SyncOutcome::UpToDate { version: 2 });
    assert_eq!(coordinator.menus(), after_first);
    assert_eq!(source.sync_calls(), 1);
}

#[tokio::test]
async fn conflicts_hold_the_version_until_a_clean_sync() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;

    source.set_server_version(3);
    source.set_sync_response(SyncResponse {
        success: true,
        has_conflicts: true,
        conflicts: vec!["menu-1".to_string()],
        ..SyncResponse::default()
    });

    let outcome = coordinator.sync_menu_version().await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Conflicted {
            items: vec!["menu-1".to_string()]
        }
    );
    let info = coordinator.version_info();
    assert_eq!(info.current, 1);
    assert!(info.has_conflicts);
    assert!(info.conflict_items.contains("menu-1"));
    assert_eq!(coordinator.sync_state(), SyncState::Conflicted);

    // Incremental updates do not clear conflicts.
    coordinator
        .incremental_update_menus(&[UpdateDelta::remove("menu-2", 0)])
        .await
        .unwrap();
    assert_eq!(coordinator.sync_state(), SyncState::Conflicted);

    source.set_sync_response(delta_response(vec![renamed_menu_1(3)]));
    coordinator.sync_menu_version().await.unwrap();
    let info = coordinator.version_info();
    assert_eq!(info.current, 3);
    assert!(!info.has_conflicts);
    assert!(info.conflict_items.is_empty());
    assert_eq!(coordinator.sync_state(), SyncState::Idle);
}

#[tokio::test]
async fn pushed_version_does_not_bypass_open_conflicts() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;

    source.set_server_version(3);
    source.set_sync_response(SyncResponse {
        success: true,
        has_conflicts: true,
        conflicts: vec!["menu-1".to_string()],
        ..SyncResponse::default()
    });
    coordinator.sync_menu_version().await.unwrap();
    assert_eq!(coordinator.sync_state(), SyncState::Conflicted);

    coordinator
        .handle_push(PushEvent::MenuUpdated {
            incremental: true,
            action: None,
            updates: vec![UpdateDelta::remove("menu-2", 3)],
            version: 3,
        })
        .await
        .unwrap();
    assert!(coordinator.menus().find("menu-2").is_none());
    let info = coordinator.version_info();
    assert_eq!(info.current, 1);
    assert!(info.has_conflicts);

    // The next sync still asks the server to reconcile.
    source.set_sync_response(delta_response(vec![renamed_menu_1(3)]));
    let outcome = coordinator.sync_menu_version().await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Applied {
            version: 3,
            updates: 1
        }
    );
    assert_eq!(source.sync_calls(), 2);
    assert_eq!(coordinator.version_info().current, 3);
    assert!(!coordinator.version_info().has_conflicts);
    assert_eq!(coordinator.sync_state(), SyncState::Idle);
}

#[tokio::test]
async fn conflicts_reach_the_endpoint_even_when_versions_match() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;

    source.set_sync_response(SyncResponse {
        success: true,
        has_conflicts: true,
        conflicts: vec!["menu-1".to_string()],
        ..SyncResponse::default()
    });
    source.set_server_version(2);
    coordinator.sync_menu_version().await.unwrap();

    // Server falls back to the local version; the conflict still needs a sync.
    source.set_server_version(1);
    source.set_sync_response(delta_response(Vec::new()));
    let outcome = coordinator.sync_menu_version().await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Applied {
            version: 1,
            updates: 0
        }
    );
    assert_eq!(source.sync_calls(), 2);
    assert_eq!(coordinator.sync_state(), SyncState::Idle);
}

#[tokio::test]
async fn unsuccessful_sync_reloads_in_full() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;

    source.set_server_version(4);
    source.set_sync_response(SyncResponse::default());

    let outcome = coordinator.sync_menu_version().await.unwrap();
    assert_eq!(outcome, SyncOutcome::Reloaded { version: 4 });
    assert_eq!(source.menu_config_calls(), 2);
    assert_eq!(source.tools_config_calls(), 2);
    assert_eq!(coordinator.version_info().current, 4);
}

#[tokio::test]
async fn sync_failure_surfaces_and_is_not_retried() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;

    source.set_server_version(2);
    source.fail_sync(true);

    let err = coordinator.sync_menu_version().await.unwrap_err();
    assert!(matches!(err, NavError::Network(_)));
    assert_eq!(coordinator.sync_state(), SyncState::Error);
    assert!(coordinator.errors().syncing.is_some());
    assert_eq!(coordinator.version_info().current, 1);
    assert_eq!(source.sync_calls(), 1);

    source.fail_sync(false);
    source.set_sync_response(delta_response(vec![renamed_menu_1(2)]));
    coordinator.sync_menu_version().await.unwrap();
    assert_eq!(coordinator.sync_state(), SyncState::Idle);
    assert!(coordinator.errors().syncing.is_none());
}

#[tokio::test]
async fn failed_batch_falls_back_to_full_reload() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;
    let before = coordinator.menus();

    let bad = UpdateDelta {
        action: DeltaAction::Add,
        item: DeltaItem::Id("menu-9".to_string()),
        collection: None,
        target_version: 0,
    };
    let outcome = coordinator
        .incremental_update_menus(&[renamed_menu_1(0), bad])
        .await
        .unwrap();

    assert_eq!(outcome, UpdateOutcome::ReloadedAfterFailure);
    assert_eq!(source.menu_config_calls(), 2);
    assert_eq!(source.tools_config_calls(), 2);
    assert_eq!(coordinator.menus(), before);

    let cached: ResolvedMenuTree = coordinator.cache().get_json(&menus_key("student")).unwrap();
    assert_eq!(cached, before);
}

#[tokio::test]
async fn cache_write_failure_never_leaves_a_partial_snapshot() {
    let source = Arc::new(ScriptedSource::default());
    let cache = CacheLayer::new(CacheConfig {
        max_entries: 3,
        ..CacheConfig::default()
    });
    let coordinator = coordinator_with_cache(&source, cache.clone());
    coordinator.init().await.unwrap();

    // Free the menu slot, then fill the cache so the menu write is refused.
    assert!(cache.invalidate_key(&menus_key("student")));
    cache.set("other", "x", Duration::ZERO).unwrap();

    let outcome = coordinator
        .incremental_update_menus(&[renamed_menu_1(0)])
        .await
        .unwrap();

    assert_eq!(outcome, UpdateOutcome::ReloadedAfterFailure);
    assert!(cache.get(&menus_key("student")).is_none());
    assert_eq!(
        coordinator.menus().find("menu-1").unwrap().display_name,
        "Word Slash"
    );
}

#[tokio::test]
async fn incremental_update_applies_whole_batch() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;

    let added = MenuNode::new("menu-4", "Flashcards")
        .with_path("/pages/flashcards/index")
        .with_permission("view_word_learning");
    let hidden = MenuNode::new("menu-5", "Billing")
        .with_path("/pages/billing/index")
        .with_permission("manage_billing");

    let outcome = coordinator
        .incremental_update_menus(&[
            UpdateDelta::add(added, 2),
            UpdateDelta::add(hidden, 2),
            UpdateDelta::remove("menu-2", 2),
        ])
        .await
        .unwrap();

    assert_eq!(outcome, UpdateOutcome::Applied { updates: 3 });
    let menus = coordinator.menus();
    assert!(menus.find("menu-4").is_some());
    assert!(menus.find("menu-5").is_none());
    assert!(menus.find("menu-2").is_none());
    assert_eq!(coordinator.version_info().current, 2);
    assert_eq!(source.menu_config_calls(), 1);
}

#[tokio::test]
async fn tool_status_changes_in_place() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;

    let outcome = coordinator
        .update_tool_status("tool-dictionary", false, true)
        .await
        .unwrap();
    assert_eq!(outcome, UpdateOutcome::Applied { updates: 1 });
    assert!(!coordinator.tools().find("tool-dictionary").unwrap().enabled);

    let cached: ResolvedMenuTree = coordinator.cache().get_json(&tools_key("student")).unwrap();
    assert!(!cached.find("tool-dictionary").unwrap().enabled);

    let outcome = coordinator
        .update_tool_status("tool-missing", false, true)
        .await
        .unwrap();
    assert_eq!(outcome, UpdateOutcome::ReloadedAfterFailure);
    assert!(coordinator.tools().find("tool-dictionary").unwrap().enabled);
}

#[tokio::test]
async fn permission_change_reloads_for_the_new_set() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;

    let teacher = EffectivePermissions::from_permissions([
        "view_word_learning",
        "access_community",
        "access_dev_tools",
    ]);
    coordinator.set_permissions("teacher", teacher).await.unwrap();

    assert_eq!(coordinator.role(), "teacher");
    assert_eq!(
        coordinator.tools().ids(),
        vec!["tool-dictionary", "tool-api-tester"]
    );
    assert!(coordinator.cache().get(&tools_key("teacher")).is_some());
    assert!(coordinator.cache().get(&tools_key("student")).is_none());
    assert_eq!(source.menu_config_calls(), 2);
}

#[tokio::test]
async fn concurrent_syncs_share_one_request() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;
    source.set_server_version(2);
    source.set_sync_response(delta_response(vec![renamed_menu_1(2)]));
    let gate = source.gate_next_sync();

    let (first, second, ()) = tokio::join!(
        coordinator.sync_menu_version(),
        coordinator.sync_menu_version(),
        async {
            gate.entered.notified().await;
            gate.release.notify_one();
        }
    );

    let expected = SyncOutcome::Applied {
        version: 2,
        updates: 1,
    };
    assert_eq!(first.unwrap(), expected);
    assert_eq!(second.unwrap(), expected);
    assert_eq!(source.sync_calls(), 1);
    // One call from init, one from the shared sync.
    assert_eq!(source.server_version_calls(), 2);
}

#[tokio::test]
async fn superseded_sync_result_is_discarded() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;
    source.set_server_version(2);
    source.set_sync_response(delta_response(vec![renamed_menu_1(2)]));
    let gate = source.gate_next_sync();

    let syncing = coordinator.clone();
    let task = tokio::spawn(async move { syncing.sync_menu_version().await });
    gate.entered.notified().await;
    assert_eq!(coordinator.sync_state(), SyncState::Syncing);

    let outcome = coordinator
        .incremental_update_menus(&[UpdateDelta::remove("menu-2", 0)])
        .await
        .unwrap();
    assert_eq!(outcome, UpdateOutcome::Applied { updates: 1 });

    gate.release.notify_one();
    let result = task.await.unwrap().unwrap();

    assert_eq!(result, SyncOutcome::Superseded);
    assert_eq!(coordinator.version_info().current, 1);
    assert_eq!(
        coordinator.menus().find("menu-1").unwrap().display_name,
        "Word Slash"
    );
    assert!(coordinator.menus().find("menu-2").is_none());
    assert_eq!(coordinator.sync_state(), SyncState::Idle);
}

#[tokio::test]
async fn waiters_see_an_abandoned_sync() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;
    source.set_server_version(2);
    let gate = source.gate_next_sync();

    let leader = coordinator.clone();
    let leader = tokio::spawn(async move { leader.sync_menu_version().await });
    gate.entered.notified().await;

    let follower = coordinator.clone();
    let follower = tokio::spawn(async move { follower.sync_menu_version().await });
    tokio::task::yield_now().await;

    leader.abort();
    let result = follower.await.unwrap();
    assert!(matches!(result, Err(NavError::SyncAbandoned)));
    assert_eq!(coordinator.sync_state(), SyncState::Idle);
    assert_eq!(coordinator.version_info().current, 1);
}

#[tokio::test]
async fn subscribers_see_state_and_menu_changes() {
    let source = Arc::new(ScriptedSource::default());
    let coordinator = ready_coordinator(&source).await;
    let mut events = coordinator.subscribe();

    source.set_server_version(2);
    source.set_sync_response(delta_response(vec![renamed_menu_1(2)]));
    coordinator.sync_menu_version().await.unwrap();

    assert_eq!(
        events.recv().await.unwrap(),
        MenuEvent::StateChanged {
            state: SyncState::Syncing
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        MenuEvent::StateChanged {
            state: SyncState::Idle
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        MenuEvent::MenusChanged { version: 2 }
    );
}
