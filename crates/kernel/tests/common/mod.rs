#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Shared setup for integration tests.
//!
//! Everything runs against the real kernel types; only the backend
//! collaborators are scripted.

#![allow(dead_code)]

use std::sync::Arc;

use wordnav_kernel::cache::{CacheConfig, CacheLayer};
use wordnav_kernel::metrics::Metrics;
use wordnav_kernel::sync::MenuCoordinator;
use wordnav_test_utils::{ScriptedSource, student_permissions};

/// A coordinator for a student, not yet initialized.
pub fn coordinator(source: &Arc<ScriptedSource>) -> MenuCoordinator {
    coordinator_with_cache(source, CacheLayer::new(CacheConfig::default()))
}

/// A student coordinator sharing `cache`.
pub fn coordinator_with_cache(source: &Arc<ScriptedSource>, cache: CacheLayer) -> MenuCoordinator {
    MenuCoordinator::new(
        source.clone(),
        cache,
        Arc::new(Metrics::new()),
        "student",
        student_permissions(),
    )
}

/// A student coordinator after `init()`.
pub async fn ready_coordinator(source: &Arc<ScriptedSource>) -> MenuCoordinator {
    let coordinator = coordinator(source);
    coordinator.init().await.unwrap();
    coordinator
}
