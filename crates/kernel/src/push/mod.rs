//! Push channel events and the listener that drives the coordinator.
//!
//! Inbound payloads are validated here, at the boundary, into a closed set
//! of events. Anything else is rejected with a [`PushError`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{NavResult, PushError};
use crate::menu::{DeltaAction, UpdateDelta};
use crate::metrics::Metrics;

/// Event names accepted on the push channel.
pub const EVENT_NAMES: [&str; 6] = [
    "connected",
    "disconnected",
    "menuUpdated",
    "toolStatusChanged",
    "cacheInvalidated",
    "permissionChanged",
];

/// A validated push notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum PushEvent {
    Connected,
    Disconnected,
    MenuUpdated {
        #[serde(default)]
        incremental: bool,
        #[serde(default)]
        action: Option<DeltaAction>,
        #[serde(default)]
        updates: Vec<UpdateDelta>,
        version: u64,
    },
    ToolStatusChanged {
        tool_id: String,
        enabled: bool,
        #[serde(default)]
        incremental: bool,
    },
    CacheInvalidated {
        #[serde(default)]
        pattern: Option<String>,
    },
    PermissionChanged {
        user_id: String,
        permissions: Vec<String>,
    },
}

impl PushEvent {
    /// Validate a named event and its JSON payload.
    pub fn from_wire(name: &str, data: Value) -> Result<Self, PushError> {
        match name {
            "connected" => return Ok(Self::Connected),
            "disconnected" => return Ok(Self::Disconnected),
            _ if !EVENT_NAMES.contains(&name) => {
                return Err(PushError::UnknownEvent {
                    name: name.to_string(),
                });
            }
            _ => {}
        }

        let data = if data.is_null() {
            Value::Object(Default::default())
        } else {
            data
        };
        serde_json::from_value(serde_json::json!({ "event": name, "data": data })).map_err(|e| {
            PushError::InvalidPayload {
                name: name.to_string(),
                details: e.to_string(),
            }
        })
    }

    /// Validate a whole frame of the form `{"event": ..., "data": ...}`.
    pub fn from_frame(frame: &str) -> Result<Self, PushError> {
        let mut value: Value =
            serde_json::from_str(frame).map_err(|e| PushError::InvalidPayload {
                name: "<frame>".to_string(),
                details: e.to_string(),
            })?;
        let name = value
            .get("event")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PushError::InvalidPayload {
                name: "<frame>".to_string(),
                details: "missing event name".to_string(),
            })?;
        let data = value.get_mut("data").map(Value::take).unwrap_or(Value::Null);
        Self::from_wire(&name, data)
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::MenuUpdated { .. } => "menuUpdated",
            Self::ToolStatusChanged { .. } => "toolStatusChanged",
            Self::CacheInvalidated { .. } => "cacheInvalidated",
            Self::PermissionChanged { .. } => "permissionChanged",
        }
    }
}

/// Reacts to validated push events.
#[async_trait]
pub trait PushHandler: Send + Sync {
    async fn handle_push(&self, event: PushEvent) -> NavResult<()>;
}

/// Background task feeding push events to a handler, one at a time.
///
/// Handler errors are logged and the listener keeps going.
#[derive(Debug)]
pub struct PushListener {
    connected: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl PushListener {
    /// Spawn a listener on the current runtime.
    pub fn spawn(
        handler: Arc<dyn PushHandler>,
        mut events: mpsc::Receiver<PushEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&connected);

        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let name = event.name();
                metrics.record_push(name);
                match event {
                    PushEvent::Connected => flag.store(true, Ordering::SeqCst),
                    PushEvent::Disconnected => flag.store(false, Ordering::SeqCst),
                    _ => {}
                }

                debug!(event = name, "handling push event");
                if let Err(e) = handler.handle_push(event).await {
                    warn!(event = name, error = %e, "push event handler failed");
                }
            }
            flag.store(false, Ordering::SeqCst);
            info!("push channel closed");
        });

        Self { connected, handle }
    }

    /// Whether the channel last reported `connected`.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the channel closed or the listener was stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the channel to close after all queued events are handled.
    pub async fn closed(self) {
        if let Err(e) = self.handle.await
            && !e.is_cancelled()
        {
            warn!(error = %e, "push listener task failed");
        }
    }

    /// Stop listening immediately, dropping queued events.
    pub fn stop(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.handle.abort();
    }
}
