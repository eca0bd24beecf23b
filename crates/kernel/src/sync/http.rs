//! HTTP implementations of the collaborator interfaces.
//!
//! Endpoints, relative to the API base URL:
//! - `GET  menu/config`  → `[MenuCollection]`
//! - `GET  menu/tools`   → `MenuCollection`
//! - `GET  menu/version` → `{version, timestamp}`
//! - `POST menu/sync`    ← `{localVersion}` → `SyncResponse`
//! - `GET  users/{id}/permissions` → `[String]`
//! - `GET  users/{id}/role` → `{role}`

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::source::{ConfigSource, PermissionSource, ServerVersion, SyncResponse};
use crate::error::{NavError, NavResult};
use crate::menu::MenuCollection;

/// JSON-over-HTTP client for the menu API.
#[derive(Debug, Clone)]
pub struct HttpConfigSource {
    client: Client,
    base: Url,
}

impl HttpConfigSource {
    /// Create a client for `base_url`.
    pub fn new(base_url: &str) -> NavResult<Self> {
        Ok(Self {
            client: Client::new(),
            base: parse_base(base_url)?,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> NavResult<T> {
        get_json(&self.client, &self.base, path).await
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn menu_config(&self) -> NavResult<Vec<MenuCollection>> {
        self.get("menu/config").await
    }

    async fn tools_config(&self) -> NavResult<MenuCollection> {
        self.get("menu/tools").await
    }

    async fn server_version(&self) -> NavResult<ServerVersion> {
        self.get("menu/version").await
    }

    async fn sync_menu_config(&self, local_version: u64) -> NavResult<SyncResponse> {
        let url = join(&self.base, "menu/sync")?;
        debug!(url = %url, local_version, "POST");
        self.client
            .post(url)
            .json(&serde_json::json!({ "localVersion": local_version }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(NavError::network)?
            .json()
            .await
            .map_err(NavError::network)
    }
}

/// JSON-over-HTTP client for user permissions.
#[derive(Debug, Clone)]
pub struct HttpPermissionSource {
    client: Client,
    base: Url,
}

#[derive(Deserialize)]
struct RoleBody {
    role: String,
}

impl HttpPermissionSource {
    /// Create a client for `base_url`.
    pub fn new(base_url: &str) -> NavResult<Self> {
        Ok(Self {
            client: Client::new(),
            base: parse_base(base_url)?,
        })
    }
}

#[async_trait]
impl PermissionSource for HttpPermissionSource {
    async fn user_permissions(&self, user_id: &str) -> NavResult<Vec<String>> {
        get_json(&self.client, &self.base, &format!("users/{user_id}/permissions")).await
    }

    async fn user_role(&self, user_id: &str) -> NavResult<String> {
        let body: RoleBody =
            get_json(&self.client, &self.base, &format!("users/{user_id}/role")).await?;
        Ok(body.role)
    }
}

fn parse_base(base_url: &str) -> NavResult<Url> {
    // A trailing slash makes `join` append rather than replace the last segment.
    let normalized = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{base_url}/")
    };
    Url::parse(&normalized).map_err(|e| NavError::network(format!("invalid API URL: {e}")))
}

fn join(base: &Url, path: &str) -> NavResult<Url> {
    base.join(path)
        .map_err(|e| NavError::network(format!("invalid API path '{path}': {e}")))
}

async fn get_json<T: DeserializeOwned>(client: &Client, base: &Url, path: &str) -> NavResult<T> {
    let url = join(base, path)?;
    debug!(url = %url, "GET");
    client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(NavError::network)?
        .json()
        .await
        .map_err(NavError::network)
}
