//! Config schema types.
use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub auth: AuthSettings,
    pub callback: CallbackSettings,
    pub client: ClientSettings,
    pub storage: StorageSettings,
}

/// Timing of the interactive authorization and of the cross-process lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Upper bound for the browser round trip and for waiting on another
    /// process that owns the authorization.
    pub timeout_secs: u64,
    /// Age after which a lock record is reaped even if its owner still runs.
    /// Defaults to `timeout_secs + 30`.
    pub stale_lock_secs: Option<u64>,
    /// How often a waiting process re-checks the lock record.
    pub poll_interval_ms: u64,
    /// How many times a waiting process retries acquisition before giving up.
    pub max_attempts: u32,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            stale_lock_secs: None,
            poll_interval_ms: 500,
            max_attempts: 3,
        }
    }
}

impl AuthSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(
            self.stale_lock_secs
                .unwrap_or_else(|| self.timeout_secs.saturating_add(30)),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Local listener that receives the authorization redirect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackSettings {
    pub host: String,
    /// Fixed port. `None` lets the OS pick a free one.
    pub port: Option<u16>,
    pub path: String,
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: None,
            path: "/oauth/callback".into(),
        }
    }
}

impl CallbackSettings {
    /// Redirect URI registered with the authorization server for `port`.
    pub fn redirect_uri(&self, port: u16) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("http://{}:{port}{path}", self.host)
    }
}

/// Metadata sent with dynamic client registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub name: String,
    pub uri: Option<String>,
    pub software_id: Option<String>,
    pub software_version: Option<String>,
    pub scopes: Vec<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            name: "mcp-remote".into(),
            uri: None,
            software_id: Some("mcp-remote".into()),
            software_version: None,
            scopes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Overrides the credential directory (`<config_dir>/servers`).
    pub dir: Option<PathBuf>,
}
