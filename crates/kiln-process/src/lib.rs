use std::{collections::BTreeMap, fmt, path::PathBuf};

use chrono::{DateTime, Utc};

/// Opaque identity of a logical server. The control plane owns the value; the agent only
/// uses it as a registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ServerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl ServerStatus {
    /// A process is (or may still be) attached in these states.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// One sanitized console line.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn now(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstallConfig {
    pub name: String,
    pub port: u16,
    pub max_players: u32,
    /// `None` and `"latest"` both resolve to the newest published version.
    #[serde(default)]
    pub version: Option<String>,
    pub install_path: PathBuf,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default)]
    pub accept_eula: bool,
}

fn default_memory_mb() -> u32 {
    2048
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InstallResult {
    pub success: bool,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstallResult {
    pub fn installed(path: PathBuf, version: Option<String>) -> Self {
        Self {
            success: true,
            path,
            version,
            error: None,
        }
    }

    pub fn failed(path: PathBuf, error: impl Into<String>) -> Self {
        Self {
            success: false,
            path,
            version: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    FetchingTool,
    ExtractingTool,
    Preparing,
    Running,
    AwaitingAuth,
    ExtractingPayload,
    CleaningUp,
    Completed,
    Aborted,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DownloadProgress {
    pub status: DownloadStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
}

impl DownloadProgress {
    pub fn new(status: DownloadStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            auth_url: None,
        }
    }

    pub fn auth_required(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            status: DownloadStatus::AwaitingAuth,
            message: format!("authorize the download at {url}"),
            auth_url: Some(url),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Checking,
    Downloading,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UpdateProgress {
    pub status: UpdateStatus,
    pub message: String,
}

impl UpdateProgress {
    pub fn new(status: UpdateStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Canonical game configuration. Variants translate to and from their native file format;
/// keys without a canonical field travel through `extra`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GameConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_players: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Partial update; `None` leaves the native value untouched.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ConfigPatch {
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub motd: Option<String>,
    #[serde(default)]
    pub max_players: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Where updates for a server come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateChannel {
    /// Vendor releases (Mojang piston-meta).
    #[default]
    Official,
    /// Community builds (PaperMC).
    Community,
}

/// What the persistence layer knows about a server; enough to build its adapter.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    pub game_type: String,
    pub root_dir: PathBuf,
    pub port: u16,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default)]
    pub channel: UpdateChannel,
}
