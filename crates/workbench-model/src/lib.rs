use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

pub mod config;

pub use config::{load_workspace_config, parse_workspace_config, ConfigError};

pub const DEFAULT_REMOTE_RSYNC_PATH: &str = "/usr/nekoware/bin/rsync";
pub const MIN_POLL_INTERVAL_SECS: f64 = 0.5;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Connected,
    Degraded,
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
    },
    Offline {
        reason: Option<String>,
    },
}

impl ConnectionState {
    pub fn offline(reason: impl Into<String>) -> Self {
        Self::Offline {
            reason: Some(reason.into()),
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => f.write_str("connected"),
            Self::Degraded => f.write_str("degraded"),
            Self::Reconnecting {
                attempt,
                max_attempts,
            } => write!(f, "reconnecting ({attempt}/{max_attempts})"),
            Self::Offline { reason: Some(reason) } => write!(f, "offline: {reason}"),
            Self::Offline { reason: None } => f.write_str("offline"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Host {
    pub id: Uuid,
    pub name: String,
    pub role: String,
    pub state: ConnectionState,
    pub last_sync: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Snapshot of one build. Callers receive copies; only the orchestrator updates
/// `status` and `duration`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildSummary {
    pub id: Uuid,
    pub label: String,
    pub status: BuildStatus,
    pub host_name: Option<String>,
    pub started_at: SystemTime,
    pub duration: Option<Duration>,
    pub triggered_by: Option<String>,
}

/// External programs used to reach the remote machines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteTools {
    pub ssh: String,
    pub rsync: String,
    pub remote_rsync_path: String,
}

impl Default for RemoteTools {
    fn default() -> Self {
        Self {
            ssh: "ssh".to_string(),
            rsync: "rsync".to_string(),
            remote_rsync_path: DEFAULT_REMOTE_RSYNC_PATH.to_string(),
        }
    }
}

/// Workspace settings shared read-only by every service.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceConfig {
    pub project_path: PathBuf,
    pub remote_host: String,
    pub remote_user: String,
    pub remote_path: String,
    pub identity_file: Option<String>,
    /// Seconds between sync passes; see [`WorkspaceConfig::poll_period`].
    pub poll_interval: f64,
    pub build_commands: Vec<String>,
    pub tools: RemoteTools,
}

impl WorkspaceConfig {
    pub fn remote_login(&self) -> String {
        self.login_for(&self.remote_host)
    }

    pub fn login_for(&self, host: &str) -> String {
        format!("{}@{}", self.remote_user, host)
    }

    pub fn remote_target(&self) -> String {
        format!("{}@{}:{}", self.remote_user, self.remote_host, self.remote_path)
    }

    /// `cd <remote path> && cmd1 && cmd2 ...`
    pub fn remote_build_command(&self) -> String {
        let mut command = format!("cd {}", self.remote_path);
        for step in &self.build_commands {
            command.push_str(" && ");
            command.push_str(step);
        }
        command
    }

    pub fn poll_period(&self) -> Duration {
        let secs = if self.poll_interval.is_finite() {
            self.poll_interval.max(MIN_POLL_INTERVAL_SECS)
        } else {
            MIN_POLL_INTERVAL_SECS
        };
        Duration::from_secs_f64(secs)
    }
}
