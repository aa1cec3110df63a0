use serde::Deserialize;
use std::path::{Path, PathBuf};
use system_utils::path::expand_tilde;
use thiserror::Error;

use crate::{RemoteTools, WorkspaceConfig};

pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 3.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found at {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("failed to decode configuration: {0}")]
    DecodingFailed(String),
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    host: String,
    user: String,
    identity_file: Option<String>,
    local_dir: String,
    remote_dir: String,
    build_command: Vec<String>,
    poll_interval: Option<f64>,
    #[serde(default)]
    tools: RemoteTools,
}

pub fn load_workspace_config(path: &Path) -> Result<WorkspaceConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::DecodingFailed(format!("{}: {err}", path.display())))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_workspace_config(&raw, base_dir)
}

/// Parses a workspace document; a relative `local_dir` is resolved against `base_dir`.
pub fn parse_workspace_config(raw: &str, base_dir: &Path) -> Result<WorkspaceConfig, ConfigError> {
    let config: RawConfig =
        toml::from_str(raw).map_err(|err| ConfigError::DecodingFailed(err.to_string()))?;
    if config.host.trim().is_empty() {
        return Err(ConfigError::DecodingFailed("host must not be empty".to_string()));
    }
    if config.user.trim().is_empty() {
        return Err(ConfigError::DecodingFailed("user must not be empty".to_string()));
    }

    let local_dir = expand_tilde(&config.local_dir);
    let project_path = if local_dir.is_absolute() {
        local_dir
    } else {
        base_dir.join(local_dir)
    };
    let identity_file = config
        .identity_file
        .filter(|value| !value.trim().is_empty())
        .map(|value| expand_tilde(value).to_string_lossy().into_owned());

    Ok(WorkspaceConfig {
        project_path,
        remote_host: config.host,
        remote_user: config.user,
        remote_path: config.remote_dir,
        identity_file,
        poll_interval: config.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        build_commands: config.build_command,
        tools: config.tools,
    })
}
