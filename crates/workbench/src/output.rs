use std::time::SystemTime;

use serde::Serialize;
use uuid::Uuid;
use workbench_model::{BuildStatus, BuildSummary, ConnectionState, Host};

#[derive(Debug, Serialize)]
pub(crate) struct HostView {
    id: Uuid,
    name: String,
    role: String,
    #[serde(flatten)]
    state: ConnectionState,
    last_sync: Option<String>,
}

impl From<&Host> for HostView {
    fn from(host: &Host) -> Self {
        Self {
            id: host.id,
            name: host.name.clone(),
            role: host.role.clone(),
            state: host.state.clone(),
            last_sync: host.last_sync.map(timestamp),
        }
    }
}

pub(crate) fn timestamp(at: SystemTime) -> String {
    humantime::format_rfc3339_seconds(at).to_string()
}

pub(crate) fn host_line(host: &Host) -> String {
    let last_sync = host
        .last_sync
        .map(timestamp)
        .unwrap_or_else(|| "never".to_string());
    format!(
        "{:<12} {:<16} {:<24} last sync {}",
        host.name, host.role, host.state, last_sync
    )
}

pub(crate) fn build_line(build: &BuildSummary) -> String {
    let duration = build
        .duration
        .map(|duration| humantime::format_duration(duration).to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} {:<10} {:<9} started {} took {}",
        build.id,
        build.label,
        status_label(build.status),
        timestamp(build.started_at),
        duration
    )
}

/// Summary of build `id` once it has left the running set.
pub(crate) fn finished_build(builds: &[BuildSummary], id: Uuid) -> Option<&BuildSummary> {
    builds
        .iter()
        .find(|build| build.id == id && build.status.is_finished())
}

pub(crate) fn unreachable_hosts(hosts: &[Host]) -> usize {
    hosts.iter().filter(|host| !host.state.is_usable()).count()
}

fn status_label(status: BuildStatus) -> &'static str {
    match status {
        BuildStatus::Queued => "queued",
        BuildStatus::Running => "running",
        BuildStatus::Succeeded => "succeeded",
        BuildStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn epoch_plus(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn timestamps_are_rfc3339() {
        assert_eq!(timestamp(epoch_plus(86_400)), "1970-01-02T00:00:00Z");
    }

    #[test]
    fn host_line_shows_state_and_last_sync() {
        let host = Host {
            id: Uuid::nil(),
            name: "octane".to_string(),
            role: "Primary build".to_string(),
            state: ConnectionState::offline("process exited with code 255"),
            last_sync: None,
        };
        let line = host_line(&host);
        assert!(line.starts_with("octane"));
        assert!(line.contains("offline: process exited with code 255"));
        assert!(line.ends_with("last sync never"));
    }

    #[test]
    fn host_json_flattens_state() {
        let host = Host {
            id: Uuid::nil(),
            name: "indigo2".to_string(),
            role: "Debug staging".to_string(),
            state: ConnectionState::Connected,
            last_sync: Some(epoch_plus(0)),
        };
        let value = serde_json::to_value(HostView::from(&host)).unwrap();
        assert_eq!(value["state"], "connected");
        assert_eq!(value["last_sync"], "1970-01-01T00:00:00Z");
        assert_eq!(value["role"], "Debug staging");
    }

    fn summary(status: BuildStatus) -> BuildSummary {
        BuildSummary {
            id: Uuid::new_v4(),
            label: "nightly".to_string(),
            status,
            host_name: Some("octane".to_string()),
            started_at: epoch_plus(60),
            duration: None,
            triggered_by: None,
        }
    }

    #[test]
    fn finished_build_skips_running_entries() {
        let running = summary(BuildStatus::Running);
        let done = summary(BuildStatus::Succeeded);
        let builds = vec![running.clone(), done.clone()];
        assert_eq!(finished_build(&builds, done.id), Some(&done));
        assert_eq!(finished_build(&builds, running.id), None);
        assert_eq!(finished_build(&builds, Uuid::new_v4()), None);
    }

    #[test]
    fn counts_hosts_that_are_not_usable() {
        let host = |state| Host {
            id: Uuid::new_v4(),
            name: "octane".to_string(),
            role: "Primary build".to_string(),
            state,
            last_sync: None,
        };
        let hosts = vec![
            host(ConnectionState::Connected),
            host(ConnectionState::Degraded),
            host(ConnectionState::offline("process exited with code 255")),
        ];
        assert_eq!(unreachable_hosts(&hosts), 1);
    }

    #[test]
    fn build_line_reports_status_and_duration() {
        let build = BuildSummary {
            id: Uuid::nil(),
            label: "nightly".to_string(),
            status: BuildStatus::Failed,
            host_name: Some("octane".to_string()),
            started_at: epoch_plus(60),
            duration: Some(Duration::from_secs(2)),
            triggered_by: Some("alex".to_string()),
        };
        let line = build_line(&build);
        assert!(line.contains("nightly"));
        assert!(line.contains("failed"));
        assert!(line.contains("started 1970-01-01T00:01:00Z"));
        assert!(line.ends_with("took 2s"));
    }
}
