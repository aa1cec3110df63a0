use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::future::join_all;
use system_utils::process::{run_with_timeout, ProcessError};
use system_utils::ssh::RemoteShell;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use workbench_model::{ConnectionState, Host, WorkspaceConfig};

const PROBE_CONNECT_TIMEOUT_SECS: u64 = 5;
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const PRIMARY_ROLE: &str = "Primary build";
const DEFAULT_ROLE: &str = "Secondary";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostSpec {
    pub id: Uuid,
    pub name: String,
    pub role: String,
}

/// Splits a comma-separated host list such as `indigo2:Debug staging,onyx2`.
pub fn split_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses `name:role` entries. A missing or blank role becomes `Secondary`;
/// entries without a name are skipped.
pub fn parse_host_entries(entries: &[String]) -> Vec<(String, String)> {
    let mut parsed = Vec::new();
    for entry in entries {
        let (name, role) = match entry.split_once(':') {
            Some((name, role)) => (name.trim(), role.trim()),
            None => (entry.trim(), ""),
        };
        if name.is_empty() {
            warn!(entry = %entry, "skipping host entry without a name");
            continue;
        }
        let role = if role.is_empty() { DEFAULT_ROLE } else { role };
        parsed.push((name.to_string(), role.to_string()));
    }
    parsed
}

/// Tracks reachability of the primary build host and any secondary hosts.
///
/// The host list is fixed at construction. Probe results are cached per host;
/// `last_sync` only moves forward on a successful probe.
pub struct HostMonitor {
    config: Arc<WorkspaceConfig>,
    specs: Vec<HostSpec>,
    cache: Mutex<HashMap<Uuid, Host>>,
}

impl HostMonitor {
    pub fn new(config: Arc<WorkspaceConfig>, additional_hosts: &[String]) -> Self {
        let mut specs = vec![HostSpec {
            id: Uuid::new_v4(),
            name: config.remote_host.clone(),
            role: PRIMARY_ROLE.to_string(),
        }];
        for (name, role) in parse_host_entries(additional_hosts) {
            specs.push(HostSpec {
                id: Uuid::new_v4(),
                name,
                role,
            });
        }
        Self {
            config,
            specs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn specs(&self) -> &[HostSpec] {
        &self.specs
    }

    /// Probes every host and returns the refreshed list in configured order.
    pub async fn load_hosts(&self) -> Vec<Host> {
        let mut cache = self.cache.lock().await;
        let outcomes = join_all(self.specs.iter().map(|spec| self.probe(spec))).await;
        self.specs
            .iter()
            .zip(outcomes)
            .map(|(spec, outcome)| record_probe(&mut cache, spec, outcome))
            .collect()
    }

    /// Re-probes one host. Returns `None` when the id is not one of ours.
    pub async fn retry_connection(&self, host: &Host) -> Option<Host> {
        let spec = self.specs.iter().find(|spec| spec.id == host.id)?;
        let mut cache = self.cache.lock().await;
        let outcome = self.probe(spec).await;
        Some(record_probe(&mut cache, spec, outcome))
    }

    /// Last known state of every host without probing.
    pub async fn hosts(&self) -> Vec<Host> {
        let cache = self.cache.lock().await;
        self.specs
            .iter()
            .map(|spec| {
                cache.get(&spec.id).cloned().unwrap_or_else(|| Host {
                    id: spec.id,
                    name: spec.name.clone(),
                    role: spec.role.clone(),
                    state: ConnectionState::Offline { reason: None },
                    last_sync: None,
                })
            })
            .collect()
    }

    pub fn probe_command(&self, spec: &HostSpec) -> Vec<String> {
        RemoteShell::new(&self.config.tools.ssh, self.config.identity_file.as_deref())
            .probe(&self.config.login_for(&spec.name), PROBE_CONNECT_TIMEOUT_SECS)
    }

    async fn probe(&self, spec: &HostSpec) -> Result<(), ProcessError> {
        let command = self.probe_command(spec);
        match run_with_timeout(&command, None, PROBE_TIMEOUT).await {
            Ok(_) => {
                info!(host = %spec.name, "host reachable");
                Ok(())
            }
            Err(err) => {
                warn!(host = %spec.name, error = %err, "host probe failed");
                Err(err)
            }
        }
    }
}

fn record_probe(
    cache: &mut HashMap<Uuid, Host>,
    spec: &HostSpec,
    outcome: Result<(), ProcessError>,
) -> Host {
    let previous = cache.get(&spec.id).and_then(|host| host.last_sync);
    let (state, last_sync) = match outcome {
        Ok(()) => (ConnectionState::Connected, Some(SystemTime::now())),
        Err(err) => (ConnectionState::offline(err.to_string()), previous),
    };
    let host = Host {
        id: spec.id,
        name: spec.name.clone(),
        role: spec.role.clone(),
        state,
        last_sync,
    };
    cache.insert(spec.id, host.clone());
    host
}
