use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use workbench_model::{RemoteTools, WorkspaceConfig};

/// Writes an executable `sh` script standing in for ssh or rsync.
pub(crate) fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write stub");
    let mut perms = std::fs::metadata(&path).expect("stub metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod stub");
    path
}

pub(crate) fn workspace(
    project: &Path,
    ssh: &Path,
    rsync: &Path,
    poll_interval: f64,
) -> Arc<WorkspaceConfig> {
    Arc::new(WorkspaceConfig {
        project_path: project.to_path_buf(),
        remote_host: "octane".to_string(),
        remote_user: "alex".to_string(),
        remote_path: "~/irix".to_string(),
        identity_file: None,
        poll_interval,
        build_commands: vec!["make".to_string()],
        tools: RemoteTools {
            ssh: ssh.to_string_lossy().into_owned(),
            rsync: rsync.to_string_lossy().into_owned(),
            remote_rsync_path: "/usr/nekoware/bin/rsync".to_string(),
        },
    })
}
