use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use system_utils::process::{stream_lines_until, ProcessError};
use system_utils::ssh::{render_command, RemoteShell};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use workbench_model::{BuildStatus, BuildSummary, WorkspaceConfig};

use crate::events::{channel, EventSender, EventStream};

pub const BUILD_SUCCEEDED_LINE: &str = "[build] completed successfully";
const HISTORY_LIMIT: usize = 20;

/// Output of one queued build. The line sequence ends after a single
/// `[build] ...` terminal line.
#[derive(Debug)]
pub struct BuildLog {
    pub id: Uuid,
    pub lines: EventStream<String>,
}

/// Runs remote builds over ssh and tracks them while they run.
pub struct BuildOrchestrator {
    config: Arc<WorkspaceConfig>,
    registry: Arc<Mutex<BuildRegistry>>,
}

#[derive(Default)]
struct BuildRegistry {
    running: HashMap<Uuid, RunningBuild>,
    history: VecDeque<BuildSummary>,
}

struct RunningBuild {
    summary: BuildSummary,
    cancel: CancellationToken,
    started: Instant,
}

impl BuildRegistry {
    fn mark_running(&mut self, id: Uuid) {
        if let Some(build) = self.running.get_mut(&id) {
            build.summary.status = BuildStatus::Running;
        }
    }

    fn finish(&mut self, id: Uuid, succeeded: bool) {
        let Some(build) = self.running.remove(&id) else {
            warn!(build_id = %id, "finished build was not registered");
            return;
        };
        let mut summary = build.summary;
        summary.status = if succeeded {
            BuildStatus::Succeeded
        } else {
            BuildStatus::Failed
        };
        summary.duration = Some(build.started.elapsed());
        info!(
            build_id = %id,
            label = %summary.label,
            status = ?summary.status,
            duration_ms = build.started.elapsed().as_millis(),
            "build finished"
        );
        self.history.push_front(summary);
        self.history.truncate(HISTORY_LIMIT);
    }

    fn running_summaries(&self) -> Vec<BuildSummary> {
        let mut running: Vec<BuildSummary> = self
            .running
            .values()
            .map(|build| build.summary.clone())
            .collect();
        running.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        running
    }
}

impl BuildOrchestrator {
    pub fn new(config: Arc<WorkspaceConfig>) -> Self {
        Self {
            config,
            registry: Arc::new(Mutex::new(BuildRegistry::default())),
        }
    }

    /// `ssh [-i identity] user@host 'cd <remote path> && <steps>'`
    pub fn build_command(&self) -> Vec<String> {
        RemoteShell::new(&self.config.tools.ssh, self.config.identity_file.as_deref())
            .command(&self.config.remote_login(), &self.config.remote_build_command())
    }

    /// Starts a build and returns its live log without waiting for it to finish.
    pub async fn queue_build(&self, label: &str) -> BuildLog {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let summary = BuildSummary {
            id,
            label: label.to_string(),
            status: BuildStatus::Queued,
            host_name: Some(self.config.remote_host.clone()),
            started_at: SystemTime::now(),
            duration: None,
            triggered_by: Some(self.config.remote_user.clone()),
        };
        self.registry.lock().await.running.insert(
            id,
            RunningBuild {
                summary,
                cancel: cancel.clone(),
                started: Instant::now(),
            },
        );

        let (tx, lines) = channel();
        let command = self.build_command();
        info!(build_id = %id, label = %label, command = %render_command(&command), "build queued");
        let worker = tokio::spawn(run_build(
            id,
            command,
            Arc::clone(&self.config),
            tx.clone(),
            cancel,
            Arc::clone(&self.registry),
        ));
        tokio::spawn(supervise_build(id, worker, tx, Arc::clone(&self.registry)));
        BuildLog { id, lines }
    }

    /// Running builds (newest first) followed by finished builds from this session.
    pub async fn load_recent_builds(&self) -> Vec<BuildSummary> {
        let registry = self.registry.lock().await;
        let mut builds = registry.running_summaries();
        builds.extend(registry.history.iter().cloned());
        builds
    }

    pub async fn running_builds(&self) -> Vec<BuildSummary> {
        self.registry.lock().await.running_summaries()
    }

    /// Requests cancellation of a running build. Returns `false` for unknown or
    /// already finished builds.
    pub async fn cancel_build(&self, id: Uuid) -> bool {
        let registry = self.registry.lock().await;
        match registry.running.get(&id) {
            Some(build) => {
                info!(build_id = %id, "build cancellation requested");
                build.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

async fn run_build(
    id: Uuid,
    command: Vec<String>,
    config: Arc<WorkspaceConfig>,
    tx: EventSender<String>,
    cancel: CancellationToken,
    registry: Arc<Mutex<BuildRegistry>>,
) -> Result<(), ProcessError> {
    registry.lock().await.mark_running(id);
    let mut lines = stream_lines_until(&command, Some(&config.project_path), cancel);
    while let Some(item) = lines.next_line().await {
        let line = item?;
        if tx.send(line).is_err() {
            debug!(build_id = %id, "build log receiver dropped");
        }
    }
    Ok(())
}

async fn supervise_build(
    id: Uuid,
    worker: JoinHandle<Result<(), ProcessError>>,
    tx: EventSender<String>,
    registry: Arc<Mutex<BuildRegistry>>,
) {
    let outcome = match worker.await {
        Ok(result) => result.map_err(|err| err.to_string()),
        Err(err) => Err(format!("build task aborted: {err}")),
    };
    registry.lock().await.finish(id, outcome.is_ok());
    let terminal = match outcome {
        Ok(()) => BUILD_SUCCEEDED_LINE.to_string(),
        Err(reason) => format!("[build] failed: {reason}"),
    };
    let _ = tx.send(terminal);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_utils::{workspace, write_stub};
    use std::path::Path;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn drain(log: &mut BuildLog) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = timeout(Duration::from_secs(10), log.lines.recv())
            .await
            .expect("build log progresses")
        {
            lines.push(line);
        }
        lines
    }

    fn orchestrator(dir: &Path, ssh_body: &str) -> BuildOrchestrator {
        let ssh = write_stub(dir, "ssh", ssh_body);
        BuildOrchestrator::new(workspace(dir, &ssh, Path::new("rsync"), 5.0))
    }

    #[test]
    fn build_command_chains_steps_with_identity() {
        let config = WorkspaceConfig {
            identity_file: Some("/keys/octane".to_string()),
            build_commands: vec!["make".to_string(), "make test".to_string()],
            ..(*workspace(Path::new("/work"), Path::new("ssh"), Path::new("rsync"), 5.0)).clone()
        };
        let orchestrator = BuildOrchestrator::new(Arc::new(config));
        assert_eq!(
            orchestrator.build_command(),
            vec![
                "ssh",
                "-i",
                "/keys/octane",
                "alex@octane",
                "cd ~/irix && make && make test"
            ]
        );
    }

    #[tokio::test]
    async fn successful_build_streams_lines_then_terminal_line() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(
            dir.path(),
            "echo 'cc -o bin/hello hello.c'\necho 'linked hello'\nexit 0",
        );
        let mut log = orchestrator.queue_build("nightly").await;
        let lines = drain(&mut log).await;
        assert_eq!(
            lines,
            vec![
                "cc -o bin/hello hello.c".to_string(),
                "linked hello".to_string(),
                BUILD_SUCCEEDED_LINE.to_string(),
            ]
        );
        assert!(log.lines.recv().await.is_none());
    }

    #[tokio::test]
    async fn failed_build_ends_with_failure_line() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), "echo 'hello.c:3: error'\nexit 2");
        let mut log = orchestrator.queue_build("nightly").await;
        let lines = drain(&mut log).await;
        assert_eq!(
            lines,
            vec![
                "hello.c:3: error".to_string(),
                "[build] failed: process exited with code 2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn remote_command_is_passed_to_ssh() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), "for arg in \"$@\"; do echo \"$arg\"; done");
        let mut log = orchestrator.queue_build("args").await;
        let lines = drain(&mut log).await;
        assert_eq!(
            lines,
            vec![
                "alex@octane".to_string(),
                "cd ~/irix && make".to_string(),
                BUILD_SUCCEEDED_LINE.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn finished_build_leaves_registry_and_enters_history() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), "exit 0");
        let mut log = orchestrator.queue_build("nightly").await;
        drain(&mut log).await;

        assert!(orchestrator.running_builds().await.is_empty());
        let builds = orchestrator.load_recent_builds().await;
        assert_eq!(builds.len(), 1);
        let build = &builds[0];
        assert_eq!(build.id, log.id);
        assert_eq!(build.label, "nightly");
        assert_eq!(build.status, BuildStatus::Succeeded);
        assert_eq!(build.host_name.as_deref(), Some("octane"));
        assert_eq!(build.triggered_by.as_deref(), Some("alex"));
        assert!(build.duration.is_some());
    }

    #[tokio::test]
    async fn running_build_is_listed_until_it_completes() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), "echo started\nsleep 1");
        let mut log = orchestrator.queue_build("slow").await;
        assert_eq!(log.lines.recv().await.as_deref(), Some("started"));

        let running = orchestrator.running_builds().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].status, BuildStatus::Running);
        assert_eq!(running[0].duration, None);

        drain(&mut log).await;
        assert!(orchestrator.running_builds().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_builds_have_independent_logs() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), "echo step");
        let mut first = orchestrator.queue_build("first").await;
        let mut second = orchestrator.queue_build("second").await;
        assert_ne!(first.id, second.id);

        let (first_lines, second_lines) = tokio::join!(drain(&mut first), drain(&mut second));
        for lines in [first_lines, second_lines] {
            assert_eq!(lines, vec!["step".to_string(), BUILD_SUCCEEDED_LINE.to_string()]);
        }
        let history = orchestrator.load_recent_builds().await;
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|build| build.status == BuildStatus::Succeeded));
    }

    #[tokio::test]
    async fn missing_project_dir_fails_through_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = write_stub(dir.path(), "ssh", "exit 0");
        let config = workspace(&dir.path().join("missing"), &ssh, Path::new("rsync"), 5.0);
        let orchestrator = BuildOrchestrator::new(config);
        let mut log = orchestrator.queue_build("nightly").await;
        let lines = drain(&mut log).await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("[build] failed: failed to launch process"));
        let builds = orchestrator.load_recent_builds().await;
        assert_eq!(builds[0].status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_stops_the_remote_process() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), "echo started\nsleep 30");
        let mut log = orchestrator.queue_build("long").await;
        assert_eq!(log.lines.recv().await.as_deref(), Some("started"));

        assert!(orchestrator.cancel_build(log.id).await);
        let rest = drain(&mut log).await;
        assert_eq!(rest, vec!["[build] failed: process cancelled".to_string()]);
        assert!(orchestrator.running_builds().await.is_empty());
        assert!(!orchestrator.cancel_build(log.id).await);
    }

    #[tokio::test]
    async fn cancel_unknown_build_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), "exit 0");
        assert!(!orchestrator.cancel_build(Uuid::new_v4()).await);
    }
}
