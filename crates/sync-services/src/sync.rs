use std::sync::Arc;
use std::time::Duration;

use system_utils::process::{run_with_timeout, ProcessError};
use system_utils::ssh::{render_command, rsync_command, RemoteShell};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use workbench_model::{ConnectionState, WorkspaceConfig};

use crate::events::{EventStream, StateHub};

const INITIAL_ATTEMPT: u32 = 1;
const INITIAL_MAX_ATTEMPTS: u32 = 3;
const STOPPED_REASON: &str = "Stopped";
const SYNC_TIMEOUT: Duration = Duration::from_secs(600);

/// Argv for one mirror pass of the local project to the remote path.
pub fn sync_command(config: &WorkspaceConfig) -> Vec<String> {
    let shell = RemoteShell::new(&config.tools.ssh, config.identity_file.as_deref());
    rsync_command(
        &config.tools.rsync,
        &config.tools.remote_rsync_path,
        &shell,
        &config.project_path,
        &config.remote_target(),
    )
}

/// Runs one sync pass from the project directory. A pass that outlives
/// `SYNC_TIMEOUT` is killed and reported as timed out.
pub async fn sync_workspace(config: &WorkspaceConfig) -> Result<(), ProcessError> {
    let command = sync_command(config);
    debug!(command = %render_command(&command), "running sync");
    run_with_timeout(&command, Some(&config.project_path), SYNC_TIMEOUT)
        .await
        .map(|_| ())
}

/// Owns the workspace connection state and the background sync loop.
///
/// State changes are published through a [`StateHub`]; the loop is the only
/// producer while it runs, and start/stop calls are serialized.
pub struct SyncService {
    states: Arc<StateHub<ConnectionState>>,
    monitor: Mutex<Option<MonitorLoop>>,
}

struct MonitorLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl MonitorLoop {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            warn!(error = %err, "sync loop ended abnormally");
        }
    }
}

impl Default for SyncService {
    fn default() -> Self {
        Self::new(ConnectionState::Connected)
    }
}

impl SyncService {
    pub fn new(initial: ConnectionState) -> Self {
        Self {
            states: Arc::new(StateHub::new(initial)),
            monitor: Mutex::new(None),
        }
    }

    /// Subscribes to state changes, starting with the current state.
    pub fn connection_states(&self) -> EventStream<ConnectionState> {
        self.states.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.states.current()
    }

    pub async fn is_monitoring(&self) -> bool {
        self.monitor.lock().await.is_some()
    }

    /// Replaces any running loop: emits `Reconnecting`, syncs once, emits the
    /// outcome, then keeps syncing every poll period until stopped.
    ///
    /// The initial sync runs on the monitor task, so a stop issued meanwhile
    /// cancels it. In that case the state current after the stop is returned.
    pub async fn start_monitoring(&self, config: Arc<WorkspaceConfig>) -> ConnectionState {
        let initial = {
            let mut monitor = self.monitor.lock().await;
            if let Some(previous) = monitor.take() {
                debug!("replacing running sync loop");
                previous.stop().await;
            }
            self.states.publish(ConnectionState::Reconnecting {
                attempt: INITIAL_ATTEMPT,
                max_attempts: INITIAL_MAX_ATTEMPTS,
            });
            let cancel = CancellationToken::new();
            let (initial_tx, initial_rx) = oneshot::channel();
            let handle = tokio::spawn(monitor_workspace(
                config,
                Arc::clone(&self.states),
                cancel.clone(),
                initial_tx,
            ));
            *monitor = Some(MonitorLoop { cancel, handle });
            initial_rx
        };
        match initial.await {
            Ok(state) => state,
            Err(_) => {
                debug!("monitoring stopped before the initial sync finished");
                // The cancelling call holds the lock until it has published its state.
                let _monitor = self.monitor.lock().await;
                self.states.current()
            }
        }
    }

    /// Stops the loop, waits for it to exit, then emits `Offline("Stopped")`.
    pub async fn stop_monitoring(&self) {
        let mut monitor = self.monitor.lock().await;
        if let Some(running) = monitor.take() {
            running.stop().await;
        }
        info!("sync monitoring stopped");
        self.states.publish(ConnectionState::offline(STOPPED_REASON));
    }

    /// Stops the loop without a final state and ends every subscriber's sequence.
    pub async fn shutdown(&self) {
        let mut monitor = self.monitor.lock().await;
        if let Some(running) = monitor.take() {
            running.stop().await;
        }
        self.states.close();
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        if let Some(running) = self.monitor.get_mut().take() {
            running.cancel.cancel();
        }
        self.states.close();
    }
}

async fn monitor_workspace(
    config: Arc<WorkspaceConfig>,
    states: Arc<StateHub<ConnectionState>>,
    cancel: CancellationToken,
    initial: oneshot::Sender<ConnectionState>,
) {
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        outcome = sync_workspace(&config) => outcome,
    };
    let state = state_after_sync(outcome);
    info!(remote = %config.remote_target(), state = %state, "initial sync finished");
    states.publish(state.clone());
    let _ = initial.send(state);
    poll_loop(config, states, cancel).await;
}

async fn poll_loop(
    config: Arc<WorkspaceConfig>,
    states: Arc<StateHub<ConnectionState>>,
    cancel: CancellationToken,
) {
    let period = config.poll_period();
    debug!(period_ms = period.as_millis(), "sync loop started");
    loop {
        if wait_or_cancelled(&cancel, period).await {
            break;
        }
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = sync_workspace(&config) => outcome,
        };
        let state = state_after_sync(outcome);
        debug!(event = "sync.tick", state = %state, "sync pass finished");
        states.publish(state);
    }
    debug!("sync loop stopped");
}

async fn wait_or_cancelled(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn state_after_sync(outcome: Result<(), ProcessError>) -> ConnectionState {
    match outcome {
        Ok(()) => ConnectionState::Connected,
        Err(err) => {
            warn!(error = %err, "sync failed");
            ConnectionState::offline(err.to_string())
        }
    }
}
