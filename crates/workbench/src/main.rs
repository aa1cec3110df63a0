mod cli;
mod output;

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use futures_util::StreamExt;
use sync_services::{
    split_host_list, sync_command, sync_workspace, BuildOrchestrator, HostMonitor, SyncService,
    BUILD_SUCCEEDED_LINE,
};
use system_utils::ssh::render_command;
use tracing::{info, warn};
use workbench_model::{load_workspace_config, WorkspaceConfig};

use crate::cli::{Args, Command};
use crate::output::{build_line, finished_build, host_line, unreachable_hosts, HostView};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_to_stderr)?;

    info!(config = %args.config.display(), dry_run = args.dry_run, "workbench starting");
    let config = load_workspace_config(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    let config = Arc::new(config);

    match args.command {
        Command::Hosts { json } => {
            let extra = split_host_list(&args.extra_hosts);
            list_hosts(HostMonitor::new(config, &extra), args.dry_run, json).await
        }
        Command::Sync { watch } => {
            if args.dry_run {
                println!("{}", render_command(&sync_command(&config)));
                return Ok(());
            }
            if watch {
                watch_sync(config).await
            } else {
                sync_once(&config).await
            }
        }
        Command::Build { label } => {
            let orchestrator = BuildOrchestrator::new(config);
            if args.dry_run {
                println!("{}", render_command(&orchestrator.build_command()));
                return Ok(());
            }
            run_build(&orchestrator, &label).await
        }
        Command::All { label } => {
            let orchestrator = BuildOrchestrator::new(Arc::clone(&config));
            if args.dry_run {
                println!("{}", render_command(&sync_command(&config)));
                println!("{}", render_command(&orchestrator.build_command()));
                return Ok(());
            }
            sync_once(&config).await?;
            run_build(&orchestrator, &label).await
        }
    }
}

async fn list_hosts(monitor: HostMonitor, dry_run: bool, json: bool) -> anyhow::Result<()> {
    if dry_run {
        for spec in monitor.specs() {
            println!("{}", render_command(&monitor.probe_command(spec)));
        }
        return Ok(());
    }
    let hosts = monitor.load_hosts().await;
    if json {
        let views: Vec<HostView> = hosts.iter().map(HostView::from).collect();
        println!("{}", serde_json::to_string_pretty(&views)?);
    } else {
        for host in &hosts {
            println!("{}", host_line(host));
        }
    }
    let unreachable = unreachable_hosts(&hosts);
    if unreachable > 0 {
        warn!(unreachable, total = hosts.len(), "some hosts are unreachable");
    }
    Ok(())
}

async fn sync_once(config: &WorkspaceConfig) -> anyhow::Result<()> {
    sync_workspace(config)
        .await
        .with_context(|| format!("sync to {} failed", config.remote_target()))?;
    println!("synced {} -> {}", config.project_path.display(), config.remote_target());
    Ok(())
}

async fn watch_sync(config: Arc<WorkspaceConfig>) -> anyhow::Result<()> {
    let service = SyncService::default();
    let mut states = service.connection_states();
    // Replayed current value; the loop reports its own transitions.
    states.next().await;
    service.start_monitoring(config).await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            state = states.next() => match state {
                Some(state) => println!("{state}"),
                None => break,
            },
        }
    }
    service.stop_monitoring().await;
    while let Some(state) = states.try_recv() {
        println!("{state}");
    }
    service.shutdown().await;
    Ok(())
}

async fn run_build(orchestrator: &BuildOrchestrator, label: &str) -> anyhow::Result<()> {
    let mut log = orchestrator.queue_build(label).await;
    info!(build_id = %log.id, label = %label, "build started");
    let mut terminal = None;
    while let Some(line) = log.lines.next().await {
        println!("{line}");
        if line.starts_with("[build] ") {
            terminal = Some(line);
        }
    }
    let builds = orchestrator.load_recent_builds().await;
    if let Some(summary) = finished_build(&builds, log.id) {
        println!("{}", build_line(summary));
    }
    if terminal.as_deref() != Some(BUILD_SUCCEEDED_LINE) {
        bail!("build {} failed", log.id);
    }
    Ok(())
}

fn init_tracing(log_to_stderr: bool) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    );
    if log_to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
    Ok(())
}
