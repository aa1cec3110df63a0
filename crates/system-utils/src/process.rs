use std::io;
#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CANCEL_GRACE: Duration = Duration::from_secs(2);
// Output still buffered when the process exits is read for at most this long.
// Descendants that keep the pipe open do not hold the sequence past it.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to launch process: {0}")]
    LaunchFailed(String),
    #[error("process exited with code {code}")]
    NonZeroExit { code: i32 },
    #[error("process timed out after {secs}s")]
    TimedOut { secs: u64 },
    #[error("process cancelled")]
    Cancelled,
    #[error("process i/o failed: {0}")]
    Io(#[from] io::Error),
}

type LineItem = Result<String, ProcessError>;

/// Runs `command` to completion. Stdout is discarded; stderr is kept for the
/// debug log when the process fails.
pub async fn run(
    command: &[String],
    working_dir: Option<&Path>,
) -> Result<ExitStatus, ProcessError> {
    wait_for_exit(command, working_dir, None).await
}

/// Like [`run`], but kills the process once `limit` elapses.
pub async fn run_with_timeout(
    command: &[String],
    working_dir: Option<&Path>,
    limit: Duration,
) -> Result<ExitStatus, ProcessError> {
    wait_for_exit(command, working_dir, Some(limit)).await
}

async fn wait_for_exit(
    command: &[String],
    working_dir: Option<&Path>,
    limit: Option<Duration>,
) -> Result<ExitStatus, ProcessError> {
    let mut cmd = build_command(command, working_dir)?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().map_err(|err| launch_failed(command, err))?;
    let stderr_task = child.stderr.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buffer = Vec::new();
            let _ = pipe.read_to_end(&mut buffer).await;
            buffer
        })
    });

    let waited = match limit {
        Some(limit) => match timeout(limit, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                return Err(ProcessError::TimedOut {
                    secs: limit.as_secs(),
                });
            }
        },
        None => child.wait().await,
    };
    let status = waited?;
    let stderr = match stderr_task {
        Some(mut task) => match timeout(OUTPUT_DRAIN, &mut task).await {
            Ok(buffer) => buffer.unwrap_or_default(),
            Err(_) => {
                task.abort();
                Vec::new()
            }
        },
        None => Vec::new(),
    };
    check_status(command, status, &stderr)
}

/// Spawns `command` and yields its combined stdout/stderr line by line while it runs.
///
/// The sequence ends exactly once: cleanly when the process exits with status 0,
/// otherwise with a single `Err` item. Launch failures are reported through the
/// same `Err` item rather than returned from this call. Must be called from
/// within a Tokio runtime.
pub fn stream_lines(command: &[String], working_dir: Option<&Path>) -> LineStream {
    stream_lines_until(command, working_dir, CancellationToken::new())
}

/// Like [`stream_lines`], but stops the process when `cancel` fires. Cancellation
/// closes the pipes, terminates the process group and waits for exit before the
/// sequence finishes with [`ProcessError::Cancelled`].
pub fn stream_lines_until(
    command: &[String],
    working_dir: Option<&Path>,
    cancel: CancellationToken,
) -> LineStream {
    let (tx, rx) = mpsc::unbounded_channel();
    let command = command.to_vec();
    let working_dir = working_dir.map(Path::to_path_buf);
    tokio::spawn(async move {
        if let Err(err) = pump_lines(command, working_dir, &tx, cancel).await {
            let _ = tx.send(Err(err));
        }
    });
    LineStream {
        rx,
        finished: false,
    }
}

async fn pump_lines(
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    tx: &mpsc::UnboundedSender<LineItem>,
    cancel: CancellationToken,
) -> Result<(), ProcessError> {
    let mut cmd = build_command(&command, working_dir.as_deref())?;
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    apply_process_group(&mut cmd);
    #[cfg(unix)]
    let output = combined_output(&mut cmd).map_err(|err| launch_failed(&command, err))?;
    #[cfg(not(unix))]
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|err| launch_failed(&command, err))?;
    // Release our copies of the write end so the reader sees EOF when the child exits.
    drop(cmd);
    debug!(program = %command[0], pid = ?child.id(), "process spawned");

    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    #[cfg(unix)]
    readers.push(tokio::spawn(forward_lines(output, tx.clone())));
    #[cfg(not(unix))]
    {
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, tx.clone())));
        }
    }

    let waited = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            stop_readers(readers).await;
            let status = terminate_child(&mut child).await;
            debug!(program = %command[0], status = ?status, "process cancelled");
            return Err(ProcessError::Cancelled);
        }
    };
    match waited {
        Ok(status) => {
            drain_readers(readers).await;
            check_status(&command, status, &[]).map(|_| ())
        }
        Err(err) => {
            stop_readers(readers).await;
            Err(err.into())
        }
    }
}

/// Points stdout and stderr of `cmd` at the write end of one pipe, so lines
/// come out in the order the process wrote them.
#[cfg(unix)]
fn combined_output(cmd: &mut Command) -> io::Result<tokio::net::unix::pipe::Receiver> {
    let (read_end, write_end) = anonymous_pipe()?;
    cmd.stdout(Stdio::from(write_end.try_clone()?));
    cmd.stderr(Stdio::from(write_end));
    tokio::net::unix::pipe::Receiver::from_owned_fd(read_end)
}

#[cfg(unix)]
fn anonymous_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    let (read_end, write_end) =
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [&read_end, &write_end] {
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok((read_end, write_end))
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<LineItem>) {
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(Ok(decode_line(&buffer))).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "pipe read failed");
                break;
            }
        }
    }
}

async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN;
    for mut reader in readers {
        if timeout_at(deadline, &mut reader).await.is_err() {
            debug!("output pipe still open after exit");
            reader.abort();
            let _ = reader.await;
        }
    }
}

async fn stop_readers(readers: Vec<JoinHandle<()>>) {
    for reader in &readers {
        reader.abort();
    }
    for reader in readers {
        let _ = reader.await;
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn build_command(command: &[String], working_dir: Option<&Path>) -> Result<Command, ProcessError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| ProcessError::LaunchFailed("empty command".to_string()))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    Ok(cmd)
}

fn launch_failed(command: &[String], err: io::Error) -> ProcessError {
    ProcessError::LaunchFailed(format!("{}: {err}", command[0]))
}

fn check_status(
    command: &[String],
    status: ExitStatus,
    stderr: &[u8],
) -> Result<ExitStatus, ProcessError> {
    if status.success() {
        return Ok(status);
    }
    let code = status.code().unwrap_or(-1);
    let detail = String::from_utf8_lossy(stderr);
    debug!(
        program = %command[0],
        code,
        stderr = %detail.trim(),
        "process exited with failure"
    );
    Err(ProcessError::NonZeroExit { code })
}

/// Lines produced by a running process; see [`stream_lines`].
pub struct LineStream {
    rx: mpsc::UnboundedReceiver<LineItem>,
    finished: bool,
}

impl LineStream {
    pub async fn next_line(&mut self) -> Option<LineItem> {
        self.next().await
    }
}

impl Stream for LineStream {
    type Item = LineItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<LineItem>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        let item = match this.rx.poll_recv(cx) {
            Poll::Ready(item) => item,
            Poll::Pending => return Poll::Pending,
        };
        if !matches!(item, Some(Ok(_))) {
            this.finished = true;
            this.rx.close();
        }
        Poll::Ready(item)
    }
}

#[cfg(unix)]
fn apply_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_group(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: i32) {}

async fn terminate_child(child: &mut Child) -> Option<ExitStatus> {
    signal_group(child, libc::SIGINT);
    if let Ok(status) = timeout(CANCEL_GRACE, child.wait()).await {
        return status.ok();
    }
    signal_group(child, libc::SIGKILL);
    let _ = child.kill().await;
    match timeout(CANCEL_GRACE, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => None,
    }
}
