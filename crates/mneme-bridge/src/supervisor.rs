//! Process supervisor - owns the worker subprocess lifecycle.
//!
//! Flow:
//! 1. Spawn worker with piped stdin/stdout/stderr
//! 2. Start the stdin writer, stdout reader, stderr reader and exit observer tasks
//! 3. Wait for the ready signal (bounded by the startup grace period)
//! 4. On unexpected exit: mark Crashed, fail all pending requests
//! 5. On stop: shutdown request, close stdin, escalate to SIGTERM / kill

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::actions::Action;
use crate::bridge::codec;
use crate::bridge::protocol::Request;
use crate::config::{BridgeConfig, WorkerCommand};
use crate::dispatcher::{Dispatcher, LineSink};
use crate::error::BridgeError;
use crate::health::{BridgeStatus, ProcessState};

const READ_CHUNK: usize = 8 * 1024;
const WRITE_QUEUE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker launch strategies.
///
/// The returned child must have piped stdin and stdout; stderr is optional.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, worker: &WorkerCommand) -> Result<Child, SpawnError>;
}

/// Launches `WorkerCommand` directly.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, worker: &WorkerCommand) -> Result<Child, SpawnError> {
        if worker.program.as_os_str().is_empty() {
            return Err(SpawnError::Other("no worker program configured".to_string()));
        }
        let mut cmd = Command::new(&worker.program);
        cmd.args(&worker.args)
            .envs(worker.environment())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = worker.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd.spawn()?)
    }
}

struct WriteCommand {
    line: Bytes,
    ack: oneshot::Sender<io::Result<()>>,
}

#[derive(Debug, Clone, Copy)]
struct ProcessInfo {
    pid: Option<u32>,
    started_at: DateTime<Utc>,
}

/// State shared with the background tasks of the current process.
struct Shared {
    dispatcher: Arc<Dispatcher>,
    state: watch::Sender<ProcessState>,
    writer: StdMutex<Option<mpsc::Sender<WriteCommand>>>,
    process: StdMutex<Option<ProcessInfo>>,
}

impl Shared {
    fn set_state(&self, state: ProcessState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Worker state changed");
        }
    }

    fn lock_writer(&self) -> MutexGuard<'_, Option<mpsc::Sender<WriteCommand>>> {
        self.writer.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Writer slot mutex poisoned");
            poisoned.into_inner()
        })
    }

    fn lock_process(&self) -> MutexGuard<'_, Option<ProcessInfo>> {
        self.process.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Process info mutex poisoned");
            poisoned.into_inner()
        })
    }

    /// Queue a line for the stdin writer and wait until it is flushed.
    async fn write(&self, line: Bytes) -> Result<(), BridgeError> {
        let tx = self
            .lock_writer()
            .clone()
            .ok_or(BridgeError::ProcessNotRunning)?;
        let (ack, written) = oneshot::channel();
        tx.send(WriteCommand { line, ack })
            .await
            .map_err(|_| BridgeError::ProcessNotRunning)?;
        match written.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Write to worker failed");
                Err(BridgeError::ProcessNotRunning)
            }
            Err(_) => Err(BridgeError::ProcessNotRunning),
        }
    }
}

/// Tasks and control handle of one spawned process.
struct ProcessHandle {
    shutdown: CancellationToken,
    observer: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    fn detach(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            task.abort();
        }
    }
}

pub struct ProcessSupervisor {
    config: BridgeConfig,
    shared: Arc<Shared>,
    /// Serializes start/stop. Never held by the data path.
    lifecycle: Mutex<Option<ProcessHandle>>,
}

impl ProcessSupervisor {
    pub fn new(config: BridgeConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let (state, _) = watch::channel(ProcessState::Stopped);
        Self {
            config,
            shared: Arc::new(Shared {
                dispatcher,
                state,
                writer: StdMutex::new(None),
                process: StdMutex::new(None),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.shared.state.subscribe()
    }

    pub fn status(&self) -> BridgeStatus {
        let info = *self.shared.lock_process();
        BridgeStatus {
            state: self.state(),
            pid: info.and_then(|i| i.pid),
            started_at: info.map(|i| i.started_at.to_rfc3339()),
            pending: self.shared.dispatcher.pending_count(),
        }
    }

    /// Spawn the worker and wait until it is ready. No-op if already starting or running.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state().is_active() {
            tracing::debug!("Worker already running, ignoring start");
            return Ok(());
        }
        if let Some(stale) = lifecycle.take() {
            stale.detach();
        }

        self.shared.set_state(ProcessState::Starting);
        self.shared.dispatcher.reset_inbound();

        let worker = &self.config.worker;
        tracing::info!(program = %worker.program.display(), args = ?worker.args, "Spawning worker");
        let mut child = match self.config.spawner.spawn(worker) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn worker");
                self.shared.set_state(ProcessState::Stopped);
                return Err(BridgeError::ProcessSpawn(e.to_string()));
            }
        };

        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            self.shared.set_state(ProcessState::Stopped);
            return Err(BridgeError::ProcessSpawn(
                "worker stdin/stdout not captured".to_string(),
            ));
        };
        let stderr = child.stderr.take();

        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        *self.shared.lock_writer() = Some(write_tx);
        *self.shared.lock_process() = Some(ProcessInfo {
            pid,
            started_at: Utc::now(),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let mut tasks = vec![
            tokio::spawn(write_stdin(stdin, write_rx)),
            tokio::spawn(read_stdout(
                stdout,
                Arc::clone(&self.shared.dispatcher),
                ready_tx,
            )),
        ];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(read_stderr(stderr)));
        }

        let shutdown = CancellationToken::new();
        let observer = tokio::spawn(observe_exit(
            child,
            Arc::clone(&self.shared),
            shutdown.clone(),
            self.config.shutdown_grace,
        ));
        let handle = ProcessHandle {
            shutdown,
            observer,
            tasks,
        };

        match tokio::time::timeout(self.config.startup_grace, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                tracing::error!(?pid, "Worker closed stdout before signalling ready");
                handle.shutdown.cancel();
                let _ = handle.observer.await;
                for task in handle.tasks {
                    task.abort();
                }
                self.shared.lock_process().take();
                self.shared.set_state(ProcessState::Crashed);
                return Err(BridgeError::ProcessSpawn(
                    "worker exited during startup before signalling ready".to_string(),
                ));
            }
            Err(_) => {
                tracing::warn!(
                    ?pid,
                    grace = ?self.config.startup_grace,
                    "No ready signal within startup grace period, assuming worker is up"
                );
            }
        }
        *lifecycle = Some(handle);

        let promoted = self.shared.state.send_if_modified(|state| {
            if *state == ProcessState::Starting {
                *state = ProcessState::Running;
                true
            } else {
                false
            }
        });
        if promoted {
            tracing::info!(?pid, "Worker running");
            Ok(())
        } else {
            Err(BridgeError::ProcessSpawn(
                "worker exited during startup".to_string(),
            ))
        }
    }

    /// Terminate the worker and fail anything still pending. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(handle) = lifecycle.take() else {
            self.shared.set_state(ProcessState::Stopped);
            return;
        };

        let was = self.state();
        self.shared.set_state(ProcessState::Stopping);
        tracing::info!(state = %was, "Stopping worker");

        if was.is_active() {
            // The reply, if any, is discarded as an unknown id.
            match Request::new(Action::Shutdown.as_str(), Value::Null)
                .and_then(|request| codec::encode(&request))
            {
                Ok(line) => {
                    let sent =
                        tokio::time::timeout(self.config.shutdown_grace, self.shared.write(line))
                            .await;
                    if !matches!(sent, Ok(Ok(()))) {
                        tracing::debug!("Could not deliver shutdown request");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to encode shutdown request"),
            }
        }

        // Dropping the sender ends the writer task, which closes the worker's stdin.
        self.shared.lock_writer().take();
        handle.shutdown.cancel();
        if let Err(e) = handle.observer.await {
            tracing::warn!(error = %e, "Exit observer task failed");
        }
        for task in handle.tasks {
            task.abort();
        }

        self.shared.lock_process().take();
        let failed = self
            .shared
            .dispatcher
            .fail_all(BridgeError::ProcessNotRunning);
        if failed > 0 {
            tracing::info!(failed, "Failed pending requests on stop");
        }
        self.shared.set_state(ProcessState::Stopped);
        tracing::info!("Worker stopped");
    }
}

#[async_trait]
impl LineSink for ProcessSupervisor {
    async fn write_line(&self, line: Bytes) -> Result<(), BridgeError> {
        if !self.state().is_running() {
            return Err(BridgeError::ProcessNotRunning);
        }
        self.shared.write(line).await
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.shared.lock_writer().take();
        if let Ok(mut lifecycle) = self.lifecycle.try_lock()
            && let Some(handle) = lifecycle.take()
        {
            tracing::debug!("Supervisor dropped with live worker, terminating");
            handle.shutdown.cancel();
        }
    }
}

async fn write_stdin(mut stdin: ChildStdin, mut rx: mpsc::Receiver<WriteCommand>) {
    while let Some(WriteCommand { line, ack }) = rx.recv().await {
        // The caller timed out or went away while this line was queued.
        if ack.is_closed() {
            tracing::debug!(line_bytes = line.len(), "Skipping line nobody waits for");
            continue;
        }
        let result = match stdin.write_all(&line).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        let failed = result.is_err();
        if let Err(ref e) = result {
            tracing::warn!(error = %e, "Failed to write to worker stdin");
        }
        let _ = ack.send(result);
        if failed {
            break;
        }
    }
    tracing::debug!("Worker stdin writer exiting");
}

async fn read_stdout(
    mut stdout: ChildStdout,
    dispatcher: Arc<Dispatcher>,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("Worker stdout closed");
                break;
            }
            Ok(n) => {
                if dispatcher.on_bytes(&buf[..n])
                    && let Some(tx) = ready.take()
                {
                    let _ = tx.send(());
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Error reading worker stdout");
                break;
            }
        }
    }
}

/// Diagnostics only: every line is re-emitted as a tracing event.
async fn read_stderr(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let trimmed = text.trim_end();
                if !trimmed.is_empty() {
                    tracing::info!(target: "mneme::worker", "{}", trimmed);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Error reading worker stderr");
                break;
            }
        }
    }
}

async fn observe_exit(
    mut child: Child,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    grace: Duration,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = shutdown.cancelled() => terminate(&mut child, grace).await,
    };

    let expected = shutdown.is_cancelled() || *shared.state.borrow() == ProcessState::Stopping;
    match status {
        Ok(status) if expected => tracing::info!(?pid, %status, "Worker exited"),
        Ok(status) => tracing::warn!(?pid, %status, "Worker exited unexpectedly"),
        Err(e) => tracing::error!(?pid, error = %e, "Failed to wait for worker"),
    }

    shared.lock_writer().take();
    if !expected {
        shared.state.send_if_modified(|state| {
            if state.is_active() {
                *state = ProcessState::Crashed;
                true
            } else {
                false
            }
        });
    }
    let failed = shared.dispatcher.fail_all(BridgeError::ProcessNotRunning);
    if failed > 0 {
        tracing::warn!(failed, "Failed pending requests after worker exit");
    }
}

/// Wait for a voluntary exit, then SIGTERM (unix), then kill.
async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            tracing::debug!(pid, "Worker still running after grace period, sending SIGTERM");
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                        return status;
                    }
                }
                Err(e) => tracing::warn!(pid, error = %e, "Failed to send SIGTERM"),
            }
        }
    }

    tracing::warn!(pid = ?child.id(), "Killing worker");
    child.kill().await?;
    child.wait().await
}
