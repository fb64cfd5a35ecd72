//! Process manager for the worker.
//!
//! A single [`ProcessSupervisor`] owns the worker process for the whole
//! application. Starting is single-flight: while a spawn is pending, every
//! other `start_host` caller awaits the same outcome instead of launching a
//! second process.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::HostConfig;
use crate::error::SupervisorError;
use crate::events::{Component, StatusBus};

/// Lifecycle state of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostProcessState {
    Stopped,
    Starting,
    Running,
    Error,
}

impl fmt::Display for HostProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostProcessState::Stopped => "stopped",
            HostProcessState::Starting => "starting",
            HostProcessState::Running => "running",
            HostProcessState::Error => "error",
        };
        f.write_str(name)
    }
}

/// The worker printed its readiness marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub pid: Option<u32>,
}

type StartOutcome = Result<Ready, SupervisorError>;

/// What happened first after spawning.
enum Startup {
    Ready,
    Exited(io::Result<ExitStatus>),
    Cancelled,
}

struct Inner {
    state: HostProcessState,
    /// Bumped on every spawn and stop; supervision tasks from an older
    /// generation must not touch the state.
    generation: u64,
    pid: Option<u32>,
    run: Option<RunHandle>,
}

struct RunHandle {
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<StartOutcome>>,
    task: JoinHandle<()>,
}

struct Shared {
    inner: Mutex<Inner>,
    stderr: Mutex<VecDeque<String>>,
    events: StatusBus,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a transition on behalf of the supervision task of `generation`.
    fn transition(&self, generation: u64, state: HostProcessState, message: &str) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.state = state;
        if state != HostProcessState::Running {
            inner.pid = None;
        }
        self.events.emit(Component::ProcessSupervisor, state, message);
        true
    }

    fn push_stderr(&self, line: String, capacity: usize) {
        let mut lines = self.stderr.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() >= capacity.max(1) {
            lines.pop_front();
        }
        lines.push_back(line);
    }
}

/// Manager for the worker process.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    pub fn new(events: StatusBus) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: HostProcessState::Stopped,
                    generation: 0,
                    pid: None,
                    run: None,
                }),
                stderr: Mutex::new(VecDeque::new()),
                events,
            }),
        }
    }

    /// Start the worker and wait for its readiness marker.
    ///
    /// Idempotent: if the worker is already starting or running, this
    /// returns the pending or existing outcome without spawning.
    pub async fn start_host(&self, config: &HostConfig) -> Result<Ready, SupervisorError> {
        let outcome = {
            let mut inner = self.shared.lock();
            let existing = match inner.state {
                HostProcessState::Starting | HostProcessState::Running => {
                    inner.run.as_ref().map(|run| run.outcome.clone())
                }
                HostProcessState::Stopped | HostProcessState::Error => None,
            };
            match existing {
                Some(outcome) => outcome,
                None => {
                    validate(config)?;
                    self.spawn_locked(&mut inner, config)?
                }
            }
        };

        wait_for_outcome(outcome).await
    }

    fn spawn_locked(
        &self,
        inner: &mut Inner,
        config: &HostConfig,
    ) -> Result<watch::Receiver<Option<StartOutcome>>, SupervisorError> {
        inner.state = HostProcessState::Starting;
        self.shared.events.emit(
            Component::ProcessSupervisor,
            HostProcessState::Starting,
            format!("Starting worker with model {}", config.model_path.display()),
        );

        info!(
            "Starting worker {} with model {}",
            config.exec_path.display(),
            config.model_path.display()
        );

        let mut command = Command::new(&config.exec_path);
        command
            .arg(&config.model_flag)
            .arg(&config.model_path)
            .args(&config.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn worker: {}", e);
                inner.state = HostProcessState::Error;
                self.shared.events.emit(
                    Component::ProcessSupervisor,
                    HostProcessState::Error,
                    format!("Failed to spawn worker: {}", e),
                );
                return Err(SupervisorError::Spawn(e.to_string()));
            }
        };

        let pid = child.id();
        debug!("Worker process started with PID: {:?}", pid);

        self.shared
            .stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let ready_rx = spawn_output_readers(&self.shared, &mut child, config);

        inner.generation += 1;
        inner.pid = pid;

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            inner.generation,
            child,
            ready_rx,
            config.stop_grace,
            outcome_tx,
            cancel.clone(),
        ));

        let previous = inner.run.replace(RunHandle {
            cancel,
            outcome: outcome_rx.clone(),
            task,
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        Ok(outcome_rx)
    }

    /// Stop the worker. A no-op when nothing is running.
    ///
    /// Any `start_host` call still waiting for readiness resolves with
    /// [`SupervisorError::Cancelled`].
    pub async fn stop_host(&self) {
        let run = {
            let mut inner = self.shared.lock();
            let run = inner.run.take();
            if inner.state == HostProcessState::Stopped && run.is_none() {
                return;
            }

            inner.generation += 1;
            inner.pid = None;
            if inner.state != HostProcessState::Stopped {
                inner.state = HostProcessState::Stopped;
                self.shared.events.emit(
                    Component::ProcessSupervisor,
                    HostProcessState::Stopped,
                    "Worker stopped",
                );
            }
            run
        };

        if let Some(run) = run {
            info!("Stopping worker");
            run.cancel.cancel();
            if let Err(e) = run.task.await {
                warn!("Worker supervision task failed: {}", e);
            }
        }
    }

    pub fn state(&self) -> HostProcessState {
        self.shared.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == HostProcessState::Running
    }

    /// PID of the live worker, if any.
    pub fn pid(&self) -> Option<u32> {
        self.shared.lock().pid
    }

    /// Most recent stderr lines of the current (or last) worker.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.shared
            .stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(run) = self.shared.lock().run.as_ref() {
            run.cancel.cancel();
        }
    }
}

fn validate(config: &HostConfig) -> Result<(), SupervisorError> {
    let paths = [
        ("executable", &config.exec_path),
        ("model", &config.model_path),
    ];
    for (name, path) in paths {
        if path.as_os_str().is_empty() {
            return Err(SupervisorError::Configuration(format!(
                "{name} path is empty"
            )));
        }
        if !path.exists() {
            return Err(SupervisorError::Configuration(format!(
                "{name} not found at {}",
                path.display()
            )));
        }
    }
    Ok(())
}

async fn wait_for_outcome(mut outcome: watch::Receiver<Option<StartOutcome>>) -> StartOutcome {
    match outcome.wait_for(Option::is_some).await {
        Ok(value) => (*value).clone().unwrap_or(Err(SupervisorError::Cancelled)),
        Err(_) => Err(SupervisorError::Cancelled),
    }
}

/// Drain stdout (watching for the marker) and stderr (into the tail buffer).
fn spawn_output_readers(
    shared: &Arc<Shared>,
    child: &mut Child,
    config: &HostConfig,
) -> oneshot::Receiver<()> {
    let (ready_tx, ready_rx) = oneshot::channel();

    if let Some(stdout) = child.stdout.take() {
        let marker = config.ready_marker.clone();
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(target: "warden::worker", "{}", line);
                if line.contains(&marker) {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                }
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let shared = Arc::clone(shared);
        let capacity = config.stderr_capacity;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "warden::worker", "{}", line);
                shared.push_stderr(line, capacity);
            }
        });
    }

    ready_rx
}

/// Own the child for its whole life: resolve the start outcome, then watch
/// for an unexpected exit until cancelled.
async fn supervise(
    shared: Arc<Shared>,
    generation: u64,
    mut child: Child,
    mut ready_rx: oneshot::Receiver<()>,
    stop_grace: Duration,
    outcome: watch::Sender<Option<StartOutcome>>,
    cancel: CancellationToken,
) {
    let pid = child.id();

    let first = tokio::select! {
        biased;
        _ = cancel.cancelled() => Some(Startup::Cancelled),
        marker = &mut ready_rx => marker.ok().map(|()| Startup::Ready),
        status = child.wait() => Some(Startup::Exited(status)),
    };

    // Stdout closing without the marker means the worker is going away.
    let startup = match first {
        Some(startup) => startup,
        None => tokio::select! {
            biased;
            _ = cancel.cancelled() => Startup::Cancelled,
            status = child.wait() => Startup::Exited(status),
        },
    };

    match startup {
        Startup::Ready => {
            info!("Worker is ready (PID: {:?})", pid);
            shared.transition(generation, HostProcessState::Running, "Worker is ready");
            let _ = outcome.send(Some(Ok(Ready { pid })));
        }
        Startup::Cancelled => {
            terminate(&mut child, stop_grace).await;
            let _ = outcome.send(Some(Err(SupervisorError::Cancelled)));
            return;
        }
        Startup::Exited(Ok(status)) => {
            warn!("Worker exited before becoming ready: {}", status);
            shared.transition(
                generation,
                HostProcessState::Error,
                &format!("Worker exited before becoming ready: {}", status),
            );
            let _ = outcome.send(Some(Err(SupervisorError::Exited(status.code()))));
            return;
        }
        Startup::Exited(Err(e)) => {
            warn!("Error waiting on worker: {}", e);
            shared.transition(
                generation,
                HostProcessState::Error,
                &format!("Worker process error: {}", e),
            );
            let _ = outcome.send(Some(Err(SupervisorError::Spawn(e.to_string()))));
            return;
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => terminate(&mut child, stop_grace).await,
        status = child.wait() => {
            let (state, message) = match status {
                Ok(status) if status.success() => {
                    (HostProcessState::Stopped, "Worker exited".to_string())
                }
                Ok(status) => (
                    HostProcessState::Error,
                    format!("Worker exited unexpectedly: {}", status),
                ),
                Err(e) => (
                    HostProcessState::Error,
                    format!("Worker process error: {}", e),
                ),
            };
            warn!("{}", message);
            shared.transition(generation, state, &message);
        }
    }
}

/// Ask the worker to exit, then kill it once the grace period runs out.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: `pid` is our own child and has not been reaped yet.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("Worker exited with status: {}", status);
                    return;
                }
                Ok(Err(e)) => warn!("Error checking worker status: {}", e),
                Err(_) => warn!("Worker didn't exit gracefully, killing..."),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        debug!("Kill after stop request failed: {}", e);
    }
}
