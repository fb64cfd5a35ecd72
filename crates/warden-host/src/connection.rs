//! Connection state machine with bounded, fixed-delay retries.
//!
//! ```text
//! Disconnected --connect()--> Connecting --probe ok--> Connected
//!                             Connecting --probe failed, attempts left--> Connecting
//!                             Connecting --attempts exhausted--> Error
//! Connected --disconnect()--> Disconnected
//! any --report_failure()--> Error
//! ```
//!
//! `Error` is terminal: `connect()` keeps returning `false` until
//! `disconnect()` resets the machine.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{HostConfig, RetryConfig};
use crate::error::{SupervisorError, WardenError};
use crate::events::{Component, StatusBus};
use crate::probe::HealthProbe;
use crate::supervisor::{ProcessSupervisor, Ready};

/// The worker as seen by the connection manager.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    fn is_running(&self) -> bool;

    async fn ensure_started(&self) -> Result<Ready, SupervisorError>;
}

/// [`WorkerHost`] backed by the shared [`ProcessSupervisor`].
pub struct SupervisedWorker {
    supervisor: Arc<ProcessSupervisor>,
    config: HostConfig,
}

impl SupervisedWorker {
    pub fn new(supervisor: Arc<ProcessSupervisor>, config: HostConfig) -> Self {
        Self { supervisor, config }
    }
}

#[async_trait]
impl WorkerHost for SupervisedWorker {
    fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    async fn ensure_started(&self) -> Result<Ready, SupervisorError> {
        self.supervisor.start_host(&self.config).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Snapshot of the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Failed probes in the current cycle.
    pub attempts: u32,
    pub last_failure: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            last_failure: None,
        }
    }
}

/// Why a connection cycle did not end in `Connected`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectFailure {
    Start(SupervisorError),
    Exhausted { attempts: u32 },
    Cancelled,
    Failed(String),
}

impl From<ConnectFailure> for WardenError {
    fn from(failure: ConnectFailure) -> Self {
        match failure {
            ConnectFailure::Start(err) => err.into(),
            ConnectFailure::Exhausted { attempts } => WardenError::ConnectionTimeout { attempts },
            ConnectFailure::Cancelled => WardenError::Cancelled,
            ConnectFailure::Failed(reason) => WardenError::ServerNotReachable(reason),
        }
    }
}

type CycleOutcome = Result<(), ConnectFailure>;

struct Cycle {
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<CycleOutcome>>,
}

struct Inner {
    status: ConnectionStatus,
    /// Bumped whenever a cycle is started or abandoned.
    generation: u64,
    /// Present exactly while the state is `Connecting`.
    cycle: Option<Cycle>,
    /// Why the worker could not be started, while the state is `Error`.
    start_failure: Option<SupervisorError>,
}

struct Shared {
    inner: Mutex<Inner>,
    host: Arc<dyn WorkerHost>,
    probe: Arc<dyn HealthProbe>,
    retry: RetryConfig,
    events: StatusBus,
}

/// Keeps the worker reachable.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        host: Arc<dyn WorkerHost>,
        probe: Arc<dyn HealthProbe>,
        retry: RetryConfig,
        events: StatusBus,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    status: ConnectionStatus::default(),
                    generation: 0,
                    cycle: None,
                    start_failure: None,
                }),
                host,
                probe,
                retry,
                events,
            }),
        }
    }

    /// Establish connectivity, starting the worker if needed.
    ///
    /// Concurrent callers share one retry loop. Returns `false` once
    /// `max_attempts` probes have failed, and immediately while in `Error`.
    pub async fn connect(&self) -> bool {
        self.establish().await.is_ok()
    }

    /// Like [`connect`](Self::connect), but reports why it failed.
    pub async fn ensure_connected(&self) -> Result<(), WardenError> {
        self.establish().await.map_err(WardenError::from)
    }

    async fn establish(&self) -> CycleOutcome {
        let mut outcome = {
            let mut inner = self.shared.lock();
            match inner.status.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Error => {
                    if let Some(err) = &inner.start_failure {
                        return Err(ConnectFailure::Start(err.clone()));
                    }
                    let attempts = inner.status.attempts;
                    return Err(if attempts >= self.shared.retry.max_attempts {
                        ConnectFailure::Exhausted { attempts }
                    } else {
                        ConnectFailure::Failed(
                            inner
                                .status
                                .last_failure
                                .clone()
                                .unwrap_or_else(|| "connection failed".to_string()),
                        )
                    });
                }
                ConnectionState::Connecting | ConnectionState::Disconnected => {}
            }

            let pending = inner.cycle.as_ref().map(|cycle| cycle.outcome.clone());
            match pending {
                Some(outcome) => outcome,
                None => self.begin_cycle(&mut inner),
            }
        };

        let result = match outcome.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone().unwrap_or(Err(ConnectFailure::Cancelled)),
            Err(_) => Err(ConnectFailure::Cancelled),
        };
        result
    }

    fn begin_cycle(&self, inner: &mut Inner) -> watch::Receiver<Option<CycleOutcome>> {
        inner.generation += 1;
        inner.start_failure = None;
        inner.status = ConnectionStatus {
            state: ConnectionState::Connecting,
            attempts: 0,
            last_failure: None,
        };
        self.shared.events.emit(
            Component::ConnectionManager,
            ConnectionState::Connecting,
            "Connecting to worker",
        );

        let (tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        inner.cycle = Some(Cycle {
            cancel: cancel.clone(),
            outcome: rx.clone(),
        });

        let shared = Arc::clone(&self.shared);
        let generation = inner.generation;
        tokio::spawn(async move {
            let outcome = shared.run_cycle(generation, &cancel).await;
            let _ = tx.send(Some(outcome));
        });

        rx
    }

    /// Abandon any in-flight cycle and return to `Disconnected`.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        inner.generation += 1;
        if let Some(cycle) = inner.cycle.take() {
            cycle.cancel.cancel();
        }
        let previous = inner.status.state;
        inner.status = ConnectionStatus::default();
        inner.start_failure = None;
        if previous != ConnectionState::Disconnected {
            info!("Disconnected from worker");
            self.shared.events.emit(
                Component::ConnectionManager,
                ConnectionState::Disconnected,
                "Disconnected from worker",
            );
        }
    }

    /// Record an I/O failure observed by a caller talking to the worker.
    pub fn report_failure(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.shared.lock();
        inner.generation += 1;
        if let Some(cycle) = inner.cycle.take() {
            cycle.cancel.cancel();
        }
        warn!("Worker connection failed: {}", reason);
        inner.start_failure = None;
        inner.status.state = ConnectionState::Error;
        inner.status.last_failure = Some(reason.clone());
        self.shared
            .events
            .emit(Component::ConnectionManager, ConnectionState::Error, reason);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.lock().status.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().status.state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(cycle) = self.shared.lock().cycle.as_ref() {
            cycle.cancel.cancel();
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_cycle(&self, generation: u64, cancel: &CancellationToken) -> CycleOutcome {
        if !self.host.is_running() {
            let started = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectFailure::Cancelled),
                started = self.host.ensure_started() => started,
            };
            if let Err(err) = started {
                let message = format!("Worker failed to start: {}", err);
                self.fail(generation, message, Some(err.clone()));
                return Err(ConnectFailure::Start(err));
            }
            // Readiness on stdout can precede the listener accepting requests.
            if !pause(self.retry.settle_delay, cancel).await {
                return Err(ConnectFailure::Cancelled);
            }
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectFailure::Cancelled),
                result = self.probe.probe() => result,
            };

            match result {
                Ok(()) => {
                    return if self.succeed(generation) {
                        Ok(())
                    } else {
                        Err(ConnectFailure::Cancelled)
                    };
                }
                Err(err) => {
                    debug!("Health probe {}/{} failed: {}", attempt, max_attempts, err);
                    last_error = err.to_string();
                    if !self.record_attempt(generation, attempt, &last_error) {
                        return Err(ConnectFailure::Cancelled);
                    }
                }
            }

            if attempt < max_attempts && !pause(self.retry.retry_delay, cancel).await {
                return Err(ConnectFailure::Cancelled);
            }
        }

        self.fail(
            generation,
            format!(
                "Worker unreachable after {} attempts: {}",
                max_attempts, last_error
            ),
            None,
        );
        Err(ConnectFailure::Exhausted {
            attempts: max_attempts,
        })
    }

    fn succeed(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.cycle = None;
        inner.start_failure = None;
        inner.status = ConnectionStatus {
            state: ConnectionState::Connected,
            attempts: 0,
            last_failure: None,
        };
        info!("Connected to worker");
        self.events.emit(
            Component::ConnectionManager,
            ConnectionState::Connected,
            "Connected to worker",
        );
        true
    }

    fn record_attempt(&self, generation: u64, attempt: u32, reason: &str) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.status.attempts = attempt;
        inner.status.last_failure = Some(reason.to_string());
        true
    }

    /// Terminal failure of the cycle; the only notification a cycle emits
    /// besides its start and success.
    fn fail(&self, generation: u64, message: String, start_failure: Option<SupervisorError>) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        warn!("{}", message);
        inner.cycle = None;
        inner.start_failure = start_failure;
        inner.status.state = ConnectionState::Error;
        inner.status.last_failure = Some(message.clone());
        self.events
            .emit(Component::ConnectionManager, ConnectionState::Error, message);
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::time::Instant;

    struct FakeHost {
        running: AtomicBool,
        starts: AtomicU32,
        fail_start: bool,
    }

    impl FakeHost {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                running: AtomicBool::new(false),
                starts: AtomicU32::new(0),
                fail_start: false,
            })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self {
                running: AtomicBool::new(false),
                starts: AtomicU32::new(0),
                fail_start: true,
            })
        }
    }

    #[async_trait]
    impl WorkerHost for FakeHost {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn ensure_started(&self) -> Result<Ready, SupervisorError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(SupervisorError::Exited(Some(1)));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(Ready { pid: Some(4242) })
        }
    }

    /// Fails until `succeed_on` probes have been made.
    struct ScriptedProbe {
        calls: AtomicU32,
        succeed_on: Option<u32>,
    }

    impl ScriptedProbe {
        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                succeed_on: None,
            })
        }

        fn succeeding_on(n: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                succeed_on: Some(n),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self) -> Result<(), WardenError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.succeed_on {
                Some(n) if call >= n => Ok(()),
                _ => Err(WardenError::ServerNotReachable("http://127.0.0.1:11435".into())),
            }
        }
    }

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            retry_delay: Duration::from_millis(2000),
            settle_delay: Duration::from_millis(1000),
        }
    }

    fn manager(
        host: Arc<FakeHost>,
        probe: Arc<ScriptedProbe>,
        max_attempts: u32,
    ) -> (ConnectionManager, StatusBus) {
        let bus = StatusBus::new();
        let manager = ConnectionManager::new(host, probe, retry(max_attempts), bus.clone());
        (manager, bus)
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_exactly_max_attempts() {
        for max_attempts in [1, 3, 5] {
            let probe = ScriptedProbe::failing();
            let (manager, _) = manager(FakeHost::new(), probe.clone(), max_attempts);

            let started = Instant::now();
            assert!(!manager.connect().await);
            assert_eq!(probe.calls(), max_attempts);

            let status = manager.status();
            assert_eq!(status.state, ConnectionState::Error);
            assert_eq!(status.attempts, max_attempts);
            assert!(status.last_failure.unwrap().contains("unreachable"));

            // settle delay + (N - 1) retry delays, no trailing wait.
            let expected = Duration::from_millis(1000 + 2000 * (max_attempts as u64 - 1));
            let elapsed = started.elapsed();
            assert!(elapsed >= expected, "{elapsed:?} < {expected:?}");
            assert!(elapsed < expected + Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_attempts() {
        let probe = ScriptedProbe::succeeding_on(3);
        let host = FakeHost::new();
        let (manager, _) = manager(host.clone(), probe.clone(), 5);

        assert!(manager.connect().await);
        assert_eq!(probe.calls(), 3);
        assert_eq!(host.starts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status(), ConnectionStatus {
            state: ConnectionState::Connected,
            attempts: 0,
            last_failure: None,
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_is_idempotent() {
        let probe = ScriptedProbe::succeeding_on(1);
        let (manager, bus) = manager(FakeHost::new(), probe.clone(), 5);
        assert!(manager.connect().await);

        let mut rx = bus.subscribe();
        assert!(manager.connect().await);
        assert_eq!(probe.calls(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_loop() {
        let probe = ScriptedProbe::failing();
        let host = FakeHost::new();
        let (manager, _) = manager(host.clone(), probe.clone(), 4);

        let (first, second) = tokio::join!(manager.connect(), async {
            // Join mid-retry, after the first probe has failed.
            tokio::time::sleep(Duration::from_millis(1500)).await;
            assert_eq!(manager.state(), ConnectionState::Connecting);
            manager.connect().await
        });

        assert!(!first);
        assert!(!second);
        assert_eq!(probe.calls(), 4);
        assert_eq!(host.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_aborts_retry_wait() {
        let probe = ScriptedProbe::failing();
        let (manager, _) = manager(FakeHost::new(), probe.clone(), 5);
        let manager = Arc::new(manager);

        let started = Instant::now();
        let pending = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.connect().await }
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        manager.disconnect();

        assert!(!pending.await.unwrap());
        assert!(started.elapsed() < Duration::from_millis(3000));
        assert_eq!(probe.calls(), 1);
        assert_eq!(manager.status(), ConnectionStatus::default());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_is_terminal_until_disconnect() {
        let probe = ScriptedProbe::failing();
        let (manager, _) = manager(FakeHost::new(), probe.clone(), 2);

        assert!(!manager.connect().await);
        assert_eq!(probe.calls(), 2);

        let err = manager.ensure_connected().await.unwrap_err();
        assert!(matches!(err, WardenError::ConnectionTimeout { attempts: 2 }));
        assert_eq!(probe.calls(), 2);

        manager.disconnect();
        assert!(!manager.connect().await);
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_notifies_once() {
        let probe = ScriptedProbe::failing();
        let (manager, bus) = manager(FakeHost::new(), probe, 5);
        let mut rx = bus.subscribe();

        assert!(!manager.connect().await);

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            states.push(event.state);
        }
        assert_eq!(states, vec!["connecting", "error"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_skips_probing() {
        let probe = ScriptedProbe::succeeding_on(1);
        let (manager, _) = manager(FakeHost::broken(), probe.clone(), 5);

        let err = manager.ensure_connected().await.unwrap_err();
        assert!(matches!(err, WardenError::ProcessExit(Some(1))));
        assert_eq!(probe.calls(), 0);
        assert_eq!(manager.state(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_reported_again_while_in_error() {
        let host = FakeHost::broken();
        let (manager, _) = manager(host.clone(), ScriptedProbe::succeeding_on(1), 5);

        let first = manager.ensure_connected().await.unwrap_err();
        let second = manager.ensure_connected().await.unwrap_err();
        assert!(matches!(first, WardenError::ProcessExit(Some(1))));
        assert!(matches!(second, WardenError::ProcessExit(Some(1))));
        assert_eq!(host.starts.load(Ordering::SeqCst), 1);

        // A reported I/O failure replaces the start failure.
        manager.report_failure("connection reset by peer");
        let err = manager.ensure_connected().await.unwrap_err();
        assert!(matches!(err, WardenError::ServerNotReachable(ref r) if r == "connection reset by peer"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_worker_skips_settle_delay() {
        let host = FakeHost::new();
        host.running.store(true, Ordering::SeqCst);
        let probe = ScriptedProbe::succeeding_on(1);
        let (manager, _) = manager(host.clone(), probe, 5);

        let started = Instant::now();
        assert!(manager.connect().await);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(host.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_failure_moves_to_error() {
        let probe = ScriptedProbe::succeeding_on(1);
        let (manager, _) = manager(FakeHost::new(), probe, 5);
        assert!(manager.connect().await);

        manager.report_failure("connection reset by peer");
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.last_failure.as_deref(), Some("connection reset by peer"));
        assert!(!manager.connect().await);
    }
}
