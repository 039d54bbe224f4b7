//! Fixed-frequency synchronization loop.
//!
//! The loop owns the session's [`RpcClient`]. Each iteration waits for the pacing
//! deadline, fetches a snapshot through the [`StateSource`], commits it when the
//! source accepts it, runs the [`StepHandler`] and then bumps an update counter
//! that [`SyncLoop::wait_for`] callers watch.
//!
//! # Lifecycle
//!
//! `Created → Running` on [`SyncLoop::start`], `Running → Stopping` on
//! [`SyncLoop::stop`], `Stopping → Stopped` once the in-flight iteration has
//! finished and the client is closed. A loop that dies on a fatal error moves to
//! `Stopped` by itself; the error is returned by the next `stop()`.

use super::state::{GameState, NoopStep, RemoteState, StateSource, StepHandler};
use crate::commands::{Command, Commands};
use crate::config::{LoopConfig, SessionConfig};
use crate::net::CommandResult;
use crate::rpc::RpcClient;
use crate::{Result, SessionError};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`SyncLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Created => write!(f, "created"),
            LoopState::Running => write!(f, "running"),
            LoopState::Stopping => write!(f, "stopping"),
            LoopState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Atomic wrapper for LoopState.
struct AtomicLoopState(AtomicU8);

impl AtomicLoopState {
    fn new(state: LoopState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> LoopState {
        match self.0.load(Ordering::SeqCst) {
            0 => LoopState::Created,
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }

    fn store(&self, state: LoopState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: LoopState, to: LoopState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

struct Shared {
    config: SessionConfig,
    source: Box<dyn StateSource>,
    step: Box<dyn StepHandler>,
    state: AtomicLoopState,
    client: OnceLock<RpcClient>,
    current: RwLock<Arc<GameState>>,
    updates: watch::Sender<u64>,
    stop: CancellationToken,
}

/// Running averages logged every [`LoopConfig::STATS_EVERY`] updates.
struct LoopStats {
    started: Instant,
    iterations: u64,
    busy: Duration,
}

impl LoopStats {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            iterations: 0,
            busy: Duration::ZERO,
        }
    }

    fn record(&mut self, elapsed: Duration) {
        self.iterations += 1;
        self.busy += elapsed;
    }

    /// Log the averages if `updates` just reached a reporting boundary.
    fn report(&self, updates: u64) -> bool {
        if updates == 0 || updates % LoopConfig::STATS_EVERY != 0 || self.iterations == 0 {
            return false;
        }
        let wall = self.started.elapsed().as_secs_f64();
        let rate = if wall > 0.0 { self.iterations as f64 / wall } else { 0.0 };
        debug!(
            "Iteration {}: avg duration {:?}, avg rate {:.2} Hz",
            self.iterations,
            self.busy / self.iterations as u32,
            rate
        );
        true
    }
}

/// Session driver: paces state fetches and lets callers wait on state.
pub struct SyncLoop {
    shared: Arc<Shared>,
    task: std::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl SyncLoop {
    pub fn new<S, H>(config: SessionConfig, source: S, step: H) -> Self
    where
        S: StateSource + 'static,
        H: StepHandler + 'static,
    {
        let (updates, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                config,
                source: Box::new(source),
                step: Box::new(step),
                state: AtomicLoopState::new(LoopState::Created),
                client: OnceLock::new(),
                current: RwLock::new(Arc::new(GameState::default())),
                updates,
                stop: CancellationToken::new(),
            }),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Loop fetching state with `GetGameState` and no per-tick work.
    pub fn remote(config: SessionConfig) -> Self {
        Self::new(config, RemoteState, NoopStep)
    }

    /// Open the RPC client and spawn the loop.
    pub fn start(&self) -> Result<()> {
        self.shared.config.validate()?;
        if !self.shared.state.transition(LoopState::Created, LoopState::Running) {
            return Err(SessionError::Other(format!(
                "synchronization loop cannot start: {}",
                self.shared.state.load()
            )));
        }

        let client = RpcClient::connect(&self.shared.config);
        if self.shared.client.set(client).is_err() {
            return Err(SessionError::Other("RPC client already open".to_string()));
        }

        info!(
            "Synchronization loop started at {} Hz against {}",
            self.shared.config.frequency,
            self.shared.config.address()
        );
        let handle = tokio::spawn(Self::run(self.shared.clone()));
        *self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        Ok(())
    }

    /// Stop the loop, wait for its last iteration and close the client.
    ///
    /// Returns the error the loop died with, if it died on its own.
    pub async fn stop(&self) -> Result<()> {
        if self.shared.state.transition(LoopState::Created, LoopState::Stopped) {
            return Ok(());
        }
        self.shared.state.transition(LoopState::Running, LoopState::Stopping);
        self.shared.stop.cancel();

        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let ran = match handle {
            Some(handle) => handle
                .await
                .map_err(|e| SessionError::Other(format!("synchronization loop task failed: {}", e)))
                .and_then(|r| r),
            None => Ok(()),
        };

        let closed = match self.shared.client.get() {
            Some(client) => client.stop().await,
            None => Ok(()),
        };

        self.shared.state.store(LoopState::Stopped);
        self.shared.updates.send_modify(|_| {});
        info!("Synchronization loop stopped");

        ran.and(closed)
    }

    /// Wait until `predicate` holds for the current snapshot.
    ///
    /// The predicate is checked immediately and again after every committed
    /// update. Fails with [`SessionError::WaitTimeout`] carrying `reason` once
    /// `timeout` passes, or with [`SessionError::LoopStopped`] if the loop ends
    /// first.
    pub async fn wait_for<F>(
        &self,
        mut predicate: F,
        timeout: Duration,
        reason: Option<String>,
    ) -> Result<()>
    where
        F: FnMut(&GameState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut updates = self.shared.updates.subscribe();

        loop {
            updates.borrow_and_update();
            if predicate(self.state().as_ref()) {
                return Ok(());
            }
            if !matches!(self.loop_state(), LoopState::Created | LoopState::Running) {
                return Err(SessionError::LoopStopped);
            }

            match tokio::time::timeout_at(deadline, updates.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(SessionError::LoopStopped),
                Err(_) => return Err(SessionError::WaitTimeout { timeout, reason }),
            }
        }
    }

    /// Latest committed snapshot. Default until the first update.
    pub fn state(&self) -> Arc<GameState> {
        self.shared
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of snapshots committed so far.
    pub fn update_count(&self) -> u64 {
        *self.shared.updates.borrow()
    }

    pub fn loop_state(&self) -> LoopState {
        self.shared.state.load()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// The session's RPC client, once started.
    pub fn client(&self) -> Result<&RpcClient> {
        self.shared.client.get().ok_or(SessionError::LoopStopped)
    }

    /// Submit a command and wait for its result.
    pub async fn execute(&self, command: &Command, timeout: Option<Duration>) -> Result<CommandResult> {
        self.client()?.execute(command, timeout).await
    }

    /// Command helpers bound to this session.
    pub fn commands(&self) -> Commands<'_> {
        Commands::new(self)
    }

    async fn run(shared: Arc<Shared>) -> Result<()> {
        let Some(client) = shared.client.get() else {
            return Err(SessionError::LoopStopped);
        };

        let period = shared.config.period();
        let mut deadline = Instant::now() + period;
        let mut stats = LoopStats::new();

        let result = loop {
            if shared.stop.is_cancelled() {
                break Ok(());
            }
            // A deadline in the past returns at once; a slow fetch never inverts the sleep.
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = shared.stop.cancelled() => break Ok(()),
            }
            deadline = Instant::now() + period;

            let started = Instant::now();
            let committed = match shared.tick(client).await {
                Ok(committed) => committed,
                Err(err) => break Err(err),
            };
            stats.record(started.elapsed());
            if committed {
                stats.report(*shared.updates.borrow());
            }
        };

        if let Err(err) = &result {
            error!("Synchronization loop terminated: {}", err);
            shared.state.transition(LoopState::Running, LoopState::Stopped);
            shared.updates.send_modify(|_| {});
        }
        result
    }
}

impl Shared {
    fn snapshot(&self) -> Arc<GameState> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// One fetch-validate-commit-step pass. Only fatal errors escape.
    ///
    /// Returns whether a new snapshot was committed.
    async fn tick(&self, client: &RpcClient) -> Result<bool> {
        let candidate = match self.source.fetch_state(client, self.config.fetch_timeout).await {
            Ok(state) => state,
            Err(err) if err.is_timeout() => {
                error!("State fetch timed out: {}", err);
                return Ok(false);
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!("State fetch failed: {}", err);
                return Ok(false);
            }
        };

        if !self.source.should_update(&self.snapshot(), &candidate) {
            return Ok(false);
        }

        let snapshot = Arc::new(candidate);
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot.clone();

        match self.step.step(&snapshot, client).await {
            Ok(()) => {}
            Err(SessionError::Invariant(message)) => return Err(SessionError::Invariant(message)),
            Err(err) => error!("Step failed at frame {}: {}", snapshot.current_frame, err),
        }

        self.updates.send_modify(|count| *count += 1);
        Ok(true)
    }
}

impl Drop for SyncLoop {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}
