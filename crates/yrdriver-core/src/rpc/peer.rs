//! In-process peer speaking the game side of the protocol.
//!
//! Listens on `127.0.0.1:0` (OS-assigned port) unless told otherwise, accepts
//! any number of client connections and answers every request with exactly one
//! reply. Client commands are acknowledged immediately and handed to a
//! [`PeerHandler`] in a spawned task; what the handler returns is queued for the
//! connection's result queue and delivered to the next blocking poll.
//!
//! Handlers can hold results back ([`PeerReply::Hold`]) so tests control when and
//! in which order they are delivered, or drop them entirely
//! ([`PeerReply::Ignore`]) to make the client time out.

use crate::commands::{Command, Configuration, UnitAction};
use crate::config::PeerConfig;
use crate::net::protocol::{read_frame, write_frame};
use crate::net::{Ack, CommandEnvelope, CommandResult, CommandType, PollRequest, PollResults, Response};
use crate::sync::{GameState, Stage};
use crate::{Result, SessionError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What a [`PeerHandler`] does with a command.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerReply {
    /// Deliver a successful result.
    Done(Value),
    /// Deliver a remote-reported failure.
    Failed(String),
    /// Keep a successful result until [`LoopbackPeerHandle::release`] is called.
    Hold(Value),
    /// Never deliver a result.
    Ignore,
}

/// Produces results for the commands a [`LoopbackPeer`] accepts.
#[async_trait::async_trait]
pub trait PeerHandler: Send + Sync + 'static {
    async fn handle(&self, command: Command) -> PeerReply;
}

/// A result held back by [`PeerReply::Hold`].
#[derive(Debug, Clone, PartialEq)]
pub struct HeldResult {
    pub queue_id: u64,
    pub command: Command,
    pub record: CommandResult,
}

/// Something the peer observed, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Submitted {
        connection: u64,
        command_id: u64,
        queue_id: u64,
        kind: &'static str,
    },
    Polled {
        connection: u64,
        queue_id: u64,
        delivered: usize,
    },
    Rejected {
        connection: u64,
        reason: String,
    },
}

struct PeerState {
    handler: Arc<dyn PeerHandler>,
    next_connection: AtomicU64,
    next_command_id: AtomicU64,
    next_queue_id: AtomicU64,
    queues: Mutex<HashMap<u64, Vec<CommandResult>>>,
    ready: Notify,
    held: Mutex<Vec<HeldResult>>,
    held_changed: Notify,
    events: Mutex<Vec<PeerEvent>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PeerState {
    fn record(&self, event: PeerEvent) {
        lock(&self.events).push(event);
    }

    fn deliver(&self, queue_id: u64, records: impl IntoIterator<Item = CommandResult>) {
        let mut queues = lock(&self.queues);
        let queue = queues.entry(queue_id).or_default();
        queue.extend(records);
        self.ready.notify_waiters();
    }

    fn complete(&self, queue_id: u64, command_id: u64, command: Command, reply: PeerReply) {
        match reply {
            PeerReply::Done(result) => self.deliver(queue_id, [CommandResult::ok(command_id, result)]),
            PeerReply::Failed(message) => {
                self.deliver(queue_id, [CommandResult::error(command_id, message)])
            }
            PeerReply::Hold(result) => {
                lock(&self.held).push(HeldResult {
                    queue_id,
                    command,
                    record: CommandResult::ok(command_id, result),
                });
                self.held_changed.notify_waiters();
            }
            PeerReply::Ignore => debug!("Dropping result of command {}", command_id),
        }
    }

    /// Drain `queue_id`, waiting until something arrives or the deadline passes.
    async fn drain(&self, queue_id: u64, timeout: Duration) -> Result<Vec<CommandResult>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut queues = lock(&self.queues);
                match queues.get_mut(&queue_id) {
                    None => {
                        return Err(SessionError::protocol(format!("unknown queue {}", queue_id)))
                    }
                    Some(queue) if !queue.is_empty() => return Ok(std::mem::take(queue)),
                    Some(_) => {}
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

/// Per-connection bookkeeping.
struct Connection {
    id: u64,
    queue_id: Option<u64>,
}

/// Handle to a running loopback peer. Dropping shuts down the peer.
pub struct LoopbackPeerHandle {
    addr: SocketAddr,
    state: Arc<PeerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl LoopbackPeerHandle {
    /// Get the address the peer is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Everything the peer has seen so far.
    pub fn events(&self) -> Vec<PeerEvent> {
        lock(&self.state.events).clone()
    }

    /// Number of results currently held back.
    pub fn held_count(&self) -> usize {
        lock(&self.state.held).len()
    }

    /// Wait until at least `count` results are held. Returns false on timeout.
    pub async fn wait_held(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.state.held_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.held_count() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.held_count() >= count;
            }
        }
    }

    /// Deliver every held result in one batch per queue.
    ///
    /// `arrange` may reorder or drop entries first; delivery follows the order it
    /// leaves them in.
    pub fn release<F>(&self, arrange: F)
    where
        F: FnOnce(&mut Vec<HeldResult>),
    {
        let mut held = std::mem::take(&mut *lock(&self.state.held));
        arrange(&mut held);

        let mut batches: Vec<(u64, Vec<CommandResult>)> = Vec::new();
        for entry in held {
            match batches.iter_mut().find(|(queue_id, _)| *queue_id == entry.queue_id) {
                Some((_, batch)) => batch.push(entry.record),
                None => batches.push((entry.queue_id, vec![entry.record])),
            }
        }
        for (queue_id, batch) in batches {
            debug!("Releasing {} held results to queue {}", batch.len(), queue_id);
            self.state.deliver(queue_id, batch);
        }
    }

    /// Shut down the peer.
    ///
    /// Stops accepting new connections and closes all active ones.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for LoopbackPeerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Loopback stand-in for the game's command endpoint.
pub struct LoopbackPeer;

impl LoopbackPeer {
    /// Start a peer on a random local port.
    pub async fn start<H: PeerHandler>(handler: Arc<H>) -> Result<LoopbackPeerHandle> {
        Self::start_on(PeerConfig::BIND_ADDR, handler).await
    }

    /// Start a peer on the given address.
    pub async fn start_on<H: PeerHandler>(addr: &str, handler: Arc<H>) -> Result<LoopbackPeerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("Loopback peer listening on {}", addr);

        let state = Arc::new(PeerState {
            handler,
            next_connection: AtomicU64::new(1),
            next_command_id: AtomicU64::new(1),
            next_queue_id: AtomicU64::new(1),
            queues: Mutex::new(HashMap::new()),
            ready: Notify::new(),
            held: Mutex::new(Vec::new()),
            held_changed: Notify::new(),
            events: Mutex::new(Vec::new()),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            state.clone(),
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(LoopbackPeerHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        state: Arc<PeerState>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        let active_connections = Arc::new(AtomicUsize::new(0));

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Loopback peer shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, remote)) => {
                            if active_connections.load(Ordering::Relaxed) >= PeerConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    remote,
                                    PeerConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let state = state.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();
                            let connection = Connection {
                                id: state.next_connection.fetch_add(1, Ordering::Relaxed),
                                queue_id: None,
                            };

                            tokio::spawn(async move {
                                debug!("Peer connection {} from {}", connection.id, remote);
                                let id = connection.id;
                                if let Err(e) = Self::handle_connection(stream, &state, connection, &mut conn_shutdown).await {
                                    debug!("Peer connection {} ended: {}", id, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Peer accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        state: &Arc<PeerState>,
        mut connection: Connection,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.split();

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()),
                    }
                }
                _ = shutdown_rx.changed() => return Ok(()),
            };

            // A blocking poll may park here; shutdown must not wait for it.
            let response = tokio::select! {
                response = Self::process_request(&frame, state, &mut connection) => response,
                _ = shutdown_rx.changed() => return Ok(()),
            };

            write_frame(&mut writer, &response.encode()?).await?;
        }
    }

    async fn process_request(
        frame: &[u8],
        state: &Arc<PeerState>,
        connection: &mut Connection,
    ) -> Response {
        let outcome = match CommandEnvelope::decode(frame) {
            Ok(envelope) => match envelope.command_type {
                CommandType::ClientCommand => Self::accept_command(envelope.command, state, connection),
                CommandType::PollBlocking => Self::answer_poll(envelope.command, state, connection).await,
            },
            Err(e) => Err(e),
        };

        outcome.unwrap_or_else(|e| {
            warn!("Peer connection {} rejected a request: {}", connection.id, e);
            state.record(PeerEvent::Rejected {
                connection: connection.id,
                reason: e.to_string(),
            });
            Response::error(e.to_string())
        })
    }

    fn accept_command(
        payload: Value,
        state: &Arc<PeerState>,
        connection: &mut Connection,
    ) -> Result<Response> {
        let command: Command = serde_json::from_value(payload)
            .map_err(|e| SessionError::protocol(format!("malformed command: {}", e)))?;

        let (queue_id, assigned) = match connection.queue_id {
            Some(queue_id) => (queue_id, false),
            None => {
                let queue_id = state.next_queue_id.fetch_add(1, Ordering::Relaxed);
                lock(&state.queues).insert(queue_id, Vec::new());
                connection.queue_id = Some(queue_id);
                (queue_id, true)
            }
        };
        let command_id = state.next_command_id.fetch_add(1, Ordering::Relaxed);

        state.record(PeerEvent::Submitted {
            connection: connection.id,
            command_id,
            queue_id,
            kind: command.kind(),
        });

        let task_state = state.clone();
        tokio::spawn(async move {
            let reply = task_state.handler.handle(command.clone()).await;
            task_state.complete(queue_id, command_id, command, reply);
        });

        let ack = Ack {
            command_id,
            queue_id: assigned.then_some(queue_id),
        };
        Ok(Response::ok(serde_json::to_value(ack)?))
    }

    async fn answer_poll(
        payload: Value,
        state: &Arc<PeerState>,
        connection: &Connection,
    ) -> Result<Response> {
        let request: PollRequest = serde_json::from_value(payload)
            .map_err(|e| SessionError::protocol(format!("malformed poll request: {}", e)))?;

        let results = state
            .drain(request.queue_id, Duration::from_millis(request.timeout_ms))
            .await?;

        state.record(PeerEvent::Polled {
            connection: connection.id,
            queue_id: request.queue_id,
            delivered: results.len(),
        });

        Ok(Response::ok(serde_json::to_value(PollResults { results })?))
    }
}

/// Scripted game: a frame counter, a stage and a small value store.
///
/// Every `GetGameState` advances the frame by one.
pub struct SyntheticGame {
    frame: AtomicU64,
    stage: Mutex<Stage>,
    stalls: AtomicU32,
    exit_after: Option<u64>,
    config: Mutex<Configuration>,
    values: Mutex<HashMap<String, Value>>,
    commands: Mutex<Vec<Command>>,
}

impl Default for SyntheticGame {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticGame {
    /// A game already in progress at frame 0.
    pub fn new() -> Self {
        Self {
            frame: AtomicU64::new(0),
            stage: Mutex::new(Stage::InGame),
            stalls: AtomicU32::new(0),
            exit_after: None,
            config: Mutex::new(Configuration::default()),
            values: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn with_stage(self, stage: Stage) -> Self {
        *lock(&self.stage) = stage;
        self
    }

    /// Switch to [`Stage::ExitGame`] once `frame` is reached.
    pub fn with_exit_after(mut self, frame: u64) -> Self {
        self.exit_after = Some(frame);
        self
    }

    pub fn with_value(self, key: impl Into<String>, value: Value) -> Self {
        lock(&self.values).insert(key.into(), value);
        self
    }

    pub fn set_stage(&self, stage: Stage) {
        *lock(&self.stage) = stage;
    }

    pub fn stage(&self) -> Stage {
        *lock(&self.stage)
    }

    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::SeqCst)
    }

    /// Leave the next `count` state fetches unanswered.
    pub fn stall_next_fetches(&self, count: u32) {
        self.stalls.store(count, Ordering::SeqCst);
    }

    pub fn configuration(&self) -> Configuration {
        lock(&self.config).clone()
    }

    /// Commands received so far, fetches included.
    pub fn commands(&self) -> Vec<Command> {
        lock(&self.commands).clone()
    }

    fn next_state(&self) -> PeerReply {
        let stalled = self
            .stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stalled {
            return PeerReply::Ignore;
        }

        let frame = self.frame.fetch_add(1, Ordering::SeqCst) + 1;
        let stage = {
            let mut stage = lock(&self.stage);
            if self.exit_after.is_some_and(|exit| frame >= exit) {
                *stage = Stage::ExitGame;
            }
            *stage
        };

        match serde_json::to_value(GameState::new(frame, stage)) {
            Ok(state) => PeerReply::Done(json!({ "state": state })),
            Err(e) => PeerReply::Failed(e.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl PeerHandler for SyntheticGame {
    async fn handle(&self, command: Command) -> PeerReply {
        lock(&self.commands).push(command.clone());

        match command {
            Command::GetGameState => self.next_state(),
            Command::InspectConfiguration { config, update } => {
                let mut current = lock(&self.config);
                if update {
                    if let Some(config) = config {
                        *current = config;
                    }
                }
                match serde_json::to_value(&*current) {
                    Ok(config) => PeerReply::Done(json!({ "config": config })),
                    Err(e) => PeerReply::Failed(e.to_string()),
                }
            }
            Command::ReadValue { key } => match lock(&self.values).get(&key) {
                Some(value) => PeerReply::Done(value.clone()),
                None => PeerReply::Failed(format!("no value stored under {}", key)),
            },
            Command::PlaceQuery { coordinates, .. } => {
                PeerReply::Done(json!({ "coordinates": coordinates }))
            }
            Command::UnitOrder {
                object_addresses,
                action,
                ..
            } if object_addresses.is_empty() && action != UnitAction::SellCell => {
                PeerReply::Failed("no objects given".to_string())
            }
            _ => PeerReply::Done(json!({})),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl PeerHandler for EchoHandler {
        async fn handle(&self, command: Command) -> PeerReply {
            match command {
                Command::ReadValue { key } if key == "hold" => PeerReply::Hold(json!(key)),
                Command::ReadValue { key } if key == "fail" => PeerReply::Failed("boom".to_string()),
                Command::ReadValue { key } => PeerReply::Done(json!(key)),
                _ => PeerReply::Ignore,
            }
        }
    }

    async fn request(stream: &mut TcpStream, envelope: CommandEnvelope) -> Response {
        write_frame(stream, &envelope.encode().unwrap()).await.unwrap();
        let frame = read_frame(stream).await.unwrap().unwrap();
        Response::decode(&frame).unwrap()
    }

    fn read_value(key: &str) -> CommandEnvelope {
        let command = Command::ReadValue {
            key: key.to_string(),
        };
        CommandEnvelope::client(command.to_value().unwrap())
    }

    #[tokio::test]
    async fn test_peer_start_and_shutdown() {
        let mut handle = LoopbackPeer::start(Arc::new(EchoHandler)).await.unwrap();

        assert!(handle.port() > 0);
        assert_eq!(handle.addr().ip(), std::net::Ipv4Addr::LOCALHOST);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_replies_are_not_delayed_by_coalescing() {
        let handle = LoopbackPeer::start(Arc::new(EchoHandler)).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        stream.set_nodelay(true).unwrap();

        let started = std::time::Instant::now();
        let mut last = None;
        for i in 0..20 {
            let ack: Ack = request(&mut stream, read_value(&i.to_string()))
                .await
                .unpack("ack")
                .unwrap();
            assert_ne!(last, Some(ack.command_id));
            last = Some(ack.command_id);
        }
        // A delayed-ack stall costs ~40ms per round trip.
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_queue_assigned_on_first_submission_only() {
        let handle = LoopbackPeer::start(Arc::new(EchoHandler)).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let first: Ack = request(&mut stream, read_value("a")).await.unpack("ack").unwrap();
        let second: Ack = request(&mut stream, read_value("b")).await.unpack("ack").unwrap();

        assert!(first.queue_id.is_some());
        assert_eq!(second.queue_id, None);
        assert_ne!(first.command_id, second.command_id);
    }

    #[tokio::test]
    async fn test_poll_delivers_results() {
        let handle = LoopbackPeer::start(Arc::new(EchoHandler)).await.unwrap();
        let mut commands = TcpStream::connect(handle.addr()).await.unwrap();
        let mut polls = TcpStream::connect(handle.addr()).await.unwrap();

        let ok: Ack = request(&mut commands, read_value("x")).await.unpack("ack").unwrap();
        let failed: Ack = request(&mut commands, read_value("fail")).await.unpack("ack").unwrap();
        let queue_id = ok.queue_id.unwrap();

        let mut records = Vec::new();
        while records.len() < 2 {
            let batch: PollResults = request(&mut polls, CommandEnvelope::poll(queue_id, Duration::from_secs(1)))
                .await
                .unpack("poll results")
                .unwrap();
            records.extend(batch.results);
        }

        let by_id: HashMap<u64, CommandResult> =
            records.into_iter().map(|r| (r.command_id, r)).collect();
        assert_eq!(by_id[&ok.command_id].result, json!("x"));
        assert!(by_id[&failed.command_id].is_error());
    }

    #[tokio::test]
    async fn test_empty_poll_returns_after_timeout() {
        let handle = LoopbackPeer::start(Arc::new(EchoHandler)).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let ack: Ack = request(&mut stream, CommandEnvelope::client(Command::GetGameState.to_value().unwrap()))
            .await
            .unpack("ack")
            .unwrap();

        let started = std::time::Instant::now();
        let batch: PollResults = request(
            &mut stream,
            CommandEnvelope::poll(ack.queue_id.unwrap(), Duration::from_millis(50)),
        )
        .await
        .unpack("poll results")
        .unwrap();

        assert!(batch.results.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_unknown_queue_is_rejected() {
        let handle = LoopbackPeer::start(Arc::new(EchoHandler)).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let response = request(&mut stream, CommandEnvelope::poll(999, Duration::from_millis(10))).await;
        assert_eq!(response.code, crate::net::ResponseCode::Error);
        assert!(matches!(handle.events().last(), Some(PeerEvent::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_held_results_follow_release_order() {
        let handle = LoopbackPeer::start(Arc::new(EchoHandler)).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let mut ids = Vec::new();
        let mut queue_id = None;
        for _ in 0..3 {
            let ack: Ack = request(&mut stream, read_value("hold")).await.unpack("ack").unwrap();
            queue_id = queue_id.or(ack.queue_id);
            ids.push(ack.command_id);
        }
        assert!(handle.wait_held(3, Duration::from_secs(1)).await);

        handle.release(|held| held.reverse());
        assert_eq!(handle.held_count(), 0);

        let batch: PollResults = request(
            &mut stream,
            CommandEnvelope::poll(queue_id.unwrap(), Duration::from_secs(1)),
        )
        .await
        .unpack("poll results")
        .unwrap();
        let delivered: Vec<u64> = batch.results.iter().map(|r| r.command_id).collect();
        ids.sort_unstable();
        ids.reverse();
        assert_eq!(delivered, ids);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let mut handle = LoopbackPeer::start(Arc::new(EchoHandler)).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let _ = request(&mut stream, read_value("a")).await;

        handle.shutdown();

        let closed = tokio::time::timeout(Duration::from_secs(1), read_frame(&mut stream))
            .await
            .expect("connection should close");
        assert!(matches!(closed, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_synthetic_game_advances_frames() {
        let game = SyntheticGame::new().with_exit_after(3);

        for expected in 1..=3u64 {
            match game.handle(Command::GetGameState).await {
                PeerReply::Done(value) => {
                    let state: GameState = serde_json::from_value(value["state"].clone()).unwrap();
                    assert_eq!(state.current_frame, expected);
                }
                other => panic!("Expected state, got: {:?}", other),
            }
        }
        assert_eq!(game.stage(), Stage::ExitGame);
    }

    #[tokio::test]
    async fn test_synthetic_game_stalls() {
        let game = SyntheticGame::new();
        game.stall_next_fetches(2);

        assert_eq!(game.handle(Command::GetGameState).await, PeerReply::Ignore);
        assert_eq!(game.handle(Command::GetGameState).await, PeerReply::Ignore);
        assert!(matches!(game.handle(Command::GetGameState).await, PeerReply::Done(_)));
        assert_eq!(game.frame(), 1);
        assert_eq!(game.commands().len(), 3);
    }
}
