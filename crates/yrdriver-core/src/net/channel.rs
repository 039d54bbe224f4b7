//! Persistent duplex channel with strict request/reply pacing.
//!
//! A background task owns the TCP connection. Callers hand it one request at a
//! time through [`DuplexChannel::send_and_await`] and receive the next inbound
//! frame as the reply. The wire carries no sequence numbers: pairing a reply with
//! its request relies on the peer answering every request with exactly one
//! frame, and on this side never writing a second request before that frame has
//! arrived.
//!
//! # Invariants
//!
//! - At most one request is unanswered. The reply receiver lives behind an async
//!   mutex that is held from enqueueing a request until its reply is taken, so
//!   concurrent callers queue up in arrival order.
//! - A caller whose future is dropped mid-request leaves a stale reply behind.
//!   Requests carry a local sequence number (never sent on the wire) so the next
//!   caller can discard it.
//! - After a connection failure the unanswered request is resent on the new
//!   connection. Before the first connection that is the first queued request.

use super::protocol::{read_frame, write_frame};
use super::retry::RetryConfig;
use crate::config::ChannelConfig;
use crate::{Result, SessionError};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum Outbound {
    Message { seq: u64, payload: Vec<u8> },
    Shutdown,
}

type Reply = (u64, Result<Vec<u8>>);

/// One long-lived connection to the game's command endpoint.
pub struct DuplexChannel {
    name: String,
    addr: String,
    next_seq: AtomicU64,
    outbound: mpsc::Sender<Outbound>,
    replies: Mutex<mpsc::Receiver<Reply>>,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl DuplexChannel {
    /// Start the background connect-and-relay task.
    ///
    /// No connection is attempted until the first request is queued.
    pub fn open(name: impl Into<String>, addr: impl Into<String>, retry: RetryConfig) -> Self {
        let name = name.into();
        let addr = addr.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(ChannelConfig::OUTBOUND_CAPACITY);
        let (reply_tx, reply_rx) = mpsc::channel(ChannelConfig::OUTBOUND_CAPACITY);
        let cancel = CancellationToken::new();

        let relay = Relay {
            name: name.clone(),
            addr: addr.clone(),
            retry,
            cancel: cancel.clone(),
            outbound: outbound_rx,
            replies: reply_tx,
        };
        let task = tokio::spawn(relay.run());

        Self {
            name,
            addr,
            next_seq: AtomicU64::new(1),
            outbound: outbound_tx,
            replies: Mutex::new(reply_rx),
            cancel,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Send one request and return the next reply.
    ///
    /// Concurrent callers are served one at a time in the order they arrive.
    pub async fn send_and_await(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let mut replies = self.replies.lock().await;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        self.outbound
            .send(Outbound::Message { seq, payload })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;

        loop {
            match replies.recv().await {
                Some((reply_seq, reply)) if reply_seq == seq => return reply,
                Some((stale_seq, _)) => {
                    debug!("{}: discarding stale reply for request {}", self.name, stale_seq);
                }
                None => return Err(SessionError::ChannelClosed),
            }
        }
    }

    /// Abort reconnect attempts and any reply still being read.
    ///
    /// The relay exits without reporting an error; a caller waiting on a reply
    /// gets [`SessionError::ChannelClosed`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Signal shutdown and wait for the relay task to finish.
    ///
    /// Returns the fatal error if the relay exhausted its reconnect budget.
    pub async fn close(&self) -> Result<()> {
        // The relay may already be gone; its exit status is reported below.
        let _ = self.outbound.send(Outbound::Shutdown).await;

        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match handle {
            Some(handle) => {
                let result = handle.await.map_err(|e| {
                    SessionError::Other(format!("{} channel task failed: {}", self.name, e))
                })?;
                info!("{} channel to {} closed", self.name, self.addr);
                result
            }
            None => Ok(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

struct Relay {
    name: String,
    addr: String,
    retry: RetryConfig,
    cancel: CancellationToken,
    outbound: mpsc::Receiver<Outbound>,
    replies: mpsc::Sender<Reply>,
}

impl Relay {
    async fn run(mut self) -> Result<()> {
        let mut pending = tokio::select! {
            msg = self.outbound.recv() => match msg {
                Some(Outbound::Message { seq, payload }) => (seq, payload),
                Some(Outbound::Shutdown) | None => return Ok(()),
            },
            _ = self.cancel.cancelled() => return Ok(()),
        };

        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            debug!(
                "{}: connecting to {} (try {}/{})",
                self.name,
                self.addr,
                attempt + 1,
                self.retry.max_attempts
            );

            let mut exchanged = false;
            let err = match self.session(&mut pending, &mut exchanged).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            // A session that carried traffic earns a fresh budget.
            if exchanged {
                attempt = 0;
            }
            attempt += 1;

            if attempt >= self.retry.max_attempts {
                warn!(
                    "{}: giving up on {} after {} attempts: {}",
                    self.name, self.addr, attempt, err
                );
                let fatal = SessionError::Connect {
                    addr: self.addr.clone(),
                    attempts: attempt,
                    message: err.to_string(),
                };
                let _ = self.replies.send((pending.0, Err(fatal.duplicate()))).await;
                return Err(fatal);
            }

            let delay = self.retry.calculate_delay(attempt - 1);
            warn!(
                "{}: connection failed (try {}/{}): {}. Retrying in {:?}",
                self.name, attempt, self.retry.max_attempts, err, delay
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Ok(()),
                msg = self.outbound.recv() => match msg {
                    // The caller of the unanswered request gave up and a new one arrived.
                    Some(Outbound::Message { seq, payload }) => pending = (seq, payload),
                    Some(Outbound::Shutdown) | None => return Ok(()),
                },
            }
        }
    }

    /// Connect, send `pending`, then relay replies and requests until shutdown.
    ///
    /// Returns `Ok` on shutdown. On error, `pending` holds the request that has not
    /// been answered yet.
    async fn session(&mut self, pending: &mut (u64, Vec<u8>), exchanged: &mut bool) -> Result<()> {
        let mut stream = tokio::time::timeout(
            ChannelConfig::CONNECT_TIMEOUT,
            TcpStream::connect(self.addr.as_str()),
        )
        .await
        .map_err(|_| SessionError::Transport {
            message: format!("connect to {} timed out", self.addr),
        })??;
        stream.set_nodelay(true)?;

        debug!("{}: connected to {}", self.name, self.addr);

        let (mut reader, mut writer) = stream.split();
        write_frame(&mut writer, &pending.1).await?;

        loop {
            let frame = tokio::select! {
                frame = read_frame(&mut reader) => frame?,
                _ = self.cancel.cancelled() => return Ok(()),
            };
            let frame = frame.ok_or_else(|| SessionError::Transport {
                message: format!("{} closed the connection", self.addr),
            })?;
            *exchanged = true;

            if self.replies.send((pending.0, Ok(frame))).await.is_err() {
                // Channel handle dropped; nobody is left to serve.
                return Ok(());
            }

            let next = tokio::select! {
                msg = self.outbound.recv() => msg,
                _ = self.cancel.cancelled() => None,
            };
            match next {
                Some(Outbound::Message { seq, payload }) => {
                    *pending = (seq, payload);
                    write_frame(&mut writer, &pending.1).await?;
                }
                Some(Outbound::Shutdown) | None => {
                    let _ = writer.shutdown().await;
                    debug!("{}: session to {} finished", self.name, self.addr);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn quick_retry(attempts: u32) -> RetryConfig {
        RetryConfig::fixed(attempts, Duration::from_millis(10))
    }

    async fn dead_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    /// Echo server that checks no second request arrives before the reply is written.
    async fn spawn_checking_echo(violations: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = stream.split();
            while let Ok(Some(frame)) = read_frame(&mut reader).await {
                let early = tokio::time::timeout(Duration::from_millis(20), read_frame(&mut reader)).await;
                if early.is_ok() {
                    violations.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                write_frame(&mut writer, &frame).await.unwrap();
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_request_reply_roundtrip() {
        let violations = Arc::new(AtomicUsize::new(0));
        let addr = spawn_checking_echo(violations.clone()).await;
        let channel = DuplexChannel::open("command", addr, quick_retry(3));

        let reply = channel.send_and_await(b"ping".to_vec()).await.unwrap();
        assert_eq!(reply, b"ping".to_vec());

        channel.close().await.unwrap();
        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_never_overlap_requests() {
        let violations = Arc::new(AtomicUsize::new(0));
        let addr = spawn_checking_echo(violations.clone()).await;
        let channel = Arc::new(DuplexChannel::open("command", addr, quick_retry(3)));

        let mut tasks = Vec::new();
        for i in 0..5u8 {
            let channel = channel.clone();
            tasks.push(tokio::spawn(async move {
                let reply = channel.send_and_await(vec![i]).await.unwrap();
                assert_eq!(reply, vec![i]);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        channel.close().await.unwrap();
        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_budget_exhausted_is_fatal() {
        let addr = dead_addr().await;
        let channel = DuplexChannel::open("command", addr.clone(), quick_retry(3));

        match channel.send_and_await(b"ping".to_vec()).await {
            Err(SessionError::Connect { attempts, addr: a, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(a, addr);
            }
            other => panic!("Expected Connect error, got: {:?}", other),
        }

        assert!(matches!(
            channel.close().await,
            Err(SessionError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_reconnect_resends_unanswered_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            // First connection: take the request and hang up without answering.
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut stream).await;
            drop(stream);

            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream).await.unwrap().unwrap();
            write_frame(&mut stream, &frame).await.unwrap();
            let _ = read_frame(&mut stream).await;
        });

        let channel = DuplexChannel::open("poll", addr, quick_retry(3));
        let reply = channel.send_and_await(b"first".to_vec()).await.unwrap();
        assert_eq!(reply, b"first".to_vec());
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_budget_resets_after_served_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));

        // Every connection answers one request, then hangs up.
        {
            let accepted = accepted.clone();
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    if let Ok(Some(frame)) = read_frame(&mut stream).await {
                        let _ = write_frame(&mut stream, &frame).await;
                    }
                }
            });
        }

        // Two attempts: each drop costs one, so only a reset budget survives five.
        let channel = DuplexChannel::open("command", addr, quick_retry(2));
        for i in 0..5u8 {
            let reply = channel.send_and_await(vec![i]).await.unwrap();
            assert_eq!(reply, vec![i]);
        }
        assert!(accepted.load(Ordering::SeqCst) >= 5);
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_aborts_retries_without_error() {
        let addr = dead_addr().await;
        let channel = Arc::new(DuplexChannel::open(
            "command",
            addr,
            RetryConfig::fixed(100, Duration::from_millis(50)),
        ));

        let sender = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send_and_await(b"ping".to_vec()).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        channel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), sender)
            .await
            .expect("cancel should end the wait")
            .unwrap();
        assert!(matches!(result, Err(SessionError::ChannelClosed)));
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_without_traffic() {
        let channel = DuplexChannel::open("poll", dead_addr().await, quick_retry(3));
        channel.close().await.unwrap();
        // Second close is a no-op.
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_reply_is_discarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut first = true;
            while let Ok(Some(frame)) = read_frame(&mut stream).await {
                if first {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    first = false;
                }
                write_frame(&mut stream, &frame).await.unwrap();
            }
        });

        let channel = DuplexChannel::open("command", addr, quick_retry(3));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), channel.send_and_await(b"a".to_vec()))
                .await;
        assert!(abandoned.is_err());

        let reply = channel.send_and_await(b"b".to_vec()).await.unwrap();
        assert_eq!(reply, b"b".to_vec());
        channel.close().await.unwrap();
    }
}
