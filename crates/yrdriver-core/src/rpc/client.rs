//! Dual-channel RPC client.
//!
//! Commands go out on the "command" channel and are acknowledged with an
//! identifier; their results come back in batches on the "poll" channel, which a
//! background task keeps busy with blocking polls once the peer has assigned this
//! session a queue. Results are parked in a [`ResultTable`] keyed by command
//! identifier, so the order the peer delivers them in does not matter.

use super::results::ResultTable;
use crate::commands::Command;
use crate::config::SessionConfig;
use crate::net::{Ack, CommandEnvelope, CommandResult, DuplexChannel, PollResults, Response};
use crate::{Result, SessionError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Client for one game process, owning both channels and the poll task.
pub struct RpcClient {
    command: DuplexChannel,
    poll: Arc<DuplexChannel>,
    results: Arc<ResultTable<u64, CommandResult>>,
    queue_id: watch::Sender<Option<u64>>,
    stop: CancellationToken,
    poll_task: std::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl RpcClient {
    /// Open both channels and start the poll task.
    ///
    /// Connections are made lazily by the first request on each channel.
    pub fn connect(config: &SessionConfig) -> Self {
        let addr = config.address();
        let command = DuplexChannel::open("command", addr.clone(), config.retry.clone());
        let poll = Arc::new(DuplexChannel::open("poll", addr, config.retry.clone()));
        let results = Arc::new(ResultTable::new());
        let (queue_id, _) = watch::channel(None);
        let stop = CancellationToken::new();

        let poller = Poller {
            channel: poll.clone(),
            results: results.clone(),
            queue_id: queue_id.subscribe(),
            stop: stop.clone(),
            timeout: config.poll_timeout,
        };
        let poll_task = tokio::spawn(poller.run());

        Self {
            command,
            poll,
            results,
            queue_id,
            stop,
            poll_task: std::sync::Mutex::new(Some(poll_task)),
        }
    }

    /// Send a command and return its acknowledgement.
    ///
    /// The first acknowledgement carrying a queue identity latches it; later ones
    /// never replace it. A reply that is not an acknowledgement is a protocol
    /// desync and fails every pending result wait.
    pub async fn submit(&self, command: &Command) -> Result<Ack> {
        if let Some(err) = self.results.failure() {
            return Err(err);
        }

        let envelope = CommandEnvelope::client(command.to_value()?);
        let reply = self.command.send_and_await(envelope.encode()?).await?;
        let ack: Ack = match Response::decode(&reply).and_then(|r| r.unpack("ack")) {
            Ok(ack) => ack,
            Err(err) => {
                error!("Command channel desync on {}: {}", command.kind(), err);
                self.results.fail(err.duplicate());
                return Err(err);
            }
        };

        if let Some(id) = ack.queue_id {
            let latched = self.queue_id.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(id);
                    true
                } else {
                    false
                }
            });
            if latched {
                info!("Result queue {} assigned", id);
            }
        }

        debug!("Submitted {} as command {}", command.kind(), ack.command_id);
        Ok(ack)
    }

    /// Submit a command and wait for its result record.
    ///
    /// `None` waits as long as the session lives. A remote-reported failure is
    /// returned as a normal record.
    pub async fn execute(&self, command: &Command, timeout: Option<Duration>) -> Result<CommandResult> {
        let ack = self.submit(command).await?;
        self.results
            .get(ack.command_id, timeout)
            .await
            .inspect_err(|err| {
                if err.is_timeout() {
                    warn!(
                        "No result for {} (command {}) within {:?}",
                        command.kind(),
                        ack.command_id,
                        timeout.unwrap_or_default()
                    );
                }
            })
    }

    /// Queue identity assigned by the peer, once known.
    pub fn queue_id(&self) -> Option<u64> {
        *self.queue_id.borrow()
    }

    /// Results delivered but not yet collected by any caller.
    pub fn pending_results(&self) -> usize {
        self.results.len()
    }

    /// Stop polling and close both channels.
    ///
    /// An in-flight poll is allowed to finish, so this takes at most the wire poll
    /// timeout. Returns the first fatal error either background task ended with.
    pub async fn stop(&self) -> Result<()> {
        self.stop.cancel();

        let handle = self
            .poll_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let polled = match handle {
            Some(handle) => handle
                .await
                .map_err(|e| SessionError::Other(format!("poll task failed: {}", e)))
                .and_then(|r| r),
            None => Ok(()),
        };

        let command = self.command.close().await;
        let poll = self.poll.close().await;
        info!("RPC client stopped");

        polled.and(command).and(poll)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.stop.cancel();
        self.command.cancel();
        self.poll.cancel();
    }
}

struct Poller {
    channel: Arc<DuplexChannel>,
    results: Arc<ResultTable<u64, CommandResult>>,
    queue_id: watch::Receiver<Option<u64>>,
    stop: CancellationToken,
    timeout: Duration,
}

impl Poller {
    async fn run(mut self) -> Result<()> {
        let queue_id = tokio::select! {
            latched = self.queue_id.wait_for(Option::is_some) => match latched {
                Ok(id) => *id,
                // Client dropped before anything was submitted.
                Err(_) => return Ok(()),
            },
            _ = self.stop.cancelled() => return Ok(()),
        };
        let Some(queue_id) = queue_id else {
            return Ok(());
        };

        debug!("Polling result queue {}", queue_id);
        match self.poll_loop(queue_id).await {
            Ok(()) => Ok(()),
            Err(SessionError::ChannelClosed) if self.stop.is_cancelled() => Ok(()),
            Err(err) => {
                error!("Result poller stopped: {}", err);
                self.results.fail(SessionError::PollerFailed {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn poll_loop(&self, queue_id: u64) -> Result<()> {
        while !self.stop.is_cancelled() {
            let envelope = CommandEnvelope::poll(queue_id, self.timeout);
            let reply = self.channel.send_and_await(envelope.encode()?).await?;
            let batch: PollResults = Response::decode(&reply)?.unpack("poll results")?;

            if !batch.results.is_empty() {
                debug!("Received {} results", batch.results.len());
            }
            for record in batch.results {
                self.results.put(record.command_id, record);
            }
        }
        Ok(())
    }
}
