//! yrdriver - Automation driver for a live game process.
//!
//! This crate keeps a local view of a running game current at a fixed frequency
//! and lets automation scripts issue commands against it. Commands are sent over
//! one connection and acknowledged with an identifier; their results arrive
//! asynchronously over a second, long-polling connection and are matched back to
//! the waiting caller by that identifier.
//!
//! A [`LoopbackPeer`] speaks the game side of the protocol in-process, so scripts
//! can be rehearsed without a game.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use yrdriver::{SessionConfig, SyncLoop};
//!
//! #[tokio::main]
//! async fn main() -> yrdriver::Result<()> {
//!     let session = SyncLoop::remote(SessionConfig::new("127.0.0.1", 14521));
//!     session.start()?;
//!
//!     let commands = session.commands();
//!     commands.wait_game_to_begin(Duration::from_secs(60)).await?;
//!     commands.add_message("hello", 150, 5).await?;
//!
//!     session.stop().await
//! }
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod net;
pub mod rpc;
pub mod sync;

// Re-export commonly used types
pub use commands::{Command, Commands, Configuration, Coordinates, ProduceAction, UnitAction};
pub use config::{ChannelConfig, LoopConfig, PeerConfig, PollConfig, SessionConfig};
pub use error::{Result, SessionError};
pub use net::{Ack, CommandResult, DuplexChannel, ResponseCode, RetryConfig};
pub use rpc::{
    HeldResult, LoopbackPeer, LoopbackPeerHandle, PeerEvent, PeerHandler, PeerReply, ResultTable,
    RpcClient, SyntheticGame,
};
pub use sync::{GameState, LoopState, NoopStep, RemoteState, Stage, StateSource, StepHandler, SyncLoop};
