//! Dual-channel RPC client, its result table and the loopback peer.

mod client;
pub mod peer;
mod results;

pub use client::RpcClient;
pub use peer::{
    HeldResult, LoopbackPeer, LoopbackPeerHandle, PeerEvent, PeerHandler, PeerReply, SyntheticGame,
};
pub use results::ResultTable;
