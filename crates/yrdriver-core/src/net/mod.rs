//! Network layer: wire protocol, reconnect policy and the duplex channel.
//!
//! - **Protocol**: length-prefixed JSON frames and the envelope types
//! - **Retry**: fixed-delay (optionally exponential) reconnect policy
//! - **Channel**: one persistent connection with strict request/reply pacing

mod channel;
pub mod protocol;
mod retry;

pub use channel::DuplexChannel;
pub use protocol::{
    Ack, CommandEnvelope, CommandResult, CommandType, PollRequest, PollResults, Response,
    ResponseCode,
};
pub use retry::RetryConfig;
