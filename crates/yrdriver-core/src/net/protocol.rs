//! Wire format shared by the client channels and the loopback peer.
//!
//! Every message travels as one length-prefixed frame holding a UTF-8 JSON
//! document:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Requests are [`CommandEnvelope`]s; every reply is a [`Response`] whose `body`
//! is unpacked by the caller into the type it expects ([`Ack`] on the command
//! channel, [`PollResults`] on the poll channel). A body that fails to unpack is
//! a protocol desync.

use crate::config::ChannelConfig;
use crate::{Result, SessionError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Discriminator carried by every [`CommandEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum CommandType {
    /// `command` is a client command to queue on the peer.
    ClientCommand = 1,
    /// `command` is a [`PollRequest`].
    PollBlocking = 2,
}

impl From<CommandType> for u32 {
    fn from(t: CommandType) -> Self {
        t as u32
    }
}

impl TryFrom<u32> for CommandType {
    type Error = String;

    fn try_from(v: u32) -> std::result::Result<Self, Self::Error> {
        match v {
            1 => Ok(CommandType::ClientCommand),
            2 => Ok(CommandType::PollBlocking),
            other => Err(format!("unknown command type {}", other)),
        }
    }
}

/// Status code carried by responses and result records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ResponseCode {
    #[default]
    Ok = 0,
    Error = 1,
}

impl From<ResponseCode> for u32 {
    fn from(c: ResponseCode) -> Self {
        c as u32
    }
}

impl TryFrom<u32> for ResponseCode {
    type Error = String;

    fn try_from(v: u32) -> std::result::Result<Self, String> {
        match v {
            0 => Ok(ResponseCode::Ok),
            1 => Ok(ResponseCode::Error),
            other => Err(format!("unknown response code {}", other)),
        }
    }
}

/// Outbound request: a discriminator plus the payload it implies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_type: CommandType,
    pub command: Value,
}

impl CommandEnvelope {
    /// Wrap a serialized client command.
    pub fn client(command: Value) -> Self {
        Self {
            command_type: CommandType::ClientCommand,
            command,
        }
    }

    /// Build a blocking poll for the given queue.
    pub fn poll(queue_id: u64, timeout: Duration) -> Self {
        let request = PollRequest {
            queue_id,
            timeout_ms: timeout.as_millis() as u64,
        };
        Self {
            command_type: CommandType::PollBlocking,
            command: serde_json::json!(request),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SessionError::protocol(format!("malformed command envelope: {}", e)))
    }
}

/// Wrapper around every reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub code: ResponseCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub body: Value,
}

impl Response {
    /// Create a success response.
    pub fn ok(body: Value) -> Self {
        Self {
            code: ResponseCode::Ok,
            error_message: None,
            body,
        }
    }

    /// Create an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Error,
            error_message: Some(message.into()),
            body: Value::Null,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SessionError::protocol(format!("malformed response: {}", e)))
    }

    /// Unpack the body as `T`.
    ///
    /// A rejected envelope or a body of the wrong shape means the two ends disagree
    /// on protocol state, so both surface as [`SessionError::Protocol`].
    pub fn unpack<T: DeserializeOwned>(self, what: &str) -> Result<T> {
        if self.code == ResponseCode::Error {
            return Err(SessionError::protocol(format!(
                "peer rejected {}: {}",
                what,
                self.error_message.unwrap_or_default()
            )));
        }
        serde_json::from_value(self.body)
            .map_err(|e| SessionError::protocol(format!("failed to unpack {}: {}", what, e)))
    }
}

/// Acknowledgement of a submitted client command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub command_id: u64,
    /// Set by the peer on the first submission of a session.
    #[serde(default)]
    pub queue_id: Option<u64>,
}

/// Blocking poll arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    pub queue_id: u64,
    pub timeout_ms: u64,
}

/// Batch of results answered to a blocking poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollResults {
    #[serde(default)]
    pub results: Vec<CommandResult>,
}

/// Correlated outcome of a previously submitted command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: u64,
    #[serde(default)]
    pub code: ResponseCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub result: Value,
}

impl CommandResult {
    pub fn ok(command_id: u64, result: Value) -> Self {
        Self {
            command_id,
            code: ResponseCode::Ok,
            error_message: None,
            result,
        }
    }

    pub fn error(command_id: u64, message: impl Into<String>) -> Self {
        Self {
            command_id,
            code: ResponseCode::Error,
            error_message: Some(message.into()),
            result: Value::Null,
        }
    }

    /// Whether the peer reported the command as failed.
    pub fn is_error(&self) -> bool {
        self.code == ResponseCode::Error
    }

    /// Turn a remote-reported failure into [`SessionError::CommandFailed`].
    pub fn check(self, command: &str) -> Result<Self> {
        if self.is_error() {
            return Err(SessionError::CommandFailed {
                command: command.to_string(),
                message: self.error_message.unwrap_or_default(),
            });
        }
        Ok(self)
    }

    /// Unpack the result payload as `T`.
    pub fn unpack<T: DeserializeOwned>(&self, what: &str) -> Result<T> {
        serde_json::from_value(self.result.clone())
            .map_err(|e| SessionError::protocol(format!("failed to unpack {}: {}", what, e)))
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ChannelConfig::MAX_FRAME_SIZE {
        return Err(SessionError::protocol(format!(
            "frame size {} exceeds maximum {}",
            len,
            ChannelConfig::MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| SessionError::protocol("frame too large to encode"))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_poll_envelope_shape() {
        let envelope = CommandEnvelope::poll(7, Duration::from_secs(5));
        let json: Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();

        assert_eq!(json["command_type"], json!(2));
        assert_eq!(json["command"]["queue_id"], json!(7));
        assert_eq!(json["command"]["timeout_ms"], json!(5000));
    }

    #[test]
    fn test_unknown_command_type_is_protocol_error() {
        let result = CommandEnvelope::decode(br#"{"command_type": 9, "command": {}}"#);
        assert!(matches!(result, Err(SessionError::Protocol { .. })));
    }

    #[test]
    fn test_unpack_ack() {
        let response = Response::ok(json!({"command_id": 3, "queue_id": 11}));
        let ack: Ack = response.unpack("ack").unwrap();
        assert_eq!(ack.command_id, 3);
        assert_eq!(ack.queue_id, Some(11));
    }

    #[test]
    fn test_unpack_wrong_shape_is_protocol_error() {
        // A poll batch arriving where an ack was expected.
        let response = Response::ok(json!({"results": []}));
        let result: Result<Ack> = response.unpack("ack");
        match result {
            Err(SessionError::Protocol { message }) => assert!(message.contains("ack")),
            other => panic!("Expected Protocol error, got: {:?}", other),
        }
    }

    #[test]
    fn test_unpack_rejected_response_is_protocol_error() {
        let response = Response::error("unknown queue");
        let result: Result<PollResults> = response.unpack("poll results");
        match result {
            Err(SessionError::Protocol { message }) => assert!(message.contains("unknown queue")),
            other => panic!("Expected Protocol error, got: {:?}", other),
        }
    }

    #[test]
    fn test_command_result_check() {
        let failed = CommandResult::error(4, "object not found");
        assert!(failed.is_error());
        match failed.check("UnitOrder") {
            Err(SessionError::CommandFailed { command, message }) => {
                assert_eq!(command, "UnitOrder");
                assert_eq!(message, "object not found");
            }
            other => panic!("Expected CommandFailed, got: {:?}", other),
        }

        let ok = CommandResult::ok(5, json!({"done": true}));
        assert!(ok.check("UnitOrder").is_ok());
    }

    #[test]
    fn test_result_defaults_when_fields_missing() {
        let record: CommandResult = serde_json::from_value(json!({"command_id": 9})).unwrap();
        assert_eq!(record.code, ResponseCode::Ok);
        assert!(record.error_message.is_none());
        assert!(record.result.is_null());
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();

        assert_eq!(read_back, Some(payload.to_vec()));
    }

    #[test]
    fn test_response_code_from_wire() {
        assert_eq!(ResponseCode::try_from(0), Ok(ResponseCode::Ok));
        assert_eq!(ResponseCode::try_from(1), Ok(ResponseCode::Error));
        assert!(ResponseCode::try_from(7).is_err());

        let response: std::result::Result<Response, _> =
            serde_json::from_value(json!({"code": 7, "body": {}}));
        assert!(response.is_err());
    }

    /// Counts `poll_write` calls that carry data.
    #[derive(Default)]
    struct CountingWriter {
        writes: usize,
        buf: Vec<u8>,
    }

    impl tokio::io::AsyncWrite for CountingWriter {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            data: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.writes += 1;
            self.buf.extend_from_slice(data);
            std::task::Poll::Ready(Ok(data.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_frame_is_written_in_one_call() {
        let mut writer = CountingWriter::default();
        write_frame(&mut writer, b"{\"state\":{}}").await.unwrap();

        assert_eq!(writer.writes, 1);
        assert_eq!(&writer.buf[..4], &12u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (ChannelConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(SessionError::Protocol { .. })));
    }
}
