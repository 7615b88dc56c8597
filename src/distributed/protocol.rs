//! Wire protocol between the switchboard and its peers
//!
//! Every call is one request frame followed by one reply frame on a fresh TCP
//! connection. Peers call the switchboard (registration, assignment, work
//! items, settings) and the switchboard calls peers (liveness, death, service).
//!
//! # Message Flow
//!
//! ```text
//! Client/Server                 Switchboard
//!     |                              |
//!     |-- CALL(RegisterClient) ----->|
//!     |<------- REPLY(Id) -----------|
//!     |                              |
//!     |<------- CALL(Alive) ---------|   (peer endpoint)
//!     |-------- REPLY(Bool) -------->|
//! ```
//!
//! # Message Framing
//!
//! Each message is prefixed with a 4-byte length field (little-endian u32):
//!
//! ```text
//! [4 bytes: message length][N bytes: MessagePack-serialized message]
//! ```

use crate::error::WireError;
use crate::work::{Payload, WorkItem};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Protocol version
///
/// Increment this when making breaking changes to the protocol.
/// The switchboard and its peers must have matching protocol versions.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame either side will accept
pub const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// Where a remote server can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: u32,
    pub endpoint: String,
}

/// A call, in either direction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Call {
    // ===== Peer → Switchboard =====
    RegisterClient { endpoint: String },
    RegisterServer { endpoint: String },
    GetServer { client_id: u32 },
    GetServerById { client_id: u32, server_id: u32 },
    NextObject { client_id: u32 },
    PutObject {
        client_id: u32,
        item: WorkItem,
        elapsed_millis: u64,
    },
    GetSetting { name: String },
    GetSettings,
    KeepAliveInterval,
    KeepAliveMaxRetries,

    // ===== Switchboard → Peer =====
    Id,
    Host,
    Alive,
    Die { immediate: bool },
    ServerDown { server_id: u32 },
    MaxClients,
    AcceptOnlyByRequest,
    Serve { request: Payload },
}

/// Answer to a [`Call`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Done,
    Id(u32),
    Host(String),
    Bool(bool),
    MaxClients(i32),
    Server(Option<ServerInfo>),
    Object(Option<WorkItem>),
    Setting(Option<String>),
    Settings(BTreeMap<String, String>),
    Millis(u64),
    Count(u32),
    Payload(Payload),
    Error(WireError),
}

/// Request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMessage {
    pub protocol_version: u32,
    pub call: Call,
}

/// Protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Call(CallMessage),
    Reply(Reply),
}

impl Message {
    pub fn call(call: Call) -> Self {
        Self::Call(CallMessage {
            protocol_version: PROTOCOL_VERSION,
            call,
        })
    }
}

/// Serialize a message with a length prefix
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let msg_bytes = rmp_serde::to_vec(msg).context("Failed to serialize message")?;

    let msg_len = msg_bytes.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg_bytes.len());
    framed.extend_from_slice(&msg_len.to_le_bytes());
    framed.extend_from_slice(&msg_bytes);

    Ok(framed)
}

/// Deserialize a message from bytes
///
/// Returns (message, bytes_consumed) where bytes_consumed includes the length prefix.
pub fn deserialize_message(buf: &[u8]) -> Result<(Message, usize)> {
    if buf.len() < 4 {
        anyhow::bail!("Buffer too small for message length (need 4 bytes, got {})", buf.len());
    }

    let msg_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + msg_len {
        anyhow::bail!("Incomplete message (need {} bytes, got {})", 4 + msg_len, buf.len());
    }

    let msg = rmp_serde::from_slice(&buf[4..4 + msg_len]).context("Failed to deserialize message")?;

    Ok((msg, 4 + msg_len))
}

/// Read a complete message from a TCP stream
pub async fn read_message(stream: &mut tokio::net::TcpStream) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read message length")?;

    let msg_len = u32::from_le_bytes(len_buf) as usize;
    if msg_len > MAX_MESSAGE_LEN {
        anyhow::bail!("Message too large: {} bytes (max 100MB)", msg_len);
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream
        .read_exact(&mut msg_buf)
        .await
        .context("Failed to read message body")?;

    let msg = rmp_serde::from_slice(&msg_buf).context("Failed to deserialize message")?;

    Ok(msg)
}

/// Write a message to a TCP stream and flush it
pub async fn write_message(stream: &mut tokio::net::TcpStream, msg: &Message) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let framed = serialize_message(msg)?;
    stream
        .write_all(&framed)
        .await
        .context("Failed to write message")?;
    stream.flush().await.context("Failed to flush stream")?;

    Ok(())
}
