// Pub/sub relay - live-tail fan-out of resolved messages
//
// DESIGN: Redis PUBLISH on a channel named after the tenant's index.
// A single writer task owns the connection; publishers hand it events over
// a bounded channel, so no socket handle is shared between tasks.
//
// Relay is best-effort: a full channel, a dead connection or a Redis error
// loses the event (logged), never the message itself.
//
// Wire format (RESP):
//   *3\r\n$7\r\nPUBLISH\r\n$<n>\r\n<channel>\r\n$<n>\r\n<event json>\r\n

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const LOG_MESSAGE_EVENT: &str = "log_message";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayEvent {
    pub tenant: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub log_type: String,
    pub message: String,
}

impl RelayEvent {
    pub fn log_message(tenant: &str, log_type: &str, message: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            kind: LOG_MESSAGE_EVENT,
            log_type: log_type.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
pub trait Relay: Send + Sync {
    async fn publish(&self, channel: &str, event: &RelayEvent) -> Result<()>;
}

struct PublishCommand {
    channel: String,
    payload: String,
}

pub struct RedisRelay {
    tx: mpsc::Sender<PublishCommand>,
}

impl RedisRelay {
    /// Spawn the writer task. The connection is opened lazily on the first
    /// publish and reopened after any I/O error.
    pub fn spawn(address: String, capacity: usize, io_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_writer(address, rx, io_timeout));
        Self { tx }
    }
}

#[async_trait]
impl Relay for RedisRelay {
    async fn publish(&self, channel: &str, event: &RelayEvent) -> Result<()> {
        let command = PublishCommand {
            channel: channel.to_string(),
            payload: serde_json::to_string(event)?,
        };
        self.tx
            .try_send(command)
            .map_err(|e| anyhow::anyhow!("relay queue rejected event: {}", e))
    }
}

async fn run_writer(address: String, mut rx: mpsc::Receiver<PublishCommand>, io_timeout: Duration) {
    let mut conn: Option<BufStream<TcpStream>> = None;

    while let Some(command) = rx.recv().await {
        if let Err(e) = deliver(&address, &mut conn, &command, io_timeout).await {
            tracing::warn!(redis = %address, channel = %command.channel, "relay publish failed: {:#}", e);
            conn = None;
        }
    }

    tracing::debug!("relay writer stopped");
}

async fn deliver(
    address: &str,
    conn: &mut Option<BufStream<TcpStream>>,
    command: &PublishCommand,
    io_timeout: Duration,
) -> Result<()> {
    if conn.is_none() {
        let stream = timeout(io_timeout, TcpStream::connect(address)).await??;
        tracing::info!(redis = %address, "relay connected");
        *conn = Some(BufStream::new(stream));
    }
    let Some(stream) = conn.as_mut() else {
        anyhow::bail!("no redis connection");
    };

    let frame = encode_publish(&command.channel, &command.payload);
    timeout(io_timeout, async {
        stream.write_all(&frame).await?;
        stream.flush().await
    })
    .await??;

    // PUBLISH answers with an integer (":<receivers>") or an error ("-ERR ...")
    let mut reply = String::new();
    let read = timeout(io_timeout, stream.read_line(&mut reply)).await??;
    if read == 0 {
        anyhow::bail!("redis closed the connection");
    }
    if let Some(err) = reply.strip_prefix('-') {
        anyhow::bail!("redis error: {}", err.trim_end());
    }

    Ok(())
}

/// Encode PUBLISH as a RESP array of bulk strings
pub fn encode_publish(channel: &str, payload: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(32 + channel.len() + payload.len());
    frame.extend_from_slice(b"*3\r\n");
    for part in ["PUBLISH", channel, payload] {
        frame.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
        frame.extend_from_slice(part.as_bytes());
        frame.extend_from_slice(b"\r\n");
    }
    frame
}
