use std::io;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::session::SessionSnapshot;

/// Transport seam for session snapshots. This is the only channel through
/// which the remote peer learns of metadata, readiness, and completion.
///
/// Publishing is best-effort from the session's point of view: the caller
/// logs failures and carries on with its local state transition.
#[async_trait]
pub trait StateChannel: Send {
    async fn publish(&mut self, snapshot: SessionSnapshot) -> io::Result<()>;
}

/// In-process channel for tests and loopback transfers.
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<SessionSnapshot>,
}

impl MemoryChannel {
    /// A channel plus the receiving end the peer (or test) reads from.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<SessionSnapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MemoryChannel { tx }, rx)
    }
}

#[async_trait]
impl StateChannel for MemoryChannel {
    async fn publish(&mut self, snapshot: SessionSnapshot) -> io::Result<()> {
        self.tx
            .send(snapshot)
            .map_err(|_| io::Error::other("snapshot receiver dropped"))
    }
}

/// Length-prefixed bincode frames over any async byte stream: a big-endian
/// u32 length followed by the encoded snapshot.
pub struct FramedChannel<W> {
    writer: W,
}

impl<W> FramedChannel<W> {
    pub fn new(writer: W) -> Self {
        FramedChannel { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> StateChannel for FramedChannel<W> {
    async fn publish(&mut self, snapshot: SessionSnapshot) -> io::Result<()> {
        let encoded = bincode::serialize(&snapshot).map_err(io::Error::other)?;
        self.writer.write_u32(encoded.len() as u32).await?;
        self.writer.write_all(&encoded).await?;
        self.writer.flush().await?;
        debug!("published snapshot frame: {} bytes", encoded.len());
        Ok(())
    }
}

/// Reads one snapshot frame, the inverse of [`FramedChannel::publish`].
pub async fn read_snapshot<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<SessionSnapshot> {
    let len = reader.read_u32().await? as usize;
    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await?;
    bincode::deserialize(&buffer).map_err(io::Error::other)
}
