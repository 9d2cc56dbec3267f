//! The sending end of the framed wire protocol.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, Serialize};

/// The sending end handle of the communication.
pub struct WireSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> WireSender<W> {
    /// Creates a new `WireSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Sends `msg` as a single length prefixed frame.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    ///
    /// # Returns
    /// An `io::Error` if writing fails or the frame exceeds `MAX_FRAME_LEN`.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { buf, tx } = self;

        buf.clear();
        buf.resize(LEN_TYPE_SIZE, 0);

        let tail = msg.serialize(buf);
        let len = buf.len() - LEN_TYPE_SIZE + tail.map(<[_]>::len).unwrap_or_default();

        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} bytes limit"),
            ));
        }

        buf[..LEN_TYPE_SIZE].copy_from_slice(&(len as LenType).to_be_bytes());
        tx.write_all(buf).await?;

        if let Some(data) = tail {
            tx.write_all(data).await?;
        }

        tx.flush().await
    }

    /// Shuts down the write half, the peer observes an end of stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}
