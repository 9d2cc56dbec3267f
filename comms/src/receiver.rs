use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Align4, Deserialize, LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN};

/// The receiving end handle of the communication.
pub struct WireReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> WireReceiver<R> {
    /// Creates a new `WireReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Waits to receive a new frame and deserializes it.
    ///
    /// # Arguments
    /// * `buf` - The buffer to use for deserialization, the returned
    ///   `T`'s lifetimes will be tied to this buffer.
    ///
    /// # Returns
    /// `T` on success or an `io::Error` if reading fails, the peer announces
    /// a frame larger than `MAX_FRAME_LEN` or the frame is malformed.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut size_buf).await?;
        let len = LenType::from_be_bytes(size_buf) as usize;

        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("peer announced a {len} bytes frame, limit is {MAX_FRAME_LEN}"),
            ));
        }

        buf.clear();
        buf.resize(len.div_ceil(size_of::<B>()), B::zeroed());

        let view: &mut [u8] = bytemuck::cast_slice_mut(buf.as_mut_slice());
        let slice = &mut view[..len];
        self.rx.read_exact(slice).await?;

        T::deserialize(slice)
    }
}
