mod align;
mod deserialize;
pub mod msg;
mod receiver;
mod sender;
mod serialize;
pub mod specs;

use tokio::io::{AsyncRead, AsyncWrite};

pub use align::Align4;
pub use deserialize::Deserialize;
pub use receiver::WireReceiver;
pub use sender::WireSender;
pub use serialize::Serialize;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Frames larger than this are rejected before any allocation happens.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Creates both `WireReceiver` and `WireSender` network channel parts.
///
/// Given a writer and reader creates and returns both ends of the communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of a wire receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (WireReceiver<R>, WireSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (WireReceiver::new(rx), WireSender::new(tx))
}
