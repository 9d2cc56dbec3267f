use std::io;

/// Builds a value borrowing from a received frame.
pub trait Deserialize<'a>: Sized {
    /// Parses `buf`, the body of a single frame without its length prefix.
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
