/// Writes a value into an outgoing frame.
pub trait Serialize<'a> {
    /// Appends the owned part of the frame to `buf`.
    ///
    /// # Returns
    /// An optional borrowed tail that is written right after `buf`, this
    /// avoids copying large numeric payloads into the staging buffer.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
