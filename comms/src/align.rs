/// Receive buffer element types whose alignment is at least the alignment of `f32`.
///
/// Frames are read straight into a `Vec<B: Align4>`, so numeric payloads can be
/// reinterpreted as `&[f32]` without copying.
pub trait Align4: bytemuck::Pod {}

impl Align4 for u32 {}
impl Align4 for i32 {}
impl Align4 for u64 {}
impl Align4 for i64 {}
impl Align4 for f32 {}
impl Align4 for f64 {}
