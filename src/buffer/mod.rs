pub mod constant;
pub mod double;
pub mod flags;
pub mod host;
pub mod policy;
pub mod readback;
pub mod strided;
pub mod typed;

pub use constant::{ConstantBuffer, TypedConstantBuffer};
pub use double::{Buffering, DoubleBuffered, FrameResource};
pub use flags::{BufferFlags, PLATFORM_ALIGNMENT};
pub use policy::{
    BufferPolicy, Dynamic, DynamicTyped, ReadWrite, ReadWriteAppend, ReadWriteReadback,
    ReadWriteTyped,
};
pub use readback::MappedRange;
pub use strided::StridedResource;
pub use typed::TypedResource;
