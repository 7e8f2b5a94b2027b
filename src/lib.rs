//! Typed wrappers around GPU structured and typed buffers for compute work.
//!
//! A [`buffer::BufferPolicy`] picks the device flags of a resource together
//! with the readback and host-mirror strategies it carries. Resources
//! ([`buffer::StridedResource`], [`buffer::TypedResource`]) allocate through a
//! [`device::GpuDevice`], upload host data, and copy data or append counters
//! back for the CPU. [`buffer::DoubleBuffered`] alternates two instances per
//! frame.

pub mod buffer;
pub mod device;
pub mod dispatch;
pub mod vulkan;
