//! Device collaborator seam.
//!
//! Resources in [`crate::buffer`] never talk to a graphics API directly. They
//! allocate, upload and copy through a [`GpuDevice`], which hands back opaque
//! [`GpuBuffer`] and [`StagingBuffer`] objects. Dropping one of those objects
//! releases the underlying allocation.

pub mod host;
pub mod vulkan;

pub use host::{HostBuffer, HostDevice, HostStaging};
pub use vulkan::{VulkanBuffer, VulkanDevice, VulkanStaging};

use crate::buffer::flags::{BufferFlags, PLATFORM_ALIGNMENT, align_up};

/// Size in bytes of an append/consume counter.
pub const COUNTER_SIZE: usize = std::mem::size_of::<u32>();

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub element_count: usize,
    pub stride: usize,
    pub flags: BufferFlags,
    pub debug_name: &'a str,
    pub init_data: Option<&'a [u8]>,
}

impl BufferDesc<'_> {
    /// Logical size of the buffer contents.
    pub fn byte_len(&self) -> usize {
        self.element_count * self.stride
    }

    /// Size of the backing allocation, padded so aligned uploads fit.
    pub fn allocation_len(&self) -> usize {
        align_up(self.byte_len().max(1), PLATFORM_ALIGNMENT)
    }
}

pub trait GpuDevice: Clone {
    type Buffer: GpuBuffer;
    type Staging: StagingBuffer;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> anyhow::Result<Self::Buffer>;

    /// Writes `data` at the start of `dst`.
    fn update_buffer(&self, dst: &mut Self::Buffer, data: &[u8]) -> anyhow::Result<()>;

    fn create_staging(&self, byte_len: usize, debug_name: &str) -> anyhow::Result<Self::Staging>;

    /// Enqueues a copy of the first `byte_len` bytes of `src` into `dst`.
    fn copy_to_staging(
        &self,
        src: &Self::Buffer,
        dst: &mut Self::Staging,
        byte_len: usize,
    ) -> anyhow::Result<()>;

    /// Enqueues a copy of the hidden counter of `src` into the first four
    /// bytes of `dst`.
    fn copy_counter_to_staging(
        &self,
        src: &Self::Buffer,
        dst: &mut Self::Staging,
    ) -> anyhow::Result<()>;
}

pub trait GpuBuffer {
    type Handle: Copy;
    type View: Copy;

    fn handle(&self) -> Self::Handle;
    fn byte_len(&self) -> usize;
    fn flags(&self) -> BufferFlags;
    /// Read-only shader view, `None` unless created with `BIND_SRV`.
    fn srv(&self) -> Option<Self::View>;
    /// Read-write shader view, `None` unless created with `BIND_UAV`.
    fn uav(&self) -> Option<Self::View>;
    /// View of the append/consume counter, `None` unless created with
    /// `UAV_COUNTER`.
    fn counter(&self) -> Option<Self::View>;
}

pub trait StagingBuffer {
    fn byte_len(&self) -> usize;

    /// Makes the first `byte_len` bytes visible to the host, blocking until
    /// the copy that filled them has completed.
    fn map(&mut self, byte_len: usize) -> anyhow::Result<()>;

    /// Bytes made visible by the last [`StagingBuffer::map`].
    fn mapped(&self, byte_len: usize) -> &[u8];

    fn unmap(&mut self);
}
