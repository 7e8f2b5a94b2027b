use std::{
    borrow::Cow,
    marker::PhantomData,
    mem::{align_of, size_of},
    ops::{Index, IndexMut},
};

use anyhow::Context;
use bytemuck::Pod;

use crate::device::{BufferDesc, GpuBuffer, GpuDevice};

use super::{
    flags::{PLATFORM_ALIGNMENT, align_up},
    host::{HOST_ALIGNMENT, HostData},
    policy::BufferPolicy,
    readback::{CounterReadback, DataReadback, MappedRange},
};

/// Device buffer of `size` elements of `T`, paired with an optional host
/// mirror.
///
/// Construction only prepares the host side. The device buffer is created and
/// released with [`TypedResource::create_device_buffer`] and
/// [`TypedResource::free_device_buffer`], so it can be dropped and rebuilt
/// (device reset, streaming) while the host mirror and its contents survive.
pub struct TypedResource<T: Pod, P: BufferPolicy, D: GpuDevice> {
    device: D,
    size: usize,
    debug_name: String,
    buffer: Option<D::Buffer>,
    counter_readback: P::CounterReadback<D>,
    data_readback: P::DataReadback<D>,
    host_data: P::HostData,
    _marker: PhantomData<(T, P)>,
}

impl<T: Pod, P: BufferPolicy, D: GpuDevice> TypedResource<T, P, D> {
    pub fn new(device: &D, size: usize, debug_name: &str) -> anyhow::Result<Self> {
        assert!(size_of::<T>() > 0, "zero-sized element type");
        assert!(
            align_of::<T>() <= HOST_ALIGNMENT,
            "element alignment {} exceeds host mirror alignment",
            align_of::<T>()
        );
        let counter_readback =
            <P::CounterReadback<D> as CounterReadback<D>>::new(device, debug_name)?;
        let data_readback =
            <P::DataReadback<D> as DataReadback<D>>::new(device, size, size_of::<T>(), debug_name)?;
        let mut host_data = P::HostData::default();
        host_data.resize(size * size_of::<T>());

        Ok(Self {
            device: device.clone(),
            size,
            debug_name: debug_name.to_owned(),
            buffer: None,
            counter_readback,
            data_readback,
            host_data,
            _marker: PhantomData,
        })
    }

    /// Allocates the device buffer, replacing any existing one.
    pub fn create_device_buffer(&mut self) -> anyhow::Result<()> {
        if self.buffer.take().is_some() {
            log::debug!("recreating device buffer {:?}", self.debug_name);
        }
        let buffer = self
            .device
            .create_buffer(&BufferDesc {
                element_count: self.size,
                stride: size_of::<T>(),
                flags: P::FLAGS,
                debug_name: &self.debug_name,
                init_data: None,
            })
            .with_context(|| {
                format!(
                    "failed to create {} buffer {:?}",
                    P::NAME,
                    self.debug_name
                )
            })?;
        log::trace!(
            "allocated device buffer {:?}: {} x {} bytes",
            self.debug_name,
            self.size,
            size_of::<T>()
        );
        self.buffer = Some(buffer);
        Ok(())
    }

    pub fn free_device_buffer(&mut self) {
        if self.buffer.take().is_some() {
            log::trace!("released device buffer {:?}", self.debug_name);
        }
    }

    pub fn is_device_buffer_allocated(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn buffer(&self) -> Option<&D::Buffer> {
        self.buffer.as_ref()
    }

    pub fn buffer_mut(&mut self) -> Option<&mut D::Buffer> {
        self.buffer.as_mut()
    }

    pub fn uav(&self) -> Option<<D::Buffer as GpuBuffer>::View> {
        self.buffer.as_ref().and_then(GpuBuffer::uav)
    }

    pub fn srv(&self) -> Option<<D::Buffer as GpuBuffer>::View> {
        self.buffer.as_ref().and_then(GpuBuffer::srv)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Host mirror viewed as elements.
    ///
    /// # Panics
    /// If the policy carries no host mirror.
    pub fn as_slice(&self) -> &[T] {
        let Some(bytes) = self.host_data.get() else {
            panic!("{} buffers have no host mirror", P::NAME);
        };
        bytemuck::cast_slice(bytes.as_bytes())
    }

    /// # Panics
    /// If the policy carries no host mirror.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let Some(bytes) = self.host_data.get_mut() else {
            panic!("{} buffers have no host mirror", P::NAME);
        };
        bytemuck::cast_slice_mut(bytes.as_bytes_mut())
    }

    /// Element `index` of the host mirror without a bounds check in release
    /// builds.
    ///
    /// # Safety
    /// `index` must be less than [`TypedResource::size`].
    pub unsafe fn get_unchecked(&self, index: usize) -> &T {
        debug_assert!(index < self.size, "index {index} out of {}", self.size);
        let elements = self.as_slice();
        // SAFETY: the mirror holds exactly `size` elements and the caller
        // guarantees `index < size`.
        unsafe { elements.get_unchecked(index) }
    }

    /// # Safety
    /// `index` must be less than [`TypedResource::size`].
    pub unsafe fn get_unchecked_mut(&mut self, index: usize) -> &mut T {
        debug_assert!(index < self.size, "index {index} out of {}", self.size);
        let elements = self.as_mut_slice();
        // SAFETY: see `get_unchecked`.
        unsafe { elements.get_unchecked_mut(index) }
    }

    /// Uploads the whole host mirror.
    pub fn upload_host_data(&mut self) -> anyhow::Result<()> {
        let Some(bytes) = self.host_data.get() else {
            panic!("{} buffers have no host mirror", P::NAME);
        };
        let buffer = device_buffer(&mut self.buffer, &self.debug_name);
        self.device
            .update_buffer(buffer, bytes.as_bytes())
            .with_context(|| format!("failed to upload host data of {:?}", self.debug_name))
    }

    /// Uploads the first `count` elements of `data`.
    pub fn update_buffer_content(&mut self, data: &[T], count: usize) -> anyhow::Result<()> {
        assert!(
            count <= self.size && count <= data.len(),
            "upload of {count} elements out of range"
        );
        if count == 0 {
            log::warn!("empty upload to {:?}, buffer content unchanged", self.debug_name);
            return Ok(());
        }
        let buffer = device_buffer(&mut self.buffer, &self.debug_name);
        self.device
            .update_buffer(buffer, bytemuck::cast_slice(&data[..count]))
            .context("failed to update buffer content")
    }

    /// Uploads the first `count` elements of `data`, rounding the byte count
    /// up to [`PLATFORM_ALIGNMENT`]. Bytes past the end of `data` are zero.
    pub fn update_buffer_content_aligned(
        &mut self,
        data: &[T],
        count: usize,
    ) -> anyhow::Result<()> {
        assert!(
            count <= self.size && count <= data.len(),
            "upload of {count} elements out of range"
        );
        if count == 0 {
            log::warn!("empty upload to {:?}, buffer content unchanged", self.debug_name);
            return Ok(());
        }
        let aligned_len = align_up(count * size_of::<T>(), PLATFORM_ALIGNMENT);
        let source: &[u8] = bytemuck::cast_slice(data);
        let bytes = if source.len() >= aligned_len {
            Cow::Borrowed(&source[..aligned_len])
        } else {
            let mut padded = source.to_vec();
            padded.resize(aligned_len, 0);
            Cow::Owned(padded)
        };
        let buffer = device_buffer(&mut self.buffer, &self.debug_name);
        self.device
            .update_buffer(buffer, &bytes)
            .context("failed to update buffer content")
    }

    pub fn readback_counter(&mut self) -> anyhow::Result<()> {
        let buffer = device_buffer(&mut self.buffer, &self.debug_name);
        self.counter_readback.readback(&self.device, buffer)
    }

    pub fn retrieve_counter(&mut self) -> anyhow::Result<u32> {
        self.counter_readback.retrieve()
    }

    /// Enqueues a copy of the first `read_len` bytes of the device buffer.
    pub fn readback(&mut self, read_len: usize) -> anyhow::Result<()> {
        let buffer = device_buffer(&mut self.buffer, &self.debug_name);
        self.data_readback.readback(&self.device, buffer, read_len)
    }

    /// Maps the first `read_len` bytes of the last readback; view them with
    /// [`MappedRange::as_slice`].
    pub fn map(&mut self, read_len: usize) -> anyhow::Result<MappedRange<'_, D>> {
        self.data_readback.map(read_len)
    }
}

fn device_buffer<'a, B>(buffer: &'a mut Option<B>, debug_name: &str) -> &'a mut B {
    match buffer {
        Some(buffer) => buffer,
        None => panic!("device buffer {debug_name:?} is not allocated"),
    }
}

impl<T: Pod, P: BufferPolicy, D: GpuDevice> Index<usize> for TypedResource<T, P, D> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

impl<T: Pod, P: BufferPolicy, D: GpuDevice> IndexMut<usize> for TypedResource<T, P, D> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.as_mut_slice()[index]
    }
}
