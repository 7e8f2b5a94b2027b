use std::marker::PhantomData;

use anyhow::Context;

use crate::device::{BufferDesc, GpuBuffer, GpuDevice};

use super::{
    policy::BufferPolicy,
    readback::{CounterReadback, DataReadback, MappedRange},
};

/// Device buffer of `size` elements whose stride is only known at runtime.
///
/// The device buffer is allocated on construction and lives as long as the
/// resource.
pub struct StridedResource<P: BufferPolicy, D: GpuDevice> {
    device: D,
    size: usize,
    stride: usize,
    buffer: D::Buffer,
    counter_readback: P::CounterReadback<D>,
    data_readback: P::DataReadback<D>,
    _policy: PhantomData<P>,
}

impl<P: BufferPolicy, D: GpuDevice> StridedResource<P, D> {
    pub fn new(device: &D, stride: usize, size: usize, debug_name: &str) -> anyhow::Result<Self> {
        assert!(stride > 0, "structured buffer stride must be non-zero");
        let buffer = device
            .create_buffer(&BufferDesc {
                element_count: size,
                stride,
                flags: P::FLAGS,
                debug_name,
                init_data: None,
            })
            .with_context(|| format!("failed to create {} buffer {debug_name:?}", P::NAME))?;
        let counter_readback =
            <P::CounterReadback<D> as CounterReadback<D>>::new(device, debug_name)?;
        let data_readback =
            <P::DataReadback<D> as DataReadback<D>>::new(device, size, stride, debug_name)?;
        log::debug!(
            "created {} buffer {debug_name:?}: {size} x {stride} bytes",
            P::NAME
        );

        Ok(Self {
            device: device.clone(),
            size,
            stride,
            buffer,
            counter_readback,
            data_readback,
            _policy: PhantomData,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn uav(&self) -> Option<<D::Buffer as GpuBuffer>::View> {
        self.buffer.uav()
    }

    pub fn srv(&self) -> Option<<D::Buffer as GpuBuffer>::View> {
        self.buffer.srv()
    }

    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut D::Buffer {
        &mut self.buffer
    }

    /// Uploads the first `count` elements of `data`.
    pub fn update_buffer_content(&mut self, data: &[u8], count: usize) -> anyhow::Result<()> {
        assert!(
            count <= self.size,
            "upload of {count} elements into a {} element buffer",
            self.size
        );
        if count == 0 {
            log::warn!("empty upload, buffer content unchanged");
            return Ok(());
        }
        let byte_len = count * self.stride;
        assert!(
            data.len() >= byte_len,
            "upload of {count} elements needs {byte_len} bytes, got {}",
            data.len()
        );
        self.device
            .update_buffer(&mut self.buffer, &data[..byte_len])
            .context("failed to update buffer content")
    }

    pub fn readback_counter(&mut self) -> anyhow::Result<()> {
        self.counter_readback.readback(&self.device, &self.buffer)
    }

    pub fn retrieve_counter(&mut self) -> anyhow::Result<u32> {
        self.counter_readback.retrieve()
    }

    /// Enqueues a copy of the whole buffer into the readback staging buffer.
    pub fn readback(&mut self) -> anyhow::Result<()> {
        let len = self.size * self.stride;
        self.data_readback.readback(&self.device, &self.buffer, len)
    }

    pub fn map(&mut self) -> anyhow::Result<MappedRange<'_, D>> {
        self.data_readback.map(self.size * self.stride)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::policy::{
        Dynamic, DynamicTyped, ReadWrite, ReadWriteAppend, ReadWriteReadback, ReadWriteTyped,
    };
    use crate::device::HostDevice;

    fn assert_full_upload_fits<P: BufferPolicy>() {
        let device = HostDevice::new();
        let mut resource = StridedResource::<P, _>::new(&device, 12, 5, P::NAME).unwrap();
        assert_eq!(resource.size(), 5, "{}", P::NAME);
        assert_eq!(resource.buffer().flags(), P::FLAGS, "{}", P::NAME);

        let data: Vec<u8> = (0..60).collect();
        resource.update_buffer_content(&data, 5).unwrap();
        assert_eq!(resource.buffer().contents(), data.as_slice(), "{}", P::NAME);
    }

    #[test]
    fn every_policy_accepts_uploads_up_to_its_size() {
        assert_full_upload_fits::<ReadWrite>();
        assert_full_upload_fits::<ReadWriteReadback>();
        assert_full_upload_fits::<ReadWriteAppend>();
        assert_full_upload_fits::<Dynamic>();
        assert_full_upload_fits::<DynamicTyped>();
        assert_full_upload_fits::<ReadWriteTyped>();
    }

    #[test]
    fn reports_construction_size_and_stride() {
        let device = HostDevice::new();
        let resource = StridedResource::<ReadWrite, _>::new(&device, 12, 10, "rw").unwrap();
        assert_eq!(resource.size(), 10);
        assert_eq!(resource.stride(), 12);
        assert!(resource.buffer().byte_len() >= 120);
        assert!(resource.uav().is_some());
        assert!(resource.srv().is_some());
    }

    #[test]
    fn accepts_full_upload() {
        let device = HostDevice::new();
        let mut resource = StridedResource::<ReadWrite, _>::new(&device, 8, 4, "rw").unwrap();
        let data: Vec<u8> = (0..32).collect();
        resource.update_buffer_content(&data, 4).unwrap();
        assert_eq!(resource.buffer().contents(), data.as_slice());
    }

    #[test]
    fn partial_upload_scales_count_by_stride() {
        let device = HostDevice::new();
        let mut resource = StridedResource::<ReadWrite, _>::new(&device, 8, 4, "rw").unwrap();
        resource.update_buffer_content(&[0xFF; 32], 1).unwrap();
        let contents = resource.buffer().contents();
        assert_eq!(&contents[..8], &[0xFF; 8]);
        assert_eq!(&contents[8..], &[0; 24]);
    }

    #[test]
    #[should_panic(expected = "element buffer")]
    fn upload_past_size_panics() {
        let device = HostDevice::new();
        let mut resource = StridedResource::<ReadWrite, _>::new(&device, 4, 4, "rw").unwrap();
        let _ = resource.update_buffer_content(&[0; 20], 5);
    }

    #[test]
    fn readback_returns_uploaded_bytes() {
        let device = HostDevice::new();
        let mut resource =
            StridedResource::<ReadWriteReadback, _>::new(&device, 4, 64, "readback").unwrap();
        let values: Vec<u32> = (0..64).collect();
        resource
            .update_buffer_content(bytemuck::cast_slice(&values), 64)
            .unwrap();

        for _ in 0..2 {
            resource.readback().unwrap();
            let mapped = resource.map().unwrap();
            assert_eq!(mapped.as_slice::<u32>(), values.as_slice());
            mapped.unmap();
        }
    }

    #[test]
    fn append_counter_round_trip() {
        let device = HostDevice::new();
        let mut resource =
            StridedResource::<ReadWriteAppend, _>::new(&device, 16, 32, "append").unwrap();
        resource.buffer_mut().set_counter(21);
        assert_eq!(resource.buffer().counter_value(), 21);
        resource.readback_counter().unwrap();
        assert_eq!(resource.retrieve_counter().unwrap(), 21);
    }

    #[test]
    #[should_panic(expected = "not enabled")]
    fn readback_on_policy_without_staging_panics() {
        let device = HostDevice::new();
        let mut resource = StridedResource::<ReadWrite, _>::new(&device, 4, 4, "rw").unwrap();
        let _ = resource.readback();
    }

    #[test]
    fn allocation_failure_is_propagated() {
        let device = HostDevice::with_memory_budget(64);
        let err = StridedResource::<ReadWrite, _>::new(&device, 4, 32, "big")
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("out of device memory"));
    }
}
