use std::{
    mem::size_of,
    ops::{Deref, DerefMut},
};

use anyhow::Context;
use bytemuck::Pod;

use crate::device::{BufferDesc, GpuDevice};

use super::flags::BufferFlags;

/// Host value of `T` backed by a device constant buffer.
pub struct ConstantBuffer<T: Pod, D: GpuDevice> {
    device: D,
    debug_name: String,
    host_buffer: T,
    constant_buffer: Option<D::Buffer>,
}

impl<T: Pod, D: GpuDevice> ConstantBuffer<T, D> {
    pub fn new(device: &D, debug_name: &str) -> Self {
        Self {
            device: device.clone(),
            debug_name: debug_name.to_owned(),
            host_buffer: T::zeroed(),
            constant_buffer: None,
        }
    }

    pub fn create_device_buffer(&mut self) -> anyhow::Result<()> {
        let buffer = self
            .device
            .create_buffer(&BufferDesc {
                element_count: 1,
                stride: size_of::<T>(),
                flags: BufferFlags::CONSTANT | BufferFlags::DYNAMIC,
                debug_name: &self.debug_name,
                init_data: Some(bytemuck::bytes_of(&self.host_buffer)),
            })
            .with_context(|| format!("failed to create constant buffer {:?}", self.debug_name))?;
        self.constant_buffer = Some(buffer);
        Ok(())
    }

    pub fn free_device_buffer(&mut self) {
        self.constant_buffer = None;
    }

    /// Copies the host value to the device, creating the constant buffer on
    /// first use.
    pub fn upload(&mut self) -> anyhow::Result<()> {
        let Some(buffer) = self.constant_buffer.as_mut() else {
            return self.create_device_buffer();
        };
        self.device
            .update_buffer(buffer, bytemuck::bytes_of(&self.host_buffer))
            .with_context(|| format!("failed to upload constant buffer {:?}", self.debug_name))
    }

    pub fn buffer(&self) -> Option<&D::Buffer> {
        self.constant_buffer.as_ref()
    }
}

/// [`ConstantBuffer`] with typed access to the value it will upload.
pub struct TypedConstantBuffer<T: Pod, D: GpuDevice>(ConstantBuffer<T, D>);

impl<T: Pod, D: GpuDevice> TypedConstantBuffer<T, D> {
    pub fn new(device: &D, debug_name: &str) -> Self {
        Self(ConstantBuffer::new(device, debug_name))
    }

    pub fn is_device_buffer_allocated(&self) -> bool {
        self.0.constant_buffer.is_some()
    }

    /// Stores `value` without uploading it.
    pub fn set(&mut self, value: T) -> &mut T {
        self.0.host_buffer = value;
        &mut self.0.host_buffer
    }

    pub fn host_data(&self) -> &T {
        &self.0.host_buffer
    }

    pub fn host_data_mut(&mut self) -> &mut T {
        &mut self.0.host_buffer
    }
}

impl<T: Pod, D: GpuDevice> Deref for TypedConstantBuffer<T, D> {
    type Target = ConstantBuffer<T, D>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Pod, D: GpuDevice> DerefMut for TypedConstantBuffer<T, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use bytemuck::Zeroable;

    use super::*;
    use crate::device::HostDevice;

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct SimParams {
        delta_time: f32,
        particle_count: u32,
        gravity: [f32; 2],
    }

    #[test]
    fn set_stores_without_uploading() {
        let device = HostDevice::new();
        let mut params = TypedConstantBuffer::<SimParams, _>::new(&device, "params");
        params.create_device_buffer().unwrap();
        assert!(params.is_device_buffer_allocated());

        params.set(SimParams {
            delta_time: 0.016,
            particle_count: 128,
            gravity: [0.0, -9.8],
        });
        let device_bytes = params.buffer().unwrap().contents();
        assert!(device_bytes.iter().all(|b| *b == 0));

        params.upload().unwrap();
        let uploaded: &SimParams =
            bytemuck::from_bytes(&params.buffer().unwrap().contents()[..size_of::<SimParams>()]);
        assert_eq!(uploaded, params.host_data());
    }

    #[test]
    fn upload_creates_device_buffer_on_first_use() {
        let device = HostDevice::new();
        let mut params = TypedConstantBuffer::<SimParams, _>::new(&device, "params");
        assert!(!params.is_device_buffer_allocated());

        params.host_data_mut().particle_count = 7;
        params.upload().unwrap();
        assert!(params.is_device_buffer_allocated());
        let uploaded: &SimParams = bytemuck::from_bytes(params.buffer().unwrap().contents());
        assert_eq!(uploaded.particle_count, 7);

        params.free_device_buffer();
        assert!(!params.is_device_buffer_allocated());
    }
}
