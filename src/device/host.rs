//! CPU emulation of the device collaborator.
//!
//! Copies complete immediately, so every readback is ready by the time it is
//! mapped. Buffers expose their contents and counter so callers can stand in
//! for compute work between upload and readback.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use anyhow::{bail, ensure};

use crate::buffer::{flags::BufferFlags, host::AlignedBytes};

use super::{BufferDesc, COUNTER_SIZE, GpuBuffer, GpuDevice, StagingBuffer};

#[derive(Default)]
struct Ledger {
    allocated: AtomicUsize,
    next_id: AtomicU64,
    budget: Option<usize>,
}

/// Keeps `len` bytes charged to the ledger until dropped.
struct Reservation {
    ledger: Arc<Ledger>,
    len: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.ledger.allocated.fetch_sub(self.len, Ordering::Relaxed);
    }
}

#[derive(Clone, Default)]
pub struct HostDevice {
    ledger: Arc<Ledger>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocations that would push the live total past `bytes` fail.
    pub fn with_memory_budget(bytes: usize) -> Self {
        Self {
            ledger: Arc::new(Ledger {
                budget: Some(bytes),
                ..Default::default()
            }),
        }
    }

    /// Bytes held by live buffers and staging buffers.
    pub fn allocated_bytes(&self) -> usize {
        self.ledger.allocated.load(Ordering::Relaxed)
    }

    fn reserve(&self, len: usize, debug_name: &str) -> anyhow::Result<(u64, Reservation)> {
        let previous = self.ledger.allocated.fetch_add(len, Ordering::Relaxed);
        if let Some(budget) = self.ledger.budget
            && previous + len > budget
        {
            self.ledger.allocated.fetch_sub(len, Ordering::Relaxed);
            bail!(
                "out of device memory allocating {len} bytes for {debug_name:?} ({previous} of {budget} in use)"
            );
        }
        let id = self.ledger.next_id.fetch_add(1, Ordering::Relaxed);
        Ok((
            id,
            Reservation {
                ledger: self.ledger.clone(),
                len,
            },
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostView {
    ReadOnly(u64),
    ReadWrite(u64),
    Counter(u64),
}

pub struct HostBuffer {
    id: u64,
    data: AlignedBytes,
    logical_len: usize,
    counter: u32,
    flags: BufferFlags,
    _reservation: Reservation,
}

impl HostBuffer {
    /// Contents covering `element_count * stride` bytes.
    pub fn contents(&self) -> &[u8] {
        &self.data.as_bytes()[..self.logical_len]
    }

    /// Mutable contents, used to stand in for shader writes.
    pub fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.data.as_bytes_mut()[..self.logical_len]
    }

    pub fn counter_value(&self) -> u32 {
        self.counter
    }

    pub fn set_counter(&mut self, value: u32) {
        assert!(
            self.flags.contains(BufferFlags::UAV_COUNTER),
            "buffer was created without a counter"
        );
        self.counter = value;
    }
}

impl GpuBuffer for HostBuffer {
    type Handle = u64;
    type View = HostView;

    fn handle(&self) -> u64 {
        self.id
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn flags(&self) -> BufferFlags {
        self.flags
    }

    fn srv(&self) -> Option<HostView> {
        self.flags
            .contains(BufferFlags::BIND_SRV)
            .then_some(HostView::ReadOnly(self.id))
    }

    fn uav(&self) -> Option<HostView> {
        self.flags
            .contains(BufferFlags::BIND_UAV)
            .then_some(HostView::ReadWrite(self.id))
    }

    fn counter(&self) -> Option<HostView> {
        self.flags
            .contains(BufferFlags::UAV_COUNTER)
            .then_some(HostView::Counter(self.id))
    }
}

pub struct HostStaging {
    data: AlignedBytes,
    mapped: bool,
    _reservation: Reservation,
}

impl StagingBuffer for HostStaging {
    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn map(&mut self, byte_len: usize) -> anyhow::Result<()> {
        ensure!(
            byte_len <= self.data.len(),
            "cannot map {byte_len} bytes of a {} byte staging buffer",
            self.data.len()
        );
        self.mapped = true;
        Ok(())
    }

    fn mapped(&self, byte_len: usize) -> &[u8] {
        assert!(self.mapped, "staging buffer is not mapped");
        &self.data.as_bytes()[..byte_len]
    }

    fn unmap(&mut self) {
        self.mapped = false;
    }
}

impl GpuDevice for HostDevice {
    type Buffer = HostBuffer;
    type Staging = HostStaging;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> anyhow::Result<HostBuffer> {
        let len = desc.allocation_len();
        let (id, reservation) = self.reserve(len, desc.debug_name)?;
        let mut data = AlignedBytes::zeroed(len);
        if let Some(init) = desc.init_data {
            ensure!(
                init.len() <= len,
                "initial data of {} bytes does not fit {:?}",
                init.len(),
                desc.debug_name
            );
            data.as_bytes_mut()[..init.len()].copy_from_slice(init);
        }
        log::trace!("host buffer {id} {:?}: {len} bytes", desc.debug_name);
        Ok(HostBuffer {
            id,
            data,
            logical_len: desc.byte_len(),
            counter: 0,
            flags: desc.flags,
            _reservation: reservation,
        })
    }

    fn update_buffer(&self, dst: &mut HostBuffer, data: &[u8]) -> anyhow::Result<()> {
        ensure!(
            data.len() <= dst.byte_len(),
            "update of {} bytes overruns a {} byte buffer",
            data.len(),
            dst.byte_len()
        );
        dst.data.as_bytes_mut()[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn create_staging(&self, byte_len: usize, debug_name: &str) -> anyhow::Result<HostStaging> {
        let (_, reservation) = self.reserve(byte_len, debug_name)?;
        Ok(HostStaging {
            data: AlignedBytes::zeroed(byte_len),
            mapped: false,
            _reservation: reservation,
        })
    }

    fn copy_to_staging(
        &self,
        src: &HostBuffer,
        dst: &mut HostStaging,
        byte_len: usize,
    ) -> anyhow::Result<()> {
        ensure!(
            byte_len <= src.byte_len() && byte_len <= dst.byte_len(),
            "copy of {byte_len} bytes out of range"
        );
        ensure!(!dst.mapped, "copy into a mapped staging buffer");
        dst.data.as_bytes_mut()[..byte_len].copy_from_slice(&src.data.as_bytes()[..byte_len]);
        Ok(())
    }

    fn copy_counter_to_staging(
        &self,
        src: &HostBuffer,
        dst: &mut HostStaging,
    ) -> anyhow::Result<()> {
        ensure!(
            src.flags.contains(BufferFlags::UAV_COUNTER),
            "buffer {} has no counter to copy",
            src.id
        );
        ensure!(dst.byte_len() >= COUNTER_SIZE, "counter staging buffer too small");
        dst.data.as_bytes_mut()[..COUNTER_SIZE].copy_from_slice(&src.counter.to_ne_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(element_count: usize, flags: BufferFlags) -> BufferDesc<'static> {
        BufferDesc {
            element_count,
            stride: 4,
            flags,
            debug_name: "test",
            init_data: None,
        }
    }

    #[test]
    fn allocations_are_padded_and_released_on_drop() {
        let device = HostDevice::new();
        let buffer = device.create_buffer(&desc(3, BufferFlags::BIND_SRV)).unwrap();
        assert_eq!(buffer.byte_len(), 16);
        assert_eq!(buffer.contents().len(), 12);
        assert_eq!(device.allocated_bytes(), 16);
        drop(buffer);
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn views_follow_flags() {
        let device = HostDevice::new();
        let buffer = device.create_buffer(&desc(4, BufferFlags::BIND_SRV)).unwrap();
        assert!(buffer.srv().is_some());
        assert!(buffer.uav().is_none());
        assert!(buffer.counter().is_none());
    }

    #[test]
    fn budget_rejects_allocations_past_limit() {
        let device = HostDevice::with_memory_budget(32);
        let _first = device.create_buffer(&desc(8, BufferFlags::BIND_SRV)).unwrap();
        let err = device
            .create_buffer(&desc(8, BufferFlags::BIND_SRV))
            .err()
            .unwrap();
        assert!(err.to_string().contains("out of device memory"));
        assert_eq!(device.allocated_bytes(), 32);
    }

    #[test]
    fn update_past_allocation_fails() {
        let device = HostDevice::new();
        let mut buffer = device.create_buffer(&desc(4, BufferFlags::BIND_SRV)).unwrap();
        assert!(device.update_buffer(&mut buffer, &[0; 17]).is_err());
        assert!(device.update_buffer(&mut buffer, &[1; 16]).is_ok());
    }

    #[test]
    fn counter_lives_beside_the_data() {
        let device = HostDevice::new();
        let flags = BufferFlags::BIND_UAV | BufferFlags::UAV_COUNTER;
        let mut buffer = device.create_buffer(&desc(4, flags)).unwrap();
        assert_eq!(buffer.flags(), flags);
        assert_eq!(buffer.counter_value(), 0);

        buffer.set_counter(12);
        assert_eq!(buffer.counter_value(), 12);
        assert!(buffer.contents().iter().all(|b| *b == 0));
    }

    #[test]
    #[should_panic(expected = "without a counter")]
    fn setting_missing_counter_panics() {
        let device = HostDevice::new();
        let mut buffer = device.create_buffer(&desc(4, BufferFlags::BIND_UAV)).unwrap();
        buffer.set_counter(1);
    }

    #[test]
    fn counter_copy_requires_counter_flag() {
        let device = HostDevice::new();
        let buffer = device.create_buffer(&desc(4, BufferFlags::BIND_UAV)).unwrap();
        let mut staging = device.create_staging(4, "staging").unwrap();
        assert!(device.copy_counter_to_staging(&buffer, &mut staging).is_err());
    }
}
