use anyhow::Context;

use crate::device::{COUNTER_SIZE, GpuDevice, StagingBuffer};

/// Copies the append/consume counter of a UAV back to the host.
pub trait CounterReadback<D: GpuDevice>: Sized {
    fn new(device: &D, debug_name: &str) -> anyhow::Result<Self>;

    /// Enqueues the counter copy. Does not wait for it.
    fn readback(&mut self, device: &D, buffer: &D::Buffer) -> anyhow::Result<()>;

    /// Returns the value captured by the last [`CounterReadback::readback`],
    /// blocking until its copy has completed.
    fn retrieve(&mut self) -> anyhow::Result<u32>;
}

/// Copies buffer contents back to the host through a staging buffer.
pub trait DataReadback<D: GpuDevice>: Sized {
    fn new(device: &D, size: usize, stride: usize, debug_name: &str) -> anyhow::Result<Self>;

    /// Enqueues a copy of the first `read_len` bytes of `buffer`.
    fn readback(&mut self, device: &D, buffer: &D::Buffer, read_len: usize)
    -> anyhow::Result<()>;

    /// Maps the first `read_len` bytes of the last readback.
    fn map(&mut self, read_len: usize) -> anyhow::Result<MappedRange<'_, D>>;
}

pub struct NoCounterReadback;

impl<D: GpuDevice> CounterReadback<D> for NoCounterReadback {
    fn new(_device: &D, _debug_name: &str) -> anyhow::Result<Self> {
        Ok(Self)
    }

    fn readback(&mut self, _device: &D, _buffer: &D::Buffer) -> anyhow::Result<()> {
        panic!("counter readback is not enabled by this buffer policy");
    }

    fn retrieve(&mut self) -> anyhow::Result<u32> {
        panic!("counter readback is not enabled by this buffer policy");
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterState {
    Idle,
    Pending,
    Retrieved(u32),
}

pub struct CounterReadbackUsed<D: GpuDevice> {
    staging: D::Staging,
    state: CounterState,
}

impl<D: GpuDevice> CounterReadbackUsed<D> {
    pub fn state(&self) -> CounterState {
        self.state
    }
}

impl<D: GpuDevice> CounterReadback<D> for CounterReadbackUsed<D> {
    fn new(device: &D, debug_name: &str) -> anyhow::Result<Self> {
        let staging = device
            .create_staging(COUNTER_SIZE, &format!("{debug_name} (counter readback)"))
            .context("failed to create counter staging buffer")?;
        Ok(Self {
            staging,
            state: CounterState::Idle,
        })
    }

    fn readback(&mut self, device: &D, buffer: &D::Buffer) -> anyhow::Result<()> {
        assert!(
            self.state != CounterState::Pending,
            "counter readback issued while the previous one was never retrieved"
        );
        device
            .copy_counter_to_staging(buffer, &mut self.staging)
            .context("failed to enqueue counter readback")?;
        self.state = CounterState::Pending;
        Ok(())
    }

    fn retrieve(&mut self) -> anyhow::Result<u32> {
        match self.state {
            CounterState::Idle => panic!("counter retrieved before any readback was issued"),
            CounterState::Retrieved(value) => Ok(value),
            CounterState::Pending => {
                self.staging
                    .map(COUNTER_SIZE)
                    .context("failed to map counter staging buffer")?;
                let value = bytemuck::pod_read_unaligned::<u32>(self.staging.mapped(COUNTER_SIZE));
                self.staging.unmap();
                log::trace!("retrieved counter value {value}");
                self.state = CounterState::Retrieved(value);
                Ok(value)
            }
        }
    }
}

pub struct NoDataReadback;

impl<D: GpuDevice> DataReadback<D> for NoDataReadback {
    fn new(_device: &D, _size: usize, _stride: usize, _debug_name: &str) -> anyhow::Result<Self> {
        Ok(Self)
    }

    fn readback(
        &mut self,
        _device: &D,
        _buffer: &D::Buffer,
        _read_len: usize,
    ) -> anyhow::Result<()> {
        panic!("data readback is not enabled by this buffer policy");
    }

    fn map(&mut self, _read_len: usize) -> anyhow::Result<MappedRange<'_, D>> {
        panic!("data readback is not enabled by this buffer policy");
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadbackState {
    Idle,
    Pending { len: usize },
    Mapped { len: usize },
}

pub struct DataReadbackUsed<D: GpuDevice> {
    staging: D::Staging,
    size: usize,
    stride: usize,
    state: ReadbackState,
}

impl<D: GpuDevice> DataReadbackUsed<D> {
    pub fn state(&self) -> ReadbackState {
        self.state
    }

    pub fn capacity(&self) -> usize {
        self.size * self.stride
    }

    fn unmap(&mut self) {
        debug_assert!(matches!(self.state, ReadbackState::Mapped { .. }));
        self.staging.unmap();
        self.state = ReadbackState::Idle;
    }
}

impl<D: GpuDevice> DataReadback<D> for DataReadbackUsed<D> {
    fn new(device: &D, size: usize, stride: usize, debug_name: &str) -> anyhow::Result<Self> {
        let staging = device
            .create_staging(size * stride, &format!("{debug_name} (data readback)"))
            .context("failed to create data staging buffer")?;
        Ok(Self {
            staging,
            size,
            stride,
            state: ReadbackState::Idle,
        })
    }

    fn readback(
        &mut self,
        device: &D,
        buffer: &D::Buffer,
        read_len: usize,
    ) -> anyhow::Result<()> {
        match self.state {
            ReadbackState::Idle => {}
            ReadbackState::Pending { .. } => {
                panic!("data readback issued while the previous one was never mapped")
            }
            ReadbackState::Mapped { .. } => panic!("data readback issued while still mapped"),
        }
        assert!(
            read_len <= self.capacity(),
            "readback of {read_len} bytes exceeds the {} byte staging buffer",
            self.capacity()
        );
        device
            .copy_to_staging(buffer, &mut self.staging, read_len)
            .context("failed to enqueue data readback")?;
        log::debug!("enqueued readback of {read_len} bytes");
        self.state = ReadbackState::Pending { len: read_len };
        Ok(())
    }

    fn map(&mut self, read_len: usize) -> anyhow::Result<MappedRange<'_, D>> {
        let ReadbackState::Pending { len } = self.state else {
            panic!("staging buffer mapped without a pending readback");
        };
        assert!(
            read_len <= len,
            "mapping {read_len} bytes but only {len} were read back"
        );
        self.staging
            .map(read_len)
            .context("failed to map data staging buffer")?;
        self.state = ReadbackState::Mapped { len: read_len };
        Ok(MappedRange {
            readback: self,
            len: read_len,
        })
    }
}

/// Host view of read-back bytes. Unmaps the staging buffer when dropped.
pub struct MappedRange<'a, D: GpuDevice> {
    readback: &'a mut DataReadbackUsed<D>,
    len: usize,
}

impl<D: GpuDevice> MappedRange<'_, D> {
    pub fn bytes(&self) -> &[u8] {
        self.readback.staging.mapped(self.len)
    }

    /// Whole elements of `T` contained in the mapped bytes.
    pub fn as_slice<T: bytemuck::Pod>(&self) -> &[T] {
        let bytes = self.bytes();
        let whole = bytes.len() - bytes.len() % std::mem::size_of::<T>();
        bytemuck::cast_slice(&bytes[..whole])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn unmap(self) {}
}

impl<D: GpuDevice> Drop for MappedRange<'_, D> {
    fn drop(&mut self) {
        self.readback.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::flags::BufferFlags;
    use crate::device::{BufferDesc, HostBuffer, HostDevice};

    fn counter_buffer(device: &HostDevice) -> HostBuffer {
        device
            .create_buffer(&BufferDesc {
                element_count: 16,
                stride: 4,
                flags: BufferFlags::STRUCTURED | BufferFlags::BIND_UAV | BufferFlags::UAV_COUNTER,
                debug_name: "counter",
                init_data: None,
            })
            .unwrap()
    }

    fn data_buffer(device: &HostDevice, values: &[u32]) -> HostBuffer {
        device
            .create_buffer(&BufferDesc {
                element_count: values.len(),
                stride: 4,
                flags: BufferFlags::STRUCTURED | BufferFlags::BIND_UAV | BufferFlags::UAV_OVERLAP,
                debug_name: "data",
                init_data: Some(bytemuck::cast_slice(values)),
            })
            .unwrap()
    }

    #[test]
    fn retrieve_returns_value_staged_by_readback() {
        let device = HostDevice::new();
        let mut buffer = counter_buffer(&device);
        let mut readback = CounterReadbackUsed::<HostDevice>::new(&device, "test").unwrap();

        buffer.set_counter(7);
        readback.readback(&device, &buffer).unwrap();
        buffer.set_counter(9);
        assert_eq!(readback.retrieve().unwrap(), 7);
        assert_eq!(readback.state(), CounterState::Retrieved(7));
        // a second retrieve does not observe later counter writes
        assert_eq!(readback.retrieve().unwrap(), 7);

        readback.readback(&device, &buffer).unwrap();
        assert_eq!(readback.retrieve().unwrap(), 9);
    }

    #[test]
    #[should_panic(expected = "before any readback")]
    fn retrieve_without_readback_panics() {
        let device = HostDevice::new();
        let mut readback = CounterReadbackUsed::<HostDevice>::new(&device, "test").unwrap();
        let _ = readback.retrieve();
    }

    #[test]
    #[should_panic(expected = "never retrieved")]
    fn counter_readback_twice_without_retrieve_panics() {
        let device = HostDevice::new();
        let buffer = counter_buffer(&device);
        let mut readback = CounterReadbackUsed::<HostDevice>::new(&device, "test").unwrap();
        readback.readback(&device, &buffer).unwrap();
        readback.readback(&device, &buffer).unwrap();
    }

    #[test]
    #[should_panic(expected = "not enabled")]
    fn disabled_counter_readback_panics() {
        let device = HostDevice::new();
        let buffer = counter_buffer(&device);
        let mut readback = <NoCounterReadback as CounterReadback<HostDevice>>::new(&device, "x")
            .unwrap();
        let _ = CounterReadback::<HostDevice>::readback(&mut readback, &device, &buffer);
    }

    #[test]
    fn data_readback_cycles_through_states() {
        let device = HostDevice::new();
        let values: Vec<u32> = (0..8).collect();
        let buffer = data_buffer(&device, &values);
        let mut readback = DataReadbackUsed::<HostDevice>::new(&device, 8, 4, "test").unwrap();

        readback.readback(&device, &buffer, 32).unwrap();
        assert_eq!(readback.state(), ReadbackState::Pending { len: 32 });
        {
            let mapped = readback.map(16).unwrap();
            assert_eq!(mapped.len(), 16);
            assert_eq!(mapped.as_slice::<u32>(), &[0, 1, 2, 3]);
        }
        assert_eq!(readback.state(), ReadbackState::Idle);

        readback.readback(&device, &buffer, 32).unwrap();
        let mapped = readback.map(32).unwrap();
        assert_eq!(mapped.as_slice::<u32>(), values.as_slice());
        mapped.unmap();
        assert_eq!(readback.state(), ReadbackState::Idle);
    }

    #[test]
    #[should_panic(expected = "without a pending readback")]
    fn map_without_readback_panics() {
        let device = HostDevice::new();
        let mut readback = DataReadbackUsed::<HostDevice>::new(&device, 8, 4, "test").unwrap();
        let _ = readback.map(4);
    }

    #[test]
    #[should_panic(expected = "still mapped")]
    fn readback_with_leaked_mapping_panics() {
        let device = HostDevice::new();
        let buffer = data_buffer(&device, &[1, 2, 3, 4]);
        let mut readback = DataReadbackUsed::<HostDevice>::new(&device, 4, 4, "test").unwrap();
        readback.readback(&device, &buffer, 16).unwrap();
        std::mem::forget(readback.map(16).unwrap());
        readback.readback(&device, &buffer, 16).unwrap();
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn oversized_readback_panics() {
        let device = HostDevice::new();
        let buffer = data_buffer(&device, &[1, 2, 3, 4]);
        let mut readback = DataReadbackUsed::<HostDevice>::new(&device, 4, 4, "test").unwrap();
        readback.readback(&device, &buffer, 17).unwrap();
    }

    #[test]
    #[should_panic(expected = "not enabled")]
    fn disabled_data_readback_panics() {
        let device = HostDevice::new();
        let mut readback =
            <NoDataReadback as DataReadback<HostDevice>>::new(&device, 4, 4, "x").unwrap();
        let _ = DataReadback::<HostDevice>::map(&mut readback, 4);
    }
}
