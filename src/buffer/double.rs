use anyhow::Context;
use bytemuck::Pod;

use crate::device::GpuDevice;

use super::{policy::BufferPolicy, typed::TypedResource};

/// Resource that can be instantiated once per frame slot.
pub trait FrameResource: Sized {
    type Device: Clone;

    fn new(device: &Self::Device, size: usize, debug_name: &str) -> anyhow::Result<Self>;

    fn create_device_buffer(&mut self) -> anyhow::Result<()>;
}

impl<T: Pod, P: BufferPolicy, D: GpuDevice> FrameResource for TypedResource<T, P, D> {
    type Device = D;

    fn new(device: &D, size: usize, debug_name: &str) -> anyhow::Result<Self> {
        TypedResource::new(device, size, debug_name)
    }

    fn create_device_buffer(&mut self) -> anyhow::Result<()> {
        TypedResource::create_device_buffer(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Buffering {
    Uninitialized,
    Single,
    Double,
}

enum Slots<R> {
    Uninitialized,
    Single(R),
    Double([R; 2]),
}

/// One or two instances of a resource, alternated per frame so the CPU can
/// fill one while the GPU still reads the other.
///
/// [`DoubleBuffered::swap`] is a no-op when single-buffered, so callers drive
/// both modes through the same per-frame sequence.
pub struct DoubleBuffered<R: FrameResource> {
    device: R::Device,
    size: usize,
    debug_name: String,
    slots: Slots<R>,
    current: usize,
}

impl<R: FrameResource> DoubleBuffered<R> {
    pub fn new(device: &R::Device, size: usize, debug_name: &str) -> Self {
        Self {
            device: device.clone(),
            size,
            debug_name: debug_name.to_owned(),
            slots: Slots::Uninitialized,
            current: 0,
        }
    }

    /// Drops any previous instances and allocates fresh ones with their device
    /// buffers. On error the wrapper is left uninitialized.
    pub fn initialize(&mut self, is_double_buffered: bool) -> anyhow::Result<()> {
        self.reset();

        let first = self.create_instance(0)?;
        self.slots = if is_double_buffered {
            let second = self.create_instance(1)?;
            Slots::Double([first, second])
        } else {
            Slots::Single(first)
        };
        log::debug!(
            "initialized {:?} as {:?}",
            self.debug_name,
            self.buffering()
        );
        Ok(())
    }

    fn create_instance(&self, slot: usize) -> anyhow::Result<R> {
        let name = format!("{}[{slot}]", self.debug_name);
        let mut instance = R::new(&self.device, self.size, &name)
            .with_context(|| format!("failed to create {name:?}"))?;
        instance
            .create_device_buffer()
            .with_context(|| format!("failed to create device buffer for {name:?}"))?;
        Ok(instance)
    }

    pub fn reset(&mut self) {
        self.current = 0;
        self.slots = Slots::Uninitialized;
    }

    pub fn buffering(&self) -> Buffering {
        match self.slots {
            Slots::Uninitialized => Buffering::Uninitialized,
            Slots::Single(_) => Buffering::Single,
            Slots::Double(_) => Buffering::Double,
        }
    }

    pub fn is_double_buffered(&self) -> bool {
        matches!(self.slots, Slots::Double(_))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// # Panics
    /// If the wrapper has not been initialized.
    pub fn get(&self) -> &R {
        match &self.slots {
            Slots::Uninitialized => panic!("{:?} used before initialize", self.debug_name),
            Slots::Single(instance) => instance,
            Slots::Double(instances) => &instances[self.current],
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        match &mut self.slots {
            Slots::Uninitialized => panic!("{:?} used before initialize", self.debug_name),
            Slots::Single(instance) => instance,
            Slots::Double(instances) => &mut instances[self.current],
        }
    }

    /// The instance not returned by [`DoubleBuffered::get`].
    ///
    /// # Panics
    /// Unless the wrapper was initialized double-buffered.
    pub fn back_buffer(&self) -> &R {
        match &self.slots {
            Slots::Double(instances) => &instances[self.current ^ 1],
            _ => panic!("{:?} has no back buffer", self.debug_name),
        }
    }

    pub fn back_buffer_mut(&mut self) -> &mut R {
        match &mut self.slots {
            Slots::Double(instances) => &mut instances[self.current ^ 1],
            _ => panic!("{:?} has no back buffer", self.debug_name),
        }
    }

    /// Call once per frame boundary.
    pub fn swap(&mut self) {
        if self.is_double_buffered() {
            self.current ^= 1;
        }
    }

    pub fn current_buffer_id(&self) -> usize {
        self.current
    }
}
