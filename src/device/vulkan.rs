//! Vulkan backend built on `ash` and `vk-mem`.
//!
//! Every transfer is recorded into a one-shot command buffer and submitted to
//! the compute queue with its own fence. Staging buffers are persistently
//! mapped, so mapping one only waits on the fence of the copy that filled it.

use std::{
    mem::ManuallyDrop,
    ops::Deref,
    ptr,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use ash::vk;
use smallvec::SmallVec;
use vk_mem::Alloc;

use crate::{
    buffer::flags::BufferFlags,
    vulkan::{DeviceContext, VulkanContext},
};

use super::{BufferDesc, COUNTER_SIZE, GpuBuffer, GpuDevice, StagingBuffer};

struct RawBuffer {
    vk_buffer: vk::Buffer,
    allocation: vk_mem::Allocation,
    /// Null unless the allocation is host visible.
    mapped: *mut u8,
    len: usize,
}

/// Hands `value` to `release` when dropped, unless [`ReleaseOnError::disarm`]
/// took it back first. Keeps device objects from leaking when a later step of
/// their setup returns early through `?`.
struct ReleaseOnError<T, F: FnOnce(T)> {
    armed: Option<(T, F)>,
}

impl<T, F: FnOnce(T)> ReleaseOnError<T, F> {
    fn new(value: T, release: F) -> Self {
        Self {
            armed: Some((value, release)),
        }
    }

    fn disarm(mut self) -> T {
        match self.armed.take() {
            Some((value, _)) => value,
            None => unreachable!("guard disarmed twice"),
        }
    }
}

impl<T, F: FnOnce(T)> Deref for ReleaseOnError<T, F> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.armed {
            Some((value, _)) => value,
            None => unreachable!("guard used after disarm"),
        }
    }
}

impl<T, F: FnOnce(T)> Drop for ReleaseOnError<T, F> {
    fn drop(&mut self) {
        if let Some((value, release)) = self.armed.take() {
            release(value);
        }
    }
}

struct InFlight {
    fence: vk::Fence,
    command_buffer: vk::CommandBuffer,
    upload: Option<RawBuffer>,
}

struct Submitter {
    command_pool: vk::CommandPool,
    in_flight: SmallVec<[InFlight; 4]>,
}

struct Shared {
    allocator: ManuallyDrop<vk_mem::Allocator>,
    submitter: Mutex<Submitter>,
    context: VulkanContext,
}

impl Shared {
    fn device(&self) -> &ash::Device {
        self.context.device()
    }

    fn device_context(&self) -> &DeviceContext {
        &self.context.device_context
    }

    fn create_raw(
        &self,
        len: usize,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
        debug_name: &str,
    ) -> anyhow::Result<RawBuffer> {
        let bci = vk::BufferCreateInfo::default()
            .size(len as vk::DeviceSize)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let aci = if host_visible {
            vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                ..Default::default()
            }
        } else {
            vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            }
        };

        let (vk_buffer, allocation) = unsafe { self.allocator.create_buffer(&bci, &aci) }
            .with_context(|| format!("failed to allocate {len} bytes for {debug_name:?}"))?;
        let mapped = if host_visible {
            self.allocator.get_allocation_info(&allocation).mapped_data as *mut u8
        } else {
            ptr::null_mut()
        };
        let raw = ReleaseOnError::new(
            RawBuffer {
                vk_buffer,
                allocation,
                mapped,
                len,
            },
            |mut raw| self.destroy_raw(&mut raw),
        );
        self.device_context().name_object(raw.vk_buffer, debug_name)?;
        Ok(raw.disarm())
    }

    fn destroy_raw(&self, raw: &mut RawBuffer) {
        unsafe {
            self.allocator
                .destroy_buffer(raw.vk_buffer, &mut raw.allocation);
        }
    }

    /// Records `record` into a fresh command buffer and submits it. `upload`
    /// is kept alive until the submission's fence signals.
    fn submit_one_shot(
        &self,
        upload: Option<RawBuffer>,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> anyhow::Result<()> {
        let upload = ReleaseOnError::new(upload, |upload: Option<RawBuffer>| {
            if let Some(mut raw) = upload {
                self.destroy_raw(&mut raw);
            }
        });
        let device = self.device();
        let mut submitter = self
            .submitter
            .lock()
            .map_err(|_| anyhow::anyhow!("submitter mutex poisoned"))?;
        self.retire_completed(&mut submitter);

        // released before `submitter`, so the pool is still locked
        let command_pool = submitter.command_pool;
        let command_buffer = ReleaseOnError::new(
            allocate_command_buffer(device, command_pool)?,
            |command_buffer| unsafe {
                device.free_command_buffers(command_pool, &[command_buffer]);
            },
        );
        let fence = ReleaseOnError::new(
            unsafe {
                device
                    .create_fence(&vk::FenceCreateInfo::default(), None)
                    .context("failed to create fence")?
            },
            |fence| unsafe { device.destroy_fence(fence, None) },
        );

        unsafe {
            device.begin_command_buffer(
                *command_buffer,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }
        record(device, *command_buffer);
        unsafe {
            device.end_command_buffer(*command_buffer)?;
            let command_buffers = [*command_buffer];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            device
                .queue_submit(self.context.queue, &[submit_info], *fence)
                .context("failed to submit transfer")?;
        }

        submitter.in_flight.push(InFlight {
            fence: fence.disarm(),
            command_buffer: command_buffer.disarm(),
            upload: upload.disarm(),
        });
        Ok(())
    }

    /// Waits for every submission on the queue, then releases finished
    /// transfers. Holds the submitter lock since queue access must be
    /// externally synchronized.
    fn wait_queue_idle(&self) -> anyhow::Result<()> {
        let mut submitter = self
            .submitter
            .lock()
            .map_err(|_| anyhow::anyhow!("submitter mutex poisoned"))?;
        unsafe { self.device().queue_wait_idle(self.context.queue) }
            .context("failed to wait for compute queue")?;
        self.retire_completed(&mut submitter);
        Ok(())
    }

    fn retire_completed(&self, submitter: &mut Submitter) {
        let device = self.device();
        let command_pool = submitter.command_pool;
        let (done, pending): (SmallVec<[InFlight; 4]>, _) =
            submitter.in_flight.drain(..).partition(|submission| unsafe {
                device.get_fence_status(submission.fence).unwrap_or(false)
            });
        submitter.in_flight = pending;
        for submission in done {
            unsafe {
                device.destroy_fence(submission.fence, None);
                device.free_command_buffers(command_pool, &[submission.command_buffer]);
            }
            if let Some(mut upload) = submission.upload {
                self.destroy_raw(&mut upload);
            }
        }
    }

    /// Copies `data` into a device-local buffer through a transient upload
    /// buffer.
    fn upload(&self, dst: vk::Buffer, data: &[u8]) -> anyhow::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let upload = self.create_raw(
            data.len(),
            vk::BufferUsageFlags::TRANSFER_SRC,
            true,
            "transient upload",
        )?;
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), upload.mapped, data.len());
        }
        let src = upload.vk_buffer;
        let size = data.len() as vk::DeviceSize;
        self.submit_one_shot(Some(upload), |device, cb| unsafe {
            device.cmd_copy_buffer(cb, src, dst, &[vk::BufferCopy::default().size(size)]);
            buffer_barrier(
                device,
                cb,
                dst,
                (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
                (
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                ),
            );
        })
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        log::trace!("Destroying compute device");
        unsafe {
            if let Err(e) = self.device().device_wait_idle() {
                log::warn!("device_wait_idle failed during teardown: {e}");
            }
        }
        let mut submitter = match self.submitter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.retire_completed(&mut submitter);
        unsafe {
            self.device()
                .destroy_command_pool(submitter.command_pool, None);
        }
        drop(submitter);
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
        }
    }
}

fn allocate_command_buffer(
    device: &ash::Device,
    command_pool: vk::CommandPool,
) -> anyhow::Result<vk::CommandBuffer> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let buffers = unsafe {
        device
            .allocate_command_buffers(&alloc_info)
            .context("failed to allocate transfer command buffer")?
    };
    buffers
        .into_iter()
        .next()
        .context("driver returned no command buffer")
}

unsafe fn buffer_barrier(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    buffer: vk::Buffer,
    src: (vk::PipelineStageFlags, vk::AccessFlags),
    dst: (vk::PipelineStageFlags, vk::AccessFlags),
) {
    let barrier = vk::BufferMemoryBarrier::default()
        .src_access_mask(src.1)
        .dst_access_mask(dst.1)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE);
    unsafe {
        device.cmd_pipeline_barrier(
            cb,
            src.0,
            dst.0,
            vk::DependencyFlags::empty(),
            &[],
            &[barrier],
            &[],
        );
    }
}

fn usage_for(flags: BufferFlags) -> vk::BufferUsageFlags {
    let mut usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    if flags.contains(BufferFlags::CONSTANT) {
        usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if flags.contains(BufferFlags::STRUCTURED) {
        if flags.intersects(BufferFlags::BIND_SRV | BufferFlags::BIND_UAV) {
            usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
    } else {
        if flags.contains(BufferFlags::BIND_SRV) {
            usage |= vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER;
        }
        if flags.contains(BufferFlags::BIND_UAV) {
            usage |= vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER;
        }
    }
    usage
}

/// Compute-capable device handle. Clones share the same device and allocator.
#[derive(Clone)]
pub struct VulkanDevice {
    shared: Arc<Shared>,
}

impl VulkanDevice {
    pub fn new(context: VulkanContext) -> anyhow::Result<Self> {
        let allocator = {
            let create_info = vk_mem::AllocatorCreateInfo::new(
                context.instance(),
                context.device(),
                context.physical_device,
            );
            unsafe { vk_mem::Allocator::new(create_info) }
                .context("failed to create vk_mem allocator")?
        };

        let command_pool = {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(context.queue_family.index)
                .flags(
                    vk::CommandPoolCreateFlags::TRANSIENT
                        | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                );
            unsafe {
                context
                    .device()
                    .create_command_pool(&pool_info, None)
                    .context("failed to create transfer command pool")?
            }
        };

        Ok(Self {
            shared: Arc::new(Shared {
                allocator: ManuallyDrop::new(allocator),
                submitter: Mutex::new(Submitter {
                    command_pool,
                    in_flight: SmallVec::new(),
                }),
                context,
            }),
        })
    }

    pub fn headless() -> anyhow::Result<Self> {
        let context = VulkanContext::new_headless().context("failed to create Vulkan context")?;
        Self::new(context)
    }

    pub fn device(&self) -> &ash::Device {
        self.shared.device()
    }

    /// Blocks until every submitted transfer has completed.
    pub fn wait_idle(&self) -> anyhow::Result<()> {
        self.shared.wait_queue_idle()
    }
}

pub struct VulkanBuffer {
    shared: Arc<Shared>,
    raw: RawBuffer,
    counter: Option<RawBuffer>,
    flags: BufferFlags,
}

impl VulkanBuffer {
    fn view(&self, raw: &RawBuffer) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(raw.vk_buffer)
            .offset(0)
            .range(raw.len as vk::DeviceSize)
    }
}

impl GpuBuffer for VulkanBuffer {
    type Handle = vk::Buffer;
    type View = vk::DescriptorBufferInfo;

    fn handle(&self) -> vk::Buffer {
        self.raw.vk_buffer
    }

    fn byte_len(&self) -> usize {
        self.raw.len
    }

    fn flags(&self) -> BufferFlags {
        self.flags
    }

    fn srv(&self) -> Option<vk::DescriptorBufferInfo> {
        self.flags
            .contains(BufferFlags::BIND_SRV)
            .then(|| self.view(&self.raw))
    }

    fn uav(&self) -> Option<vk::DescriptorBufferInfo> {
        self.flags
            .contains(BufferFlags::BIND_UAV)
            .then(|| self.view(&self.raw))
    }

    fn counter(&self) -> Option<vk::DescriptorBufferInfo> {
        self.counter.as_ref().map(|counter| self.view(counter))
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        // uploads and readbacks may still reference the buffer
        if let Err(e) = self.shared.wait_queue_idle() {
            log::warn!("failed waiting for transfers before releasing a buffer: {e:#}");
        }
        self.shared.destroy_raw(&mut self.raw);
        if let Some(counter) = self.counter.as_mut() {
            self.shared.destroy_raw(counter);
        }
    }
}

pub struct VulkanStaging {
    shared: Arc<Shared>,
    raw: RawBuffer,
    fence: vk::Fence,
    /// Set once a submission will signal `fence`. Waiting is skipped
    /// otherwise, so a failed submit cannot leave a wait that never returns.
    submitted: bool,
    command_buffer: vk::CommandBuffer,
    mapped: bool,
}

impl StagingBuffer for VulkanStaging {
    fn byte_len(&self) -> usize {
        self.raw.len
    }

    fn map(&mut self, byte_len: usize) -> anyhow::Result<()> {
        anyhow::ensure!(
            byte_len <= self.byte_len(),
            "cannot map {byte_len} bytes of a {} byte staging buffer",
            self.byte_len()
        );
        anyhow::ensure!(
            self.submitted,
            "no copy was submitted to this staging buffer"
        );
        #[cfg(feature = "tracing")]
        let _span = tracy_client::span!("staging_map");
        unsafe {
            self.shared
                .device()
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .context("failed waiting for readback fence")?;
        }
        self.mapped = true;
        Ok(())
    }

    fn mapped(&self, byte_len: usize) -> &[u8] {
        assert!(self.mapped, "staging buffer is not mapped");
        let raw = &self.raw;
        assert!(byte_len <= raw.len);
        // SAFETY: the allocation is persistently mapped, host coherent and
        // at least `raw.len` bytes long; the fence wait in `map` ordered the
        // device writes before this read.
        unsafe { std::slice::from_raw_parts(raw.mapped, byte_len) }
    }

    fn unmap(&mut self) {
        self.mapped = false;
    }
}

impl Drop for VulkanStaging {
    fn drop(&mut self) {
        let device = self.shared.device();
        unsafe {
            if self.submitted
                && let Err(e) = device.wait_for_fences(&[self.fence], true, u64::MAX)
            {
                log::warn!("failed waiting for readback fence on drop: {e}");
            }
            device.destroy_fence(self.fence, None);
            if let Ok(submitter) = self.shared.submitter.lock() {
                device.free_command_buffers(submitter.command_pool, &[self.command_buffer]);
            }
        }
        self.shared.destroy_raw(&mut self.raw);
    }
}

impl VulkanStaging {
    /// Records `record` into this staging buffer's command buffer and submits
    /// it, signalling the staging fence on completion.
    fn submit(
        &mut self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer, vk::Buffer),
    ) -> anyhow::Result<()> {
        #[cfg(feature = "tracing")]
        let _span = tracy_client::span!("staging_submit");
        let dst = self.raw.vk_buffer;
        let device = self.shared.device();
        let submitter = self
            .shared
            .submitter
            .lock()
            .map_err(|_| anyhow::anyhow!("submitter mutex poisoned"))?;
        unsafe {
            if self.submitted {
                device
                    .wait_for_fences(&[self.fence], true, u64::MAX)
                    .context("failed waiting for previous readback")?;
            }
            device.reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(
                self.command_buffer,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }
        record(device, self.command_buffer, dst);
        unsafe {
            buffer_barrier(
                device,
                self.command_buffer,
                dst,
                (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
                (vk::PipelineStageFlags::HOST, vk::AccessFlags::HOST_READ),
            );
            device.end_command_buffer(self.command_buffer)?;

            // the fence only becomes waitable again once the submit succeeds
            self.submitted = false;
            device
                .reset_fences(&[self.fence])
                .context("failed to reset readback fence")?;
            let command_buffers = [self.command_buffer];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            device
                .queue_submit(self.shared.context.queue, &[submit_info], self.fence)
                .context("failed to submit readback")?;
            self.submitted = true;
        }
        drop(submitter);
        Ok(())
    }
}

/// Makes shader writes to `src` visible to a following transfer read.
unsafe fn before_copy_out(device: &ash::Device, cb: vk::CommandBuffer, src: vk::Buffer) {
    unsafe {
        buffer_barrier(
            device,
            cb,
            src,
            (vk::PipelineStageFlags::COMPUTE_SHADER, vk::AccessFlags::SHADER_WRITE),
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ),
        );
    }
}

impl GpuDevice for VulkanDevice {
    type Buffer = VulkanBuffer;
    type Staging = VulkanStaging;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> anyhow::Result<VulkanBuffer> {
        let host_visible = desc
            .flags
            .intersects(BufferFlags::DYNAMIC | BufferFlags::CONSTANT);
        let raw = self.shared.create_raw(
            desc.allocation_len(),
            usage_for(desc.flags),
            host_visible,
            desc.debug_name,
        )?;
        let mut buffer = VulkanBuffer {
            shared: self.shared.clone(),
            raw,
            counter: None,
            flags: desc.flags,
        };

        if desc.flags.contains(BufferFlags::UAV_COUNTER) {
            let counter = self.shared.create_raw(
                COUNTER_SIZE,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
                false,
                &format!("{} (counter)", desc.debug_name),
            )?;
            let counter_buffer = counter.vk_buffer;
            buffer.counter = Some(counter);
            self.shared.submit_one_shot(None, |device, cb| unsafe {
                device.cmd_fill_buffer(cb, counter_buffer, 0, vk::WHOLE_SIZE, 0);
                buffer_barrier(
                    device,
                    cb,
                    counter_buffer,
                    (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
                    (
                        vk::PipelineStageFlags::COMPUTE_SHADER,
                        vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                    ),
                );
            })?;
        }

        if let Some(init) = desc.init_data {
            self.update_buffer(&mut buffer, init)
                .with_context(|| format!("failed to initialize {:?}", desc.debug_name))?;
        }
        log::debug!(
            "created vulkan buffer {:?}: {} bytes, {:?}",
            desc.debug_name,
            desc.allocation_len(),
            desc.flags
        );
        Ok(buffer)
    }

    fn update_buffer(&self, dst: &mut VulkanBuffer, data: &[u8]) -> anyhow::Result<()> {
        let raw = &dst.raw;
        anyhow::ensure!(
            data.len() <= raw.len,
            "update of {} bytes overruns a {} byte buffer",
            data.len(),
            raw.len
        );
        if raw.mapped.is_null() {
            self.shared.upload(raw.vk_buffer, data)
        } else {
            // SAFETY: host-visible allocations are persistently mapped and
            // coherent, and `data` fits as checked above.
            unsafe { ptr::copy_nonoverlapping(data.as_ptr(), raw.mapped, data.len()) };
            Ok(())
        }
    }

    fn create_staging(&self, byte_len: usize, debug_name: &str) -> anyhow::Result<VulkanStaging> {
        let shared = &self.shared;
        let raw = ReleaseOnError::new(
            shared.create_raw(
                byte_len.max(COUNTER_SIZE),
                vk::BufferUsageFlags::TRANSFER_DST,
                true,
                debug_name,
            )?,
            |mut raw| shared.destroy_raw(&mut raw),
        );
        let device = shared.device();
        let submitter = shared
            .submitter
            .lock()
            .map_err(|_| anyhow::anyhow!("submitter mutex poisoned"))?;
        let command_pool = submitter.command_pool;
        let command_buffer = ReleaseOnError::new(
            allocate_command_buffer(device, command_pool)?,
            |command_buffer| unsafe {
                device.free_command_buffers(command_pool, &[command_buffer]);
            },
        );
        let fence = unsafe {
            device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .context("failed to create readback fence")?
        };
        let command_buffer = command_buffer.disarm();
        drop(submitter);

        Ok(VulkanStaging {
            shared: shared.clone(),
            raw: raw.disarm(),
            fence,
            submitted: false,
            command_buffer,
            mapped: false,
        })
    }

    fn copy_to_staging(
        &self,
        src: &VulkanBuffer,
        dst: &mut VulkanStaging,
        byte_len: usize,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            byte_len <= src.byte_len() && byte_len <= dst.byte_len(),
            "copy of {byte_len} bytes out of range"
        );
        let src_buffer = src.handle();
        dst.submit(|device, cb, dst_buffer| unsafe {
            // zero sized copies are invalid, an empty submit still signals
            if byte_len == 0 {
                return;
            }
            before_copy_out(device, cb, src_buffer);
            device.cmd_copy_buffer(
                cb,
                src_buffer,
                dst_buffer,
                &[vk::BufferCopy::default().size(byte_len as vk::DeviceSize)],
            );
        })
    }

    fn copy_counter_to_staging(
        &self,
        src: &VulkanBuffer,
        dst: &mut VulkanStaging,
    ) -> anyhow::Result<()> {
        let counter = src
            .counter
            .as_ref()
            .context("buffer has no counter to copy")?
            .vk_buffer;
        dst.submit(|device, cb, dst_buffer| unsafe {
            before_copy_out(device, cb, counter);
            device.cmd_copy_buffer(
                cb,
                counter,
                dst_buffer,
                &[vk::BufferCopy::default().size(COUNTER_SIZE as vk::DeviceSize)],
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    /// `None` on machines without a Vulkan implementation.
    fn vulkan_device() -> Option<VulkanDevice> {
        match VulkanDevice::headless() {
            Ok(device) => Some(device),
            Err(e) => {
                eprintln!("skipping, no Vulkan device: {e:#}");
                None
            }
        }
    }

    #[test]
    fn guard_releases_value_when_setup_fails() {
        let released = Cell::new(None);
        let setup = |fail: bool| -> anyhow::Result<u32> {
            let handle = ReleaseOnError::new(7u32, |handle| released.set(Some(handle)));
            assert_eq!(*handle, 7);
            anyhow::ensure!(!fail, "setup failed");
            Ok(handle.disarm())
        };

        assert!(setup(true).is_err());
        assert_eq!(released.take(), Some(7));

        assert_eq!(setup(false).unwrap(), 7);
        assert_eq!(released.get(), None);
    }

    #[test]
    fn unsubmitted_staging_neither_maps_nor_waits_on_drop() {
        let Some(device) = vulkan_device() else {
            return;
        };
        let mut staging = device.create_staging(16, "unsubmitted").unwrap();
        assert!(staging.map(16).is_err());
        // returns without waiting on a fence no submission will signal
        drop(staging);
    }

    #[test]
    fn staging_is_reusable_across_copies() {
        let Some(device) = vulkan_device() else {
            return;
        };
        let values: Vec<u32> = (0..16).collect();
        let buffer = device
            .create_buffer(&BufferDesc {
                element_count: values.len(),
                stride: 4,
                flags: BufferFlags::STRUCTURED | BufferFlags::BIND_UAV | BufferFlags::UAV_OVERLAP,
                debug_name: "source",
                init_data: Some(bytemuck::cast_slice(&values)),
            })
            .unwrap();
        let mut staging = device.create_staging(64, "readback").unwrap();

        for len in [64, 0, 16] {
            device.copy_to_staging(&buffer, &mut staging, len).unwrap();
            staging.map(len).unwrap();
            assert_eq!(staging.mapped(len), &bytemuck::cast_slice::<u32, u8>(&values)[..len]);
            staging.unmap();
        }
    }

    #[test]
    fn structured_flags_map_to_storage_buffers() {
        let usage = usage_for(BufferFlags::STRUCTURED | BufferFlags::BIND_SRV);
        assert!(usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(!usage.contains(vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER));
    }

    #[test]
    fn typed_flags_map_to_texel_buffers() {
        let usage = usage_for(BufferFlags::BIND_SRV | BufferFlags::BIND_UAV);
        assert!(usage.contains(
            vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER
        ));
        assert!(!usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }

    #[test]
    fn every_buffer_can_be_copied() {
        for flags in [BufferFlags::CONSTANT, BufferFlags::BIND_SRV, BufferFlags::empty()] {
            let usage = usage_for(flags);
            assert!(usage.contains(
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST
            ));
        }
    }
}
