use std::sync::Arc;

use anyhow::Context;
use ash::vk;

use super::{
    DeviceContext,
    debug::setup_debug_messenger,
    device::create_logical_device,
    instance::create_headless_instance,
    physical::{ComputeQueueFamily, pick_compute_device},
};

/// Instance, device and compute queue for headless work.
pub struct VulkanContext {
    pub device_context: DeviceContext,
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: ComputeQueueFamily,
    pub queue: vk::Queue,

    debug_report_callback: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    instance: ash::Instance,
    _entry: ash::Entry,
}

impl VulkanContext {
    pub fn new_headless() -> anyhow::Result<Self> {
        let entry = ash::Entry::linked();
        let instance = create_headless_instance(&entry).context("failed to create instance")?;
        let debug_report_callback = setup_debug_messenger(&entry, &instance);

        let (physical_device, queue_family) =
            pick_compute_device(&instance).context("failed to pick physical device")?;
        let (device, queue) = create_logical_device(&instance, physical_device, queue_family)
            .context("failed to create logical device")?;

        let debug_utils = debug_report_callback
            .is_some()
            .then(|| Arc::new(ash::ext::debug_utils::Device::new(&instance, &device)));

        Ok(Self {
            device_context: DeviceContext {
                device,
                debug_utils,
            },
            physical_device,
            queue_family,
            queue,
            debug_report_callback,
            instance,
            _entry: entry,
        })
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device_context.device
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        log::trace!("Destroying Vulkan Context");
        unsafe {
            if let Err(e) = self.device().device_wait_idle() {
                log::warn!("device_wait_idle failed during teardown: {e}");
            }
            log::trace!("  Destroying Device");
            self.device().destroy_device(None);
        }
        if let Some((debug_utils, messenger)) = &self.debug_report_callback {
            log::trace!("  Destroying debug messenger");
            unsafe {
                debug_utils.destroy_debug_utils_messenger(*messenger, None);
            }
        }
        log::trace!("  Destroying Instance");
        unsafe {
            self.instance.destroy_instance(None);
        }
        log::trace!("Vulkan Context Destroyed");
    }
}
