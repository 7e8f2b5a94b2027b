use std::ffi::CStr;

use anyhow::Context;
use ash::vk;

#[derive(Clone, Copy, Debug)]
pub struct ComputeQueueFamily {
    pub index: u32,
}

/// Picks the first device with a compute queue, preferring discrete GPUs.
pub fn pick_compute_device(
    instance: &ash::Instance,
) -> anyhow::Result<(vk::PhysicalDevice, ComputeQueueFamily)> {
    let devices = unsafe {
        instance
            .enumerate_physical_devices()
            .context("failed to enumerate physical devices")?
    };

    let mut candidates = devices
        .into_iter()
        .filter_map(|device| {
            find_compute_queue_family(instance, device).map(|family| (device, family))
        })
        .collect::<Vec<_>>();
    candidates.sort_by_key(|(device, _)| {
        let props = unsafe { instance.get_physical_device_properties(*device) };
        props.device_type != vk::PhysicalDeviceType::DISCRETE_GPU
    });
    let (device, family) = candidates
        .into_iter()
        .next()
        .context("no physical device with a compute queue")?;

    let props = unsafe { instance.get_physical_device_properties(device) };
    log::debug!("Selected physical device: {:?}", unsafe {
        CStr::from_ptr(props.device_name.as_ptr())
    });

    Ok((device, family))
}

/// Prefers a dedicated compute family over one shared with graphics.
fn find_compute_queue_family(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
) -> Option<ComputeQueueFamily> {
    let props = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let compute = props
        .iter()
        .enumerate()
        .filter(|(_, family)| {
            family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::COMPUTE)
        })
        .collect::<Vec<_>>();

    compute
        .iter()
        .find(|(_, family)| !family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .or_else(|| compute.first())
        .map(|(index, _)| ComputeQueueFamily {
            index: *index as u32,
        })
}
