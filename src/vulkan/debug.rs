use std::ffi::{CStr, c_char, c_void};

use anyhow::{Context, bail};
use ash::{Entry, ext::debug_utils, vk};

#[cfg(debug_assertions)]
pub const ENABLE_VALIDATION_LAYERS: bool = true;
#[cfg(not(debug_assertions))]
pub const ENABLE_VALIDATION_LAYERS: bool = false;

const REQUIRED_LAYERS: [&CStr; 1] = [c"VK_LAYER_KHRONOS_validation"];

unsafe extern "system" fn vulkan_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    typ: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

    let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) }.to_string_lossy();
    match severity {
        Severity::VERBOSE => log::trace!(target: "vulkan", "{typ:?} - {message}"),
        Severity::INFO => log::debug!(target: "vulkan", "{typ:?} - {message}"),
        Severity::WARNING => log::warn!(target: "vulkan", "{typ:?} - {message}"),
        _ => log::error!(target: "vulkan", "{typ:?} - {message}"),
    }
    vk::FALSE
}

pub fn layer_name_pointers() -> Vec<*const c_char> {
    REQUIRED_LAYERS.iter().map(|name| name.as_ptr()).collect()
}

pub fn check_validation_layer_support(entry: &Entry) -> anyhow::Result<()> {
    let supported_layers = unsafe {
        entry
            .enumerate_instance_layer_properties()
            .context("failed to enumerate Vulkan instance layer properties")?
    };
    for required in REQUIRED_LAYERS {
        let found = supported_layers
            .iter()
            .any(|layer| layer.layer_name_as_c_str().is_ok_and(|name| name == required));
        if !found {
            bail!(
                "validation layer not supported: {}",
                required.to_string_lossy()
            );
        }
    }
    Ok(())
}

pub fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    if !ENABLE_VALIDATION_LAYERS {
        return None;
    }

    let create_info = create_debug_create_info();
    let debug_utils = debug_utils::Instance::new(entry, instance);
    match unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) } {
        Ok(messenger) => Some((debug_utils, messenger)),
        Err(e) => {
            log::warn!("failed to create debug utils messenger: {e:?}");
            None
        }
    }
}

pub fn create_debug_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback))
}

