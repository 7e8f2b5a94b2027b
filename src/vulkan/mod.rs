mod context;
mod debug;
mod device;
mod device_context;
mod instance;
mod physical;

pub use context::VulkanContext;
pub use device_context::DeviceContext;
pub use physical::ComputeQueueFamily;
