// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. Each module owns one concern of the bootstrap;
// handles are plain values and their teardown is registered with the
// engine's deletion queue.

pub mod check;
pub mod deletion;
pub mod device;
pub mod memory;
pub mod pipeline;
pub mod render_pass;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use check::{EngineError, FatalPolicy, Gate};
pub use deletion::DeletionQueue;
pub use device::VulkanDevice;
pub use swapchain::Swapchain;
