// Synchronization primitives and the frame's command buffer
//
// One frame in flight: one fence, two semaphores, one command buffer.
// - render_fence:      GPU -> CPU, "last submission finished"
// - present_semaphore: acquire -> draw, "swapchain image is ready"
// - render_semaphore:  draw -> present, "rendering finished"

use ash::vk;

use super::check::EngineError;
use super::VulkanDevice;

#[derive(Debug, Clone, Copy)]
pub struct SyncSet {
    pub render_fence: vk::Fence,
    pub present_semaphore: vk::Semaphore,
    pub render_semaphore: vk::Semaphore,
}

impl SyncSet {
    pub fn new(device: &VulkanDevice) -> Result<Self, EngineError> {
        let gate = device.gate;
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first frame's wait returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let render_fence = gate.check(
            unsafe { device.device.create_fence(&fence_info, None) },
            "vkCreateFence",
        )?;

        let present_semaphore = match gate.check(
            unsafe { device.device.create_semaphore(&semaphore_info, None) },
            "vkCreateSemaphore",
        ) {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { device.device.destroy_fence(render_fence, None) };
                return Err(e);
            }
        };

        let render_semaphore = match gate.check(
            unsafe { device.device.create_semaphore(&semaphore_info, None) },
            "vkCreateSemaphore",
        ) {
            Ok(semaphore) => semaphore,
            Err(e) => unsafe {
                device.device.destroy_semaphore(present_semaphore, None);
                device.device.destroy_fence(render_fence, None);
                return Err(e);
            },
        };

        Ok(Self {
            render_fence,
            present_semaphore,
            render_semaphore,
        })
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.render_semaphore, None);
            device.destroy_semaphore(self.present_semaphore, None);
            device.destroy_fence(self.render_fence, None);
        }
    }
}

/// Command pool for the graphics queue and the single buffer recorded
/// every frame.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext {
    pub pool: vk::CommandPool,
    pub buffer: vk::CommandBuffer,
}

impl CommandContext {
    pub fn new(device: &VulkanDevice) -> Result<Self, EngineError> {
        let gate = device.gate;

        // RESET: the buffer is reset individually at the start of each frame
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = gate.check(
            unsafe { device.device.create_command_pool(&pool_info, None) },
            "vkCreateCommandPool",
        )?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = match gate.check(
            unsafe { device.device.allocate_command_buffers(&alloc_info) },
            "vkAllocateCommandBuffers",
        ) {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return Err(e);
            }
        };

        Ok(Self {
            pool,
            buffer: buffers[0],
        })
    }

    /// Destroying the pool frees the buffer with it.
    pub fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}
