// Vulkan frame target
//
// Implements the frame engine's GPU steps against the real device. Owns no
// resources: every handle here is destroyed by the engine's deletion queue.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::frame::{Acquire, DrawPacket, FrameTarget};
use crate::backend::sync::{CommandContext, SyncSet};
use crate::backend::{EngineError, Swapchain, VulkanDevice};

pub struct VulkanTarget {
    device: Arc<VulkanDevice>,
    swapchain: Swapchain,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    sync: SyncSet,
    commands: CommandContext,
}

impl VulkanTarget {
    pub fn new(
        device: Arc<VulkanDevice>,
        swapchain: Swapchain,
        render_pass: vk::RenderPass,
        framebuffers: Vec<vk::Framebuffer>,
        sync: SyncSet,
        commands: CommandContext,
    ) -> Self {
        Self {
            device,
            swapchain,
            render_pass,
            framebuffers,
            sync,
            commands,
        }
    }

    fn framebuffer(&self, image_index: u32) -> Result<vk::Framebuffer, EngineError> {
        framebuffer_for(&self.framebuffers, image_index).map_err(|e| self.device.gate.fatal(e))
    }
}

/// Framebuffer wrapping the acquired swapchain image.
fn framebuffer_for(
    framebuffers: &[vk::Framebuffer],
    image_index: u32,
) -> Result<vk::Framebuffer, EngineError> {
    framebuffers
        .get(image_index as usize)
        .copied()
        .ok_or(EngineError::NoFramebuffer {
            image_index,
            count: framebuffers.len(),
        })
}

fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

impl FrameTarget for VulkanTarget {
    fn wait_for_fence(&mut self, timeout: Duration) -> Result<(), EngineError> {
        let fences = [self.sync.render_fence];
        match unsafe {
            self.device
                .device
                .wait_for_fences(&fences, true, timeout_ns(timeout))
        } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(self.device.gate.fatal(EngineError::GpuTimeout {
                what: "render fence",
            })),
            Err(e) => self.device.gate.check(Err(e), "vkWaitForFences"),
        }
    }

    fn settle_fence(&mut self, timeout: Duration) -> bool {
        let fences = [self.sync.render_fence];
        self.device
            .gate
            .report(
                unsafe {
                    self.device
                        .device
                        .wait_for_fences(&fences, true, timeout_ns(timeout))
                },
                "vkWaitForFences",
            )
            .is_some()
    }

    fn acquire_image(&mut self, timeout: Duration) -> Result<Acquire, EngineError> {
        let result = unsafe {
            self.swapchain.swapchain_loader.acquire_next_image(
                self.swapchain.swapchain,
                timeout_ns(timeout),
                self.sync.present_semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Swapchain suboptimal for image {}", index);
                }
                Ok(Acquire::Image(index))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Err(self
                .device
                .gate
                .fatal(EngineError::GpuTimeout {
                    what: "swapchain image",
                })),
            Err(e) => self.device.gate.check(Err(e), "vkAcquireNextImageKHR"),
        }
    }

    fn reset_fence(&mut self) -> Result<(), EngineError> {
        let fences = [self.sync.render_fence];
        self.device.gate.check(
            unsafe { self.device.device.reset_fences(&fences) },
            "vkResetFences",
        )
    }

    fn reset_command_buffer(&mut self) -> Result<(), EngineError> {
        self.device.gate.check(
            unsafe {
                self.device.device.reset_command_buffer(
                    self.commands.buffer,
                    vk::CommandBufferResetFlags::empty(),
                )
            },
            "vkResetCommandBuffer",
        )
    }

    fn record(&mut self, image_index: u32, draw: &DrawPacket) -> Result<(), EngineError> {
        let framebuffer = self.framebuffer(image_index)?;
        let device = &self.device.device;
        let gate = self.device.gate;
        let cmd = self.commands.buffer;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        gate.check(
            unsafe { device.begin_command_buffer(cmd, &begin_info) },
            "vkBeginCommandBuffer",
        )?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: draw.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: draw.clear_depth,
                    stencil: 0,
                },
            },
        ];

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.swapchain.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);

            // Nothing bound means nothing drawn; the pass still clears
            if draw.has_geometry() {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, draw.pipeline);
                device.cmd_bind_vertex_buffers(cmd, 0, &[draw.vertex_buffer], &[0]);
                device.cmd_push_constants(
                    cmd,
                    draw.layout,
                    vk::ShaderStageFlags::VERTEX,
                    0,
                    bytemuck::bytes_of(&draw.push_constants),
                );
                device.cmd_draw(cmd, draw.vertex_count, 1, 0, 0);
            }

            device.cmd_end_render_pass(cmd);
        }

        gate.check(unsafe { device.end_command_buffer(cmd) }, "vkEndCommandBuffer")
    }

    fn submit(&mut self) -> Result<(), EngineError> {
        let wait_semaphores = [self.sync.present_semaphore];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.sync.render_semaphore];
        let command_buffers = [self.commands.buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        self.device.gate.check(
            unsafe {
                self.device.device.queue_submit(
                    self.device.graphics_queue,
                    &[submit_info],
                    self.sync.render_fence,
                )
            },
            "vkQueueSubmit",
        )
    }

    fn present(&mut self, image_index: u32) -> Result<(), EngineError> {
        let wait_semaphores = [self.sync.render_semaphore];
        let swapchains = [self.swapchain.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.swapchain
                .swapchain_loader
                .queue_present(self.device.graphics_queue, &present_info)
        };

        match result {
            Ok(_suboptimal) => Ok(()),
            // The swapchain is never recreated; keep presenting what we can
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Present: swapchain out of date");
                Ok(())
            }
            Err(e) => self.device.gate.check(Err(e), "vkQueuePresentKHR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn timeouts_convert_to_nanoseconds() {
        assert_eq!(timeout_ns(Duration::from_secs(1)), 1_000_000_000);
        assert_eq!(timeout_ns(Duration::ZERO), 0);
        assert_eq!(timeout_ns(Duration::MAX), u64::MAX);
    }

    #[test]
    fn acquired_index_selects_its_framebuffer() {
        let framebuffers = [vk::Framebuffer::from_raw(10), vk::Framebuffer::from_raw(11)];
        assert_eq!(framebuffer_for(&framebuffers, 1).unwrap().as_raw(), 11);

        let err = framebuffer_for(&framebuffers, 2).unwrap_err();
        assert!(matches!(
            err,
            EngineError::NoFramebuffer {
                image_index: 2,
                count: 2
            }
        ));
        assert!(err.to_string().contains("image 2"));
    }
}
