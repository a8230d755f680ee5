// Frame state machine
//
// One frame in flight, strictly sequential:
//
//   wait fence -> acquire image -> reset fence + command buffer
//     -> record -> submit -> present -> advance frame counter
//
// The fence is reset only after the wait has observed it signaled and an
// image was actually acquired. An abandoned frame therefore leaves the fence
// signaled and the next wait returns at once instead of hanging.

use ash::vk;
use std::time::Duration;

use crate::backend::EngineError;
use crate::scene::MeshPushConstants;

/// Everything recorded for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawPacket {
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub vertex_buffer: vk::Buffer,
    pub vertex_count: u32,
    pub push_constants: MeshPushConstants,
}

impl DrawPacket {
    /// False when there is nothing to bind or draw; the pass still clears.
    pub fn has_geometry(&self) -> bool {
        self.vertex_count > 0
            && self.vertex_buffer != vk::Buffer::null()
            && self.pipeline != vk::Pipeline::null()
    }
}

/// Outcome of asking the swapchain for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Image(u32),
    /// The surface changed under the swapchain. Nothing was signaled.
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { frame_number: u64, image_index: u32 },
    /// Window minimized, no GPU work issued.
    Skipped,
    /// Image acquisition failed. No GPU work issued.
    Abandoned,
}

/// The GPU side of a frame. Implemented over Vulkan by `VulkanTarget`.
///
/// Bounded waits report expiry as `EngineError::GpuTimeout`.
pub trait FrameTarget {
    fn wait_for_fence(&mut self, timeout: Duration) -> Result<(), EngineError>;
    /// Teardown variant of `wait_for_fence`: failure is logged, never
    /// escalated. Returns whether the fence was observed signaled.
    fn settle_fence(&mut self, timeout: Duration) -> bool;
    fn acquire_image(&mut self, timeout: Duration) -> Result<Acquire, EngineError>;
    fn reset_fence(&mut self) -> Result<(), EngineError>;
    fn reset_command_buffer(&mut self) -> Result<(), EngineError>;
    fn record(&mut self, image_index: u32, draw: &DrawPacket) -> Result<(), EngineError>;
    fn submit(&mut self) -> Result<(), EngineError>;
    fn present(&mut self, image_index: u32) -> Result<(), EngineError>;
}

pub struct FrameEngine<T> {
    target: T,
    frame_number: u64,
    timeout: Duration,
}

impl<T: FrameTarget> FrameEngine<T> {
    pub fn new(target: T, timeout: Duration) -> Self {
        Self {
            target,
            frame_number: 0,
            timeout,
        }
    }

    /// Frames presented so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Run one frame. `compose` builds the draw for the current frame number
    /// and is only called once an image has been acquired.
    pub fn draw_frame(
        &mut self,
        minimized: bool,
        compose: impl FnOnce(u64) -> DrawPacket,
    ) -> Result<FrameStatus, EngineError> {
        // Zero-extent images cannot be acquired
        if minimized {
            return Ok(FrameStatus::Skipped);
        }

        self.target.wait_for_fence(self.timeout)?;

        let image_index = match self.target.acquire_image(self.timeout)? {
            Acquire::Image(index) => index,
            Acquire::OutOfDate => {
                log::warn!(
                    "Swapchain out of date, abandoning frame {}",
                    self.frame_number
                );
                return Ok(FrameStatus::Abandoned);
            }
        };

        self.target.reset_fence()?;
        self.target.reset_command_buffer()?;

        let draw = compose(self.frame_number);
        self.target.record(image_index, &draw)?;
        self.target.submit()?;
        self.target.present(image_index)?;

        let frame_number = self.frame_number;
        self.frame_number += 1;

        Ok(FrameStatus::Presented {
            frame_number,
            image_index,
        })
    }

    /// Bounded wait for the last submission before teardown. Never fatal:
    /// a hung or lost GPU must not stop the teardown that follows.
    pub fn wait_for_last_frame(&mut self) -> bool {
        self.target.settle_fence(self.timeout)
    }
}
