// Result gate and error taxonomy
//
// Every fallible Vulkan call in the engine goes through a `Gate`:
// - `check` for calls whose failure the engine cannot survive
// - `report` for calls that may fail without invalidating the frame
//   (teardown, presentation hints). Failures are logged and swallowed.

use ash::prelude::VkResult;
use ash::vk;
use thiserror::Error;

use super::memory::MemoryError;
use super::pipeline::PipelineError;
use super::shader::ShaderError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("timed out waiting for {what}, GPU considered hung")]
    GpuTimeout { what: &'static str },

    #[error("no GPU supports Vulkan 1.1 with graphics and present on this surface")]
    NoSuitableDevice,

    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error(transparent)]
    Shader(#[from] ShaderError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("swapchain returned image {image_index} but only {count} framebuffers exist")]
    NoFramebuffer { image_index: u32, count: usize },

    #[error("engine used before init()")]
    NotInitialized,
}

/// What the gate does with a fatal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Return the error to the caller, who unwinds to `main`.
    #[default]
    Propagate,
    /// Halt on the spot. Useful under a debugger.
    Panic,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Gate {
    policy: FatalPolicy,
}

impl Gate {
    pub const fn new(policy: FatalPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> FatalPolicy {
        self.policy
    }

    /// Gate for calls whose failure is unrecoverable.
    pub fn check<T>(&self, result: VkResult<T>, call: &'static str) -> Result<T, EngineError> {
        result.map_err(|result| self.fatal(EngineError::Vulkan { call, result }))
    }

    /// Gate for calls that are allowed to fail. Logs and yields `None`.
    pub fn report<T>(&self, result: VkResult<T>, call: &'static str) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(result) => {
                log::warn!("{} failed: {}", call, result);
                None
            }
        }
    }

    /// Escalate an already-classified fatal error according to the policy.
    pub fn fatal(&self, err: EngineError) -> EngineError {
        log::error!("Fatal: {}", err);
        if self.policy == FatalPolicy::Panic {
            panic!("fatal engine error: {err}");
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_passes_success_through() {
        let gate = Gate::default();
        let value = gate.check(Ok(7u32), "vkTest").unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn check_propagates_with_call_name() {
        let gate = Gate::new(FatalPolicy::Propagate);
        let err = gate
            .check::<()>(Err(vk::Result::ERROR_DEVICE_LOST), "vkQueueSubmit")
            .unwrap_err();
        match err {
            EngineError::Vulkan { call, result } => {
                assert_eq!(call, "vkQueueSubmit");
                assert_eq!(result, vk::Result::ERROR_DEVICE_LOST);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "fatal engine error")]
    fn check_panics_under_panic_policy() {
        let gate = Gate::new(FatalPolicy::Panic);
        let _ = gate.check::<()>(Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY), "vkCreateFence");
    }

    #[test]
    fn report_swallows_failures() {
        let gate = Gate::new(FatalPolicy::Panic);
        assert_eq!(gate.report(Ok(3), "vkTest"), Some(3));
        assert_eq!(
            gate.report::<u32>(Err(vk::Result::ERROR_OUT_OF_DATE_KHR), "vkQueuePresentKHR"),
            None
        );
        // Teardown waits go through here and must not escalate
        assert_eq!(gate.report::<()>(Err(vk::Result::TIMEOUT), "vkWaitForFences"), None);
        assert_eq!(
            gate.report::<()>(Err(vk::Result::ERROR_DEVICE_LOST), "vkDeviceWaitIdle"),
            None
        );
    }

    #[test]
    fn timeout_message_names_the_wait() {
        let err = Gate::default().fatal(EngineError::GpuTimeout { what: "render fence" });
        assert!(err.to_string().contains("render fence"));
    }
}
