// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers and window surface extensions
// - Presentable surface for the window
// - Physical device selection (Vulkan 1.1, graphics + present, swapchain)
// - Logical device + graphics queue
// - Memory allocator setup

use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::check::{EngineError, Gate};

/// Lowest Vulkan version a GPU must report to be considered.
pub const MIN_API_VERSION: u32 = vk::API_VERSION_1_1;

/// Vulkan device wrapper with automatic cleanup.
///
/// Everything else the engine creates is torn down by the deletion queue
/// before the last `Arc` to this is released.
pub struct VulkanDevice {
    // Dropped by hand before the device (see Drop)
    allocator: ManuallyDrop<Mutex<Allocator>>,

    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Presentation target
    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,

    /// Result-checking policy shared by every module holding the device
    pub gate: Gate,
}

impl VulkanDevice {
    /// Create the Vulkan device and the window surface.
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers
    /// * `display_handle`, `window_handle` - Raw handles of the target window
    /// * `gate` - Policy applied to fatal Vulkan failures
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        gate: Gate,
    ) -> Result<Arc<Self>, EngineError> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }?;

        // Step 2: Create instance
        let instance =
            Self::create_instance(&entry, app_name, enable_validation, display_handle, gate)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance, gate) {
                Ok(utils) => Some(utils),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        // Step 4: Create the surface
        let surface = match gate.check(
            unsafe {
                ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
            },
            "vkCreateSurfaceKHR",
        ) {
            Ok(surface) => surface,
            Err(e) => {
                unsafe {
                    if let Some((utils, messenger)) = &debug_utils {
                        utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };
        let surface_loader = khr::Surface::new(&entry, &instance);

        // Step 5: Pick physical device (GPU)
        let (physical_device, graphics_queue_family) =
            match Self::pick_physical_device(&instance, &surface_loader, surface, gate) {
                Ok(picked) => picked,
                Err(e) => {
                    unsafe { destroy_bootstrap(&instance, &surface_loader, surface, &debug_utils) };
                    return Err(e);
                }
            };

        // Step 6: Create logical device
        let (device, graphics_queue) = match Self::create_logical_device(
            &instance,
            physical_device,
            graphics_queue_family,
            gate,
        ) {
            Ok(created) => created,
            Err(e) => {
                unsafe { destroy_bootstrap(&instance, &surface_loader, surface, &debug_utils) };
                return Err(e);
            }
        };

        // Step 7: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Step 8: Create memory allocator
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe {
                    device.destroy_device(None);
                    destroy_bootstrap(&instance, &surface_loader, surface, &debug_utils);
                }
                return Err(gate.fatal(EngineError::Memory(e.into())));
            }
        };

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            _entry: entry,
            surface,
            surface_loader,
            graphics_queue,
            graphics_queue_family,
            debug_utils,
            properties,
            gate,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
        gate: Gate,
    ) -> Result<ash::Instance, EngineError> {
        // Interior NULs would only come from a hand-edited config
        let app_name_cstr = CString::new(app_name.replace('\0', "")).unwrap_or_default();
        let engine_name = CString::new("QC Engine").unwrap_or_default();

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(MIN_API_VERSION);

        // Surface extensions for whatever platform the window lives on
        let mut extensions: Vec<*const c_char> = gate
            .check(
                ash_window::enumerate_required_extensions(display_handle),
                "vkEnumerateInstanceExtensionProperties",
            )?
            .to_vec();

        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        gate.check(
            unsafe { entry.create_instance(&create_info, None) },
            "vkCreateInstance",
        )
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
        gate: Gate,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT), EngineError> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = gate.check(
            unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) },
            "vkCreateDebugUtilsMessengerEXT",
        )?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        gate: Gate,
    ) -> Result<(vk::PhysicalDevice, u32), EngineError> {
        let devices = gate.check(
            unsafe { instance.enumerate_physical_devices() },
            "vkEnumeratePhysicalDevices",
        )?;

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            if props.api_version < MIN_API_VERSION {
                log::debug!("Skipping {}: Vulkan version too old", name);
                continue;
            }

            if !Self::supports_swapchain(instance, device) {
                log::debug!("Skipping {}: no VK_KHR_swapchain", name);
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let family = find_graphics_present_family(&queue_families, |index| {
                gate.report(
                    unsafe {
                        surface_loader.get_physical_device_surface_support(device, index, surface)
                    },
                    "vkGetPhysicalDeviceSurfaceSupportKHR",
                )
                .unwrap_or(false)
            });

            if let Some(family) = family {
                let score = device_type_score(props.device_type);
                if score > best_score {
                    best_score = score;
                    best_device = Some((device, family));
                }
            } else {
                log::debug!("Skipping {}: no graphics queue that can present", name);
            }
        }

        best_device.ok_or_else(|| gate.fatal(EngineError::NoSuitableDevice))
    }

    fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let Ok(extensions) = (unsafe { instance.enumerate_device_extension_properties(device) })
        else {
            return false;
        };

        extensions.iter().any(|ext| {
            let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
            name == khr::Swapchain::name()
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        gate: Gate,
    ) -> Result<(ash::Device, vk::Queue), EngineError> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [khr::Swapchain::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions);

        let device = gate.check(
            unsafe { instance.create_device(physical_device, &create_info, None) },
            "vkCreateDevice",
        )?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    /// Lock the allocator for a create/free call.
    pub fn allocator(&self) -> parking_lot::MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    /// Wait for device to be idle before cleanup. Failure is logged only.
    pub fn wait_idle(&self) -> bool {
        self.gate
            .report(unsafe { self.device.device_wait_idle() }, "vkDeviceWaitIdle")
            .is_some()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        self.wait_idle();

        // Cleanup in reverse order. The allocator still owns memory blocks
        // and must release them while the device is alive.
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Tear down what exists before the logical device, newest first.
unsafe fn destroy_bootstrap(
    instance: &ash::Instance,
    surface_loader: &khr::Surface,
    surface: vk::SurfaceKHR,
    debug_utils: &Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
) {
    surface_loader.destroy_surface(surface, None);
    if let Some((utils, messenger)) = debug_utils {
        utils.destroy_debug_utils_messenger(*messenger, None);
    }
    instance.destroy_instance(None);
}

/// Preference order when several GPUs qualify.
pub fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
        _ => 1,
    }
}

/// First queue family that can both draw and present to the surface.
pub fn find_graphics_present_family(
    families: &[vk::QueueFamilyProperties],
    mut can_present: impl FnMut(u32) -> bool,
) -> Option<u32> {
    families
        .iter()
        .enumerate()
        .filter(|(_, props)| props.queue_count > 0)
        .filter(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|(i, _)| i as u32)
        .find(|&i| can_present(i))
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn discrete_beats_integrated_beats_cpu() {
        let discrete = device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU);
        let integrated = device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU);
        let cpu = device_type_score(vk::PhysicalDeviceType::CPU);
        assert!(discrete > integrated);
        assert!(integrated > cpu);
        assert!(cpu > 0);
    }

    #[test]
    fn picks_first_graphics_family_that_presents() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
            family(vk::QueueFlags::GRAPHICS, 1),
        ];

        assert_eq!(find_graphics_present_family(&families, |_| true), Some(1));
        assert_eq!(find_graphics_present_family(&families, |i| i == 2), Some(2));
    }

    #[test]
    fn no_family_without_present_support() {
        let families = [family(vk::QueueFlags::GRAPHICS, 1)];
        assert_eq!(find_graphics_present_family(&families, |_| false), None);
    }

    #[test]
    fn empty_families_are_ignored() {
        let families = [family(vk::QueueFlags::GRAPHICS, 0), family(vk::QueueFlags::GRAPHICS, 2)];
        assert_eq!(find_graphics_present_family(&families, |_| true), Some(1));
    }

    #[test]
    fn present_query_only_runs_for_graphics_families() {
        let families = [family(vk::QueueFlags::COMPUTE, 1), family(vk::QueueFlags::GRAPHICS, 1)];
        let mut asked = Vec::new();
        find_graphics_present_family(&families, |i| {
            asked.push(i);
            true
        });
        assert_eq!(asked, vec![1]);
    }
}
