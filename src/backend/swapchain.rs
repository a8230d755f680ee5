// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen,
// plus the single depth image shared by every framebuffer.
// Fixed size: there is no recreation path, a resize needs a full teardown.

use ash::extensions::khr;
use ash::vk;
use gpu_allocator::MemoryLocation;

use super::check::EngineError;
use super::memory::{self, AllocatedImage};
use super::VulkanDevice;

/// FIFO caps the frame rate to the display refresh and never tears.
/// It is also the only mode every driver must support.
pub const PRESENT_MODE: vk::PresentModeKHR = vk::PresentModeKHR::FIFO;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

#[derive(Clone)]
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(device: &VulkanDevice, window_extent: vk::Extent2D) -> Result<Self, EngineError> {
        log::info!(
            "Creating swapchain: {}x{}",
            window_extent.width,
            window_extent.height
        );
        let gate = device.gate;
        let surface = device.surface;
        let surface_loader = &device.surface_loader;

        // Query surface capabilities
        let surface_caps = gate.check(
            unsafe {
                surface_loader
                    .get_physical_device_surface_capabilities(device.physical_device, surface)
            },
            "vkGetPhysicalDeviceSurfaceCapabilitiesKHR",
        )?;

        // Query supported formats
        let formats = gate.check(
            unsafe {
                surface_loader.get_physical_device_surface_formats(device.physical_device, surface)
            },
            "vkGetPhysicalDeviceSurfaceFormatsKHR",
        )?;

        let surface_format = choose_surface_format(&formats).ok_or_else(|| {
            gate.fatal(EngineError::Vulkan {
                call: "vkGetPhysicalDeviceSurfaceFormatsKHR",
                result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
            })
        })?;

        let extent = choose_extent(&surface_caps, window_extent);
        let image_count = choose_image_count(&surface_caps);

        log::info!("Present mode: {:?}", PRESENT_MODE);

        let swapchain_loader = khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(PRESENT_MODE)
            .clipped(true);

        let swapchain = gate.check(
            unsafe { swapchain_loader.create_swapchain(&create_info, None) },
            "vkCreateSwapchainKHR",
        )?;

        let images = gate.check(
            unsafe { swapchain_loader.get_swapchain_images(swapchain) },
            "vkGetSwapchainImagesKHR",
        )?;

        log::info!("Created swapchain with {} images", images.len());

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view = create_image_view(
                device,
                image,
                surface_format.format,
                vk::ImageAspectFlags::COLOR,
            );
            match view {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    unsafe {
                        for &view in &image_views {
                            device.device.destroy_image_view(view, None);
                        }
                        swapchain_loader.destroy_swapchain(swapchain, None);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            swapchain,
            swapchain_loader,
            images,
            image_views,
            format: surface_format.format,
            extent,
        })
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Destroys the views, then the swapchain (which owns its images).
    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe {
            for &view in &self.image_views {
                device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Depth image and view sized to the window, shared by all framebuffers.
pub struct DepthAttachment {
    pub image: AllocatedImage,
    pub view: vk::ImageView,
}

impl DepthAttachment {
    pub fn new(device: &VulkanDevice, extent: vk::Extent2D) -> Result<Self, EngineError> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(DEPTH_FORMAT)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = memory::create_image(device, "depth", &image_info, MemoryLocation::GpuOnly)
            .map_err(|e| device.gate.fatal(e.into()))?;

        let view = match create_image_view(
            device,
            image.image,
            DEPTH_FORMAT,
            vk::ImageAspectFlags::DEPTH,
        ) {
            Ok(view) => view,
            Err(e) => {
                memory::destroy_image(device, image);
                return Err(e);
            }
        };

        Ok(Self { image, view })
    }

    pub fn destroy(self, device: &VulkanDevice) {
        unsafe { device.device.destroy_image_view(self.view, None) };
        memory::destroy_image(device, self.image);
    }
}

fn create_image_view(
    device: &VulkanDevice,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
) -> Result<vk::ImageView, EngineError> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    device.gate.check(
        unsafe { device.device.create_image_view(&create_info, None) },
        "vkCreateImageView",
    )
}

/// Prefer 8-bit BGRA sRGB, otherwise whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// The surface dictates the extent unless it reports the u32::MAX wildcard.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: window
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum when there is one.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && image_count > caps.max_image_count {
        image_count = caps.max_image_count;
    }
    image_count
}
