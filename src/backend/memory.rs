// GPU memory: buffers and images backed by gpu-allocator
//
// Ownership is explicit. Every create_* here is paired by the caller with
// a deletion-queue entry that calls the matching destroy.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::{AllocationError, MemoryLocation};
use thiserror::Error;

use super::VulkanDevice;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Vulkan error creating {what}: {result}")]
    Create { what: &'static str, result: vk::Result },

    #[error("GPU allocator error: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Vulkan error binding {what} memory: {result}")]
    Bind { what: &'static str, result: vk::Result },

    #[error("Vulkan error flushing mapped memory: {0}")]
    Flush(vk::Result),

    #[error("allocation is not host-visible")]
    NotMapped,

    #[error("mapping covers {mapped} bytes, buffer needs {size}")]
    MappedTooSmall { mapped: usize, size: vk::DeviceSize },
}

/// A buffer plus the allocation backing it.
///
/// A zero-size buffer is valid here: it owns no Vulkan object and its
/// handle is null.
pub struct AllocatedBuffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
}

impl AllocatedBuffer {
    /// The zero-size buffer.
    pub fn empty() -> Self {
        Self {
            buffer: vk::Buffer::null(),
            allocation: None,
            size: 0,
        }
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Scoped write access to a host-visible buffer.
    ///
    /// The mapped bytes are only reachable inside `write`. Once it returns,
    /// non-coherent memory is flushed so the GPU sees the data.
    pub fn write<R>(
        &mut self,
        device: &VulkanDevice,
        write: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MemoryError> {
        let result = self.write_mapped(write)?;
        self.flush(device)?;
        Ok(result)
    }

    fn write_mapped<R>(&mut self, write: impl FnOnce(&mut [u8]) -> R) -> Result<R, MemoryError> {
        let Some(allocation) = self.allocation.as_mut() else {
            // Zero-size buffer: nothing is mapped, but the write is legal
            return Ok(write(&mut []));
        };
        let mapped = allocation.mapped_slice_mut().ok_or(MemoryError::NotMapped)?;
        Ok(write(mapped_range(mapped, self.size)?))
    }

    fn flush(&self, device: &VulkanDevice) -> Result<(), MemoryError> {
        let Some(allocation) = self.allocation.as_ref() else {
            return Ok(());
        };
        if allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }

        let atom = device.properties.limits.non_coherent_atom_size.max(1);
        let range = vk::MappedMemoryRange::builder()
            .memory(unsafe { allocation.memory() })
            .offset(allocation.offset() / atom * atom)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe { device.device.flush_mapped_memory_ranges(&[range]) }.map_err(MemoryError::Flush)
    }
}

/// The first `size` bytes of a mapping.
///
/// Allocations are often rounded up, so the mapping may be longer than the
/// buffer; the caller only ever sees the buffer's own bytes.
pub fn mapped_range(mapped: &mut [u8], size: vk::DeviceSize) -> Result<&mut [u8], MemoryError> {
    let len = mapped.len();
    usize::try_from(size)
        .ok()
        .and_then(|size| mapped.get_mut(..size))
        .ok_or(MemoryError::MappedTooSmall { mapped: len, size })
}

/// An image plus the allocation backing it.
pub struct AllocatedImage {
    pub image: vk::Image,
    allocation: Option<Allocation>,
}

/// Create a buffer of `size` bytes in the requested memory location.
///
/// `CpuToGpu` allocations come back persistently mapped.
pub fn create_buffer(
    device: &VulkanDevice,
    name: &str,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
) -> Result<AllocatedBuffer, MemoryError> {
    // vkCreateBuffer rejects size 0
    if size == 0 {
        log::debug!("Buffer '{}' is empty, no GPU object created", name);
        return Ok(AllocatedBuffer::empty());
    }

    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
        .map_err(|result| MemoryError::Create { what: "buffer", result })?;

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let allocation = device
        .allocator()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| {
            unsafe { device.device.destroy_buffer(buffer, None) };
            MemoryError::from(e)
        })?;

    let bind = unsafe {
        device
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
    };
    if let Err(result) = bind {
        let _ = device.allocator().free(allocation);
        unsafe { device.device.destroy_buffer(buffer, None) };
        return Err(MemoryError::Bind { what: "buffer", result });
    }

    log::debug!("Created buffer '{}' ({} bytes, {:?})", name, size, location);

    Ok(AllocatedBuffer {
        buffer,
        allocation: Some(allocation),
        size,
    })
}

pub fn destroy_buffer(device: &VulkanDevice, buffer: AllocatedBuffer) {
    let AllocatedBuffer { buffer, allocation, .. } = buffer;
    if let Some(allocation) = allocation {
        if let Err(e) = device.allocator().free(allocation) {
            log::error!("Failed to free buffer allocation: {}", e);
        }
    }
    if buffer != vk::Buffer::null() {
        unsafe { device.device.destroy_buffer(buffer, None) };
    }
}

/// Create an image and bind freshly allocated memory to it.
pub fn create_image(
    device: &VulkanDevice,
    name: &str,
    image_info: &vk::ImageCreateInfo,
    location: MemoryLocation,
) -> Result<AllocatedImage, MemoryError> {
    let image = unsafe { device.device.create_image(image_info, None) }
        .map_err(|result| MemoryError::Create { what: "image", result })?;

    let requirements = unsafe { device.device.get_image_memory_requirements(image) };

    let allocation = device
        .allocator()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: image_info.tiling == vk::ImageTiling::LINEAR,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| {
            unsafe { device.device.destroy_image(image, None) };
            MemoryError::from(e)
        })?;

    let bind = unsafe {
        device
            .device
            .bind_image_memory(image, allocation.memory(), allocation.offset())
    };
    if let Err(result) = bind {
        let _ = device.allocator().free(allocation);
        unsafe { device.device.destroy_image(image, None) };
        return Err(MemoryError::Bind { what: "image", result });
    }

    Ok(AllocatedImage {
        image,
        allocation: Some(allocation),
    })
}

pub fn destroy_image(device: &VulkanDevice, image: AllocatedImage) {
    let AllocatedImage { image, allocation } = image;
    if let Some(allocation) = allocation {
        if let Err(e) = device.allocator().free(allocation) {
            log::error!("Failed to free image allocation: {}", e);
        }
    }
    unsafe { device.device.destroy_image(image, None) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_owns_nothing() {
        let mut buffer = AllocatedBuffer::empty();
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.buffer, vk::Buffer::null());

        let seen = buffer.write_mapped(|bytes| bytes.len()).unwrap();
        assert_eq!(seen, 0);
    }

    #[test]
    fn mapped_range_hides_allocation_padding() {
        let mut mapped = vec![0xAAu8; 256];
        let range = mapped_range(&mut mapped, 100).unwrap();
        assert_eq!(range.len(), 100);
        range.fill(1);
        assert!(mapped[..100].iter().all(|&b| b == 1));
        assert!(mapped[100..].iter().all(|&b| b == 0xAA));

        assert!(mapped_range(&mut mapped, 0).unwrap().is_empty());
        assert_eq!(mapped_range(&mut mapped, 256).unwrap().len(), 256);
    }

    #[test]
    fn mapped_range_rejects_short_mapping() {
        let mut mapped = vec![0u8; 16];
        let err = mapped_range(&mut mapped, 17).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::MappedTooSmall { mapped: 16, size: 17 }
        ));
    }
}
