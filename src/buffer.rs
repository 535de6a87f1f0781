//! GPU buffers backed by a [`gpu_allocator`] allocation.

use crate::{context::Context, error::CreationError};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use log::error;
use std::sync::Arc;

/// A `vk::Buffer` together with its memory allocation.
///
/// Buffers created with [`MemoryLocation::CpuToGpu`] stay persistently
/// mapped for their whole lifetime; [`Buffer::mapped_slice_mut`] gives
/// access to the mapping.
pub struct Buffer {
    context: Arc<Context>,
    handle: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
}

impl Buffer {
    /// Allocates a buffer of `size` bytes.
    pub fn new(
        context: Arc<Context>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Buffer, CreationError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { context.device().create_buffer(&create_info, None) }
            .map_err(CreationError::from_vk)?;

        let requirements = unsafe { context.device().get_buffer_memory_requirements(handle) };

        let allocation = context.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                error!("buffer allocation failed ({}, {} bytes)", name, size);
                unsafe { context.device().destroy_buffer(handle, None) };
                return Err(err.into());
            }
        };

        let bound = unsafe {
            context
                .device()
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        };
        if let Err(result) = bound {
            unsafe { context.device().destroy_buffer(handle, None) };
            let _ = context.allocator().free(allocation);
            return Err(CreationError::from_vk(result));
        }

        Ok(Buffer {
            context,
            handle,
            allocation: Some(allocation),
            size,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// The 64-bit GPU-visible address of the buffer.
    ///
    /// Requires the buffer to have been created with
    /// [`vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS`].
    pub fn device_address(&self) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.handle);
        unsafe { self.context.device().get_buffer_device_address(&info) }
    }

    /// The persistent host mapping, if the buffer is host-visible.
    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.context.device().destroy_buffer(self.handle, None) };
        if let Some(allocation) = self.allocation.take() {
            let _ = self.context.allocator().free(allocation);
        }
    }
}
