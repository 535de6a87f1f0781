//! Transient scratch memory for acceleration-structure builds.

use crate::{align_up, buffer::Buffer, context::Context, error::CreationError};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// One transient buffer reused serially by every build in a pass.
///
/// The buffer is sized to the largest scratch requirement among the
/// structures built in the pass and must never be used by two builds without
/// an intervening barrier (see [`crate::commands`]).
pub struct ScratchBuffer {
    buffer: Buffer,
    size: vk::DeviceSize,
    alignment: u32,
}

impl ScratchBuffer {
    /// Allocates scratch memory for builds requiring up to `size` bytes.
    ///
    /// The allocation is padded by the device's scratch offset alignment so
    /// that [`ScratchBuffer::address`] can hand out an aligned address.
    pub fn new(context: Arc<Context>, size: vk::DeviceSize) -> Result<ScratchBuffer, CreationError> {
        let alignment = context.properties().min_scratch_offset_alignment;

        let buffer = Buffer::new(
            context,
            size + alignment as vk::DeviceSize,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            "acceleration structure build scratch",
        )?;

        Ok(ScratchBuffer {
            buffer,
            size,
            alignment,
        })
    }

    /// Allocates scratch memory large enough for every structure in a pass,
    /// given each structure's `scratch_buffer_size()`.
    pub fn for_builds(
        context: Arc<Context>,
        sizes: impl IntoIterator<Item = vk::DeviceSize>,
    ) -> Result<ScratchBuffer, CreationError> {
        let size = sizes.into_iter().max().unwrap_or(0);
        ScratchBuffer::new(context, size)
    }

    /// The aligned device address to pass to build commands.
    pub fn address(&self) -> vk::DeviceAddress {
        align_up(self.buffer.device_address(), self.alignment as u64)
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}
