//! Management of Vulkan ray-tracing acceleration structures and the shader
//! binding table.
//!
//! This crate wraps the `VK_KHR_acceleration_structure` and
//! `VK_KHR_ray_tracing_pipeline` device extensions:
//!
//! - A [`BottomLevelAccelerationStructure`](accel::BottomLevelAccelerationStructure)
//!   turns one or more triangle (or AABB) geometry ranges of shared
//!   vertex/index buffers into a traceable structure, with optional
//!   post-build compaction into a smaller replacement structure.
//!
//! - A [`TopLevelAccelerationStructure`](accel::TopLevelAccelerationStructure)
//!   holds an ordered list of bottom-level instances in a persistently mapped
//!   buffer, so a single instance's transform can be patched per frame and
//!   folded into a lightweight update build.
//!
//! - A [`ShaderBindingTable`](sbt::ShaderBindingTable) classifies a
//!   pipeline's shader groups into raygen/miss/hit/callable roles, fetches
//!   the opaque group handles and packs them, together with optional inline
//!   shader records, into one aligned buffer region per role.
//!
//! - The [`commands`] module records the build commands and the barriers
//!   between builds, updates and trace dispatches on a caller-provided
//!   command buffer. Nothing in this crate submits work or owns a queue;
//!   submission, surfaces, descriptor sets and pipeline layouts belong to
//!   the integrating application.
//!
//! All device-side objects are created through a [`Context`](context::Context),
//! which bundles the extension function tables, the relevant physical-device
//! properties and a GPU memory allocator.

pub mod accel;
pub mod buffer;
pub mod commands;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod sbt;
pub mod scratch;

pub use accel::{
    AabbGeometry, BottomLevelAccelerationStructure, BottomLevelBuilder, GeometryRange,
    TopLevelAccelerationStructure, TopLevelBuilder, TriangleGeometry,
};
pub use buffer::Buffer;
pub use context::{Context, RayTracingProperties};
pub use error::{CompactionError, CreationError, OomError};
pub use pipeline::{
    GroupRole, RayTracingPipeline, RayTracingPipelineDesc, ShaderGroupDesc, ShaderStageDesc,
};
pub use sbt::ShaderBindingTable;
pub use scratch::ScratchBuffer;

/// Represents memory size and offset values on a Vulkan device.
pub use ash::vk::DeviceSize;

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two; every alignment handed out by the
/// device capability queries is.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::align_up;

    #[test]
    fn align_up_basics() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(32, 1), 32);
    }
}
