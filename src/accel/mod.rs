//! Bottom-level and top-level acceleration structures.
//!
//! The two structure kinds share one core (`AccelData`): a backing buffer
//! sized by a device size query, the structure object bound to it, its
//! device address, and — when compaction is allowed — a single-query pool
//! for the compacted-size readback. Kind-specific code exists only where
//! the geometry shape differs: triangles/AABBs for the bottom level,
//! an instance array for the top level.
//!
//! Build commands are recorded, never executed synchronously; the caller is
//! responsible for the barriers between a build and whatever consumes the
//! structure (helpers in [`crate::commands`]). The one deliberate host
//! synchronization point is compaction's size readback, which waits on the
//! query so that the size of the build it depends on can be trusted.

mod bottom_level;
mod top_level;

pub use bottom_level::{
    AabbGeometry, BottomLevelAccelerationStructure, BottomLevelBuilder, GeometryRange,
    TriangleGeometry,
};
pub use top_level::{TopLevelAccelerationStructure, TopLevelBuilder};

use crate::{buffer::Buffer, context::Context, error::CompactionError, error::CreationError};
use ash::vk;
use gpu_allocator::MemoryLocation;
use log::debug;
use std::sync::Arc;

/// State shared by both acceleration-structure kinds.
pub(crate) struct AccelData {
    pub(crate) context: Arc<Context>,
    kind: vk::AccelerationStructureTypeKHR,
    handle: vk::AccelerationStructureKHR,
    address: vk::DeviceAddress,
    buffer: Buffer,
    query_pool: Option<vk::QueryPool>,
    build_flags: vk::BuildAccelerationStructureFlagsKHR,
}

impl AccelData {
    /// Queries the device for the storage and scratch sizes of a build of
    /// `geometries`.
    fn build_sizes(
        context: &Context,
        kind: vk::AccelerationStructureTypeKHR,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        geometries: &[vk::AccelerationStructureGeometryKHR<'_>],
        primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(kind)
            .flags(flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(geometries);

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            context.accel_fn().get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                primitive_counts,
                &mut sizes,
            );
        }
        sizes
    }

    /// Allocates the backing buffer, creates the structure object bound to
    /// it and retrieves its device address.
    ///
    /// `size_override` is set when the structure is created as a compaction
    /// target; otherwise the size comes from the device size query.
    pub(crate) fn create(
        context: Arc<Context>,
        kind: vk::AccelerationStructureTypeKHR,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        geometries: &[vk::AccelerationStructureGeometryKHR<'_>],
        primitive_counts: &[u32],
        size_override: Option<vk::DeviceSize>,
    ) -> Result<AccelData, CreationError> {
        let size = match size_override {
            Some(size) => size,
            None => {
                Self::build_sizes(&context, kind, flags, geometries, primitive_counts)
                    .acceleration_structure_size
            }
        };

        let name = match kind {
            vk::AccelerationStructureTypeKHR::TOP_LEVEL => "top-level acceleration structure",
            _ => "bottom-level acceleration structure",
        };
        let buffer = Buffer::new(
            context.clone(),
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle())
            .offset(0)
            .size(size)
            .ty(kind);
        let handle = unsafe {
            context
                .accel_fn()
                .create_acceleration_structure(&create_info, None)
        }
        .map_err(CreationError::from_vk)?;

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        let address = unsafe {
            context
                .accel_fn()
                .get_acceleration_structure_device_address(&address_info)
        };

        // One query slot for the compacted-size readback.
        let query_pool = if flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION)
        {
            let pool_info = vk::QueryPoolCreateInfo::default()
                .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
                .query_count(1);
            let pool = unsafe { context.device().create_query_pool(&pool_info, None) };
            match pool {
                Ok(pool) => Some(pool),
                Err(result) => {
                    unsafe {
                        context.accel_fn().destroy_acceleration_structure(handle, None);
                    }
                    return Err(CreationError::from_vk(result));
                }
            }
        } else {
            None
        };

        debug!("created {} ({} bytes)", name, size);

        Ok(AccelData {
            context,
            kind,
            handle,
            address,
            buffer,
            query_pool,
            build_flags: flags,
        })
    }

    #[inline]
    pub(crate) fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    #[inline]
    pub(crate) fn address(&self) -> vk::DeviceAddress {
        self.address
    }

    #[inline]
    pub(crate) fn build_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.build_flags
    }

    #[inline]
    pub(crate) fn allow_update(&self) -> bool {
        self.build_flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
    }

    #[inline]
    pub(crate) fn allow_compaction(&self) -> bool {
        self.build_flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION)
    }

    /// Scratch requirement for building or (when allowed) updating the
    /// structure with the given geometry.
    pub(crate) fn scratch_size(
        &self,
        geometries: &[vk::AccelerationStructureGeometryKHR<'_>],
        primitive_counts: &[u32],
    ) -> vk::DeviceSize {
        let sizes = Self::build_sizes(
            &self.context,
            self.kind,
            self.build_flags,
            geometries,
            primitive_counts,
        );
        let update = if self.allow_update() {
            sizes.update_scratch_size
        } else {
            0
        };
        sizes.build_scratch_size.max(update)
    }

    /// Records a BUILD or UPDATE of the structure.
    ///
    /// When compaction is allowed, a build→build barrier, a query reset and
    /// the compacted-size query write are recorded right after the build so
    /// that [`AccelData::compacted_size`] has a value to read once the
    /// commands retire.
    pub(crate) fn build(
        &self,
        cmd: vk::CommandBuffer,
        update: bool,
        geometries: &[vk::AccelerationStructureGeometryKHR<'_>],
        ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
        scratch: vk::DeviceAddress,
    ) {
        let mode = if update {
            vk::BuildAccelerationStructureModeKHR::UPDATE
        } else {
            vk::BuildAccelerationStructureModeKHR::BUILD
        };
        let src = if update {
            self.handle
        } else {
            vk::AccelerationStructureKHR::null()
        };

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(self.kind)
            .flags(self.build_flags)
            .mode(mode)
            .src_acceleration_structure(src)
            .dst_acceleration_structure(self.handle)
            .geometries(geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch,
            });

        unsafe {
            self.context.accel_fn().cmd_build_acceleration_structures(
                cmd,
                std::slice::from_ref(&build_info),
                &[ranges],
            );
        }

        if let Some(query_pool) = self.query_pool {
            // The size query must not be written before the build it
            // measures has finished.
            let barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
                .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR);
            unsafe {
                self.context.device().cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::DependencyFlags::empty(),
                    std::slice::from_ref(&barrier),
                    &[],
                    &[],
                );
                self.context.device().cmd_reset_query_pool(cmd, query_pool, 0, 1);
                self.context
                    .accel_fn()
                    .cmd_write_acceleration_structures_properties(
                        cmd,
                        std::slice::from_ref(&self.handle),
                        vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                        query_pool,
                        0,
                    );
            }
        }
    }

    /// Blocks until the compacted-size query written by the last build is
    /// available and returns it.
    pub(crate) fn compacted_size(&self) -> Result<vk::DeviceSize, CompactionError> {
        let query_pool = self.query_pool.ok_or(CompactionError::NotAllowed)?;

        let mut results = [0u64; 1];
        unsafe {
            self.context
                .device()
                .get_query_pool_results::<u64>(
                    query_pool,
                    0,
                    &mut results,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )
        }
        .map_err(CompactionError::QueryRead)?;

        Ok(results[0])
    }

    /// Records the compacting copy from `self` into `target`.
    pub(crate) fn record_compact_copy(&self, cmd: vk::CommandBuffer, target: &AccelData) {
        let copy_info = vk::CopyAccelerationStructureInfoKHR::default()
            .src(self.handle)
            .dst(target.handle)
            .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
        unsafe {
            self.context
                .accel_fn()
                .cmd_copy_acceleration_structure(cmd, &copy_info);
        }
    }
}

impl Drop for AccelData {
    fn drop(&mut self) {
        unsafe {
            self.context
                .accel_fn()
                .destroy_acceleration_structure(self.handle, None);
            if let Some(query_pool) = self.query_pool {
                self.context.device().destroy_query_pool(query_pool, None);
            }
        }
        // the backing buffer drops itself
    }
}
