//! Bottom-level acceleration structures over shared vertex/index buffers.

use super::AccelData;
use crate::{context::Context, error::CompactionError, error::CreationError};
use ash::vk;
use smallvec::SmallVec;
use std::sync::Arc;

/// Sub-range of a shared vertex/index buffer pair making up one geometry
/// entry.
///
/// `vertex_base` is an element index while `index_base_bytes` is a byte
/// offset; the asymmetry is part of the geometry collaborator's contract and
/// is lowered as-is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeometryRange {
    /// First vertex of the range, as an element index.
    pub vertex_base: u32,
    /// Number of vertices in the range.
    pub vertex_count: u32,
    /// Offset of the first index, in bytes.
    pub index_base_bytes: u32,
    /// Number of indices in the range; three per triangle.
    pub index_count: u32,
}

impl GeometryRange {
    #[inline]
    pub fn primitive_count(&self) -> u32 {
        self.index_count / 3
    }

    fn lower(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.primitive_count())
            .primitive_offset(self.index_base_bytes)
            .first_vertex(self.vertex_base)
    }
}

/// One triangle-geometry entry referencing shared buffers by device address.
#[derive(Clone, Copy, Debug)]
pub struct TriangleGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub vertex_format: vk::Format,
    pub vertex_stride: vk::DeviceSize,
    /// Highest vertex index addressable through the index buffer.
    pub max_vertex: u32,
    pub index_address: vk::DeviceAddress,
    pub index_type: vk::IndexType,
    pub range: GeometryRange,
    pub flags: vk::GeometryFlagsKHR,
}

/// One AABB-geometry entry for procedural hit groups.
#[derive(Clone, Copy, Debug)]
pub struct AabbGeometry {
    /// Address of a tightly packed `vk::AabbPositionsKHR` array.
    pub data_address: vk::DeviceAddress,
    pub stride: vk::DeviceSize,
    pub count: u32,
    pub flags: vk::GeometryFlagsKHR,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Geometry {
    Triangles(TriangleGeometry),
    Aabbs(AabbGeometry),
}

impl Geometry {
    fn lower(&self) -> vk::AccelerationStructureGeometryKHR<'static> {
        match self {
            Geometry::Triangles(triangles) => vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                        .vertex_format(triangles.vertex_format)
                        .vertex_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: triangles.vertex_address,
                        })
                        .vertex_stride(triangles.vertex_stride)
                        .max_vertex(triangles.max_vertex)
                        .index_type(triangles.index_type)
                        .index_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: triangles.index_address,
                        }),
                })
                .flags(triangles.flags),
            Geometry::Aabbs(aabbs) => vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::AABBS)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                        .data(vk::DeviceOrHostAddressConstKHR {
                            device_address: aabbs.data_address,
                        })
                        .stride(aabbs.stride),
                })
                .flags(aabbs.flags),
        }
    }

    fn range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        match self {
            Geometry::Triangles(triangles) => triangles.range.lower(),
            Geometry::Aabbs(aabbs) => {
                vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(aabbs.count)
            }
        }
    }

    fn primitive_count(&self) -> u32 {
        match self {
            Geometry::Triangles(triangles) => triangles.range.primitive_count(),
            Geometry::Aabbs(aabbs) => aabbs.count,
        }
    }
}

/// Collects geometry entries for a [`BottomLevelAccelerationStructure`].
///
/// The geometry list is fixed once [`BottomLevelBuilder::create`] runs; to
/// change it, clear the builder (or start a new one) and create a new
/// structure.
#[derive(Default)]
pub struct BottomLevelBuilder {
    geometries: Vec<Geometry>,
}

impl BottomLevelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_triangles(&mut self, geometry: TriangleGeometry) -> &mut Self {
        self.geometries.push(Geometry::Triangles(geometry));
        self
    }

    pub fn add_aabbs(&mut self, geometry: AabbGeometry) -> &mut Self {
        self.geometries.push(Geometry::Aabbs(geometry));
        self
    }

    /// Resets the geometry list to empty, forcing re-adds before the next
    /// `create`.
    pub fn clear_geometries(&mut self) -> &mut Self {
        self.geometries.clear();
        self
    }

    /// Sizes and creates the structure for the collected geometry.
    ///
    /// The structure is created but not built; record the build with
    /// [`BottomLevelAccelerationStructure::build`].
    pub fn create(
        &self,
        context: &Arc<Context>,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<BottomLevelAccelerationStructure, CreationError> {
        assert!(
            !self.geometries.is_empty(),
            "a bottom-level acceleration structure needs at least one geometry entry",
        );

        let (lowered, counts) = lower_all(&self.geometries);
        let data = AccelData::create(
            context.clone(),
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            flags,
            &lowered,
            &counts,
            None,
        )?;

        Ok(BottomLevelAccelerationStructure {
            geometries: self.geometries.clone(),
            data,
            built: false,
        })
    }
}

fn lower_all(
    geometries: &[Geometry],
) -> (
    SmallVec<[vk::AccelerationStructureGeometryKHR<'static>; 4]>,
    SmallVec<[u32; 4]>,
) {
    let lowered = geometries.iter().map(Geometry::lower).collect();
    let counts = geometries.iter().map(Geometry::primitive_count).collect();
    (lowered, counts)
}

/// One piece of static geometry wrapped into a traceable structure.
///
/// The geometry list is immutable once built. The device address returned by
/// [`BottomLevelAccelerationStructure::device_address`] is valid until the
/// structure is dropped or replaced by compaction; any holder of the old
/// address (a top-level instance, typically) must be patched explicitly
/// afterwards.
pub struct BottomLevelAccelerationStructure {
    geometries: Vec<Geometry>,
    data: AccelData,
    built: bool,
}

impl BottomLevelAccelerationStructure {
    #[inline]
    pub fn builder() -> BottomLevelBuilder {
        BottomLevelBuilder::new()
    }

    #[inline]
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.data.handle()
    }

    #[inline]
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.data.address()
    }

    #[inline]
    pub fn built(&self) -> bool {
        self.built
    }

    /// Scratch requirement for building (or, if allowed, updating) this
    /// structure. Size a [`crate::ScratchBuffer`] to the maximum across all
    /// structures built in a pass.
    pub fn scratch_buffer_size(&self) -> vk::DeviceSize {
        let (lowered, counts) = lower_all(&self.geometries);
        self.data.scratch_size(&lowered, &counts)
    }

    /// Records a BUILD the first time, or an UPDATE on subsequent calls if
    /// the structure allows updates.
    ///
    /// The command is recorded, not executed; insert a barrier before the
    /// structure is consumed (see [`crate::commands`]).
    pub fn build(&mut self, cmd: vk::CommandBuffer, scratch: vk::DeviceAddress) {
        let update = self.built && self.data.allow_update();
        let (lowered, _) = lower_all(&self.geometries);
        let ranges: SmallVec<[vk::AccelerationStructureBuildRangeInfoKHR; 4]> =
            self.geometries.iter().map(Geometry::range).collect();
        self.data.build(cmd, update, &lowered, &ranges, scratch);
        self.built = true;
    }

    /// Produces a smaller replacement structure from the compacted-size
    /// query written by the last build.
    ///
    /// Blocks on the query readback, so the build must have been submitted
    /// beforehand; reading earlier would wait on a query that is never
    /// written. The returned structure becomes usable once the recorded
    /// copy retires. `self` is left untouched — its address is stale from
    /// the caller's perspective, and every top-level instance referencing it
    /// must be patched to the new structure's address before the next
    /// top-level build. Keep `self` alive until the copy has executed.
    pub fn compact(
        &self,
        cmd: vk::CommandBuffer,
    ) -> Result<BottomLevelAccelerationStructure, CompactionError> {
        if !self.data.allow_compaction() {
            return Err(CompactionError::NotAllowed);
        }
        if !self.built {
            return Err(CompactionError::NotBuilt);
        }

        let compact_size = self.data.compacted_size()?;

        let (lowered, counts) = lower_all(&self.geometries);
        let data = AccelData::create(
            self.data.context.clone(),
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            self.data.build_flags(),
            &lowered,
            &counts,
            Some(compact_size),
        )?;

        self.data.record_compact_copy(cmd, &data);

        Ok(BottomLevelAccelerationStructure {
            geometries: self.geometries.clone(),
            data,
            built: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_lowers_bytes_and_indices_asymmetrically() {
        // vertex_base stays an element index, index_base stays bytes
        let range = GeometryRange {
            vertex_base: 24,
            vertex_count: 24,
            index_base_bytes: 144,
            index_count: 36,
        };
        let lowered = range.lower();
        assert_eq!(lowered.primitive_count, 12);
        assert_eq!(lowered.primitive_offset, 144);
        assert_eq!(lowered.first_vertex, 24);
        assert_eq!(lowered.transform_offset, 0);
    }

    #[test]
    fn primitive_count_is_indices_over_three() {
        let range = GeometryRange {
            vertex_base: 0,
            vertex_count: 3,
            index_base_bytes: 0,
            index_count: 9,
        };
        assert_eq!(range.primitive_count(), 3);
    }

    #[test]
    fn triangle_geometry_lowering() {
        let geometry = Geometry::Triangles(TriangleGeometry {
            vertex_address: 0x1000,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            vertex_stride: 32,
            max_vertex: 47,
            index_address: 0x2000,
            index_type: vk::IndexType::UINT32,
            range: GeometryRange {
                vertex_base: 0,
                vertex_count: 48,
                index_base_bytes: 0,
                index_count: 72,
            },
            flags: vk::GeometryFlagsKHR::OPAQUE,
        });

        let lowered = geometry.lower();
        assert_eq!(lowered.geometry_type, vk::GeometryTypeKHR::TRIANGLES);
        assert_eq!(lowered.flags, vk::GeometryFlagsKHR::OPAQUE);
        let triangles = unsafe { lowered.geometry.triangles };
        assert_eq!(unsafe { triangles.vertex_data.device_address }, 0x1000);
        assert_eq!(triangles.vertex_stride, 32);
        assert_eq!(triangles.max_vertex, 47);
        assert_eq!(unsafe { triangles.index_data.device_address }, 0x2000);
        assert_eq!(geometry.primitive_count(), 24);
    }
}
