//! Shader binding table layout and packing.
//!
//! The table is one buffer holding four contiguous regions, one per group
//! role, in the fixed order raygen, miss, hit, callable. Within a region
//! every record occupies the same stride: the opaque group handle followed
//! by that group's optional inline shader record, padded to the largest
//! record in the role and aligned to the handle alignment. Region bases are
//! aligned to the device's base alignment.
//!
//! Layout and packing are pure functions of the device limits
//! ([`crate::RayTracingProperties`]) so they can be tested without a
//! device; only handle retrieval and the final buffer upload talk to it.
//! The table is immutable once created — when the pipeline's group list
//! changes, build a new table.

use crate::{
    align_up,
    buffer::Buffer,
    context::{Context, RayTracingProperties},
    error::CreationError,
    pipeline::{GroupRole, RayTracingPipeline},
};
use ash::vk;
use gpu_allocator::MemoryLocation;
use log::debug;
use std::sync::Arc;

/// Stride, record count and byte offset of one role's region within the
/// packed table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RegionLayout {
    pub offset: vk::DeviceSize,
    pub stride: vk::DeviceSize,
    pub count: u32,
}

impl RegionLayout {
    /// The size reported to the trace dispatch: records only, without the
    /// base-alignment padding that separates regions.
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.count as vk::DeviceSize * self.stride
    }
}

/// The computed layout of a full table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SbtLayout {
    pub regions: [RegionLayout; 4],
    /// Sum of the base-aligned region sizes.
    pub table_size: vk::DeviceSize,
    pub handle_size: u32,
}

impl SbtLayout {
    /// Sizes each role's region from the classified group list and the
    /// per-group inline record sizes.
    ///
    /// A role with no groups gets a zero-sized region; inline records
    /// within a role are all padded to the role's maximum record size.
    pub(crate) fn compute(
        roles: &[GroupRole],
        record_sizes: &[usize],
        properties: &RayTracingProperties,
    ) -> SbtLayout {
        debug_assert_eq!(roles.len(), record_sizes.len());

        let handle_size = properties.shader_group_handle_size;
        let handle_alignment = properties.shader_group_handle_alignment as vk::DeviceSize;
        let base_alignment = properties.shader_group_base_alignment as vk::DeviceSize;

        let mut counts = [0u32; 4];
        let mut max_record = [0u64; 4];
        for (role, record_size) in roles.iter().zip(record_sizes) {
            counts[role.index()] += 1;
            max_record[role.index()] = max_record[role.index()].max(*record_size as u64);
        }

        let mut regions = [RegionLayout::default(); 4];
        let mut cursor = 0;
        for role in GroupRole::ORDER {
            let index = role.index();
            if counts[index] == 0 {
                continue;
            }
            let stride = align_up(handle_size as u64 + max_record[index], handle_alignment);
            regions[index] = RegionLayout {
                offset: cursor,
                stride,
                count: counts[index],
            };
            cursor += align_up(counts[index] as u64 * stride, base_alignment);
        }

        SbtLayout {
            regions,
            table_size: cursor,
            handle_size,
        }
    }

    /// Packs every group's handle and inline record into a table image.
    ///
    /// Groups keep their original relative order within each role; unused
    /// tail bytes within a stride stay zero.
    pub(crate) fn pack(&self, roles: &[GroupRole], handles: &[u8], records: &[&[u8]]) -> Vec<u8> {
        let handle_size = self.handle_size as usize;
        debug_assert_eq!(handles.len(), roles.len() * handle_size);

        let mut table = vec![0u8; self.table_size as usize];
        let mut slot = [0u32; 4];

        for (index, role) in roles.iter().enumerate() {
            let region = &self.regions[role.index()];
            let start = (region.offset + slot[role.index()] as u64 * region.stride) as usize;
            slot[role.index()] += 1;

            table[start..start + handle_size]
                .copy_from_slice(&handles[index * handle_size..(index + 1) * handle_size]);

            let record = records.get(index).copied().unwrap_or(&[]);
            table[start + handle_size..start + handle_size + record.len()]
                .copy_from_slice(record);
        }

        table
    }
}

/// Narrows a role region down to the single record at `index`.
///
/// The trace dispatch takes exactly one raygen record, so the result spans
/// one stride (`size == stride`); an index past the region's record count
/// is a caller contract error and panics.
pub(crate) fn select_record(
    region: &vk::StridedDeviceAddressRegionKHR,
    index: u32,
) -> vk::StridedDeviceAddressRegionKHR {
    assert!(
        (index as u64) * region.stride < region.size,
        "record {} out of bounds (region holds {} bytes at stride {})",
        index,
        region.size,
        region.stride,
    );
    vk::StridedDeviceAddressRegionKHR {
        device_address: region.device_address + index as u64 * region.stride,
        stride: region.stride,
        size: region.stride,
    }
}

/// Per-role strided address regions over one GPU buffer, consumed by a
/// trace dispatch.
pub struct ShaderBindingTable {
    #[allow(dead_code)] // holds the device memory the regions point into
    buffer: Buffer,
    regions: [vk::StridedDeviceAddressRegionKHR; 4],
}

impl ShaderBindingTable {
    /// Builds the table for `pipeline`.
    ///
    /// `records` supplies the optional inline shader record for each group,
    /// one slot per group in pipeline order; pass an empty slice when no
    /// group carries a record.
    pub fn new(
        context: &Arc<Context>,
        pipeline: &RayTracingPipeline,
        records: &[&[u8]],
    ) -> Result<ShaderBindingTable, CreationError> {
        let roles = pipeline.group_roles();
        assert!(
            records.is_empty() || records.len() == roles.len(),
            "one record slot per shader group expected ({} groups, {} records)",
            roles.len(),
            records.len(),
        );

        let record_sizes: Vec<usize> = if records.is_empty() {
            vec![0; roles.len()]
        } else {
            records.iter().map(|record| record.len()).collect()
        };

        let properties = *context.properties();
        let layout = SbtLayout::compute(roles, &record_sizes, &properties);

        // one batched query for every group handle, in pipeline order
        let group_count = roles.len() as u32;
        let handles = unsafe {
            context.rt_fn().get_ray_tracing_shader_group_handles(
                pipeline.handle(),
                0,
                group_count,
                (properties.shader_group_handle_size * group_count) as usize,
            )
        }
        .map_err(CreationError::from_vk)?;

        let table = layout.pack(roles, &handles, records);

        // extra base_alignment bytes so the base address can be rounded up
        let base_alignment = properties.shader_group_base_alignment as vk::DeviceSize;
        let mut buffer = Buffer::new(
            context.clone(),
            layout.table_size + base_alignment,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            "shader binding table",
        )?;

        let address = buffer.device_address();
        let base = align_up(address, base_alignment);
        let shift = (base - address) as usize;
        let mapped = buffer
            .mapped_slice_mut()
            .ok_or(CreationError::Unmapped)?;
        mapped[shift..shift + table.len()].copy_from_slice(&table);

        let regions = layout.regions.map(|region| {
            if region.count == 0 {
                vk::StridedDeviceAddressRegionKHR::default()
            } else {
                vk::StridedDeviceAddressRegionKHR {
                    device_address: base + region.offset,
                    stride: region.stride,
                    size: region.size(),
                }
            }
        });

        debug!(
            "shader binding table packed ({} groups, {} bytes)",
            group_count, layout.table_size,
        );

        Ok(ShaderBindingTable { buffer, regions })
    }

    /// Region for one raygen group.
    ///
    /// A trace dispatch takes a single raygen record rather than a region,
    /// so the returned region covers exactly the record at `index`
    /// (`size == stride`).
    pub fn raygen_region(&self, index: u32) -> vk::StridedDeviceAddressRegionKHR {
        select_record(&self.regions[GroupRole::Raygen.index()], index)
    }

    /// Miss shaders are selected per trace call in shader code; the full
    /// region is handed to the dispatch.
    #[inline]
    pub fn miss_region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.regions[GroupRole::Miss.index()]
    }

    #[inline]
    pub fn hit_region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.regions[GroupRole::Hit.index()]
    }

    /// Zero-sized when the pipeline has no callable shaders, which a trace
    /// dispatch accepts as "none".
    #[inline]
    pub fn callable_region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.regions[GroupRole::Callable.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties() -> RayTracingProperties {
        RayTracingProperties {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 4,
            min_scratch_offset_alignment: 128,
        }
    }

    const RMHH: [GroupRole; 4] = [
        GroupRole::Raygen,
        GroupRole::Miss,
        GroupRole::Hit,
        GroupRole::Hit,
    ];

    #[test]
    fn counts_and_sizes_for_raygen_miss_hit_hit() {
        let layout = SbtLayout::compute(&RMHH, &[0; 4], &properties());

        let [raygen, miss, hit, callable] = layout.regions;
        assert_eq!(raygen.count, 1);
        assert_eq!(miss.count, 1);
        assert_eq!(hit.count, 2);
        assert_eq!(callable.count, 0);
        assert_eq!(hit.size(), 2 * hit.stride);
        assert_eq!(callable.size(), 0);
        for region in [raygen, miss, hit] {
            assert!(region.stride >= 32);
            assert_eq!(region.size(), region.count as u64 * region.stride);
        }
    }

    #[test]
    fn region_offsets_are_base_aligned() {
        let layout = SbtLayout::compute(&RMHH, &[0; 4], &properties());
        for region in &layout.regions {
            assert_eq!(region.offset % 64, 0);
        }
        // raygen: 1 * 32 rounded to 64; miss the same; hit starts at 128
        assert_eq!(layout.regions[GroupRole::Hit.index()].offset, 128);
        assert_eq!(layout.table_size, 192);
    }

    #[test]
    fn records_pad_to_the_role_maximum() {
        // two hit records of different sizes share the hit stride
        let roles = [GroupRole::Raygen, GroupRole::Hit, GroupRole::Hit];
        let layout = SbtLayout::compute(&roles, &[0, 4, 20], &properties());

        let hit = layout.regions[GroupRole::Hit.index()];
        // 32 handle + 20 record = 52, aligned to 32 -> 64
        assert_eq!(hit.stride, 64);
        let raygen = layout.regions[GroupRole::Raygen.index()];
        assert_eq!(raygen.stride, 32);
    }

    #[test]
    fn zero_callable_groups_is_a_valid_empty_region() {
        let roles = [GroupRole::Raygen];
        let layout = SbtLayout::compute(&roles, &[0], &properties());
        let callable = layout.regions[GroupRole::Callable.index()];
        assert_eq!(callable.size(), 0);
        assert_eq!(callable.count, 0);
        assert_eq!(layout.table_size, 64);
    }

    #[test]
    fn packing_places_handles_then_records() {
        let roles = [GroupRole::Raygen, GroupRole::Miss];
        let layout = SbtLayout::compute(&roles, &[0, 8], &properties());

        let mut handles = vec![0u8; 64];
        handles[..32].fill(0xaa);
        handles[32..].fill(0xbb);
        let record = [0x11u8; 8];
        let table = layout.pack(&roles, &handles, &[&[], &record]);

        let miss = layout.regions[GroupRole::Miss.index()];
        let miss_start = miss.offset as usize;
        assert!(table[..32].iter().all(|byte| *byte == 0xaa));
        // unused tail of the raygen stride stays zero
        assert!(table[32..64].iter().all(|byte| *byte == 0));
        assert!(table[miss_start..miss_start + 32]
            .iter()
            .all(|byte| *byte == 0xbb));
        assert_eq!(&table[miss_start + 32..miss_start + 40], &record);
        assert!(table[miss_start + 40..miss_start + miss.stride as usize]
            .iter()
            .all(|byte| *byte == 0));
    }

    #[test]
    fn raygen_selection_covers_exactly_one_record() {
        let region = vk::StridedDeviceAddressRegionKHR {
            device_address: 0x10000,
            stride: 64,
            size: 128,
        };

        let first = select_record(&region, 0);
        assert_eq!(first.device_address, region.device_address);
        assert_eq!(first.stride, region.stride);
        assert_eq!(first.size, region.stride);

        let second = select_record(&region, 1);
        assert_eq!(second.device_address, region.device_address + region.stride);
        assert_eq!(second.size, region.stride);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn raygen_selection_rejects_an_index_past_the_region() {
        let region = vk::StridedDeviceAddressRegionKHR {
            device_address: 0x10000,
            stride: 64,
            size: 128,
        };
        select_record(&region, 2);
    }

    #[test]
    fn packing_keeps_relative_order_within_a_role() {
        let roles = [GroupRole::Raygen, GroupRole::Hit, GroupRole::Hit];
        let layout = SbtLayout::compute(&roles, &[0; 3], &properties());

        let mut handles = vec![0u8; 96];
        handles[32..64].fill(1); // first hit group
        handles[64..96].fill(2); // second hit group
        let table = layout.pack(&roles, &handles, &[]);

        let hit = layout.regions[GroupRole::Hit.index()];
        let first = hit.offset as usize;
        let second = (hit.offset + hit.stride) as usize;
        assert!(table[first..first + 32].iter().all(|byte| *byte == 1));
        assert!(table[second..second + 32].iter().all(|byte| *byte == 2));
    }
}
