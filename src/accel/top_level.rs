//! Top-level acceleration structures: ordered instance lists over
//! bottom-level structures.
//!
//! The instance array lives in a persistently host-mapped, device-readable
//! buffer. The host is its only writer and the device its only reader;
//! ordering between the two relies on the per-frame barrier chain (see
//! [`crate::commands`]), not on locks: host writes are issued in program
//! order before the build command that consumes them is submitted.

use super::AccelData;
use crate::{buffer::Buffer, context::Context, error::CreationError};
use crate::accel::BottomLevelAccelerationStructure;
use ash::vk;
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use log::warn;
use std::mem;
use std::sync::Arc;

const INSTANCE_SIZE: usize = mem::size_of::<vk::AccelerationStructureInstanceKHR>();

/// Transposes a column-major `Mat4` into the row-major 3×4 layout the
/// device expects.
pub(crate) fn pack_transform(transform: Mat4) -> vk::TransformMatrixKHR {
    let rows = transform.transpose();
    let mut matrix = [0.0f32; 12];
    matrix[0..4].copy_from_slice(&rows.x_axis.to_array());
    matrix[4..8].copy_from_slice(&rows.y_axis.to_array());
    matrix[8..12].copy_from_slice(&rows.z_axis.to_array());
    vk::TransformMatrixKHR { matrix }
}

/// Builds one instance record. Visibility mask is all-on, the per-instance
/// SBT record offset and flags are zero.
pub(crate) fn make_instance(
    blas_address: vk::DeviceAddress,
    custom_index: u32,
    transform: Mat4,
) -> vk::AccelerationStructureInstanceKHR {
    vk::AccelerationStructureInstanceKHR {
        transform: pack_transform(transform),
        instance_custom_index_and_mask: vk::Packed24_8::new(custom_index, 0xff),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(0, 0),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    }
}

fn instance_bytes(records: &[vk::AccelerationStructureInstanceKHR]) -> &[u8] {
    // repr(C), no padding: 48 transform bytes, two packed u32s, one u64
    unsafe {
        std::slice::from_raw_parts(records.as_ptr().cast::<u8>(), records.len() * INSTANCE_SIZE)
    }
}

/// Uploads the whole instance array into the mapped buffer.
///
/// A missing mapping is an allocator misconfiguration; erroring out here
/// beats letting the device read a zero-filled instance list.
fn upload_instances(
    mapped: Option<&mut [u8]>,
    instances: &[vk::AccelerationStructureInstanceKHR],
) -> Result<(), CreationError> {
    let mapped = mapped.ok_or(CreationError::Unmapped)?;
    let bytes = instance_bytes(instances);
    mapped[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Overwrites record `index` inside the mapped instance array.
fn write_record(mapped: &mut [u8], index: usize, record: &vk::AccelerationStructureInstanceKHR) {
    let offset = index * INSTANCE_SIZE;
    mapped[offset..offset + INSTANCE_SIZE]
        .copy_from_slice(instance_bytes(std::slice::from_ref(record)));
}

/// Patches only the 3×4 transform of record `index`, leaving the custom
/// index, mask, record offset, flags and structure reference untouched.
fn write_record_transform(mapped: &mut [u8], index: usize, transform: &vk::TransformMatrixKHR) {
    let offset = index * INSTANCE_SIZE;
    let bytes: &[u8] = bytemuck::cast_slice(&transform.matrix);
    mapped[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn instances_geometry(
    instance_buffer_address: vk::DeviceAddress,
) -> vk::AccelerationStructureGeometryKHR<'static> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: instance_buffer_address,
                }),
        })
}

/// Collects instances for a [`TopLevelAccelerationStructure`].
///
/// The instance count is fixed once `create` runs; adding or removing
/// instances afterwards requires building a new structure.
#[derive(Default)]
pub struct TopLevelBuilder {
    instances: Vec<vk::AccelerationStructureInstanceKHR>,
}

impl TopLevelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an instance referencing `blas` at its current device
    /// address.
    pub fn add_instance(
        &mut self,
        blas: &BottomLevelAccelerationStructure,
        custom_index: u32,
        transform: Mat4,
    ) -> &mut Self {
        self.instances
            .push(make_instance(blas.device_address(), custom_index, transform));
        self
    }

    pub fn clear_instances(&mut self) -> &mut Self {
        self.instances.clear();
        self
    }

    #[inline]
    pub fn instance_count(&self) -> u32 {
        self.instances.len() as u32
    }

    /// Uploads the instance list into a persistently mapped buffer and
    /// creates the structure sized for it.
    pub fn create(
        self,
        context: &Arc<Context>,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<TopLevelAccelerationStructure, CreationError> {
        let buffer_size = (self.instances.len().max(1) * INSTANCE_SIZE) as vk::DeviceSize;
        let mut instance_buffer = Buffer::new(
            context.clone(),
            buffer_size,
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            MemoryLocation::CpuToGpu,
            "top-level instance buffer",
        )?;

        upload_instances(instance_buffer.mapped_slice_mut(), &self.instances)?;

        let geometry = instances_geometry(instance_buffer.device_address());
        let data = AccelData::create(
            context.clone(),
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            flags,
            std::slice::from_ref(&geometry),
            &[self.instances.len() as u32],
            None,
        )?;

        let handle = data.handle();
        Ok(TopLevelAccelerationStructure {
            instances: self.instances,
            instance_buffer,
            data,
            descriptor_handle: [handle],
            built: false,
        })
    }
}

/// An ordered, index-addressable instance list wrapped into a traceable
/// structure.
///
/// Only instance transforms may be patched between builds
/// ([`set_instance_transform`](Self::set_instance_transform)); changing
/// which bottom-level structure an instance references
/// ([`update_instance`](Self::update_instance), required after compaction)
/// mandates a full build rather than an update.
pub struct TopLevelAccelerationStructure {
    instances: Vec<vk::AccelerationStructureInstanceKHR>,
    instance_buffer: Buffer,
    data: AccelData,
    descriptor_handle: [vk::AccelerationStructureKHR; 1],
    built: bool,
}

impl TopLevelAccelerationStructure {
    #[inline]
    pub fn builder() -> TopLevelBuilder {
        TopLevelBuilder::new()
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
    pub fn instance_count(&self) -> u32 {
        self.instances.len() as u32
    }

    #[inline]
    pub fn built(&self) -> bool {
        self.built
    }

    /// Descriptor payload for a
    /// [`vk::DescriptorType::ACCELERATION_STRUCTURE_KHR`] binding; chain it
    /// into the collaborator's `vk::WriteDescriptorSet`.
    pub fn descriptor(&self) -> vk::WriteDescriptorSetAccelerationStructureKHR<'_> {
        vk::WriteDescriptorSetAccelerationStructureKHR::default()
            .acceleration_structures(&self.descriptor_handle)
    }

    /// Rewrites instance `index` to reference `blas` at its current device
    /// address, in both the host-side copy and the mapped buffer.
    ///
    /// Required after `blas` replaced a compacted predecessor: the address
    /// embedded in the record went stale the moment the predecessor was
    /// replaced. Record a full build afterwards — an address change is a
    /// structural change, not an updatable one.
    pub fn update_instance(
        &mut self,
        index: usize,
        blas: &BottomLevelAccelerationStructure,
        transform: Option<Mat4>,
    ) {
        if index >= self.instances.len() {
            warn!(
                "instance index {} out of bounds ({} instances)",
                index,
                self.instances.len()
            );
            return;
        }

        let record = &mut self.instances[index];
        record.acceleration_structure_reference = vk::AccelerationStructureReferenceKHR {
            device_handle: blas.device_address(),
        };
        if let Some(transform) = transform {
            record.transform = pack_transform(transform);
        }

        let record = self.instances[index];
        if let Some(mapped) = self.instance_buffer.mapped_slice_mut() {
            write_record(mapped, index, &record);
        }
    }

    /// Patches only the transform of instance `index`, directly in the
    /// mapped buffer.
    ///
    /// This is the per-frame animation path: patch transforms, then record
    /// a build/update so the device-side index reflects them before the
    /// next trace.
    pub fn set_instance_transform(&mut self, index: usize, transform: Mat4) {
        if index >= self.instances.len() {
            warn!(
                "instance index {} out of bounds ({} instances)",
                index,
                self.instances.len()
            );
            return;
        }

        let packed = pack_transform(transform);
        if let Some(mapped) = self.instance_buffer.mapped_slice_mut() {
            write_record_transform(mapped, index, &packed);
        }
    }

    /// Scratch requirement for building or (if allowed) updating this
    /// structure.
    pub fn scratch_buffer_size(&self) -> vk::DeviceSize {
        let geometry = instances_geometry(self.instance_buffer.device_address());
        self.data.scratch_size(
            std::slice::from_ref(&geometry),
            &[self.instances.len() as u32],
        )
    }

    /// Records a BUILD the first time, or an UPDATE on subsequent calls if
    /// the structure allows updates.
    pub fn build(&mut self, cmd: vk::CommandBuffer, scratch: vk::DeviceAddress) {
        let update = self.built && self.data.allow_update();
        let geometry = instances_geometry(self.instance_buffer.device_address());
        let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.instances.len() as u32);
        self.data.build(
            cmd,
            update,
            std::slice::from_ref(&geometry),
            std::slice::from_ref(&range),
            scratch,
        );
        self.built = true;
    }

    /// Records an UPDATE; does nothing before the first build.
    pub fn update(&mut self, cmd: vk::CommandBuffer, scratch: vk::DeviceAddress) {
        if !self.built {
            warn!("top-level update requested before the first build");
            return;
        }
        self.build(cmd, scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Vec3, Vec4};

    fn reference(record: &vk::AccelerationStructureInstanceKHR) -> u64 {
        unsafe { record.acceleration_structure_reference.device_handle }
    }

    #[test]
    fn transform_is_transposed_into_rows() {
        let transform = Mat4::from_cols(
            Vec4::new(1.0, 2.0, 3.0, 0.0),
            Vec4::new(4.0, 5.0, 6.0, 0.0),
            Vec4::new(7.0, 8.0, 9.0, 0.0),
            Vec4::new(10.0, 11.0, 12.0, 1.0),
        );
        let packed = pack_transform(transform);
        // row-major 3x4: each row is (basis x, basis y, basis z, translation)
        assert_eq!(packed.matrix[0..4], [1.0, 4.0, 7.0, 10.0]);
        assert_eq!(packed.matrix[4..8], [2.0, 5.0, 8.0, 11.0]);
        assert_eq!(packed.matrix[8..12], [3.0, 6.0, 9.0, 12.0]);
    }

    #[test]
    fn identity_transform_rows() {
        let packed = pack_transform(Mat4::IDENTITY);
        assert_eq!(packed.matrix[0..4], [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(packed.matrix[4..8], [0.0, 1.0, 0.0, 0.0]);
        assert_eq!(packed.matrix[8..12], [0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn instance_record_packing() {
        let record = make_instance(0xdead_beef, 7, Mat4::IDENTITY);
        assert_eq!(reference(&record), 0xdead_beef);
        assert_eq!(record.instance_custom_index_and_mask.low_24(), 7);
        assert_eq!(record.instance_custom_index_and_mask.high_8(), 0xff);
        assert_eq!(
            record
                .instance_shader_binding_table_record_offset_and_flags
                .low_24(),
            0
        );
    }

    #[test]
    fn transform_patch_is_idempotent() {
        let record = make_instance(0x1000, 0, Mat4::IDENTITY);
        let mut mapped = vec![0u8; 2 * INSTANCE_SIZE];
        write_record(&mut mapped, 0, &record);
        write_record(&mut mapped, 1, &record);

        let transform = pack_transform(Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        write_record_transform(&mut mapped, 1, &transform);
        let once = mapped.clone();
        write_record_transform(&mut mapped, 1, &transform);
        assert_eq!(mapped, once);
    }

    #[test]
    fn transform_patch_leaves_other_fields_untouched() {
        let record = make_instance(0xabcd, 42, Mat4::IDENTITY);
        let mut mapped = vec![0u8; INSTANCE_SIZE];
        write_record(&mut mapped, 0, &record);

        let tail_before = mapped[48..].to_vec();
        let transform = pack_transform(Mat4::from_translation(Vec3::splat(5.0)));
        write_record_transform(&mut mapped, 0, &transform);
        assert_eq!(&mapped[48..], &tail_before[..]);
        assert_eq!(&mapped[..48], bytemuck::cast_slice::<f32, u8>(&transform.matrix));
    }

    #[test]
    fn upload_writes_every_record() {
        let records = [
            make_instance(0x1000, 0, Mat4::IDENTITY),
            make_instance(0x2000, 1, Mat4::IDENTITY),
        ];
        let mut mapped = vec![0u8; 2 * INSTANCE_SIZE];
        upload_instances(Some(&mut mapped), &records).unwrap();
        assert_eq!(&mapped[..], instance_bytes(&records));
    }

    #[test]
    fn upload_without_a_mapping_is_an_error() {
        let records = [make_instance(0x1000, 0, Mat4::IDENTITY)];
        let result = upload_instances(None, &records);
        assert!(matches!(result, Err(CreationError::Unmapped)));
    }

    #[test]
    fn address_relocation_touches_only_the_target_record() {
        // two instances, then instance 0 is repointed at a compacted
        // replacement; instance 1 must be untouched
        let mut records = vec![
            make_instance(0x1000, 0, Mat4::IDENTITY),
            make_instance(0x2000, 1, Mat4::IDENTITY),
        ];

        records[0].acceleration_structure_reference = vk::AccelerationStructureReferenceKHR {
            device_handle: 0x3000,
        };

        assert_eq!(reference(&records[0]), 0x3000);
        assert_eq!(reference(&records[1]), 0x2000);
        assert_eq!(records.len(), 2);
    }
}
