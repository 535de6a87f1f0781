//! Device context shared by every object in this crate.
//!
//! The [`Context`] does not own the Vulkan device; it keeps clones of the
//! function tables (plain function pointers) for the core device and the two
//! ray-tracing extensions, a snapshot of the capability limits this crate
//! consumes, and the GPU memory allocator used for every backing buffer.

use crate::error::CreationError;
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// The capability limits consumed by this crate, captured once at context
/// creation.
///
/// The fields are public so that the pure layout routines (see
/// [`crate::sbt`]) can be exercised with synthetic limits in tests.
#[derive(Clone, Copy, Debug)]
pub struct RayTracingProperties {
    /// Size in bytes of one opaque shader-group handle.
    pub shader_group_handle_size: u32,
    /// Required alignment of each record within a shader binding table
    /// region.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of each shader binding table region's base
    /// address.
    pub shader_group_base_alignment: u32,
    /// Upper bound for the recursion depth of a ray-tracing pipeline.
    pub max_ray_recursion_depth: u32,
    /// Required alignment of the scratch address passed to a build.
    pub min_scratch_offset_alignment: u32,
}

impl RayTracingProperties {
    /// Queries the limits from `physical_device`.
    pub fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let mut pipeline_properties =
            vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel_properties =
            vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut pipeline_properties)
            .push_next(&mut accel_properties);

        unsafe {
            instance.get_physical_device_properties2(physical_device, &mut properties2);
        }

        RayTracingProperties {
            shader_group_handle_size: pipeline_properties.shader_group_handle_size,
            shader_group_handle_alignment: pipeline_properties.shader_group_handle_alignment,
            shader_group_base_alignment: pipeline_properties.shader_group_base_alignment,
            max_ray_recursion_depth: pipeline_properties.max_ray_recursion_depth,
            min_scratch_offset_alignment: accel_properties
                .min_acceleration_structure_scratch_offset_alignment,
        }
    }
}

/// Function tables, capability limits and the memory allocator for one
/// logical device.
pub struct Context {
    device: ash::Device,
    acceleration_structure_fn: ash::khr::acceleration_structure::Device,
    ray_tracing_pipeline_fn: ash::khr::ray_tracing_pipeline::Device,
    properties: RayTracingProperties,
    allocator: Mutex<Allocator>,
}

impl Context {
    /// Creates a context for `device`.
    ///
    /// The device must have been created with the
    /// `VK_KHR_acceleration_structure` and `VK_KHR_ray_tracing_pipeline`
    /// extensions and the buffer-device-address feature enabled.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Arc<Context>, CreationError> {
        let properties = RayTracingProperties::query(instance, physical_device);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        Ok(Arc::new(Context {
            device: device.clone(),
            acceleration_structure_fn: ash::khr::acceleration_structure::Device::new(
                instance, device,
            ),
            ray_tracing_pipeline_fn: ash::khr::ray_tracing_pipeline::Device::new(
                instance, device,
            ),
            properties,
            allocator: Mutex::new(allocator),
        }))
    }

    #[inline]
    pub(crate) fn device(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub(crate) fn accel_fn(&self) -> &ash::khr::acceleration_structure::Device {
        &self.acceleration_structure_fn
    }

    #[inline]
    pub(crate) fn rt_fn(&self) -> &ash::khr::ray_tracing_pipeline::Device {
        &self.ray_tracing_pipeline_fn
    }

    /// The capability limits captured at context creation.
    #[inline]
    pub fn properties(&self) -> &RayTracingProperties {
        &self.properties
    }

    pub(crate) fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}
