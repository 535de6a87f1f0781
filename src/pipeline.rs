//! Ray-tracing pipelines: shader stages, shader groups and their roles.
//!
//! A pipeline is built in one call from a plain description struct and torn
//! down on drop; there are no incremental mutators. The ordered shader-group
//! list given here is the same list the shader binding table is laid out
//! from, so group roles and their ordering are validated before the pipeline
//! is created.

use crate::{context::Context, error::CreationError};
use ash::vk;
use log::debug;
use std::sync::Arc;

/// One compiled shader stage.
#[derive(Clone, Copy, Debug)]
pub struct ShaderStageDesc<'a> {
    /// SPIR-V words.
    pub spirv: &'a [u32],
    /// Exactly one of the six ray-tracing stages.
    pub stage: vk::ShaderStageFlags,
}

/// One shader group, referencing stages by their index in the stage list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderGroupDesc {
    /// Wraps exactly one raygen, miss or callable stage.
    General { shader: u32 },
    /// Triangle hit group.
    TrianglesHit {
        closest_hit: u32,
        any_hit: Option<u32>,
    },
    /// Procedural hit group; intersection is mandatory.
    ProceduralHit {
        intersection: u32,
        closest_hit: Option<u32>,
        any_hit: Option<u32>,
    },
}

/// Role a shader group plays in the shader binding table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum GroupRole {
    Raygen,
    Miss,
    Hit,
    Callable,
}

impl GroupRole {
    /// Fixed table order: raygen, miss, hit, callable.
    pub(crate) const ORDER: [GroupRole; 4] = [
        GroupRole::Raygen,
        GroupRole::Miss,
        GroupRole::Hit,
        GroupRole::Callable,
    ];

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Classifies every group and enforces the monotonic role ordering
/// raygen → miss → hit → callable.
///
/// Violations are caller contract errors and panic; nothing is sent to the
/// device first.
pub(crate) fn classify_groups(
    groups: &[ShaderGroupDesc],
    stages: &[vk::ShaderStageFlags],
) -> Vec<GroupRole> {
    let mut roles = Vec::with_capacity(groups.len());
    let mut previous = GroupRole::Raygen;

    for (index, group) in groups.iter().enumerate() {
        let role = match group {
            ShaderGroupDesc::General { shader } => {
                let stage = stages
                    .get(*shader as usize)
                    .unwrap_or_else(|| panic!("group {} references stage {} out of bounds", index, shader));
                match *stage {
                    vk::ShaderStageFlags::RAYGEN_KHR => GroupRole::Raygen,
                    vk::ShaderStageFlags::MISS_KHR => GroupRole::Miss,
                    vk::ShaderStageFlags::CALLABLE_KHR => GroupRole::Callable,
                    other => panic!(
                        "general group {} wraps a non-general stage {:?}",
                        index, other
                    ),
                }
            }
            ShaderGroupDesc::TrianglesHit { .. } | ShaderGroupDesc::ProceduralHit { .. } => {
                GroupRole::Hit
            }
        };

        assert!(
            role >= previous,
            "shader groups must be ordered raygen, miss, hit, callable; group {} is {:?} after a {:?} group",
            index,
            role,
            previous,
        );
        previous = role;
        roles.push(role);
    }

    roles
}

fn lower_group(group: &ShaderGroupDesc) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    let unused = vk::SHADER_UNUSED_KHR;
    match *group {
        ShaderGroupDesc::General { shader } => vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(shader)
            .closest_hit_shader(unused)
            .any_hit_shader(unused)
            .intersection_shader(unused),
        ShaderGroupDesc::TrianglesHit {
            closest_hit,
            any_hit,
        } => vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .general_shader(unused)
            .closest_hit_shader(closest_hit)
            .any_hit_shader(any_hit.unwrap_or(unused))
            .intersection_shader(unused),
        ShaderGroupDesc::ProceduralHit {
            intersection,
            closest_hit,
            any_hit,
        } => vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP)
            .general_shader(unused)
            .closest_hit_shader(closest_hit.unwrap_or(unused))
            .any_hit_shader(any_hit.unwrap_or(unused))
            .intersection_shader(intersection),
    }
}

/// Configuration for [`RayTracingPipeline::new`].
#[derive(Clone, Copy, Debug)]
pub struct RayTracingPipelineDesc<'a> {
    pub stages: &'a [ShaderStageDesc<'a>],
    /// Groups in shader-binding-table order: raygen, miss, hit, callable.
    pub groups: &'a [ShaderGroupDesc],
    /// Requested recursion depth; clamped to the device limit.
    pub max_recursion_depth: u32,
    pub layout: vk::PipelineLayout,
}

/// A ray-tracing pipeline and the group roles its shader binding table is
/// laid out from.
pub struct RayTracingPipeline {
    context: Arc<Context>,
    handle: vk::Pipeline,
    modules: Vec<vk::ShaderModule>,
    roles: Vec<GroupRole>,
    max_recursion_depth: u32,
}

impl RayTracingPipeline {
    /// Creates the shader modules and the pipeline in one call.
    ///
    /// Panics if the group list violates the raygen → miss → hit → callable
    /// ordering, or if a general group wraps a hit-stage shader.
    pub fn new(
        context: &Arc<Context>,
        desc: &RayTracingPipelineDesc<'_>,
    ) -> Result<RayTracingPipeline, CreationError> {
        let stage_flags: Vec<vk::ShaderStageFlags> =
            desc.stages.iter().map(|stage| stage.stage).collect();
        let roles = classify_groups(desc.groups, &stage_flags);

        let mut modules = Vec::with_capacity(desc.stages.len());
        for stage in desc.stages {
            let create_info = vk::ShaderModuleCreateInfo::default().code(stage.spirv);
            let module = unsafe { context.device().create_shader_module(&create_info, None) };
            match module {
                Ok(module) => modules.push(module),
                Err(result) => {
                    destroy_modules(context, &modules);
                    return Err(CreationError::from_vk(result));
                }
            }
        }

        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo<'_>> = desc
            .stages
            .iter()
            .zip(&modules)
            .map(|(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage)
                    .module(*module)
                    .name(c"main")
            })
            .collect();
        let group_infos: Vec<vk::RayTracingShaderGroupCreateInfoKHR<'_>> =
            desc.groups.iter().map(lower_group).collect();

        let max_recursion_depth = desc
            .max_recursion_depth
            .min(context.properties().max_ray_recursion_depth);

        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stage_infos)
            .groups(&group_infos)
            .max_pipeline_ray_recursion_depth(max_recursion_depth)
            .layout(desc.layout);

        let pipelines = unsafe {
            context.rt_fn().create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&create_info),
                None,
            )
        };
        let handle = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, result)) => {
                destroy_modules(context, &modules);
                return Err(CreationError::from_vk(result));
            }
        };

        debug!(
            "created ray-tracing pipeline ({} stages, {} groups, depth {})",
            desc.stages.len(),
            desc.groups.len(),
            max_recursion_depth,
        );

        Ok(RayTracingPipeline {
            context: context.clone(),
            handle,
            modules,
            roles,
            max_recursion_depth,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    #[inline]
    pub fn group_count(&self) -> u32 {
        self.roles.len() as u32
    }

    #[inline]
    pub fn max_recursion_depth(&self) -> u32 {
        self.max_recursion_depth
    }

    pub(crate) fn group_roles(&self) -> &[GroupRole] {
        &self.roles
    }

    /// Records a bind of this pipeline at the ray-tracing bind point.
    pub fn bind(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.context.device().cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.handle,
            );
        }
    }
}

fn destroy_modules(context: &Context, modules: &[vk::ShaderModule]) {
    for module in modules {
        unsafe { context.device().destroy_shader_module(*module, None) };
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe { self.context.device().destroy_pipeline(self.handle, None) };
        destroy_modules(&self.context, &self.modules);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAYGEN: vk::ShaderStageFlags = vk::ShaderStageFlags::RAYGEN_KHR;
    const MISS: vk::ShaderStageFlags = vk::ShaderStageFlags::MISS_KHR;
    const CALLABLE: vk::ShaderStageFlags = vk::ShaderStageFlags::CALLABLE_KHR;

    #[test]
    fn classifies_general_groups_by_stage() {
        let stages = [RAYGEN, MISS, CALLABLE];
        let groups = [
            ShaderGroupDesc::General { shader: 0 },
            ShaderGroupDesc::General { shader: 1 },
            ShaderGroupDesc::TrianglesHit {
                closest_hit: 2,
                any_hit: None,
            },
            ShaderGroupDesc::General { shader: 2 },
        ];
        let roles = classify_groups(&groups, &stages);
        assert_eq!(
            roles,
            [
                GroupRole::Raygen,
                GroupRole::Miss,
                GroupRole::Hit,
                GroupRole::Callable
            ]
        );
    }

    #[test]
    #[should_panic(expected = "must be ordered")]
    fn rejects_miss_after_hit() {
        let stages = [RAYGEN, MISS];
        let groups = [
            ShaderGroupDesc::General { shader: 0 },
            ShaderGroupDesc::TrianglesHit {
                closest_hit: 1,
                any_hit: None,
            },
            ShaderGroupDesc::General { shader: 1 },
        ];
        classify_groups(&groups, &stages);
    }

    #[test]
    #[should_panic(expected = "must be ordered")]
    fn rejects_raygen_after_miss() {
        let stages = [MISS, RAYGEN];
        let groups = [
            ShaderGroupDesc::General { shader: 0 },
            ShaderGroupDesc::General { shader: 1 },
        ];
        classify_groups(&groups, &stages);
    }

    #[test]
    #[should_panic(expected = "non-general stage")]
    fn rejects_general_group_on_hit_stage() {
        let stages = [vk::ShaderStageFlags::CLOSEST_HIT_KHR];
        let groups = [ShaderGroupDesc::General { shader: 0 }];
        classify_groups(&groups, &stages);
    }

    #[test]
    fn procedural_hit_groups_are_hit_role() {
        let stages = [RAYGEN, vk::ShaderStageFlags::INTERSECTION_KHR];
        let groups = [
            ShaderGroupDesc::General { shader: 0 },
            ShaderGroupDesc::ProceduralHit {
                intersection: 1,
                closest_hit: None,
                any_hit: None,
            },
        ];
        let roles = classify_groups(&groups, &stages);
        assert_eq!(roles[1], GroupRole::Hit);
    }

    #[test]
    fn hit_group_lowering_uses_unused_markers() {
        let lowered = lower_group(&ShaderGroupDesc::TrianglesHit {
            closest_hit: 3,
            any_hit: None,
        });
        assert_eq!(
            lowered.ty,
            vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
        );
        assert_eq!(lowered.general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(lowered.closest_hit_shader, 3);
        assert_eq!(lowered.any_hit_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(lowered.intersection_shader, vk::SHADER_UNUSED_KHR);
    }
}
