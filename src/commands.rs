//! Command recording for builds, per-frame updates and trace dispatches.
//!
//! All functions record into a caller-provided command buffer on a single
//! compute-capable queue; nothing here submits or blocks. Builds provide no
//! implicit synchronization, so the barriers between a build and its
//! consumers are explicit:
//!
//! - every build in a pass shares one scratch buffer, so builds are
//!   serialized with a build→build barrier after each;
//! - the per-frame dynamic path is a strict chain: wait for the previous
//!   trace to stop reading the structure, build/update it, then make the
//!   build visible to the next trace (and guard the output image before
//!   tracing into it).

use crate::{
    accel::{BottomLevelAccelerationStructure, TopLevelAccelerationStructure},
    context::Context,
    sbt::ShaderBindingTable,
    scratch::ScratchBuffer,
};
use ash::vk;

const BUILD_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR;
const TRACE_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR;

fn structure_barrier(
    context: &Context,
    cmd: vk::CommandBuffer,
    dst_stage: vk::PipelineStageFlags,
    dst_access: vk::AccessFlags,
) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(
            vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
        )
        .dst_access_mask(dst_access);
    unsafe {
        context.device().cmd_pipeline_barrier(
            cmd,
            BUILD_STAGE,
            dst_stage,
            vk::DependencyFlags::empty(),
            std::slice::from_ref(&barrier),
            &[],
            &[],
        );
    }
}

/// Barrier between two builds sharing the scratch buffer.
pub fn build_to_build_barrier(context: &Context, cmd: vk::CommandBuffer) {
    structure_barrier(
        context,
        cmd,
        BUILD_STAGE,
        vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
            | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
    );
}

/// Makes a finished build visible to the next trace dispatch.
pub fn build_to_trace_barrier(context: &Context, cmd: vk::CommandBuffer) {
    structure_barrier(
        context,
        cmd,
        TRACE_STAGE,
        vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
    );
}

/// Execution barrier making a structure build wait until the previous
/// frame's trace has finished reading it.
pub fn trace_to_build_barrier(context: &Context, cmd: vk::CommandBuffer) {
    unsafe {
        context.device().cmd_pipeline_barrier(
            cmd,
            TRACE_STAGE,
            BUILD_STAGE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[],
        );
    }
}

/// Execution barrier holding the trace back until the previous consumer
/// (typically the fragment stage reading the output image) is done.
pub fn consumer_to_trace_barrier(context: &Context, cmd: vk::CommandBuffer) {
    unsafe {
        context.device().cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            TRACE_STAGE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[],
        );
    }
}

/// Records the full build pass: every bottom-level structure, serialized
/// against the shared scratch buffer, then the top-level structure, then
/// the barrier that makes it visible to tracing.
pub fn build_all(
    context: &Context,
    cmd: vk::CommandBuffer,
    bottom_levels: &mut [BottomLevelAccelerationStructure],
    top_level: &mut TopLevelAccelerationStructure,
    scratch: &ScratchBuffer,
) {
    for bottom_level in bottom_levels.iter_mut() {
        bottom_level.build(cmd, scratch.address());
        build_to_build_barrier(context, cmd);
    }
    top_level.build(cmd, scratch.address());
    build_to_trace_barrier(context, cmd);
}

/// Records the per-frame top-level refresh after instance transforms were
/// patched: wait for the previous trace, build or update, publish to the
/// next trace.
pub fn record_tlas_refresh(
    context: &Context,
    cmd: vk::CommandBuffer,
    top_level: &mut TopLevelAccelerationStructure,
    scratch: &ScratchBuffer,
) {
    trace_to_build_barrier(context, cmd);
    top_level.build(cmd, scratch.address());
    build_to_trace_barrier(context, cmd);
}

/// Records the trace dispatch over a 3D invocation extent.
///
/// The raygen record is selected by index because the dispatch accepts a
/// single raygen address; miss, hit and callable records are selected in
/// shader code within their regions.
pub fn record_trace(
    context: &Context,
    cmd: vk::CommandBuffer,
    table: &ShaderBindingTable,
    raygen_index: u32,
    extent: [u32; 3],
) {
    let raygen = table.raygen_region(raygen_index);
    let miss = table.miss_region();
    let hit = table.hit_region();
    let callable = table.callable_region();
    unsafe {
        context.rt_fn().cmd_trace_rays(
            cmd,
            &raygen,
            &miss,
            &hit,
            &callable,
            extent[0],
            extent[1],
            extent[2],
        );
    }
}
