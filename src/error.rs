//! Error types returned by resource creation and compaction.
//!
//! The policy throughout the crate is fail-fast: a creation failure is
//! propagated up the call chain and the caller is expected to abort setup
//! rather than retry. Caller contract violations (for example a misordered
//! shader-group list) are asserted, not returned.

use ash::vk;
use std::{error::Error, fmt};

/// Host or device memory exhaustion reported by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OomError {
    /// There is no memory available on the host.
    OutOfHostMemory,
    /// There is no memory available on the device.
    OutOfDeviceMemory,
}

impl Error for OomError {}

impl fmt::Display for OomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                OomError::OutOfHostMemory => "no memory available on the host",
                OomError::OutOfDeviceMemory => "no memory available on the device",
            }
        )
    }
}

/// Error that can happen when creating a buffer, acceleration structure,
/// query pool, pipeline or shader binding table.
#[derive(Debug)]
pub enum CreationError {
    /// Out of memory.
    Oom(OomError),
    /// The memory allocator rejected the allocation.
    Allocation(gpu_allocator::AllocationError),
    /// A host-visible allocation came back without a persistent mapping,
    /// so the host-side upload cannot happen.
    Unmapped,
    /// Any other error code returned by the device.
    Vulkan(vk::Result),
}

impl CreationError {
    pub(crate) fn from_vk(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                CreationError::Oom(OomError::OutOfHostMemory)
            }
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                CreationError::Oom(OomError::OutOfDeviceMemory)
            }
            other => CreationError::Vulkan(other),
        }
    }
}

impl Error for CreationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CreationError::Oom(err) => Some(err),
            CreationError::Allocation(err) => Some(err),
            CreationError::Unmapped => None,
            CreationError::Vulkan(_) => None,
        }
    }
}

impl fmt::Display for CreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreationError::Oom(_) => write!(f, "out of memory"),
            CreationError::Allocation(_) => write!(f, "memory allocation failed"),
            CreationError::Unmapped => {
                write!(f, "a host-visible buffer is missing its mapping")
            }
            CreationError::Vulkan(result) => write!(f, "device call failed: {:?}", result),
        }
    }
}

impl From<OomError> for CreationError {
    fn from(err: OomError) -> Self {
        CreationError::Oom(err)
    }
}

impl From<gpu_allocator::AllocationError> for CreationError {
    fn from(err: gpu_allocator::AllocationError) -> Self {
        CreationError::Allocation(err)
    }
}

/// Error that can happen when compacting an acceleration structure.
///
/// A failed compaction leaves the original structure fully usable; the
/// caller may keep tracing against it and simply forgo the size reduction.
#[derive(Debug)]
pub enum CompactionError {
    /// The structure was created without
    /// [`ALLOW_COMPACTION`](vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION).
    NotAllowed,
    /// The structure has not been built yet, so there is no compacted size
    /// to query.
    NotBuilt,
    /// Reading back the compacted size from the query pool failed.
    QueryRead(vk::Result),
    /// Creating the replacement structure failed.
    Creation(CreationError),
}

impl Error for CompactionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CompactionError::Creation(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for CompactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactionError::NotAllowed => {
                write!(f, "the acceleration structure does not allow compaction")
            }
            CompactionError::NotBuilt => {
                write!(f, "the acceleration structure has not been built")
            }
            CompactionError::QueryRead(result) => {
                write!(f, "compacted size query readback failed: {:?}", result)
            }
            CompactionError::Creation(_) => {
                write!(f, "creating the compacted structure failed")
            }
        }
    }
}

impl From<CreationError> for CompactionError {
    fn from(err: CreationError) -> Self {
        CompactionError::Creation(err)
    }
}
