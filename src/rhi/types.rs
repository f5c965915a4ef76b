//! Resource Formats and States
//!
//! The explicit-API state model: every physical resource carries a
//! [`ResourceState`] bit set, and moving a resource between usages requires
//! a recorded transition barrier. The render graph computes these transitions
//! at compile time; command contexts batch and flush them.

use bitflags::bitflags;

/// Subresource index meaning "all subresources" in barrier calls.
pub const ALL_SUBRESOURCES: u32 = u32::MAX;

bitflags! {
    /// Resource usage states, modeled after explicit-API resource states.
    ///
    /// `COMMON` is the empty set. Read states may be combined; a write state
    /// excludes every other state.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct ResourceState: u32 {
        const COMMON                    = 0;
        const RENDER_TARGET             = 1 << 0;
        const UNORDERED_ACCESS          = 1 << 1;
        const DEPTH_WRITE               = 1 << 2;
        const DEPTH_READ                = 1 << 3;
        const NON_PIXEL_SHADER_RESOURCE = 1 << 4;
        const PIXEL_SHADER_RESOURCE     = 1 << 5;
        const INDIRECT_ARGUMENT         = 1 << 6;
        const COPY_DEST                 = 1 << 7;
        const COPY_SOURCE               = 1 << 8;
        const RESOLVE_DEST              = 1 << 9;
        const RESOLVE_SOURCE            = 1 << 10;
        const ACCELERATION_STRUCTURE    = 1 << 11;

        const ALL_SHADER_RESOURCE = Self::NON_PIXEL_SHADER_RESOURCE.bits()
                                  | Self::PIXEL_SHADER_RESOURCE.bits();
    }
}

impl ResourceState {
    /// States that imply GPU writes. A resource in one of these states may
    /// not simultaneously hold any other state.
    #[must_use]
    pub fn has_write_state(self) -> bool {
        self.intersects(
            Self::RENDER_TARGET
                | Self::UNORDERED_ACCESS
                | Self::DEPTH_WRITE
                | Self::COPY_DEST
                | Self::RESOLVE_DEST,
        )
    }

    /// True when every set bit is a read-only state.
    #[must_use]
    pub fn is_read_only(self) -> bool {
        !self.is_empty() && !self.has_write_state()
    }
}

/// Decides whether a transition barrier is required to move a resource from
/// `before` into `after`.
///
/// Read-to-read moves are combined instead of transitioned: when both states
/// are read-only, `after` is widened to include `before`, so a later pass
/// reading in a different stage reuses the same barrier. Returns `false`
/// when the resource is already in a state covering the request.
pub fn needs_transition(before: ResourceState, after: &mut ResourceState) -> bool {
    if before == *after {
        return false;
    }
    if before.is_read_only() && after.is_read_only() {
        if before.contains(*after) {
            return false;
        }
        *after |= before;
        return true;
    }
    true
}

/// Texel formats used by the rendering core.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum ResourceFormat {
    #[default]
    Unknown,
    R8Unorm,
    R16Float,
    R16Uint,
    R32Float,
    R32Uint,
    RG16Float,
    RG32Float,
    RGBA8Unorm,
    RGB10A2Unorm,
    RGBA16Float,
    RGBA32Float,
    D16Unorm,
    D32Float,
    D24S8,
}

impl ResourceFormat {
    /// Bytes per texel. `Unknown` reports zero.
    #[must_use]
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::R8Unorm => 1,
            Self::R16Float | Self::R16Uint | Self::D16Unorm => 2,
            Self::R32Float | Self::R32Uint | Self::RG16Float | Self::RGBA8Unorm
            | Self::RGB10A2Unorm | Self::D32Float | Self::D24S8 => 4,
            Self::RG32Float | Self::RGBA16Float => 8,
            Self::RGBA32Float => 16,
        }
    }

    #[must_use]
    pub fn is_depth(self) -> bool {
        matches!(self, Self::D16Unorm | Self::D32Float | Self::D24S8)
    }
}

/// Indirect dispatch argument record. Layout is part of the GPU ABI.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct IndirectDispatchArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// Indirect dispatch-mesh argument record. Layout is part of the GPU ABI.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct IndirectDispatchMeshArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// Rounds `value` up to the next multiple of `alignment` (a power of two).
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Number of thread groups needed to cover `count` items with `group_size`
/// threads per group.
#[must_use]
pub fn thread_group_count(count: u32, group_size: u32) -> u32 {
    count.div_ceil(group_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_states_are_exclusive_of_reads() {
        assert!(ResourceState::RENDER_TARGET.has_write_state());
        assert!(ResourceState::UNORDERED_ACCESS.has_write_state());
        assert!(!ResourceState::ALL_SHADER_RESOURCE.has_write_state());
        assert!(ResourceState::ALL_SHADER_RESOURCE.is_read_only());
    }

    #[test]
    fn read_to_read_transitions_combine() {
        let before = ResourceState::NON_PIXEL_SHADER_RESOURCE;
        let mut after = ResourceState::PIXEL_SHADER_RESOURCE;
        assert!(needs_transition(before, &mut after));
        assert_eq!(after, ResourceState::ALL_SHADER_RESOURCE);

        // Already covered: no barrier.
        let mut narrower = ResourceState::PIXEL_SHADER_RESOURCE;
        assert!(!needs_transition(ResourceState::ALL_SHADER_RESOURCE, &mut narrower));
    }

    #[test]
    fn write_transitions_always_fire() {
        let mut after = ResourceState::UNORDERED_ACCESS;
        assert!(needs_transition(ResourceState::ALL_SHADER_RESOURCE, &mut after));
        assert_eq!(after, ResourceState::UNORDERED_ACCESS);
    }

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }
}
