//! Virtual Passes
//!
//! A pass is a name, flags, an ordered access list and a type-erased execute
//! callback. Recording aggregates accesses (one entry per resource, states
//! OR'd together); compile attaches dependencies, transitions and aliasing
//! barriers; execute replays them into a command context.

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::rhi::{
    AnyResource, Buffer, CommandContext, DepthTargetInfo, Ref, RenderPassColorFlags,
    RenderPassDepthFlags, RenderPassInfo, RenderTargetInfo, ResourceState, Texture,
};

use super::resources::{RGBufferHandle, RGPassId, RGResource, RGResourceId, RGTextureHandle};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct RGPassFlags: u8 {
        /// Raster pass: render/depth targets bound, render pass scoped.
        const RASTER     = 1 << 0;
        /// Compute pass.
        const COMPUTE    = 1 << 1;
        /// Copy pass. Read/write accesses map to copy states.
        const COPY       = 1 << 2;
        /// Never removed by dead-pass culling.
        const NEVER_CULL = 1 << 3;
    }
}

/// Maximum captured-state size of a pass callback. Callbacks should capture
/// handles and small POD parameter blocks, not bulk data.
pub const MAX_PASS_CALLBACK_SIZE: usize = 1024;

/// Type-erased pass execute callback.
pub type PassCallback = Box<dyn FnOnce(&mut CommandContext<'_>, &RGResources<'_>) + Send>;

#[derive(Clone, Copy, Debug)]
pub(crate) struct ResourceAccess {
    pub resource: RGResourceId,
    pub state: ResourceState,
}

/// A recorded state transition, emitted before the owning pass executes.
#[derive(Clone, Copy, Debug)]
pub struct ResourceTransition {
    pub resource: RGResourceId,
    pub before: ResourceState,
    pub after: ResourceState,
    pub subresource: u32,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct AliasBarrier {
    pub resource: RGResourceId,
    pub needs_discard: bool,
    pub discard_source_state: ResourceState,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RenderTargetAccess {
    pub resource: RGResourceId,
    pub flags: RenderPassColorFlags,
    pub resolve_target: Option<RGResourceId>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct DepthStencilAccess {
    pub resource: RGResourceId,
    pub flags: RenderPassDepthFlags,
}

pub(crate) type RGEventId = u16;

/// A profile event scope (name + source location).
#[derive(Clone, Debug)]
pub(crate) struct RGEvent {
    pub name: String,
    pub file: &'static str,
    pub line: u32,
}

/// A recorded virtual pass.
pub struct RGPass {
    pub(crate) name: String,
    pub(crate) id: RGPassId,
    pub(crate) flags: RGPassFlags,
    pub(crate) culled: bool,

    pub(crate) accesses: SmallVec<[ResourceAccess; 8]>,
    pub(crate) render_targets: SmallVec<[RenderTargetAccess; 4]>,
    pub(crate) depth_stencil: Option<DepthStencilAccess>,
    pub(crate) dependencies: SmallVec<[RGPassId; 8]>,

    // Compile output.
    pub(crate) transitions: Vec<ResourceTransition>,
    pub(crate) alias_barriers: Vec<AliasBarrier>,

    // Profiling.
    pub(crate) events_to_start: Vec<RGEventId>,
    pub(crate) num_events_to_end: u32,
    pub(crate) cpu_events_to_start: Vec<RGEventId>,
    pub(crate) num_cpu_events_to_end: u32,

    pub(crate) callback: Option<PassCallback>,
}

impl RGPass {
    pub(crate) fn new(name: &str, id: RGPassId, flags: RGPassFlags) -> Self {
        Self {
            name: name.to_string(),
            id,
            flags,
            culled: true,
            accesses: SmallVec::new(),
            render_targets: SmallVec::new(),
            depth_stencil: None,
            dependencies: SmallVec::new(),
            transitions: Vec::new(),
            alias_barriers: Vec::new(),
            events_to_start: Vec::new(),
            num_events_to_end: 0,
            cpu_events_to_start: Vec::new(),
            num_cpu_events_to_end: 0,
            callback: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn id(&self) -> RGPassId {
        self.id
    }

    #[must_use]
    pub fn flags(&self) -> RGPassFlags {
        self.flags
    }

    #[must_use]
    pub fn is_culled(&self) -> bool {
        self.culled
    }

    /// Transitions computed at compile time for this pass.
    #[must_use]
    pub fn transitions(&self) -> &[ResourceTransition] {
        &self.transitions
    }

    /// Aggregates one access. A resource appears at most once per pass; its
    /// recorded access is the OR of all requested states. A write state may
    /// not combine with any other state.
    pub(crate) fn add_access(&mut self, resource: &RGResource, state: ResourceState) {
        if let Some(existing) = self
            .accesses
            .iter_mut()
            .find(|access| access.resource == resource.id)
        {
            if existing.state.contains(state) {
                return;
            }
            assert!(
                existing.state == state || !existing.state.has_write_state(),
                "Pass '{}': resource '{}' may not take state {:?} while it already holds write state {:?}",
                self.name,
                resource.name,
                state,
                existing.state
            );
            assert!(
                existing.state == state || !state.has_write_state(),
                "Pass '{}': resource '{}' may not take write state {:?} while it already holds {:?}",
                self.name,
                resource.name,
                state,
                existing.state
            );
            existing.state |= state;
        } else {
            self.accesses.push(ResourceAccess {
                resource: resource.id,
                state,
            });
        }
    }
}

/// Physical-resource lookup handed to pass callbacks.
///
/// Every getter asserts the pass actually declared a matching access; a
/// missing declaration is a programming error the graph cannot barrier for.
pub struct RGResources<'a> {
    pass: &'a RGPass,
    resources: &'a [RGResource],
}

impl<'a> RGResources<'a> {
    pub(crate) fn new(pass: &'a RGPass, resources: &'a [RGResource]) -> Self {
        Self { pass, resources }
    }

    fn resolve(&self, id: RGResourceId, required: ResourceState) -> &AnyResource {
        let declared = self
            .pass
            .accesses
            .iter()
            .find(|access| access.resource == id)
            .unwrap_or_else(|| {
                panic!(
                    "Pass '{}' accesses resource '{}' without declaring it",
                    self.pass.name,
                    self.resources[id.index()].name
                )
            });
        assert!(
            required == ResourceState::COMMON || declared.state.intersects(required),
            "Pass '{}' uses resource '{}' as {:?} but declared {:?}",
            self.pass.name,
            self.resources[id.index()].name,
            required,
            declared.state
        );
        self.resources[id.index()]
            .physical
            .as_ref()
            .expect("Resource was not allocated during graph compile")
    }

    #[must_use]
    pub fn get_texture(&self, handle: RGTextureHandle) -> Ref<Texture> {
        self.resolve(handle.id, ResourceState::COMMON)
            .as_texture()
            .expect("Handle does not name a texture")
            .clone()
    }

    #[must_use]
    pub fn get_buffer(&self, handle: RGBufferHandle) -> Ref<Buffer> {
        self.resolve(handle.id, ResourceState::COMMON)
            .as_buffer()
            .expect("Handle does not name a buffer")
            .clone()
    }

    /// SRV descriptor index; requires a declared shader-resource read.
    #[must_use]
    pub fn srv(&self, handle: impl Into<RGResourceId>) -> u32 {
        match self.resolve(
            handle.into(),
            ResourceState::ALL_SHADER_RESOURCE | ResourceState::DEPTH_READ,
        ) {
            AnyResource::Texture(t) => t.srv(),
            AnyResource::Buffer(b) => b.srv(),
        }
    }

    /// UAV descriptor index; requires a declared unordered-access write.
    #[must_use]
    pub fn uav(&self, handle: impl Into<RGResourceId>) -> u32 {
        match self.resolve(handle.into(), ResourceState::UNORDERED_ACCESS) {
            AnyResource::Texture(t) => t.uav(),
            AnyResource::Buffer(b) => b.uav(),
        }
    }

    /// Single-mip UAV descriptor index of a texture.
    #[must_use]
    pub fn mip_uav(&self, handle: RGTextureHandle, mip: u32) -> u32 {
        self.resolve(handle.id, ResourceState::UNORDERED_ACCESS)
            .as_texture()
            .expect("Handle does not name a texture")
            .mip_uav(mip)
    }

    /// Type-erased physical resource.
    #[must_use]
    pub fn get(&self, handle: impl Into<RGResourceId>) -> AnyResource {
        self.resolve(handle.into(), ResourceState::COMMON).clone()
    }

    /// Attachment set for this raster pass, resolved to physical textures.
    #[must_use]
    pub fn get_render_pass_info(&self) -> RenderPassInfo {
        let mut info = RenderPassInfo::default();
        for target in &self.pass.render_targets {
            let mut flags = target.flags;
            let resolve_target = target.resolve_target.map(|id| {
                self.resources[id.index()]
                    .physical
                    .as_ref()
                    .and_then(AnyResource::as_texture)
                    .expect("Resolve target was not allocated")
                    .clone()
            });
            if resolve_target.is_some() && target.resolve_target != Some(target.resource) {
                flags |= RenderPassColorFlags::RESOLVE;
            }
            info.render_targets.push(RenderTargetInfo {
                target: self.resources[target.resource.index()]
                    .physical
                    .as_ref()
                    .and_then(AnyResource::as_texture)
                    .expect("Render target was not allocated")
                    .clone(),
                flags,
                resolve_target,
            });
        }
        if let Some(depth) = &self.pass.depth_stencil {
            info.depth_stencil = Some(DepthTargetInfo {
                target: self.resources[depth.resource.index()]
                    .physical
                    .as_ref()
                    .and_then(AnyResource::as_texture)
                    .expect("Depth target was not allocated")
                    .clone(),
                flags: depth.flags,
            });
        }
        info
    }
}
