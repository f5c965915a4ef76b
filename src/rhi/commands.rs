//! Command Recording
//!
//! [`CommandContext`] records a command stream against the software backend.
//! Resource barriers are batched and flushed in one group, either explicitly
//! via [`CommandContext::flush_resource_barriers`] or implicitly before any
//! work submission (dispatch, draw, copy, clear).
//!
//! The recorded stream is inspectable, which is what the render-graph and
//! technique tests assert against.

use smallvec::SmallVec;

use super::device::GraphicsDevice;
use super::pipeline::{CommandSignature, PipelineState, RootSignature};
use super::resources::{AnyResource, Buffer, Ref, Texture};
use super::scratch::{ScratchAllocation, ScratchAllocator};
use super::types::ResourceState;

use bitflags::bitflags;

bitflags! {
    /// Load/store behavior of a color attachment.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct RenderPassColorFlags: u8 {
        /// Clear on load. Default without CLEAR or LOAD is "don't care".
        const CLEAR   = 1 << 0;
        /// Preserve previous contents.
        const LOAD    = 1 << 1;
        /// Resolve into the attached resolve target at pass end.
        const RESOLVE = 1 << 2;
    }
}

bitflags! {
    /// Load/store behavior of the depth-stencil attachment.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct RenderPassDepthFlags: u8 {
        const CLEAR     = 1 << 0;
        const LOAD      = 1 << 1;
        /// Depth is bound read-only (`DEPTH_READ` state).
        const READ_ONLY = 1 << 2;
    }
}

#[derive(Clone, Debug)]
pub struct RenderTargetInfo {
    pub target: Ref<Texture>,
    pub flags: RenderPassColorFlags,
    pub resolve_target: Option<Ref<Texture>>,
}

#[derive(Clone, Debug)]
pub struct DepthTargetInfo {
    pub target: Ref<Texture>,
    pub flags: RenderPassDepthFlags,
}

/// Attachment set for a raster pass.
#[derive(Clone, Debug, Default)]
pub struct RenderPassInfo {
    pub render_targets: SmallVec<[RenderTargetInfo; 4]>,
    pub depth_stencil: Option<DepthTargetInfo>,
}

/// One recorded command. The stream is the unit of submission and the unit
/// of inspection in tests.
#[derive(Clone, Debug)]
pub enum Command {
    BeginEvent {
        name: String,
    },
    EndEvent,
    TransitionBarrier {
        resource: AnyResource,
        before: ResourceState,
        after: ResourceState,
        subresource: u32,
    },
    AliasingBarrier {
        resource: AnyResource,
    },
    UavBarrier {
        resource: Option<AnyResource>,
    },
    DiscardResource {
        resource: AnyResource,
    },
    BeginRenderPass {
        info: RenderPassInfo,
    },
    EndRenderPass,
    SetPipelineState {
        pipeline: Ref<PipelineState>,
    },
    SetGraphicsRootSignature {
        root_signature: Ref<RootSignature>,
    },
    SetComputeRootSignature {
        root_signature: Ref<RootSignature>,
    },
    BindRootCbv {
        slot: u32,
        size: u32,
    },
    BindResources {
        slot: u32,
        descriptors: SmallVec<[u32; 8]>,
        offset: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    ExecuteIndirect {
        signature: Ref<CommandSignature>,
        max_count: u32,
        arguments: Ref<Buffer>,
        arguments_offset: u64,
        count_buffer: Option<Ref<Buffer>>,
        count_offset: u64,
    },
    CopyResource {
        src: AnyResource,
        dst: AnyResource,
    },
    CopyBuffer {
        src: Ref<Buffer>,
        dst: Ref<Buffer>,
        size: u64,
        src_offset: u64,
        dst_offset: u64,
    },
    ClearUavU32 {
        resource: AnyResource,
        value: u32,
    },
    ClearUavF32 {
        resource: AnyResource,
        value: f32,
    },
    BuildBlas {
        dest: Ref<Buffer>,
        scratch: Ref<Buffer>,
        in_place_update: bool,
        primitive_count: u32,
    },
    BuildTlas {
        dest: Ref<Buffer>,
        scratch: Ref<Buffer>,
        instance_descs: Ref<Buffer>,
        instance_count: u32,
    },
    EmitCompactedSizes {
        dest: Ref<Buffer>,
        sources: Vec<Ref<Buffer>>,
    },
    CopyAccelerationStructure {
        dest: Ref<Buffer>,
        src: Ref<Buffer>,
        compact: bool,
    },
}

/// Records commands into a list for ordered submission on a queue.
///
/// One context records exactly one command list. Scratch allocations made
/// through the context live until the submission's sync point completes.
pub struct CommandContext<'d> {
    device: &'d GraphicsDevice,
    commands: Vec<Command>,
    pending_barriers: Vec<Command>,
    scratch: ScratchAllocator,
    in_render_pass: bool,
}

impl<'d> CommandContext<'d> {
    pub(crate) fn new(device: &'d GraphicsDevice, commands: Vec<Command>) -> Self {
        Self {
            device,
            commands,
            pending_barriers: Vec::new(),
            scratch: ScratchAllocator::new(),
            in_render_pass: false,
        }
    }

    #[must_use]
    pub fn device(&self) -> &'d GraphicsDevice {
        self.device
    }

    /// The recorded command stream.
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub(crate) fn take_parts(mut self) -> (Vec<Command>, ScratchAllocator) {
        debug_assert!(!self.in_render_pass, "Command list submitted inside a render pass");
        self.flush_resource_barriers();
        (std::mem::take(&mut self.commands), std::mem::take(&mut self.scratch))
    }

    // ── Events ─────────────────────────────────────────────────────────────

    pub fn begin_event(&mut self, name: &str) {
        self.commands.push(Command::BeginEvent {
            name: name.to_string(),
        });
    }

    pub fn end_event(&mut self) {
        self.commands.push(Command::EndEvent);
    }

    // ── Barriers ───────────────────────────────────────────────────────────

    /// Queues a transition barrier. Takes effect at the next flush.
    pub fn insert_resource_barrier(
        &mut self,
        resource: &AnyResource,
        before: ResourceState,
        after: ResourceState,
        subresource: u32,
    ) {
        self.pending_barriers.push(Command::TransitionBarrier {
            resource: resource.clone(),
            before,
            after,
            subresource,
        });
    }

    pub fn insert_aliasing_barrier(&mut self, resource: &AnyResource) {
        self.pending_barriers.push(Command::AliasingBarrier {
            resource: resource.clone(),
        });
    }

    pub fn insert_uav_barrier(&mut self, resource: Option<&AnyResource>) {
        self.pending_barriers.push(Command::UavBarrier {
            resource: resource.cloned(),
        });
    }

    /// Flushes queued barriers into the command stream as one batch.
    pub fn flush_resource_barriers(&mut self) {
        self.commands.append(&mut self.pending_barriers);
    }

    pub fn discard_resource(&mut self, resource: &AnyResource) {
        self.flush_resource_barriers();
        self.commands.push(Command::DiscardResource {
            resource: resource.clone(),
        });
    }

    // ── Render passes ──────────────────────────────────────────────────────

    pub fn begin_render_pass(&mut self, info: RenderPassInfo) {
        assert!(!self.in_render_pass, "BeginRenderPass inside an open render pass");
        self.flush_resource_barriers();
        self.in_render_pass = true;
        self.commands.push(Command::BeginRenderPass { info });
    }

    pub fn end_render_pass(&mut self) {
        assert!(self.in_render_pass, "EndRenderPass without an open render pass");
        self.in_render_pass = false;
        self.commands.push(Command::EndRenderPass);
    }

    // ── Binding ────────────────────────────────────────────────────────────

    pub fn set_pipeline_state(&mut self, pipeline: &Ref<PipelineState>) {
        self.commands.push(Command::SetPipelineState {
            pipeline: pipeline.clone(),
        });
    }

    pub fn set_graphics_root_signature(&mut self, root_signature: &Ref<RootSignature>) {
        self.commands.push(Command::SetGraphicsRootSignature {
            root_signature: root_signature.clone(),
        });
    }

    pub fn set_compute_root_signature(&mut self, root_signature: &Ref<RootSignature>) {
        self.commands.push(Command::SetComputeRootSignature {
            root_signature: root_signature.clone(),
        });
    }

    /// Binds a root constant buffer from CPU data (uploaded via scratch).
    pub fn bind_root_cbv<T: bytemuck::Pod>(&mut self, slot: u32, data: &T) {
        let alloc = self.allocate_scratch(std::mem::size_of::<T>() as u64);
        alloc.write(data);
        self.commands.push(Command::BindRootCbv {
            slot,
            size: std::mem::size_of::<T>() as u32,
        });
    }

    /// Binds bindless descriptor indices into a descriptor table slot.
    pub fn bind_resources(&mut self, slot: u32, descriptors: &[u32]) {
        self.bind_resources_at(slot, descriptors, 0);
    }

    pub fn bind_resources_at(&mut self, slot: u32, descriptors: &[u32], offset: u32) {
        self.commands.push(Command::BindResources {
            slot,
            descriptors: descriptors.iter().copied().collect(),
            offset,
        });
    }

    // ── Work submission ────────────────────────────────────────────────────

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        debug_assert!(x > 0 && y > 0 && z > 0, "Empty dispatch");
        self.flush_resource_barriers();
        self.commands.push(Command::Dispatch { x, y, z });
    }

    pub fn dispatch_1d(&mut self, x: u32) {
        self.dispatch(x, 1, 1);
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        debug_assert!(self.in_render_pass, "Draw outside a render pass");
        self.flush_resource_barriers();
        self.commands.push(Command::Draw {
            vertex_count,
            instance_count,
        });
    }

    pub fn execute_indirect(
        &mut self,
        signature: &Ref<CommandSignature>,
        max_count: u32,
        arguments: &Ref<Buffer>,
        arguments_offset: u64,
        count_buffer: Option<&Ref<Buffer>>,
        count_offset: u64,
    ) {
        self.flush_resource_barriers();
        self.commands.push(Command::ExecuteIndirect {
            signature: signature.clone(),
            max_count,
            arguments: arguments.clone(),
            arguments_offset,
            count_buffer: count_buffer.cloned(),
            count_offset,
        });
    }

    // ── Copies & clears ────────────────────────────────────────────────────

    pub fn copy_resource(&mut self, src: &AnyResource, dst: &AnyResource) {
        self.flush_resource_barriers();
        self.commands.push(Command::CopyResource {
            src: src.clone(),
            dst: dst.clone(),
        });
    }

    pub fn copy_buffer(
        &mut self,
        src: &Ref<Buffer>,
        dst: &Ref<Buffer>,
        size: u64,
        src_offset: u64,
        dst_offset: u64,
    ) {
        self.flush_resource_barriers();
        self.commands.push(Command::CopyBuffer {
            src: src.clone(),
            dst: dst.clone(),
            size,
            src_offset,
            dst_offset,
        });
    }

    pub fn copy_texture(&mut self, src: &Ref<Texture>, dst: &Ref<Texture>) {
        self.copy_resource(
            &AnyResource::Texture(src.clone()),
            &AnyResource::Texture(dst.clone()),
        );
    }

    pub fn clear_uav_u32(&mut self, resource: &AnyResource, value: u32) {
        self.flush_resource_barriers();
        self.commands.push(Command::ClearUavU32 {
            resource: resource.clone(),
            value,
        });
    }

    pub fn clear_uav_f32(&mut self, resource: &AnyResource, value: f32) {
        self.flush_resource_barriers();
        self.commands.push(Command::ClearUavF32 {
            resource: resource.clone(),
            value,
        });
    }

    // ── Acceleration structures ────────────────────────────────────────────

    pub fn build_blas(
        &mut self,
        dest: &Ref<Buffer>,
        scratch: &Ref<Buffer>,
        in_place_update: bool,
        primitive_count: u32,
    ) {
        self.flush_resource_barriers();
        self.commands.push(Command::BuildBlas {
            dest: dest.clone(),
            scratch: scratch.clone(),
            in_place_update,
            primitive_count,
        });
    }

    pub fn build_tlas(
        &mut self,
        dest: &Ref<Buffer>,
        scratch: &Ref<Buffer>,
        instance_descs: &Ref<Buffer>,
        instance_count: u32,
    ) {
        self.flush_resource_barriers();
        self.commands.push(Command::BuildTlas {
            dest: dest.clone(),
            scratch: scratch.clone(),
            instance_descs: instance_descs.clone(),
            instance_count,
        });
    }

    pub fn emit_compacted_sizes(&mut self, dest: &Ref<Buffer>, sources: Vec<Ref<Buffer>>) {
        self.flush_resource_barriers();
        self.commands.push(Command::EmitCompactedSizes {
            dest: dest.clone(),
            sources,
        });
    }

    pub fn copy_acceleration_structure(
        &mut self,
        dest: &Ref<Buffer>,
        src: &Ref<Buffer>,
        compact: bool,
    ) {
        self.flush_resource_barriers();
        self.commands.push(Command::CopyAccelerationStructure {
            dest: dest.clone(),
            src: src.clone(),
            compact,
        });
    }

    // ── Scratch ────────────────────────────────────────────────────────────

    /// Allocates CPU-writable scratch memory valid until this list's
    /// submission completes. 256-byte aligned.
    pub fn allocate_scratch(&mut self, size: u64) -> ScratchAllocation {
        self.scratch.allocate(self.device, size, 256)
    }

    /// Reserves `count` contiguous transient descriptor slots in the
    /// bindless heap and returns the base index. Heap indices are
    /// append-only within a frame and immutable once allocated.
    pub fn allocate_transient_descriptors(&mut self, count: u32) -> u32 {
        self.device.allocate_descriptors(count)
    }
}
