//! Graphics Device
//!
//! The root of the device abstraction: resource and pipeline creation, heap
//! placement, command-context allocation, frame pacing. The software backend
//! models an explicit-API device closely enough for the render graph and the
//! GPU-driven techniques to be exercised and validated without hardware.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::errors::{ArgusError, Result};

use super::commands::{Command, CommandContext};
use super::fence::{Fence, FencedPool, SyncPoint};
use super::pipeline::{
    CommandSignature, IndirectCommandKind, PipelineState, PipelineStateInitializer, RootSignature,
    ShaderDefines,
};
use super::queue::{CommandQueue, QueueKind};
use super::resources::{Buffer, BufferDesc, BufferFlags, Heap, Ref, Texture, TextureDesc};
use super::scratch::ScratchAllocationManager;
use super::types::align_up;

/// Frames the CPU may run ahead of the GPU (triple buffering).
pub const FRAME_LATENCY: u64 = 3;

/// Placement alignment of committed resources (64 KiB).
pub const RESOURCE_ALIGNMENT: u64 = 64 * 1024;

/// Scratch page size (upload heap), 4 MiB.
const SCRATCH_PAGE_SIZE: u64 = 4 * 1024 * 1024;

/// Acceleration-structure buffer alignment.
pub const AS_ALIGNMENT: u64 = 256;

#[derive(Clone, Copy, Debug)]
pub struct DeviceCapabilities {
    pub mesh_shading: bool,
    pub raytracing: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            mesh_shading: true,
            raytracing: true,
        }
    }
}

/// Result of an acceleration-structure prebuild query.
#[derive(Clone, Copy, Debug)]
pub struct AsPrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
}

/// The graphics device.
pub struct GraphicsDevice {
    capabilities: DeviceCapabilities,
    graphics_queue: CommandQueue,
    frame_fence: Ref<Fence>,
    scratch_manager: ScratchAllocationManager,
    command_storage: FencedPool<Vec<Command>>,
    next_resource_id: AtomicU64,
    next_gpu_address: AtomicU64,
    next_descriptor: AtomicU32,
    frame_index: AtomicU64,
    device_removed: AtomicBool,
}

impl Default for GraphicsDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities::default())
    }

    #[must_use]
    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            graphics_queue: CommandQueue::new(QueueKind::Graphics, "Graphics Queue"),
            frame_fence: Ref::new(Fence::new("Frame Fence")),
            scratch_manager: ScratchAllocationManager::new(BufferFlags::NONE, SCRATCH_PAGE_SIZE),
            command_storage: FencedPool::new(),
            next_resource_id: AtomicU64::new(1),
            // Start addresses away from zero so address arithmetic bugs trap.
            next_gpu_address: AtomicU64::new(0x1000_0000),
            next_descriptor: AtomicU32::new(1),
            frame_index: AtomicU64::new(0),
            device_removed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn graphics_queue(&self) -> &CommandQueue {
        &self.graphics_queue
    }

    #[must_use]
    pub fn frame_fence(&self) -> &Ref<Fence> {
        &self.frame_fence
    }

    #[must_use]
    pub fn scratch_manager(&self) -> &ScratchAllocationManager {
        &self.scratch_manager
    }

    #[must_use]
    pub fn frame_index(&self) -> u64 {
        self.frame_index.load(Ordering::Acquire)
    }

    // ── Resource creation ──────────────────────────────────────────────────

    #[must_use]
    pub fn create_buffer(&self, desc: &BufferDesc, name: &str) -> Ref<Buffer> {
        let id = self.next_resource_id.fetch_add(1, Ordering::Relaxed);
        let address = self
            .next_gpu_address
            .fetch_add(align_up(desc.size.max(1), RESOURCE_ALIGNMENT), Ordering::Relaxed);
        let descriptors = self.next_descriptor.fetch_add(2, Ordering::Relaxed);
        log::trace!("Create buffer '{name}' ({} bytes)", desc.size);
        Ref::new(Buffer::new(id, name, *desc, address, descriptors))
    }

    /// Creates a buffer placed inside a heap at a byte offset. Placement
    /// bookkeeping (aliasing, lifetimes) is the caller's responsibility.
    #[must_use]
    pub fn create_buffer_placed(
        &self,
        desc: &BufferDesc,
        heap: &Ref<Heap>,
        offset: u64,
        name: &str,
    ) -> Ref<Buffer> {
        debug_assert!(offset + desc.size <= heap.size(), "Placed buffer escapes its heap");
        self.create_buffer(desc, name)
    }

    #[must_use]
    pub fn create_texture(&self, desc: &TextureDesc, name: &str) -> Ref<Texture> {
        let id = self.next_resource_id.fetch_add(1, Ordering::Relaxed);
        // One SRV plus a UAV per mip.
        let descriptors = self.next_descriptor.fetch_add(1 + desc.mips, Ordering::Relaxed);
        log::trace!("Create texture '{name}' ({}x{})", desc.width, desc.height);
        Ref::new(Texture::new(id, name, *desc, descriptors))
    }

    #[must_use]
    pub fn create_texture_placed(
        &self,
        desc: &TextureDesc,
        heap: &Ref<Heap>,
        offset: u64,
        name: &str,
    ) -> Ref<Texture> {
        debug_assert!(
            offset + self.texture_allocation_info(desc).0 <= heap.size(),
            "Placed texture escapes its heap"
        );
        self.create_texture(desc, name)
    }

    #[must_use]
    pub fn create_heap(&self, size: u64) -> Ref<Heap> {
        let id = self.next_resource_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("Create heap ({size} bytes)");
        Ref::new(Heap::new(id, size))
    }

    /// `(size, alignment)` the device requires for a texture allocation.
    #[must_use]
    pub fn texture_allocation_info(&self, desc: &TextureDesc) -> (u64, u64) {
        let bpp = u64::from(desc.format.bytes_per_texel());
        let mut size = 0u64;
        let mut w = u64::from(desc.width);
        let mut h = u64::from(desc.height);
        for _ in 0..desc.mips {
            size += w * h * u64::from(desc.depth_or_array_size) * bpp;
            w = (w / 2).max(1);
            h = (h / 2).max(1);
        }
        size *= u64::from(desc.sample_count);
        (align_up(size.max(1), RESOURCE_ALIGNMENT), RESOURCE_ALIGNMENT)
    }

    /// `(size, alignment)` the device requires for a buffer allocation.
    #[must_use]
    pub fn buffer_allocation_info(&self, desc: &BufferDesc) -> (u64, u64) {
        (align_up(desc.size.max(1), RESOURCE_ALIGNMENT), RESOURCE_ALIGNMENT)
    }

    // ── Pipelines ──────────────────────────────────────────────────────────

    pub fn create_compute_pipeline(
        &self,
        _root_signature: &Ref<RootSignature>,
        path: &str,
        entry: &str,
        defines: &ShaderDefines,
    ) -> Result<Ref<PipelineState>> {
        PipelineState::compute(path, entry, defines).map(Ref::new)
    }

    pub fn create_pipeline(&self, init: PipelineStateInitializer) -> Result<Ref<PipelineState>> {
        PipelineState::raster(init).map(Ref::new)
    }

    #[must_use]
    pub fn create_command_signature(
        &self,
        kind: IndirectCommandKind,
        name: &str,
    ) -> Ref<CommandSignature> {
        let stride = match kind {
            IndirectCommandKind::Dispatch | IndirectCommandKind::DispatchMesh => 12,
            IndirectCommandKind::Draw => 16,
            IndirectCommandKind::DrawIndexed => 20,
        };
        Ref::new(CommandSignature::new(name, kind, stride))
    }

    #[must_use]
    pub fn create_root_signature(&self, name: &str) -> Ref<RootSignature> {
        Ref::new(RootSignature::new(name))
    }

    // ── Acceleration structure queries ─────────────────────────────────────

    /// Prebuild sizes for a bottom-level acceleration structure.
    #[must_use]
    pub fn blas_prebuild_info(&self, primitive_count: u32) -> AsPrebuildInfo {
        let result = align_up(256 + u64::from(primitive_count) * 64, AS_ALIGNMENT);
        AsPrebuildInfo {
            result_size: result,
            scratch_size: align_up(result / 2 + 256, AS_ALIGNMENT),
        }
    }

    /// Prebuild sizes for a top-level acceleration structure.
    #[must_use]
    pub fn tlas_prebuild_info(&self, instance_count: u32) -> AsPrebuildInfo {
        let result = align_up(256 + u64::from(instance_count) * 64, AS_ALIGNMENT);
        AsPrebuildInfo {
            result_size: result,
            scratch_size: result,
        }
    }

    /// Reserves `count` contiguous bindless descriptor heap slots.
    pub(crate) fn allocate_descriptors(&self, count: u32) -> u32 {
        self.next_descriptor.fetch_add(count, Ordering::Relaxed)
    }

    // ── Command contexts ───────────────────────────────────────────────────

    /// Allocates a command context. The backing command storage is pooled
    /// and reclaimed by fence value.
    #[must_use]
    pub fn allocate_command_context(&self) -> CommandContext<'_> {
        let storage = self.command_storage.allocate(Vec::new);
        CommandContext::new(self, storage)
    }

    pub(crate) fn recycle_command_storage(&self, mut commands: Vec<Command>, fence: &Ref<Fence>) {
        commands.clear();
        let sync = SyncPoint::new(fence.clone(), fence.current_value());
        self.command_storage.free(commands, sync);
    }

    /// Submits a single context to the graphics queue. `wait` blocks on the
    /// signaled fence value — used only for one-shot uploads and readbacks,
    /// never inside the per-frame graph.
    pub fn submit(&self, context: CommandContext<'_>, wait: bool) -> SyncPoint {
        let sync = self.graphics_queue.execute_command_lists(self, vec![context]);
        if wait {
            sync.wait();
        }
        sync
    }

    // ── Frame pacing ───────────────────────────────────────────────────────

    /// Ends the current frame: signals the frame fence, then blocks until
    /// the GPU is within [`FRAME_LATENCY`] frames. This is the frame loop's
    /// single blocking point and the device-removal detection point.
    pub fn next_frame(&self) -> Result<u64> {
        if self.device_removed.load(Ordering::Acquire) {
            return Err(ArgusError::DeviceLost(
                "device removal detected at frame fence".to_string(),
            ));
        }
        let signaled = self.frame_fence.signal_next();
        if signaled > FRAME_LATENCY {
            self.frame_fence.cpu_wait(signaled - FRAME_LATENCY);
        }
        Ok(self.frame_index.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Marks the device lost; surfaced at the next frame-fence wait.
    pub fn notify_device_removed(&self) {
        self.device_removed.store(true, Ordering::Release);
    }

    /// Blocks until every queue has drained. Called on shutdown before
    /// destroying resources.
    pub fn wait_idle(&self) {
        self.graphics_queue.wait_idle();
        self.frame_fence.cpu_wait(self.frame_fence.last_signaled());
    }
}
