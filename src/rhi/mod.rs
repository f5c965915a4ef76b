//! Device Abstraction (RHI)
//!
//! An explicit-API (bindless, command-list, timeline-fence) device model:
//! manual resource states and barriers, placed resources in heaps, indirect
//! execution, mesh-shading pipelines.
//!
//! The crate ships a software backend: command streams are recorded,
//! validated and retired in submission order; timelines signal at submit;
//! upload/readback storage and a few CPU-observable command effects are
//! modeled so the render graph and techniques can be tested end to end.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`GraphicsDevice`] | resource/pipeline/heap creation, frame pacing |
//! | [`CommandContext`] | command recording with batched barriers |
//! | [`CommandQueue`]   | in-order submission, timeline signaling |
//! | [`Fence`] / [`SyncPoint`] | the only way to observe GPU progress |
//! | [`ScratchAllocator`] | per-frame linear upload allocations |
//! | [`GraphicsCommon`] | default textures, shared command signatures |

pub mod commands;
pub mod common;
pub mod device;
pub mod fence;
pub mod pipeline;
pub mod queue;
pub mod resources;
pub mod scratch;
pub mod types;

pub use commands::{
    Command, CommandContext, DepthTargetInfo, RenderPassColorFlags, RenderPassDepthFlags,
    RenderPassInfo, RenderTargetInfo,
};
pub use common::{DefaultTexture, GraphicsCommon};
pub use device::{
    AsPrebuildInfo, DeviceCapabilities, GraphicsDevice, AS_ALIGNMENT, FRAME_LATENCY,
    RESOURCE_ALIGNMENT,
};
pub use fence::{Fence, FencedPool, SyncPoint};
pub use pipeline::{
    CommandSignature, CompareFunc, CullMode, IndirectCommandKind, PipelineKind, PipelineState,
    PipelineStateInitializer, RootSignature, ShaderDefines, ShaderRef,
};
pub use queue::{CommandQueue, QueueKind};
pub use resources::{
    AnyResource, Buffer, BufferDesc, BufferFlags, Heap, Ref, ResourceStateTracker, Texture,
    TextureDesc, TextureFlags, TextureType,
};
pub use scratch::{ScratchAllocation, ScratchAllocationManager, ScratchAllocator};
pub use types::{
    align_up, needs_transition, thread_group_count, IndirectDispatchArgs, IndirectDispatchMeshArgs,
    ResourceFormat, ResourceState, ALL_SUBRESOURCES,
};
