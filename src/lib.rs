#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

pub mod errors;
pub mod graph;
pub mod rhi;
pub mod scene;
pub mod techniques;

pub use errors::{ArgusError, Result};
pub use graph::{
    RGBlackboard, RGBufferHandle, RGGraph, RGGraphOptions, RGPassFlags, RGResourceAllocator,
    RGResourcePool, RGResources, RGTextureHandle,
};
pub use rhi::{
    Buffer, BufferDesc, BufferFlags, CommandContext, CommandQueue, Fence, GraphicsCommon,
    GraphicsDevice, Ref, ResourceFormat, ResourceState, SyncPoint, Texture, TextureDesc,
    TextureFlags,
};
pub use scene::{Batch, BlendMode, Frustum, Light, Mesh, Meshlet, ViewTransform};
pub use techniques::{
    AccelerationStructure, ClusteredLightCulling, GpuDrivenRenderer, HzbBuilder, RasterContext,
    RasterMode, RasterResult,
};
