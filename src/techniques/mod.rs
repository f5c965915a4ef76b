//! Rendering Techniques
//!
//! The GPU-driven frame built on top of the render graph:
//!
//! - [`HzbBuilder`]: hierarchical-Z pyramid (init + single-pass downsample)
//! - [`GpuDrivenRenderer`]: two-phase instance/meshlet occlusion culling,
//!   PSO-bin classification, indirect mesh-shader rasterization
//! - [`ClusteredLightCulling`]: cluster-grid light binning and shading
//! - [`AccelerationStructure`]: BLAS budget/compaction, TLAS rebuild
//!
//! Each technique records passes into an [`crate::graph::RGGraph`]; the
//! `reference` submodules carry CPU mirrors of the GPU kernels for tests
//! and debugging.

pub mod accel;
pub mod gpu_driven;
pub mod hzb;
pub mod light_culling;

pub use accel::{
    instance_flags_for, AccelerationStructure, BlasInstance,
    INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE,
};
pub use gpu_driven::{
    GpuDrivenRenderer, MeshletBinArgs, MeshletCandidate, PipelineBin, RasterContext, RasterMode,
    RasterResult, ViewUniforms, MAX_INSTANCES, MAX_MESHLETS, NUM_BINS,
};
pub use hzb::{hzb_dimensions, hzb_mip_count, spd_setup, HzbBuilder, SpdSetup};
pub use light_culling::{
    sphere_intersects_aabb, ClusterGrid, ClusteredForwardInputs, ClusteredLightCulling,
    CLUSTER_COUNT_Z, CLUSTER_SIZE, MAX_LIGHTS_PER_CLUSTER,
};
