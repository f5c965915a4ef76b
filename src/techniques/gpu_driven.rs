//! GPU-Driven Rasterizer
//!
//! Lifts frustum culling, occlusion culling and draw recording off the CPU:
//! all scene data is GPU-resident and geometry is split into meshlets, so
//! culling runs at two granularities (instances, then meshlets).
//!
//! Two-phase occlusion culling: phase 1 tests everything against the
//! *previous* frame's HZB — objects that were visible last frame are likely
//! visible now — and defers the rest; after rasterizing phase-1 survivors,
//! the HZB is rebuilt and phase 2 retests the deferred set against it.
//! Surviving meshlets land in one unordered list, so a small GPU bucket
//! sort classifies them into PSO bins before the indirect mesh-shader draw.

use glam::Mat4;

use crate::errors::Result;
use crate::graph::{RGBufferHandle, RGGraph, RGPassFlags, RGTextureHandle, TextureSlot};
use crate::rhi::{
    thread_group_count, BufferDesc, BufferFlags, CommandSignature, CompareFunc, CullMode,
    GraphicsCommon, GraphicsDevice, IndirectDispatchArgs, PipelineState, PipelineStateInitializer,
    Ref, RenderPassColorFlags, RenderPassDepthFlags, ResourceFormat, RootSignature, ShaderDefines,
    Texture, TextureDesc,
};
use crate::scene::{Batch, BlendMode, ViewTransform};

use super::hzb::HzbBuilder;

/// Meshlet cap per view per frame; sizes the persistent buffers
/// (2^20 × 8-byte candidates ≈ 8 MiB, twice).
pub const MAX_MESHLETS: u32 = 1 << 20;
/// Instance cap per view per frame.
pub const MAX_INSTANCES: u32 = 1 << 14;

/// PSO bins the classification sorts visible meshlets into.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PipelineBin {
    Opaque = 0,
    AlphaMasked = 1,
}

pub const NUM_BINS: u32 = 2;

impl PipelineBin {
    #[must_use]
    pub fn from_blend_mode(mode: BlendMode) -> Self {
        if mode.contains(BlendMode::ALPHA_MASK) {
            Self::AlphaMasked
        } else {
            Self::Opaque
        }
    }
}

/// One culling survivor awaiting meshlet culling or rasterization.
/// Layout shared with the culling shaders.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshletCandidate {
    pub instance_id: u32,
    pub meshlet_index: u32,
}

/// Per-bin `(offset, count, 1, 1)` record consumed as dispatch-mesh args.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshletBinArgs {
    pub offset: u32,
    pub count: u32,
    pub group_y: u32,
    pub group_z: u32,
}

/// Visibility-buffer texel layout: 25 bits of meshlet id, 7 bits of
/// primitive id. Stable within a build.
pub const VISIBILITY_PRIMITIVE_BITS: u32 = 7;

#[must_use]
pub fn pack_visibility(meshlet_id: u32, primitive_id: u32) -> u32 {
    debug_assert!(primitive_id < (1 << VISIBILITY_PRIMITIVE_BITS));
    (meshlet_id << VISIBILITY_PRIMITIVE_BITS) | primitive_id
}

#[must_use]
pub fn unpack_visibility(value: u32) -> (u32, u32) {
    (
        value >> VISIBILITY_PRIMITIVE_BITS,
        value & ((1 << VISIBILITY_PRIMITIVE_BITS) - 1),
    )
}

/// What the rasterizer writes: a visibility buffer for the main view, or
/// depth only for shadow views.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RasterMode {
    VisibilityBuffer,
    Shadows,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RasterPhase {
    Phase1,
    Phase2,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct CullParams {
    hzb_dimensions: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ClassifyParams {
    num_bins: u32,
    is_second_phase: u32,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct BinIndexParams {
    bin_index: u32,
}

/// View constants shared by the culling and raster shaders.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ViewUniforms {
    pub world_to_clip: Mat4,
    pub world_to_view: Mat4,
    pub position: [f32; 4],
    pub viewport: [f32; 2],
    pub near: f32,
    pub far: f32,
}

impl ViewUniforms {
    #[must_use]
    pub fn from_view(view: &ViewTransform) -> Self {
        Self {
            world_to_clip: view.world_to_clip,
            world_to_view: view.world_to_view,
            position: [view.position.x, view.position.y, view.position.z, 1.0],
            viewport: [view.viewport.0 as f32, view.viewport.1 as f32],
            near: view.near,
            far: view.far,
        }
    }
}

/// Per-view culling state: the persistent candidate/visible lists and their
/// counters, plus the inputs the renderer needs.
///
/// Counter layouts: `CandidateMeshlets.Counter` is `[total, phase1,
/// phase2]`; `VisibleMeshlets.Counter` is `[phase1, phase2]`.
pub struct RasterContext<'g> {
    pub mode: RasterMode,
    pub depth: RGTextureHandle,
    pub previous_hzb: &'g mut TextureSlot,
    pub enable_debug: bool,
    pub enable_occlusion_culling: bool,

    pub(crate) candidate_meshlets: RGBufferHandle,
    pub(crate) candidate_meshlets_counter: RGBufferHandle,
    pub(crate) visible_meshlets: RGBufferHandle,
    pub(crate) visible_meshlets_counter: RGBufferHandle,
    pub(crate) occluded_instances: RGBufferHandle,
    pub(crate) occluded_instances_counter: RGBufferHandle,
}

impl<'g> RasterContext<'g> {
    pub fn new(
        graph: &mut RGGraph<'g>,
        mode: RasterMode,
        depth: RGTextureHandle,
        previous_hzb: &'g mut TextureSlot,
    ) -> Self {
        let candidate_meshlets = graph.create_buffer(
            "GPURender.CandidateMeshlets",
            BufferDesc::structured(MAX_MESHLETS, std::mem::size_of::<MeshletCandidate>() as u32),
        );
        let visible_meshlets = graph.create_buffer(
            "GPURender.VisibleMeshlets",
            BufferDesc::structured(MAX_MESHLETS, std::mem::size_of::<MeshletCandidate>() as u32),
        );
        let occluded_instances = graph.create_buffer(
            "GPURender.OccludedInstances",
            BufferDesc::structured(MAX_INSTANCES, std::mem::size_of::<u32>() as u32),
        );
        let occluded_instances_counter = graph.create_buffer(
            "GPURender.OccludedInstances.Counter",
            BufferDesc::typed(1, ResourceFormat::R32Uint),
        );
        let candidate_meshlets_counter = graph.create_buffer(
            "GPURender.CandidateMeshlets.Counter",
            BufferDesc::typed(3, ResourceFormat::R32Uint),
        );
        let visible_meshlets_counter = graph.create_buffer(
            "GPURender.VisibleMeshlets.Counter",
            BufferDesc::typed(2, ResourceFormat::R32Uint),
        );

        Self {
            mode,
            depth,
            previous_hzb,
            enable_debug: false,
            enable_occlusion_culling: true,
            candidate_meshlets,
            candidate_meshlets_counter,
            visible_meshlets,
            visible_meshlets_counter,
            occluded_instances,
            occluded_instances_counter,
        }
    }

    #[must_use]
    pub fn with_debug(mut self, enable: bool) -> Self {
        self.enable_debug = enable;
        self
    }

    #[must_use]
    pub fn with_occlusion_culling(mut self, enable: bool) -> Self {
        self.enable_occlusion_culling = enable;
        self
    }
}

/// Outputs of a [`GpuDrivenRenderer::render`] invocation.
pub struct RasterResult {
    pub visibility_buffer: Option<RGTextureHandle>,
    pub hzb: Option<RGTextureHandle>,
    pub visible_meshlets: RGBufferHandle,
    pub debug_data: Option<RGTextureHandle>,
}

// Copyable subset of the context shared with the per-phase recorder.
#[derive(Clone, Copy)]
struct RasterBuffers {
    candidate_meshlets: RGBufferHandle,
    candidate_meshlets_counter: RGBufferHandle,
    visible_meshlets: RGBufferHandle,
    visible_meshlets_counter: RGBufferHandle,
    occluded_instances: RGBufferHandle,
    occluded_instances_counter: RGBufferHandle,
}

/// Records the two-phase culling and binned rasterization passes.
pub struct GpuDrivenRenderer {
    root_signature: Ref<RootSignature>,
    dispatch_signature: Ref<CommandSignature>,
    dispatch_mesh_signature: Ref<CommandSignature>,
    fallback_hzb: Ref<Texture>,
    hzb: HzbBuilder,

    build_cull_args_pso: Ref<PipelineState>,
    // [phase1, phase2] permutations.
    cull_instances_pso: [Ref<PipelineState>; 2],
    cull_meshlets_pso: [Ref<PipelineState>; 2],
    build_meshlet_cull_args_pso: [Ref<PipelineState>; 2],
    cull_instances_no_occlusion_pso: Ref<PipelineState>,
    cull_meshlets_no_occlusion_pso: Ref<PipelineState>,

    bin_prepare_args_pso: Ref<PipelineState>,
    bin_classify_pso: Ref<PipelineState>,
    bin_allocate_ranges_pso: Ref<PipelineState>,
    bin_write_pso: Ref<PipelineState>,

    // Raster permutations per bin.
    draw_meshlets_pso: [Ref<PipelineState>; NUM_BINS as usize],
    draw_meshlets_debug_pso: [Ref<PipelineState>; NUM_BINS as usize],
    draw_meshlets_depth_only_pso: [Ref<PipelineState>; NUM_BINS as usize],

    print_stats_pso: Ref<PipelineState>,
}

impl GpuDrivenRenderer {
    pub fn new(device: &GraphicsDevice, common: &GraphicsCommon) -> Result<Self> {
        assert!(
            device.capabilities().mesh_shading,
            "GPU-driven rendering requires mesh shading support"
        );

        let rs = common.root_signature();
        let mut defines = ShaderDefines::new();
        defines.set("MAX_NUM_MESHLETS", MAX_MESHLETS);
        defines.set("MAX_NUM_INSTANCES", MAX_INSTANCES);

        let build_cull_args_pso = device.create_compute_pipeline(
            rs,
            "MeshletCull.hlsl",
            "BuildInstanceCullIndirectArgs",
            &defines,
        )?;

        let make_raster = |alpha_mask: bool, debug: bool| -> Result<Ref<PipelineState>> {
            let mut raster_defines = defines.clone();
            raster_defines.set("ALPHA_MASK", u32::from(alpha_mask));
            raster_defines.set("ENABLE_DEBUG_DATA", u32::from(debug));
            let mut pso = PipelineStateInitializer::new("Meshlet Rasterize (Visibility Buffer)");
            pso.set_depth_test(CompareFunc::Greater)
                .set_render_target_formats(&[ResourceFormat::R32Uint], ResourceFormat::D32Float, 1)
                .set_mesh_shader("MeshletRasterize.hlsl", "MSMain", &raster_defines)
                .set_pixel_shader("MeshletRasterize.hlsl", "PSMain", &raster_defines);
            if alpha_mask {
                pso.set_cull_mode(CullMode::None);
            }
            device.create_pipeline(pso)
        };

        let make_depth_only = |alpha_mask: bool| -> Result<Ref<PipelineState>> {
            let mut raster_defines = defines.clone();
            raster_defines.set("DEPTH_ONLY", 1u32);
            raster_defines.set("ALPHA_MASK", u32::from(alpha_mask));
            let mut pso = PipelineStateInitializer::new("Meshlet Rasterize (Depth Only)");
            pso.set_depth_test(CompareFunc::Greater)
                .set_depth_only_target(ResourceFormat::D16Unorm, 1)
                .set_depth_bias(-10, 0, -4.0)
                .set_cull_mode(CullMode::None)
                .set_mesh_shader("MeshletRasterize.hlsl", "MSMain", &raster_defines);
            if alpha_mask {
                pso.set_pixel_shader("MeshletRasterize.hlsl", "PSMain", &raster_defines);
            }
            device.create_pipeline(pso)
        };

        let make_cull_pso = |entry: &str, first_pass: bool, occlusion: bool| {
            let mut cull_defines = defines.clone();
            cull_defines.set("OCCLUSION_FIRST_PASS", u32::from(first_pass));
            cull_defines.set("OCCLUSION_CULL", u32::from(occlusion));
            device.create_compute_pipeline(rs, "MeshletCull.hlsl", entry, &cull_defines)
        };

        Ok(Self {
            root_signature: rs.clone(),
            dispatch_signature: common.indirect_dispatch_signature().clone(),
            dispatch_mesh_signature: common.indirect_dispatch_mesh_signature().clone(),
            fallback_hzb: common.default_texture(crate::rhi::DefaultTexture::Black2D).clone(),
            hzb: HzbBuilder::new(device, common)?,

            build_cull_args_pso,
            cull_instances_pso: [
                make_cull_pso("CullInstancesCS", true, true)?,
                make_cull_pso("CullInstancesCS", false, true)?,
            ],
            cull_meshlets_pso: [
                make_cull_pso("CullMeshletsCS", true, true)?,
                make_cull_pso("CullMeshletsCS", false, true)?,
            ],
            build_meshlet_cull_args_pso: [
                make_cull_pso("BuildMeshletCullIndirectArgs", true, true)?,
                make_cull_pso("BuildMeshletCullIndirectArgs", false, true)?,
            ],
            cull_instances_no_occlusion_pso: make_cull_pso("CullInstancesCS", true, false)?,
            cull_meshlets_no_occlusion_pso: make_cull_pso("CullMeshletsCS", true, false)?,

            bin_prepare_args_pso: device.create_compute_pipeline(
                rs,
                "MeshletBinning.hlsl",
                "PrepareArgsCS",
                &defines,
            )?,
            bin_classify_pso: device.create_compute_pipeline(
                rs,
                "MeshletBinning.hlsl",
                "ClassifyMeshletsCS",
                &defines,
            )?,
            bin_allocate_ranges_pso: device.create_compute_pipeline(
                rs,
                "MeshletBinning.hlsl",
                "AllocateBinRangesCS",
                &defines,
            )?,
            bin_write_pso: device.create_compute_pipeline(
                rs,
                "MeshletBinning.hlsl",
                "WriteBinsCS",
                &defines,
            )?,

            draw_meshlets_pso: [make_raster(false, false)?, make_raster(true, false)?],
            draw_meshlets_debug_pso: [make_raster(false, true)?, make_raster(true, true)?],
            draw_meshlets_depth_only_pso: [make_depth_only(false)?, make_depth_only(true)?],

            print_stats_pso: device.create_compute_pipeline(
                rs,
                "MeshletCull.hlsl",
                "PrintStatsCS",
                &defines,
            )?,
        })
    }

    /// Records the full two-phase render for one view.
    pub fn render<'g>(
        &self,
        graph: &mut RGGraph<'g>,
        batches: &[Batch],
        view: &ViewTransform,
        context: RasterContext<'g>,
    ) -> RasterResult {
        let RasterContext {
            mode,
            depth,
            previous_hzb,
            enable_debug,
            enable_occlusion_culling,
            candidate_meshlets,
            candidate_meshlets_counter,
            visible_meshlets,
            visible_meshlets_counter,
            occluded_instances,
            occluded_instances_counter,
        } = context;

        let total_meshlets: u32 = batches.iter().map(|b| b.mesh.meshlet_count).sum();
        assert!(
            batches.len() <= MAX_INSTANCES as usize,
            "Scene exceeds the instance cap: {} > {MAX_INSTANCES}",
            batches.len()
        );
        assert!(
            total_meshlets <= MAX_MESHLETS,
            "Scene exceeds the meshlet cap: {total_meshlets} > {MAX_MESHLETS}"
        );

        let buffers = RasterBuffers {
            candidate_meshlets,
            candidate_meshlets_counter,
            visible_meshlets,
            visible_meshlets_counter,
            occluded_instances,
            occluded_instances_counter,
        };

        let mut graph = graph.scoped("Cull and Rasterize");

        let dimensions = graph
            .resource(depth.id())
            .desc
            .as_texture()
            .expect("Depth handle must be a texture")
            .size_2d();

        let previous_hzb_snapshot = previous_hzb.clone();

        let mut result = RasterResult {
            visibility_buffer: (mode == RasterMode::VisibilityBuffer).then(|| {
                graph.create_texture(
                    "Visibility",
                    TextureDesc::render_target(dimensions.0, dimensions.1, ResourceFormat::R32Uint),
                )
            }),
            hzb: None,
            visible_meshlets,
            debug_data: enable_debug.then(|| {
                graph.create_texture(
                    "GPURender.DebugData",
                    TextureDesc::create_2d(dimensions.0, dimensions.1, ResourceFormat::R32Uint),
                )
            }),
        };

        if enable_occlusion_culling {
            let hzb = self.hzb.init_hzb(&mut graph, dimensions);
            graph.export_texture(hzb, previous_hzb, crate::rhi::TextureFlags::NONE);
            result.hzb = Some(hzb);
        }

        // Clear all counters (and last frame's debug data).
        {
            let debug_data = result.debug_data;
            let mut clear_pass = graph
                .add_pass("Clear UAVs", RGPassFlags::COMPUTE)
                .write(&[
                    candidate_meshlets_counter.into(),
                    occluded_instances_counter.into(),
                    visible_meshlets_counter.into(),
                ]);
            if let Some(debug) = debug_data {
                clear_pass = clear_pass.write(&[debug.into()]);
            }
            let _ = clear_pass.bind(move |context, resources| {
                if let Some(debug) = debug_data {
                    context.clear_uav_u32(&resources.get(debug), 0);
                }
                context.clear_uav_u32(&resources.get(candidate_meshlets_counter), 0);
                context.clear_uav_u32(&resources.get(occluded_instances_counter), 0);
                context.clear_uav_u32(&resources.get(visible_meshlets_counter), 0);
                context.insert_uav_barrier(None);
                context.flush_resource_barriers();
            });
        }

        {
            let mut phase_graph = graph.scoped("Phase 1");
            self.cull_and_rasterize(
                &mut phase_graph,
                batches,
                view,
                RasterPhase::Phase1,
                mode,
                enable_debug,
                enable_occlusion_culling,
                &previous_hzb_snapshot,
                buffers,
                depth,
                &mut result,
            );
        }

        // With occlusion culling off, phase 1 already rendered everything.
        if enable_occlusion_culling {
            let mut phase_graph = graph.scoped("Phase 2");
            self.cull_and_rasterize(
                &mut phase_graph,
                batches,
                view,
                RasterPhase::Phase2,
                mode,
                enable_debug,
                enable_occlusion_culling,
                &previous_hzb_snapshot,
                buffers,
                depth,
                &mut result,
            );
        }

        result
    }

    #[allow(clippy::too_many_lines)]
    fn cull_and_rasterize(
        &self,
        graph: &mut RGGraph<'_>,
        batches: &[Batch],
        view: &ViewTransform,
        phase: RasterPhase,
        mode: RasterMode,
        enable_debug: bool,
        enable_occlusion_culling: bool,
        previous_hzb: &TextureSlot,
        buffers: RasterBuffers,
        depth: RGTextureHandle,
        result: &mut RasterResult,
    ) {
        let phase_index = usize::from(phase == RasterPhase::Phase2);

        // Phase 1 reads the previous frame's HZB; phase 2 reads the one
        // phase 1 just rebuilt.
        let source_hzb = if enable_occlusion_culling {
            match phase {
                RasterPhase::Phase1 => {
                    graph.try_import_texture(previous_hzb.as_ref(), Some(&self.fallback_hzb))
                }
                RasterPhase::Phase2 => result.hzb,
            }
        } else {
            None
        };
        let hzb_dimensions = source_hzb
            .map(|hzb| {
                graph
                    .resource(hzb.id())
                    .desc
                    .as_texture()
                    .map_or((0, 0), crate::rhi::TextureDesc::size_2d)
            })
            .unwrap_or((0, 0));

        let (cull_instances_pso, cull_meshlets_pso) = if enable_occlusion_culling {
            (
                self.cull_instances_pso[phase_index].clone(),
                self.cull_meshlets_pso[phase_index].clone(),
            )
        } else {
            (
                self.cull_instances_no_occlusion_pso.clone(),
                self.cull_meshlets_no_occlusion_pso.clone(),
            )
        };
        let raster_psos = match (mode, enable_debug) {
            (RasterMode::Shadows, _) => &self.draw_meshlets_depth_only_pso,
            (RasterMode::VisibilityBuffer, false) => &self.draw_meshlets_pso,
            (RasterMode::VisibilityBuffer, true) => &self.draw_meshlets_debug_pso,
        };

        let view_uniforms = ViewUniforms::from_view(view);
        let cull_params = CullParams {
            hzb_dimensions: [hzb_dimensions.0, hzb_dimensions.1],
        };

        // Phase 2 dispatches instance culling indirectly over the list of
        // instances phase 1 considered occluded.
        let instance_cull_args = (phase == RasterPhase::Phase2).then(|| {
            let args = graph.create_buffer(
                "GPURender.InstanceCullArgs",
                BufferDesc::indirect_arguments::<IndirectDispatchArgs>(1),
            );
            let root_signature = self.root_signature.clone();
            let pso = self.build_cull_args_pso.clone();
            let occluded_counter = buffers.occluded_instances_counter;
            let _ = graph
                .add_pass("Build Instance Cull Arguments", RGPassFlags::COMPUTE)
                .read(&[occluded_counter.into()])
                .write(&[args.into()])
                .bind(move |context, resources| {
                    context.set_compute_root_signature(&root_signature);
                    context.set_pipeline_state(&pso);
                    context.bind_resources(2, &[resources.uav(args)]);
                    context.bind_resources_at(3, &[resources.srv(occluded_counter)], 2);
                    context.dispatch_1d(1);
                });
            args
        });

        // Cull instances: frustum + occlusion test per instance, emitting
        // surviving instances' meshlets and (phase 1) the occluded list.
        {
            let root_signature = self.root_signature.clone();
            let pso = cull_instances_pso;
            let signature = self.dispatch_signature.clone();
            let batch_count = batches.len() as u32;
            let b = buffers;
            let mut pass = graph
                .add_pass("Cull Instances", RGPassFlags::COMPUTE)
                .write(&[
                    b.candidate_meshlets.into(),
                    b.candidate_meshlets_counter.into(),
                    b.occluded_instances.into(),
                    b.occluded_instances_counter.into(),
                ]);
            if let Some(args) = instance_cull_args {
                pass = pass.read(&[args.into()]);
            }
            if let Some(hzb) = source_hzb {
                pass = pass.read(&[hzb.into()]);
            }
            let _ = pass.bind(move |context, resources| {
                context.set_compute_root_signature(&root_signature);
                context.set_pipeline_state(&pso);
                context.bind_root_cbv(0, &cull_params);
                context.bind_root_cbv(1, &view_uniforms);
                context.bind_resources(
                    2,
                    &[
                        resources.uav(b.candidate_meshlets),
                        resources.uav(b.candidate_meshlets_counter),
                        resources.uav(b.occluded_instances),
                        resources.uav(b.occluded_instances_counter),
                    ],
                );
                if let Some(hzb) = source_hzb {
                    context.bind_resources_at(3, &[resources.srv(hzb)], 3);
                }
                match instance_cull_args {
                    None => context.dispatch_1d(thread_group_count(batch_count, 64).max(1)),
                    Some(args) => {
                        context.execute_indirect(
                            &signature,
                            1,
                            &resources.get_buffer(args),
                            0,
                            None,
                            0,
                        );
                    }
                }
            });
        }

        // Size the meshlet-cull dispatch from the candidate count.
        let meshlet_cull_args = graph.create_buffer(
            "GPURender.MeshletCullArgs",
            BufferDesc::indirect_arguments::<IndirectDispatchArgs>(1),
        );
        {
            let root_signature = self.root_signature.clone();
            let pso = self.build_meshlet_cull_args_pso[phase_index].clone();
            let counter = buffers.candidate_meshlets_counter;
            let _ = graph
                .add_pass("Build Meshlet Cull Arguments", RGPassFlags::COMPUTE)
                .read(&[counter.into()])
                .write(&[meshlet_cull_args.into()])
                .bind(move |context, resources| {
                    context.set_compute_root_signature(&root_signature);
                    context.set_pipeline_state(&pso);
                    context.bind_resources(2, &[resources.uav(meshlet_cull_args)]);
                    context.bind_resources_at(3, &[resources.srv(counter)], 1);
                    context.dispatch_1d(1);
                });
        }

        // Cull meshlets: cone, frustum, then HZB. Phase 1 pushes occluded
        // meshlets into the carry-over region for phase 2.
        {
            let root_signature = self.root_signature.clone();
            let pso = cull_meshlets_pso;
            let signature = self.dispatch_signature.clone();
            let b = buffers;
            let mut pass = graph
                .add_pass("Cull Meshlets", RGPassFlags::COMPUTE)
                .read(&[meshlet_cull_args.into()])
                .write(&[
                    b.candidate_meshlets.into(),
                    b.candidate_meshlets_counter.into(),
                    b.visible_meshlets.into(),
                    b.visible_meshlets_counter.into(),
                    b.occluded_instances.into(),
                    b.occluded_instances_counter.into(),
                ]);
            if let Some(hzb) = source_hzb {
                pass = pass.read(&[hzb.into()]);
            }
            let _ = pass.bind(move |context, resources| {
                context.set_compute_root_signature(&root_signature);
                context.set_pipeline_state(&pso);
                context.bind_root_cbv(0, &cull_params);
                context.bind_root_cbv(1, &view_uniforms);
                context.bind_resources(
                    2,
                    &[
                        resources.uav(b.candidate_meshlets),
                        resources.uav(b.candidate_meshlets_counter),
                        resources.uav(b.occluded_instances),
                        resources.uav(b.occluded_instances_counter),
                        resources.uav(b.visible_meshlets),
                        resources.uav(b.visible_meshlets_counter),
                    ],
                );
                if let Some(hzb) = source_hzb {
                    context.bind_resources_at(3, &[resources.srv(hzb)], 3);
                }
                context.execute_indirect(
                    &signature,
                    1,
                    &resources.get_buffer(meshlet_cull_args),
                    0,
                    None,
                    0,
                );
            });
        }

        // Visible meshlets land in one unordered list; classify them into
        // per-PSO bins with a 4-pass GPU bucket sort, producing an
        // `(offset, count)` record per bin plus an indirection list.
        let bin_args = graph.create_buffer(
            "GPURender.Classify.MeshletOffsetAndCounts",
            BufferDesc::structured_with_flags(
                NUM_BINS,
                std::mem::size_of::<MeshletBinArgs>() as u32,
                BufferFlags::UNORDERED_ACCESS
                    | BufferFlags::SHADER_RESOURCE
                    | BufferFlags::INDIRECT_ARGUMENTS,
            ),
        );
        let binned_meshlets = graph.create_buffer(
            "GPURender.Classify.BinnedMeshlets",
            BufferDesc::structured(MAX_MESHLETS, std::mem::size_of::<u32>() as u32),
        );
        {
            let mut graph = graph.scoped("Classify Shader Types");

            let bin_counts = graph.create_buffer(
                "GPURender.Classify.MeshletCounts",
                BufferDesc::typed(NUM_BINS, ResourceFormat::R32Uint),
            );
            let global_count = graph.create_buffer(
                "GPURender.Classify.GlobalCount",
                BufferDesc::typed(1, ResourceFormat::R32Uint),
            );
            let classify_args = graph.create_buffer(
                "GPURender.Classify.Args",
                BufferDesc::indirect_arguments::<IndirectDispatchArgs>(1),
            );

            let classify_params = ClassifyParams {
                num_bins: NUM_BINS,
                is_second_phase: u32::from(phase == RasterPhase::Phase2),
            };

            // Clear the bin counters and build the classify dispatch args.
            {
                let root_signature = self.root_signature.clone();
                let pso = self.bin_prepare_args_pso.clone();
                let visible_counter = buffers.visible_meshlets_counter;
                let _ = graph
                    .add_pass("Prepare Classify", RGPassFlags::COMPUTE)
                    .read(&[visible_counter.into()])
                    .write(&[bin_counts.into(), global_count.into(), classify_args.into()])
                    .bind(move |context, resources| {
                        context.set_compute_root_signature(&root_signature);
                        context.set_pipeline_state(&pso);
                        context.bind_root_cbv(0, &classify_params);
                        context.bind_resources(
                            2,
                            &[
                                resources.uav(bin_counts),
                                resources.uav(global_count),
                                resources.uav(classify_args),
                            ],
                        );
                        context.bind_resources_at(3, &[resources.srv(visible_counter)], 1);
                        context.dispatch_1d(1);
                        context.insert_uav_barrier(None);
                        context.flush_resource_barriers();
                    });
            }

            // Count the meshlets that land in each bin.
            {
                let root_signature = self.root_signature.clone();
                let pso = self.bin_classify_pso.clone();
                let signature = self.dispatch_signature.clone();
                let b = buffers;
                let _ = graph
                    .add_pass("Count Meshlets", RGPassFlags::COMPUTE)
                    .read(&[
                        classify_args.into(),
                        b.visible_meshlets.into(),
                        b.visible_meshlets_counter.into(),
                    ])
                    .write(&[bin_counts.into()])
                    .bind(move |context, resources| {
                        context.set_compute_root_signature(&root_signature);
                        context.set_pipeline_state(&pso);
                        context.bind_root_cbv(0, &classify_params);
                        context.bind_resources(2, &[resources.uav(bin_counts)]);
                        context.bind_resources(
                            3,
                            &[
                                resources.srv(b.visible_meshlets),
                                resources.srv(b.visible_meshlets_counter),
                            ],
                        );
                        context.execute_indirect(
                            &signature,
                            1,
                            &resources.get_buffer(classify_args),
                            0,
                            None,
                            0,
                        );
                    });
            }

            // Prefix-sum the counts into per-bin start offsets.
            {
                let root_signature = self.root_signature.clone();
                let pso = self.bin_allocate_ranges_pso.clone();
                let _ = graph
                    .add_pass("Compute Bin Offsets", RGPassFlags::COMPUTE)
                    .read(&[bin_counts.into()])
                    .write(&[global_count.into(), bin_args.into()])
                    .bind(move |context, resources| {
                        context.set_compute_root_signature(&root_signature);
                        context.set_pipeline_state(&pso);
                        context.bind_root_cbv(0, &classify_params);
                        context.bind_resources(
                            2,
                            &[resources.uav(bin_args), resources.uav(global_count)],
                        );
                        context.bind_resources(3, &[resources.srv(bin_counts)]);
                        context.dispatch_1d(thread_group_count(NUM_BINS, 64));
                    });
            }

            // Scatter each visible meshlet's index into its bin.
            {
                let root_signature = self.root_signature.clone();
                let pso = self.bin_write_pso.clone();
                let signature = self.dispatch_signature.clone();
                let b = buffers;
                let _ = graph
                    .add_pass("Write Bins", RGPassFlags::COMPUTE)
                    .read(&[
                        classify_args.into(),
                        b.visible_meshlets.into(),
                        b.visible_meshlets_counter.into(),
                    ])
                    .write(&[bin_args.into(), binned_meshlets.into()])
                    .bind(move |context, resources| {
                        context.set_compute_root_signature(&root_signature);
                        context.set_pipeline_state(&pso);
                        context.bind_root_cbv(0, &classify_params);
                        context.bind_resources(
                            2,
                            &[resources.uav(bin_args), resources.uav(binned_meshlets)],
                        );
                        context.bind_resources(
                            3,
                            &[
                                resources.srv(b.visible_meshlets),
                                resources.srv(b.visible_meshlets_counter),
                            ],
                        );
                        context.execute_indirect(
                            &signature,
                            1,
                            &resources.get_buffer(classify_args),
                            0,
                            None,
                            0,
                        );
                    });
            }
        }

        // Rasterize bin by bin: bind the bin's PSO and issue an indirect
        // dispatch-mesh off that bin's `(offset, count, 1, 1)` record.
        {
            let root_signature = self.root_signature.clone();
            let signature = self.dispatch_mesh_signature.clone();
            let psos = raster_psos.clone();
            let b = buffers;
            let debug_data = result.debug_data;
            let depth_flags = if phase == RasterPhase::Phase1 {
                RenderPassDepthFlags::CLEAR
            } else {
                RenderPassDepthFlags::LOAD
            };

            let mut pass = graph
                .add_pass("Rasterize", RGPassFlags::RASTER)
                .read(&[
                    b.visible_meshlets.into(),
                    bin_args.into(),
                    binned_meshlets.into(),
                ])
                .depth_stencil(depth, depth_flags);
            if let Some(debug) = debug_data {
                pass = pass.write(&[debug.into()]);
            }
            if let Some(visibility) = result.visibility_buffer {
                let load = if phase == RasterPhase::Phase1 {
                    RenderPassColorFlags::empty()
                } else {
                    RenderPassColorFlags::LOAD
                };
                pass = pass.render_target(visibility, load);
            }
            let _ = pass.bind(move |context, resources| {
                context.set_graphics_root_signature(&root_signature);
                context.bind_root_cbv(1, &view_uniforms);
                if let Some(debug) = debug_data {
                    context.bind_resources(2, &[resources.uav(debug)]);
                }
                context.bind_resources(
                    3,
                    &[
                        resources.srv(b.visible_meshlets),
                        resources.srv(binned_meshlets),
                        resources.srv(bin_args),
                    ],
                );
                let args_buffer = resources.get_buffer(bin_args);
                for bin_index in 0..NUM_BINS {
                    context.bind_root_cbv(0, &BinIndexParams { bin_index });
                    context.set_pipeline_state(&psos[bin_index as usize]);
                    context.execute_indirect(
                        &signature,
                        1,
                        &args_buffer,
                        u64::from(bin_index) * std::mem::size_of::<MeshletBinArgs>() as u64,
                        None,
                        0,
                    );
                }
            });
        }

        // Rebuild the HZB from the freshly rasterized depth: phase 1's
        // feeds phase 2, phase 2's feeds next frame's phase 1.
        if enable_occlusion_culling {
            self.hzb
                .build(graph, depth, result.hzb.expect("HZB missing"));
        }
    }

    /// Debug pass printing the phase counters through the GPU print stream.
    pub fn print_stats_pass(&self, graph: &mut RGGraph<'_>, context: &RasterContext<'_>) {
        let root_signature = self.root_signature.clone();
        let pso = self.print_stats_pso.clone();
        let candidate_counter = context.candidate_meshlets_counter;
        let occluded_counter = context.occluded_instances_counter;
        let visible_counter = context.visible_meshlets_counter;
        let _ = graph
            .add_pass("Print Stats", RGPassFlags::COMPUTE)
            .read(&[
                candidate_counter.into(),
                occluded_counter.into(),
                visible_counter.into(),
            ])
            .bind(move |ctx, resources| {
                ctx.set_compute_root_signature(&root_signature);
                ctx.set_pipeline_state(&pso);
                ctx.bind_resources_at(
                    3,
                    &[
                        resources.srv(candidate_counter),
                        resources.srv(occluded_counter),
                        resources.srv(visible_counter),
                    ],
                    1,
                );
                ctx.dispatch_1d(1);
            });
    }
}

// ─── CPU reference ────────────────────────────────────────────────────────────

/// Reference kernels mirroring the instance/meshlet culling shaders. The
/// two-phase scenario tests and the bin-closure property run against these.
pub mod reference {
    use glam::{Vec2, Vec3};

    use crate::scene::{Batch, BoundingBox, Meshlet, ViewTransform};
    use crate::techniques::hzb::reference as hzb_ref;

    use super::{PipelineBin, NUM_BINS};

    /// A CPU-side HZB pyramid (reverse-Z, min-reduced).
    pub struct HzbPyramid {
        mips: Vec<(Vec<f32>, u32, u32)>,
    }

    impl HzbPyramid {
        /// Builds the pyramid from a raw depth buffer.
        #[must_use]
        pub fn from_depth(depth: &[f32], depth_width: u32, depth_height: u32) -> Self {
            let (hzb_width, hzb_height) =
                crate::techniques::hzb::hzb_dimensions(depth_width, depth_height);
            let mip0 =
                hzb_ref::init_from_depth(depth, depth_width, depth_height, hzb_width, hzb_height);
            Self {
                mips: hzb_ref::build_pyramid(mip0, hzb_width, hzb_height),
            }
        }

        /// A pyramid saturated to a single depth value (e.g. the clear
        /// value on the first frame).
        #[must_use]
        pub fn uniform(depth_width: u32, depth_height: u32, value: f32) -> Self {
            let depth = vec![value; (depth_width * depth_height) as usize];
            Self::from_depth(&depth, depth_width, depth_height)
        }

        #[must_use]
        pub fn mip_count(&self) -> u32 {
            self.mips.len() as u32
        }

        #[must_use]
        pub fn dimensions(&self) -> (u32, u32) {
            (self.mips[0].1, self.mips[0].2)
        }

        #[must_use]
        pub fn mip(&self, level: u32) -> (&[f32], u32, u32) {
            let (texels, w, h) = &self.mips[level as usize];
            (texels, *w, *h)
        }

        fn texel(&self, level: u32, x: u32, y: u32) -> f32 {
            let (texels, w, h) = self.mip(level);
            texels[(y.min(h - 1) * w + x.min(w - 1)) as usize]
        }

        /// Conservative occlusion value over a UV rect: min of the four
        /// corner taps at the mip where the rect spans at most one texel.
        #[must_use]
        pub fn sample_min(&self, uv_min: Vec2, uv_max: Vec2) -> f32 {
            let (width, height) = self.dimensions();
            let texels_x = (uv_max.x - uv_min.x) * width as f32;
            let texels_y = (uv_max.y - uv_min.y) * height as f32;
            let span = texels_x.max(texels_y).max(1.0);
            let mip = (span.log2().ceil() as u32).min(self.mip_count() - 1);

            let (_, mip_w, mip_h) = self.mip(mip);
            let x0 = (uv_min.x * mip_w as f32) as u32;
            let y0 = (uv_min.y * mip_h as f32) as u32;
            let x1 = (uv_max.x * mip_w as f32) as u32;
            let y1 = (uv_max.y * mip_h as f32) as u32;
            self.texel(mip, x0, y0)
                .min(self.texel(mip, x1, y0))
                .min(self.texel(mip, x0, y1))
                .min(self.texel(mip, x1, y1))
        }
    }

    /// Screen-space footprint of a projected bound: UV rect plus the
    /// nearest depth (max in reverse-Z).
    #[derive(Clone, Copy, Debug)]
    pub struct ScreenRect {
        pub uv_min: Vec2,
        pub uv_max: Vec2,
        pub max_depth: f32,
    }

    /// Projects a world AABB onto the screen. `None` when a corner crosses
    /// the camera plane; callers must treat that as visible.
    #[must_use]
    pub fn project_aabb(view: &ViewTransform, bounds: &BoundingBox) -> Option<ScreenRect> {
        let mut uv_min = Vec2::splat(f32::MAX);
        let mut uv_max = Vec2::splat(f32::MIN);
        let mut max_depth = f32::MIN;
        for corner in bounds.corners() {
            let clip = view.world_to_clip * corner.extend(1.0);
            if clip.w <= 1e-6 {
                return None;
            }
            let ndc = clip.truncate() / clip.w;
            let uv = Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
            uv_min = uv_min.min(uv);
            uv_max = uv_max.max(uv);
            max_depth = max_depth.max(ndc.z);
        }
        Some(ScreenRect {
            uv_min: uv_min.clamp(Vec2::ZERO, Vec2::ONE),
            uv_max: uv_max.clamp(Vec2::ZERO, Vec2::ONE),
            max_depth,
        })
    }

    /// Whether a projected bound is fully occluded by the pyramid:
    /// reverse-Z, so occluded means its nearest depth is still farther
    /// (smaller) than the farthest geometry already drawn in the footprint.
    #[must_use]
    pub fn is_occluded(rect: &ScreenRect, hzb: &HzbPyramid) -> bool {
        rect.max_depth < hzb.sample_min(rect.uv_min, rect.uv_max)
    }

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub enum InstanceCullResult {
        FrustumCulled,
        /// Occluded by the source HZB; phase 1 defers these to phase 2.
        Occluded,
        Visible,
    }

    /// Instance-level culling: frustum test, then HZB occlusion.
    #[must_use]
    pub fn cull_instance(
        batch: &Batch,
        view: &ViewTransform,
        hzb: Option<&HzbPyramid>,
    ) -> InstanceCullResult {
        if !view.frustum.intersects_aabb(&batch.bounds) {
            return InstanceCullResult::FrustumCulled;
        }
        if let Some(hzb) = hzb {
            if let Some(rect) = project_aabb(view, &batch.bounds) {
                if is_occluded(&rect, hzb) {
                    return InstanceCullResult::Occluded;
                }
            }
        }
        InstanceCullResult::Visible
    }

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub enum MeshletCullResult {
        BackfaceCulled,
        FrustumCulled,
        Occluded,
        Visible,
    }

    /// Meshlet-level culling: backface cone, frustum sphere, HZB sphere.
    #[must_use]
    pub fn cull_meshlet(
        meshlet: &Meshlet,
        batch: &Batch,
        view: &ViewTransform,
        hzb: Option<&HzbPyramid>,
    ) -> MeshletCullResult {
        let world = &batch.world_matrix;
        let center = world.transform_point3(meshlet.bounds.center);
        let scale = world.x_axis.truncate().length().max(
            world
                .y_axis
                .truncate()
                .length()
                .max(world.z_axis.truncate().length()),
        );
        let radius = meshlet.bounds.radius * scale;

        // Normal-cone rejection: the whole meshlet faces away when the
        // view direction sits inside the anti-cone.
        if meshlet.bounds.cone_cutoff < 1.0 {
            let axis = world.transform_vector3(meshlet.bounds.cone_axis).normalize();
            let to_center = center - view.position;
            if axis.dot(to_center) >= meshlet.bounds.cone_cutoff * to_center.length() + radius {
                return MeshletCullResult::BackfaceCulled;
            }
        }

        if !view.frustum.intersects_sphere(center, radius) {
            return MeshletCullResult::FrustumCulled;
        }

        if let Some(hzb) = hzb {
            let bounds = BoundingBox::from_center_extents(center, Vec3::splat(radius));
            if let Some(rect) = project_aabb(view, &bounds) {
                if is_occluded(&rect, hzb) {
                    return MeshletCullResult::Occluded;
                }
            }
        }
        MeshletCullResult::Visible
    }

    /// Output of the classification reference: per-bin counts, prefix-sum
    /// offsets, and the scattered indirection list.
    pub struct BinningOutput {
        pub counts: [u32; NUM_BINS as usize],
        pub offsets: [u32; NUM_BINS as usize],
        pub binned: Vec<u32>,
    }

    /// Mirrors the 4-pass GPU bucket sort: count, prefix-sum, scatter.
    #[must_use]
    pub fn classify_meshlets(bins: &[PipelineBin]) -> BinningOutput {
        let mut counts = [0u32; NUM_BINS as usize];
        for bin in bins {
            counts[*bin as usize] += 1;
        }
        let mut offsets = [0u32; NUM_BINS as usize];
        let mut running = 0;
        for (offset, count) in offsets.iter_mut().zip(counts.iter()) {
            *offset = running;
            running += count;
        }
        let mut cursors = offsets;
        let mut binned = vec![0u32; bins.len()];
        for (index, bin) in bins.iter().enumerate() {
            binned[cursors[*bin as usize] as usize] = index as u32;
            cursors[*bin as usize] += 1;
        }
        BinningOutput {
            counts,
            offsets,
            binned,
        }
    }

    /// Counters produced by a simulated two-phase cull, matching the GPU
    /// counter layouts.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct TwoPhaseStats {
        pub phase1_visible_meshlets: u32,
        pub phase2_visible_meshlets: u32,
        pub occluded_instances: u32,
        pub phase2_candidate_meshlets: u32,
    }

    /// Runs the full two-phase flow on the CPU: phase 1 against the
    /// previous frame's HZB, phase 2 retesting the deferred set against
    /// the current one.
    #[must_use]
    pub fn simulate_two_phase(
        batches: &[Batch],
        view: &ViewTransform,
        previous_hzb: Option<&HzbPyramid>,
        current_hzb: Option<&HzbPyramid>,
    ) -> TwoPhaseStats {
        let mut stats = TwoPhaseStats::default();
        let mut occluded_instances = Vec::new();
        let mut carry_over: Vec<(usize, usize)> = Vec::new();

        // Phase 1: everything, tested against last frame's HZB.
        for (batch_index, batch) in batches.iter().enumerate() {
            match cull_instance(batch, view, previous_hzb) {
                InstanceCullResult::FrustumCulled => {}
                InstanceCullResult::Occluded => occluded_instances.push(batch_index),
                InstanceCullResult::Visible => {
                    for (meshlet_index, meshlet) in batch.mesh.meshlets().iter().enumerate() {
                        match cull_meshlet(meshlet, batch, view, previous_hzb) {
                            MeshletCullResult::Visible => stats.phase1_visible_meshlets += 1,
                            MeshletCullResult::Occluded => {
                                carry_over.push((batch_index, meshlet_index));
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        stats.occluded_instances = occluded_instances.len() as u32;

        // Phase 2: deferred instances and carried-over meshlets against the
        // HZB phase 1 just rebuilt.
        for batch_index in occluded_instances {
            let batch = &batches[batch_index];
            if cull_instance(batch, view, current_hzb) == InstanceCullResult::Visible {
                for (meshlet_index, _) in batch.mesh.meshlets().iter().enumerate() {
                    carry_over.push((batch_index, meshlet_index));
                }
            }
        }
        stats.phase2_candidate_meshlets = carry_over.len() as u32;
        for (batch_index, meshlet_index) in carry_over {
            let batch = &batches[batch_index];
            let meshlet = &batch.mesh.meshlets()[meshlet_index];
            if cull_meshlet(meshlet, batch, view, current_hzb) == MeshletCullResult::Visible {
                stats.phase2_visible_meshlets += 1;
            }
        }
        stats
    }
}
