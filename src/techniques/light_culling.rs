//! Clustered Light Culling
//!
//! Dices view space into a `(ceil(w/64), ceil(h/64), 32)` cluster grid with
//! logarithmically distributed depth slices, marks the clusters touched by
//! scene depth, compacts them, and culls the light list per active cluster
//! with an indirect dispatch. The shading pass then reads only the lights
//! intersecting its cluster.
//!
//! The slice constants come in a closed-form pair so a pixel shader can
//! recover its cluster Z from view depth with one log:
//! `slice = floor(ln(z) * sliceMagicA - sliceMagicB)`.

use glam::{Mat4, Vec3};

use crate::errors::Result;
use crate::graph::{RGGraph, RGPassFlags, RGTextureHandle};
use crate::rhi::{
    thread_group_count, BufferDesc, BufferFlags, CommandSignature, CompareFunc, GraphicsCommon,
    GraphicsDevice, IndirectDispatchArgs, PipelineState, PipelineStateInitializer, Ref,
    RenderPassColorFlags, RenderPassDepthFlags, ResourceFormat, RootSignature, ShaderDefines,
};
use crate::scene::{Batch, BoundingBox, ViewTransform};

/// Screen-space cluster tile size in pixels.
pub const CLUSTER_SIZE: u32 = 64;
/// Number of depth slices.
pub const CLUSTER_COUNT_Z: u32 = 32;
/// Average light-index budget per cluster; sizes the global index list.
pub const MAX_LIGHTS_PER_CLUSTER: u32 = 32;

/// Cluster-grid geometry and the slice-reconstruction constants for one
/// view configuration.
#[derive(Clone, Copy, Debug)]
pub struct ClusterGrid {
    pub count_x: u32,
    pub count_y: u32,
    pub count_z: u32,
    pub near: f32,
    pub far: f32,
    pub slice_magic_a: f32,
    pub slice_magic_b: f32,
}

impl ClusterGrid {
    /// Derives the grid for a viewport and clip range. Both slice constants
    /// come from the same `(near, far)` pair; every consumer must read the
    /// same pair or slice reconstruction breaks.
    #[must_use]
    pub fn new(viewport: (u32, u32), near: f32, far: f32) -> Self {
        assert!(near > 0.0 && far > near, "Invalid clip range [{near}, {far}]");
        let count_z = CLUSTER_COUNT_Z;
        let log_ratio = (near / far).ln();
        Self {
            count_x: viewport.0.div_ceil(CLUSTER_SIZE),
            count_y: viewport.1.div_ceil(CLUSTER_SIZE),
            count_z,
            near,
            far,
            slice_magic_a: count_z as f32 / log_ratio,
            slice_magic_b: count_z as f32 * far.ln() / log_ratio,
        }
    }

    #[must_use]
    pub fn cluster_count(&self) -> u32 {
        self.count_x * self.count_y * self.count_z
    }

    /// Cluster Z slice for a view-space depth, clamped into the grid.
    /// Slice 0 sits at the far plane; slice `count_z - 1` at the near plane.
    #[must_use]
    pub fn slice_for_view_depth(&self, view_depth: f32) -> u32 {
        let slice = view_depth.max(1e-6).ln() * self.slice_magic_a - self.slice_magic_b;
        (slice.floor().max(0.0) as u32).min(self.count_z - 1)
    }

    /// View-depth bounds `[min, max)` of a slice (inverse of the slice
    /// mapping).
    #[must_use]
    pub fn slice_depth_bounds(&self, slice: u32) -> (f32, f32) {
        let z_at = |s: f32| ((s + self.slice_magic_b) / self.slice_magic_a).exp();
        let a = z_at(slice as f32);
        let b = z_at(slice as f32 + 1.0);
        (a.min(b), a.max(b))
    }

    #[must_use]
    pub fn cluster_index(&self, x: u32, y: u32, slice: u32) -> u32 {
        debug_assert!(x < self.count_x && y < self.count_y && slice < self.count_z);
        (slice * self.count_y + y) * self.count_x + x
    }

    /// View-space AABB of one cluster, derived from the projection's scale
    /// terms and the slice depth bounds. Mirrors the AABB-precompute shader.
    #[must_use]
    pub fn cluster_aabb(&self, view: &ViewTransform, x: u32, y: u32, slice: u32) -> BoundingBox {
        let proj = view.view_to_clip;
        let scale_x = proj.x_axis.x;
        let scale_y = proj.y_axis.y;
        let viewport = (
            self.count_x as f32 * CLUSTER_SIZE as f32,
            self.count_y as f32 * CLUSTER_SIZE as f32,
        );

        // Tile corners in NDC.
        let ndc_x0 = (x * CLUSTER_SIZE) as f32 / viewport.0 * 2.0 - 1.0;
        let ndc_x1 = ((x + 1) * CLUSTER_SIZE) as f32 / viewport.0 * 2.0 - 1.0;
        let ndc_y0 = 1.0 - ((y + 1) * CLUSTER_SIZE) as f32 / viewport.1 * 2.0;
        let ndc_y1 = 1.0 - (y * CLUSTER_SIZE) as f32 / viewport.1 * 2.0;

        let (depth_min, depth_max) = self.slice_depth_bounds(slice);

        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for depth in [depth_min, depth_max] {
            for ndc_x in [ndc_x0, ndc_x1] {
                for ndc_y in [ndc_y0, ndc_y1] {
                    // Unproject: clip.x = view.x * scale_x, w = depth.
                    let p = Vec3::new(ndc_x * depth / scale_x, ndc_y * depth / scale_y, -depth);
                    min = min.min(p);
                    max = max.max(p);
                }
            }
        }
        BoundingBox::new(min, max)
    }
}

/// Closest-point sphere/AABB intersection, the cluster-light test.
#[must_use]
pub fn sphere_intersects_aabb(center: Vec3, radius: f32, aabb: &BoundingBox) -> bool {
    let closest = center.clamp(aabb.min, aabb.max);
    center.distance_squared(closest) <= radius * radius
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct AabbParams {
    projection_inverse: Mat4,
    screen_dimensions: [f32; 2],
    cluster_size: [f32; 2],
    cluster_dimensions: [u32; 4],
    near: f32,
    far: f32,
    padding: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct MarkParams {
    world_to_view: Mat4,
    view_to_clip: Mat4,
    cluster_dimensions: [u32; 4],
    cluster_size: [f32; 2],
    slice_magic_a: f32,
    slice_magic_b: f32,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct LightCullParams {
    world_to_view: Mat4,
    light_count: u32,
    padding: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ShadeParams {
    world_to_view: Mat4,
    view_to_clip: Mat4,
    cluster_dimensions: [u32; 4],
    cluster_size: [f32; 2],
    slice_magic_a: f32,
    slice_magic_b: f32,
    screen_dimensions: [f32; 2],
    near: f32,
    far: f32,
}

/// Inputs of [`ClusteredLightCulling::execute`].
pub struct ClusteredForwardInputs<'a> {
    pub render_target: RGTextureHandle,
    pub depth: RGTextureHandle,
    pub opaque_batches: Vec<Batch>,
    pub transparent_batches: Vec<Batch>,
    pub light_buffer: Ref<crate::rhi::Buffer>,
    pub light_count: u32,
    pub view: &'a ViewTransform,
}

/// The clustered-forward light culling pipeline.
pub struct ClusteredLightCulling {
    root_signature: Ref<RootSignature>,
    dispatch_signature: Ref<CommandSignature>,

    create_aabb_pso: Ref<PipelineState>,
    mark_clusters_opaque_pso: Ref<PipelineState>,
    mark_clusters_masked_pso: Ref<PipelineState>,
    compact_clusters_pso: Ref<PipelineState>,
    update_indirect_args_pso: Ref<PipelineState>,
    light_culling_pso: Ref<PipelineState>,
    diffuse_pso: Ref<PipelineState>,
    diffuse_transparent_pso: Ref<PipelineState>,

    grid: Option<ClusterGrid>,
    aabbs: Option<Ref<crate::rhi::Buffer>>,
}

impl ClusteredLightCulling {
    pub fn new(device: &GraphicsDevice, common: &GraphicsCommon) -> Result<Self> {
        let rs = common.root_signature();
        let defines = ShaderDefines::new();

        let make_raster = |name: &str,
                           pixel_entry: &str,
                           color: &[ResourceFormat],
                           depth_write: bool|
         -> Result<Ref<PipelineState>> {
            let mut pso = PipelineStateInitializer::new(name);
            pso.set_depth_test(CompareFunc::GreaterEqual)
                .set_depth_write(depth_write)
                .set_render_target_formats(color, ResourceFormat::D32Float, 1);
            pso.vertex_shader = Some(crate::rhi::ShaderRef::new(
                "ClusteredForward.hlsl",
                "VSMain",
                &defines,
            ));
            pso.set_pixel_shader("ClusteredForward.hlsl", pixel_entry, &defines);
            device.create_pipeline(pso)
        };

        Ok(Self {
            root_signature: rs.clone(),
            dispatch_signature: common.indirect_dispatch_signature().clone(),
            create_aabb_pso: device.create_compute_pipeline(
                rs,
                "CL_GenerateAABBs.hlsl",
                "GenerateAABBs",
                &defines,
            )?,
            mark_clusters_opaque_pso: make_raster(
                "Mark Unique Clusters (Opaque)",
                "MarkClusters_Opaque",
                &[],
                true,
            )?,
            mark_clusters_masked_pso: make_raster(
                "Mark Unique Clusters (Masked)",
                "MarkClusters_Masked",
                &[],
                true,
            )?,
            compact_clusters_pso: device.create_compute_pipeline(
                rs,
                "CL_CompactClusters.hlsl",
                "CompactClusters",
                &defines,
            )?,
            update_indirect_args_pso: device.create_compute_pipeline(
                rs,
                "CL_UpdateIndirectArguments.hlsl",
                "UpdateIndirectArguments",
                &defines,
            )?,
            light_culling_pso: device.create_compute_pipeline(
                rs,
                "CL_LightCulling.hlsl",
                "LightCulling",
                &defines,
            )?,
            diffuse_pso: make_raster(
                "Clustered Diffuse",
                "PSMain",
                &[ResourceFormat::RGBA16Float],
                false,
            )?,
            diffuse_transparent_pso: make_raster(
                "Clustered Diffuse (Transparent)",
                "PSMain",
                &[ResourceFormat::RGBA16Float],
                false,
            )?,
            grid: None,
            aabbs: None,
        })
    }

    #[must_use]
    pub fn grid(&self) -> Option<&ClusterGrid> {
        self.grid.as_ref()
    }

    /// (Re)creates the cluster grid for a swapchain size and precomputes the
    /// per-cluster view-space AABBs with a one-shot compute dispatch.
    pub fn on_swapchain_created(
        &mut self,
        device: &GraphicsDevice,
        width: u32,
        height: u32,
        view: &ViewTransform,
    ) {
        let grid = ClusterGrid::new((width, height), view.near, view.far);
        let total = grid.cluster_count();

        let aabbs = device.create_buffer(
            &BufferDesc::structured_with_flags(
                total,
                32,
                BufferFlags::UNORDERED_ACCESS | BufferFlags::SHADER_RESOURCE,
            ),
            "Cluster AABBs",
        );

        let mut context = device.allocate_command_context();
        context.begin_event("CreateAABBs");
        context.set_compute_root_signature(&self.root_signature);
        context.set_pipeline_state(&self.create_aabb_pso);
        context.bind_root_cbv(
            0,
            &AabbParams {
                projection_inverse: view.view_to_clip.inverse(),
                screen_dimensions: [width as f32, height as f32],
                cluster_size: [CLUSTER_SIZE as f32, CLUSTER_SIZE as f32],
                cluster_dimensions: [grid.count_x, grid.count_y, grid.count_z, 0],
                near: view.near,
                far: view.far,
                padding: [0.0; 2],
            },
        );
        context.bind_resources(2, &[aabbs.uav()]);
        context.dispatch(grid.count_x, grid.count_y, grid.count_z);
        context.end_event();
        device.submit(context, true);

        self.grid = Some(grid);
        self.aabbs = Some(aabbs);
    }

    /// Records the per-frame clustered pipeline: mark → compact → build
    /// args → cull lights → shade.
    #[allow(clippy::too_many_lines)]
    pub fn execute(&self, graph: &mut RGGraph<'_>, inputs: &ClusteredForwardInputs<'_>) {
        let grid = self.grid.expect("on_swapchain_created must run first");
        let aabbs = self.aabbs.as_ref().expect("Cluster AABBs missing").clone();
        let total_clusters = grid.cluster_count();

        let mut graph = graph.scoped("Clustered Light Culling");

        let unique_clusters = graph.create_buffer(
            "Clustered.UniqueClusters",
            BufferDesc::structured(total_clusters, 4),
        );
        let compacted_clusters = graph.create_buffer(
            "Clustered.CompactedClusters",
            BufferDesc::structured(total_clusters, 4),
        );
        let compacted_counter = graph.create_buffer(
            "Clustered.CompactedClusters.Counter",
            BufferDesc::typed(1, ResourceFormat::R32Uint),
        );
        let indirect_args = graph.create_buffer(
            "Clustered.IndirectArguments",
            BufferDesc::indirect_arguments::<IndirectDispatchArgs>(1),
        );
        let light_index_counter = graph.create_buffer(
            "Clustered.LightIndexCounter",
            BufferDesc::byte_address(4, BufferFlags::UNORDERED_ACCESS),
        );
        let light_index_list = graph.create_buffer(
            "Clustered.LightIndexList",
            BufferDesc::structured(MAX_LIGHTS_PER_CLUSTER * total_clusters, 4),
        );
        let light_grid = graph.create_buffer(
            "Clustered.LightGrid",
            BufferDesc::structured(total_clusters, 8),
        );
        let aabbs_handle = graph.import_buffer(&aabbs);
        let lights_handle = graph.import_buffer(&inputs.light_buffer);

        let mark_params = MarkParams {
            world_to_view: inputs.view.world_to_view,
            view_to_clip: inputs.view.view_to_clip,
            cluster_dimensions: [grid.count_x, grid.count_y, grid.count_z, 0],
            cluster_size: [CLUSTER_SIZE as f32, CLUSTER_SIZE as f32],
            slice_magic_a: grid.slice_magic_a,
            slice_magic_b: grid.slice_magic_b,
        };

        // Reset the cluster flags from last frame.
        {
            let _ = graph
                .add_pass("Clear Cluster Flags", RGPassFlags::COMPUTE)
                .write(&[unique_clusters.into()])
                .bind(move |context, resources| {
                    context.clear_uav_u32(&resources.get(unique_clusters), 0);
                    context.insert_uav_barrier(None);
                    context.flush_resource_barriers();
                });
        }

        // Depth-prepass the scene; the pixel shader marks each touched
        // cluster. Alpha-masked geometry samples its albedo before marking.
        {
            let root_signature = self.root_signature.clone();
            let opaque_pso = self.mark_clusters_opaque_pso.clone();
            let masked_pso = self.mark_clusters_masked_pso.clone();
            let opaque = inputs.opaque_batches.clone();
            let transparent = inputs.transparent_batches.clone();
            let _ = graph
                .add_pass("Mark Clusters", RGPassFlags::RASTER | RGPassFlags::NEVER_CULL)
                .write(&[unique_clusters.into()])
                .depth_stencil(inputs.depth, RenderPassDepthFlags::CLEAR)
                .bind(move |context, resources| {
                    context.set_graphics_root_signature(&root_signature);
                    context.set_pipeline_state(&opaque_pso);
                    context.bind_root_cbv(0, &mark_params);
                    context.bind_resources(2, &[resources.uav(unique_clusters)]);
                    for batch in &opaque {
                        context.draw(batch.mesh.vertex_count, 1);
                    }
                    context.set_pipeline_state(&masked_pso);
                    for batch in &transparent {
                        context.draw(batch.mesh.vertex_count, 1);
                    }
                });
        }

        // Compact the marked clusters into a dense list.
        {
            let root_signature = self.root_signature.clone();
            let pso = self.compact_clusters_pso.clone();
            let _ = graph
                .add_pass("Compact Clusters", RGPassFlags::COMPUTE)
                .read(&[unique_clusters.into()])
                .write(&[compacted_clusters.into(), compacted_counter.into()])
                .bind(move |context, resources| {
                    context.clear_uav_u32(&resources.get(compacted_clusters), 0);
                    context.clear_uav_u32(&resources.get(compacted_counter), 0);
                    context.set_compute_root_signature(&root_signature);
                    context.set_pipeline_state(&pso);
                    context.bind_resources(3, &[resources.srv(unique_clusters)]);
                    context.bind_resources(
                        2,
                        &[
                            resources.uav(compacted_clusters),
                            resources.uav(compacted_counter),
                        ],
                    );
                    context.dispatch_1d(thread_group_count(total_clusters, 64));
                });
        }

        // One thread turns the compacted count into dispatch args.
        {
            let root_signature = self.root_signature.clone();
            let pso = self.update_indirect_args_pso.clone();
            let _ = graph
                .add_pass("Update Indirect Arguments", RGPassFlags::COMPUTE)
                .read(&[compacted_counter.into()])
                .write(&[indirect_args.into()])
                .bind(move |context, resources| {
                    context.set_compute_root_signature(&root_signature);
                    context.set_pipeline_state(&pso);
                    context.bind_resources(3, &[resources.srv(compacted_counter)]);
                    context.bind_resources(2, &[resources.uav(indirect_args)]);
                    context.dispatch_1d(1);
                });
        }

        // Cull the light list against every active cluster's AABB.
        {
            let root_signature = self.root_signature.clone();
            let pso = self.light_culling_pso.clone();
            let signature = self.dispatch_signature.clone();
            let params = LightCullParams {
                world_to_view: inputs.view.world_to_view,
                light_count: inputs.light_count,
                padding: [0; 3],
            };
            let _ = graph
                .add_pass("Light Culling", RGPassFlags::COMPUTE)
                .read(&[
                    indirect_args.into(),
                    compacted_clusters.into(),
                    aabbs_handle.into(),
                    lights_handle.into(),
                ])
                .write(&[
                    light_index_counter.into(),
                    light_index_list.into(),
                    light_grid.into(),
                ])
                .bind(move |context, resources| {
                    context.clear_uav_u32(&resources.get(light_index_counter), 0);
                    context.set_compute_root_signature(&root_signature);
                    context.set_pipeline_state(&pso);
                    context.bind_root_cbv(0, &params);
                    context.bind_resources(
                        3,
                        &[
                            resources.srv(lights_handle),
                            resources.srv(aabbs_handle),
                            resources.srv(compacted_clusters),
                        ],
                    );
                    context.bind_resources(
                        2,
                        &[
                            resources.uav(light_index_counter),
                            resources.uav(light_index_list),
                            resources.uav(light_grid),
                        ],
                    );
                    context.execute_indirect(
                        &signature,
                        1,
                        &resources.get_buffer(indirect_args),
                        0,
                        None,
                        0,
                    );
                });
        }

        // Shade: accumulate lighting from the per-cluster light lists.
        {
            let root_signature = self.root_signature.clone();
            let opaque_pso = self.diffuse_pso.clone();
            let transparent_pso = self.diffuse_transparent_pso.clone();
            let opaque = inputs.opaque_batches.clone();
            let transparent = inputs.transparent_batches.clone();
            let params = ShadeParams {
                world_to_view: inputs.view.world_to_view,
                view_to_clip: inputs.view.view_to_clip,
                cluster_dimensions: [grid.count_x, grid.count_y, grid.count_z, 0],
                cluster_size: [CLUSTER_SIZE as f32, CLUSTER_SIZE as f32],
                slice_magic_a: grid.slice_magic_a,
                slice_magic_b: grid.slice_magic_b,
                screen_dimensions: [
                    (grid.count_x * CLUSTER_SIZE) as f32,
                    (grid.count_y * CLUSTER_SIZE) as f32,
                ],
                near: grid.near,
                far: grid.far,
            };
            let _ = graph
                .add_pass("Base Pass", RGPassFlags::RASTER | RGPassFlags::NEVER_CULL)
                .read(&[
                    light_grid.into(),
                    light_index_list.into(),
                    lights_handle.into(),
                ])
                .render_target(inputs.render_target, RenderPassColorFlags::CLEAR)
                .depth_stencil(
                    inputs.depth,
                    RenderPassDepthFlags::LOAD | RenderPassDepthFlags::READ_ONLY,
                )
                .bind(move |context, resources| {
                    context.set_graphics_root_signature(&root_signature);
                    context.bind_root_cbv(1, &params);
                    context.bind_resources(
                        3,
                        &[
                            resources.srv(light_grid),
                            resources.srv(light_index_list),
                            resources.srv(lights_handle),
                        ],
                    );
                    context.set_pipeline_state(&opaque_pso);
                    for batch in &opaque {
                        context.draw(batch.mesh.vertex_count, 1);
                    }
                    context.set_pipeline_state(&transparent_pso);
                    for batch in &transparent {
                        context.draw(batch.mesh.vertex_count, 1);
                    }
                });
        }
    }
}

// ─── CPU reference ────────────────────────────────────────────────────────────

/// Reference light culling mirroring the compute kernels; scenario tests
/// validate bin sums and bounds against it.
pub mod reference {
    use super::{sphere_intersects_aabb, ClusterGrid};
    use crate::scene::{Light, ViewTransform};

    /// Per-cluster `(offset, count)` pair plus the shared index list.
    pub struct LightCullOutput {
        pub light_grid: Vec<(u32, u32)>,
        pub light_index_list: Vec<u32>,
    }

    /// Culls `lights` against every cluster in `active_clusters`. The grid
    /// entry for inactive clusters stays `(0, 0)`.
    #[must_use]
    pub fn cull_lights(
        grid: &ClusterGrid,
        view: &ViewTransform,
        lights: &[Light],
        active_clusters: &[u32],
    ) -> LightCullOutput {
        let mut output = LightCullOutput {
            light_grid: vec![(0, 0); grid.cluster_count() as usize],
            light_index_list: Vec::new(),
        };

        // View-space light positions once, not per cluster.
        let view_lights: Vec<(glam::Vec3, f32)> = lights
            .iter()
            .map(|light| {
                (
                    view.world_to_view.transform_point3(light.position),
                    light.range,
                )
            })
            .collect();

        for &cluster in active_clusters {
            let slice = cluster / (grid.count_x * grid.count_y);
            let in_slice = cluster % (grid.count_x * grid.count_y);
            let y = in_slice / grid.count_x;
            let x = in_slice % grid.count_x;
            let aabb = grid.cluster_aabb(view, x, y, slice);

            let offset = output.light_index_list.len() as u32;
            let mut count = 0;
            for (index, (position, range)) in view_lights.iter().enumerate() {
                if sphere_intersects_aabb(*position, *range, &aabb) {
                    output.light_index_list.push(index as u32);
                    count += 1;
                }
            }
            output.light_grid[cluster as usize] = (offset, count);
        }
        output
    }

    /// Marks the clusters a set of view-space sample depths touches,
    /// mirroring the depth-prepass marking shader over a simple depth
    /// field. Returns the compacted active-cluster list.
    #[must_use]
    pub fn mark_and_compact(
        grid: &ClusterGrid,
        samples: &[(u32, u32, f32)], // (pixel_x, pixel_y, view_depth)
    ) -> Vec<u32> {
        let mut marked = vec![false; grid.cluster_count() as usize];
        for &(px, py, depth) in samples {
            let x = (px / super::CLUSTER_SIZE).min(grid.count_x - 1);
            let y = (py / super::CLUSTER_SIZE).min(grid.count_y - 1);
            let slice = grid.slice_for_view_depth(depth);
            marked[grid.cluster_index(x, y, slice) as usize] = true;
        }
        marked
            .iter()
            .enumerate()
            .filter_map(|(index, &m)| m.then_some(index as u32))
            .collect()
    }
}
