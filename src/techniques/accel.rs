//! Acceleration Structure Manager
//!
//! Per-frame BLAS build/refit under a fixed budget, a deferred compaction
//! queue driven by postbuild-info readback, and a TLAS rebuild from the
//! scene instance table.
//!
//! Compaction is transparent to rendering: until a request completes, the
//! mesh keeps tracing against its uncompacted BLAS. The swap happens on the
//! CPU once the readback sync point reports complete.

use crate::errors::Result;
use crate::rhi::{
    align_up, BufferDesc, BufferFlags, CommandContext, GraphicsCommon, GraphicsDevice,
    PipelineState, Ref, ResourceState, RootSignature, ShaderDefines, SyncPoint, AS_ALIGNMENT,
};
use crate::scene::{Batch, Mesh};

/// Vertex budget for BLAS builds in one frame.
const MAX_BLAS_VERTICES_PER_FRAME: u32 = 100_000;
/// BLAS build / compaction-request budget per frame.
const MAX_COMPACTIONS_PER_FRAME: usize = 32;

/// Instance flag: negative-determinant transforms flip winding.
pub const INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE: u8 = 0x2;

/// Compact BLAS instance record uploaded to the GPU; a compute pass expands
/// it into the API's 64-byte instance descriptor. Layout is part of the GPU
/// ABI.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BlasInstance {
    pub gpu_address: u64,
    pub world_matrix_index: u32,
    pub flags: u8,
    pub instance_mask: u8,
    pub padding: u16,
}

const _: () = assert!(std::mem::size_of::<BlasInstance>() == 16);

/// Instance flags for a world transform: negative-determinant (mirrored)
/// transforms flip the triangle winding.
#[must_use]
pub fn instance_flags_for(world_matrix: &glam::Mat4) -> u8 {
    if world_matrix.determinant() < 0.0 {
        INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE
    } else {
        0
    }
}

/// The scene's ray-tracing acceleration structures.
pub struct AccelerationStructure {
    root_signature: Ref<RootSignature>,
    update_tlas_pso: Ref<PipelineState>,

    tlas: Option<Ref<crate::rhi::Buffer>>,
    tlas_scratch: Option<Ref<crate::rhi::Buffer>>,
    instances_source: Option<Ref<crate::rhi::Buffer>>,
    instances_target: Option<Ref<crate::rhi::Buffer>>,

    postbuild_info: Option<Ref<crate::rhi::Buffer>>,
    postbuild_readback: Option<Ref<crate::rhi::Buffer>>,
    postbuild_sync: SyncPoint,
    queued_requests: Vec<Ref<Mesh>>,
    active_requests: Vec<Ref<Mesh>>,
}

impl AccelerationStructure {
    pub fn new(device: &GraphicsDevice, common: &GraphicsCommon) -> Result<Self> {
        Ok(Self {
            root_signature: common.root_signature().clone(),
            update_tlas_pso: device.create_compute_pipeline(
                common.root_signature(),
                "UpdateTLAS.hlsl",
                "UpdateTLASCS",
                &ShaderDefines::new(),
            )?,
            tlas: None,
            tlas_scratch: None,
            instances_source: None,
            instances_target: None,
            postbuild_info: None,
            postbuild_readback: None,
            postbuild_sync: SyncPoint::default(),
            queued_requests: Vec::new(),
            active_requests: Vec::new(),
        })
    }

    /// Builds/refits BLASes within the frame budget and rebuilds the TLAS
    /// from the batch list. `instances_buffer` is the scene instance table
    /// the expansion shader reads world matrices from.
    pub fn build(
        &mut self,
        context: &mut CommandContext<'_>,
        instances_buffer: &Ref<crate::rhi::Buffer>,
        batches: &[Batch],
    ) {
        let device = context.device();
        if !device.capabilities().raytracing {
            return;
        }
        context.begin_event("Build Acceleration Structures");

        let mut built_vertices: u32 = 0;
        let mut built_count: usize = 0;
        let mut blas_instances: Vec<BlasInstance> = Vec::with_capacity(batches.len());

        for batch in batches {
            let mesh = &batch.mesh;
            let needs_build = mesh.blas().is_none() || mesh.skinned;

            if needs_build
                && built_vertices < MAX_BLAS_VERTICES_PER_FRAME
                && built_count < MAX_COMPACTIONS_PER_FRAME
            {
                built_vertices += mesh.vertex_count;
                built_count += 1;

                // Skinned meshes refit in place with a fast-build BLAS;
                // static meshes get a fast-trace build and a compaction
                // request.
                let refit = mesh.skinned && mesh.blas().is_some();
                let prebuild = device.blas_prebuild_info(mesh.triangle_count());

                let blas = mesh.blas().unwrap_or_else(|| {
                    let blas = device.create_buffer(
                        &BufferDesc::blas(align_up(prebuild.result_size, AS_ALIGNMENT)),
                        "BLAS.Buffer",
                    );
                    mesh.set_blas(blas.clone());
                    blas
                });
                let scratch = mesh.blas_scratch().unwrap_or_else(|| {
                    let scratch = device.create_buffer(
                        &BufferDesc::byte_address(
                            align_up(prebuild.scratch_size, AS_ALIGNMENT),
                            BufferFlags::UNORDERED_ACCESS | BufferFlags::NO_BINDLESS,
                        ),
                        "BLAS.ScratchBuffer",
                    );
                    mesh.set_blas_scratch(scratch.clone());
                    scratch
                });

                context.build_blas(&blas, &scratch, refit, mesh.triangle_count());

                if !mesh.skinned {
                    self.queued_requests.push(mesh.clone());
                }
            }

            if let Some(blas) = mesh.blas() {
                blas_instances.push(BlasInstance {
                    gpu_address: blas.gpu_address(),
                    world_matrix_index: batch.instance_id,
                    flags: instance_flags_for(&batch.world_matrix),
                    instance_mask: 0xFF,
                    padding: 0,
                });
            }
        }

        if built_count > 0 {
            log::debug!("Built {built_count} BLAS ({built_vertices} vertices)");
        }

        context.begin_event("BLAS Compaction");
        self.process_compaction(context);
        context.end_event();

        self.build_tlas(context, instances_buffer, &blas_instances);
        context.end_event();
    }

    /// The TLAS SRV descriptor, if a TLAS exists.
    #[must_use]
    pub fn srv(&self) -> Option<u32> {
        self.tlas.as_ref().map(|tlas| tlas.srv())
    }

    #[must_use]
    pub fn tlas(&self) -> Option<&Ref<crate::rhi::Buffer>> {
        self.tlas.as_ref()
    }

    #[must_use]
    pub fn pending_compactions(&self) -> usize {
        self.queued_requests.len() + self.active_requests.len()
    }

    /// Drains the compaction pipeline.
    ///
    /// Completed requests (readback sync point signaled) get a right-sized
    /// BLAS allocated, a compacting copy recorded, and the mesh's BLAS
    /// pointer swapped. Then up to the per-frame budget of queued requests
    /// is promoted and their postbuild info emitted into the readback chain.
    fn process_compaction(&mut self, context: &mut CommandContext<'_>) {
        let device = context.device();

        if !self.active_requests.is_empty() {
            if !self.postbuild_sync.is_complete() {
                return;
            }

            let readback = self
                .postbuild_readback
                .as_ref()
                .expect("Active compactions without a readback buffer");
            let data = readback.read_storage();

            for (index, mesh) in self.active_requests.drain(..).enumerate() {
                let begin = index * std::mem::size_of::<u64>();
                let compacted_size =
                    u64::from_le_bytes(data[begin..begin + 8].try_into().unwrap());
                assert!(compacted_size > 0, "Compacted size readback is zero");
                let source = mesh.blas().expect("Compaction target lost its BLAS");
                let target =
                    device.create_buffer(&BufferDesc::blas(compacted_size), "BLAS.Compacted");
                context.copy_acceleration_structure(&target, &source, true);
                mesh.set_blas(target);
            }
        }

        let promote = self
            .queued_requests
            .len()
            .min(MAX_COMPACTIONS_PER_FRAME - self.active_requests.len());
        self.active_requests
            .extend(self.queued_requests.drain(..promote));

        if self.active_requests.is_empty() {
            return;
        }

        if self.postbuild_info.is_none() {
            let required_size = (MAX_COMPACTIONS_PER_FRAME * std::mem::size_of::<u64>()) as u64;
            self.postbuild_info = Some(device.create_buffer(
                &BufferDesc::byte_address(required_size, BufferFlags::UNORDERED_ACCESS),
                "BLASCompaction.PostBuildInfo",
            ));
            self.postbuild_readback = Some(device.create_buffer(
                &BufferDesc::readback(required_size),
                "BLASCompaction.PostBuildInfoReadback",
            ));
        }
        let postbuild_info = self.postbuild_info.as_ref().unwrap();
        let readback = self.postbuild_readback.as_ref().unwrap();

        let sources: Vec<Ref<crate::rhi::Buffer>> = self
            .active_requests
            .iter()
            .map(|mesh| mesh.blas().expect("Queued compaction without a BLAS"))
            .collect();

        // The UAV barrier orders postbuild emission after the BLAS builds.
        context.insert_uav_barrier(None);
        context.insert_resource_barrier(
            &crate::rhi::AnyResource::Buffer(postbuild_info.clone()),
            ResourceState::COPY_SOURCE,
            ResourceState::UNORDERED_ACCESS,
            crate::rhi::ALL_SUBRESOURCES,
        );
        context.flush_resource_barriers();
        context.emit_compacted_sizes(postbuild_info, sources);

        context.insert_resource_barrier(
            &crate::rhi::AnyResource::Buffer(postbuild_info.clone()),
            ResourceState::UNORDERED_ACCESS,
            ResourceState::COPY_SOURCE,
            crate::rhi::ALL_SUBRESOURCES,
        );
        context.copy_resource(
            &crate::rhi::AnyResource::Buffer(postbuild_info.clone()),
            &crate::rhi::AnyResource::Buffer(readback.clone()),
        );

        self.postbuild_sync = SyncPoint::new(
            device.frame_fence().clone(),
            device.frame_fence().current_value(),
        );
    }

    fn build_tlas(
        &mut self,
        context: &mut CommandContext<'_>,
        instances_buffer: &Ref<crate::rhi::Buffer>,
        blas_instances: &[BlasInstance],
    ) {
        let device = context.device();
        if blas_instances.is_empty() && self.tlas.is_some() {
            return;
        }

        context.begin_event("TLAS Data Generation");

        let prebuild = device.tlas_prebuild_info(blas_instances.len() as u32);
        let needs_realloc = self
            .tlas
            .as_ref()
            .is_none_or(|tlas| tlas.size() < prebuild.result_size);
        if needs_realloc {
            self.tlas_scratch = Some(device.create_buffer(
                &BufferDesc::byte_address(
                    align_up(prebuild.scratch_size, AS_ALIGNMENT),
                    BufferFlags::UNORDERED_ACCESS,
                ),
                "TLAS.ScratchBuffer",
            ));
            self.tlas = Some(device.create_buffer(
                &BufferDesc::tlas(align_up(prebuild.result_size, AS_ALIGNMENT)),
                "TLAS.Buffer",
            ));
        }

        // Instance buffers grow in 128-instance steps.
        let instance_capacity = align_up(blas_instances.len().max(1) as u64, 128) as u32;
        let needs_instance_realloc = self
            .instances_source
            .as_ref()
            .is_none_or(|buffer| buffer.element_count() < instance_capacity);
        if needs_instance_realloc {
            self.instances_source = Some(device.create_buffer(
                &BufferDesc::structured_with_flags(
                    instance_capacity,
                    64,
                    BufferFlags::SHADER_RESOURCE,
                ),
                "TLAS.BLASInstanceSourceDescs",
            ));
            self.instances_target = Some(device.create_buffer(
                &BufferDesc::structured_with_flags(
                    instance_capacity,
                    64,
                    BufferFlags::UNORDERED_ACCESS,
                ),
                "TLAS.BLASInstanceTargetDescs",
            ));
        }
        let instances_source = self.instances_source.as_ref().unwrap().clone();
        let instances_target = self.instances_target.as_ref().unwrap().clone();

        if !blas_instances.is_empty() {
            let source_any = crate::rhi::AnyResource::Buffer(instances_source.clone());
            let target_any = crate::rhi::AnyResource::Buffer(instances_target.clone());

            context.insert_resource_barrier(
                &source_any,
                ResourceState::NON_PIXEL_SHADER_RESOURCE,
                ResourceState::COPY_DEST,
                crate::rhi::ALL_SUBRESOURCES,
            );

            let upload_size = std::mem::size_of_val(blas_instances) as u64;
            let scratch = context.allocate_scratch(upload_size);
            scratch.write_slice(blas_instances);
            context.copy_buffer(
                &scratch.backing,
                &instances_source,
                upload_size,
                scratch.offset,
                0,
            );

            context.insert_resource_barrier(
                &source_any,
                ResourceState::COPY_DEST,
                ResourceState::NON_PIXEL_SHADER_RESOURCE,
                crate::rhi::ALL_SUBRESOURCES,
            );
            context.insert_resource_barrier(
                &target_any,
                ResourceState::NON_PIXEL_SHADER_RESOURCE,
                ResourceState::UNORDERED_ACCESS,
                crate::rhi::ALL_SUBRESOURCES,
            );

            // Expand the compact records into API instance descriptors
            // using the scene instance table.
            context.set_compute_root_signature(&self.root_signature);
            context.set_pipeline_state(&self.update_tlas_pso);
            context.bind_root_cbv(0, &(blas_instances.len() as u32));
            context.bind_resources(2, &[instances_target.uav()]);
            context.bind_resources(3, &[instances_buffer.srv(), instances_source.srv()]);
            context.dispatch_1d(crate::rhi::thread_group_count(blas_instances.len() as u32, 32));

            context.insert_resource_barrier(
                &target_any,
                ResourceState::UNORDERED_ACCESS,
                ResourceState::NON_PIXEL_SHADER_RESOURCE,
                crate::rhi::ALL_SUBRESOURCES,
            );
            context.flush_resource_barriers();
        }

        context.end_event();
        context.begin_event("Build TLAS");

        let tlas = self.tlas.as_ref().unwrap();
        let scratch = self.tlas_scratch.as_ref().unwrap();
        context.build_tlas(tlas, scratch, &instances_target, blas_instances.len() as u32);
        context.insert_uav_barrier(Some(&crate::rhi::AnyResource::Buffer(tlas.clone())));
        context.flush_resource_barriers();

        context.end_event();
    }
}
