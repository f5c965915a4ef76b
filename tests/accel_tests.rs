//! Acceleration Structure Tests
//!
//! Tests for:
//! - BLAS instance record layout (GPU ABI)
//! - Per-frame BLAS build budget
//! - Compaction queue: emit → readback → compacting copy → BLAS swap
//! - TLAS rebuild and growth-capped reallocation

use glam::{Mat4, Vec3};

use argus::rhi::{BufferDesc, GraphicsCommon, GraphicsDevice, Ref};
use argus::scene::{Batch, BoundingBox, Mesh, Meshlet, MeshletBounds};
use argus::techniques::accel::{
    instance_flags_for, AccelerationStructure, BlasInstance, INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE,
};

fn make_mesh(name: &str, vertex_count: u32) -> Ref<Mesh> {
    let meshlets = vec![Meshlet::new(64, 124, MeshletBounds::default())];
    Ref::new(Mesh::new(name, meshlets, vertex_count, vertex_count * 3))
}

fn batch_for(instance_id: u32, mesh: &Ref<Mesh>) -> Batch {
    Batch::new(
        instance_id,
        mesh.clone(),
        Mat4::IDENTITY,
        BoundingBox::from_center_extents(Vec3::ZERO, Vec3::ONE),
    )
}

fn instances_buffer(device: &GraphicsDevice, count: u32) -> Ref<argus::rhi::Buffer> {
    device.create_buffer(&BufferDesc::structured(count.max(1), 64), "Scene Instances")
}

// ============================================================================
// GPU ABI
// ============================================================================

#[test]
fn blas_instance_record_is_sixteen_bytes() {
    assert_eq!(std::mem::size_of::<BlasInstance>(), 16);

    let record = BlasInstance {
        gpu_address: 0x1122_3344_5566_7788,
        world_matrix_index: 42,
        flags: INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE,
        instance_mask: 0xFF,
        padding: 0,
    };
    let bytes = bytemuck::bytes_of(&record);
    assert_eq!(&bytes[0..8], &0x1122_3344_5566_7788_u64.to_le_bytes());
    assert_eq!(&bytes[8..12], &42_u32.to_le_bytes());
    assert_eq!(bytes[12], INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE);
    assert_eq!(bytes[13], 0xFF);
}

#[test]
fn mirrored_transforms_flip_the_winding_flag() {
    assert_eq!(instance_flags_for(&Mat4::IDENTITY), 0);
    let mirrored = Mat4::from_scale(Vec3::new(-1.0, 1.0, 1.0));
    assert_eq!(
        instance_flags_for(&mirrored),
        INSTANCE_FLAG_FRONT_COUNTERCLOCKWISE
    );
}

// ============================================================================
// Build Budget
// ============================================================================

#[test]
fn blas_builds_respect_the_per_frame_budget() {
    let device = GraphicsDevice::new();
    let common = GraphicsCommon::new(&device);
    let mut accel = AccelerationStructure::new(&device, &common).unwrap();

    // 50 static meshes × 3000 vertices: the 32-build cap binds first.
    let meshes: Vec<Ref<Mesh>> = (0..50).map(|i| make_mesh(&format!("M{i}"), 3000)).collect();
    let batches: Vec<Batch> = meshes
        .iter()
        .enumerate()
        .map(|(i, mesh)| batch_for(i as u32, mesh))
        .collect();
    let instances = instances_buffer(&device, batches.len() as u32);

    let mut context = device.allocate_command_context();
    accel.build(&mut context, &instances, &batches);
    device.submit(context, true);

    let built: usize = meshes.iter().filter(|m| m.blas().is_some()).count();
    assert_eq!(built, 32, "The per-frame build budget must cap at 32 BLASes");

    // The next frame picks up where the budget cut off.
    device.next_frame().unwrap();
    let mut context = device.allocate_command_context();
    accel.build(&mut context, &instances, &batches);
    device.submit(context, true);

    let built: usize = meshes.iter().filter(|m| m.blas().is_some()).count();
    assert_eq!(built, 50, "Remaining BLASes must build on later frames");
}

#[test]
fn vertex_budget_limits_large_meshes() {
    let device = GraphicsDevice::new();
    let common = GraphicsCommon::new(&device);
    let mut accel = AccelerationStructure::new(&device, &common).unwrap();

    // 5 meshes × 40 000 vertices: the vertex budget stops after the third.
    let meshes: Vec<Ref<Mesh>> = (0..5).map(|i| make_mesh(&format!("Big{i}"), 40_000)).collect();
    let batches: Vec<Batch> = meshes
        .iter()
        .enumerate()
        .map(|(i, mesh)| batch_for(i as u32, mesh))
        .collect();
    let instances = instances_buffer(&device, batches.len() as u32);

    let mut context = device.allocate_command_context();
    accel.build(&mut context, &instances, &batches);
    device.submit(context, true);

    let built: usize = meshes.iter().filter(|m| m.blas().is_some()).count();
    assert_eq!(built, 3, "Builds stop once the vertex budget is exhausted");
}

// ============================================================================
// Compaction
// ============================================================================

#[test]
fn compaction_shrinks_static_blases() {
    let device = GraphicsDevice::new();
    let common = GraphicsCommon::new(&device);
    let mut accel = AccelerationStructure::new(&device, &common).unwrap();

    let mesh = make_mesh("Static", 5000);
    let batches = vec![batch_for(0, &mesh)];
    let instances = instances_buffer(&device, 1);

    // Frame 1: build + queue compaction, emit postbuild info.
    let mut context = device.allocate_command_context();
    accel.build(&mut context, &instances, &batches);
    device.submit(context, true);
    let original_size = mesh.blas().unwrap().size();
    assert_eq!(accel.pending_compactions(), 1);

    // The frame fence signal completes the readback sync point.
    device.next_frame().unwrap();

    // Frame 2: the compacted BLAS replaces the original.
    let mut context = device.allocate_command_context();
    accel.build(&mut context, &instances, &batches);
    device.submit(context, true);

    let compacted_size = mesh.blas().unwrap().size();
    assert!(
        compacted_size <= original_size,
        "Compaction must not grow the BLAS ({compacted_size} > {original_size})"
    );
    assert!(compacted_size > 0);
    assert_eq!(accel.pending_compactions(), 0, "The queue must drain");
}

#[test]
fn skinned_meshes_refit_without_compaction() {
    let device = GraphicsDevice::new();
    let common = GraphicsCommon::new(&device);
    let mut accel = AccelerationStructure::new(&device, &common).unwrap();

    let mesh = Ref::new(
        Mesh::new(
            "Skinned",
            vec![Meshlet::new(64, 124, MeshletBounds::default())],
            4000,
            12000,
        )
        .with_skinning(),
    );
    let batches = vec![batch_for(0, &mesh)];
    let instances = instances_buffer(&device, 1);

    for _ in 0..3 {
        let mut context = device.allocate_command_context();
        accel.build(&mut context, &instances, &batches);
        device.submit(context, true);
        device.next_frame().unwrap();
    }

    assert!(mesh.blas().is_some());
    assert_eq!(
        accel.pending_compactions(),
        0,
        "Skinned meshes never enter the compaction queue"
    );
}

// ============================================================================
// TLAS
// ============================================================================

#[test]
fn tlas_builds_and_reuses_its_buffer_until_growth() {
    let device = GraphicsDevice::new();
    let common = GraphicsCommon::new(&device);
    let mut accel = AccelerationStructure::new(&device, &common).unwrap();

    let mesh = make_mesh("Prop", 1000);
    let batches = vec![batch_for(0, &mesh)];
    let instances = instances_buffer(&device, 256);

    let mut context = device.allocate_command_context();
    accel.build(&mut context, &instances, &batches);
    device.submit(context, true);

    let tlas_id = accel.tlas().expect("TLAS must exist after build").id();
    assert!(accel.srv().is_some());

    // Same instance count: the persistent TLAS buffer is reused.
    device.next_frame().unwrap();
    let mut context = device.allocate_command_context();
    accel.build(&mut context, &instances, &batches);
    device.submit(context, true);
    assert_eq!(accel.tlas().unwrap().id(), tlas_id);

    // Many more instances: the prebuild info grows past the buffer.
    let many: Vec<Batch> = (0..512).map(|i| batch_for(i, &mesh)).collect();
    device.next_frame().unwrap();
    let mut context = device.allocate_command_context();
    accel.build(&mut context, &instances, &many);
    device.submit(context, true);
    assert_ne!(
        accel.tlas().unwrap().id(),
        tlas_id,
        "TLAS growth must reallocate the buffer"
    );
}
