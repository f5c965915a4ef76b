//! Clustered Light Culling Tests
//!
//! Tests for:
//! - Cluster grid dimensions and slice-magic reconstruction
//! - Slice monotonicity and range (property)
//! - Cluster AABB derivation
//! - Reference light culling bounds (1024-light scenario)
//! - Per-frame pass recording

use glam::Vec3;

use argus::graph::{RGGraph, RGGraphOptions, RGPassFlags, RGPassId, RGResourceAllocator};
use argus::rhi::{BufferDesc, GraphicsCommon, GraphicsDevice, ResourceFormat, TextureDesc};
use argus::scene::{Light, ViewTransform};
use argus::techniques::light_culling::{
    reference, sphere_intersects_aabb, ClusterGrid, ClusteredForwardInputs, ClusteredLightCulling,
    CLUSTER_COUNT_Z, CLUSTER_SIZE,
};

fn test_view(width: u32, height: u32, near: f32, far: f32) -> ViewTransform {
    ViewTransform::perspective(
        Vec3::ZERO,
        Vec3::new(0.0, 0.0, -1.0),
        60.0_f32.to_radians(),
        (width, height),
        near,
        far,
    )
}

// ============================================================================
// Grid Geometry
// ============================================================================

#[test]
fn grid_dimensions_cover_the_viewport() {
    let grid = ClusterGrid::new((1920, 1080), 0.1, 100.0);
    assert_eq!(grid.count_x, 30);
    assert_eq!(grid.count_y, 17);
    assert_eq!(grid.count_z, CLUSTER_COUNT_Z);
    assert_eq!(grid.cluster_count(), 30 * 17 * 32);

    let odd = ClusterGrid::new((1000, 500), 0.1, 100.0);
    assert_eq!(odd.count_x, 1000_u32.div_ceil(CLUSTER_SIZE));
    assert_eq!(odd.count_y, 500_u32.div_ceil(CLUSTER_SIZE));
}

// ============================================================================
// Slice Reconstruction
// ============================================================================

#[test]
fn slice_stays_in_range_and_is_monotonic() {
    let grid = ClusterGrid::new((1920, 1080), 0.5, 200.0);

    let mut previous = grid.slice_for_view_depth(grid.near);
    assert!(previous < grid.count_z);

    // Log-spaced sweep of the clip range.
    for step in 1..=256 {
        let t = step as f32 / 256.0;
        let depth = grid.near * (grid.far / grid.near).powf(t);
        let slice = grid.slice_for_view_depth(depth);
        assert!(slice < grid.count_z, "Slice out of range at depth {depth}");
        assert!(
            slice <= previous,
            "Slices must decrease monotonically toward the far plane"
        );
        previous = slice;
    }

    // Endpoints: near plane lands in the last slice, far plane in slice 0.
    assert_eq!(grid.slice_for_view_depth(grid.near), grid.count_z - 1);
    assert_eq!(grid.slice_for_view_depth(grid.far), 0);
}

#[test]
fn slice_bounds_invert_the_mapping() {
    let grid = ClusterGrid::new((1280, 720), 0.1, 150.0);
    for slice in 0..grid.count_z {
        let (min_depth, max_depth) = grid.slice_depth_bounds(slice);
        assert!(min_depth < max_depth);
        let midpoint = (min_depth * max_depth).sqrt();
        assert_eq!(
            grid.slice_for_view_depth(midpoint),
            slice,
            "The bounds midpoint must reconstruct its own slice"
        );
    }
}

// ============================================================================
// Cluster AABBs
// ============================================================================

#[test]
fn cluster_aabbs_sit_in_front_of_the_camera() {
    let view = test_view(1920, 1080, 0.1, 100.0);
    let grid = ClusterGrid::new((1920, 1080), 0.1, 100.0);

    let aabb = grid.cluster_aabb(&view, grid.count_x / 2, grid.count_y / 2, 16);
    assert!(aabb.min.z < aabb.max.z);
    assert!(aabb.max.z < 0.0, "View-space clusters lie down -Z");

    let (depth_min, depth_max) = grid.slice_depth_bounds(16);
    assert!((-aabb.max.z - depth_min).abs() < 1e-3);
    assert!((-aabb.min.z - depth_max).abs() < 1e-3);
}

#[test]
fn sphere_aabb_intersection_uses_the_closest_point() {
    let aabb = argus::scene::BoundingBox::new(Vec3::splat(-1.0), Vec3::splat(1.0));
    assert!(sphere_intersects_aabb(Vec3::ZERO, 0.5, &aabb));
    assert!(sphere_intersects_aabb(Vec3::new(1.9, 0.0, 0.0), 1.0, &aabb));
    assert!(!sphere_intersects_aabb(Vec3::new(3.0, 0.0, 0.0), 1.0, &aabb));
    // Corner distance is sqrt(3), not 1.
    assert!(!sphere_intersects_aabb(Vec3::new(2.0, 2.0, 2.0), 1.0, &aabb));
}

// ============================================================================
// Reference Light Culling (scenario: 1024 lights in a 100³ box)
// ============================================================================

#[test]
fn light_culling_respects_the_scenario_bounds() {
    let view = test_view(1920, 1080, 0.1, 100.0);
    let grid = ClusterGrid::new((1920, 1080), 0.1, 100.0);

    // 1024 point lights of radius 2 scattered through a 100³ box in front
    // of the camera, via a deterministic LCG.
    let mut state: u64 = 0xDEAD_BEEF_CAFE_1234;
    let mut next_unit = move || {
        state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        ((state >> 33) & 0xFFFFFF) as f32 / 16_777_215.0
    };
    let lights: Vec<Light> = (0..1024)
        .map(|_| {
            Light::point(
                Vec3::new(
                    next_unit() * 100.0 - 50.0,
                    next_unit() * 100.0 - 50.0,
                    -next_unit() * 100.0,
                ),
                2.0,
            )
        })
        .collect();

    // Mark clusters from a plausible depth field (a ground-plane-ish ramp).
    let samples: Vec<(u32, u32, f32)> = (0..64)
        .flat_map(|ix| {
            (0..36).map(move |iy| {
                let depth = 1.0 + (iy as f32 / 36.0) * 90.0;
                (ix * 30, iy * 30, depth)
            })
        })
        .collect();
    let active = reference::mark_and_compact(&grid, &samples);

    assert!(
        active.len() as u32 <= grid.cluster_count(),
        "Compacted clusters cannot exceed the grid"
    );
    assert!(!active.is_empty());

    let output = reference::cull_lights(&grid, &view, &lights, &active);
    let total: u32 = output.light_grid.iter().map(|(_, count)| count).sum();
    assert_eq!(
        total as usize,
        output.light_index_list.len(),
        "The light grid must index exactly the shared list"
    );
    assert!(
        total <= 1024 * active.len() as u32,
        "Total binned lights are bounded by lights × active clusters"
    );

    // Inactive clusters must stay empty.
    let active_set: std::collections::HashSet<u32> = active.iter().copied().collect();
    for (index, (_, count)) in output.light_grid.iter().enumerate() {
        if !active_set.contains(&(index as u32)) {
            assert_eq!(*count, 0);
        }
    }
}

// ============================================================================
// Pass Recording
// ============================================================================

#[test]
fn clustered_pipeline_records_all_stages() {
    let device = GraphicsDevice::new();
    let common = GraphicsCommon::new(&device);
    let mut allocator = RGResourceAllocator::new();
    let view = test_view(1280, 720, 0.1, 100.0);

    let mut clustered = ClusteredLightCulling::new(&device, &common).expect("pipelines compile");
    clustered.on_swapchain_created(&device, 1280, 720, &view);
    assert!(clustered.grid().is_some());
    // The AABB precompute ran as a one-shot submission.
    assert_eq!(device.graphics_queue().submitted_list_count(), 1);

    let light_buffer = device.create_buffer(&BufferDesc::structured(64, 32), "Lights");

    let mut graph = RGGraph::new();
    let render_target = graph.create_texture(
        "Scene Color",
        TextureDesc::render_target(1280, 720, ResourceFormat::RGBA16Float),
    );
    let depth = graph.create_texture(
        "Depth",
        TextureDesc::depth(1280, 720, ResourceFormat::D32Float),
    );
    let inputs = ClusteredForwardInputs {
        render_target,
        depth,
        opaque_batches: Vec::new(),
        transparent_batches: Vec::new(),
        light_buffer,
        light_count: 64,
        view: &view,
    };
    clustered.execute(&mut graph, &inputs);

    graph.compile(
        &device,
        &mut allocator,
        RGGraphOptions {
            single_thread: true,
            ..RGGraphOptions::default()
        },
    );

    let live: Vec<String> = (0..graph.pass_count())
        .map(|i| graph.pass(RGPassId::new(i)))
        .filter(|p| !p.is_culled())
        .map(|p| p.name().to_string())
        .collect();
    for expected in [
        "Mark Clusters",
        "Compact Clusters",
        "Update Indirect Arguments",
        "Light Culling",
        "Base Pass",
    ] {
        assert!(live.iter().any(|n| n == expected), "Missing pass '{expected}'");
    }

    graph.execute(&device);
    assert!(device.graphics_queue().submitted_list_count() >= 2);
}
