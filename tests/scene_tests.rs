//! Scene and Frustum Tests
//!
//! Tests for:
//! - Reverse-Z infinite perspective (near → NDC 1, infinity → NDC 0)
//! - Frustum plane extraction and sphere/AABB intersection
//! - Bounding-box transforms
//! - Meshlet construction limits

use glam::{Mat4, Vec3, Vec4};

use argus::scene::{BoundingBox, Frustum, Meshlet, MeshletBounds, ViewTransform};

const EPSILON: f32 = 1e-4;

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < EPSILON
}

fn test_view() -> ViewTransform {
    ViewTransform::perspective(
        Vec3::ZERO,
        Vec3::new(0.0, 0.0, -1.0),
        60.0_f32.to_radians(),
        (1024, 1024),
        0.1,
        1000.0,
    )
}

// ============================================================================
// Reverse-Z Projection
// ============================================================================

#[test]
fn near_plane_maps_to_ndc_one() {
    let view = test_view();
    let near_point = view.view_to_clip * Vec4::new(0.0, 0.0, -0.1, 1.0);
    let ndc_z = near_point.z / near_point.w;
    assert!(
        approx(ndc_z, 1.0),
        "Near plane must map to NDC z = 1 in reverse-Z, got {ndc_z}"
    );
}

#[test]
fn far_distances_approach_ndc_zero() {
    let view = test_view();
    let far_point = view.view_to_clip * Vec4::new(0.0, 0.0, -100_000.0, 1.0);
    let ndc_z = far_point.z / far_point.w;
    assert!(
        ndc_z.abs() < 0.01,
        "Distant points must approach NDC z = 0 in reverse-Z, got {ndc_z}"
    );
}

#[test]
fn view_depth_is_positive_in_front() {
    let view = test_view();
    assert!(approx(view.view_depth(Vec3::new(0.0, 0.0, -25.0)), 25.0));
    assert!(view.view_depth(Vec3::new(0.0, 0.0, 10.0)) < 0.0);
}

// ============================================================================
// Frustum Intersection
// ============================================================================

#[test]
fn sphere_inside_frustum() {
    let view = test_view();
    assert!(view.frustum.intersects_sphere(Vec3::new(0.0, 0.0, -5.0), 1.0));
}

#[test]
fn sphere_far_left_is_rejected() {
    let view = test_view();
    assert!(!view.frustum.intersects_sphere(Vec3::new(-1000.0, 0.0, -5.0), 1.0));
}

#[test]
fn sphere_behind_camera_is_rejected() {
    let view = test_view();
    assert!(!view.frustum.intersects_sphere(Vec3::new(0.0, 0.0, 10.0), 1.0));
}

#[test]
fn large_straddling_sphere_intersects() {
    let view = test_view();
    assert!(view.frustum.intersects_sphere(Vec3::new(0.0, 0.0, -5.0), 100.0));
}

#[test]
fn aabb_in_front_intersects() {
    let view = test_view();
    let aabb = BoundingBox::new(Vec3::new(-0.5, -0.5, -6.0), Vec3::new(0.5, 0.5, -4.0));
    assert!(view.frustum.intersects_aabb(&aabb));
}

#[test]
fn aabb_far_away_is_rejected() {
    let view = test_view();
    let aabb = BoundingBox::new(
        Vec3::new(-1000.0, -1000.0, -1002.0),
        Vec3::new(-999.0, -999.0, -1001.0),
    );
    assert!(!view.frustum.intersects_aabb(&aabb));
}

#[test]
fn infinite_projection_never_far_culls() {
    let view = test_view();
    // Very distant but on-axis: the degenerate far plane must not reject.
    assert!(view
        .frustum
        .intersects_sphere(Vec3::new(0.0, 0.0, -900_000.0), 1.0));
}

#[test]
fn frustum_from_identity_is_permissive() {
    // A defensive case: all-zero planes never reject.
    let frustum = Frustum::from_matrix(Mat4::ZERO);
    assert!(frustum.intersects_sphere(Vec3::splat(1000.0), 0.1));
}

// ============================================================================
// Bounding Boxes
// ============================================================================

#[test]
fn transformed_aabb_bounds_all_corners() {
    let aabb = BoundingBox::new(Vec3::splat(-1.0), Vec3::splat(1.0));
    let matrix =
        Mat4::from_rotation_y(45.0_f32.to_radians()) * Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0));
    let transformed = aabb.transformed(&matrix);

    for corner in aabb.corners() {
        let p = matrix.transform_point3(corner);
        assert!(p.cmpge(transformed.min - EPSILON).all());
        assert!(p.cmple(transformed.max + EPSILON).all());
    }
}

#[test]
fn center_extents_round_trip() {
    let aabb = BoundingBox::from_center_extents(Vec3::new(1.0, 2.0, 3.0), Vec3::new(4.0, 5.0, 6.0));
    assert!(approx(aabb.center().x, 1.0));
    assert!(approx(aabb.center().z, 3.0));
    assert!(approx(aabb.extents().y, 5.0));
}

// ============================================================================
// Meshlets
// ============================================================================

#[test]
fn meshlet_limits_are_enforced() {
    let meshlet = Meshlet::new(64, 124, MeshletBounds::default());
    assert_eq!(meshlet.vertex_count, Meshlet::MAX_VERTICES);
    assert_eq!(meshlet.triangle_count, Meshlet::MAX_TRIANGLES);
}

#[test]
#[should_panic(expected = "triangle count exceeds limit")]
fn oversized_meshlet_panics() {
    let _ = Meshlet::new(64, 125, MeshletBounds::default());
}
