//! Scene Data Model
//!
//! The GPU-facing scene: instances ([`Batch`]), meshlet geometry ([`Mesh`] /
//! [`Meshlet`]), lights, and the per-view transform with its culling
//! frustum. Content loading lives outside the core; these types are what
//! the techniques consume.

use bitflags::bitflags;
use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};
use parking_lot::Mutex;

use crate::rhi::{Buffer, Ref};

bitflags! {
    /// Blend classification of an instance, the PSO-bin selector.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct BlendMode: u8 {
        const OPAQUE      = 1 << 0;
        const ALPHA_MASK  = 1 << 1;
        const ALPHA_BLEND = 1 << 2;
    }
}

/// Axis-aligned bounding box.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoundingBox {
    #[must_use]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub fn from_center_extents(center: Vec3, extents: Vec3) -> Self {
        Self {
            min: center - extents,
            max: center + extents,
        }
    }

    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[must_use]
    pub fn extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// The eight corner points.
    #[must_use]
    pub fn corners(&self) -> [Vec3; 8] {
        let (mn, mx) = (self.min, self.max);
        [
            Vec3::new(mn.x, mn.y, mn.z),
            Vec3::new(mx.x, mn.y, mn.z),
            Vec3::new(mn.x, mx.y, mn.z),
            Vec3::new(mx.x, mx.y, mn.z),
            Vec3::new(mn.x, mn.y, mx.z),
            Vec3::new(mx.x, mn.y, mx.z),
            Vec3::new(mn.x, mx.y, mx.z),
            Vec3::new(mx.x, mx.y, mx.z),
        ]
    }

    /// AABB of this box under an affine transform.
    #[must_use]
    pub fn transformed(&self, matrix: &Mat4) -> BoundingBox {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for corner in self.corners() {
            let p = matrix.transform_point3(corner);
            min = min.min(p);
            max = max.max(p);
        }
        Self { min, max }
    }
}

/// Bounding sphere plus normal cone of a meshlet, used for backface-cone
/// and occlusion culling.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct MeshletBounds {
    pub center: Vec3,
    pub radius: f32,
    pub cone_axis: Vec3,
    /// cos of the cone half-angle; a cone with cutoff >= 1 never culls.
    pub cone_cutoff: f32,
}

impl Default for MeshletBounds {
    fn default() -> Self {
        Self {
            center: Vec3::ZERO,
            radius: 1.0,
            cone_axis: Vec3::Z,
            cone_cutoff: 1.0,
        }
    }
}

/// A fixed-size cluster of triangles rasterized by one mesh-shader
/// workgroup.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Meshlet {
    pub vertex_count: u32,
    pub triangle_count: u32,
    pub bounds: MeshletBounds,
}

impl Meshlet {
    pub const MAX_VERTICES: u32 = 64;
    pub const MAX_TRIANGLES: u32 = 124;

    #[must_use]
    pub fn new(vertex_count: u32, triangle_count: u32, bounds: MeshletBounds) -> Self {
        assert!(vertex_count <= Self::MAX_VERTICES, "Meshlet vertex count exceeds limit");
        assert!(triangle_count <= Self::MAX_TRIANGLES, "Meshlet triangle count exceeds limit");
        Self {
            vertex_count,
            triangle_count,
            bounds,
        }
    }
}

/// Geometry shared by instances: meshlet array plus the acceleration-
/// structure slots the BLAS manager maintains.
///
/// The BLAS slot is swapped from the CPU side when compaction completes, so
/// it sits behind a mutex.
#[derive(Debug)]
pub struct Mesh {
    pub name: String,
    pub meshlet_count: u32,
    pub vertex_count: u32,
    pub index_count: u32,
    pub skinned: bool,
    meshlets: Vec<Meshlet>,
    blas: Mutex<Option<Ref<Buffer>>>,
    blas_scratch: Mutex<Option<Ref<Buffer>>>,
}

impl Mesh {
    #[must_use]
    pub fn new(name: &str, meshlets: Vec<Meshlet>, vertex_count: u32, index_count: u32) -> Self {
        Self {
            name: name.to_string(),
            meshlet_count: meshlets.len() as u32,
            vertex_count,
            index_count,
            skinned: false,
            meshlets,
            blas: Mutex::new(None),
            blas_scratch: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_skinning(mut self) -> Self {
        self.skinned = true;
        self
    }

    #[must_use]
    pub fn meshlets(&self) -> &[Meshlet] {
        &self.meshlets
    }

    #[must_use]
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }

    #[must_use]
    pub fn blas(&self) -> Option<Ref<Buffer>> {
        self.blas.lock().clone()
    }

    pub fn set_blas(&self, blas: Ref<Buffer>) {
        *self.blas.lock() = Some(blas);
    }

    #[must_use]
    pub fn blas_scratch(&self) -> Option<Ref<Buffer>> {
        self.blas_scratch.lock().clone()
    }

    pub fn set_blas_scratch(&self, scratch: Ref<Buffer>) {
        *self.blas_scratch.lock() = Some(scratch);
    }
}

/// One instance-in-scene.
#[derive(Clone, Debug)]
pub struct Batch {
    pub instance_id: u32,
    pub mesh: Ref<Mesh>,
    pub world_matrix: Mat4,
    /// World-space bounds.
    pub bounds: BoundingBox,
    pub radius: f32,
    pub blend_mode: BlendMode,
}

impl Batch {
    #[must_use]
    pub fn new(instance_id: u32, mesh: Ref<Mesh>, world_matrix: Mat4, bounds: BoundingBox) -> Self {
        let radius = bounds.extents().length();
        Self {
            instance_id,
            mesh,
            world_matrix,
            bounds,
            radius,
            blend_mode: BlendMode::OPAQUE,
        }
    }

    #[must_use]
    pub fn with_blend_mode(mut self, blend_mode: BlendMode) -> Self {
        self.blend_mode = blend_mode;
        self
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum LightKind {
    Point,
    Spot { direction: Vec3, angle: f32 },
    Directional { direction: Vec3 },
}

/// A scene light. Clustered culling consumes position + range.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Light {
    pub position: Vec3,
    pub range: f32,
    pub intensity: f32,
    pub kind: LightKind,
}

impl Light {
    #[must_use]
    pub fn point(position: Vec3, range: f32) -> Self {
        Self {
            position,
            range,
            intensity: 1.0,
            kind: LightKind::Point,
        }
    }
}

// ─── View ─────────────────────────────────────────────────────────────────────

/// Culling frustum as six world-space planes (left, right, bottom, top,
/// near, far), extracted Gribb-Hartmann style.
///
/// Reverse-Z infinite projections leave the far plane zeroed; a zero plane
/// never rejects.
#[derive(Clone, Copy, Debug, Default)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    #[must_use]
    pub fn from_matrix(view_projection: Mat4) -> Self {
        let rows = [
            view_projection.row(0),
            view_projection.row(1),
            view_projection.row(2),
            view_projection.row(3),
        ];

        let mut planes = [Vec4::ZERO; 6];
        planes[0] = rows[3] + rows[0]; // Left
        planes[1] = rows[3] - rows[0]; // Right
        planes[2] = rows[3] + rows[1]; // Bottom
        planes[3] = rows[3] - rows[1]; // Top

        // Reverse-Z: the near plane sits at NDC z = 1, the far plane at
        // z = 0. An infinite projection degenerates the far plane to zero.
        planes[4] = rows[3] - rows[2]; // Near
        planes[5] = rows[2]; // Far

        for plane in &mut planes {
            let length = plane.xyz().length();
            if length > 1e-6 {
                *plane /= length;
            } else {
                *plane = Vec4::ZERO;
            }
        }

        Self { planes }
    }

    #[must_use]
    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        for plane in &self.planes {
            if plane.xyz() == Vec3::ZERO {
                continue;
            }
            if plane.xyz().dot(center) + plane.w < -radius {
                return false;
            }
        }
        true
    }

    /// Plane/AABB rejection via the positive vertex.
    #[must_use]
    pub fn intersects_aabb(&self, aabb: &BoundingBox) -> bool {
        for plane in &self.planes {
            if plane.xyz() == Vec3::ZERO {
                continue;
            }
            let p = Vec3::new(
                if plane.x >= 0.0 { aabb.max.x } else { aabb.min.x },
                if plane.y >= 0.0 { aabb.max.y } else { aabb.min.y },
                if plane.z >= 0.0 { aabb.max.z } else { aabb.min.z },
            );
            if plane.xyz().dot(p) + plane.w < 0.0 {
                return false;
            }
        }
        true
    }
}

/// Per-view transform state: matrices, clip range, viewport, frustum.
#[derive(Clone, Copy, Debug)]
pub struct ViewTransform {
    pub world_to_view: Mat4,
    pub view_to_clip: Mat4,
    pub world_to_clip: Mat4,
    pub position: Vec3,
    pub near: f32,
    pub far: f32,
    pub viewport: (u32, u32),
    pub frustum: Frustum,
}

impl ViewTransform {
    /// Perspective view with an infinite reverse-Z projection (near plane
    /// maps to NDC z = 1, infinity to 0).
    #[must_use]
    pub fn perspective(
        position: Vec3,
        target: Vec3,
        fov_y_radians: f32,
        viewport: (u32, u32),
        near: f32,
        far: f32,
    ) -> Self {
        let aspect = viewport.0 as f32 / viewport.1 as f32;
        let world_to_view = Mat4::look_at_rh(position, target, Vec3::Y);
        let view_to_clip = Mat4::perspective_infinite_reverse_rh(fov_y_radians, aspect, near);
        let world_to_clip = view_to_clip * world_to_view;
        Self {
            world_to_view,
            view_to_clip,
            world_to_clip,
            position,
            near,
            far,
            viewport,
            frustum: Frustum::from_matrix(world_to_clip),
        }
    }

    /// View-space depth of a world position (positive in front of the
    /// camera for a right-handed view looking down -Z).
    #[must_use]
    pub fn view_depth(&self, world_position: Vec3) -> f32 {
        -self.world_to_view.transform_point3(world_position).z
    }
}
