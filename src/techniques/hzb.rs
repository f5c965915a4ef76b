//! HZB Builder
//!
//! Builds a hierarchical Z pyramid from a depth buffer: one dispatch writes
//! mip 0 (depth downsampled by two), then a single-pass downsampler reduces
//! all remaining mips in one dispatch, using an atomic counter as the
//! cross-group barrier so the last active group finishes the tail mips.
//!
//! Reverse-Z convention: the reduction is `min`, so each texel holds the
//! farthest depth of its footprint and an object is occluded only if its
//! nearest point is farther than everything already drawn there.

use crate::errors::Result;
use crate::graph::{RGGraph, RGPassFlags, RGTextureHandle};
use crate::rhi::{
    thread_group_count, BufferDesc, GraphicsCommon, GraphicsDevice, PipelineState, Ref,
    ResourceFormat, RootSignature, ShaderDefines, TextureDesc, TextureFlags,
};

/// SPD reduces 64×64 tiles per thread group.
const SPD_TILE_SIZE: u32 = 64;

/// HZB dimensions for a view: next power of two halved, clamped to 1.
#[must_use]
pub fn hzb_dimensions(view_width: u32, view_height: u32) -> (u32, u32) {
    (
        (view_width.next_power_of_two() / 2).max(1),
        (view_height.next_power_of_two() / 2).max(1),
    )
}

/// Mip count of the pyramid: `floor(log2(max(w, h)))`, at least 1.
#[must_use]
pub fn hzb_mip_count(width: u32, height: u32) -> u32 {
    (31 - width.max(height).max(1).leading_zeros()).max(1)
}

/// Dispatch geometry for the single-pass downsampler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SpdSetup {
    pub dispatch: (u32, u32),
    pub workgroup_offset: (u32, u32),
    pub num_workgroups: u32,
    pub mips: u32,
}

/// Computes SPD dispatch geometry from the target rect `[left, top, width,
/// height]` and the number of mips to produce.
#[must_use]
pub fn spd_setup(rect: [u32; 4], mips: u32) -> SpdSetup {
    let offset = (rect[0] / SPD_TILE_SIZE, rect[1] / SPD_TILE_SIZE);
    let end = (
        (rect[0] + rect[2] - 1) / SPD_TILE_SIZE,
        (rect[1] + rect[3] - 1) / SPD_TILE_SIZE,
    );
    let dispatch = (end.0 - offset.0 + 1, end.1 - offset.1 + 1);
    SpdSetup {
        dispatch,
        workgroup_offset: offset,
        num_workgroups: dispatch.0 * dispatch.1,
        mips,
    }
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct HzbInitParams {
    dimensions_inv: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct HzbReduceParams {
    num_mips: u32,
    num_workgroups: u32,
    workgroup_offset: [u32; 2],
}

/// Records the HZB passes. The pyramid texture itself is persistent across
/// frames via export; phase 1 of frame N reads what phase 2 of frame N-1
/// produced.
pub struct HzbBuilder {
    root_signature: Ref<RootSignature>,
    init_pso: Ref<PipelineState>,
    reduce_pso: Ref<PipelineState>,
}

impl HzbBuilder {
    pub fn new(device: &GraphicsDevice, common: &GraphicsCommon) -> Result<Self> {
        let defines = ShaderDefines::new();
        Ok(Self {
            root_signature: common.root_signature().clone(),
            init_pso: device.create_compute_pipeline(
                common.root_signature(),
                "HZB.hlsl",
                "HZBInitCS",
                &defines,
            )?,
            reduce_pso: device.create_compute_pipeline(
                common.root_signature(),
                "HZB.hlsl",
                "HZBCreateCS",
                &defines,
            )?,
        })
    }

    /// Declares the persistent HZB texture for a view of the given size.
    pub fn init_hzb(&self, graph: &mut RGGraph<'_>, view_dimensions: (u32, u32)) -> RGTextureHandle {
        let (width, height) = hzb_dimensions(view_dimensions.0, view_dimensions.1);
        let mips = hzb_mip_count(width, height);
        let desc = TextureDesc::create_2d(width, height, ResourceFormat::R16Float)
            .with_flags(TextureFlags::UNORDERED_ACCESS)
            .with_mips(mips);
        graph.create_texture("HZB", desc)
    }

    /// Records the two HZB passes: mip-0 init from depth, then the SPD
    /// reduction of mips 1..N.
    pub fn build(&self, graph: &mut RGGraph<'_>, depth: RGTextureHandle, hzb: RGTextureHandle) {
        let mut graph = graph.scoped("HZB");

        let hzb_desc = *graph
            .resource(hzb.id())
            .desc
            .as_texture()
            .expect("HZB handle must be a texture");
        let (hzb_width, hzb_height) = hzb_desc.size_2d();

        {
            let root_signature = self.root_signature.clone();
            let pso = self.init_pso.clone();
            let _ = graph
                .add_pass("HZB Create", RGPassFlags::COMPUTE)
                .read(&[depth.into()])
                .write(&[hzb.into()])
                .bind(move |context, resources| {
                    context.set_compute_root_signature(&root_signature);
                    context.set_pipeline_state(&pso);
                    context.bind_root_cbv(
                        0,
                        &HzbInitParams {
                            dimensions_inv: [1.0 / hzb_width as f32, 1.0 / hzb_height as f32],
                        },
                    );
                    context.bind_resources(2, &[resources.mip_uav(hzb, 0)]);
                    context.bind_resources(3, &[resources.srv(depth)]);
                    context.dispatch(
                        thread_group_count(hzb_width, 16),
                        thread_group_count(hzb_height, 16),
                        1,
                    );
                });
        }

        let spd_counter = graph.create_buffer(
            "SPD.Counter",
            BufferDesc::typed(1, ResourceFormat::R32Uint),
        );

        {
            let root_signature = self.root_signature.clone();
            let pso = self.reduce_pso.clone();
            let setup = spd_setup([0, 0, hzb_width, hzb_height], hzb_desc.mips - 1);
            let mips = hzb_desc.mips;
            let _ = graph
                .add_pass("HZB Mips", RGPassFlags::COMPUTE)
                .write(&[hzb.into(), spd_counter.into()])
                .bind(move |context, resources| {
                    context.clear_uav_u32(&resources.get(spd_counter), 0);
                    context.insert_uav_barrier(None);

                    context.set_compute_root_signature(&root_signature);
                    context.set_pipeline_state(&pso);
                    context.bind_root_cbv(
                        0,
                        &HzbReduceParams {
                            num_mips: setup.mips,
                            num_workgroups: setup.num_workgroups,
                            workgroup_offset: [setup.workgroup_offset.0, setup.workgroup_offset.1],
                        },
                    );

                    let mut uavs = vec![resources.uav(spd_counter)];
                    // The mid-pyramid bounce target; only present past mip 6.
                    if mips > 6 {
                        uavs.push(resources.mip_uav(hzb, 6));
                    }
                    for mip in 0..mips {
                        uavs.push(resources.mip_uav(hzb, mip));
                    }
                    context.bind_resources(2, &uavs);
                    context.dispatch(setup.dispatch.0, setup.dispatch.1, 1);
                });
        }
    }
}

// ─── CPU reference ────────────────────────────────────────────────────────────

/// Reference kernels mirroring the HZB shaders; the occlusion tests and the
/// monotonicity property test run against these.
pub mod reference {
    use half::f16;

    /// Round-trips a depth value through the pyramid's R16 storage format.
    #[must_use]
    pub fn quantize_r16(value: f32) -> f32 {
        f16::from_f32(value).to_f32()
    }

    /// Builds HZB mip 0 by min-reducing the depth buffer into the pyramid
    /// footprint (reverse-Z: min keeps the farthest depth).
    #[must_use]
    pub fn init_from_depth(
        depth: &[f32],
        depth_width: u32,
        depth_height: u32,
        hzb_width: u32,
        hzb_height: u32,
    ) -> Vec<f32> {
        assert_eq!(depth.len(), (depth_width * depth_height) as usize);
        let mut mip0 = vec![0.0f32; (hzb_width * hzb_height) as usize];
        for y in 0..hzb_height {
            for x in 0..hzb_width {
                // Footprint of this texel in the depth buffer.
                let x0 = x * depth_width / hzb_width;
                let x1 = ((x + 1) * depth_width).div_ceil(hzb_width).min(depth_width);
                let y0 = y * depth_height / hzb_height;
                let y1 = ((y + 1) * depth_height)
                    .div_ceil(hzb_height)
                    .min(depth_height);
                let mut value = f32::MAX;
                for sy in y0..y1.max(y0 + 1) {
                    for sx in x0..x1.max(x0 + 1) {
                        value = value.min(depth[(sy * depth_width + sx) as usize]);
                    }
                }
                mip0[(y * hzb_width + x) as usize] = quantize_r16(value);
            }
        }
        mip0
    }

    /// Min-reduces one mip into the next (2×2 taps, clamped at odd edges).
    #[must_use]
    pub fn downsample_min(src: &[f32], width: u32, height: u32) -> (Vec<f32>, u32, u32) {
        let dst_width = (width / 2).max(1);
        let dst_height = (height / 2).max(1);
        let mut dst = vec![0.0f32; (dst_width * dst_height) as usize];
        for y in 0..dst_height {
            for x in 0..dst_width {
                let x0 = (x * 2).min(width - 1);
                let x1 = (x * 2 + 1).min(width - 1);
                let y0 = (y * 2).min(height - 1);
                let y1 = (y * 2 + 1).min(height - 1);
                let value = src[(y0 * width + x0) as usize]
                    .min(src[(y0 * width + x1) as usize])
                    .min(src[(y1 * width + x0) as usize])
                    .min(src[(y1 * width + x1) as usize]);
                dst[(y * dst_width + x) as usize] = quantize_r16(value);
            }
        }
        (dst, dst_width, dst_height)
    }

    /// Builds the full pyramid from mip 0. Returns `(texels, width, height)`
    /// per mip, mip 0 first.
    #[must_use]
    pub fn build_pyramid(mip0: Vec<f32>, width: u32, height: u32) -> Vec<(Vec<f32>, u32, u32)> {
        let mut mips = vec![(mip0, width, height)];
        let mut w = width;
        let mut h = height;
        while w > 1 || h > 1 {
            let (src, sw, sh) = {
                let last = mips.last().unwrap();
                (last.0.clone(), last.1, last.2)
            };
            let next = downsample_min(&src, sw, sh);
            w = next.1;
            h = next.2;
            mips.push(next);
        }
        mips
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_round_down_to_half_pow2() {
        assert_eq!(hzb_dimensions(1920, 1080), (1024, 1024));
        assert_eq!(hzb_dimensions(1024, 512), (512, 256));
        assert_eq!(hzb_dimensions(1, 1), (1, 1));
    }

    #[test]
    fn mip_count_is_floor_log2() {
        assert_eq!(hzb_mip_count(1024, 1024), 10);
        assert_eq!(hzb_mip_count(512, 256), 9);
        assert_eq!(hzb_mip_count(1, 1), 1);
    }

    #[test]
    fn spd_setup_covers_the_rect() {
        let setup = spd_setup([0, 0, 1024, 1024], 9);
        assert_eq!(setup.dispatch, (16, 16));
        assert_eq!(setup.workgroup_offset, (0, 0));
        assert_eq!(setup.num_workgroups, 256);

        let offset = spd_setup([64, 128, 256, 64], 5);
        assert_eq!(setup.mips, 9);
        assert_eq!(offset.workgroup_offset, (1, 2));
        assert_eq!(offset.dispatch, (4, 1));
    }
}
