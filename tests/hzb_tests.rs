//! HZB Builder Tests
//!
//! Tests for:
//! - Pyramid dimension and mip-count math
//! - SPD dispatch setup
//! - Reverse-Z min-reduction monotonicity (property)
//! - Pass recording through the render graph

use argus::graph::{RGGraph, RGGraphOptions, RGPassFlags, RGPassId, RGResourceAllocator};
use argus::rhi::{GraphicsCommon, GraphicsDevice, RenderPassDepthFlags, ResourceFormat, TextureDesc};
use argus::techniques::hzb::{self, reference, HzbBuilder};

fn single_threaded() -> RGGraphOptions {
    RGGraphOptions {
        single_thread: true,
        ..RGGraphOptions::default()
    }
}

// ============================================================================
// Dimension Math
// ============================================================================

#[test]
fn hzb_is_half_the_next_power_of_two() {
    assert_eq!(hzb::hzb_dimensions(1920, 1080), (1024, 1024));
    assert_eq!(hzb::hzb_dimensions(2048, 2048), (1024, 1024));
    assert_eq!(hzb::hzb_dimensions(800, 600), (512, 512));
    assert_eq!(hzb::hzb_dimensions(2, 2), (1, 1));
}

#[test]
fn mip_count_covers_the_pyramid() {
    let (w, h) = hzb::hzb_dimensions(1920, 1080);
    let mips = hzb::hzb_mip_count(w, h);
    assert_eq!(mips, 10);
    // The smallest mip must reach 1×1.
    assert_eq!((w >> (mips - 1)).max(1), 2);
    assert_eq!((w >> mips).max(1), 1);
}

#[test]
fn spd_setup_matches_tile_math() {
    let setup = hzb::spd_setup([0, 0, 1024, 512], 9);
    assert_eq!(setup.dispatch, (16, 8));
    assert_eq!(setup.num_workgroups, 128);
    assert_eq!(setup.workgroup_offset, (0, 0));
    assert_eq!(setup.mips, 9);
}

// ============================================================================
// Reduction Properties (reverse-Z: min keeps the farthest depth)
// ============================================================================

fn pseudo_random_depth(count: usize, seed: u64) -> Vec<f32> {
    let mut state = seed;
    (0..count)
        .map(|_| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            ((state >> 40) & 0xFFFF) as f32 / 65535.0
        })
        .collect()
}

#[test]
fn each_mip_is_the_min_of_its_parents() {
    let width = 64u32;
    let height = 32u32;
    let mip0: Vec<f32> = pseudo_random_depth((width * height) as usize, 7)
        .iter()
        .map(|&d| reference::quantize_r16(d))
        .collect();

    let pyramid = reference::build_pyramid(mip0, width, height);
    for level in 1..pyramid.len() {
        let (parent, pw, ph) = (&pyramid[level - 1].0, pyramid[level - 1].1, pyramid[level - 1].2);
        let (child, cw, ch) = (&pyramid[level].0, pyramid[level].1, pyramid[level].2);
        for y in 0..ch {
            for x in 0..cw {
                let expected = {
                    let x0 = (x * 2).min(pw - 1);
                    let x1 = (x * 2 + 1).min(pw - 1);
                    let y0 = (y * 2).min(ph - 1);
                    let y1 = (y * 2 + 1).min(ph - 1);
                    parent[(y0 * pw + x0) as usize]
                        .min(parent[(y0 * pw + x1) as usize])
                        .min(parent[(y1 * pw + x0) as usize])
                        .min(parent[(y1 * pw + x1) as usize])
                };
                let actual = child[(y * cw + x) as usize];
                assert_eq!(
                    actual, expected,
                    "Mip {level} texel ({x}, {y}) must be the min of its 2×2 parents"
                );
            }
        }
    }
}

#[test]
fn pyramid_top_is_the_global_minimum() {
    let width = 128u32;
    let height = 128u32;
    let depth = pseudo_random_depth((width * height) as usize, 99);
    let global_min = depth.iter().copied().fold(f32::MAX, f32::min);

    let mip0 = reference::init_from_depth(&depth, width, height, width / 2, height / 2);
    let pyramid = reference::build_pyramid(mip0, width / 2, height / 2);
    let top = &pyramid.last().unwrap().0;
    assert_eq!(top.len(), 1);
    assert_eq!(
        top[0],
        reference::quantize_r16(global_min),
        "The 1×1 mip must hold the scene's farthest depth"
    );
}

#[test]
fn init_covers_every_depth_texel() {
    // Non-pow2 depth into a pow2/2 pyramid footprint: every depth texel
    // must influence exactly the hzb texel whose footprint contains it, so
    // a single far outlier must survive into the reduction.
    let width = 100u32;
    let height = 60u32;
    let mut depth = vec![0.8f32; (width * height) as usize];
    depth[(37 * width + 71) as usize] = 0.05;

    let (hw, hh) = hzb::hzb_dimensions(width, height);
    let mip0 = reference::init_from_depth(&depth, width, height, hw, hh);
    let min = mip0.iter().copied().fold(f32::MAX, f32::min);
    assert_eq!(min, reference::quantize_r16(0.05));
}

// ============================================================================
// Graph Recording
// ============================================================================

#[test]
fn hzb_build_records_init_and_reduce_passes() {
    let device = GraphicsDevice::new();
    let common = GraphicsCommon::new(&device);
    let mut allocator = RGResourceAllocator::new();
    let builder = HzbBuilder::new(&device, &common).expect("HZB pipelines must compile");

    // Keep the HZB alive so the passes survive culling. The slot outlives
    // the graph that borrows it.
    let mut slot = None;

    let mut graph = RGGraph::new();
    let depth = graph.create_texture(
        "Depth",
        TextureDesc::depth(1920, 1080, ResourceFormat::D32Float),
    );
    let _ = graph
        .add_pass("Depth Prepass", RGPassFlags::RASTER | RGPassFlags::NEVER_CULL)
        .depth_stencil(depth, RenderPassDepthFlags::CLEAR)
        .bind(|_, _| {});

    let hzb = builder.init_hzb(&mut graph, (1920, 1080));
    builder.build(&mut graph, depth, hzb);
    graph.export_texture(hzb, &mut slot, argus::rhi::TextureFlags::NONE);

    graph.compile(&device, &mut allocator, single_threaded());

    let names: Vec<String> = (0..graph.pass_count())
        .map(|i| graph.pass(RGPassId::new(i)))
        .filter(|p| !p.is_culled())
        .map(|p| p.name().to_string())
        .collect();
    assert_eq!(names, vec!["Depth Prepass", "HZB Create", "HZB Mips"]);

    let hzb_desc = *graph.resource(hzb.into()).desc().as_texture().unwrap();
    assert_eq!(hzb_desc.size_2d(), (1024, 1024));
    assert_eq!(hzb_desc.mips, 10);
    assert_eq!(hzb_desc.format, ResourceFormat::R16Float);

    graph.execute(&device);
    assert!(slot.is_some(), "The HZB must persist outside the graph");
}
