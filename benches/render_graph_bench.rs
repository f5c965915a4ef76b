//! Render graph record + compile benchmark.
//!
//! Measures the per-frame CPU cost of declaring and compiling a frame-sized
//! graph (~30 passes, ~20 transient resources) against a warm allocator.

use criterion::{criterion_group, criterion_main, Criterion};

use argus::graph::{RGGraph, RGGraphOptions, RGPassFlags, RGResourceAllocator};
use argus::rhi::{
    BufferDesc, GraphicsDevice, RenderPassColorFlags, RenderPassDepthFlags, ResourceFormat,
    TextureDesc,
};

fn record_frame(graph: &mut RGGraph<'_>) {
    let depth = graph.create_texture(
        "Depth",
        TextureDesc::depth(1920, 1080, ResourceFormat::D32Float),
    );
    let color = graph.create_texture(
        "Color",
        TextureDesc::render_target(1920, 1080, ResourceFormat::RGBA16Float),
    );

    let _ = graph
        .add_pass("Depth Prepass", RGPassFlags::RASTER | RGPassFlags::NEVER_CULL)
        .depth_stencil(depth, RenderPassDepthFlags::CLEAR)
        .bind(|_, _| {});

    // A chain of compute stages with ping-ponged transients.
    let mut previous = None;
    for i in 0..24 {
        let buffer = graph.create_buffer(&format!("Stage {i}"), BufferDesc::structured(4096, 16));
        let mut pass = graph
            .add_pass(&format!("Compute {i}"), RGPassFlags::COMPUTE)
            .write(&[buffer.into()]);
        if let Some(previous) = previous {
            pass = pass.read(&[previous]);
        }
        let _ = pass.bind(|_, _| {});
        previous = Some(buffer.into());
    }

    let mut shade = graph
        .add_pass("Shade", RGPassFlags::RASTER | RGPassFlags::NEVER_CULL)
        .render_target(color, RenderPassColorFlags::CLEAR)
        .depth_stencil(depth, RenderPassDepthFlags::LOAD | RenderPassDepthFlags::READ_ONLY);
    if let Some(previous) = previous {
        shade = shade.read(&[previous]);
    }
    let _ = shade.bind(|_, _| {});
}

fn bench_record_and_compile(c: &mut Criterion) {
    let device = GraphicsDevice::new();
    let options = RGGraphOptions {
        single_thread: true,
        ..RGGraphOptions::default()
    };

    c.bench_function("record_frame", |b| {
        b.iter(|| {
            let mut graph = RGGraph::new();
            record_frame(&mut graph);
            std::hint::black_box(graph.pass_count())
        });
    });

    c.bench_function("record_and_compile_frame", |b| {
        // Warm allocator: heaps and cached placements persist across
        // iterations, matching steady-state frames.
        let mut allocator = RGResourceAllocator::new();
        b.iter(|| {
            let mut graph = RGGraph::new();
            record_frame(&mut graph);
            graph.compile(&device, &mut allocator, options);
            allocator.tick();
            std::hint::black_box(graph.execute_groups().len())
        });
    });
}

criterion_group!(benches, bench_record_and_compile);
criterion_main!(benches);
