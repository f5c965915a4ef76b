//! Render Graph Tests
//!
//! Tests for:
//! - Single-pass record/compile/execute with import + export
//! - Dead-branch culling and never-cull liveness
//! - Pass access invariants (write exclusivity, duplicate exports)
//! - Command-list grouping
//! - State persistence across frames (no-leak)
//! - Idempotent compilation

use argus::graph::{RGGraph, RGGraphOptions, RGPassFlags, RGPassId, RGResourceAllocator};
use argus::rhi::{
    GraphicsDevice, RenderPassColorFlags, ResourceFormat, ResourceState, TextureDesc, TextureFlags,
};
use argus::BufferDesc;

fn single_threaded() -> RGGraphOptions {
    RGGraphOptions {
        single_thread: true,
        ..RGGraphOptions::default()
    }
}

fn live_pass_names(graph: &RGGraph<'_>) -> Vec<String> {
    (0..graph.pass_count())
        .map(|i| graph.pass(RGPassId::new(i)))
        .filter(|p| !p.is_culled())
        .map(|p| p.name().to_string())
        .collect()
}

// ============================================================================
// Single-Pass Graph (import → render target → export)
// ============================================================================

#[test]
fn single_pass_graph_executes_and_exports() {
    let device = GraphicsDevice::new();
    let mut allocator = RGResourceAllocator::new();

    let physical = device.create_texture(
        &TextureDesc::render_target(256, 256, ResourceFormat::RGBA8Unorm),
        "Target",
    );
    let mut slot = None;

    let mut graph = RGGraph::new();
    let target = graph.import_texture(&physical);
    let _ = graph
        .add_pass("Draw", RGPassFlags::RASTER)
        .render_target(target, RenderPassColorFlags::CLEAR)
        .bind(|_context, _resources| {});
    graph.export_texture(target, &mut slot, TextureFlags::NONE);

    graph.compile(&device, &mut allocator, single_threaded());

    assert_eq!(
        live_pass_names(&graph),
        vec!["Draw"],
        "The single pass must survive culling"
    );
    let pass = graph.pass(RGPassId::new(0));
    assert_eq!(pass.transitions().len(), 1, "Exactly one transition expected");
    let transition = pass.transitions()[0];
    assert_eq!(transition.before, ResourceState::COMMON);
    assert_eq!(transition.after, ResourceState::RENDER_TARGET);
    assert_eq!(graph.execute_groups().len(), 1, "One execute group expected");

    graph.execute(&device);

    let exported = slot.expect("Export must fill the slot");
    assert!(
        argus::rhi::Ref::ptr_eq(&exported, &physical),
        "Exported slot must hold the imported physical texture"
    );
    assert_eq!(device.graphics_queue().submitted_list_count(), 1);
}

// ============================================================================
// Dead-Branch Culling
// ============================================================================

#[test]
fn dead_branch_is_culled_and_never_allocated() {
    let device = GraphicsDevice::new();
    let mut allocator = RGResourceAllocator::new();
    let mut slot = None;

    let mut graph = RGGraph::new();
    let x = graph.create_buffer("X", BufferDesc::structured(128, 4));
    let y = graph.create_buffer("Y", BufferDesc::structured(128, 4));

    let _ = graph
        .add_pass("A", RGPassFlags::COMPUTE)
        .write(&[x.into()])
        .bind(|_, _| {});
    // Read-modify-write stages access the chain through UAV writes.
    let _ = graph.add_pass("B", RGPassFlags::COMPUTE).write(&[x.into()]);
    let _ = graph
        .add_pass("C", RGPassFlags::COMPUTE)
        .write(&[x.into()])
        .bind(|_, _| {});
    // D writes an output nothing consumes.
    let _ = graph
        .add_pass("D", RGPassFlags::COMPUTE)
        .write(&[y.into()])
        .bind(|_, _| {});

    graph.export_buffer(x, &mut slot, argus::rhi::BufferFlags::NONE);
    graph.compile(&device, &mut allocator, single_threaded());

    assert_eq!(live_pass_names(&graph), vec!["A", "B", "C"], "D must be culled");
    assert!(
        !graph.resource(y.into()).is_allocated(),
        "A culled branch's resource must never be allocated"
    );
    assert_eq!(graph.execute_groups().len(), 1);

    graph.execute(&device);
    assert_eq!(device.graphics_queue().submitted_list_count(), 1);
}

#[test]
fn never_cull_pass_stays_live_without_consumers() {
    let device = GraphicsDevice::new();
    let mut allocator = RGResourceAllocator::new();

    let mut graph = RGGraph::new();
    let scratch = graph.create_buffer("Scratch", BufferDesc::structured(16, 4));
    let _ = graph
        .add_pass("Orphan", RGPassFlags::COMPUTE)
        .write(&[scratch.into()])
        .bind(|_, _| {});
    let _ = graph
        .add_pass("Pinned", RGPassFlags::COMPUTE | RGPassFlags::NEVER_CULL)
        .bind(|_, _| {});

    graph.compile(&device, &mut allocator, single_threaded());
    assert_eq!(live_pass_names(&graph), vec!["Pinned"]);
}

#[test]
fn cull_chain_keeps_transitive_dependencies() {
    let device = GraphicsDevice::new();
    let mut allocator = RGResourceAllocator::new();

    let mut graph = RGGraph::new();
    let a = graph.create_buffer("A", BufferDesc::structured(16, 4));
    let b = graph.create_buffer("B", BufferDesc::structured(16, 4));

    let _ = graph
        .add_pass("Producer", RGPassFlags::COMPUTE)
        .write(&[a.into()])
        .bind(|_, _| {});
    let _ = graph
        .add_pass("Middle", RGPassFlags::COMPUTE)
        .read(&[a.into()])
        .write(&[b.into()])
        .bind(|_, _| {});
    let _ = graph
        .add_pass("Consumer", RGPassFlags::COMPUTE | RGPassFlags::NEVER_CULL)
        .read(&[b.into()])
        .bind(|_, _| {});

    graph.compile(&device, &mut allocator, single_threaded());
    assert_eq!(
        live_pass_names(&graph),
        vec!["Producer", "Middle", "Consumer"],
        "Liveness must flow through pass dependencies"
    );
}

// ============================================================================
// Access Invariants
// ============================================================================

#[test]
#[should_panic(expected = "write state")]
fn write_combined_with_read_in_one_pass_panics() {
    let mut graph = RGGraph::new();
    let buffer = graph.create_buffer("B", BufferDesc::structured(16, 4));
    let _ = graph
        .add_pass("Bad", RGPassFlags::COMPUTE)
        .write(&[buffer.into()])
        .read(&[buffer.into()]);
}

#[test]
#[should_panic(expected = "without declaring it")]
fn callback_access_without_declaration_panics() {
    let device = GraphicsDevice::new();
    let mut allocator = RGResourceAllocator::new();

    let mut graph = RGGraph::new();
    let declared = graph.create_buffer("Declared", BufferDesc::structured(16, 4));
    let undeclared = graph.create_buffer("Undeclared", BufferDesc::structured(16, 4));

    let _ = graph
        .add_pass("Sneaky", RGPassFlags::COMPUTE | RGPassFlags::NEVER_CULL)
        .write(&[declared.into()])
        .bind(move |_context, resources| {
            let _ = resources.get_buffer(undeclared);
        });
    // Keep the undeclared resource alive so the panic comes from the access
    // check, not a missing allocation.
    let _ = graph
        .add_pass("Toucher", RGPassFlags::COMPUTE | RGPassFlags::NEVER_CULL)
        .write(&[undeclared.into()])
        .bind(|_, _| {});

    graph.compile(&device, &mut allocator, single_threaded());
    graph.execute(&device);
}

// ============================================================================
// Command-List Grouping
// ============================================================================

#[test]
fn passes_partition_into_bounded_groups() {
    let device = GraphicsDevice::new();
    let mut allocator = RGResourceAllocator::new();

    let mut graph = RGGraph::new();
    let buffer = graph.create_buffer("Chain", BufferDesc::structured(16, 4));
    for i in 0..25 {
        let _ = graph
            .add_pass(&format!("Pass {i}"), RGPassFlags::COMPUTE | RGPassFlags::NEVER_CULL)
            .write(&[buffer.into()])
            .bind(|_, _| {});
    }

    graph.compile(&device, &mut allocator, single_threaded());
    assert_eq!(
        graph.execute_groups().len(),
        3,
        "25 passes at group size 10 must form 3 command lists"
    );
    for group in graph.execute_groups() {
        assert!(group.end - group.start <= 10);
    }

    graph.execute(&device);
    assert_eq!(device.graphics_queue().submitted_list_count(), 3);
}

#[test]
fn jobify_disabled_records_one_list() {
    let device = GraphicsDevice::new();
    let mut allocator = RGResourceAllocator::new();

    let mut graph = RGGraph::new();
    let buffer = graph.create_buffer("Chain", BufferDesc::structured(16, 4));
    for i in 0..25 {
        let _ = graph
            .add_pass(&format!("Pass {i}"), RGPassFlags::COMPUTE | RGPassFlags::NEVER_CULL)
            .write(&[buffer.into()])
            .bind(|_, _| {});
    }

    let options = RGGraphOptions {
        jobify: false,
        single_thread: true,
        ..RGGraphOptions::default()
    };
    graph.compile(&device, &mut allocator, options);
    assert_eq!(graph.execute_groups().len(), 1);
}

#[test]
fn parallel_recording_preserves_submission_order() {
    let device = GraphicsDevice::new();
    let mut allocator = RGResourceAllocator::new();

    let mut graph = RGGraph::new();
    let buffer = graph.create_buffer("Chain", BufferDesc::structured(16, 4));
    for i in 0..32 {
        let _ = graph
            .add_pass(&format!("Pass {i}"), RGPassFlags::COMPUTE | RGPassFlags::NEVER_CULL)
            .write(&[buffer.into()])
            .bind(|_, _| {});
    }

    // Default options: recording happens on the worker pool.
    graph.compile(&device, &mut allocator, RGGraphOptions::default());
    let groups = graph.execute_groups().len();
    graph.execute(&device);
    assert_eq!(device.graphics_queue().submitted_list_count(), groups);
}

// ============================================================================
// State Persistence Across Frames
// ============================================================================

#[test]
fn imported_resource_state_carries_between_frames() {
    let device = GraphicsDevice::new();
    let mut allocator = RGResourceAllocator::new();

    let physical = device.create_buffer(&BufferDesc::structured(64, 4), "Persistent");

    // Frame 1: COMMON → UAV transition expected.
    let mut graph = RGGraph::new();
    let imported = graph.import_buffer(&physical);
    let _ = graph
        .add_pass("Produce", RGPassFlags::COMPUTE | RGPassFlags::NEVER_CULL)
        .write(&[imported.into()])
        .bind(|_, _| {});
    graph.compile(&device, &mut allocator, single_threaded());
    let pass = graph.pass(RGPassId::new(0));
    assert_eq!(pass.transitions().len(), 1);
    assert_eq!(pass.transitions()[0].before, ResourceState::COMMON);
    assert_eq!(pass.transitions()[0].after, ResourceState::UNORDERED_ACCESS);
    graph.execute(&device);
    allocator.tick();

    // Frame 2: the before-state must equal frame 1's final state.
    let mut graph = RGGraph::new();
    let imported = graph.import_buffer(&physical);
    let _ = graph
        .add_pass("Consume", RGPassFlags::COMPUTE | RGPassFlags::NEVER_CULL)
        .read(&[imported.into()])
        .bind(|_, _| {});
    graph.compile(&device, &mut allocator, single_threaded());
    let pass = graph.pass(RGPassId::new(0));
    assert_eq!(pass.transitions().len(), 1);
    assert_eq!(
        pass.transitions()[0].before,
        ResourceState::UNORDERED_ACCESS,
        "Frame 2's before-state must equal frame 1's last transition"
    );
    graph.execute(&device);

    // Frame 3: already readable, no transition.
    let mut graph = RGGraph::new();
    let imported = graph.import_buffer(&physical);
    let _ = graph
        .add_pass("Consume Again", RGPassFlags::COMPUTE | RGPassFlags::NEVER_CULL)
        .read(&[imported.into()])
        .bind(|_, _| {});
    graph.compile(&device, &mut allocator, single_threaded());
    assert!(
        graph.pass(RGPassId::new(0)).transitions().is_empty(),
        "A read of an already-readable resource needs no transition"
    );
}

// ============================================================================
// Idempotent Compilation
// ============================================================================

#[test]
fn identical_graphs_compile_identically() {
    fn build_and_compile(device: &GraphicsDevice) -> (Vec<String>, Vec<(u64, u64)>, usize) {
        let mut allocator = RGResourceAllocator::new();
        let mut graph = RGGraph::new();
        let depth = graph.create_texture(
            "Depth",
            TextureDesc::depth(512, 512, ResourceFormat::D32Float),
        );
        let color = graph.create_texture(
            "Color",
            TextureDesc::render_target(512, 512, ResourceFormat::RGBA16Float),
        );
        let lut = graph.create_buffer("Lut", BufferDesc::structured(1024, 16));

        let _ = graph
            .add_pass("Prepass", RGPassFlags::RASTER | RGPassFlags::NEVER_CULL)
            .depth_stencil(depth, argus::rhi::RenderPassDepthFlags::CLEAR)
            .bind(|_, _| {});
        let _ = graph
            .add_pass("Lut Build", RGPassFlags::COMPUTE)
            .write(&[lut.into()])
            .bind(|_, _| {});
        let _ = graph
            .add_pass("Shade", RGPassFlags::RASTER | RGPassFlags::NEVER_CULL)
            .read(&[lut.into()])
            .render_target(color, RenderPassColorFlags::CLEAR)
            .depth_stencil(
                depth,
                argus::rhi::RenderPassDepthFlags::LOAD | argus::rhi::RenderPassDepthFlags::READ_ONLY,
            )
            .bind(|_, _| {});

        graph.compile(device, &mut allocator, RGGraphOptions {
            single_thread: true,
            ..RGGraphOptions::default()
        });

        let live = live_pass_names(&graph);
        let placements = allocator
            .placements()
            .iter()
            .map(|p| (p.offset, p.size))
            .collect();
        let transitions: usize = (0..graph.pass_count())
            .map(|i| graph.pass(RGPassId::new(i)).transitions().len())
            .sum();
        (live, placements, transitions)
    }

    let device = GraphicsDevice::new();
    let first = build_and_compile(&device);
    let second = build_and_compile(&device);
    assert_eq!(first, second, "Compile must be idempotent in result");
}
