//! Render Graph
//!
//! The frame-level scheduler: user code declares virtual resources and
//! passes; compile culls dead work, infers lifetimes and usage, places
//! transients into aliased heap memory and records state transitions;
//! execute records command lists (in parallel) and submits them in
//! declaration order.
//!
//! # Ordering & Determinism
//!
//! Submission order equals declaration order. Parallelism exists only in
//! command-list recording; GPU-observable ordering is preserved by
//! sequential submission on a single queue.
//!
//! # Failure Model
//!
//! Double-writing a resource in one pass, combining a write with another
//! state, exporting two resources into one slot, or accessing an undeclared
//! resource from a callback are programming errors and assert.

pub mod allocator;
pub mod blackboard;
pub mod graph;
pub mod pass;
pub mod pool;
pub mod resources;

pub use allocator::{PlacementInfo, RGResourceAllocator};
pub use blackboard::RGBlackboard;
pub use graph::{
    add_copy_pass, create_persistent_buffer, create_persistent_texture, do_upload, RGGraph,
    RGGraphOptions, RGGraphScope, RGPassBuilder,
};
pub use pass::{
    PassCallback, RGPass, RGPassFlags, RGResources, ResourceTransition, MAX_PASS_CALLBACK_SIZE,
};
pub use pool::RGResourcePool;
pub use resources::{
    BufferSlot, Lifetime, MemoryRange, RGBufferHandle, RGPassId, RGResource, RGResourceDesc,
    RGResourceId, RGResourceType, RGTextureHandle, TextureSlot,
};
