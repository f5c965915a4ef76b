//! Aliased Heap Allocator
//!
//! Places transient graph resources into aliased regions of large placed-
//! resource heaps. The contract: for any two allocations in a heap,
//! *lifetime ranges overlap ⇒ memory ranges do not overlap*. Placement
//! walks a sorted free-range marker list per heap, reuses cached physical
//! resources created at the same offset with the same description, and
//! retains memory across frames with fixed cleanup latencies.

use crate::rhi::{AnyResource, GraphicsDevice, Heap, Ref};

use super::pool::RGResourcePool;
use super::resources::{Lifetime, MemoryRange, RGResource, RGResourceDesc};

/// Frames a heap may go unused before it is destroyed.
const HEAP_CLEANUP_LATENCY: u32 = 3;
/// Frames a cached physical resource may go unused before it is destroyed.
const RESOURCE_CLEANUP_LATENCY: u32 = 120;
/// Heap sizes are rounded up to this (32 MiB).
const HEAP_ALIGNMENT: u64 = 32 * 1024 * 1024;

/// A physical resource placed in a heap.
#[derive(Debug)]
pub(crate) struct RGPhysicalResource {
    pub name: String,
    pub offset: u64,
    pub size: u64,
    pub lifetime: Lifetime,
    /// Still referenced outside the allocator (e.g. an exported HZB); its
    /// memory band stays occupied for every placement query.
    pub is_external: bool,
    pub last_used_frame: u32,
    pub desc: RGResourceDesc,
    pub resource: AnyResource,
}

impl RGPhysicalResource {
    fn memory_range(&self) -> MemoryRange {
        MemoryRange::new(self.offset, self.offset + self.size)
    }

    /// Whether this physical resource can back `desc` unchanged.
    fn is_compatible(&self, desc: &RGResourceDesc) -> bool {
        match (&self.desc, desc) {
            (RGResourceDesc::Texture(have), RGResourceDesc::Texture(want)) => {
                have.is_compatible(want)
            }
            (RGResourceDesc::Buffer(have), RGResourceDesc::Buffer(want)) => have.is_compatible(want),
            _ => false,
        }
    }
}

/// `(offset, is_free_begin)` marker for the placement sweep.
#[derive(Clone, Copy, Debug)]
struct HeapOffset {
    offset: u64,
    is_free_begin: bool,
}

struct RGHeap {
    heap: Ref<Heap>,
    size: u64,
    allocations: Vec<RGPhysicalResource>,
    resource_cache: Vec<RGPhysicalResource>,
    last_used_frame: u32,
}

impl RGHeap {
    fn new(device: &GraphicsDevice, size: u64) -> Self {
        let size = crate::rhi::align_up(size, HEAP_ALIGNMENT);
        Self {
            heap: device.create_heap(size),
            size,
            allocations: Vec::new(),
            resource_cache: Vec::new(),
            last_used_frame: 0,
        }
    }

    /// Tries to place `resource` in this heap without violating the
    /// lifetime/memory non-overlap invariant. Binds the physical resource
    /// on success.
    fn try_allocate(
        &mut self,
        device: &GraphicsDevice,
        frame_index: u32,
        resource: &mut RGResource,
    ) -> bool {
        if resource.size > self.size {
            return false;
        }

        // Shrink bias: leave a much-too-large empty heap alone so it has a
        // chance to be released.
        if self.allocations.is_empty()
            && crate::rhi::align_up(resource.size, HEAP_ALIGNMENT) < self.size
        {
            return false;
        }

        let lifetime = resource.lifetime_actual();

        // Build the free-range markup: start of heap opens a free range,
        // every allocation whose lifetime overlaps contributes an occupied
        // band, end of heap closes the last range.
        let mut free_ranges: Vec<HeapOffset> = Vec::with_capacity(self.allocations.len() * 2 + 2);
        free_ranges.push(HeapOffset {
            offset: 0,
            is_free_begin: true,
        });
        for allocation in &self.allocations {
            if allocation.lifetime.overlaps(&lifetime) || allocation.is_external {
                free_ranges.push(HeapOffset {
                    offset: allocation.offset,
                    is_free_begin: false,
                });
                free_ranges.push(HeapOffset {
                    offset: allocation.offset + allocation.size,
                    is_free_begin: true,
                });
            }
        }
        free_ranges.push(HeapOffset {
            offset: self.size,
            is_free_begin: false,
        });
        // At equal offsets, close ranges before opening new ones so abutting
        // bands don't produce a phantom free range.
        free_ranges.sort_unstable_by_key(|marker| (marker.offset, marker.is_free_begin));

        // Sweep with an open-range counter; a decrement to zero closes a
        // fully free region.
        let mut open_ranges = 0i32;
        let mut last_begin = 0u64;
        for marker in free_ranges {
            if marker.is_free_begin {
                last_begin = marker.offset;
                open_ranges += 1;
            } else {
                open_ranges -= 1;
                if open_ranges == 0 {
                    let aligned_offset = crate::rhi::align_up(last_begin, resource.alignment);
                    if aligned_offset + resource.size <= marker.offset {
                        self.place(device, frame_index, resource, aligned_offset);
                        return true;
                    }
                }
            }
        }
        false
    }

    fn place(
        &mut self,
        device: &GraphicsDevice,
        frame_index: u32,
        resource: &mut RGResource,
        offset: u64,
    ) {
        debug_assert!(offset + resource.size <= self.size);
        debug_assert!(offset % resource.alignment == 0);
        self.last_used_frame = frame_index;

        // Reuse an identical cached physical resource at the same offset.
        let cached = self
            .resource_cache
            .iter()
            .position(|entry| entry.offset == offset && entry.is_compatible(&resource.desc));

        let mut physical = match cached {
            Some(index) => self.resource_cache.swap_remove(index),
            None => {
                let any = match &resource.desc {
                    RGResourceDesc::Texture(desc) => AnyResource::Texture(
                        device.create_texture_placed(desc, &self.heap, offset, &resource.name),
                    ),
                    RGResourceDesc::Buffer(desc) => AnyResource::Buffer(
                        device.create_buffer_placed(desc, &self.heap, offset, &resource.name),
                    ),
                };
                RGPhysicalResource {
                    name: resource.name.clone(),
                    offset,
                    size: resource.size,
                    lifetime: Lifetime::default(),
                    is_external: false,
                    last_used_frame: frame_index,
                    desc: resource.desc.clone(),
                    resource: any,
                }
            }
        };

        physical.last_used_frame = frame_index;
        physical.lifetime = resource.lifetime_actual();
        if physical.name != resource.name {
            physical.name = resource.name.clone();
            physical.resource.set_name(&resource.name);
        }
        resource.physical = Some(physical.resource.clone());
        self.allocations.push(physical);

        log::trace!(
            "Placed '{}' at [{}..{}] (lifetime [{}, {}))",
            resource.name,
            offset,
            offset + resource.size,
            resource.lifetime_actual().begin,
            resource.lifetime_actual().end
        );
    }

    /// A heap is destroyable once it has been unused for the cleanup
    /// latency and holds no externally referenced resources.
    fn is_unused(&self, frame_index: u32) -> bool {
        self.last_used_frame + HEAP_CLEANUP_LATENCY < frame_index
            && self
                .allocations
                .iter()
                .all(|allocation| allocation.resource.external_ref_count() == 0)
    }

    /// Returns allocations whose external refcount dropped to zero to the
    /// per-heap cache, and expires cache entries past the latency.
    fn free_unused(&mut self, frame_index: u32) {
        let mut index = 0;
        while index < self.allocations.len() {
            let external = self.allocations[index].resource.external_ref_count() > 0;
            self.allocations[index].is_external = external;
            if external {
                index += 1;
            } else {
                let released = self.allocations.swap_remove(index);
                self.resource_cache.push(released);
            }
        }
        self.resource_cache
            .retain(|entry| entry.last_used_frame + RESOURCE_CLEANUP_LATENCY >= frame_index);
    }
}

/// A placed allocation, reported for inspection and validation.
#[derive(Clone, Debug)]
pub struct PlacementInfo {
    pub heap_index: usize,
    pub heap_size: u64,
    pub offset: u64,
    pub size: u64,
    pub lifetime: Lifetime,
    pub name: String,
    pub is_external: bool,
}

/// The graph's transient-memory allocator. Owns the placed-resource heaps
/// and the non-aliased fallback pool; persistent across frames.
#[derive(Default)]
pub struct RGResourceAllocator {
    heaps: Vec<RGHeap>,
    pool: RGResourcePool,
    frame_index: u32,
}

impl RGResourceAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a physical resource to every live virtual resource.
    ///
    /// Aliasing path: sort by `(exported desc, size desc, alignment desc,
    /// id asc)` — exported-first placement reduces fragmentation because
    /// exported resources live at the graph boundary — then first-fit into
    /// size-sorted heaps, creating a new heap when none fits.
    pub(crate) fn allocate_resources(
        &mut self,
        device: &GraphicsDevice,
        resources: &mut [RGResource],
        use_aliasing: bool,
    ) {
        // Size/alignment requirements from the device.
        for resource in resources.iter_mut() {
            if !resource.first_access.is_valid() {
                continue;
            }
            let (size, alignment) = match &resource.desc {
                RGResourceDesc::Texture(desc) => device.texture_allocation_info(desc),
                RGResourceDesc::Buffer(desc) => device.buffer_allocation_info(desc),
            };
            resource.size = size;
            resource.alignment = alignment;
        }

        // Imported resources that this allocator placed in an earlier frame
        // get their lifetime recorded so others may alias around them.
        for resource in resources.iter_mut() {
            if resource.imported && resource.first_access.is_valid() {
                let physical = resource.physical.as_ref().unwrap();
                let lifetime = resource.lifetime_actual();
                for heap in &mut self.heaps {
                    if let Some(allocation) = heap
                        .allocations
                        .iter_mut()
                        .find(|allocation| allocation.resource.same_resource(physical))
                    {
                        allocation.lifetime = lifetime;
                        allocation.last_used_frame = self.frame_index;
                    }
                }
            }
        }

        if !use_aliasing {
            for resource in resources.iter_mut() {
                if resource.first_access.is_valid() && !resource.is_allocated() {
                    resource.physical = Some(match &resource.desc {
                        RGResourceDesc::Texture(desc) => AnyResource::Texture(
                            self.pool.allocate_texture(device, &resource.name, desc),
                        ),
                        RGResourceDesc::Buffer(desc) => AnyResource::Buffer(
                            self.pool.allocate_buffer(device, &resource.name, desc),
                        ),
                    });
                }
            }
            return;
        }

        // Exported first, then largest size, largest alignment, stable id.
        let mut order: Vec<usize> = (0..resources.len())
            .filter(|&index| {
                resources[index].first_access.is_valid() && !resources[index].is_allocated()
            })
            .collect();
        order.sort_unstable_by(|&a, &b| {
            let ra = &resources[a];
            let rb = &resources[b];
            rb.exported
                .cmp(&ra.exported)
                .then(rb.size.cmp(&ra.size))
                .then(rb.alignment.cmp(&ra.alignment))
                .then(ra.id.index().cmp(&rb.id.index()))
        });

        // Largest heaps first so undersized heaps drain and expire.
        self.heaps.sort_by(|a, b| b.size.cmp(&a.size));

        for index in order {
            let resource = &mut resources[index];
            debug_assert!(resource.size != 0);

            let mut placed = false;
            for heap in &mut self.heaps {
                // Heaps are size-sorted: once one is too small, all are.
                if resource.size > heap.size {
                    break;
                }
                if heap.try_allocate(device, self.frame_index, resource) {
                    placed = true;
                    break;
                }
            }

            if !placed {
                let mut heap = RGHeap::new(device, resource.size);
                heap.last_used_frame = self.frame_index;
                let ok = heap.try_allocate(device, self.frame_index, resource);
                assert!(ok, "Failed to place '{}' into a fresh heap", resource.name);
                self.heaps.push(heap);
            }
        }

        #[cfg(debug_assertions)]
        self.validate();
    }

    /// End-of-frame retention sweep: drop unused heaps, recycle unreferenced
    /// allocations, expire stale cache entries.
    pub fn tick(&mut self) {
        let frame = self.frame_index;
        self.heaps.retain(|heap| !heap.is_unused(frame));
        for heap in &mut self.heaps {
            heap.free_unused(frame);
        }
        self.pool.tick();
        self.frame_index += 1;
    }

    #[must_use]
    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    #[must_use]
    pub fn total_heap_size(&self) -> u64 {
        self.heaps.iter().map(|heap| heap.size).sum()
    }

    #[must_use]
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Every current allocation across all heaps.
    #[must_use]
    pub fn placements(&self) -> Vec<PlacementInfo> {
        self.heaps
            .iter()
            .enumerate()
            .flat_map(|(heap_index, heap)| {
                heap.allocations.iter().map(move |allocation| PlacementInfo {
                    heap_index,
                    heap_size: heap.size,
                    offset: allocation.offset,
                    size: allocation.size,
                    lifetime: allocation.lifetime,
                    name: allocation.name.clone(),
                    is_external: allocation.is_external,
                })
            })
            .collect()
    }

    /// Lifetime ∧ memory overlap across any allocation pair is a placement
    /// bug; checked after every compile in debug builds.
    #[cfg(debug_assertions)]
    fn validate(&self) {
        for heap in &self.heaps {
            for (index, a) in heap.allocations.iter().enumerate() {
                for b in &heap.allocations[index + 1..] {
                    assert!(
                        !(a.lifetime.overlaps(&b.lifetime)
                            && a.memory_range().overlaps(&b.memory_range())),
                        "Resource '{}' (lifetime [{}, {}), memory [{}, {})) overlaps '{}' (lifetime [{}, {}), memory [{}, {}))",
                        a.name,
                        a.lifetime.begin,
                        a.lifetime.end,
                        a.memory_range().begin,
                        a.memory_range().end,
                        b.name,
                        b.lifetime.begin,
                        b.lifetime.end,
                        b.memory_range().begin,
                        b.memory_range().end,
                    );
                }
            }
        }
    }
}
