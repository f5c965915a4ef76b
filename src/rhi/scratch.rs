//! Scratch Allocator
//!
//! Per-context linear suballocator over pooled upload pages. Allocations are
//! valid for the lifetime of the command list that made them; at submission
//! the used pages are released back to the shared page pool, keyed by the
//! submission's sync point. Allocation never blocks: an exhausted page simply
//! fetches (or creates) the next one from the pool.

use super::device::GraphicsDevice;
use super::fence::{FencedPool, SyncPoint};
use super::resources::{Buffer, BufferDesc, BufferFlags, Ref};
use super::types::align_up;

/// One linear allocation out of an upload page.
#[derive(Clone, Debug)]
pub struct ScratchAllocation {
    pub backing: Ref<Buffer>,
    pub gpu_address: u64,
    pub offset: u64,
    pub size: u64,
}

impl ScratchAllocation {
    /// Copies a POD value into the mapped allocation.
    pub fn write<T: bytemuck::Pod>(&self, value: &T) {
        let bytes = bytemuck::bytes_of(value);
        debug_assert!(bytes.len() as u64 <= self.size);
        self.backing.write_storage(self.offset, bytes);
    }

    /// Copies a POD slice into the mapped allocation.
    pub fn write_slice<T: bytemuck::Pod>(&self, values: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        debug_assert!(bytes.len() as u64 <= self.size);
        self.backing.write_storage(self.offset, bytes);
    }
}

/// Shared pool of upload pages, reclaimed by sync point.
#[derive(Debug)]
pub struct ScratchAllocationManager {
    page_size: u64,
    flags: BufferFlags,
    pages: FencedPool<Ref<Buffer>>,
}

impl ScratchAllocationManager {
    #[must_use]
    pub fn new(flags: BufferFlags, page_size: u64) -> Self {
        Self {
            page_size,
            flags,
            pages: FencedPool::new(),
        }
    }

    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn allocate_page(&self, device: &GraphicsDevice) -> Ref<Buffer> {
        self.pages.allocate(|| {
            let mut desc = BufferDesc::upload(self.page_size);
            desc.flags |= self.flags;
            device.create_buffer(&desc, "Scratch Page")
        })
    }

    pub fn free_pages(&self, sync_point: &SyncPoint, pages: impl IntoIterator<Item = Ref<Buffer>>) {
        for page in pages {
            self.pages.free(page, sync_point.clone());
        }
    }
}

/// Per-context linear allocator. Single-threaded by construction: each
/// command context owns exactly one.
#[derive(Debug, Default)]
pub struct ScratchAllocator {
    current_page: Option<Ref<Buffer>>,
    current_offset: u64,
    used_pages: Vec<Ref<Buffer>>,
}

impl ScratchAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(
        &mut self,
        device: &GraphicsDevice,
        size: u64,
        alignment: u64,
    ) -> ScratchAllocation {
        let manager = device.scratch_manager();
        debug_assert!(
            size <= manager.page_size(),
            "Scratch allocation of {size} bytes exceeds the page size ({})",
            manager.page_size()
        );

        let offset = align_up(self.current_offset, alignment);
        if self.current_page.is_none() || offset + size > manager.page_size() {
            let page = manager.allocate_page(device);
            if let Some(previous) = self.current_page.replace(page) {
                self.used_pages.push(previous);
            }
            self.current_offset = 0;
        }

        let offset = align_up(self.current_offset, alignment);
        self.current_offset = offset + size;
        let page = self.current_page.as_ref().unwrap().clone();
        let gpu_address = page.gpu_address() + offset;
        ScratchAllocation {
            backing: page,
            gpu_address,
            offset,
            size,
        }
    }

    /// Returns all pages used by this allocator to the shared pool, to be
    /// reclaimed once `sync_point` completes.
    pub fn free(&mut self, device: &GraphicsDevice, sync_point: &SyncPoint) {
        let manager = device.scratch_manager();
        if let Some(page) = self.current_page.take() {
            self.used_pages.push(page);
        }
        manager.free_pages(sync_point, self.used_pages.drain(..));
        self.current_offset = 0;
    }
}
