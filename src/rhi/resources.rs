//! Physical Resources
//!
//! Buffers, textures and the heaps placed resources live in. Resources are
//! shared through [`Ref<T>`]; the strong count doubles as the "external
//! reference" signal the transient allocators use to decide when a pooled
//! resource may be recycled.

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use super::types::{ResourceFormat, ResourceState, ALL_SUBRESOURCES};

// ─── Shared handle ────────────────────────────────────────────────────────────

/// Shared, reference-counted handle to a device object.
#[derive(Debug, Default)]
pub struct Ref<T>(Arc<T>);

impl<T> Ref<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Number of live handles to this object. The resource pools treat a
    /// count of one (only the pool itself) as "free to recycle".
    #[must_use]
    pub fn ref_count(this: &Self) -> usize {
        Arc::strong_count(&this.0)
    }

    /// Identity comparison (same underlying allocation).
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> std::ops::Deref for Ref<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

// ─── Descriptors ──────────────────────────────────────────────────────────────

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct BufferFlags: u32 {
        const NONE                   = 0;
        const UNORDERED_ACCESS       = 1 << 0;
        const SHADER_RESOURCE        = 1 << 1;
        const INDIRECT_ARGUMENTS     = 1 << 2;
        const BYTE_ADDRESS           = 1 << 3;
        const STRUCTURED             = 1 << 4;
        const UPLOAD                 = 1 << 5;
        const READBACK               = 1 << 6;
        const ACCELERATION_STRUCTURE = 1 << 7;
        const NO_BINDLESS            = 1 << 8;
    }
}

/// Description of a buffer resource.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BufferDesc {
    pub size: u64,
    pub element_size: u32,
    pub format: ResourceFormat,
    pub flags: BufferFlags,
}

impl BufferDesc {
    #[must_use]
    pub fn structured(element_count: u32, element_size: u32) -> Self {
        Self {
            size: u64::from(element_count) * u64::from(element_size),
            element_size,
            format: ResourceFormat::Unknown,
            flags: BufferFlags::STRUCTURED | BufferFlags::SHADER_RESOURCE,
        }
    }

    #[must_use]
    pub fn structured_with_flags(element_count: u32, element_size: u32, flags: BufferFlags) -> Self {
        Self {
            flags: flags | BufferFlags::STRUCTURED,
            ..Self::structured(element_count, element_size)
        }
    }

    #[must_use]
    pub fn typed(element_count: u32, format: ResourceFormat) -> Self {
        Self {
            size: u64::from(element_count) * u64::from(format.bytes_per_texel()),
            element_size: format.bytes_per_texel(),
            format,
            flags: BufferFlags::SHADER_RESOURCE,
        }
    }

    #[must_use]
    pub fn byte_address(size: u64, flags: BufferFlags) -> Self {
        Self {
            size,
            element_size: 4,
            format: ResourceFormat::Unknown,
            flags: flags | BufferFlags::BYTE_ADDRESS,
        }
    }

    /// Buffer holding `count` indirect argument records of type `T`.
    #[must_use]
    pub fn indirect_arguments<T: bytemuck::Pod>(count: u32) -> Self {
        let stride = std::mem::size_of::<T>() as u32;
        Self {
            size: u64::from(count) * u64::from(stride),
            element_size: stride,
            format: ResourceFormat::Unknown,
            flags: BufferFlags::INDIRECT_ARGUMENTS | BufferFlags::UNORDERED_ACCESS,
        }
    }

    #[must_use]
    pub fn upload(size: u64) -> Self {
        Self {
            size,
            element_size: 1,
            format: ResourceFormat::Unknown,
            flags: BufferFlags::UPLOAD | BufferFlags::NO_BINDLESS,
        }
    }

    #[must_use]
    pub fn readback(size: u64) -> Self {
        Self {
            size,
            element_size: 1,
            format: ResourceFormat::Unknown,
            flags: BufferFlags::READBACK | BufferFlags::NO_BINDLESS,
        }
    }

    #[must_use]
    pub fn blas(size: u64) -> Self {
        Self {
            size,
            element_size: 1,
            format: ResourceFormat::Unknown,
            flags: BufferFlags::ACCELERATION_STRUCTURE | BufferFlags::UNORDERED_ACCESS,
        }
    }

    #[must_use]
    pub fn tlas(size: u64) -> Self {
        Self::blas(size)
    }

    #[must_use]
    pub fn element_count(&self) -> u32 {
        if self.element_size == 0 {
            0
        } else {
            (self.size / u64::from(self.element_size)) as u32
        }
    }

    /// Whether a buffer with this description can stand in for `required`.
    #[must_use]
    pub fn is_compatible(&self, required: &BufferDesc) -> bool {
        self.size >= required.size
            && self.element_size == required.element_size
            && self.format == required.format
            && self.flags.contains(required.flags)
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct TextureFlags: u32 {
        const NONE             = 0;
        const UNORDERED_ACCESS = 1 << 0;
        const SHADER_RESOURCE  = 1 << 1;
        const RENDER_TARGET    = 1 << 2;
        const DEPTH_STENCIL    = 1 << 3;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum TextureType {
    #[default]
    Texture2D,
    Texture3D,
    TextureCube,
}

/// Description of a texture resource.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth_or_array_size: u32,
    pub mips: u32,
    pub sample_count: u32,
    pub format: ResourceFormat,
    pub texture_type: TextureType,
    pub flags: TextureFlags,
    /// Optimized clear value for depth targets (reverse-Z clears to 0).
    pub clear_depth: f32,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            depth_or_array_size: 1,
            mips: 1,
            sample_count: 1,
            format: ResourceFormat::Unknown,
            texture_type: TextureType::Texture2D,
            flags: TextureFlags::NONE,
            clear_depth: 0.0,
        }
    }
}

impl TextureDesc {
    #[must_use]
    pub fn create_2d(width: u32, height: u32, format: ResourceFormat) -> Self {
        Self {
            width,
            height,
            format,
            flags: TextureFlags::SHADER_RESOURCE,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: TextureFlags) -> Self {
        self.flags |= flags;
        self
    }

    #[must_use]
    pub fn with_mips(mut self, mips: u32) -> Self {
        self.mips = mips;
        self
    }

    #[must_use]
    pub fn render_target(width: u32, height: u32, format: ResourceFormat) -> Self {
        Self::create_2d(width, height, format).with_flags(TextureFlags::RENDER_TARGET)
    }

    #[must_use]
    pub fn depth(width: u32, height: u32, format: ResourceFormat) -> Self {
        debug_assert!(format.is_depth());
        Self::create_2d(width, height, format).with_flags(TextureFlags::DEPTH_STENCIL)
    }

    #[must_use]
    pub fn size_2d(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Whether a texture with this description can stand in for `required`.
    #[must_use]
    pub fn is_compatible(&self, required: &TextureDesc) -> bool {
        self.width == required.width
            && self.height == required.height
            && self.depth_or_array_size == required.depth_or_array_size
            && self.mips == required.mips
            && self.sample_count == required.sample_count
            && self.format == required.format
            && self.texture_type == required.texture_type
            && self.flags.contains(required.flags)
    }
}

// ─── State tracking ───────────────────────────────────────────────────────────

/// Per-resource state record. Tracks either a single whole-resource state or
/// a per-subresource array once any subresource diverges.
#[derive(Debug)]
pub struct ResourceStateTracker {
    inner: Mutex<StateInner>,
    subresource_count: u32,
    tracked: bool,
}

#[derive(Debug)]
struct StateInner {
    all: ResourceState,
    subresources: Vec<ResourceState>,
}

impl ResourceStateTracker {
    #[must_use]
    pub fn new(initial: ResourceState, subresource_count: u32, tracked: bool) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                all: initial,
                subresources: Vec::new(),
            }),
            subresource_count,
            tracked,
        }
    }

    /// Whether the render graph records transitions for this resource.
    #[must_use]
    pub fn use_state_tracking(&self) -> bool {
        self.tracked
    }

    #[must_use]
    pub fn get(&self, subresource: u32) -> ResourceState {
        let inner = self.inner.lock();
        if subresource == ALL_SUBRESOURCES || inner.subresources.is_empty() {
            inner.all
        } else {
            inner.subresources[subresource as usize]
        }
    }

    pub fn set(&self, state: ResourceState, subresource: u32) {
        let mut inner = self.inner.lock();
        if subresource == ALL_SUBRESOURCES {
            inner.all = state;
            inner.subresources.clear();
        } else {
            if inner.subresources.is_empty() {
                let all = inner.all;
                inner.subresources = vec![all; self.subresource_count as usize];
            }
            inner.subresources[subresource as usize] = state;
        }
    }
}

// ─── Physical resources ───────────────────────────────────────────────────────

/// A physical buffer allocation.
#[derive(Debug)]
pub struct Buffer {
    pub(crate) id: u64,
    name: Mutex<String>,
    desc: BufferDesc,
    state: ResourceStateTracker,
    /// CPU-visible backing for upload/readback buffers, and for buffers the
    /// software backend writes observable results into.
    storage: Mutex<Option<Vec<u8>>>,
    gpu_address: u64,
    srv: u32,
    uav: u32,
}

impl Buffer {
    pub(crate) fn new(
        id: u64,
        name: &str,
        desc: BufferDesc,
        gpu_address: u64,
        descriptor_base: u32,
    ) -> Self {
        let storage = if desc
            .flags
            .intersects(BufferFlags::UPLOAD | BufferFlags::READBACK)
        {
            Some(vec![0u8; desc.size as usize])
        } else {
            None
        };
        Self {
            id,
            name: Mutex::new(name.to_string()),
            desc,
            state: ResourceStateTracker::new(ResourceState::COMMON, 1, true),
            storage: Mutex::new(storage),
            gpu_address,
            srv: descriptor_base,
            uav: descriptor_base + 1,
        }
    }

    /// Unique device-assigned id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = name.to_string();
    }

    #[must_use]
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.desc.size
    }

    #[must_use]
    pub fn element_count(&self) -> u32 {
        self.desc.element_count()
    }

    #[must_use]
    pub fn state(&self) -> &ResourceStateTracker {
        &self.state
    }

    /// Bindless SRV heap index.
    #[must_use]
    pub fn srv(&self) -> u32 {
        self.srv
    }

    /// Bindless UAV heap index.
    #[must_use]
    pub fn uav(&self) -> u32 {
        self.uav
    }

    /// GPU virtual address (used by acceleration-structure records).
    #[must_use]
    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// Writes bytes into CPU-visible storage. Allocates the backing lazily
    /// for device-local buffers the software backend needs to observe.
    pub(crate) fn write_storage(&self, offset: u64, data: &[u8]) {
        let mut guard = self.storage.lock();
        let storage = guard.get_or_insert_with(|| vec![0u8; self.desc.size as usize]);
        let offset = offset as usize;
        storage[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Reads CPU-visible storage; empty if this buffer has none.
    #[must_use]
    pub fn read_storage(&self) -> Vec<u8> {
        self.storage.lock().clone().unwrap_or_default()
    }

    /// Whether this buffer carries CPU-visible storage.
    #[must_use]
    pub fn has_storage(&self) -> bool {
        self.storage.lock().is_some()
    }

    pub(crate) fn copy_storage_to(&self, dst: &Buffer, size: u64, src_offset: u64, dst_offset: u64) {
        let src_guard = self.storage.lock();
        if let Some(src) = src_guard.as_ref() {
            let begin = src_offset as usize;
            let end = (src_offset + size) as usize;
            dst.write_storage(dst_offset, &src[begin..end.min(src.len())]);
        }
    }
}

/// A physical texture allocation.
#[derive(Debug)]
pub struct Texture {
    pub(crate) id: u64,
    name: Mutex<String>,
    desc: TextureDesc,
    state: ResourceStateTracker,
    srv: u32,
    uav_base: u32,
}

impl Texture {
    pub(crate) fn new(id: u64, name: &str, desc: TextureDesc, descriptor_base: u32) -> Self {
        let subresources = desc.mips * desc.depth_or_array_size;
        Self {
            id,
            name: Mutex::new(name.to_string()),
            desc,
            state: ResourceStateTracker::new(ResourceState::COMMON, subresources, true),
            srv: descriptor_base,
            uav_base: descriptor_base + 1,
        }
    }

    /// Unique device-assigned id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = name.to_string();
    }

    #[must_use]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[must_use]
    pub fn state(&self) -> &ResourceStateTracker {
        &self.state
    }

    #[must_use]
    pub fn srv(&self) -> u32 {
        self.srv
    }

    /// Bindless UAV heap index of the full resource.
    #[must_use]
    pub fn uav(&self) -> u32 {
        self.uav_base
    }

    /// Bindless UAV heap index for a single mip level.
    #[must_use]
    pub fn mip_uav(&self, mip: u32) -> u32 {
        debug_assert!(mip < self.desc.mips);
        self.uav_base + mip
    }
}

/// A placed-resource heap. Placement bookkeeping lives in the render graph
/// allocator; the heap itself only knows its size.
#[derive(Debug)]
pub struct Heap {
    pub(crate) id: u64,
    size: u64,
}

impl Heap {
    pub(crate) fn new(id: u64, size: u64) -> Self {
        Self { id, size }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

// ─── Type-erased resource ─────────────────────────────────────────────────────

/// A buffer-or-texture handle, used where the graph treats resources
/// uniformly (barriers, aliasing, copies).
#[derive(Clone, Debug)]
pub enum AnyResource {
    Texture(Ref<Texture>),
    Buffer(Ref<Buffer>),
}

impl AnyResource {
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Texture(t) => t.name(),
            Self::Buffer(b) => b.name(),
        }
    }

    pub fn set_name(&self, name: &str) {
        match self {
            Self::Texture(t) => t.set_name(name),
            Self::Buffer(b) => b.set_name(name),
        }
    }

    #[must_use]
    pub fn state(&self) -> &ResourceStateTracker {
        match self {
            Self::Texture(t) => t.state(),
            Self::Buffer(b) => b.state(),
        }
    }

    /// Number of external handles (excludes this one).
    #[must_use]
    pub fn external_ref_count(&self) -> usize {
        match self {
            Self::Texture(t) => Ref::ref_count(t) - 1,
            Self::Buffer(b) => Ref::ref_count(b) - 1,
        }
    }

    #[must_use]
    pub fn as_texture(&self) -> Option<&Ref<Texture>> {
        match self {
            Self::Texture(t) => Some(t),
            Self::Buffer(_) => None,
        }
    }

    #[must_use]
    pub fn as_buffer(&self) -> Option<&Ref<Buffer>> {
        match self {
            Self::Buffer(b) => Some(b),
            Self::Texture(_) => None,
        }
    }

    #[must_use]
    pub fn same_resource(&self, other: &AnyResource) -> bool {
        match (self, other) {
            (Self::Texture(a), Self::Texture(b)) => Ref::ptr_eq(a, b),
            (Self::Buffer(a), Self::Buffer(b)) => Ref::ptr_eq(a, b),
            _ => false,
        }
    }
}
