//! Virtual Resources
//!
//! Entries in the graph's symbol table. A virtual resource is an id, a name
//! and a descriptor; a physical resource is bound during compile (transients
//! come from the aliased heap allocator, imports arrive pre-bound). Cross
//! references between passes and resources are typed integer ids, never
//! pointers — both live in graph-owned arenas.

use std::marker::PhantomData;

use crate::rhi::{AnyResource, Buffer, BufferDesc, Ref, Texture, TextureDesc};

/// Index handle for passes, `u16::MAX` reserved as invalid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RGPassId(u16);

/// Index handle for virtual resources, `u16::MAX` reserved as invalid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RGResourceId(u16);

macro_rules! impl_handle {
    ($name:ident) => {
        impl $name {
            pub const INVALID: Self = Self(u16::MAX);

            #[must_use]
            pub fn new(index: usize) -> Self {
                debug_assert!(index < usize::from(u16::MAX));
                Self(index as u16)
            }

            #[must_use]
            pub fn index(self) -> usize {
                usize::from(self.0)
            }

            #[must_use]
            pub fn is_valid(self) -> bool {
                self.0 != u16::MAX
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::INVALID
            }
        }
    };
}

impl_handle!(RGPassId);
impl_handle!(RGResourceId);

/// Half-open pass-id range `[begin, end)` a resource is alive for.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Lifetime {
    pub begin: u32,
    pub end: u32,
}

impl Lifetime {
    #[must_use]
    pub fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    #[must_use]
    pub fn overlaps(&self, other: &Lifetime) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

/// Byte range `[begin, end)` inside a heap.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MemoryRange {
    pub begin: u64,
    pub end: u64,
}

impl MemoryRange {
    #[must_use]
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    #[must_use]
    pub fn overlaps(&self, other: &MemoryRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RGResourceType {
    Texture,
    Buffer,
}

/// Descriptor of a virtual resource. Usage flags are widened during compile
/// from the states the graph observes, so authors rarely spell them out.
#[derive(Clone, Debug)]
pub enum RGResourceDesc {
    Texture(TextureDesc),
    Buffer(BufferDesc),
}

impl RGResourceDesc {
    #[must_use]
    pub fn resource_type(&self) -> RGResourceType {
        match self {
            Self::Texture(_) => RGResourceType::Texture,
            Self::Buffer(_) => RGResourceType::Buffer,
        }
    }

    #[must_use]
    pub fn as_texture(&self) -> Option<&TextureDesc> {
        match self {
            Self::Texture(desc) => Some(desc),
            Self::Buffer(_) => None,
        }
    }

    #[must_use]
    pub fn as_buffer(&self) -> Option<&BufferDesc> {
        match self {
            Self::Buffer(desc) => Some(desc),
            Self::Texture(_) => None,
        }
    }
}

/// A virtual resource: symbol-table entry plus compile-time bookkeeping.
#[derive(Debug)]
pub struct RGResource {
    pub(crate) name: String,
    pub(crate) id: RGResourceId,
    pub(crate) desc: RGResourceDesc,
    pub(crate) imported: bool,
    pub(crate) exported: bool,
    pub(crate) physical: Option<AnyResource>,

    // Compile-time data.
    pub(crate) first_access: RGPassId,
    pub(crate) last_access: RGPassId,
    pub(crate) last_write: RGPassId,
    pub(crate) size: u64,
    pub(crate) alignment: u64,
}

impl RGResource {
    pub(crate) fn new(
        name: &str,
        id: RGResourceId,
        desc: RGResourceDesc,
        physical: Option<AnyResource>,
    ) -> Self {
        Self {
            name: name.to_string(),
            id,
            desc,
            imported: physical.is_some(),
            exported: false,
            physical,
            first_access: RGPassId::INVALID,
            last_access: RGPassId::INVALID,
            last_write: RGPassId::INVALID,
            size: 0,
            alignment: 0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn id(&self) -> RGResourceId {
        self.id
    }

    #[must_use]
    pub fn resource_type(&self) -> RGResourceType {
        self.desc.resource_type()
    }

    /// The (usage-widened) descriptor.
    #[must_use]
    pub fn desc(&self) -> &RGResourceDesc {
        &self.desc
    }

    #[must_use]
    pub fn is_imported(&self) -> bool {
        self.imported
    }

    #[must_use]
    pub fn is_exported(&self) -> bool {
        self.exported
    }

    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.physical.is_some()
    }

    #[must_use]
    pub fn physical(&self) -> Option<&AnyResource> {
        self.physical.as_ref()
    }

    /// Pass range this resource is accessed in, `[first, last+1)`.
    #[must_use]
    pub fn lifetime(&self) -> Lifetime {
        Lifetime::new(self.first_access.index() as u32, self.last_access.index() as u32 + 1)
    }

    /// Lifetime for placement: imports reach back to the frame start,
    /// exports to the frame end — neither may be aliased outside its
    /// access range.
    #[must_use]
    pub fn lifetime_actual(&self) -> Lifetime {
        let mut lifetime = self.lifetime();
        if self.imported {
            lifetime.begin = 0;
        }
        if self.exported {
            lifetime.end = u32::MAX;
        }
        lifetime
    }
}

/// Typed handle to a virtual texture. `Copy`, frame-scoped.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RGTextureHandle {
    pub(crate) id: RGResourceId,
    _marker: PhantomData<Texture>,
}

/// Typed handle to a virtual buffer. `Copy`, frame-scoped.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RGBufferHandle {
    pub(crate) id: RGResourceId,
    _marker: PhantomData<Buffer>,
}

impl RGTextureHandle {
    pub(crate) fn new(id: RGResourceId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn id(self) -> RGResourceId {
        self.id
    }
}

impl RGBufferHandle {
    pub(crate) fn new(id: RGResourceId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn id(self) -> RGResourceId {
        self.id
    }
}

impl From<RGTextureHandle> for RGResourceId {
    fn from(handle: RGTextureHandle) -> Self {
        handle.id
    }
}

impl From<RGBufferHandle> for RGResourceId {
    fn from(handle: RGBufferHandle) -> Self {
        handle.id
    }
}

/// Slot user code keeps a graph-exported texture alive in across frames.
pub type TextureSlot = Option<Ref<Texture>>;
/// Slot user code keeps a graph-exported buffer alive in across frames.
pub type BufferSlot = Option<Ref<Buffer>>;
