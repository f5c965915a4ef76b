//! Transient Resource Pool
//!
//! Non-aliased fallback for graph transients: physical resources are
//! retained across frames and handed out again when a compatible request
//! arrives and nobody else holds a reference. Entries idle past the
//! retention window are dropped on `tick`.

use crate::rhi::{Buffer, BufferDesc, GraphicsDevice, Ref, Texture, TextureDesc};

/// Frames an unused pooled resource survives before destruction.
const POOL_RETENTION_FRAMES: u32 = 120;

#[derive(Debug)]
struct PooledResource<T> {
    resource: Ref<T>,
    last_used_frame: u32,
}

/// Pool of whole (non-aliased) transient resources.
#[derive(Debug, Default)]
pub struct RGResourcePool {
    textures: Vec<PooledResource<Texture>>,
    buffers: Vec<PooledResource<Buffer>>,
    frame_index: u32,
}

impl RGResourcePool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuses a compatible, unreferenced pooled texture or creates one.
    pub fn allocate_texture(
        &mut self,
        device: &GraphicsDevice,
        name: &str,
        desc: &TextureDesc,
    ) -> Ref<Texture> {
        if let Some(entry) = self.textures.iter_mut().find(|entry| {
            Ref::ref_count(&entry.resource) == 1 && entry.resource.desc().is_compatible(desc)
        }) {
            entry.last_used_frame = self.frame_index;
            entry.resource.set_name(name);
            return entry.resource.clone();
        }
        let resource = device.create_texture(desc, name);
        self.textures.push(PooledResource {
            resource: resource.clone(),
            last_used_frame: self.frame_index,
        });
        resource
    }

    /// Reuses a compatible, unreferenced pooled buffer or creates one.
    pub fn allocate_buffer(
        &mut self,
        device: &GraphicsDevice,
        name: &str,
        desc: &BufferDesc,
    ) -> Ref<Buffer> {
        if let Some(entry) = self.buffers.iter_mut().find(|entry| {
            Ref::ref_count(&entry.resource) == 1 && entry.resource.desc().is_compatible(desc)
        }) {
            entry.last_used_frame = self.frame_index;
            entry.resource.set_name(name);
            return entry.resource.clone();
        }
        let resource = device.create_buffer(desc, name);
        self.buffers.push(PooledResource {
            resource: resource.clone(),
            last_used_frame: self.frame_index,
        });
        resource
    }

    /// Advances the frame and expires idle entries.
    pub fn tick(&mut self) {
        let frame = self.frame_index;
        self.textures.retain(|entry| {
            Ref::ref_count(&entry.resource) > 1
                || entry.last_used_frame + POOL_RETENTION_FRAMES >= frame
        });
        self.buffers.retain(|entry| {
            Ref::ref_count(&entry.resource) > 1
                || entry.last_used_frame + POOL_RETENTION_FRAMES >= frame
        });
        self.frame_index += 1;
    }

    #[must_use]
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}
