//! Shared Graphics Objects
//!
//! [`GraphicsCommon`] owns the device-global objects every technique shares:
//! the common root signature, the default 1×1 textures, and the indirect
//! command signatures. Created once after the device is ready and dropped
//! before the device is torn down; drop order enforces the lifetime rule.

use super::device::GraphicsDevice;
use super::pipeline::{CommandSignature, IndirectCommandKind, RootSignature};
use super::resources::{Ref, Texture, TextureDesc};
use super::types::ResourceFormat;

/// The default textures bound wherever a real resource is absent.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DefaultTexture {
    White2D,
    Black2D,
    Magenta2D,
    Gray2D,
    Normal2D,
}

const DEFAULT_TEXTURE_COUNT: usize = 5;

/// Device-global shared objects.
pub struct GraphicsCommon {
    common_root_signature: Ref<RootSignature>,
    indirect_dispatch_signature: Ref<CommandSignature>,
    indirect_dispatch_mesh_signature: Ref<CommandSignature>,
    indirect_draw_signature: Ref<CommandSignature>,
    default_textures: [Ref<Texture>; DEFAULT_TEXTURE_COUNT],
}

impl GraphicsCommon {
    #[must_use]
    pub fn new(device: &GraphicsDevice) -> Self {
        let make_default = |name: &str| {
            device.create_texture(
                &TextureDesc::create_2d(1, 1, ResourceFormat::RGBA8Unorm),
                name,
            )
        };

        Self {
            common_root_signature: device.create_root_signature("Common"),
            indirect_dispatch_signature: device
                .create_command_signature(IndirectCommandKind::Dispatch, "Indirect Dispatch"),
            indirect_dispatch_mesh_signature: device.create_command_signature(
                IndirectCommandKind::DispatchMesh,
                "Indirect Dispatch Mesh",
            ),
            indirect_draw_signature: device
                .create_command_signature(IndirectCommandKind::Draw, "Indirect Draw"),
            default_textures: [
                make_default("Default White"),
                make_default("Default Black"),
                make_default("Default Magenta"),
                make_default("Default Gray"),
                make_default("Default Normal"),
            ],
        }
    }

    #[must_use]
    pub fn root_signature(&self) -> &Ref<RootSignature> {
        &self.common_root_signature
    }

    #[must_use]
    pub fn indirect_dispatch_signature(&self) -> &Ref<CommandSignature> {
        &self.indirect_dispatch_signature
    }

    #[must_use]
    pub fn indirect_dispatch_mesh_signature(&self) -> &Ref<CommandSignature> {
        &self.indirect_dispatch_mesh_signature
    }

    #[must_use]
    pub fn indirect_draw_signature(&self) -> &Ref<CommandSignature> {
        &self.indirect_draw_signature
    }

    #[must_use]
    pub fn default_texture(&self, which: DefaultTexture) -> &Ref<Texture> {
        let index = match which {
            DefaultTexture::White2D => 0,
            DefaultTexture::Black2D => 1,
            DefaultTexture::Magenta2D => 2,
            DefaultTexture::Gray2D => 3,
            DefaultTexture::Normal2D => 4,
        };
        &self.default_textures[index]
    }
}
