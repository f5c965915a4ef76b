//! Pipeline State Objects and Command Signatures
//!
//! The software backend does not compile shaders; a pipeline records which
//! shader file, entry point and defines it was built from so recorded command
//! streams stay inspectable. Creation validates the request and fails the
//! same way a real backend surfaces compile errors.

use smallvec::SmallVec;

use crate::errors::{ArgusError, Result};

use super::types::ResourceFormat;

/// Depth comparison function. Reverse-Z passes use `Greater`/`GreaterEqual`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum CompareFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    #[default]
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum CullMode {
    #[default]
    Back,
    Front,
    None,
}

/// Ordered preprocessor define set for shader permutations.
#[derive(Clone, Debug, Default)]
pub struct ShaderDefines {
    defines: Vec<(String, String)>,
}

impl ShaderDefines {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        let value = value.to_string();
        if let Some(entry) = self.defines.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.defines.push((key.to_string(), value));
        }
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.defines
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A shader stage reference: file, entry point and permutation defines.
#[derive(Clone, Debug)]
pub struct ShaderRef {
    pub path: String,
    pub entry: String,
    pub defines: ShaderDefines,
}

impl ShaderRef {
    #[must_use]
    pub fn new(path: &str, entry: &str, defines: &ShaderDefines) -> Self {
        Self {
            path: path.to_string(),
            entry: entry.to_string(),
            defines: defines.clone(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PipelineKind {
    Graphics,
    MeshShading,
    Compute,
}

/// Builder-style description of a raster pipeline.
#[derive(Clone, Debug)]
pub struct PipelineStateInitializer {
    pub name: String,
    pub vertex_shader: Option<ShaderRef>,
    pub mesh_shader: Option<ShaderRef>,
    pub pixel_shader: Option<ShaderRef>,
    pub depth_test: CompareFunc,
    pub depth_write: bool,
    pub cull_mode: CullMode,
    pub depth_bias: (i32, i32, f32),
    pub render_target_formats: SmallVec<[ResourceFormat; 4]>,
    pub depth_format: ResourceFormat,
    pub sample_count: u32,
}

impl Default for PipelineStateInitializer {
    fn default() -> Self {
        Self {
            name: String::new(),
            vertex_shader: None,
            mesh_shader: None,
            pixel_shader: None,
            depth_test: CompareFunc::Greater,
            depth_write: true,
            cull_mode: CullMode::Back,
            depth_bias: (0, 0, 0.0),
            render_target_formats: SmallVec::new(),
            depth_format: ResourceFormat::Unknown,
            sample_count: 1,
        }
    }
}

impl PipelineStateInitializer {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn set_name(&mut self, name: &str) -> &mut Self {
        self.name = name.to_string();
        self
    }

    pub fn set_mesh_shader(&mut self, path: &str, entry: &str, defines: &ShaderDefines) -> &mut Self {
        self.mesh_shader = Some(ShaderRef::new(path, entry, defines));
        self
    }

    pub fn set_pixel_shader(&mut self, path: &str, entry: &str, defines: &ShaderDefines) -> &mut Self {
        self.pixel_shader = Some(ShaderRef::new(path, entry, defines));
        self
    }

    pub fn set_depth_test(&mut self, func: CompareFunc) -> &mut Self {
        self.depth_test = func;
        self
    }

    pub fn set_depth_write(&mut self, write: bool) -> &mut Self {
        self.depth_write = write;
        self
    }

    pub fn set_cull_mode(&mut self, mode: CullMode) -> &mut Self {
        self.cull_mode = mode;
        self
    }

    pub fn set_depth_bias(&mut self, bias: i32, clamp: i32, slope_scaled: f32) -> &mut Self {
        self.depth_bias = (bias, clamp, slope_scaled);
        self
    }

    pub fn set_render_target_formats(
        &mut self,
        formats: &[ResourceFormat],
        depth: ResourceFormat,
        sample_count: u32,
    ) -> &mut Self {
        self.render_target_formats = formats.iter().copied().collect();
        self.depth_format = depth;
        self.sample_count = sample_count;
        self
    }

    pub fn set_depth_only_target(&mut self, depth: ResourceFormat, sample_count: u32) -> &mut Self {
        self.render_target_formats.clear();
        self.depth_format = depth;
        self.sample_count = sample_count;
        self
    }
}

/// A compiled pipeline state object.
#[derive(Debug)]
pub struct PipelineState {
    name: String,
    kind: PipelineKind,
    initializer: Option<PipelineStateInitializer>,
    compute_shader: Option<ShaderRef>,
}

impl PipelineState {
    pub(crate) fn raster(init: PipelineStateInitializer) -> Result<Self> {
        if init.mesh_shader.is_none() && init.vertex_shader.is_none() {
            return Err(ArgusError::PipelineCreation {
                name: init.name.clone(),
                reason: "raster pipeline requires a vertex or mesh shader".to_string(),
            });
        }
        let kind = if init.mesh_shader.is_some() {
            PipelineKind::MeshShading
        } else {
            PipelineKind::Graphics
        };
        Ok(Self {
            name: init.name.clone(),
            kind,
            initializer: Some(init),
            compute_shader: None,
        })
    }

    pub(crate) fn compute(path: &str, entry: &str, defines: &ShaderDefines) -> Result<Self> {
        if path.is_empty() || entry.is_empty() {
            return Err(ArgusError::PipelineCreation {
                name: format!("{path}:{entry}"),
                reason: "compute pipeline requires a shader path and entry point".to_string(),
            });
        }
        Ok(Self {
            name: format!("{path}:{entry}"),
            kind: PipelineKind::Compute,
            initializer: None,
            compute_shader: Some(ShaderRef::new(path, entry, defines)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    #[must_use]
    pub fn initializer(&self) -> Option<&PipelineStateInitializer> {
        self.initializer.as_ref()
    }

    #[must_use]
    pub fn compute_shader(&self) -> Option<&ShaderRef> {
        self.compute_shader.as_ref()
    }
}

/// The kind of indirect command a signature describes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IndirectCommandKind {
    Draw,
    DrawIndexed,
    Dispatch,
    DispatchMesh,
}

/// An indirect command signature: kind + per-record stride.
#[derive(Debug)]
pub struct CommandSignature {
    name: String,
    kind: IndirectCommandKind,
    stride: u32,
}

impl CommandSignature {
    pub(crate) fn new(name: &str, kind: IndirectCommandKind, stride: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            stride,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> IndirectCommandKind {
        self.kind
    }

    #[must_use]
    pub fn stride(&self) -> u32 {
        self.stride
    }
}

/// Root signature: the binding contract shared by every pass. With bindless
/// descriptors the layout is fixed (root constants, one CBV, UAV + SRV
/// tables), so only an identity and name remain.
#[derive(Debug)]
pub struct RootSignature {
    name: String,
}

impl RootSignature {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
