//! Renderable model interface

use std::sync::Arc;

use glam::Mat4;

use crate::backend::*;
use crate::pipeline::pass::{Pass, PassMask, PassState};
use crate::resources::ResourceManager;

/// Bind group layouts and formats a model needs to build its pipelines
#[derive(Debug, Clone)]
pub struct PassLayouts {
    /// Group 0 of every pipeline: the per-draw uniform block
    pub uniforms: BindGroupLayoutHandle,
    /// Albedo texture + sampler
    pub material: BindGroupLayoutHandle,
    /// G-buffer diffuse and normal, read with `textureLoad`
    pub gbuffer: BindGroupLayoutHandle,
    /// Cascade depth maps + comparison sampler
    pub shadow_maps: BindGroupLayoutHandle,
    pub swapchain_format: TextureFormat,
}

/// Everything a model may touch while creating its GPU objects
pub struct LoadContext<'a> {
    pub backend: &'a mut dyn GraphicsBackend,
    pub layouts: &'a PassLayouts,
    pub resources: &'a ResourceManager,
}

impl LoadContext<'_> {
    /// Create a render pipeline whose fixed state comes from `state`
    pub fn create_pipeline(
        &mut self,
        label: &str,
        shader: &str,
        state: &PassState,
        vertex_layouts: Vec<VertexBufferLayout>,
        bind_group_layouts: Vec<BindGroupLayoutHandle>,
        polygon_mode: PolygonMode,
    ) -> BackendResult<RenderPipelineHandle> {
        let swapchain_format = self.layouts.swapchain_format;
        let color_targets = state.color_targets(swapchain_format);
        self.backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some(label.to_string()),
            shader: shader.to_string(),
            vertex_entry: "vs_main".to_string(),
            fragment_entry: if color_targets.is_empty() {
                None
            } else {
                Some("fs_main".to_string())
            },
            vertex_layouts,
            bind_group_layouts,
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: state.cull,
            polygon_mode,
            depth_stencil: state.depth_stencil(),
            color_targets,
        })
    }
}

/// A unit of geometry + shading that draws itself for the passes it declares.
///
/// Models are shared between scene nodes through [`ModelHandle`]; the last
/// handle dropped releases the CPU side, `unload` releases the GPU side.
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    /// Pass types this model draws in; other passes never reach `render`
    fn passes(&self) -> PassMask;

    fn load(&self, ctx: &mut LoadContext<'_>) -> BackendResult<()>;

    fn unload(&self, backend: &mut dyn GraphicsBackend);

    fn is_loaded(&self) -> bool;

    /// Record draw calls for `pass` with the node's world matrix
    fn render(&self, pass: &Pass, world: &Mat4, backend: &mut dyn GraphicsBackend);
}

/// Shared ownership of a model
pub type ModelHandle = Arc<dyn Model>;
