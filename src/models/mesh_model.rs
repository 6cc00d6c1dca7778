//! Opaque textured mesh

use std::sync::Arc;

use glam::{Mat4, Vec3, Vec4};
use parking_lot::Mutex;

use crate::backend::*;
use crate::pipeline::{shaders, LoadContext, Model, Pass, PassMask, PassType};
use crate::resources::{Geometry, GeometryBuffers, GpuTexture, ResourceManager, TextureData};

#[derive(Debug, Default)]
struct MeshState {
    loaded: bool,
    buffers: Option<GeometryBuffers>,
    texture: Option<GpuTexture>,
    sampler: Option<SamplerHandle>,
    material: Option<BindGroupHandle>,
    geometry: Option<RenderPipelineHandle>,
    wireframe: Option<RenderPipelineHandle>,
    shadow: Option<RenderPipelineHandle>,
    capture: Option<RenderPipelineHandle>,
}

/// Geometry drawn into the G-buffer and the shadow cascades.
///
/// A mesh flagged as a grass surface is also captured by the SSIPG pass, so
/// grass blades get generated on top of it.
pub struct MeshModel {
    name: String,
    geometry: Arc<Geometry>,
    texture: Arc<TextureData>,
    tint: Vec4,
    grass_surface: bool,
    /// xyz: push on the blades, w: how far it bends their tips
    grass_pressure: Vec4,
    state: Mutex<MeshState>,
}

impl MeshModel {
    pub fn new(name: &str, resources: &ResourceManager, geometry: &str, texture: &str) -> Self {
        Self {
            name: name.to_string(),
            geometry: resources.find_geometry(geometry),
            texture: resources.find_texture(texture),
            tint: Vec4::ONE,
            grass_surface: false,
            grass_pressure: Vec4::ZERO,
            state: Mutex::new(MeshState::default()),
        }
    }

    pub fn with_tint(mut self, tint: Vec4) -> Self {
        self.tint = tint;
        self
    }

    /// Grow grass on this surface
    pub fn as_grass_surface(mut self) -> Self {
        self.grass_surface = true;
        self
    }

    /// Bend the grass grown on this surface towards `push`, scaled by `strength`
    pub fn with_grass_pressure(mut self, push: Vec3, strength: f32) -> Self {
        self.grass_pressure = push.normalize_or_zero().extend(strength.max(0.0));
        self
    }

    pub fn geometry(&self) -> &Arc<Geometry> {
        &self.geometry
    }

    fn pipeline_for(state: &MeshState, pass: &Pass) -> Option<RenderPipelineHandle> {
        match pass.pass_type {
            PassType::Geometry if pass.wireframe => state.wireframe.or(state.geometry),
            PassType::Geometry => state.geometry,
            PassType::Shadow => state.shadow,
            PassType::Ssipg => state.capture,
            _ => None,
        }
    }
}

impl Model for MeshModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn passes(&self) -> PassMask {
        let mask = PassMask::of(PassType::Geometry).with(PassType::Shadow);
        if self.grass_surface {
            mask.with(PassType::Ssipg)
        } else {
            mask
        }
    }

    fn load(&self, ctx: &mut LoadContext<'_>) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.loaded {
            return Ok(());
        }

        state.buffers = Some(self.geometry.upload(&mut *ctx.backend)?);
        let texture = GpuTexture::create(&mut *ctx.backend, &self.texture)?;
        state.texture = Some(texture);
        let sampler = ctx.backend.create_sampler(&SamplerDescriptor {
            label: Some(format!("{} Sampler", self.name)),
            address_mode_u: AddressMode::Repeat,
            address_mode_v: AddressMode::Repeat,
            ..Default::default()
        })?;
        state.sampler = Some(sampler);
        state.material = Some(ctx.backend.create_bind_group(
            ctx.layouts.material,
            &[
                (0, BindGroupEntry::Texture(texture.view)),
                (1, BindGroupEntry::Sampler(sampler)),
            ],
        )?);

        let uniforms = ctx.layouts.uniforms;
        let material = ctx.layouts.material;
        let program = ctx.resources.find_shader_program(shaders::MESH);
        let geometry_state = PassType::Geometry.state();
        state.geometry = Some(ctx.create_pipeline(
            &self.name,
            &program.source,
            &geometry_state,
            vec![program.descriptor.vertex_layout()],
            vec![uniforms, material],
            PolygonMode::Fill,
        )?);
        if ctx.backend.features().wireframe {
            state.wireframe = Some(ctx.create_pipeline(
                &format!("{} Wireframe", self.name),
                &program.source,
                &geometry_state,
                vec![program.descriptor.vertex_layout()],
                vec![uniforms, material],
                PolygonMode::Line,
            )?);
        }

        let program = ctx.resources.find_shader_program(shaders::SHADOW);
        state.shadow = Some(ctx.create_pipeline(
            &format!("{} Shadow", self.name),
            &program.source,
            &PassType::Shadow.state(),
            vec![program.descriptor.vertex_layout()],
            vec![uniforms],
            PolygonMode::Fill,
        )?);

        if self.grass_surface {
            let program = ctx.resources.find_shader_program(shaders::SSIPG_CAPTURE);
            state.capture = Some(ctx.create_pipeline(
                &format!("{} Capture", self.name),
                &program.source,
                &PassType::Ssipg.state(),
                vec![program.descriptor.vertex_layout()],
                vec![uniforms, material],
                PolygonMode::Fill,
            )?);
        }

        state.loaded = true;
        log::debug!("Mesh model '{}' loaded", self.name);
        Ok(())
    }

    fn unload(&self, backend: &mut dyn GraphicsBackend) {
        let state = std::mem::take(&mut *self.state.lock());
        for pipeline in [state.geometry, state.wireframe, state.shadow, state.capture]
            .into_iter()
            .flatten()
        {
            backend.destroy_render_pipeline(pipeline);
        }
        if let Some(material) = state.material {
            backend.destroy_bind_group(material);
        }
        if let Some(sampler) = state.sampler {
            backend.destroy_sampler(sampler);
        }
        if let Some(texture) = state.texture {
            texture.destroy(backend);
        }
        // Geometry buffers belong to the shared geometry
    }

    fn is_loaded(&self) -> bool {
        self.state.lock().loaded
    }

    fn render(&self, pass: &Pass, world: &Mat4, backend: &mut dyn GraphicsBackend) {
        let state = self.state.lock();
        let (Some(pipeline), Some(buffers), Some(material)) =
            (Self::pipeline_for(&state, pass), state.buffers, state.material)
        else {
            return;
        };

        backend.set_render_pipeline(pipeline);
        backend.set_uniforms(
            0,
            pass.draw_uniforms(world)
                .with_params([self.tint, self.grass_pressure, Vec4::ZERO, Vec4::ZERO])
                .as_bytes(),
        );
        if pass.pass_type != PassType::Shadow {
            backend.set_bind_group(1, material);
        }
        buffers.draw(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{DrawUniforms, PassCamera, PassLayouts, CASCADE_COUNT};
    use crate::scene::Camera;

    fn layouts(backend: &mut HeadlessBackend) -> PassLayouts {
        PassLayouts {
            uniforms: backend.uniform_layout(),
            material: backend.create_bind_group_layout(&[]).unwrap(),
            gbuffer: backend.create_bind_group_layout(&[]).unwrap(),
            shadow_maps: backend.create_bind_group_layout(&[]).unwrap(),
            swapchain_format: backend.swapchain_format(),
        }
    }

    fn pass(pass_type: PassType) -> Pass {
        let camera = PassCamera::from_camera(&Camera::default(), [1.0; CASCADE_COUNT]);
        Pass::new(pass_type, camera, 64, 64)
    }

    #[test]
    fn grass_surfaces_join_the_capture_pass() {
        let resources = ResourceManager::new();
        let plain = MeshModel::new("plain", &resources, "cube", "white");
        assert!(!plain.passes().contains(PassType::Ssipg));
        let ground = MeshModel::new("ground", &resources, "plane", "white").as_grass_surface();
        assert!(ground.passes().contains(PassType::Ssipg));
        assert!(ground.passes().contains(PassType::Geometry));
        assert!(ground.passes().contains(PassType::Shadow));
    }

    #[test]
    fn capture_draw_carries_the_grass_pressure() {
        let mut backend = HeadlessBackend::new(64, 64);
        let resources = ResourceManager::new();
        let layouts = layouts(&mut backend);
        let ground = MeshModel::new("ground", &resources, "plane", "white")
            .as_grass_surface()
            .with_grass_pressure(Vec3::new(2.0, 0.0, 0.0), 0.5);
        ground
            .load(&mut LoadContext {
                backend: &mut backend,
                layouts: &layouts,
                resources: &resources,
            })
            .unwrap();

        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("capture".into()),
            color_attachments: vec![],
            depth_stencil_attachment: None,
        });
        ground.render(&pass(PassType::Ssipg), &Mat4::IDENTITY, &mut backend);
        backend.end_render_pass();

        let data = backend
            .commands_in_pass("capture")
            .iter()
            .find_map(|cmd| match cmd {
                RecordedCommand::SetUniforms { data, .. } => Some(data.clone()),
                _ => None,
            })
            .unwrap();
        let uniforms: DrawUniforms = bytemuck::pod_read_unaligned(&data);
        assert_eq!(uniforms.params[1], Vec4::new(1.0, 0.0, 0.0, 0.5));
    }

    #[test]
    fn shadow_draws_skip_the_material() {
        let mut backend = HeadlessBackend::new(64, 64);
        let resources = ResourceManager::new();
        let layouts = layouts(&mut backend);
        let model = MeshModel::new("box", &resources, "cube", "white");
        model
            .load(&mut LoadContext {
                backend: &mut backend,
                layouts: &layouts,
                resources: &resources,
            })
            .unwrap();

        for (label, pass_type) in [("shadow", PassType::Shadow), ("geometry", PassType::Geometry)] {
            backend.begin_render_pass(&RenderPassDescriptor {
                label: Some(label.into()),
                color_attachments: vec![],
                depth_stencil_attachment: None,
            });
            model.render(&pass(pass_type), &Mat4::IDENTITY, &mut backend);
            backend.end_render_pass();
        }

        let binds = |label| {
            backend
                .commands_in_pass(label)
                .iter()
                .filter(|cmd| matches!(cmd, RecordedCommand::SetBindGroup { .. }))
                .count()
        };
        assert_eq!(binds("shadow"), 0);
        assert_eq!(binds("geometry"), 1);
    }

    #[test]
    fn wireframe_pipeline_needs_backend_support() {
        let resources = ResourceManager::new();
        for wireframe in [true, false] {
            let mut backend =
                HeadlessBackend::new(64, 64).with_features(BackendFeatures { wireframe });
            let layouts = layouts(&mut backend);
            let model = MeshModel::new("box", &resources, "cube", "white");
            model
                .load(&mut LoadContext {
                    backend: &mut backend,
                    layouts: &layouts,
                    resources: &resources,
                })
                .unwrap();
            assert_eq!(model.state.lock().wireframe.is_some(), wireframe);
        }
    }

    #[test]
    fn unload_keeps_shared_geometry() {
        let mut backend = HeadlessBackend::new(64, 64);
        let resources = ResourceManager::new();
        let layouts = layouts(&mut backend);
        let model = MeshModel::new("box", &resources, "cube", "white");
        let mut ctx = LoadContext {
            backend: &mut backend,
            layouts: &layouts,
            resources: &resources,
        };
        model.load(&mut ctx).unwrap();
        assert!(model.is_loaded());

        model.unload(&mut backend);
        assert!(!model.is_loaded());
        assert!(model.geometry().is_uploaded());
        // vertex + index buffers plus the three test layouts
        assert_eq!(backend.live_object_count(), 5);
    }
}
