//! Sun light over the whole screen

use glam::{Mat4, Vec3, Vec4};
use parking_lot::Mutex;

use crate::backend::*;
use crate::pipeline::{shaders, LoadContext, Model, Pass, PassMask, PassType, GROUND_STENCIL};

/// Directional light shading every ground pixel.
///
/// The direction comes from the frame's lighting parameters; the model adds
/// color, cascaded shadow lookup and, with SSAO on, the occluded ambient term.
pub struct DirectionalLightModel {
    name: String,
    color: Vec3,
    intensity: f32,
    pipeline: Mutex<Option<RenderPipelineHandle>>,
}

impl DirectionalLightModel {
    pub fn new(name: &str, color: Vec3, intensity: f32) -> Self {
        Self {
            name: name.to_string(),
            color,
            intensity,
            pipeline: Mutex::new(None),
        }
    }

    /// Uniform parameters: light direction, color, ambient
    pub fn params(&self, pass: &Pass) -> [Vec4; 4] {
        [
            pass.lighting.sun_direction.extend(0.0),
            (self.color * self.intensity).extend(1.0),
            pass.lighting.ambient.extend(1.0),
            Vec4::ZERO,
        ]
    }
}

impl Model for DirectionalLightModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn passes(&self) -> PassMask {
        PassMask::of(PassType::GlobalLights)
    }

    fn load(&self, ctx: &mut LoadContext<'_>) -> BackendResult<()> {
        let mut pipeline = self.pipeline.lock();
        if pipeline.is_some() {
            return Ok(());
        }
        let program = ctx.resources.find_shader_program(shaders::SUN);
        let layouts = vec![ctx.layouts.uniforms, ctx.layouts.gbuffer, ctx.layouts.shadow_maps];
        *pipeline = Some(ctx.create_pipeline(
            &self.name,
            &program.source,
            &PassType::GlobalLights.state(),
            vec![QuadVertex::layout()],
            layouts,
            PolygonMode::Fill,
        )?);
        Ok(())
    }

    fn unload(&self, backend: &mut dyn GraphicsBackend) {
        if let Some(pipeline) = self.pipeline.lock().take() {
            backend.destroy_render_pipeline(pipeline);
        }
    }

    fn is_loaded(&self) -> bool {
        self.pipeline.lock().is_some()
    }

    fn render(&self, pass: &Pass, _world: &Mat4, backend: &mut dyn GraphicsBackend) {
        let Some(pipeline) = *self.pipeline.lock() else {
            return;
        };
        let (Some(quad), Some(gbuffer), Some(shadows)) = (pass.quad, pass.gbuffer, pass.shadows) else {
            log::trace!("Directional light '{}' skipped: pass inputs missing", self.name);
            return;
        };

        backend.set_render_pipeline(pipeline);
        backend.set_stencil_reference(GROUND_STENCIL);
        backend.set_uniforms(
            0,
            pass.draw_uniforms(&Mat4::IDENTITY)
                .with_params(self.params(pass))
                .as_bytes(),
        );
        backend.set_bind_group(1, gbuffer);
        backend.set_bind_group(2, shadows.bind_group);
        quad.draw(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FullscreenQuad, PassCamera, PassLayouts, ShadowBinding, CASCADE_COUNT};
    use crate::resources::ResourceManager;
    use crate::scene::Camera;

    fn loaded_sun(backend: &mut HeadlessBackend) -> DirectionalLightModel {
        let resources = ResourceManager::new();
        let layouts = PassLayouts {
            uniforms: backend.uniform_layout(),
            material: backend.create_bind_group_layout(&[]).unwrap(),
            gbuffer: backend.create_bind_group_layout(&[]).unwrap(),
            shadow_maps: backend.create_bind_group_layout(&[]).unwrap(),
            swapchain_format: backend.swapchain_format(),
        };
        let sun = DirectionalLightModel::new("sun", Vec3::new(1.0, 0.9, 0.8), 2.0);
        sun.load(&mut LoadContext {
            backend,
            layouts: &layouts,
            resources: &resources,
        })
        .unwrap();
        sun
    }

    fn global_pass(backend: &mut HeadlessBackend) -> Pass {
        let camera = PassCamera::from_camera(&Camera::default(), [1.0; CASCADE_COUNT]);
        Pass {
            quad: Some(FullscreenQuad::create(backend).unwrap()),
            gbuffer: Some(BindGroupHandle(900)),
            shadows: Some(ShadowBinding {
                bind_group: BindGroupHandle(901),
                view_projections: [Mat4::IDENTITY; CASCADE_COUNT],
            }),
            ..Pass::new(PassType::GlobalLights, camera, 64, 64)
        }
    }

    #[test]
    fn pipeline_uses_three_groups() {
        let mut backend = HeadlessBackend::new(64, 64);
        let sun = loaded_sun(&mut backend);
        let pipeline = sun.pipeline.lock().unwrap();
        assert_eq!(backend.render_pipeline(pipeline).unwrap().bind_group_layouts.len(), 3);
    }

    #[test]
    fn draws_one_quad_with_both_inputs_bound() {
        let mut backend = HeadlessBackend::new(64, 64);
        let sun = loaded_sun(&mut backend);
        let pass = global_pass(&mut backend);
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("global".into()),
            color_attachments: vec![],
            depth_stencil_attachment: None,
        });
        sun.render(&pass, &Mat4::IDENTITY, &mut backend);
        backend.end_render_pass();

        let commands = backend.commands_in_pass("global");
        let groups: Vec<u32> = commands
            .iter()
            .filter_map(|cmd| match cmd {
                RecordedCommand::SetBindGroup { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(groups, vec![1, 2]);
        assert!(commands
            .iter()
            .any(|cmd| matches!(cmd, RecordedCommand::SetStencilReference(GROUND_STENCIL))));
        assert_eq!(
            commands
                .iter()
                .filter(|cmd| matches!(cmd, RecordedCommand::DrawIndexed { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn params_carry_direction_color_and_ambient() {
        let mut backend = HeadlessBackend::new(64, 64);
        let sun = DirectionalLightModel::new("sun", Vec3::new(1.0, 0.5, 0.25), 2.0);
        let pass = global_pass(&mut backend);
        let params = sun.params(&pass);
        assert_eq!(params[0].truncate(), pass.lighting.sun_direction);
        assert_eq!(params[1], Vec4::new(2.0, 1.0, 0.5, 1.0));
        assert_eq!(params[2].truncate(), pass.lighting.ambient);
    }

    #[test]
    fn missing_shadow_inputs_skip_the_draw() {
        let mut backend = HeadlessBackend::new(64, 64);
        let sun = loaded_sun(&mut backend);
        let pass = Pass {
            shadows: None,
            ..global_pass(&mut backend)
        };
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("global".into()),
            color_attachments: vec![],
            depth_stencil_attachment: None,
        });
        sun.render(&pass, &Mat4::IDENTITY, &mut backend);
        backend.end_render_pass();
        assert!(backend.commands_in_pass("global").is_empty());
    }
}
