//! Point light drawn as a stencil-tested sphere volume

use std::sync::Arc;

use glam::{Mat4, Quat, Vec3, Vec4};
use parking_lot::Mutex;

use crate::backend::*;
use crate::pipeline::{
    shaders, LoadContext, Model, Pass, PassMask, PassState, PassType, GROUND_STENCIL,
};
use crate::resources::{Geometry, GeometryBuffers, ResourceManager};

#[derive(Debug, Default)]
struct LightState {
    loaded: bool,
    buffers: Option<GeometryBuffers>,
    mark: Option<RenderPipelineHandle>,
    shade: Option<RenderPipelineHandle>,
}

/// Omni light with a finite radius.
///
/// Each draw is two sub-draws over the same sphere: the first counts the
/// volume faces lying behind the G-buffer surface into the stencil, the
/// second shades where that count is non-zero and resets it, so
/// overlapping lights never leak into each other.
pub struct PointLightModel {
    name: String,
    color: Vec3,
    intensity: f32,
    radius: f32,
    volume: Arc<Geometry>,
    state: Mutex<LightState>,
}

impl PointLightModel {
    pub fn new(name: &str, resources: &ResourceManager, color: Vec3, intensity: f32, radius: f32) -> Self {
        Self {
            name: name.to_string(),
            color,
            intensity,
            radius: radius.max(0.0),
            volume: resources.find_geometry("sphere"),
            state: Mutex::new(LightState::default()),
        }
    }

    pub fn color(&self) -> Vec3 {
        self.color
    }

    pub fn intensity(&self) -> f32 {
        self.intensity
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// Light center and world-space radius for a node's world matrix
    pub fn placement(&self, world: &Mat4) -> (Vec3, f32) {
        let (scale, _, center) = world.to_scale_rotation_translation();
        (center, self.radius * scale.abs().max_element())
    }

    /// Matrix placing the unit-diameter sphere around the light
    pub fn volume_matrix(center: Vec3, radius: f32) -> Mat4 {
        Mat4::from_scale_rotation_translation(Vec3::splat(2.0 * radius), Quat::IDENTITY, center)
    }
}

impl Model for PointLightModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn passes(&self) -> PassMask {
        PassMask::of(PassType::LocalLights)
    }

    fn load(&self, ctx: &mut LoadContext<'_>) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.loaded {
            return Ok(());
        }
        state.buffers = Some(self.volume.upload(&mut *ctx.backend)?);

        let program = ctx.resources.find_shader_program(shaders::POINT_LIGHT);
        let bind_group_layouts = vec![ctx.layouts.uniforms, ctx.layouts.gbuffer];
        state.mark = Some(ctx.create_pipeline(
            &format!("{} Mark", self.name),
            &program.source,
            &PassState::light_volume_mark(),
            vec![program.descriptor.vertex_layout()],
            bind_group_layouts.clone(),
            PolygonMode::Fill,
        )?);
        state.shade = Some(ctx.create_pipeline(
            &format!("{} Shade", self.name),
            &program.source,
            &PassType::LocalLights.state(),
            vec![program.descriptor.vertex_layout()],
            bind_group_layouts,
            PolygonMode::Fill,
        )?);
        state.loaded = true;
        Ok(())
    }

    fn unload(&self, backend: &mut dyn GraphicsBackend) {
        let state = std::mem::take(&mut *self.state.lock());
        for pipeline in [state.mark, state.shade].into_iter().flatten() {
            backend.destroy_render_pipeline(pipeline);
        }
    }

    fn is_loaded(&self) -> bool {
        self.state.lock().loaded
    }

    fn render(&self, pass: &Pass, world: &Mat4, backend: &mut dyn GraphicsBackend) {
        let state = self.state.lock();
        let (Some(mark), Some(shade), Some(buffers)) = (state.mark, state.shade, state.buffers) else {
            return;
        };
        let Some(gbuffer) = pass.gbuffer else {
            log::trace!("Point light '{}' skipped: no G-buffer inputs", self.name);
            return;
        };
        let (center, radius) = self.placement(world);
        if radius <= 0.0 || self.intensity <= 0.0 {
            return;
        }

        let uniforms = pass
            .draw_uniforms(&Self::volume_matrix(center, radius))
            .with_params([
                center.extend(radius),
                self.color.extend(self.intensity),
                Vec4::ZERO,
                Vec4::ZERO,
            ]);
        backend.set_stencil_reference(GROUND_STENCIL);

        backend.set_render_pipeline(mark);
        backend.set_uniforms(0, uniforms.as_bytes());
        backend.set_bind_group(1, gbuffer);
        buffers.draw(backend);

        backend.set_render_pipeline(shade);
        buffers.draw(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PassCamera, PassLayouts, StencilMode, CASCADE_COUNT};
    use crate::scene::Camera;

    fn load(backend: &mut HeadlessBackend, model: &PointLightModel, resources: &ResourceManager) {
        let layouts = PassLayouts {
            uniforms: backend.uniform_layout(),
            material: backend.create_bind_group_layout(&[]).unwrap(),
            gbuffer: backend.create_bind_group_layout(&[]).unwrap(),
            shadow_maps: backend.create_bind_group_layout(&[]).unwrap(),
            swapchain_format: backend.swapchain_format(),
        };
        model
            .load(&mut LoadContext {
                backend,
                layouts: &layouts,
                resources,
            })
            .unwrap();
    }

    #[test]
    fn placement_follows_world_translation_and_scale() {
        let resources = ResourceManager::new();
        let light = PointLightModel::new("lamp", &resources, Vec3::ONE, 2.0, 3.0);
        let world = Mat4::from_scale_rotation_translation(
            Vec3::new(1.0, 2.0, 1.0),
            Quat::IDENTITY,
            Vec3::new(4.0, 5.0, 6.0),
        );
        let (center, radius) = light.placement(&world);
        assert!(center.abs_diff_eq(Vec3::new(4.0, 5.0, 6.0), 1e-5));
        assert!((radius - 6.0).abs() < 1e-5);

        // The unit-diameter sphere reaches exactly the radius
        let edge = PointLightModel::volume_matrix(center, radius).transform_point3(Vec3::new(0.5, 0.0, 0.0));
        assert!(((edge - center).length() - radius).abs() < 1e-4);
    }

    #[test]
    fn renders_mark_then_shade() {
        let mut backend = HeadlessBackend::new(64, 64);
        let resources = ResourceManager::new();
        let light = PointLightModel::new("lamp", &resources, Vec3::ONE, 1.0, 2.0);
        load(&mut backend, &light, &resources);

        let camera = PassCamera::from_camera(&Camera::default(), [1.0; CASCADE_COUNT]);
        let pass = Pass {
            gbuffer: Some(BindGroupHandle(999)),
            ..Pass::new(PassType::LocalLights, camera, 64, 64)
        };
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("lights".into()),
            color_attachments: vec![],
            depth_stencil_attachment: None,
        });
        light.render(&pass, &Mat4::IDENTITY, &mut backend);
        backend.end_render_pass();

        let pipelines: Vec<RenderPipelineHandle> = backend
            .commands_in_pass("lights")
            .into_iter()
            .filter_map(|cmd| match cmd {
                RecordedCommand::SetRenderPipeline(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(pipelines.len(), 2);
        let stencil = |p| {
            backend
                .render_pipeline(p)
                .unwrap()
                .depth_stencil
                .clone()
                .unwrap()
                .stencil
        };
        assert_eq!(stencil(pipelines[0]), StencilMode::VolumeMark.stencil_state());
        assert_eq!(stencil(pipelines[1]), StencilMode::VolumeShade.stencil_state());

        let draws = backend
            .commands_in_pass("lights")
            .into_iter()
            .filter(|cmd| matches!(cmd, RecordedCommand::DrawIndexed { .. }))
            .count();
        assert_eq!(draws, 2);
    }

    #[test]
    fn nothing_is_drawn_without_gbuffer_inputs() {
        let mut backend = HeadlessBackend::new(64, 64);
        let resources = ResourceManager::new();
        let light = PointLightModel::new("lamp", &resources, Vec3::ONE, 1.0, 2.0);
        load(&mut backend, &light, &resources);

        let camera = PassCamera::from_camera(&Camera::default(), [1.0; CASCADE_COUNT]);
        let pass = Pass::new(PassType::LocalLights, camera, 64, 64);
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("lights".into()),
            color_attachments: vec![],
            depth_stencil_attachment: None,
        });
        light.render(&pass, &Mat4::IDENTITY, &mut backend);
        backend.end_render_pass();
        assert!(backend.commands_in_pass("lights").is_empty());
    }
}
