//! Offscreen render targets owned by the renderer

use glam::{Mat4, Vec3};

use crate::backend::*;
use crate::pipeline::pass::*;
use crate::scene::Camera;

/// A texture with the view used to attach or sample it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub texture: TextureHandle,
    pub view: TextureViewHandle,
    pub format: TextureFormat,
}

impl RenderTarget {
    pub fn create(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> BackendResult<Self> {
        let texture = backend.create_texture(&TextureDescriptor {
            label: Some(label.to_string()),
            width: width.max(1),
            height: height.max(1),
            format,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        })?;
        match backend.create_texture_view(texture) {
            Ok(view) => Ok(Self {
                texture,
                view,
                format,
            }),
            Err(e) => {
                backend.destroy_texture(texture);
                Err(e)
            }
        }
    }

    /// Create several same-sized targets; on failure none are left alive
    pub fn create_all(
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
        targets: &[(&str, TextureFormat)],
    ) -> BackendResult<Vec<Self>> {
        let mut created = Vec::with_capacity(targets.len());
        for (label, format) in targets {
            match Self::create(backend, label, width, height, *format) {
                Ok(target) => created.push(target),
                Err(e) => {
                    destroy_targets(backend, created);
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_texture_view(self.view);
        backend.destroy_texture(self.texture);
    }

    pub fn clear(&self, color: [f32; 4]) -> ColorAttachment {
        ColorAttachment {
            view: self.view,
            ops: Operations::clear(color),
        }
    }

    pub fn load(&self) -> ColorAttachment {
        ColorAttachment {
            view: self.view,
            ops: Operations::load(),
        }
    }
}

pub(crate) fn destroy_targets(backend: &mut dyn GraphicsBackend, targets: Vec<RenderTarget>) {
    for target in targets {
        target.destroy(backend);
    }
}

fn texture_entries(views: &[TextureViewHandle]) -> Vec<(u32, BindGroupEntry)> {
    views
        .iter()
        .enumerate()
        .map(|(i, view)| (i as u32, BindGroupEntry::Texture(*view)))
        .collect()
}

/// Diffuse, normal + eye distance, brightness and depth-stencil at screen size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GBuffer {
    pub diffuse: RenderTarget,
    pub normal: RenderTarget,
    pub bright: RenderTarget,
    pub depth: RenderTarget,
    /// Diffuse + normal, bound at group 1 by light models
    pub light_inputs: BindGroupHandle,
    pub width: u32,
    pub height: u32,
}

impl GBuffer {
    pub fn create(
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
        light_inputs_layout: BindGroupLayoutHandle,
    ) -> BackendResult<Self> {
        let mut targets = RenderTarget::create_all(
            backend,
            width,
            height,
            &[
                ("G-Buffer Diffuse", GBUFFER_COLOR_FORMATS[0]),
                ("G-Buffer Normal", GBUFFER_COLOR_FORMATS[1]),
                ("G-Buffer Bright", BRIGHT_FORMAT),
                ("G-Buffer Depth", GBUFFER_DEPTH_FORMAT),
            ],
        )?;

        let light_inputs = match backend.create_bind_group(
            light_inputs_layout,
            &texture_entries(&[targets[0].view, targets[1].view]),
        ) {
            Ok(bind_group) => bind_group,
            Err(e) => {
                destroy_targets(backend, targets);
                return Err(e);
            }
        };

        let depth = targets.remove(3);
        let bright = targets.remove(2);
        let normal = targets.remove(1);
        let diffuse = targets.remove(0);
        log::debug!("G-buffer created ({}x{})", width, height);
        Ok(Self {
            diffuse,
            normal,
            bright,
            depth,
            light_inputs,
            width,
            height,
        })
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_bind_group(self.light_inputs);
        destroy_targets(backend, vec![self.diffuse, self.normal, self.bright, self.depth]);
    }

    /// Depth-stencil attachment loading both aspects
    pub fn depth_load(&self, stencil: Option<Operations<u32>>) -> DepthStencilAttachment {
        DepthStencilAttachment {
            view: self.depth.view,
            depth_ops: Some(Operations::load()),
            stencil_ops: Some(stencil.unwrap_or_else(Operations::load)),
        }
    }
}

/// Light-space matrices of every cascade for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowCascades {
    pub light_view: Mat4,
    pub projections: [Mat4; CASCADE_COUNT],
    pub view_projections: [Mat4; CASCADE_COUNT],
    /// Split distances, `borders[0]` is the camera near plane
    pub borders: [f32; CASCADE_COUNT + 1],
    /// Light-space depth range of each projection
    pub depth_ranges: [(f32, f32); CASCADE_COUNT],
}

impl ShadowCascades {
    /// Fit one orthographic projection around each cascade slice.
    ///
    /// `sun_direction` is the direction the light travels. Each slice's
    /// corners are bounded in light space; the near plane is pulled towards
    /// the sun by `caster_margin` so casters outside the slice still land in
    /// the map.
    pub fn compute(camera: &Camera, sun_direction: Vec3, lambda: f32, caster_margin: f32) -> Self {
        let direction = sun_direction.try_normalize().unwrap_or(Vec3::NEG_Y);
        let up = if direction.y.abs() > 0.99 { Vec3::Z } else { Vec3::Y };
        let light_view = Mat4::look_at_rh(Vec3::ZERO, direction, up);

        let split = camera.cascade_borders(CASCADE_COUNT, lambda);
        let mut borders = [0.0; CASCADE_COUNT + 1];
        borders.copy_from_slice(&split);

        let mut projections = [Mat4::IDENTITY; CASCADE_COUNT];
        let mut view_projections = [Mat4::IDENTITY; CASCADE_COUNT];
        let mut depth_ranges = [(0.0, 1.0); CASCADE_COUNT];
        for i in 0..CASCADE_COUNT {
            let corners = camera.frustum_corners(borders[i], borders[i + 1]);
            let (min, max) = corners.iter().fold(
                (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
                |(min, max), corner| {
                    let p = light_view.transform_point3(*corner);
                    (min.min(p), max.max(p))
                },
            );

            // The light looks down -Z: depth is -z
            let near = -max.z - caster_margin.max(0.0);
            let far = -min.z;
            projections[i] = Mat4::orthographic_rh(min.x, max.x, min.y, max.y, near, far);
            view_projections[i] = projections[i] * light_view;
            depth_ranges[i] = (near, far);
        }

        Self {
            light_view,
            projections,
            view_projections,
            borders,
            depth_ranges,
        }
    }

    /// Far distance of each cascade
    pub fn cascade_far(&self) -> [f32; CASCADE_COUNT] {
        let mut far = [0.0; CASCADE_COUNT];
        far.copy_from_slice(&self.borders[1..]);
        far
    }

    /// Camera of the shadow pass rendering cascade `index`
    pub fn pass_camera(&self, index: usize) -> PassCamera {
        let (near, far) = self.depth_ranges[index];
        PassCamera::from_matrices(self.light_view, self.projections[index], near, far)
    }
}

/// One depth map per cascade plus the comparison sampler reading them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowTargets {
    pub maps: Vec<RenderTarget>,
    pub sampler: SamplerHandle,
    /// Maps + sampler, bound at group 2 by the sun
    pub bind_group: BindGroupHandle,
    pub size: u32,
}

impl ShadowTargets {
    pub fn create(
        backend: &mut dyn GraphicsBackend,
        size: u32,
        layout: BindGroupLayoutHandle,
    ) -> BackendResult<Self> {
        let labels: Vec<String> = (0..CASCADE_COUNT)
            .map(|i| format!("Shadow Cascade {i}"))
            .collect();
        let specs: Vec<(&str, TextureFormat)> = labels
            .iter()
            .map(|label| (label.as_str(), SHADOW_FORMAT))
            .collect();
        let maps = RenderTarget::create_all(backend, size, size, &specs)?;

        let sampler = match backend.create_sampler(&SamplerDescriptor {
            label: Some("Shadow Sampler".into()),
            compare: Some(CompareFunction::LessEqual),
            mipmap_filter: FilterMode::Nearest,
            ..Default::default()
        }) {
            Ok(sampler) => sampler,
            Err(e) => {
                destroy_targets(backend, maps);
                return Err(e);
            }
        };

        let views: Vec<TextureViewHandle> = maps.iter().map(|map| map.view).collect();
        let mut entries = texture_entries(&views);
        entries.push((CASCADE_COUNT as u32, BindGroupEntry::Sampler(sampler)));
        let bind_group = match backend.create_bind_group(layout, &entries) {
            Ok(bind_group) => bind_group,
            Err(e) => {
                backend.destroy_sampler(sampler);
                destroy_targets(backend, maps);
                return Err(e);
            }
        };

        Ok(Self {
            maps,
            sampler,
            bind_group,
            size,
        })
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_bind_group(self.bind_group);
        backend.destroy_sampler(self.sampler);
        destroy_targets(backend, self.maps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn test_camera() -> Camera {
        let mut camera = Camera::new(60.0, 16.0 / 9.0, 0.5, 200.0);
        camera.set_view_matrix(Mat4::look_at_rh(
            Vec3::new(10.0, 5.0, 10.0),
            Vec3::new(0.0, 0.0, -20.0),
            Vec3::Y,
        ));
        camera
    }

    #[test]
    fn each_slice_fits_inside_its_cascade() {
        let camera = test_camera();
        let sun = Vec3::new(-0.4, -1.0, -0.3);
        let cascades = ShadowCascades::compute(&camera, sun, 0.8, 10.0);

        for i in 0..CASCADE_COUNT {
            let corners = camera.frustum_corners(cascades.borders[i], cascades.borders[i + 1]);
            for corner in corners {
                let clip = cascades.view_projections[i] * corner.extend(1.0);
                let ndc = clip.truncate() / clip.w;
                assert!(ndc.x.abs() <= 1.0 + 1e-3 && ndc.y.abs() <= 1.0 + 1e-3, "{i}: {ndc}");
                assert!((-1e-3..=1.0 + 1e-3).contains(&ndc.z), "{i}: {ndc}");
            }
        }
    }

    #[test]
    fn casters_towards_the_sun_stay_in_range() {
        let camera = test_camera();
        let sun = Vec3::new(0.0, -1.0, 0.0);
        let cascades = ShadowCascades::compute(&camera, sun, 1.0, 25.0);

        // A point above the nearest slice, between it and the sun
        let corners = camera.frustum_corners(cascades.borders[0], cascades.borders[1]);
        let center = corners.iter().copied().sum::<Vec3>() / 8.0;
        let caster = center + Vec3::Y * 5.0;
        let clip = cascades.view_projections[0] * Vec4::from((caster, 1.0));
        assert!(clip.z / clip.w >= 0.0);
    }

    #[test]
    fn cascade_far_ends_at_camera_far() {
        let camera = test_camera();
        let cascades = ShadowCascades::compute(&camera, Vec3::NEG_Y, 1.0, 0.0);
        let far = cascades.cascade_far();
        assert!(far.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(far[CASCADE_COUNT - 1], camera.far());
        assert!(cascades.view_projections.iter().all(|m| m.is_finite()));
    }

    #[test]
    fn degenerate_sun_direction_falls_back_to_straight_down() {
        let camera = test_camera();
        let cascades = ShadowCascades::compute(&camera, Vec3::ZERO, 1.0, 0.0);
        let down = ShadowCascades::compute(&camera, Vec3::NEG_Y, 1.0, 0.0);
        assert_eq!(cascades, down);
    }

    #[test]
    fn failed_bind_group_releases_the_targets() {
        let mut backend = HeadlessBackend::new(8, 8);
        let bogus_layout = BindGroupLayoutHandle(999);
        assert!(GBuffer::create(&mut backend, 8, 8, bogus_layout).is_err());
        assert!(ShadowTargets::create(&mut backend, 16, bogus_layout).is_err());
        assert_eq!(backend.live_object_count(), 0);
    }

    #[test]
    fn partial_target_failure_releases_earlier_targets() {
        let mut backend = HeadlessBackend::new(8, 8);
        backend.fail_creation_of("Shadow Cascade 2");
        let layout = backend.create_bind_group_layout(&[]).unwrap();
        assert!(ShadowTargets::create(&mut backend, 16, layout).is_err());
        assert_eq!(backend.live_object_count(), 1); // the layout
    }
}
