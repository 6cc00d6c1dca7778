//! Deferred renderer: owns the intermediate targets and drives one frame
//! through the fixed pass sequence.

use glam::{Mat4, Vec3, Vec4};

use crate::backend::*;
use crate::error::RendererError;
use crate::pipeline::fullscreen::FullscreenQuad;
use crate::pipeline::model::{LoadContext, PassLayouts};
use crate::pipeline::pass::*;
use crate::pipeline::shaders;
use crate::pipeline::ssipg::{SsipgTargets, BLADE_VERTEX_COUNT, GENERATE_TEXTURE_INPUTS};
use crate::pipeline::targets::{GBuffer, ShadowCascades, ShadowTargets};
use crate::resources::{ResourceManager, COMPUTE_ENTRY};
use crate::scene::{Camera, NodeId, SceneGraph};
use crate::RendererConfig;

/// Which intermediate images the screen pass shows instead of the tonemapped frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugShowFlags {
    pub diffuse: bool,
    pub normal: bool,
    pub ssipg_distance: bool,
    pub ssipg_diffuse: bool,
}

impl DebugShowFlags {
    pub const NONE: Self = Self {
        diffuse: false,
        normal: false,
        ssipg_distance: false,
        ssipg_diffuse: false,
    };

    pub fn any(&self) -> bool {
        self.diffuse || self.normal || self.ssipg_distance || self.ssipg_diffuse
    }

    /// Flag vector read by the debug shader
    pub fn as_vec4(&self) -> Vec4 {
        let flag = |on: bool| if on { 1.0 } else { 0.0 };
        Vec4::new(
            flag(self.diffuse),
            flag(self.normal),
            flag(self.ssipg_distance),
            flag(self.ssipg_diffuse),
        )
    }
}

/// What happened during one [`DeferredRenderer::render_frame`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Passes in execution order; `Screen` marks the present step
    pub passes: Vec<PassType>,
    /// Instance count written by the generate pass
    pub ssipg_reported: u32,
    /// Instances actually drawn, clamped to the buffer capacity
    pub ssipg_instances: u32,
}

#[derive(Debug, Clone, Copy)]
struct RendererPipelines {
    ssipg_generate: ComputePipelineHandle,
    grass: RenderPipelineHandle,
    sky_mask: RenderPipelineHandle,
    sky_fill: RenderPipelineHandle,
    tonemap: RenderPipelineHandle,
    debug: RenderPipelineHandle,
}

/// GPU state that exists between `load` and `unload`
#[derive(Debug)]
struct RendererGpu {
    layouts: PassLayouts,
    ssipg_generate_layout: BindGroupLayoutHandle,
    grass_instances_layout: BindGroupLayoutHandle,
    present_layout: BindGroupLayoutHandle,
    gbuffer: GBuffer,
    shadows: ShadowTargets,
    ssipg: SsipgTargets,
    quad: FullscreenQuad,
    present_inputs: BindGroupHandle,
    pipelines: RendererPipelines,
}

impl RendererGpu {
    fn destroy(self, backend: &mut dyn GraphicsBackend) {
        let p = self.pipelines;
        backend.destroy_compute_pipeline(p.ssipg_generate);
        for pipeline in [p.grass, p.sky_mask, p.sky_fill, p.tonemap, p.debug] {
            backend.destroy_render_pipeline(pipeline);
        }
        backend.destroy_bind_group(self.present_inputs);
        self.quad.destroy(backend);
        self.ssipg.destroy(backend);
        self.shadows.destroy(backend);
        self.gbuffer.destroy(backend);
        for layout in [
            self.layouts.material,
            self.layouts.gbuffer,
            self.layouts.shadow_maps,
            self.ssipg_generate_layout,
            self.grass_instances_layout,
            self.present_layout,
        ] {
            backend.destroy_bind_group_layout(layout);
        }
    }
}

/// Objects created so far by a `load` that has not finished
#[derive(Default)]
struct PartialLoad {
    layouts: Vec<BindGroupLayoutHandle>,
    bind_groups: Vec<BindGroupHandle>,
    render_pipelines: Vec<RenderPipelineHandle>,
    compute_pipelines: Vec<ComputePipelineHandle>,
    gbuffer: Option<GBuffer>,
    shadows: Option<ShadowTargets>,
    ssipg: Option<SsipgTargets>,
    quad: Option<FullscreenQuad>,
}

impl PartialLoad {
    fn layout(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let layout = backend.create_bind_group_layout(entries)?;
        self.layouts.push(layout);
        Ok(layout)
    }

    fn release(self, backend: &mut dyn GraphicsBackend) {
        for pipeline in self.compute_pipelines {
            backend.destroy_compute_pipeline(pipeline);
        }
        for pipeline in self.render_pipelines {
            backend.destroy_render_pipeline(pipeline);
        }
        for bind_group in self.bind_groups {
            backend.destroy_bind_group(bind_group);
        }
        if let Some(quad) = self.quad {
            quad.destroy(backend);
        }
        if let Some(ssipg) = self.ssipg {
            ssipg.destroy(backend);
        }
        if let Some(shadows) = self.shadows {
            shadows.destroy(backend);
        }
        if let Some(gbuffer) = self.gbuffer {
            gbuffer.destroy(backend);
        }
        for layout in self.layouts {
            backend.destroy_bind_group_layout(layout);
        }
    }
}

fn texture_layout_entries(count: u32, sample_type: TextureSampleType) -> Vec<BindGroupLayoutEntry> {
    (0..count)
        .map(|binding| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStageFlags::VERTEX_FRAGMENT | ShaderStageFlags::COMPUTE,
            ty: BindingType::Texture { sample_type },
        })
        .collect()
}

const UNFILTERED: TextureSampleType = TextureSampleType::Float { filterable: false };

/// Renderer compositing a frame from a [`SceneGraph`] through the shadow,
/// SSIPG, geometry, light and screen passes.
///
/// All GPU objects are created by [`load`](Self::load) and destroyed by
/// [`unload`](Self::unload). The screen size is fixed for the renderer's
/// lifetime; resizing means unloading and building a new renderer.
pub struct DeferredRenderer {
    width: u32,
    height: u32,
    config: RendererConfig,
    camera: Camera,
    lighting: LightingParams,
    gpu: Option<RendererGpu>,
}

impl DeferredRenderer {
    pub fn new(width: u32, height: u32, config: RendererConfig) -> Result<Self, RendererError> {
        if width == 0 || height == 0 {
            return Err(RendererError::InvalidScreenSize { width, height });
        }
        let mut camera = Camera::default();
        camera.set_aspect(width as f32, height as f32);
        let lighting = LightingParams {
            sun_direction: config.sun_direction.try_normalize().unwrap_or(Vec3::NEG_Y),
            ambient: config.ambient,
            sky_color: config.sky_color,
            ssao_enabled: config.ssao_enabled,
            shadows_enabled: config.shadows_enabled,
        };
        Ok(Self {
            width,
            height,
            config,
            camera,
            lighting,
            gpu: None,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn lighting(&self) -> &LightingParams {
        &self.lighting
    }

    pub fn is_loaded(&self) -> bool {
        self.gpu.is_some()
    }

    /// Layouts models build their pipelines against, available once loaded
    pub fn layouts(&self) -> Option<&PassLayouts> {
        self.gpu.as_ref().map(|gpu| &gpu.layouts)
    }

    pub fn set_camera_view_matrix(&mut self, view: Mat4) {
        self.camera.set_view_matrix(view);
    }

    /// Vertical field of view in degrees plus the depth range
    pub fn set_camera_projection(&mut self, fov_y_degrees: f32, near: f32, far: f32) {
        self.camera.set_projection(fov_y_degrees, near, far);
    }

    /// Direction the sunlight travels; a zero vector is ignored
    pub fn set_sun_direction(&mut self, direction: Vec3) {
        match direction.try_normalize() {
            Some(direction) => self.lighting.sun_direction = direction,
            None => log::warn!("Ignoring degenerate sun direction {:?}", direction),
        }
    }

    pub fn set_ambient_light(&mut self, ambient: Vec3) {
        self.lighting.ambient = ambient;
    }

    pub fn set_sky_color(&mut self, color: Vec3) {
        self.lighting.sky_color = color;
    }

    pub fn set_ssao_enabled(&mut self, enabled: bool) {
        self.lighting.ssao_enabled = enabled;
    }

    pub fn set_shadows_enabled(&mut self, enabled: bool) {
        self.lighting.shadows_enabled = enabled;
    }

    /// Create every GPU object the renderer owns.
    ///
    /// Any creation failure is fatal: objects created so far are destroyed
    /// and the error is returned, leaving the renderer unloaded.
    pub fn load(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        resources: &ResourceManager,
    ) -> Result<(), RendererError> {
        if self.gpu.is_some() {
            return Err(RendererError::AlreadyLoaded);
        }
        let mut partial = PartialLoad::default();
        match self.create_gpu(backend, resources, &mut partial) {
            Ok(gpu) => {
                log::info!(
                    "Deferred renderer loaded ({}x{}, {} shadow cascades of {}px, SSIPG capacity {})",
                    self.width,
                    self.height,
                    CASCADE_COUNT,
                    self.config.shadow_map_size,
                    gpu.ssipg.capacity
                );
                self.gpu = Some(gpu);
                Ok(())
            }
            Err(e) => {
                log::error!("Deferred renderer failed to load: {}", e);
                partial.release(backend);
                Err(e.into())
            }
        }
    }

    fn create_gpu(
        &self,
        backend: &mut dyn GraphicsBackend,
        resources: &ResourceManager,
        partial: &mut PartialLoad,
    ) -> BackendResult<RendererGpu> {
        let material = partial.layout(
            backend,
            &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStageFlags::FRAGMENT,
                    ty: BindingType::Texture {
                        sample_type: TextureSampleType::Float { filterable: true },
                    },
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStageFlags::FRAGMENT,
                    ty: BindingType::Sampler { comparison: false },
                },
            ],
        )?;
        let gbuffer_layout = partial.layout(backend, &texture_layout_entries(2, UNFILTERED))?;
        let mut shadow_entries = texture_layout_entries(CASCADE_COUNT as u32, TextureSampleType::Depth);
        shadow_entries.push(BindGroupLayoutEntry {
            binding: CASCADE_COUNT as u32,
            visibility: ShaderStageFlags::FRAGMENT,
            ty: BindingType::Sampler { comparison: true },
        });
        let shadow_maps = partial.layout(backend, &shadow_entries)?;

        let storage = |binding, read_only, visibility| BindGroupLayoutEntry {
            binding,
            visibility,
            ty: BindingType::StorageBuffer { read_only },
        };
        let mut generate_entries = texture_layout_entries(GENERATE_TEXTURE_INPUTS, UNFILTERED);
        generate_entries.extend(
            (GENERATE_TEXTURE_INPUTS..GENERATE_TEXTURE_INPUTS + 3)
                .map(|b| storage(b, false, ShaderStageFlags::COMPUTE)),
        );
        let ssipg_generate_layout = partial.layout(backend, &generate_entries)?;
        let grass_instances_layout = partial.layout(
            backend,
            &[
                storage(0, true, ShaderStageFlags::VERTEX),
                storage(1, true, ShaderStageFlags::VERTEX),
            ],
        )?;
        let present_layout = partial.layout(backend, &texture_layout_entries(5, UNFILTERED))?;

        let layouts = PassLayouts {
            uniforms: backend.uniform_layout(),
            material,
            gbuffer: gbuffer_layout,
            shadow_maps,
            swapchain_format: backend.swapchain_format(),
        };

        let gbuffer = GBuffer::create(backend, self.width, self.height, gbuffer_layout)?;
        partial.gbuffer = Some(gbuffer.clone());
        let shadows = ShadowTargets::create(backend, self.config.shadow_map_size, shadow_maps)?;
        partial.shadows = Some(shadows.clone());
        let ssipg = SsipgTargets::create(
            backend,
            self.width,
            self.height,
            ssipg_generate_layout,
            grass_instances_layout,
        )?;
        partial.ssipg = Some(ssipg.clone());
        let quad = FullscreenQuad::create(backend)?;
        partial.quad = Some(quad);

        let present_entries: Vec<(u32, BindGroupEntry)> = [
            gbuffer.diffuse.view,
            gbuffer.normal.view,
            gbuffer.bright.view,
            ssipg.distance.view,
            ssipg.diffuse.view,
        ]
        .into_iter()
        .enumerate()
        .map(|(i, view)| (i as u32, BindGroupEntry::Texture(view)))
        .collect();
        let present_inputs = backend.create_bind_group(present_layout, &present_entries)?;
        partial.bind_groups.push(present_inputs);

        let uniforms = layouts.uniforms;
        let generate_program = resources.find_shader_program(shaders::SSIPG_GENERATE);
        let ssipg_generate = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("SSIPG Generate".into()),
            shader: generate_program.source.clone(),
            entry_point: COMPUTE_ENTRY.into(),
            bind_group_layouts: vec![uniforms, ssipg_generate_layout],
        })?;
        partial.compute_pipelines.push(ssipg_generate);

        let mut ctx = LoadContext {
            backend,
            layouts: &layouts,
            resources,
        };
        let quad_layout = || vec![QuadVertex::layout()];
        let specs: [(&str, &str, PassState, Vec<VertexBufferLayout>, Vec<BindGroupLayoutHandle>); 5] = [
            (
                "Grass",
                shaders::GRASS,
                PassState {
                    cull: CullMode::None,
                    ..PassType::Geometry.state()
                },
                vec![],
                vec![uniforms, grass_instances_layout],
            ),
            (
                "Sky Mask",
                shaders::SKY_MASK,
                PassState::sky_mask_write(),
                quad_layout(),
                vec![uniforms],
            ),
            (
                "Sky Fill",
                shaders::SKY_FILL,
                PassState::sky_fill(),
                quad_layout(),
                vec![uniforms],
            ),
            (
                "Tonemap",
                shaders::TONEMAP,
                PassType::Screen.state(),
                quad_layout(),
                vec![uniforms, present_layout],
            ),
            (
                "Debug View",
                shaders::DEBUG,
                PassType::Screen.state(),
                quad_layout(),
                vec![uniforms, present_layout],
            ),
        ];
        let mut render_pipelines = Vec::with_capacity(specs.len());
        for (label, program, state, vertex_layouts, bind_group_layouts) in specs {
            let program = resources.find_shader_program(program);
            let pipeline = ctx.create_pipeline(
                label,
                &program.source,
                &state,
                vertex_layouts,
                bind_group_layouts,
                PolygonMode::Fill,
            )?;
            partial.render_pipelines.push(pipeline);
            render_pipelines.push(pipeline);
        }

        Ok(RendererGpu {
            layouts,
            ssipg_generate_layout,
            grass_instances_layout,
            present_layout,
            gbuffer,
            shadows,
            ssipg,
            quad,
            present_inputs,
            pipelines: RendererPipelines {
                ssipg_generate,
                grass: render_pipelines[0],
                sky_mask: render_pipelines[1],
                sky_fill: render_pipelines[2],
                tonemap: render_pipelines[3],
                debug: render_pipelines[4],
            },
        })
    }

    /// Destroy every GPU object the renderer owns
    pub fn unload(&mut self, backend: &mut dyn GraphicsBackend) -> Result<(), RendererError> {
        let gpu = self.gpu.take().ok_or(RendererError::NotLoaded)?;
        gpu.destroy(backend);
        log::info!("Deferred renderer unloaded");
        Ok(())
    }

    /// Load every model attached to `scene` against the renderer's layouts.
    ///
    /// Returns how many models are loaded afterwards. Individual failures are
    /// logged and leave that model unloaded.
    pub fn load_models(
        &self,
        backend: &mut dyn GraphicsBackend,
        scene: &SceneGraph,
        resources: &ResourceManager,
    ) -> Result<usize, RendererError> {
        let gpu = self.gpu.as_ref().ok_or(RendererError::NotLoaded)?;
        let mut ctx = LoadContext {
            backend,
            layouts: &gpu.layouts,
            resources,
        };
        Ok(scene.load_models(&mut ctx))
    }

    /// Render one frame of the subtree rooted at `root` and present it.
    pub fn render_frame(
        &self,
        backend: &mut dyn GraphicsBackend,
        scene: &mut SceneGraph,
        root: NodeId,
        debug: DebugShowFlags,
        wireframe: bool,
    ) -> Result<FrameStats, RendererError> {
        let gpu = self.gpu.as_ref().ok_or(RendererError::NotLoaded)?;
        if !scene.contains(root) {
            return Err(crate::scene::SceneError::StaleNode(root).into());
        }
        let frame = backend.begin_frame()?;
        let mut stats = FrameStats::default();

        let cascades = ShadowCascades::compute(
            &self.camera,
            self.lighting.sun_direction,
            self.config.cascade_lambda,
            self.config.shadow_caster_margin,
        );
        let camera = PassCamera::from_camera(&self.camera, cascades.cascade_far());
        let base = |pass_type| Pass {
            lighting: self.lighting,
            wireframe,
            quad: Some(gpu.quad),
            ..Pass::new(pass_type, camera, self.width, self.height)
        };
        let shadow_binding = ShadowBinding {
            bind_group: gpu.shadows.bind_group,
            view_projections: cascades.view_projections,
        };

        // Shadow cascades
        if self.lighting.shadows_enabled {
            for (i, map) in gpu.shadows.maps.iter().enumerate() {
                backend.begin_render_pass(&RenderPassDescriptor {
                    label: Some(format!("Shadow Cascade {i}")),
                    color_attachments: vec![],
                    depth_stencil_attachment: Some(DepthStencilAttachment {
                        view: map.view,
                        depth_ops: Some(Operations::clear(1.0)),
                        stencil_ops: None,
                    }),
                });
                let pass = Pass {
                    cascade: Some(i),
                    camera: cascades.pass_camera(i),
                    width: gpu.shadows.size,
                    height: gpu.shadows.size,
                    ..base(PassType::Shadow)
                };
                let traversal = scene.render(root, &pass, backend);
                backend.end_render_pass();
                traversal?;
                stats.passes.push(PassType::Shadow);
            }
        }

        // SSIPG capture, counter reset, generate
        let ssipg = &gpu.ssipg;
        backend.begin_render_pass(&ssipg.capture_pass());
        let pass = Pass {
            width: ssipg.width,
            height: ssipg.height,
            ..base(PassType::Ssipg)
        };
        let traversal = scene.render(root, &pass, backend);
        backend.end_render_pass();
        traversal?;
        stats.passes.push(PassType::Ssipg);

        let grass = Vec4::new(
            self.config.grass_spacing,
            self.config.grass_height,
            self.config.grass_width * 0.5,
            0.0,
        );
        backend.clear_buffer(ssipg.counter);
        backend.begin_compute_pass(Some("SSIPG Generate"));
        backend.set_compute_pipeline(gpu.pipelines.ssipg_generate);
        backend.set_uniforms(
            0,
            pass.draw_uniforms(&Mat4::IDENTITY)
                .with_params([grass, Vec4::ZERO, Vec4::ZERO, Vec4::ZERO])
                .as_bytes(),
        );
        backend.set_bind_group(1, ssipg.generate_inputs);
        let (groups_x, groups_y) = ssipg.dispatch_size();
        backend.dispatch_compute(groups_x, groups_y, 1);
        backend.end_compute_pass();

        // Geometry
        let gbuffer = &gpu.gbuffer;
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("G-Buffer".into()),
            color_attachments: vec![gbuffer.diffuse.clear([1.0; 4]), gbuffer.normal.clear([0.0; 4])],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: gbuffer.depth.view,
                depth_ops: Some(Operations::clear(1.0)),
                stencil_ops: Some(Operations::clear(0)),
            }),
        });
        let pass = base(PassType::Geometry);
        let traversal = scene.render(root, &pass, backend);
        backend.end_render_pass();
        traversal?;
        stats.passes.push(PassType::Geometry);

        // Blocks until the generate pass has finished
        let (reported, instances) = ssipg.read_instance_count(backend).unwrap_or_else(|e| {
            log::warn!("SSIPG counter read-back failed, skipping grass: {}", e);
            (0, 0)
        });
        stats.ssipg_reported = reported;
        stats.ssipg_instances = instances;

        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("G-Buffer Particles".into()),
            color_attachments: vec![gbuffer.diffuse.load(), gbuffer.normal.load()],
            depth_stencil_attachment: Some(gbuffer.depth_load(None)),
        });
        if instances > 0 {
            backend.set_render_pipeline(gpu.pipelines.grass);
            backend.set_uniforms(
                0,
                pass.draw_uniforms(&Mat4::IDENTITY)
                    .with_params([grass, Vec4::ZERO, Vec4::ZERO, Vec4::ZERO])
                    .as_bytes(),
            );
            backend.set_bind_group(1, ssipg.instances);
            backend.draw(0..BLADE_VERTEX_COUNT, 0..instances);
        }
        backend.end_render_pass();

        // Local lights
        let bright_clear = if self.lighting.ssao_enabled {
            [0.0, 0.0, 0.0, 1.0]
        } else {
            self.lighting.ambient.extend(1.0).to_array()
        };
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Local Lights".into()),
            color_attachments: vec![gbuffer.bright.clear(bright_clear)],
            depth_stencil_attachment: Some(gbuffer.depth_load(Some(Operations::clear(0)))),
        });
        let pass = Pass {
            gbuffer: Some(gbuffer.light_inputs),
            ..base(PassType::LocalLights)
        };
        let traversal = scene.render(root, &pass, backend);
        backend.end_render_pass();
        traversal?;
        stats.passes.push(PassType::LocalLights);

        // Sky mask: stencil 1 where nothing was drawn
        let quad_uniforms = base(PassType::GlobalLights).draw_uniforms(&Mat4::IDENTITY);
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Sky Mask".into()),
            color_attachments: vec![gbuffer.bright.load()],
            depth_stencil_attachment: Some(gbuffer.depth_load(Some(Operations::clear(GROUND_STENCIL)))),
        });
        backend.set_render_pipeline(gpu.pipelines.sky_mask);
        backend.set_stencil_reference(SKY_STENCIL);
        backend.set_uniforms(0, quad_uniforms.as_bytes());
        gpu.quad.draw(backend);
        backend.end_render_pass();

        // Global lights on ground pixels, then sky fill on sky pixels
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Global Lights".into()),
            color_attachments: vec![gbuffer.bright.load()],
            depth_stencil_attachment: Some(gbuffer.depth_load(None)),
        });
        backend.set_stencil_reference(GROUND_STENCIL);
        let pass = Pass {
            gbuffer: Some(gbuffer.light_inputs),
            shadows: Some(shadow_binding),
            ..base(PassType::GlobalLights)
        };
        let traversal = scene.render(root, &pass, backend);
        if traversal.is_ok() {
            backend.set_render_pipeline(gpu.pipelines.sky_fill);
            backend.set_stencil_reference(SKY_STENCIL);
            backend.set_uniforms(
                0,
                quad_uniforms
                    .with_params([
                        self.lighting.sky_color.extend(1.0),
                        Vec4::ZERO,
                        Vec4::ZERO,
                        Vec4::ZERO,
                    ])
                    .as_bytes(),
            );
            gpu.quad.draw(backend);
        }
        backend.end_render_pass();
        traversal?;
        stats.passes.push(PassType::GlobalLights);

        // Present
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Screen".into()),
            color_attachments: vec![ColorAttachment {
                view: frame.swapchain_view,
                ops: Operations::clear([0.0, 0.0, 0.0, 1.0]),
            }],
            depth_stencil_attachment: None,
        });
        let pass = base(PassType::Screen);
        let (pipeline, params) = if debug.any() {
            (gpu.pipelines.debug, debug.as_vec4())
        } else {
            (
                gpu.pipelines.tonemap,
                Vec4::new(self.config.exposure, 0.0, 0.0, 0.0),
            )
        };
        backend.set_render_pipeline(pipeline);
        backend.set_uniforms(
            0,
            pass.draw_uniforms(&Mat4::IDENTITY)
                .with_params([params, Vec4::ZERO, Vec4::ZERO, Vec4::ZERO])
                .as_bytes(),
        );
        backend.set_bind_group(1, gpu.present_inputs);
        gpu.quad.draw(backend);
        backend.end_render_pass();
        // Present only composites the targets, scene models are not visited
        stats.passes.push(PassType::Screen);

        backend.end_frame()?;
        log::debug!(
            "Frame rendered: {} passes, {} grass instances ({} reported)",
            stats.passes.len(),
            stats.ssipg_instances,
            stats.ssipg_reported
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(backend: &mut HeadlessBackend) -> DeferredRenderer {
        let resources = ResourceManager::new();
        let mut renderer = DeferredRenderer::new(64, 32, RendererConfig::default()).unwrap();
        renderer.load(backend, &resources).unwrap();
        renderer
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(
            DeferredRenderer::new(0, 10, RendererConfig::default()),
            Err(RendererError::InvalidScreenSize { width: 0, height: 10 })
        ));
    }

    #[test]
    fn load_creates_targets_and_unload_releases_them() {
        let mut backend = HeadlessBackend::new(64, 32);
        let mut renderer = loaded(&mut backend);
        assert!(renderer.is_loaded());
        assert_eq!(backend.texture_by_label("G-Buffer Diffuse").unwrap().width, 64);
        assert_eq!(backend.texture_by_label("SSIPG Distance").unwrap().width, 32);
        assert_eq!(
            backend.texture_by_label("Shadow Cascade 3").unwrap().width,
            RendererConfig::default().shadow_map_size
        );

        renderer.unload(&mut backend).unwrap();
        assert!(!renderer.is_loaded());
        assert_eq!(backend.live_object_count(), 0);
    }

    #[test]
    fn contract_violations_are_errors() {
        let mut backend = HeadlessBackend::new(64, 32);
        let resources = ResourceManager::new();
        let mut renderer = DeferredRenderer::new(64, 32, RendererConfig::default()).unwrap();
        assert_eq!(renderer.unload(&mut backend), Err(RendererError::NotLoaded));

        let mut scene = SceneGraph::new();
        let root = scene.create_node();
        assert_eq!(
            renderer.render_frame(&mut backend, &mut scene, root, DebugShowFlags::NONE, false),
            Err(RendererError::NotLoaded)
        );

        renderer.load(&mut backend, &resources).unwrap();
        assert_eq!(
            renderer.load(&mut backend, &resources),
            Err(RendererError::AlreadyLoaded)
        );
    }

    #[test]
    fn failed_load_releases_partial_state() {
        let mut backend = HeadlessBackend::new(64, 32);
        backend.fail_creation_of("Tonemap");
        let resources = ResourceManager::new();
        let mut renderer = DeferredRenderer::new(64, 32, RendererConfig::default()).unwrap();
        assert!(matches!(
            renderer.load(&mut backend, &resources),
            Err(RendererError::Backend(BackendError::PipelineCreationFailed(_)))
        ));
        assert!(!renderer.is_loaded());
        assert_eq!(backend.live_object_count(), 0);
    }

    #[test]
    fn debug_flags_select_the_debug_view() {
        let mut backend = HeadlessBackend::new(64, 32);
        let renderer = loaded(&mut backend);
        let mut scene = SceneGraph::new();
        let root = scene.create_node();

        let flags = DebugShowFlags {
            normal: true,
            ..DebugShowFlags::NONE
        };
        renderer
            .render_frame(&mut backend, &mut scene, root, flags, false)
            .unwrap();
        let uniforms = backend
            .commands_in_pass("Screen")
            .into_iter()
            .find_map(|cmd| match cmd {
                RecordedCommand::SetUniforms { data, .. } => Some(data.clone()),
                _ => None,
            })
            .unwrap();
        let block: DrawUniforms = bytemuck::pod_read_unaligned(&uniforms);
        assert_eq!(block.params[0], Vec4::new(0.0, 1.0, 0.0, 0.0));
    }

    #[test]
    fn bright_target_starts_at_ambient_without_ssao() {
        let mut backend = HeadlessBackend::new(64, 32);
        let mut renderer = loaded(&mut backend);
        renderer.set_ssao_enabled(false);
        renderer.set_ambient_light(Vec3::new(0.2, 0.3, 0.4));
        let mut scene = SceneGraph::new();
        let root = scene.create_node();

        renderer
            .render_frame(&mut backend, &mut scene, root, DebugShowFlags::NONE, false)
            .unwrap();
        let clear = backend.render_pass("Local Lights").unwrap().color_attachments[0].ops;
        assert_eq!(clear.load, LoadOp::Clear([0.2, 0.3, 0.4, 1.0]));

        renderer.set_ssao_enabled(true);
        backend.clear_commands();
        renderer
            .render_frame(&mut backend, &mut scene, root, DebugShowFlags::NONE, false)
            .unwrap();
        let clear = backend.render_pass("Local Lights").unwrap().color_attachments[0].ops;
        assert_eq!(clear.load, LoadOp::Clear([0.0, 0.0, 0.0, 1.0]));
    }

    #[test]
    fn degenerate_sun_direction_is_ignored() {
        let mut renderer = DeferredRenderer::new(8, 8, RendererConfig::default()).unwrap();
        let before = renderer.lighting().sun_direction;
        renderer.set_sun_direction(Vec3::ZERO);
        assert_eq!(renderer.lighting().sun_direction, before);
        renderer.set_sun_direction(Vec3::new(0.0, -2.0, 0.0));
        assert_eq!(renderer.lighting().sun_direction, Vec3::NEG_Y);
    }
}
