//! Sandbox scene for the deferred renderer
//!
//! Run with:
//!   cargo run --example sandbox
//!   cargo run --example sandbox -- --debug normal --lights 16
//!
//! Controls:
//!   1-4      - Toggle diffuse / normal / SSIPG distance / SSIPG diffuse views
//!   F        - Toggle wireframe
//!   G        - Toggle shadows
//!   O        - Toggle SSAO
//!   Space    - Pause the camera orbit
//!   Escape   - Exit

use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use glam::{Mat4, Quat, Vec3, Vec4};
use sho_engine::{
    backend::{BackendError, GraphicsBackend},
    models::{DirectionalLightModel, MeshModel, PointLightModel},
    DebugShowFlags, DeferredRenderer, NodeId, RendererConfig, RendererError, ResourceManager,
    SceneGraph, Transform, WgpuBackend,
};
use winit::{
    dpi::PhysicalSize,
    event::{ElementState, Event, KeyEvent, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    keyboard::{KeyCode, PhysicalKey},
    window::WindowBuilder,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DebugView {
    Diffuse,
    Normal,
    SsipgDistance,
    SsipgDiffuse,
}

#[derive(Debug, Parser)]
#[command(about = "Deferred renderer sandbox")]
struct Args {
    #[arg(long, default_value_t = 1280)]
    width: u32,
    #[arg(long, default_value_t = 720)]
    height: u32,
    /// Number of point lights circling the scene
    #[arg(long, default_value_t = 8)]
    lights: usize,
    #[arg(long, default_value_t = 1024)]
    shadow_map_size: u32,
    #[arg(long)]
    no_shadows: bool,
    #[arg(long)]
    ssao: bool,
    #[arg(long)]
    no_vsync: bool,
    /// Start with a debug view instead of the tonemapped frame
    #[arg(long, value_enum)]
    debug: Option<DebugView>,
}

struct AppState {
    debug: DebugShowFlags,
    wireframe: bool,
    paused: bool,
    angle: f32,
    last_frame: Instant,
}

impl AppState {
    fn new(debug: Option<DebugView>) -> Self {
        let mut flags = DebugShowFlags::NONE;
        match debug {
            Some(DebugView::Diffuse) => flags.diffuse = true,
            Some(DebugView::Normal) => flags.normal = true,
            Some(DebugView::SsipgDistance) => flags.ssipg_distance = true,
            Some(DebugView::SsipgDiffuse) => flags.ssipg_diffuse = true,
            None => {}
        }
        Self {
            debug: flags,
            wireframe: false,
            paused: false,
            angle: 0.0,
            last_frame: Instant::now(),
        }
    }
}

/// Renderer plus the scene it draws
struct Sandbox {
    backend: WgpuBackend,
    resources: ResourceManager,
    renderer: DeferredRenderer,
    scene: SceneGraph,
    root: NodeId,
}

impl Sandbox {
    fn new(window: Arc<winit::window::Window>, config: RendererConfig, lights: usize) -> Result<Self, RendererError> {
        let backend = WgpuBackend::new(window, config.vsync)?;
        let (width, height) = backend.surface_size();
        let resources = ResourceManager::new();
        let (scene, root) = build_scene(&resources, lights)?;
        let renderer = DeferredRenderer::new(width, height, config)?;
        let mut sandbox = Self {
            backend,
            resources,
            renderer,
            scene,
            root,
        };
        sandbox.load()?;
        Ok(sandbox)
    }

    fn load(&mut self) -> Result<(), RendererError> {
        self.renderer.load(&mut self.backend, &self.resources)?;
        self.renderer.set_camera_projection(60.0, 0.1, 200.0);
        let loaded = self
            .renderer
            .load_models(&mut self.backend, &self.scene, &self.resources)?;
        log::info!("Sandbox ready with {} models", loaded);
        Ok(())
    }

    /// Targets and model pipelines are tied to the surface size, rebuild them all
    fn resize(&mut self, width: u32, height: u32) -> Result<(), RendererError> {
        self.backend.resize(width, height);
        let (width, height) = self.backend.surface_size();
        self.scene.unload_models(&mut self.backend);
        if self.renderer.is_loaded() {
            self.renderer.unload(&mut self.backend)?;
        }
        let mut renderer = DeferredRenderer::new(width, height, self.renderer.config().clone())?;
        let lighting = *self.renderer.lighting();
        renderer.set_ssao_enabled(lighting.ssao_enabled);
        renderer.set_shadows_enabled(lighting.shadows_enabled);
        renderer.set_camera_view_matrix(self.renderer.camera().view_matrix());
        self.renderer = renderer;
        self.load()
    }

    fn render(&mut self, state: &AppState) -> Result<(), RendererError> {
        let eye = Quat::from_rotation_y(state.angle) * Vec3::new(0.0, 6.0, 18.0);
        self.renderer
            .set_camera_view_matrix(Mat4::look_at_rh(eye, Vec3::new(0.0, 1.0, 0.0), Vec3::Y));
        let stats = self.renderer.render_frame(
            &mut self.backend,
            &mut self.scene,
            self.root,
            state.debug,
            state.wireframe,
        )?;
        log::trace!("Frame drew {} grass blades", stats.ssipg_instances);
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.scene.unload_models(&mut self.backend);
        if self.renderer.is_loaded() {
            let _ = self.renderer.unload(&mut self.backend);
        }
        self.resources.release_gpu_resources(&mut self.backend);
    }
}

fn build_scene(resources: &ResourceManager, lights: usize) -> Result<(SceneGraph, NodeId), RendererError> {
    let mut scene = SceneGraph::new();
    let root = scene.create_node();

    let ground = scene.spawn(Some(root), Transform::default().with_scale(Vec3::new(40.0, 1.0, 40.0)))?;
    scene.grab_model(
        ground,
        Arc::new(
            MeshModel::new("Ground", resources, "plane", "white")
                .with_tint(Vec4::new(0.35, 0.55, 0.25, 1.0))
                .as_grass_surface()
                .with_grass_pressure(Vec3::new(1.0, 0.0, 0.3), 0.35),
        ),
    )?;

    let cube = Arc::new(MeshModel::new("Crate", resources, "cube", "white").with_tint(Vec4::new(0.8, 0.6, 0.4, 1.0)));
    for i in 0..5 {
        let x = (i as f32 - 2.0) * 3.0;
        let node = scene.spawn(
            Some(root),
            Transform::from_translation(Vec3::new(x, 0.75 + i as f32 * 0.25, -2.0))
                .with_orientation(Quat::from_rotation_y(i as f32 * 0.4))
                .with_scale(Vec3::splat(1.5)),
        )?;
        scene.grab_model(node, cube.clone())?;
    }

    let ball = scene.spawn(Some(root), Transform::from_translation(Vec3::new(0.0, 1.5, 3.0)).with_scale(Vec3::splat(3.0)))?;
    scene.grab_model(ball, Arc::new(MeshModel::new("Ball", resources, "sphere", "white")))?;

    for i in 0..lights {
        let t = i as f32 / lights.max(1) as f32 * std::f32::consts::TAU;
        let color = Vec3::new(0.5 + 0.5 * t.cos(), 0.5 + 0.5 * (t + 2.1).cos(), 0.5 + 0.5 * (t + 4.2).cos());
        let node = scene.spawn(
            Some(root),
            Transform::from_translation(Vec3::new(9.0 * t.cos(), 1.0, 9.0 * t.sin())),
        )?;
        scene.grab_model(
            node,
            Arc::new(PointLightModel::new(&format!("Lamp {}", i), resources, color, 3.0, 5.0)),
        )?;
    }

    let sun = scene.create_node();
    scene.add_child(root, sun)?;
    scene.grab_model(sun, Arc::new(DirectionalLightModel::new("Sun", Vec3::new(1.0, 0.95, 0.85), 1.5)))?;

    log::info!("Scene built with {} nodes", scene.len());
    Ok((scene, root))
}

fn handle_key(code: KeyCode, sandbox: &mut Sandbox, state: &mut AppState, elwt: &EventLoopWindowTarget<()>) {
    match code {
        KeyCode::Escape => elwt.exit(),
        KeyCode::Digit1 => state.debug.diffuse = !state.debug.diffuse,
        KeyCode::Digit2 => state.debug.normal = !state.debug.normal,
        KeyCode::Digit3 => state.debug.ssipg_distance = !state.debug.ssipg_distance,
        KeyCode::Digit4 => state.debug.ssipg_diffuse = !state.debug.ssipg_diffuse,
        KeyCode::KeyF => state.wireframe = !state.wireframe,
        KeyCode::KeyG => {
            let enabled = !sandbox.renderer.lighting().shadows_enabled;
            sandbox.renderer.set_shadows_enabled(enabled);
            println!("Shadows: {}", enabled);
        }
        KeyCode::KeyO => {
            let enabled = !sandbox.renderer.lighting().ssao_enabled;
            sandbox.renderer.set_ssao_enabled(enabled);
            println!("SSAO: {}", enabled);
        }
        KeyCode::Space => state.paused = !state.paused,
        _ => {}
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = RendererConfig {
        shadow_map_size: args.shadow_map_size,
        shadows_enabled: !args.no_shadows,
        ssao_enabled: args.ssao,
        vsync: !args.no_vsync,
        ..RendererConfig::default()
    };

    let event_loop = EventLoop::new().expect("Failed to create event loop");
    let window = Arc::new(
        WindowBuilder::new()
            .with_title("Sho Engine Sandbox")
            .with_inner_size(PhysicalSize::new(args.width, args.height))
            .build(&event_loop)
            .expect("Failed to create window"),
    );

    let mut sandbox = match Sandbox::new(Arc::clone(&window), config, args.lights) {
        Ok(sandbox) => sandbox,
        Err(e) => {
            eprintln!("Failed to create renderer: {}", e);
            return;
        }
    };
    let mut state = AppState::new(args.debug);

    let window_clone = Arc::clone(&window);
    event_loop
        .run(move |event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);
            match event {
                Event::WindowEvent { event, .. } => match event {
                    WindowEvent::CloseRequested => elwt.exit(),
                    WindowEvent::Resized(size) => {
                        if size.width > 0 && size.height > 0 {
                            if let Err(e) = sandbox.resize(size.width, size.height) {
                                log::error!("Resize failed: {}", e);
                                elwt.exit();
                            }
                        }
                    }
                    WindowEvent::KeyboardInput {
                        event:
                            KeyEvent {
                                physical_key: PhysicalKey::Code(code),
                                state: ElementState::Pressed,
                                repeat: false,
                                ..
                            },
                        ..
                    } => handle_key(code, &mut sandbox, &mut state, elwt),
                    WindowEvent::RedrawRequested => match sandbox.render(&state) {
                        Ok(()) => {}
                        Err(RendererError::Backend(BackendError::SurfaceLost)) => {
                            let size = window_clone.inner_size();
                            if let Err(e) = sandbox.resize(size.width, size.height) {
                                log::error!("Surface recovery failed: {}", e);
                                elwt.exit();
                            }
                        }
                        Err(e) => {
                            log::error!("Frame failed: {}", e);
                            elwt.exit();
                        }
                    },
                    _ => {}
                },
                Event::AboutToWait => {
                    let now = Instant::now();
                    let dt = (now - state.last_frame).as_secs_f32();
                    state.last_frame = now;
                    if !state.paused {
                        state.angle += dt * 0.2;
                    }
                    window_clone.request_redraw();
                }
                _ => {}
            }
        })
        .expect("Event loop failed");
}
