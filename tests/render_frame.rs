//! Full frames recorded through the headless backend

use std::sync::Arc;

use glam::{Mat4, Vec3};
use parking_lot::Mutex;
use sho_engine::backend::{BackendError, BackendResult, GraphicsBackend, HeadlessBackend, RecordedCommand};
use sho_engine::models::{DirectionalLightModel, MeshModel, PointLightModel};
use sho_engine::pipeline::ssipg::ssipg_capacity;
use sho_engine::pipeline::{LoadContext, Model, Pass, PassMask, PassType, SSIPG_COUNTER_LABEL};
use sho_engine::scene::SceneError;
use sho_engine::{
    DebugShowFlags, DeferredRenderer, RendererConfig, RendererError, ResourceManager, SceneGraph,
    Transform,
};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

/// Model that remembers which passes reached it
struct Recorder {
    name: String,
    passes: PassMask,
    fail_load: bool,
    loaded: Mutex<bool>,
    seen: Mutex<Vec<PassType>>,
}

impl Recorder {
    fn new(name: &str, passes: PassMask) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            passes,
            fail_load: false,
            loaded: Mutex::new(false),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            passes: PassMask::of(PassType::Geometry),
            fail_load: true,
            loaded: Mutex::new(false),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn count(&self, pass_type: PassType) -> usize {
        self.seen.lock().iter().filter(|p| **p == pass_type).count()
    }
}

impl Model for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn passes(&self) -> PassMask {
        self.passes
    }

    fn load(&self, _ctx: &mut LoadContext<'_>) -> BackendResult<()> {
        if self.fail_load {
            return Err(BackendError::PipelineCreationFailed(self.name.clone()));
        }
        *self.loaded.lock() = true;
        Ok(())
    }

    fn unload(&self, _backend: &mut dyn GraphicsBackend) {
        *self.loaded.lock() = false;
    }

    fn is_loaded(&self) -> bool {
        *self.loaded.lock()
    }

    fn render(&self, pass: &Pass, _world: &Mat4, _backend: &mut dyn GraphicsBackend) {
        self.seen.lock().push(pass.pass_type);
    }
}

fn loaded_renderer(backend: &mut HeadlessBackend, resources: &ResourceManager) -> DeferredRenderer {
    let mut renderer = DeferredRenderer::new(WIDTH, HEIGHT, RendererConfig::default()).unwrap();
    renderer.load(backend, resources).unwrap();
    renderer
}

#[test]
fn passes_run_in_order() {
    let mut backend = HeadlessBackend::new(WIDTH, HEIGHT);
    let resources = ResourceManager::new();
    let renderer = loaded_renderer(&mut backend, &resources);
    let mut scene = SceneGraph::new();
    let root = scene.create_node();

    let stats = renderer
        .render_frame(&mut backend, &mut scene, root, DebugShowFlags::NONE, false)
        .unwrap();
    assert_eq!(
        stats.passes,
        vec![
            PassType::Shadow,
            PassType::Shadow,
            PassType::Shadow,
            PassType::Shadow,
            PassType::Ssipg,
            PassType::Geometry,
            PassType::LocalLights,
            PassType::GlobalLights,
            PassType::Screen,
        ]
    );
    assert_eq!(
        backend.pass_labels(),
        vec![
            "Shadow Cascade 0",
            "Shadow Cascade 1",
            "Shadow Cascade 2",
            "Shadow Cascade 3",
            "SSIPG Capture",
            "SSIPG Generate",
            "G-Buffer",
            "G-Buffer Particles",
            "Local Lights",
            "Sky Mask",
            "Global Lights",
            "Screen",
        ]
    );
}

#[test]
fn models_only_see_their_passes() {
    let mut backend = HeadlessBackend::new(WIDTH, HEIGHT);
    let resources = ResourceManager::new();
    let renderer = loaded_renderer(&mut backend, &resources);
    let mut scene = SceneGraph::new();
    let root = scene.create_node();

    let solid = Recorder::new("solid", PassMask::of(PassType::Geometry).with(PassType::Shadow));
    let light = Recorder::new("light", PassMask::of(PassType::LocalLights).with(PassType::GlobalLights));
    let a = scene.spawn(Some(root), Transform::default()).unwrap();
    let b = scene.spawn(Some(root), Transform::from_translation(Vec3::X)).unwrap();
    scene.grab_model(a, solid.clone()).unwrap();
    scene.grab_model(b, light.clone()).unwrap();
    assert_eq!(renderer.load_models(&mut backend, &scene, &resources).unwrap(), 2);

    renderer
        .render_frame(&mut backend, &mut scene, root, DebugShowFlags::NONE, false)
        .unwrap();

    assert_eq!(solid.count(PassType::Shadow), 4);
    assert_eq!(solid.count(PassType::Geometry), 1);
    assert_eq!(solid.seen.lock().len(), 5);
    assert_eq!(light.count(PassType::LocalLights), 1);
    assert_eq!(light.count(PassType::GlobalLights), 1);
    assert_eq!(light.count(PassType::Screen), 0);
    assert_eq!(light.seen.lock().len(), 2);
}

#[test]
fn present_does_not_visit_scene_models() {
    let mut backend = HeadlessBackend::new(WIDTH, HEIGHT);
    let resources = ResourceManager::new();
    let renderer = loaded_renderer(&mut backend, &resources);
    let mut scene = SceneGraph::new();
    let root = scene.create_node();
    let greedy = Recorder::new("greedy", PassMask::ALL);
    scene.grab_model(root, greedy.clone()).unwrap();
    renderer.load_models(&mut backend, &scene, &resources).unwrap();

    let stats = renderer
        .render_frame(&mut backend, &mut scene, root, DebugShowFlags::NONE, false)
        .unwrap();
    assert_eq!(stats.passes.last(), Some(&PassType::Screen));
    assert_eq!(greedy.count(PassType::Screen), 0);
    assert_eq!(
        *greedy.seen.lock(),
        vec![
            PassType::Shadow,
            PassType::Shadow,
            PassType::Shadow,
            PassType::Shadow,
            PassType::Ssipg,
            PassType::Geometry,
            PassType::LocalLights,
            PassType::GlobalLights,
        ]
    );
}

#[test]
fn disabled_shadows_skip_the_cascades() {
    let mut backend = HeadlessBackend::new(WIDTH, HEIGHT);
    let resources = ResourceManager::new();
    let mut renderer = loaded_renderer(&mut backend, &resources);
    renderer.set_shadows_enabled(false);
    let mut scene = SceneGraph::new();
    let root = scene.create_node();
    let solid = Recorder::new("solid", PassMask::of(PassType::Geometry).with(PassType::Shadow));
    scene.grab_model(root, solid.clone()).unwrap();
    renderer.load_models(&mut backend, &scene, &resources).unwrap();

    let stats = renderer
        .render_frame(&mut backend, &mut scene, root, DebugShowFlags::NONE, false)
        .unwrap();
    assert!(!stats.passes.contains(&PassType::Shadow));
    assert_eq!(solid.count(PassType::Shadow), 0);
    assert_eq!(solid.count(PassType::Geometry), 1);
}

#[test]
fn grass_instances_are_clamped_to_capacity() {
    let mut backend = HeadlessBackend::new(WIDTH, HEIGHT);
    let resources = ResourceManager::new();
    let renderer = loaded_renderer(&mut backend, &resources);
    let mut scene = SceneGraph::new();
    let root = scene.create_node();
    backend.set_readback_value(SSIPG_COUNTER_LABEL, &u32::MAX.to_le_bytes());

    let stats = renderer
        .render_frame(&mut backend, &mut scene, root, DebugShowFlags::NONE, false)
        .unwrap();
    let capacity = ssipg_capacity(WIDTH, HEIGHT);
    assert_eq!(stats.ssipg_reported, u32::MAX);
    assert_eq!(stats.ssipg_instances, capacity);

    let instanced = backend
        .commands_in_pass("G-Buffer Particles")
        .into_iter()
        .find_map(|cmd| match cmd {
            RecordedCommand::Draw { instances, .. } => Some(instances.clone()),
            _ => None,
        });
    assert_eq!(instanced, Some(0..capacity));
}

#[test]
fn empty_counter_draws_no_grass() {
    let mut backend = HeadlessBackend::new(WIDTH, HEIGHT);
    let resources = ResourceManager::new();
    let renderer = loaded_renderer(&mut backend, &resources);
    let mut scene = SceneGraph::new();
    let root = scene.create_node();

    let stats = renderer
        .render_frame(&mut backend, &mut scene, root, DebugShowFlags::NONE, false)
        .unwrap();
    assert_eq!(stats.ssipg_instances, 0);
    assert!(backend.commands_in_pass("G-Buffer Particles").is_empty());
}

#[test]
fn counter_is_reset_before_generation() {
    let mut backend = HeadlessBackend::new(WIDTH, HEIGHT);
    let resources = ResourceManager::new();
    let renderer = loaded_renderer(&mut backend, &resources);
    let mut scene = SceneGraph::new();
    let root = scene.create_node();
    renderer
        .render_frame(&mut backend, &mut scene, root, DebugShowFlags::NONE, false)
        .unwrap();

    let counter = backend.buffer_by_label(SSIPG_COUNTER_LABEL).unwrap();
    let commands = backend.commands();
    let cleared = commands
        .iter()
        .position(|cmd| matches!(cmd, RecordedCommand::ClearBuffer(b) if *b == counter))
        .unwrap();
    let dispatched = commands
        .iter()
        .position(|cmd| matches!(cmd, RecordedCommand::Dispatch { .. }))
        .unwrap();
    let read = commands
        .iter()
        .position(|cmd| matches!(cmd, RecordedCommand::ReadBuffer(b) if *b == counter))
        .unwrap();
    assert!(cleared < dispatched);
    assert!(dispatched < read);
}

#[test]
fn contract_violations_are_reported() {
    let mut backend = HeadlessBackend::new(WIDTH, HEIGHT);
    let resources = ResourceManager::new();
    let mut scene = SceneGraph::new();
    let root = scene.create_node();

    let mut renderer = DeferredRenderer::new(WIDTH, HEIGHT, RendererConfig::default()).unwrap();
    assert_eq!(
        renderer.render_frame(&mut backend, &mut scene, root, DebugShowFlags::NONE, false),
        Err(RendererError::NotLoaded)
    );
    assert_eq!(
        renderer.load_models(&mut backend, &scene, &resources),
        Err(RendererError::NotLoaded)
    );

    renderer.load(&mut backend, &resources).unwrap();
    assert_eq!(
        renderer.load(&mut backend, &resources),
        Err(RendererError::AlreadyLoaded)
    );

    let stale = scene.create_node();
    scene.remove_node(stale).unwrap();
    assert_eq!(
        renderer.render_frame(&mut backend, &mut scene, stale, DebugShowFlags::NONE, false),
        Err(RendererError::Scene(SceneError::StaleNode(stale)))
    );
    // A rejected frame leaves the backend ready for the next one
    assert!(renderer
        .render_frame(&mut backend, &mut scene, root, DebugShowFlags::NONE, false)
        .is_ok());
}

#[test]
fn failed_load_is_fatal_and_releases_everything() {
    let mut backend = HeadlessBackend::new(WIDTH, HEIGHT);
    let resources = ResourceManager::new();
    backend.fail_creation_of("SSIPG Generate");

    let mut renderer = DeferredRenderer::new(WIDTH, HEIGHT, RendererConfig::default()).unwrap();
    assert!(matches!(
        renderer.load(&mut backend, &resources),
        Err(RendererError::Backend(_))
    ));
    assert!(!renderer.is_loaded());
    assert_eq!(backend.live_object_count(), 0);
}

#[test]
fn failing_models_do_not_stop_the_others() {
    let mut backend = HeadlessBackend::new(WIDTH, HEIGHT);
    let resources = ResourceManager::new();
    let renderer = loaded_renderer(&mut backend, &resources);
    let mut scene = SceneGraph::new();
    let root = scene.create_node();

    let broken = Recorder::failing("broken");
    let fine = Recorder::new("fine", PassMask::of(PassType::Geometry));
    let a = scene.spawn(Some(root), Transform::default()).unwrap();
    let b = scene.spawn(Some(root), Transform::default()).unwrap();
    scene.grab_model(a, broken.clone()).unwrap();
    scene.grab_model(b, fine.clone()).unwrap();

    assert_eq!(renderer.load_models(&mut backend, &scene, &resources).unwrap(), 1);
    assert!(!broken.is_loaded());
    assert!(fine.is_loaded());

    renderer
        .render_frame(&mut backend, &mut scene, root, DebugShowFlags::NONE, false)
        .unwrap();
    assert!(broken.seen.lock().is_empty());
    assert_eq!(fine.count(PassType::Geometry), 1);
}

#[test]
fn built_in_models_render_a_full_scene() {
    let mut backend = HeadlessBackend::new(WIDTH, HEIGHT);
    let resources = ResourceManager::new();
    let mut renderer = loaded_renderer(&mut backend, &resources);
    renderer.set_camera_view_matrix(Mat4::look_at_rh(Vec3::new(0.0, 4.0, 10.0), Vec3::ZERO, Vec3::Y));

    let mut scene = SceneGraph::new();
    let root = scene.create_node();
    let ground = scene
        .spawn(Some(root), Transform::default().with_scale(Vec3::new(20.0, 1.0, 20.0)))
        .unwrap();
    scene
        .grab_model(
            ground,
            Arc::new(MeshModel::new("Ground", &resources, "plane", "white").as_grass_surface()),
        )
        .unwrap();
    let lamp = scene
        .spawn(Some(root), Transform::from_translation(Vec3::new(0.0, 1.0, 0.0)))
        .unwrap();
    scene
        .grab_model(
            lamp,
            Arc::new(PointLightModel::new("Lamp", &resources, Vec3::ONE, 2.0, 4.0)),
        )
        .unwrap();
    let sun = scene.spawn(Some(root), Transform::default()).unwrap();
    scene
        .grab_model(sun, Arc::new(DirectionalLightModel::new("Sun", Vec3::ONE, 1.0)))
        .unwrap();
    assert_eq!(renderer.load_models(&mut backend, &scene, &resources).unwrap(), 3);

    backend.set_readback_value(SSIPG_COUNTER_LABEL, &100u32.to_le_bytes());
    let stats = renderer
        .render_frame(&mut backend, &mut scene, root, DebugShowFlags::NONE, false)
        .unwrap();
    assert_eq!(stats.ssipg_instances, 100);

    let draws_in = |label: &str| {
        backend
            .commands_in_pass(label)
            .into_iter()
            .filter(|cmd| matches!(cmd, RecordedCommand::Draw { .. } | RecordedCommand::DrawIndexed { .. }))
            .count()
    };
    for cascade in 0..4 {
        assert_eq!(draws_in(&format!("Shadow Cascade {cascade}")), 1);
    }
    assert_eq!(draws_in("SSIPG Capture"), 1);
    assert_eq!(draws_in("G-Buffer"), 1);
    assert_eq!(draws_in("G-Buffer Particles"), 1);
    // mark and shade sub-draws
    assert_eq!(draws_in("Local Lights"), 2);
    assert_eq!(draws_in("Sky Mask"), 1);
    // sun quad plus sky fill
    assert_eq!(draws_in("Global Lights"), 2);
    assert_eq!(draws_in("Screen"), 1);

    scene.unload_models(&mut backend);
    renderer.unload(&mut backend).unwrap();
    resources.release_gpu_resources(&mut backend);
    assert_eq!(backend.live_object_count(), 0);
}
