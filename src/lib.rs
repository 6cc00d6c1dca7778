//! Sho Engine - a deferred renderer with screen-space instanced procedural grass
//!
//! The renderer draws a scene graph of models through a fixed sequence of
//! passes on top of a small GPU backend abstraction:
//! - **wgpu**: the windowed backend used by applications
//! - **headless**: records commands without a GPU, used by the tests
//!
//! # Features
//! - Scene graph with cached world transforms
//! - Four cascade directional shadows
//! - G-buffer geometry with stencil-masked light volumes
//! - Grass instances generated on the GPU from a half resolution capture
//! - Tonemapped output with debug views of the intermediate targets

pub mod backend;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod resources;
pub mod scene;

use glam::Vec3;

pub use backend::{GraphicsBackend, HeadlessBackend, WgpuBackend};
pub use error::RendererError;
pub use pipeline::{DebugShowFlags, DeferredRenderer, FrameStats, CASCADE_COUNT};
pub use resources::ResourceManager;
pub use scene::{Camera, NodeId, SceneGraph, Transform};

/// Configuration for the deferred renderer
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    /// Resolution of every shadow cascade map
    pub shadow_map_size: u32,
    /// Cascade split blend, 0 is uniform and 1 is logarithmic
    pub cascade_lambda: f32,
    /// Extra depth in front of each cascade for off-screen casters
    pub shadow_caster_margin: f32,
    /// World distance between generated grass blades
    pub grass_spacing: f32,
    pub grass_height: f32,
    pub grass_width: f32,
    /// Direction the sunlight travels
    pub sun_direction: Vec3,
    pub ambient: Vec3,
    pub sky_color: Vec3,
    pub ssao_enabled: bool,
    pub shadows_enabled: bool,
    /// Tonemap exposure
    pub exposure: f32,
    /// Enable vsync
    pub vsync: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            shadow_map_size: 1024,
            cascade_lambda: 1.0,
            shadow_caster_margin: 50.0,
            grass_spacing: 0.1,
            grass_height: 0.3,
            grass_width: 0.04,
            sun_direction: Vec3::new(-0.3, -1.0, -0.2),
            ambient: Vec3::splat(0.1),
            sky_color: Vec3::new(0.5, 0.7, 1.0),
            ssao_enabled: false,
            shadows_enabled: true,
            exposure: 1.0,
            vsync: true,
        }
    }
}
