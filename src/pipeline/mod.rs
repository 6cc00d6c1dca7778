//! Deferred rendering pipeline
//!
//! One frame runs these scene traversals in a fixed order:
//! 1. Shadow - depth of every cascade from the sun
//! 2. SSIPG - half resolution capture, then compute generation of grass instances
//! 3. Geometry - diffuse and normal into the G-buffer, then the grass blades
//! 4. Local lights - stencil tested light volumes added to the bright target
//! 5. Global lights - sun and ambient on ground pixels, sky color on sky pixels
//! 6. Screen - tonemap (or debug view) to the swapchain

pub mod deferred;
pub mod fullscreen;
pub mod model;
pub mod pass;
pub mod shaders;
pub mod ssipg;
pub mod targets;

pub use deferred::{DebugShowFlags, DeferredRenderer, FrameStats};
pub use fullscreen::FullscreenQuad;
pub use model::{LoadContext, Model, ModelHandle, PassLayouts};
pub use pass::{
    DrawUniforms, LightingParams, Pass, PassCamera, PassMask, PassState, PassType, ShadowBinding,
    StencilMode, CASCADE_COUNT, GROUND_STENCIL, SKY_STENCIL,
};
pub use ssipg::{clamp_instance_count, SsipgTargets, SSIPG_COUNTER_LABEL};
pub use targets::{GBuffer, RenderTarget, ShadowCascades, ShadowTargets};
