//! Pass descriptor and the per-pass pipeline state table

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::backend::*;
use crate::pipeline::fullscreen::FullscreenQuad;
use crate::scene::Camera;

/// Number of shadow cascades rendered each frame
pub const CASCADE_COUNT: usize = 4;

/// Color formats of the G-buffer: diffuse, normal (rgb) + eye distance (a)
pub const GBUFFER_COLOR_FORMATS: [TextureFormat; 2] =
    [TextureFormat::Rgba8Unorm, TextureFormat::Rgba16Float];

/// Format of the brightness accumulation target
pub const BRIGHT_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

/// Depth-stencil format shared by the G-buffer and the light passes
pub const GBUFFER_DEPTH_FORMAT: TextureFormat = TextureFormat::Depth24PlusStencil8;

/// Color formats of the SSIPG capture: eye distance, diffuse, orientation, pressure
pub const SSIPG_COLOR_FORMATS: [TextureFormat; 4] = [
    TextureFormat::R32Float,
    TextureFormat::Rgba8Unorm,
    TextureFormat::Rgba16Float,
    TextureFormat::Rgba16Float,
];

pub const SHADOW_FORMAT: TextureFormat = TextureFormat::Depth32Float;

/// Kind of scene traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassType {
    Shadow,
    Ssipg,
    Geometry,
    LocalLights,
    GlobalLights,
    Screen,
}

impl PassType {
    /// Order in which pass types run within one frame
    pub const FRAME_ORDER: [PassType; 6] = [
        PassType::Shadow,
        PassType::Ssipg,
        PassType::Geometry,
        PassType::LocalLights,
        PassType::GlobalLights,
        PassType::Screen,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PassType::Shadow => "Shadow",
            PassType::Ssipg => "SSIPG",
            PassType::Geometry => "Geometry",
            PassType::LocalLights => "Local Lights",
            PassType::GlobalLights => "Global Lights",
            PassType::Screen => "Screen",
        }
    }

    fn bit(&self) -> u8 {
        match self {
            PassType::Shadow => 1 << 0,
            PassType::Ssipg => 1 << 1,
            PassType::Geometry => 1 << 2,
            PassType::LocalLights => 1 << 3,
            PassType::GlobalLights => 1 << 4,
            PassType::Screen => 1 << 5,
        }
    }

    /// Fixed GPU state a model must use when drawing in this pass
    pub fn state(&self) -> PassState {
        match self {
            PassType::Shadow => PassState {
                depth_compare: CompareFunction::Less,
                depth_write: true,
                stencil: StencilMode::Disabled,
                blend: None,
                cull: CullMode::Back,
                color_formats: &[],
                presents: false,
                depth_format: Some(SHADOW_FORMAT),
            },
            PassType::Ssipg => PassState {
                depth_compare: CompareFunction::Less,
                depth_write: true,
                stencil: StencilMode::Disabled,
                blend: None,
                cull: CullMode::Back,
                color_formats: &SSIPG_COLOR_FORMATS,
                presents: false,
                depth_format: Some(SHADOW_FORMAT),
            },
            PassType::Geometry => PassState {
                depth_compare: CompareFunction::Less,
                depth_write: true,
                stencil: StencilMode::Disabled,
                blend: None,
                cull: CullMode::Back,
                color_formats: &GBUFFER_COLOR_FORMATS,
                presents: false,
                depth_format: Some(GBUFFER_DEPTH_FORMAT),
            },
            PassType::LocalLights => PassState {
                depth_compare: CompareFunction::Always,
                depth_write: false,
                stencil: StencilMode::VolumeShade,
                blend: Some(BlendState::additive()),
                cull: CullMode::Front,
                color_formats: &[BRIGHT_FORMAT],
                presents: false,
                depth_format: Some(GBUFFER_DEPTH_FORMAT),
            },
            PassType::GlobalLights => PassState {
                depth_compare: CompareFunction::Always,
                depth_write: false,
                stencil: StencilMode::MaskEqual,
                blend: Some(BlendState::additive()),
                cull: CullMode::None,
                color_formats: &[BRIGHT_FORMAT],
                presents: false,
                depth_format: Some(GBUFFER_DEPTH_FORMAT),
            },
            PassType::Screen => PassState {
                depth_compare: CompareFunction::Always,
                depth_write: false,
                stencil: StencilMode::Disabled,
                blend: None,
                cull: CullMode::None,
                color_formats: &[],
                presents: true,
                depth_format: None,
            },
        }
    }
}

/// Set of pass types a model responds to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassMask(u8);

impl PassMask {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0x3F);

    pub fn of(pass: PassType) -> Self {
        Self(pass.bit())
    }

    pub fn contains(&self, pass: PassType) -> bool {
        self.0 & pass.bit() != 0
    }

    pub fn with(self, pass: PassType) -> Self {
        Self(self.0 | pass.bit())
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for PassMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl FromIterator<PassType> for PassMask {
    fn from_iter<I: IntoIterator<Item = PassType>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

/// Stencil usage of a draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StencilMode {
    Disabled,
    /// Count light-volume faces behind the G-buffer surface
    VolumeMark,
    /// Shade where the count is non-zero and reset it
    VolumeShade,
    /// Replace with the reference where the depth test passes
    MaskWrite,
    /// Pass only where the stencil equals the reference
    MaskEqual,
}

impl StencilMode {
    pub fn stencil_state(&self) -> StencilState {
        let face = |compare, depth_fail_op, pass_op| StencilFaceState {
            compare,
            fail_op: StencilOperation::Keep,
            depth_fail_op,
            pass_op,
        };
        match self {
            StencilMode::Disabled => StencilState::default(),
            StencilMode::VolumeMark => StencilState {
                front: face(
                    CompareFunction::Always,
                    StencilOperation::DecrementWrap,
                    StencilOperation::Keep,
                ),
                back: face(
                    CompareFunction::Always,
                    StencilOperation::IncrementWrap,
                    StencilOperation::Keep,
                ),
                read_mask: 0xFF,
                write_mask: 0xFF,
            },
            StencilMode::VolumeShade => {
                let shade = face(
                    CompareFunction::NotEqual,
                    StencilOperation::Keep,
                    StencilOperation::Zero,
                );
                StencilState {
                    front: shade,
                    back: shade,
                    read_mask: 0xFF,
                    write_mask: 0xFF,
                }
            }
            StencilMode::MaskWrite => {
                let write = face(
                    CompareFunction::Always,
                    StencilOperation::Keep,
                    StencilOperation::Replace,
                );
                StencilState {
                    front: write,
                    back: write,
                    read_mask: 0xFF,
                    write_mask: 0xFF,
                }
            }
            StencilMode::MaskEqual => {
                let equal = face(
                    CompareFunction::Equal,
                    StencilOperation::Keep,
                    StencilOperation::Keep,
                );
                StencilState {
                    front: equal,
                    back: equal,
                    read_mask: 0xFF,
                    write_mask: 0,
                }
            }
        }
    }
}

/// Stencil reference marking sky pixels
pub const SKY_STENCIL: u32 = 1;

/// Stencil reference marking pixels covered by geometry
pub const GROUND_STENCIL: u32 = 0;

/// Pipeline state of one pass, see [`PassType::state`]
#[derive(Debug, Clone, PartialEq)]
pub struct PassState {
    pub depth_compare: CompareFunction,
    pub depth_write: bool,
    pub stencil: StencilMode,
    pub blend: Option<BlendState>,
    pub cull: CullMode,
    pub color_formats: &'static [TextureFormat],
    /// Renders to the swapchain instead of `color_formats`
    pub presents: bool,
    pub depth_format: Option<TextureFormat>,
}

impl PassState {
    /// Stencil marking sub-draw of a light volume (no color output)
    pub fn light_volume_mark() -> Self {
        Self {
            depth_compare: CompareFunction::Less,
            stencil: StencilMode::VolumeMark,
            blend: None,
            cull: CullMode::None,
            ..PassType::LocalLights.state()
        }
    }

    /// Fullscreen quad at the far plane tagging sky pixels
    pub fn sky_mask_write() -> Self {
        Self {
            depth_compare: CompareFunction::LessEqual,
            stencil: StencilMode::MaskWrite,
            blend: None,
            ..PassType::GlobalLights.state()
        }
    }

    /// Fullscreen quad replacing sky pixels with the sky color
    pub fn sky_fill() -> Self {
        Self {
            blend: None,
            ..PassType::GlobalLights.state()
        }
    }

    pub fn with_stencil(mut self, stencil: StencilMode) -> Self {
        self.stencil = stencil;
        self
    }

    pub fn depth_stencil(&self) -> Option<DepthStencilState> {
        self.depth_format.map(|format| DepthStencilState {
            format,
            depth_write_enabled: self.depth_write,
            depth_compare: self.depth_compare,
            stencil: if format.has_stencil() {
                self.stencil.stencil_state()
            } else {
                StencilState::default()
            },
            bias: DepthBias::default(),
        })
    }

    /// Color targets for a pipeline drawing in this pass
    pub fn color_targets(&self, swapchain_format: TextureFormat) -> Vec<ColorTargetState> {
        let write_mask = if self.stencil == StencilMode::VolumeMark
            || self.stencil == StencilMode::MaskWrite
        {
            ColorWrites::NONE
        } else {
            ColorWrites::ALL
        };
        let formats: Vec<TextureFormat> = if self.presents {
            vec![swapchain_format]
        } else {
            self.color_formats.to_vec()
        };
        formats
            .into_iter()
            .map(|format| ColorTargetState {
                format,
                blend: self.blend,
                write_mask,
            })
            .collect()
    }
}

/// Camera data of one pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassCamera {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub inverse_view_projection: Mat4,
    pub location: Vec3,
    pub direction: Vec3,
    pub near: f32,
    pub far: f32,
    /// Far distance of each shadow cascade
    pub cascade_far: [f32; CASCADE_COUNT],
}

impl PassCamera {
    pub fn from_camera(camera: &Camera, cascade_far: [f32; CASCADE_COUNT]) -> Self {
        let view = camera.view_matrix();
        let projection = camera.projection_matrix();
        let view_projection = projection * view;
        Self {
            view,
            projection,
            view_projection,
            inverse_view_projection: view_projection.inverse(),
            location: camera.location(),
            direction: camera.direction(),
            near: camera.near(),
            far: camera.far(),
            cascade_far,
        }
    }

    /// Camera of an orthographic light-space render
    pub fn from_matrices(view: Mat4, projection: Mat4, near: f32, far: f32) -> Self {
        let view_projection = projection * view;
        let inverse_view = view.inverse();
        Self {
            view,
            projection,
            view_projection,
            inverse_view_projection: view_projection.inverse(),
            location: inverse_view.w_axis.truncate(),
            direction: (-inverse_view.z_axis.truncate()).normalize_or_zero(),
            near,
            far,
            cascade_far: [far; CASCADE_COUNT],
        }
    }
}

/// Lighting switches and colors shared by every pass of a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightingParams {
    /// Direction the sunlight travels
    pub sun_direction: Vec3,
    pub ambient: Vec3,
    pub sky_color: Vec3,
    pub ssao_enabled: bool,
    pub shadows_enabled: bool,
}

/// Shadow data visible to global lights
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowBinding {
    pub bind_group: BindGroupHandle,
    pub view_projections: [Mat4; CASCADE_COUNT],
}

/// Read-only description of one scene traversal.
///
/// Built fresh for each traversal and shared by every model visited in it.
#[derive(Debug, Clone)]
pub struct Pass {
    pub pass_type: PassType,
    pub camera: PassCamera,
    pub width: u32,
    pub height: u32,
    /// Cascade being rendered, only set for shadow passes
    pub cascade: Option<usize>,
    pub lighting: LightingParams,
    pub wireframe: bool,
    pub quad: Option<FullscreenQuad>,
    /// Diffuse + normal inputs, set for light passes
    pub gbuffer: Option<BindGroupHandle>,
    /// Cascade maps and matrices, set for global lights
    pub shadows: Option<ShadowBinding>,
}

impl Pass {
    /// A pass with no GPU inputs attached
    pub fn new(pass_type: PassType, camera: PassCamera, width: u32, height: u32) -> Self {
        Self {
            pass_type,
            camera,
            width,
            height,
            cascade: None,
            lighting: LightingParams {
                sun_direction: Vec3::new(-0.3, -1.0, -0.2).normalize(),
                ambient: Vec3::splat(0.1),
                sky_color: Vec3::new(0.5, 0.7, 1.0),
                ssao_enabled: false,
                shadows_enabled: false,
            },
            wireframe: false,
            quad: None,
            gbuffer: None,
            shadows: None,
        }
    }

    pub fn state(&self) -> PassState {
        self.pass_type.state()
    }

    /// Per-draw uniform block for an object with the given world matrix
    pub fn draw_uniforms(&self, world: &Mat4) -> DrawUniforms {
        let cascades = self
            .shadows
            .map_or([Mat4::IDENTITY; CASCADE_COUNT], |s| s.view_projections);
        let shadows_on = self.shadows.is_some() && self.lighting.shadows_enabled;
        let width = self.width.max(1) as f32;
        let height = self.height.max(1) as f32;
        DrawUniforms {
            view_proj: self.camera.view_projection,
            inv_view_proj: self.camera.inverse_view_projection,
            view: self.camera.view,
            model: *world,
            normal: world.inverse().transpose(),
            cascades,
            camera_pos: self.camera.location.extend(1.0),
            near_far: Vec4::new(
                self.camera.near,
                self.camera.far,
                self.cascade.map_or(-1.0, |c| c as f32),
                if self.wireframe { 1.0 } else { 0.0 },
            ),
            screen: Vec4::new(width, height, 1.0 / width, 1.0 / height),
            cascade_far: Vec4::from_array(self.camera.cascade_far),
            lighting: Vec4::new(
                if self.lighting.ssao_enabled { 1.0 } else { 0.0 },
                if shadows_on { 1.0 } else { 0.0 },
                0.0,
                0.0,
            ),
            params: [Vec4::ZERO; 4],
        }
    }
}

/// Uniform block bound at group 0 for every draw.
///
/// Mirrors the `Draw` struct declared in the shader prelude.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DrawUniforms {
    pub view_proj: Mat4,
    pub inv_view_proj: Mat4,
    pub view: Mat4,
    pub model: Mat4,
    pub normal: Mat4,
    pub cascades: [Mat4; CASCADE_COUNT],
    pub camera_pos: Vec4,
    /// near, far, cascade index (-1 when none), wireframe
    pub near_far: Vec4,
    /// width, height, 1 / width, 1 / height
    pub screen: Vec4,
    pub cascade_far: Vec4,
    /// ssao, shadows
    pub lighting: Vec4,
    /// Draw specific values
    pub params: [Vec4; 4],
}

impl DrawUniforms {
    pub fn with_params(mut self, params: [Vec4; 4]) -> Self {
        self.params = params;
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_order_is_fixed() {
        assert_eq!(
            PassType::FRAME_ORDER,
            [
                PassType::Shadow,
                PassType::Ssipg,
                PassType::Geometry,
                PassType::LocalLights,
                PassType::GlobalLights,
                PassType::Screen,
            ]
        );
    }

    #[test]
    fn state_table_matches_pass_contracts() {
        let shadow = PassType::Shadow.state();
        assert_eq!(shadow.depth_compare, CompareFunction::Less);
        assert!(shadow.depth_write);
        assert!(shadow.color_formats.is_empty());
        assert_eq!(shadow.cull, CullMode::Back);

        assert_eq!(PassType::Ssipg.state().color_formats.len(), 4);
        assert_eq!(PassType::Geometry.state().blend, None);

        let local = PassType::LocalLights.state();
        assert!(!local.depth_write);
        assert_eq!(local.blend, Some(BlendState::additive()));
        assert!(local.depth_stencil().unwrap().stencil.is_enabled());

        let global = PassType::GlobalLights.state();
        assert_eq!(global.stencil, StencilMode::MaskEqual);
        assert_eq!(global.blend, Some(BlendState::additive()));

        let screen = PassType::Screen.state();
        assert!(screen.presents);
        assert!(screen.depth_stencil().is_none());
        assert_eq!(
            screen.color_targets(TextureFormat::Bgra8UnormSrgb)[0].format,
            TextureFormat::Bgra8UnormSrgb
        );
    }

    #[test]
    fn marking_draws_write_no_color() {
        let targets = PassState::light_volume_mark().color_targets(TextureFormat::Bgra8Unorm);
        assert!(targets.iter().all(|t| t.write_mask == ColorWrites::NONE));
        let targets = PassState::sky_mask_write().color_targets(TextureFormat::Bgra8Unorm);
        assert!(targets.iter().all(|t| t.write_mask == ColorWrites::NONE));
    }

    #[test]
    fn volume_mark_counts_back_minus_front() {
        let stencil = StencilMode::VolumeMark.stencil_state();
        assert_eq!(stencil.back.depth_fail_op, StencilOperation::IncrementWrap);
        assert_eq!(stencil.front.depth_fail_op, StencilOperation::DecrementWrap);
    }

    #[test]
    fn mask_collects_pass_types() {
        let mask: PassMask = [PassType::Geometry, PassType::Shadow].into_iter().collect();
        assert!(mask.contains(PassType::Geometry));
        assert!(mask.contains(PassType::Shadow));
        assert!(!mask.contains(PassType::Screen));
        assert!(PassMask::ALL.contains(PassType::Screen));
    }

    #[test]
    fn uniform_block_fits_a_ring_slot() {
        assert!(std::mem::size_of::<DrawUniforms>() as u64 <= UNIFORM_BLOCK_SIZE);
        assert_eq!(std::mem::size_of::<DrawUniforms>() % 16, 0);
    }
}
