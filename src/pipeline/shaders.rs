//! Built-in shader programs, registered in every [`ResourceManager`](crate::resources::ResourceManager)

use crate::resources::{ShaderAttribute, ShaderDescriptor, ShaderProgram};

pub const MESH: &str = "mesh";
pub const SHADOW: &str = "shadow";
pub const SSIPG_CAPTURE: &str = "ssipg_capture";
pub const SSIPG_GENERATE: &str = "ssipg_generate";
pub const GRASS: &str = "grass";
pub const POINT_LIGHT: &str = "point_light";
pub const SUN: &str = "sun";
pub const SKY_MASK: &str = "sky_mask";
pub const SKY_FILL: &str = "sky_fill";
pub const TONEMAP: &str = "tonemap";
pub const DEBUG: &str = "debug";
pub const FALLBACK: &str = "fallback";

const MESH_ATTRIBUTES: &[ShaderAttribute] = &[
    ShaderAttribute::Position,
    ShaderAttribute::Normal,
    ShaderAttribute::Uv,
];

/// Program substituted when a lookup misses
pub fn fallback_program() -> ShaderProgram {
    ShaderProgram::with_prelude(
        FALLBACK,
        include_str!("../../shaders/fallback.wgsl"),
        ShaderDescriptor::render(&[ShaderAttribute::Position]),
    )
}

pub fn builtin_programs() -> Vec<ShaderProgram> {
    // Quad programs read clip-space positions at location 0
    let quad = || ShaderDescriptor::render(&[ShaderAttribute::Position]);
    let gbuffer_inputs = ["gbuffer_diffuse", "gbuffer_normal"];
    let present_inputs = [
        "gbuffer_diffuse",
        "gbuffer_normal",
        "bright",
        "ssipg_distance",
        "ssipg_diffuse",
    ];

    vec![
        ShaderProgram::with_prelude(
            MESH,
            include_str!("../../shaders/mesh.wgsl"),
            ShaderDescriptor::render(MESH_ATTRIBUTES).with_samplers(&["albedo", "albedo_sampler"]),
        ),
        ShaderProgram::with_prelude(
            SHADOW,
            include_str!("../../shaders/shadow.wgsl"),
            ShaderDescriptor::depth_only(&[ShaderAttribute::Position]),
        ),
        ShaderProgram::with_prelude(
            SSIPG_CAPTURE,
            include_str!("../../shaders/ssipg_capture.wgsl"),
            ShaderDescriptor::render(MESH_ATTRIBUTES).with_samplers(&["albedo", "albedo_sampler"]),
        ),
        ShaderProgram::with_prelude(
            SSIPG_GENERATE,
            include_str!("../../shaders/ssipg_generate.wgsl"),
            ShaderDescriptor::compute().with_samplers(&["capture_distance", "capture_diffuse"]),
        ),
        ShaderProgram::with_prelude(
            GRASS,
            include_str!("../../shaders/grass.wgsl"),
            ShaderDescriptor::render(&[]),
        ),
        ShaderProgram::with_prelude(
            POINT_LIGHT,
            include_str!("../../shaders/point_light.wgsl"),
            ShaderDescriptor::render(&[ShaderAttribute::Position]).with_samplers(&gbuffer_inputs),
        ),
        ShaderProgram::with_prelude(
            SUN,
            include_str!("../../shaders/sun.wgsl"),
            quad().with_samplers(&[
                "gbuffer_diffuse",
                "gbuffer_normal",
                "shadow_map_0",
                "shadow_map_1",
                "shadow_map_2",
                "shadow_map_3",
                "shadow_sampler",
            ]),
        ),
        ShaderProgram::with_prelude(SKY_MASK, include_str!("../../shaders/sky_mask.wgsl"), quad()),
        ShaderProgram::with_prelude(SKY_FILL, include_str!("../../shaders/sky_fill.wgsl"), quad()),
        ShaderProgram::with_prelude(
            TONEMAP,
            include_str!("../../shaders/tonemap.wgsl"),
            quad().with_samplers(&present_inputs),
        ),
        ShaderProgram::with_prelude(
            DEBUG,
            include_str!("../../shaders/debug.wgsl"),
            quad().with_samplers(&present_inputs),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_programs_validate() {
        for program in builtin_programs().into_iter().chain([fallback_program()]) {
            if let Err(e) = program.validate() {
                panic!("{}: {}", program.name, e);
            }
        }
    }

    #[test]
    fn builtin_names_are_unique() {
        let programs = builtin_programs();
        let mut names: Vec<_> = programs.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), programs.len());
    }
}
