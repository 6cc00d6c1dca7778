//! Shader programs and their interface descriptors

use thiserror::Error;

use crate::backend::*;

/// Vertex entry point every render program exposes
pub const VERTEX_ENTRY: &str = "vs_main";
/// Fragment entry point, absent in depth only programs
pub const FRAGMENT_ENTRY: &str = "fs_main";
/// Compute entry point
pub const COMPUTE_ENTRY: &str = "cs_main";

/// Declarations shared by every engine shader: the per-draw uniform block and
/// helpers reading the G-buffer.
pub const SHADER_PRELUDE: &str = include_str!("../../shaders/common.wgsl");

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShaderError {
    #[error("WGSL parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Entry point '{0}' not found")]
    MissingEntryPoint(&'static str),
    #[error("Vertex input at location {0} is not a declared attribute")]
    UndeclaredAttribute(u32),
    #[error("Declared binding '{0}' not found in the module")]
    MissingBinding(String),
}

/// Vertex attributes a program may consume, at fixed locations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderAttribute {
    Position,
    Normal,
    Uv,
    Tangent,
}

impl ShaderAttribute {
    pub fn location(&self) -> u32 {
        match self {
            ShaderAttribute::Position => 0,
            ShaderAttribute::Normal => 1,
            ShaderAttribute::Uv => 2,
            ShaderAttribute::Tangent => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    fn entry_point(&self) -> &'static str {
        match self {
            ShaderStage::Vertex => VERTEX_ENTRY,
            ShaderStage::Fragment => FRAGMENT_ENTRY,
            ShaderStage::Compute => COMPUTE_ENTRY,
        }
    }

    fn naga(&self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
            ShaderStage::Compute => naga::ShaderStage::Compute,
        }
    }
}

/// What a program expects from the engine.
///
/// Models read it at load time to build vertex layouts instead of hardcoding
/// attribute locations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShaderDescriptor {
    pub stages: Vec<ShaderStage>,
    pub attributes: Vec<ShaderAttribute>,
    /// Reads the per-draw uniform block at group 0
    pub uniform_block: bool,
    /// Named texture and sampler bindings
    pub samplers: Vec<String>,
}

impl ShaderDescriptor {
    /// Vertex + fragment program
    pub fn render(attributes: &[ShaderAttribute]) -> Self {
        Self {
            stages: vec![ShaderStage::Vertex, ShaderStage::Fragment],
            attributes: attributes.to_vec(),
            uniform_block: true,
            samplers: Vec::new(),
        }
    }

    /// Vertex only program
    pub fn depth_only(attributes: &[ShaderAttribute]) -> Self {
        Self {
            stages: vec![ShaderStage::Vertex],
            ..Self::render(attributes)
        }
    }

    pub fn compute() -> Self {
        Self {
            stages: vec![ShaderStage::Compute],
            attributes: Vec::new(),
            uniform_block: true,
            samplers: Vec::new(),
        }
    }

    pub fn with_samplers(mut self, samplers: &[&str]) -> Self {
        self.samplers = samplers.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn has_stage(&self, stage: ShaderStage) -> bool {
        self.stages.contains(&stage)
    }

    /// Layout of [`Vertex`] buffers restricted to the declared attributes
    pub fn vertex_layout(&self) -> VertexBufferLayout {
        let mut layout = Vertex::layout();
        layout.attributes.retain(|attribute| {
            self.attributes
                .iter()
                .any(|declared| declared.location() == attribute.location)
        });
        layout
    }
}

/// WGSL source plus its interface descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderProgram {
    pub name: String,
    pub source: String,
    pub descriptor: ShaderDescriptor,
}

impl ShaderProgram {
    pub fn new(name: &str, source: &str, descriptor: ShaderDescriptor) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            descriptor,
        }
    }

    /// Program whose source is appended to [`SHADER_PRELUDE`]
    pub fn with_prelude(name: &str, body: &str, descriptor: ShaderDescriptor) -> Self {
        Self::new(name, &format!("{SHADER_PRELUDE}\n{body}"), descriptor)
    }

    /// Parse and validate the source, then check it against the descriptor
    pub fn validate(&self) -> Result<(), ShaderError> {
        let module = naga::front::wgsl::parse_str(&self.source)
            .map_err(|e| ShaderError::Parse(e.emit_to_string(&self.source)))?;

        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        validator
            .validate(&module)
            .map_err(|e| ShaderError::Validation(e.to_string()))?;

        for stage in &self.descriptor.stages {
            let entry = stage.entry_point();
            let entry_point = module
                .entry_points
                .iter()
                .find(|ep| ep.name == entry && ep.stage == stage.naga())
                .ok_or(ShaderError::MissingEntryPoint(entry))?;

            if *stage == ShaderStage::Vertex {
                for location in input_locations(&module, &entry_point.function) {
                    let declared = self
                        .descriptor
                        .attributes
                        .iter()
                        .any(|attribute| attribute.location() == location);
                    if !declared {
                        return Err(ShaderError::UndeclaredAttribute(location));
                    }
                }
            }
        }

        if self.descriptor.uniform_block {
            let found = module.global_variables.iter().any(|(_, var)| {
                var.space == naga::AddressSpace::Uniform
                    && var.binding == Some(naga::ResourceBinding { group: 0, binding: 0 })
            });
            if !found {
                return Err(ShaderError::MissingBinding("uniforms".to_string()));
            }
        }

        for name in &self.descriptor.samplers {
            let found = module
                .global_variables
                .iter()
                .any(|(_, var)| var.name.as_deref() == Some(name.as_str()));
            if !found {
                return Err(ShaderError::MissingBinding(name.clone()));
            }
        }

        Ok(())
    }
}

/// Locations of every user-defined input of a function
fn input_locations(module: &naga::Module, function: &naga::Function) -> Vec<u32> {
    let mut locations = Vec::new();
    for argument in &function.arguments {
        match &argument.binding {
            Some(naga::Binding::Location { location, .. }) => locations.push(*location),
            Some(naga::Binding::BuiltIn(_)) => {}
            None => {
                if let naga::TypeInner::Struct { members, .. } = &module.types[argument.ty].inner {
                    locations.extend(members.iter().filter_map(|member| match member.binding {
                        Some(naga::Binding::Location { location, .. }) => Some(location),
                        _ => None,
                    }));
                }
            }
        }
    }
    locations
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLAT: &str = r#"
@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(2) uv: vec2<f32>) -> @builtin(position) vec4<f32> {
    return uniforms.view_proj * vec4<f32>(position + vec3<f32>(uv, 0.0), 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0);
}
"#;

    #[test]
    fn valid_program_passes() {
        let program = ShaderProgram::with_prelude(
            "flat",
            FLAT,
            ShaderDescriptor::render(&[ShaderAttribute::Position, ShaderAttribute::Uv]),
        );
        assert_eq!(program.validate(), Ok(()));
    }

    #[test]
    fn undeclared_vertex_input_is_rejected() {
        let program = ShaderProgram::with_prelude(
            "flat",
            FLAT,
            ShaderDescriptor::render(&[ShaderAttribute::Position]),
        );
        assert_eq!(program.validate(), Err(ShaderError::UndeclaredAttribute(2)));
    }

    #[test]
    fn missing_entry_point_is_rejected() {
        let program = ShaderProgram::with_prelude(
            "flat",
            FLAT,
            ShaderDescriptor {
                stages: vec![ShaderStage::Compute],
                ..ShaderDescriptor::compute()
            },
        );
        assert_eq!(
            program.validate(),
            Err(ShaderError::MissingEntryPoint(COMPUTE_ENTRY))
        );
    }

    #[test]
    fn syntax_errors_are_reported() {
        let program = ShaderProgram::new("broken", "fn vs_main( {", ShaderDescriptor::default());
        assert!(matches!(program.validate(), Err(ShaderError::Parse(_))));
    }

    #[test]
    fn missing_sampler_binding_is_rejected() {
        let program = ShaderProgram::with_prelude(
            "flat",
            FLAT,
            ShaderDescriptor::render(&[ShaderAttribute::Position, ShaderAttribute::Uv])
                .with_samplers(&["albedo"]),
        );
        assert_eq!(
            program.validate(),
            Err(ShaderError::MissingBinding("albedo".to_string()))
        );
    }

    #[test]
    fn vertex_layout_keeps_declared_attributes() {
        let layout =
            ShaderDescriptor::render(&[ShaderAttribute::Position, ShaderAttribute::Uv]).vertex_layout();
        let locations: Vec<u32> = layout.attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![0, 2]);
        assert_eq!(layout.array_stride, std::mem::size_of::<Vertex>() as u64);
    }
}
