//! Built-in scene models

mod directional_light;
mod mesh_model;
mod point_light;

pub use directional_light::DirectionalLightModel;
pub use mesh_model::MeshModel;
pub use point_light::PointLightModel;
