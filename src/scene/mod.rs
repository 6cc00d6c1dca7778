//! Scene management

mod camera;
mod graph;
mod transform;

pub use camera::*;
pub use graph::*;
pub use transform::*;
