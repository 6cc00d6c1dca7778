//! Backend abstraction layer
//!
//! Provides the object-safe [`GraphicsBackend`] trait plus the wgpu and
//! headless implementations.

pub mod headless;
pub mod traits;
pub mod types;
pub mod wgpu_backend;

pub use headless::{HeadlessBackend, RecordedCommand};
pub use traits::*;
pub use types::*;
pub use wgpu_backend::WgpuBackend;
