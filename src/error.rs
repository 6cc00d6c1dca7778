//! Renderer error type

use thiserror::Error;

use crate::backend::BackendError;
use crate::scene::SceneError;

/// Errors surfaced by [`DeferredRenderer`](crate::DeferredRenderer)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RendererError {
    #[error("Renderer is not loaded")]
    NotLoaded,
    #[error("Renderer is already loaded")]
    AlreadyLoaded,
    #[error("Invalid screen size {width}x{height}")]
    InvalidScreenSize { width: u32, height: u32 },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Scene(#[from] SceneError),
}
