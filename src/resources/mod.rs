//! Resource management
//!
//! Shader programs, geometry and textures are registered by name and shared
//! through `Arc` handles. Lookups never fail: a missing name logs a warning
//! and yields the fallback of its kind.

mod mesh;
mod shader;
mod texture;

pub use mesh::*;
pub use shader::*;
pub use texture::*;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{BufferHandle, GraphicsBackend};
use crate::pipeline::shaders;

/// Buffers whose owners were dropped, waiting to be destroyed on the backend
#[derive(Debug, Clone, Default)]
pub struct ReleaseQueue(Arc<Mutex<Vec<BufferHandle>>>);

impl ReleaseQueue {
    pub fn push(&self, buffer: BufferHandle) {
        self.0.lock().push(buffer);
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    fn drain(&self) -> Vec<BufferHandle> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Named resources with fallbacks
pub struct ResourceManager {
    shader_programs: HashMap<String, Arc<ShaderProgram>>,
    geometries: HashMap<String, Arc<Geometry>>,
    textures: HashMap<String, Arc<TextureData>>,
    fallback_program: Arc<ShaderProgram>,
    fallback_geometry: Arc<Geometry>,
    fallback_texture: Arc<TextureData>,
    release: ReleaseQueue,
}

impl ResourceManager {
    /// Manager holding the built-in programs and the basic meshes and textures
    pub fn new() -> Self {
        let release = ReleaseQueue::default();
        let mut manager = Self {
            shader_programs: HashMap::new(),
            geometries: HashMap::new(),
            textures: HashMap::new(),
            fallback_program: Arc::new(shaders::fallback_program()),
            fallback_geometry: Arc::new(Geometry::new(Mesh::cube(), release.clone())),
            fallback_texture: Arc::new(TextureData::checkerboard(
                64,
                [255, 0, 255, 255],
                [0, 0, 0, 255],
            )),
            release,
        };

        for program in shaders::builtin_programs() {
            // Failures are logged and leave the fallback in place
            let _ = manager.register_shader_program(program);
        }
        manager.register_geometry(Mesh::cube());
        manager.register_geometry(Mesh::sphere(24, 16));
        manager.register_geometry(Mesh::plane(1.0, 1.0, 1));
        manager.register_texture(TextureData::white());

        log::info!(
            "Resource manager ready: {} programs, {} geometries, {} textures",
            manager.shader_programs.len(),
            manager.geometries.len(),
            manager.textures.len()
        );
        manager
    }

    /// Validate and register a program under its name.
    ///
    /// An invalid program is not registered; lookups keep returning whatever
    /// was there before, or the fallback.
    pub fn register_shader_program(&mut self, program: ShaderProgram) -> Result<(), ShaderError> {
        if let Err(e) = program.validate() {
            log::error!("Shader program '{}' rejected: {}", program.name, e);
            return Err(e);
        }
        log::debug!("Registered shader program '{}'", program.name);
        self.shader_programs
            .insert(program.name.clone(), Arc::new(program));
        Ok(())
    }

    /// Register a mesh under its name, replacing any previous geometry
    pub fn register_geometry(&mut self, mesh: Mesh) -> Arc<Geometry> {
        let geometry = Arc::new(Geometry::new(mesh, self.release.clone()));
        self.geometries
            .insert(geometry.name().to_string(), geometry.clone());
        geometry
    }

    pub fn register_texture(&mut self, texture: TextureData) -> Arc<TextureData> {
        let texture = Arc::new(texture);
        self.textures.insert(texture.name.clone(), texture.clone());
        texture
    }

    pub fn find_shader_program(&self, name: &str) -> Arc<ShaderProgram> {
        self.shader_programs.get(name).cloned().unwrap_or_else(|| {
            log::warn!("Shader program '{}' not found, using fallback", name);
            self.fallback_program.clone()
        })
    }

    pub fn find_geometry(&self, name: &str) -> Arc<Geometry> {
        self.geometries.get(name).cloned().unwrap_or_else(|| {
            log::warn!("Geometry '{}' not found, using fallback", name);
            self.fallback_geometry.clone()
        })
    }

    pub fn find_texture(&self, name: &str) -> Arc<TextureData> {
        self.textures.get(name).cloned().unwrap_or_else(|| {
            log::warn!("Texture '{}' not found, using fallback", name);
            self.fallback_texture.clone()
        })
    }

    /// Forget a geometry; its buffers are released once the last handle drops
    pub fn remove_geometry(&mut self, name: &str) -> Option<Arc<Geometry>> {
        self.geometries.remove(name)
    }

    /// Destroy the buffers of dropped geometry. Returns how many were destroyed.
    pub fn collect_garbage(&self, backend: &mut dyn GraphicsBackend) -> usize {
        let buffers = self.release.drain();
        for buffer in &buffers {
            backend.destroy_buffer(*buffer);
        }
        if !buffers.is_empty() {
            log::debug!("Released {} geometry buffers", buffers.len());
        }
        buffers.len()
    }

    /// Destroy the GPU copies of every geometry still registered
    pub fn release_gpu_resources(&self, backend: &mut dyn GraphicsBackend) {
        for geometry in self.geometries.values() {
            geometry.release(backend);
        }
        self.fallback_geometry.release(backend);
        self.collect_garbage(backend);
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    #[test]
    fn builtins_are_registered() {
        let resources = ResourceManager::new();
        for name in [shaders::MESH, shaders::SUN, shaders::SSIPG_GENERATE] {
            assert_eq!(resources.find_shader_program(name).name, name);
        }
        assert_eq!(resources.find_geometry("sphere").name(), "sphere");
        assert_eq!(resources.find_texture("white").width, 1);
    }

    #[test]
    fn misses_return_fallbacks() {
        let resources = ResourceManager::new();
        assert_eq!(resources.find_shader_program("nope").name, shaders::FALLBACK);
        assert_eq!(resources.find_geometry("nope").name(), "cube");
        assert_eq!(resources.find_texture("nope").name, "checkerboard");
    }

    #[test]
    fn invalid_programs_are_not_registered() {
        let mut resources = ResourceManager::new();
        let broken = ShaderProgram::new("broken", "this is not wgsl", ShaderDescriptor::default());
        assert!(resources.register_shader_program(broken).is_err());
        assert_eq!(resources.find_shader_program("broken").name, shaders::FALLBACK);
    }

    #[test]
    fn removed_geometry_is_collected_after_last_drop() {
        let mut backend = HeadlessBackend::new(8, 8);
        let mut resources = ResourceManager::new();
        let geometry = resources.find_geometry("sphere");
        geometry.upload(&mut backend).unwrap();
        assert_eq!(backend.live_buffer_count(), 2);

        resources.remove_geometry("sphere");
        assert_eq!(resources.collect_garbage(&mut backend), 0);
        drop(geometry);
        assert_eq!(resources.collect_garbage(&mut backend), 2);
        assert_eq!(backend.live_buffer_count(), 0);
    }
}
