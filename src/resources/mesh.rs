//! Geometry: CPU meshes and their lazily uploaded GPU buffers

use glam::{Vec2, Vec3, Vec4};
use parking_lot::Mutex;

use crate::backend::*;
use crate::resources::ReleaseQueue;

/// A mesh with vertex and index data
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// Get vertex data as bytes
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Get index data as bytes
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Create a unit cube centered at origin
    pub fn cube() -> Self {
        let mut mesh = Mesh::new("cube");

        // Define cube vertices with normals and UVs
        let positions = [
            // Front face
            (Vec3::new(-0.5, -0.5, 0.5), Vec3::Z, Vec2::new(0.0, 1.0)),
            (Vec3::new(0.5, -0.5, 0.5), Vec3::Z, Vec2::new(1.0, 1.0)),
            (Vec3::new(0.5, 0.5, 0.5), Vec3::Z, Vec2::new(1.0, 0.0)),
            (Vec3::new(-0.5, 0.5, 0.5), Vec3::Z, Vec2::new(0.0, 0.0)),
            // Back face
            (Vec3::new(0.5, -0.5, -0.5), -Vec3::Z, Vec2::new(0.0, 1.0)),
            (Vec3::new(-0.5, -0.5, -0.5), -Vec3::Z, Vec2::new(1.0, 1.0)),
            (Vec3::new(-0.5, 0.5, -0.5), -Vec3::Z, Vec2::new(1.0, 0.0)),
            (Vec3::new(0.5, 0.5, -0.5), -Vec3::Z, Vec2::new(0.0, 0.0)),
            // Right face
            (Vec3::new(0.5, -0.5, 0.5), Vec3::X, Vec2::new(0.0, 1.0)),
            (Vec3::new(0.5, -0.5, -0.5), Vec3::X, Vec2::new(1.0, 1.0)),
            (Vec3::new(0.5, 0.5, -0.5), Vec3::X, Vec2::new(1.0, 0.0)),
            (Vec3::new(0.5, 0.5, 0.5), Vec3::X, Vec2::new(0.0, 0.0)),
            // Left face
            (Vec3::new(-0.5, -0.5, -0.5), -Vec3::X, Vec2::new(0.0, 1.0)),
            (Vec3::new(-0.5, -0.5, 0.5), -Vec3::X, Vec2::new(1.0, 1.0)),
            (Vec3::new(-0.5, 0.5, 0.5), -Vec3::X, Vec2::new(1.0, 0.0)),
            (Vec3::new(-0.5, 0.5, -0.5), -Vec3::X, Vec2::new(0.0, 0.0)),
            // Top face
            (Vec3::new(-0.5, 0.5, 0.5), Vec3::Y, Vec2::new(0.0, 1.0)),
            (Vec3::new(0.5, 0.5, 0.5), Vec3::Y, Vec2::new(1.0, 1.0)),
            (Vec3::new(0.5, 0.5, -0.5), Vec3::Y, Vec2::new(1.0, 0.0)),
            (Vec3::new(-0.5, 0.5, -0.5), Vec3::Y, Vec2::new(0.0, 0.0)),
            // Bottom face
            (Vec3::new(-0.5, -0.5, -0.5), -Vec3::Y, Vec2::new(0.0, 1.0)),
            (Vec3::new(0.5, -0.5, -0.5), -Vec3::Y, Vec2::new(1.0, 1.0)),
            (Vec3::new(0.5, -0.5, 0.5), -Vec3::Y, Vec2::new(1.0, 0.0)),
            (Vec3::new(-0.5, -0.5, 0.5), -Vec3::Y, Vec2::new(0.0, 0.0)),
        ];

        for (position, normal, uv) in positions {
            // Calculate tangent (pointing along U direction)
            let tangent = if normal.abs().y > 0.9 {
                Vec4::new(1.0, 0.0, 0.0, 1.0)
            } else {
                let right = Vec3::Y.cross(normal).normalize();
                right.extend(1.0)
            };

            mesh.vertices.push(Vertex {
                position,
                normal,
                uv,
                tangent,
            });
        }

        // Define indices (two triangles per face)
        for face in 0..6 {
            let base = face * 4;
            mesh.indices.extend_from_slice(&[
                base,
                base + 1,
                base + 2,
                base,
                base + 2,
                base + 3,
            ]);
        }

        mesh
    }

    /// Create a UV sphere of radius 0.5
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let mut mesh = Mesh::new("sphere");

        let segment_angle = 2.0 * std::f32::consts::PI / segments as f32;
        let ring_angle = std::f32::consts::PI / rings as f32;

        // Generate vertices
        for ring in 0..=rings {
            let phi = ring as f32 * ring_angle;
            let y = phi.cos();
            let ring_radius = phi.sin();

            for segment in 0..=segments {
                let theta = segment as f32 * segment_angle;
                let x = ring_radius * theta.cos();
                let z = ring_radius * theta.sin();

                let position = Vec3::new(x * 0.5, y * 0.5, z * 0.5);
                let normal = Vec3::new(x, y, z).normalize();
                let uv = Vec2::new(
                    segment as f32 / segments as f32,
                    ring as f32 / rings as f32,
                );

                // Tangent along theta direction
                let tangent = Vec3::new(-theta.sin(), 0.0, theta.cos()).normalize();

                mesh.vertices.push(Vertex {
                    position,
                    normal,
                    uv,
                    tangent: tangent.extend(1.0),
                });
            }
        }

        // Generate indices
        for ring in 0..rings {
            for segment in 0..segments {
                let current = ring * (segments + 1) + segment;
                let next = current + segments + 1;

                // Counter-clockwise seen from outside
                mesh.indices.extend_from_slice(&[
                    current,
                    current + 1,
                    next,
                    current + 1,
                    next + 1,
                    next,
                ]);
            }
        }

        mesh
    }

    /// Create a plane on the XZ axis
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let mut mesh = Mesh::new("plane");

        let half_width = width / 2.0;
        let half_depth = depth / 2.0;
        let step_x = width / subdivisions as f32;
        let step_z = depth / subdivisions as f32;

        // Generate vertices
        for z in 0..=subdivisions {
            for x in 0..=subdivisions {
                let px = -half_width + x as f32 * step_x;
                let pz = -half_depth + z as f32 * step_z;

                mesh.vertices.push(Vertex {
                    position: Vec3::new(px, 0.0, pz),
                    normal: Vec3::Y,
                    uv: Vec2::new(x as f32 / subdivisions as f32, z as f32 / subdivisions as f32),
                    tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
                });
            }
        }

        // Generate indices
        for z in 0..subdivisions {
            for x in 0..subdivisions {
                let current = z * (subdivisions + 1) + x;
                let next = current + subdivisions + 1;

                mesh.indices.extend_from_slice(&[
                    current,
                    next,
                    current + 1,
                    current + 1,
                    next,
                    next + 1,
                ]);
            }
        }

        mesh
    }
}

/// GPU buffers of an uploaded [`Geometry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryBuffers {
    pub vertices: BufferHandle,
    pub indices: BufferHandle,
    pub index_count: u32,
}

impl GeometryBuffers {
    /// Bind and draw with the currently set pipeline
    pub fn draw(&self, backend: &mut dyn GraphicsBackend) {
        backend.set_vertex_buffer(0, self.vertices, 0);
        backend.set_index_buffer(self.indices, 0, IndexFormat::Uint32);
        backend.draw_indexed(0..self.index_count, 0, 0..1);
    }
}

/// Shared mesh resource.
///
/// Uploaded on first use; when the last handle drops, its buffers go to the
/// release queue of the [`ResourceManager`](crate::resources::ResourceManager).
#[derive(Debug)]
pub struct Geometry {
    mesh: Mesh,
    gpu: Mutex<Option<GeometryBuffers>>,
    release: ReleaseQueue,
}

impl Geometry {
    pub fn new(mesh: Mesh, release: ReleaseQueue) -> Self {
        Self {
            mesh,
            gpu: Mutex::new(None),
            release,
        }
    }

    pub fn name(&self) -> &str {
        &self.mesh.name
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn is_uploaded(&self) -> bool {
        self.gpu.lock().is_some()
    }

    /// GPU buffers, uploading the mesh if needed
    pub fn upload(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<GeometryBuffers> {
        let mut gpu = self.gpu.lock();
        if let Some(buffers) = *gpu {
            return Ok(buffers);
        }

        let vertices = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} Vertices", self.mesh.name)),
                size: self.mesh.vertex_bytes().len() as u64,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
            },
            self.mesh.vertex_bytes(),
        )?;
        let indices = match backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} Indices", self.mesh.name)),
                size: self.mesh.index_bytes().len() as u64,
                usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
            },
            self.mesh.index_bytes(),
        ) {
            Ok(indices) => indices,
            Err(e) => {
                backend.destroy_buffer(vertices);
                return Err(e);
            }
        };

        log::debug!(
            "Uploaded geometry '{}' ({} vertices)",
            self.mesh.name,
            self.mesh.vertices.len()
        );
        let buffers = GeometryBuffers {
            vertices,
            indices,
            index_count: self.mesh.index_count() as u32,
        };
        *gpu = Some(buffers);
        Ok(buffers)
    }

    /// Destroy the GPU buffers now; the next [`Geometry::upload`] recreates them
    pub fn release(&self, backend: &mut dyn GraphicsBackend) {
        if let Some(buffers) = self.gpu.lock().take() {
            backend.destroy_buffer(buffers.vertices);
            backend.destroy_buffer(buffers.indices);
        }
    }
}

impl Drop for Geometry {
    fn drop(&mut self) {
        if let Some(buffers) = self.gpu.get_mut().take() {
            self.release.push(buffers.vertices);
            self.release.push(buffers.indices);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_meshes_index_valid_vertices() {
        for mesh in [Mesh::cube(), Mesh::sphere(16, 8), Mesh::plane(4.0, 4.0, 3)] {
            assert_eq!(mesh.index_count() % 3, 0, "{}", mesh.name);
            assert!(
                mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()),
                "{}",
                mesh.name
            );
        }
        assert_eq!(Mesh::plane(1.0, 1.0, 2).vertices.len(), 9);
    }

    #[test]
    fn sphere_vertices_lie_on_radius() {
        let sphere = Mesh::sphere(12, 6);
        for vertex in &sphere.vertices {
            assert!((vertex.position.length() - 0.5).abs() < 1e-5);
        }
    }

    #[test]
    fn sphere_faces_point_outwards() {
        let sphere = Mesh::sphere(12, 6);
        for tri in sphere.indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|i| sphere.vertices[tri[i] as usize].position);
            let face_normal = (b - a).cross(c - a);
            if face_normal.length() < 1e-6 {
                continue; // degenerate at the poles
            }
            let centroid = (a + b + c) / 3.0;
            assert!(face_normal.dot(centroid) > 0.0);
        }
    }

    #[test]
    fn upload_is_lazy_and_shared() {
        let mut backend = HeadlessBackend::new(8, 8);
        let geometry = Geometry::new(Mesh::cube(), ReleaseQueue::default());
        assert!(!geometry.is_uploaded());

        let first = geometry.upload(&mut backend).unwrap();
        let second = geometry.upload(&mut backend).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.index_count, 36);
        assert_eq!(backend.live_buffer_count(), 2);

        geometry.release(&mut backend);
        assert_eq!(backend.live_buffer_count(), 0);
    }

    #[test]
    fn dropping_the_last_handle_queues_buffers() {
        let mut backend = HeadlessBackend::new(8, 8);
        let queue = ReleaseQueue::default();
        let geometry = std::sync::Arc::new(Geometry::new(Mesh::cube(), queue.clone()));
        geometry.upload(&mut backend).unwrap();

        let other = geometry.clone();
        drop(geometry);
        assert!(queue.is_empty());
        drop(other);
        assert_eq!(queue.len(), 2);
    }
}
