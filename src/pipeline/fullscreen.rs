//! Shared fullscreen quad

use glam::Vec2;

use crate::backend::*;

/// Two triangles covering clip space, created once at load and reused by
/// every fullscreen draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullscreenQuad {
    pub vertices: BufferHandle,
    pub indices: BufferHandle,
}

const VERTICES: [QuadVertex; 4] = [
    QuadVertex {
        position: Vec2::new(-1.0, -1.0),
        uv: Vec2::new(0.0, 1.0),
    },
    QuadVertex {
        position: Vec2::new(1.0, -1.0),
        uv: Vec2::new(1.0, 1.0),
    },
    QuadVertex {
        position: Vec2::new(1.0, 1.0),
        uv: Vec2::new(1.0, 0.0),
    },
    QuadVertex {
        position: Vec2::new(-1.0, 1.0),
        uv: Vec2::new(0.0, 0.0),
    },
];

const INDICES: [u16; 6] = [0, 1, 2, 0, 2, 3];

impl FullscreenQuad {
    pub const INDEX_COUNT: u32 = INDICES.len() as u32;

    pub fn create(backend: &mut dyn GraphicsBackend) -> BackendResult<Self> {
        let vertices = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("Fullscreen Quad Vertices".into()),
                size: std::mem::size_of_val(&VERTICES) as u64,
                usage: BufferUsage::VERTEX,
            },
            bytemuck::cast_slice(&VERTICES),
        )?;
        // Index buffer sizes must stay 4 byte aligned
        let mut index_bytes = bytemuck::cast_slice::<u16, u8>(&INDICES).to_vec();
        index_bytes.resize(index_bytes.len().next_multiple_of(4), 0);
        let indices = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("Fullscreen Quad Indices".into()),
                size: index_bytes.len() as u64,
                usage: BufferUsage::INDEX,
            },
            &index_bytes,
        );
        match indices {
            Ok(indices) => Ok(Self { vertices, indices }),
            Err(e) => {
                backend.destroy_buffer(vertices);
                Err(e)
            }
        }
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.vertices);
        backend.destroy_buffer(self.indices);
    }

    /// Bind and draw the quad with the currently set pipeline
    pub fn draw(&self, backend: &mut dyn GraphicsBackend) {
        backend.set_vertex_buffer(0, self.vertices, 0);
        backend.set_index_buffer(self.indices, 0, IndexFormat::Uint16);
        backend.draw_indexed(0..Self::INDEX_COUNT, 0, 0..1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_covers_clip_space_counter_clockwise() {
        for tri in INDICES.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|i| VERTICES[tri[i] as usize].position);
            assert!((b - a).perp_dot(c - a) > 0.0);
        }
        let area: f32 = INDICES
            .chunks(3)
            .map(|tri| {
                let [a, b, c] = [0, 1, 2].map(|i| VERTICES[tri[i] as usize].position);
                (b - a).perp_dot(c - a) / 2.0
            })
            .sum();
        assert_eq!(area, 4.0);
    }

    #[test]
    fn draw_binds_both_buffers() {
        let mut backend = HeadlessBackend::new(8, 8);
        let quad = FullscreenQuad::create(&mut backend).unwrap();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Quad".into()),
            color_attachments: vec![],
            depth_stencil_attachment: None,
        });
        quad.draw(&mut backend);
        backend.end_render_pass();

        let commands = backend.commands_in_pass("Quad");
        assert_eq!(commands.len(), 3);
        assert!(matches!(
            commands[2],
            RecordedCommand::DrawIndexed { indices, .. } if *indices == (0..6)
        ));
        quad.destroy(&mut backend);
        assert_eq!(backend.live_buffer_count(), 0);
    }
}
