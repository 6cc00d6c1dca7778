//! Screen-space instanced particle generation.
//!
//! Grass surfaces are captured at half resolution, a compute pass turns the
//! capture into blade instances through an atomic counter, and the renderer
//! draws the blades after reading the counter back.

use crate::backend::*;
use crate::pipeline::pass::*;
use crate::pipeline::targets::{destroy_targets, RenderTarget};

/// Label of the atomic counter buffer
pub const SSIPG_COUNTER_LABEL: &str = "SSIPG Counter";

/// Compute workgroup edge, matches `@workgroup_size(8, 8)`
pub const SSIPG_WORKGROUP_SIZE: u32 = 8;

/// Bytes per instance in the coordinate buffer: root position
const COORDINATE_STRIDE: u64 = 16;

/// Bytes per instance in the descriptor buffer: color + seed, up axis, bend
const DESCRIPTOR_STRIDE: u64 = 48;

/// Capture targets read by the generate pass: distance, diffuse, orientation, pressure
pub const GENERATE_TEXTURE_INPUTS: u32 = 4;

/// Vertices of one grass blade
pub const BLADE_VERTEX_COUNT: u32 = 3;

/// Half resolution capture size for a screen size
pub fn ssipg_size(width: u32, height: u32) -> (u32, u32) {
    ((width / 2).max(1), (height / 2).max(1))
}

/// Maximum instance count: one per half resolution pixel
pub fn ssipg_capacity(width: u32, height: u32) -> u32 {
    let (w, h) = ssipg_size(width, height);
    w * h
}

/// Clamp the GPU reported instance count to what the buffers hold
pub fn clamp_instance_count(reported: u32, capacity: u32) -> u32 {
    if reported > capacity {
        log::warn!(
            "SSIPG reported {} instances, clamped to capacity {}",
            reported,
            capacity
        );
        capacity
    } else {
        reported
    }
}

/// Capture targets, instance buffers and bind groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsipgTargets {
    pub distance: RenderTarget,
    pub diffuse: RenderTarget,
    pub orientation: RenderTarget,
    pub pressure: RenderTarget,
    pub depth: RenderTarget,
    pub counter: BufferHandle,
    pub coordinates: BufferHandle,
    pub descriptors: BufferHandle,
    /// Capture + storage buffers for the generate pass
    pub generate_inputs: BindGroupHandle,
    /// Read-only instance buffers for the blade draw
    pub instances: BindGroupHandle,
    pub width: u32,
    pub height: u32,
    pub capacity: u32,
}

impl SsipgTargets {
    pub fn create(
        backend: &mut dyn GraphicsBackend,
        screen_width: u32,
        screen_height: u32,
        generate_layout: BindGroupLayoutHandle,
        instances_layout: BindGroupLayoutHandle,
    ) -> BackendResult<Self> {
        let (width, height) = ssipg_size(screen_width, screen_height);
        let capacity = ssipg_capacity(screen_width, screen_height);

        let mut targets = RenderTarget::create_all(
            backend,
            width,
            height,
            &[
                ("SSIPG Distance", SSIPG_COLOR_FORMATS[0]),
                ("SSIPG Diffuse", SSIPG_COLOR_FORMATS[1]),
                ("SSIPG Orientation", SSIPG_COLOR_FORMATS[2]),
                ("SSIPG Pressure", SSIPG_COLOR_FORMATS[3]),
                ("SSIPG Depth", SHADOW_FORMAT),
            ],
        )?;

        let buffer_specs = [
            (
                SSIPG_COUNTER_LABEL,
                4,
                BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
            ),
            (
                "SSIPG Coordinates",
                capacity as u64 * COORDINATE_STRIDE,
                BufferUsage::STORAGE,
            ),
            (
                "SSIPG Descriptors",
                capacity as u64 * DESCRIPTOR_STRIDE,
                BufferUsage::STORAGE,
            ),
        ];
        let mut buffers = Vec::with_capacity(buffer_specs.len());
        for (label, size, usage) in buffer_specs {
            match backend.create_buffer(&BufferDescriptor {
                label: Some(label.into()),
                size,
                usage,
            }) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    buffers.iter().for_each(|b| backend.destroy_buffer(*b));
                    destroy_targets(backend, targets);
                    return Err(e);
                }
            }
        }
        let (counter, coordinates, descriptors) = (buffers[0], buffers[1], buffers[2]);

        let storage = |buffer| BindGroupEntry::Buffer {
            buffer,
            offset: 0,
            size: None,
        };
        let captured = &targets[..GENERATE_TEXTURE_INPUTS as usize];
        let mut generate_entries: Vec<(u32, BindGroupEntry)> = captured
            .iter()
            .enumerate()
            .map(|(i, target)| (i as u32, BindGroupEntry::Texture(target.view)))
            .collect();
        generate_entries.extend(
            [counter, coordinates, descriptors]
                .into_iter()
                .enumerate()
                .map(|(i, buffer)| (GENERATE_TEXTURE_INPUTS + i as u32, storage(buffer))),
        );
        let generate_inputs = backend.create_bind_group(generate_layout, &generate_entries);
        let instances = backend.create_bind_group(
            instances_layout,
            &[(0, storage(coordinates)), (1, storage(descriptors))],
        );
        let (generate_inputs, instances) = match (generate_inputs, instances) {
            (Ok(generate_inputs), Ok(instances)) => (generate_inputs, instances),
            (generate_inputs, instances) => {
                let error = generate_inputs.as_ref().err().or(instances.as_ref().err()).cloned();
                if let Ok(bind_group) = generate_inputs {
                    backend.destroy_bind_group(bind_group);
                }
                if let Ok(bind_group) = instances {
                    backend.destroy_bind_group(bind_group);
                }
                buffers.iter().for_each(|b| backend.destroy_buffer(*b));
                destroy_targets(backend, targets);
                return Err(error.unwrap_or_else(|| {
                    BackendError::BindGroupCreationFailed("SSIPG bind groups".into())
                }));
            }
        };

        let depth = targets.remove(4);
        let pressure = targets.remove(3);
        let orientation = targets.remove(2);
        let diffuse = targets.remove(1);
        let distance = targets.remove(0);
        log::debug!(
            "SSIPG targets created ({}x{}, capacity {})",
            width,
            height,
            capacity
        );
        Ok(Self {
            distance,
            diffuse,
            orientation,
            pressure,
            depth,
            counter,
            coordinates,
            descriptors,
            generate_inputs,
            instances,
            width,
            height,
            capacity,
        })
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_bind_group(self.generate_inputs);
        backend.destroy_bind_group(self.instances);
        for buffer in [self.counter, self.coordinates, self.descriptors] {
            backend.destroy_buffer(buffer);
        }
        destroy_targets(
            backend,
            vec![
                self.distance,
                self.diffuse,
                self.orientation,
                self.pressure,
                self.depth,
            ],
        );
    }

    /// Capture pass attachments: only the distance target and depth are cleared
    pub fn capture_pass(&self) -> RenderPassDescriptor {
        RenderPassDescriptor {
            label: Some("SSIPG Capture".into()),
            color_attachments: vec![
                self.distance.clear([0.0; 4]),
                self.diffuse.load(),
                self.orientation.load(),
                self.pressure.load(),
            ],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: self.depth.view,
                depth_ops: Some(Operations::clear(1.0)),
                stencil_ops: None,
            }),
        }
    }

    /// Workgroups covering the capture
    pub fn dispatch_size(&self) -> (u32, u32) {
        (
            self.width.div_ceil(SSIPG_WORKGROUP_SIZE),
            self.height.div_ceil(SSIPG_WORKGROUP_SIZE),
        )
    }

    /// Read the counter back and clamp it to the capacity.
    ///
    /// Returns `(reported, clamped)`. Blocks until the generate pass finished.
    pub fn read_instance_count(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<(u32, u32)> {
        let bytes = backend.read_buffer(self.counter, 0, 4)?;
        let reported = bytemuck::pod_read_unaligned::<u32>(&bytes[..4]);
        Ok((reported, clamp_instance_count(reported, self.capacity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layouts(backend: &mut HeadlessBackend) -> (BindGroupLayoutHandle, BindGroupLayoutHandle) {
        (
            backend.create_bind_group_layout(&[]).unwrap(),
            backend.create_bind_group_layout(&[]).unwrap(),
        )
    }

    #[test]
    fn clamp_never_exceeds_capacity() {
        assert_eq!(clamp_instance_count(10, 100), 10);
        assert_eq!(clamp_instance_count(100, 100), 100);
        assert_eq!(clamp_instance_count(u32::MAX, 100), 100);
        assert_eq!(clamp_instance_count(5, 0), 0);
    }

    #[test]
    fn capacity_is_one_instance_per_half_res_pixel() {
        assert_eq!(ssipg_capacity(1280, 720), 640 * 360);
        assert_eq!(ssipg_capacity(5, 3), 2);
        assert_eq!(ssipg_capacity(1, 1), 1);
    }

    #[test]
    fn buffers_are_sized_for_capacity() {
        let mut backend = HeadlessBackend::new(64, 32);
        let (generate, instances) = layouts(&mut backend);
        let ssipg = SsipgTargets::create(&mut backend, 64, 32, generate, instances).unwrap();
        assert_eq!(ssipg.capacity, 32 * 16);
        assert_eq!(
            backend.buffer_data(ssipg.coordinates).unwrap().len() as u64,
            ssipg.capacity as u64 * COORDINATE_STRIDE
        );
        assert_eq!(
            backend.buffer_data(ssipg.descriptors).unwrap().len() as u64,
            ssipg.capacity as u64 * DESCRIPTOR_STRIDE
        );
        assert_eq!(backend.buffer_by_label(SSIPG_COUNTER_LABEL), Some(ssipg.counter));
        assert_eq!(ssipg.dispatch_size(), (4, 2));
    }

    #[test]
    fn counter_read_back_is_clamped() {
        let mut backend = HeadlessBackend::new(16, 16);
        let (generate, instances) = layouts(&mut backend);
        let ssipg = SsipgTargets::create(&mut backend, 16, 16, generate, instances).unwrap();

        backend.set_readback_value(SSIPG_COUNTER_LABEL, &1000u32.to_le_bytes());
        assert_eq!(ssipg.read_instance_count(&mut backend).unwrap(), (1000, 64));

        backend.set_readback_value(SSIPG_COUNTER_LABEL, &12u32.to_le_bytes());
        assert_eq!(ssipg.read_instance_count(&mut backend).unwrap(), (12, 12));
    }

    #[test]
    fn capture_clears_only_the_distance_target() {
        let mut backend = HeadlessBackend::new(16, 16);
        let (generate, instances) = layouts(&mut backend);
        let ssipg = SsipgTargets::create(&mut backend, 16, 16, generate, instances).unwrap();
        let pass = ssipg.capture_pass();
        let cleared: Vec<bool> = pass.color_attachments.iter().map(|a| a.ops.is_clear()).collect();
        assert_eq!(cleared, vec![true, false, false, false]);
        assert!(pass.depth_stencil_attachment.unwrap().depth_ops.unwrap().is_clear());
    }

    #[test]
    fn generation_reads_every_capture_target() {
        let mut backend = HeadlessBackend::new(16, 16);
        let (generate, instances) = layouts(&mut backend);
        let ssipg = SsipgTargets::create(&mut backend, 16, 16, generate, instances).unwrap();

        let entries = backend.bind_group_entries(ssipg.generate_inputs).unwrap();
        let views: Vec<(u32, TextureViewHandle)> = entries
            .iter()
            .filter_map(|(binding, entry)| match entry {
                BindGroupEntry::Texture(view) => Some((*binding, *view)),
                _ => None,
            })
            .collect();
        assert_eq!(
            views,
            vec![
                (0, ssipg.distance.view),
                (1, ssipg.diffuse.view),
                (2, ssipg.orientation.view),
                (3, ssipg.pressure.view),
            ]
        );
        let buffers: Vec<(u32, BufferHandle)> = entries
            .iter()
            .filter_map(|(binding, entry)| match entry {
                BindGroupEntry::Buffer { buffer, .. } => Some((*binding, *buffer)),
                _ => None,
            })
            .collect();
        assert_eq!(
            buffers,
            vec![(4, ssipg.counter), (5, ssipg.coordinates), (6, ssipg.descriptors)]
        );
    }

    #[test]
    fn destroy_releases_everything() {
        let mut backend = HeadlessBackend::new(16, 16);
        let (generate, instances) = layouts(&mut backend);
        let ssipg = SsipgTargets::create(&mut backend, 16, 16, generate, instances).unwrap();
        ssipg.destroy(&mut backend);
        assert_eq!(backend.live_object_count(), 2); // the two layouts
    }

    #[test]
    fn failed_buffer_releases_targets() {
        let mut backend = HeadlessBackend::new(16, 16);
        let (generate, instances) = layouts(&mut backend);
        backend.fail_creation_of("SSIPG Descriptors");
        assert!(SsipgTargets::create(&mut backend, 16, 16, generate, instances).is_err());
        assert_eq!(backend.live_object_count(), 2);
    }
}
