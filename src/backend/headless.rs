//! Headless GPU backend for testing and GPU-less runs.
//!
//! This backend doesn't touch a GPU. It records every command it receives
//! into an inspectable log, keeps buffer contents in memory and lets callers
//! script read-back results and creation failures by resource label.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use crate::backend::traits::*;
use crate::backend::types::*;

/// One command observed by the [`HeadlessBackend`]
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    BeginFrame,
    EndFrame,
    BeginRenderPass(RenderPassDescriptor),
    EndRenderPass,
    BeginComputePass(Option<String>),
    EndComputePass,
    SetRenderPipeline(RenderPipelineHandle),
    SetComputePipeline(ComputePipelineHandle),
    SetBindGroup { index: u32, bind_group: BindGroupHandle },
    SetUniforms { index: u32, data: Vec<u8> },
    SetVertexBuffer { slot: u32, buffer: BufferHandle, offset: u64 },
    SetIndexBuffer { buffer: BufferHandle, offset: u64, format: IndexFormat },
    SetViewport { x: f32, y: f32, width: f32, height: f32 },
    SetStencilReference(u32),
    Draw { vertices: Range<u32>, instances: Range<u32> },
    DrawIndexed { indices: Range<u32>, base_vertex: i32, instances: Range<u32> },
    Dispatch { x: u32, y: u32, z: u32 },
    WriteBuffer { buffer: BufferHandle, offset: u64, len: usize },
    ClearBuffer(BufferHandle),
    ReadBuffer(BufferHandle),
}

#[derive(Debug)]
struct HeadlessBuffer {
    label: Option<String>,
    data: Vec<u8>,
}

/// Headless GPU backend.
#[derive(Debug)]
pub struct HeadlessBackend {
    width: u32,
    height: u32,
    features: BackendFeatures,
    commands: Vec<RecordedCommand>,

    buffers: HashMap<u64, HeadlessBuffer>,
    textures: HashMap<u64, TextureDescriptor>,
    texture_views: HashMap<u64, TextureHandle>,
    samplers: HashSet<u64>,
    bind_group_layouts: HashSet<u64>,
    bind_groups: HashMap<u64, Vec<(u32, BindGroupEntry)>>,
    render_pipelines: HashMap<u64, RenderPipelineDescriptor>,
    compute_pipelines: HashMap<u64, ComputePipelineDescriptor>,
    next_id: u64,

    swapchain_view: TextureViewHandle,
    uniform_layout: BindGroupLayoutHandle,
    in_frame: bool,
    in_render_pass: bool,
    in_compute_pass: bool,

    readback_values: HashMap<String, Vec<u8>>,
    failing_labels: HashSet<String>,
}

impl HeadlessBackend {
    /// Create a new headless backend with the given surface size.
    pub fn new(width: u32, height: u32) -> Self {
        let mut bind_group_layouts = HashSet::new();
        bind_group_layouts.insert(1);
        Self {
            width,
            height,
            features: BackendFeatures { wireframe: true },
            commands: Vec::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            samplers: HashSet::new(),
            bind_group_layouts,
            bind_groups: HashMap::new(),
            render_pipelines: HashMap::new(),
            compute_pipelines: HashMap::new(),
            next_id: 3,
            swapchain_view: TextureViewHandle(2),
            uniform_layout: BindGroupLayoutHandle(1),
            in_frame: false,
            in_render_pass: false,
            in_compute_pass: false,
            readback_values: HashMap::new(),
            failing_labels: HashSet::new(),
        }
    }

    /// Override the advertised feature set.
    pub fn with_features(mut self, features: BackendFeatures) -> Self {
        self.features = features;
        self
    }

    /// Bytes returned by [`GraphicsBackend::read_buffer`] for buffers with this label.
    pub fn set_readback_value(&mut self, label: &str, bytes: &[u8]) {
        self.readback_values.insert(label.to_string(), bytes.to_vec());
    }

    /// Make every later creation call for a resource with this label fail.
    pub fn fail_creation_of(&mut self, label: &str) {
        self.failing_labels.insert(label.to_string());
    }

    /// Every command recorded so far.
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Labels of the render and compute passes, in recording order.
    pub fn pass_labels(&self) -> Vec<String> {
        self.commands
            .iter()
            .filter_map(|cmd| match cmd {
                RecordedCommand::BeginRenderPass(desc) => {
                    Some(desc.label.clone().unwrap_or_default())
                }
                RecordedCommand::BeginComputePass(label) => Some(label.clone().unwrap_or_default()),
                _ => None,
            })
            .collect()
    }

    /// Commands recorded inside every pass with the given label.
    pub fn commands_in_pass(&self, label: &str) -> Vec<&RecordedCommand> {
        let mut inside = false;
        let mut result = Vec::new();
        for cmd in &self.commands {
            match cmd {
                RecordedCommand::BeginRenderPass(desc) => {
                    inside = desc.label.as_deref() == Some(label);
                }
                RecordedCommand::BeginComputePass(pass_label) => {
                    inside = pass_label.as_deref() == Some(label);
                }
                RecordedCommand::EndRenderPass | RecordedCommand::EndComputePass => inside = false,
                other if inside => result.push(other),
                _ => {}
            }
        }
        result
    }

    /// Descriptor of the first render pass with the given label.
    pub fn render_pass(&self, label: &str) -> Option<&RenderPassDescriptor> {
        self.commands.iter().find_map(|cmd| match cmd {
            RecordedCommand::BeginRenderPass(desc) if desc.label.as_deref() == Some(label) => {
                Some(desc)
            }
            _ => None,
        })
    }

    /// Entries a live bind group was created with.
    pub fn bind_group_entries(&self, handle: BindGroupHandle) -> Option<&[(u32, BindGroupEntry)]> {
        self.bind_groups.get(&handle.0).map(Vec::as_slice)
    }

    pub fn render_pipeline(&self, handle: RenderPipelineHandle) -> Option<&RenderPipelineDescriptor> {
        self.render_pipelines.get(&handle.0)
    }

    /// Find a live buffer by its label.
    pub fn buffer_by_label(&self, label: &str) -> Option<BufferHandle> {
        self.buffers
            .iter()
            .find(|(_, buf)| buf.label.as_deref() == Some(label))
            .map(|(id, _)| BufferHandle(*id))
    }

    pub fn buffer_data(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|buf| buf.data.as_slice())
    }

    /// Find a live texture by its label.
    pub fn texture_by_label(&self, label: &str) -> Option<&TextureDescriptor> {
        self.textures
            .values()
            .find(|desc| desc.label.as_deref() == Some(label))
    }

    /// Number of live GPU objects of every kind, not counting the uniform layout.
    pub fn live_object_count(&self) -> usize {
        self.buffers.len()
            + self.textures.len()
            + self.texture_views.len()
            + self.samplers.len()
            + self.bind_groups.len()
            + self.render_pipelines.len()
            + self.compute_pipelines.len()
            + self.bind_group_layouts.len()
            - 1
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_label(&self, label: Option<&str>) -> Result<(), String> {
        match label {
            Some(label) if self.failing_labels.contains(label) => {
                Err(format!("injected failure for {label:?}"))
            }
            _ => Ok(()),
        }
    }

    fn record(&mut self, cmd: RecordedCommand) {
        log::trace!("HeadlessBackend: {:?}", cmd);
        self.commands.push(cmd);
    }

    fn record_in_pass(&mut self, cmd: RecordedCommand) {
        if self.in_render_pass || self.in_compute_pass {
            self.record(cmd);
        } else {
            log::debug!("HeadlessBackend: {:?} outside of a pass, ignored", cmd);
        }
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn features(&self) -> BackendFeatures {
        self.features
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn swapchain_format(&self) -> TextureFormat {
        TextureFormat::Bgra8UnormSrgb
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        if self.in_frame {
            return Err(BackendError::AcquireImageFailed("frame already in progress".into()));
        }
        self.in_frame = true;
        self.record(RecordedCommand::BeginFrame);
        Ok(FrameContext {
            swapchain_view: self.swapchain_view,
            width: self.width,
            height: self.height,
        })
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        self.in_frame = false;
        self.record(RecordedCommand::EndFrame);
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        self.create_buffer_init(desc, &[])
    }

    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8]) -> BackendResult<BufferHandle> {
        self.check_label(desc.label.as_deref())
            .map_err(BackendError::BufferCreationFailed)?;
        log::trace!(
            "HeadlessBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let mut contents = vec![0u8; desc.size.max(data.len() as u64) as usize];
        contents[..data.len()].copy_from_slice(data);
        let id = self.next_handle();
        self.buffers.insert(
            id,
            HeadlessBuffer {
                label: desc.label.clone(),
                data: contents,
            },
        );
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        if let Some(buf) = self.buffers.get_mut(&buffer.0) {
            let start = offset as usize;
            let end = (start + data.len()).min(buf.data.len());
            if start < end {
                buf.data[start..end].copy_from_slice(&data[..end - start]);
            }
        }
        self.record(RecordedCommand::WriteBuffer {
            buffer,
            offset,
            len: data.len(),
        });
    }

    fn clear_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buf) = self.buffers.get_mut(&buffer.0) {
            buf.data.iter_mut().for_each(|b| *b = 0);
        }
        self.record(RecordedCommand::ClearBuffer(buffer));
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        if self.in_render_pass || self.in_compute_pass {
            return Err(BackendError::ReadbackFailed(
                "read-back requested while a pass is being recorded".into(),
            ));
        }
        let buf = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| BackendError::ReadbackFailed(format!("unknown buffer {:?}", buffer)))?;

        let scripted = buf
            .label
            .as_ref()
            .and_then(|label| self.readback_values.get(label));
        let source = scripted.unwrap_or(&buf.data);

        let start = offset as usize;
        let end = start + size as usize;
        let mut bytes = vec![0u8; size as usize];
        if start < source.len() {
            let available = end.min(source.len());
            bytes[..available - start].copy_from_slice(&source[start..available]);
        }

        self.record(RecordedCommand::ReadBuffer(buffer));
        Ok(bytes)
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        self.check_label(desc.label.as_deref())
            .map_err(BackendError::TextureCreationFailed)?;
        log::trace!(
            "HeadlessBackend: creating texture {:?} ({}x{} {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        let id = self.next_handle();
        self.textures.insert(id, desc.clone());
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        if !self.textures.contains_key(&texture.0) {
            return Err(BackendError::TextureCreationFailed("Texture not found".into()));
        }
        let id = self.next_handle();
        self.texture_views.insert(id, texture);
        Ok(TextureViewHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8], width: u32, height: u32) {
        log::trace!(
            "HeadlessBackend: writing {} bytes ({}x{}) to {:?}",
            data.len(),
            width,
            height,
            texture
        );
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("HeadlessBackend: creating sampler {:?}", desc.label);
        let id = self.next_handle();
        self.samplers.insert(id);
        Ok(SamplerHandle(id))
    }

    fn uniform_layout(&self) -> BindGroupLayoutHandle {
        self.uniform_layout
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        log::trace!("HeadlessBackend: creating layout with {} entries", entries.len());
        let id = self.next_handle();
        self.bind_group_layouts.insert(id);
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        if !self.bind_group_layouts.contains(&layout.0) {
            return Err(BackendError::BindGroupCreationFailed("Layout not found".into()));
        }
        for (binding, entry) in entries {
            let known = match entry {
                BindGroupEntry::Buffer { buffer, .. } => self.buffers.contains_key(&buffer.0),
                BindGroupEntry::Texture(view) => self.texture_views.contains_key(&view.0),
                BindGroupEntry::Sampler(sampler) => self.samplers.contains(&sampler.0),
            };
            if !known {
                return Err(BackendError::BindGroupCreationFailed(format!(
                    "binding {binding} references a destroyed resource"
                )));
            }
        }
        let id = self.next_handle();
        self.bind_groups.insert(id, entries.to_vec());
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        self.check_label(desc.label.as_deref())
            .map_err(BackendError::PipelineCreationFailed)?;
        if let Some(layout) = desc
            .bind_group_layouts
            .iter()
            .find(|layout| !self.bind_group_layouts.contains(&layout.0))
        {
            return Err(BackendError::PipelineCreationFailed(format!(
                "unknown layout {:?}",
                layout
            )));
        }
        log::trace!("HeadlessBackend: creating render pipeline {:?}", desc.label);
        let id = self.next_handle();
        self.render_pipelines.insert(id, desc.clone());
        Ok(RenderPipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        self.check_label(desc.label.as_deref())
            .map_err(BackendError::PipelineCreationFailed)?;
        log::trace!("HeadlessBackend: creating compute pipeline {:?}", desc.label);
        let id = self.next_handle();
        self.compute_pipelines.insert(id, desc.clone());
        Ok(ComputePipelineHandle(id))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        self.in_render_pass = true;
        self.record(RecordedCommand::BeginRenderPass(desc.clone()));
    }

    fn end_render_pass(&mut self) {
        self.in_render_pass = false;
        self.record(RecordedCommand::EndRenderPass);
    }

    fn begin_compute_pass(&mut self, label: Option<&str>) {
        self.in_compute_pass = true;
        self.record(RecordedCommand::BeginComputePass(label.map(str::to_string)));
    }

    fn end_compute_pass(&mut self) {
        self.in_compute_pass = false;
        self.record(RecordedCommand::EndComputePass);
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.record_in_pass(RecordedCommand::SetRenderPipeline(pipeline));
    }

    fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.record_in_pass(RecordedCommand::SetComputePipeline(pipeline));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        self.record_in_pass(RecordedCommand::SetBindGroup { index, bind_group });
    }

    fn set_uniforms(&mut self, index: u32, data: &[u8]) {
        let len = data.len().min(UNIFORM_BLOCK_SIZE as usize);
        self.record_in_pass(RecordedCommand::SetUniforms {
            index,
            data: data[..len].to_vec(),
        });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        self.record_in_pass(RecordedCommand::SetVertexBuffer { slot, buffer, offset });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        self.record_in_pass(RecordedCommand::SetIndexBuffer { buffer, offset, format });
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, _min_depth: f32, _max_depth: f32) {
        self.record_in_pass(RecordedCommand::SetViewport { x, y, width, height });
    }

    fn set_stencil_reference(&mut self, reference: u32) {
        self.record_in_pass(RecordedCommand::SetStencilReference(reference));
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.record_in_pass(RecordedCommand::Draw { vertices, instances });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        self.record_in_pass(RecordedCommand::DrawIndexed {
            indices,
            base_vertex,
            instances,
        });
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) {
        self.record_in_pass(RecordedCommand::Dispatch { x, y, z });
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        self.texture_views.remove(&view.0);
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.bind_groups.remove(&bind_group.0);
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle) {
        if layout != self.uniform_layout {
            self.bind_group_layouts.remove(&layout.0);
        }
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.render_pipelines.remove(&pipeline.0);
    }

    fn destroy_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.compute_pipelines.remove(&pipeline.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_desc() -> BufferDescriptor {
        BufferDescriptor {
            label: Some("Counter".into()),
            size: 4,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_SRC,
        }
    }

    #[test]
    fn readback_prefers_scripted_value() {
        let mut backend = HeadlessBackend::new(64, 64);
        let buffer = backend.create_buffer(&counter_desc()).unwrap();
        assert_eq!(backend.read_buffer(buffer, 0, 4).unwrap(), vec![0, 0, 0, 0]);

        backend.set_readback_value("Counter", &7u32.to_le_bytes());
        let bytes = backend.read_buffer(buffer, 0, 4).unwrap();
        assert_eq!(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 7);
    }

    #[test]
    fn readback_inside_pass_is_rejected() {
        let mut backend = HeadlessBackend::new(64, 64);
        let buffer = backend.create_buffer(&counter_desc()).unwrap();
        backend.begin_compute_pass(Some("work"));
        assert!(matches!(
            backend.read_buffer(buffer, 0, 4),
            Err(BackendError::ReadbackFailed(_))
        ));
    }

    #[test]
    fn injected_failure_is_reported() {
        let mut backend = HeadlessBackend::new(64, 64);
        backend.fail_creation_of("Counter");
        assert!(matches!(
            backend.create_buffer(&counter_desc()),
            Err(BackendError::BufferCreationFailed(_))
        ));
    }

    #[test]
    fn commands_outside_passes_are_dropped() {
        let mut backend = HeadlessBackend::new(64, 64);
        backend.draw(0..3, 0..1);
        assert!(backend.commands().is_empty());

        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Main".into()),
            color_attachments: vec![],
            depth_stencil_attachment: None,
        });
        backend.draw(0..3, 0..1);
        backend.end_render_pass();
        assert_eq!(backend.commands_in_pass("Main").len(), 1);
        assert_eq!(backend.pass_labels(), vec!["Main".to_string()]);
    }
}
