//! [`GpuBackend`] over a wgpu device and queue.
//!
//! Screen draws are recorded and replayed by the host into its own render pass with
//! [`WgpuBackend::replay`], so the host keeps control of the surface, clears and any
//! UI drawn on top. Pick draws go into an offscreen RGBA8 target owned by the
//! backend and are resolved by [`GpuBackend::read_pixel`], which copies the one pixel
//! under the cursor and maps it back synchronously.

use std::iter;

use anyhow::{Context, anyhow, bail};
use log::{debug, warn};
use rustc_hash::FxHashMap;
use wgpu::util::DeviceExt;

use crate::{
    context::{BufferHandle, BufferKind, DrawCall, Framebuffer, GpuBackend, LayerKind, Viewport},
    pipelines::scene::{
        DEPTH_FORMAT, PICK_FORMAT, PipelineKey, mk_scene_pipeline, mk_scene_pipeline_layout,
        scene_shader, uniform_layout,
    },
};

/// A draw waiting to be replayed into a render pass.
struct RecordedDraw {
    key: PipelineKey,
    bind_group: wgpu::BindGroup,
    vertex_buffers: [BufferHandle; 6],
    instances: Option<BufferHandle>,
    index_buffer: BufferHandle,
    element_count: u32,
    instance_count: u32,
}

struct PickTarget {
    size: Viewport,
    color: wgpu::Texture,
    depth: wgpu::Texture,
}

impl PickTarget {
    fn new(device: &wgpu::Device, size: Viewport) -> Self {
        let extent3d = wgpu::Extent3d {
            width: size.width.max(1),
            height: size.height.max(1),
            depth_or_array_layers: 1,
        };
        let color = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Pick texture"),
            size: extent3d,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: PICK_FORMAT,
            usage: wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let depth = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Pick depth texture"),
            size: extent3d,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        Self { size, color, depth }
    }
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    color_format: wgpu::TextureFormat,
    buffers: FxHashMap<BufferHandle, wgpu::Buffer>,
    next_handle: u64,
    uniform_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    shader: wgpu::ShaderModule,
    pipelines: FxHashMap<PipelineKey, wgpu::RenderPipeline>,
    target: Option<Framebuffer>,
    recorded: Vec<RecordedDraw>,
    pick_target: Option<PickTarget>,
}

impl WgpuBackend {
    /// `color_format` is the format of the host's screen target.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, color_format: wgpu::TextureFormat) -> Self {
        let uniform_layout = uniform_layout(&device);
        let pipeline_layout = mk_scene_pipeline_layout(&device, &uniform_layout);
        let shader = scene_shader(&device);
        Self {
            device,
            queue,
            color_format,
            buffers: FxHashMap::default(),
            next_handle: 0,
            uniform_layout,
            pipeline_layout,
            shader,
            pipelines: FxHashMap::default(),
            target: None,
            recorded: Vec::new(),
            pick_target: None,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Drops every buffer and pipeline, as after a lost device. Handles held by the
    /// scene must be invalidated alongside.
    pub fn reset(&mut self, device: wgpu::Device, queue: wgpu::Queue) {
        *self = Self::new(device, queue, self.color_format);
    }

    fn ensure_pipeline(&mut self, key: PipelineKey) {
        let device = &self.device;
        self.pipelines.entry(key).or_insert_with(|| {
            debug!("Building pipeline for {key:?}");
            mk_scene_pipeline(device, &self.pipeline_layout, &self.shader, key, self.color_format)
        });
    }

    /// Replays the screen draws recorded since the last `begin(Framebuffer::Screen, ..)`
    /// into `render_pass`. The pass must have a color attachment in the backend's
    /// color format and a [`DEPTH_FORMAT`] depth attachment.
    pub fn replay(&self, render_pass: &mut wgpu::RenderPass<'_>) {
        if self.target != Some(Framebuffer::Screen) {
            return;
        }
        self.replay_recorded(render_pass);
    }

    fn replay_recorded(&self, render_pass: &mut wgpu::RenderPass<'_>) {
        for draw in &self.recorded {
            let Some(pipeline) = self.pipelines.get(&draw.key) else {
                continue;
            };
            let buffers: Option<Vec<&wgpu::Buffer>> = draw
                .vertex_buffers
                .iter()
                .chain(draw.instances.iter())
                .map(|handle| self.buffers.get(handle))
                .collect();
            let (Some(buffers), Some(index_buffer)) = (buffers, self.buffers.get(&draw.index_buffer))
            else {
                warn!("Skipping draw that references freed buffers");
                continue;
            };
            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &draw.bind_group, &[]);
            for (slot, buffer) in buffers.iter().enumerate() {
                render_pass.set_vertex_buffer(slot as u32, buffer.slice(..));
            }
            render_pass.set_index_buffer(index_buffer.slice(..), wgpu::IndexFormat::Uint32);
            render_pass.draw_indexed(0..draw.element_count, 0, 0..draw.instance_count);
        }
    }

    fn render_pick_target(&self, target: &PickTarget) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Pick Encoder"),
            });
        {
            let color_view = target.color.create_view(&wgpu::TextureViewDescriptor::default());
            let depth_view = target.depth.create_view(&wgpu::TextureViewDescriptor::default());
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Pick Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
                multiview_mask: None,
            });
            self.replay_recorded(&mut render_pass);
        }
        self.queue.submit(iter::once(encoder.finish()));
    }

    fn copy_pick_pixel(&self, target: &PickTarget, pos: [u32; 2]) -> anyhow::Result<[u8; 4]> {
        // copies need rows aligned to 256 bytes even for a single pixel
        let bytes_per_row = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let output_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            size: bytes_per_row as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            label: Some("Pick readback"),
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Pick Copy Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                aspect: wgpu::TextureAspect::All,
                texture: &target.color,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: pos[0],
                    y: pos[1],
                    z: 0,
                },
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &output_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(1),
                },
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(iter::once(encoder.finish()));

        let buffer_slice = output_buffer.slice(..);
        futures::executor::block_on(read_mapped_pixel(buffer_slice, &self.device))?;
        let pixel = {
            let data = buffer_slice.get_mapped_range();
            [data[0], data[1], data[2], data[3]]
        };
        output_buffer.unmap();
        Ok(pixel)
    }
}

/// Maps `buffer_slice` for reading. The mapping has to be requested before the
/// device is polled, otherwise the wait never finishes.
async fn read_mapped_pixel(
    buffer_slice: wgpu::BufferSlice<'_>,
    device: &wgpu::Device,
) -> anyhow::Result<()> {
    let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
    buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
        // the receiver lives until the await below
        let _ = tx.send(result);
    });
    device
        .poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        })
        .map_err(|e| anyhow!("Device poll failed: {e}"))?;
    rx.receive()
        .await
        .context("Pick readback channel closed")?
        .context("Pick readback could not be mapped")
}

fn buffer_usage(kind: BufferKind) -> wgpu::BufferUsages {
    match kind {
        BufferKind::Indices | BufferKind::EdgeIndices => {
            wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST
        }
        _ => wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
    }
}

impl GpuBackend for WgpuBackend {
    fn allocate_buffer(&mut self, kind: BufferKind, data: &[u8]) -> anyhow::Result<BufferHandle> {
        // wgpu rejects empty vertex buffers on some backends, keep one aligned word
        let padded;
        let contents = if data.is_empty() {
            padded = [0u8; 4];
            &padded[..]
        } else {
            data
        };
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{kind:?} Buffer")),
                contents,
                usage: buffer_usage(kind),
            });
        self.next_handle += 1;
        let handle = BufferHandle(self.next_handle);
        self.buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn update_buffer_range(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let buffer = self
            .buffers
            .get(&handle)
            .ok_or_else(|| anyhow!("Unknown buffer {handle:?}"))?;
        if offset + data.len() as u64 > buffer.size() {
            bail!(
                "Write of {} bytes at {offset} overflows buffer {handle:?} of {} bytes",
                data.len(),
                buffer.size()
            );
        }
        // queue writes must be multiples of four bytes
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            bail!("Unaligned write of {} bytes at {offset}", data.len());
        }
        self.queue.write_buffer(buffer, offset, data);
        Ok(())
    }

    fn free_buffer(&mut self, handle: BufferHandle) {
        match self.buffers.remove(&handle) {
            Some(buffer) => buffer.destroy(),
            None => warn!("Freeing unknown buffer {handle:?}"),
        }
    }

    fn begin(&mut self, target: Framebuffer, viewport: Viewport) -> anyhow::Result<()> {
        self.recorded.clear();
        self.target = Some(target);
        if target == Framebuffer::Pick
            && self
                .pick_target
                .as_ref()
                .is_none_or(|pick| pick.size != viewport)
        {
            self.pick_target = Some(PickTarget::new(&self.device, viewport));
        }
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall) -> anyhow::Result<()> {
        let key = PipelineKey {
            pass: call.pass,
            layer_kind: call.layer_kind,
            topology: call.topology,
            cull_backfaces: call.cull_backfaces,
            mirrored: call.mirrored,
        };
        if call.layer_kind == LayerKind::Instancing && call.vertex_buffers.instances.is_none() {
            bail!("Instanced draw without an instance buffer");
        }
        self.ensure_pipeline(key);
        let uniform_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Draw Uniform Buffer"),
                contents: bytemuck::cast_slice(&[call.uniforms]),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            layout: &self.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }],
            label: Some("draw_uniforms_bind_group"),
        });
        let vb = call.vertex_buffers;
        self.recorded.push(RecordedDraw {
            key,
            bind_group,
            vertex_buffers: [vb.positions, vb.normals, vb.colors, vb.pick_colors, vb.flags, vb.offsets],
            instances: vb.instances,
            index_buffer: call.index_buffer,
            element_count: call.element_count,
            instance_count: call.instance_count,
        });
        Ok(())
    }

    fn read_pixel(&mut self, target: Framebuffer, pos: [u32; 2]) -> anyhow::Result<[u8; 4]> {
        if target != Framebuffer::Pick {
            bail!("Only the pick target can be read back");
        }
        if cfg!(target_arch = "wasm32") {
            bail!("Synchronous pick readback is not available on wasm32, pick with PickStrategy::RayCast");
        }
        let pick = self
            .pick_target
            .as_ref()
            .context("Pick target read before any pick draws")?;
        if pos[0] >= pick.size.width.max(1) || pos[1] >= pick.size.height.max(1) {
            bail!("Pick position {pos:?} is outside the {:?} target", pick.size);
        }
        self.render_pick_target(pick);
        self.copy_pick_pixel(pick, pos)
    }
}
