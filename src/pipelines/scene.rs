use crate::{
    context::{DrawUniforms, LayerKind, Topology},
    data_structures::instance::InstanceRaw,
    pipelines::{DrawPass, FragmentStage, Vertex},
};

pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24Plus;
pub const PICK_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Everything a scene pipeline is specialised on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub pass: DrawPass,
    pub layer_kind: LayerKind,
    pub topology: Topology,
    pub cull_backfaces: bool,
    /// Mirrored instances wind their front faces clockwise.
    pub mirrored: bool,
}

impl PipelineKey {
    fn vertex_entry_point(&self) -> &'static str {
        match self.layer_kind {
            LayerKind::Batching => "vs_batched",
            LayerKind::Instancing => "vs_instanced",
        }
    }

    fn primitive_topology(&self) -> wgpu::PrimitiveTopology {
        match self.topology {
            Topology::Points => wgpu::PrimitiveTopology::PointList,
            Topology::Lines => wgpu::PrimitiveTopology::LineList,
            Topology::Triangles => wgpu::PrimitiveTopology::TriangleList,
        }
    }

    fn blend(&self) -> Option<wgpu::BlendState> {
        if self.pass.is_blended() {
            Some(wgpu::BlendState::ALPHA_BLENDING)
        } else {
            Some(wgpu::BlendState {
                alpha: wgpu::BlendComponent::REPLACE,
                color: wgpu::BlendComponent::REPLACE,
            })
        }
    }
}

/// Per-portion channels step per vertex in batching layers and per instance in
/// instancing layers.
fn channel_step(layer_kind: LayerKind) -> wgpu::VertexStepMode {
    match layer_kind {
        LayerKind::Batching => wgpu::VertexStepMode::Vertex,
        LayerKind::Instancing => wgpu::VertexStepMode::Instance,
    }
}

const POSITION_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Uint16x4];
const NORMAL_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![1 => Snorm8x4];
const COLOR_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![2 => Unorm8x4];
const PICK_COLOR_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![3 => Unorm8x4];
const FLAG_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![4 => Uint32];
const OFFSET_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![5 => Float32x3];

/// Buffer slots 0 to 5 in the order the backend binds them.
pub fn channel_layouts(layer_kind: LayerKind) -> [wgpu::VertexBufferLayout<'static>; 6] {
    let step = channel_step(layer_kind);
    let layout = |stride: usize, step_mode, attributes: &'static [wgpu::VertexAttribute]| {
        wgpu::VertexBufferLayout {
            array_stride: stride as wgpu::BufferAddress,
            step_mode,
            attributes,
        }
    };
    [
        layout(8, wgpu::VertexStepMode::Vertex, &POSITION_ATTRIBUTES),
        layout(4, wgpu::VertexStepMode::Vertex, &NORMAL_ATTRIBUTES),
        layout(4, step, &COLOR_ATTRIBUTES),
        layout(4, step, &PICK_COLOR_ATTRIBUTES),
        layout(4, step, &FLAG_ATTRIBUTES),
        layout(12, step, &OFFSET_ATTRIBUTES),
    ]
}

impl Vertex for InstanceRaw {
    fn desc() -> wgpu::VertexBufferLayout<'static> {
        use std::mem;
        wgpu::VertexBufferLayout {
            array_stride: mem::size_of::<InstanceRaw>() as wgpu::BufferAddress,
            // Switch from one instance to the next only after all vertices of the
            // current instance were processed.
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &[
                // A mat4 takes up 4 vertex slots as it is technically 4 vec4s.
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 6,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: mem::size_of::<[f32; 4]>() as wgpu::BufferAddress,
                    shader_location: 7,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: mem::size_of::<[f32; 8]>() as wgpu::BufferAddress,
                    shader_location: 8,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: mem::size_of::<[f32; 12]>() as wgpu::BufferAddress,
                    shader_location: 9,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: mem::size_of::<[f32; 16]>() as wgpu::BufferAddress,
                    shader_location: 10,
                    format: wgpu::VertexFormat::Float32x3,
                },
                wgpu::VertexAttribute {
                    offset: mem::size_of::<[f32; 19]>() as wgpu::BufferAddress,
                    shader_location: 11,
                    format: wgpu::VertexFormat::Float32x3,
                },
                wgpu::VertexAttribute {
                    offset: mem::size_of::<[f32; 22]>() as wgpu::BufferAddress,
                    shader_location: 12,
                    format: wgpu::VertexFormat::Float32x3,
                },
            ],
        }
    }
}

pub fn uniform_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        entries: &[wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<DrawUniforms>() as u64),
            },
            count: None,
        }],
        label: Some("draw_uniforms_bind_group_layout"),
    })
}

pub fn scene_shader(device: &wgpu::Device) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("Scene Shader"),
        source: wgpu::ShaderSource::Wgsl(include_str!("scene.wgsl").into()),
    })
}

pub fn mk_scene_pipeline_layout(
    device: &wgpu::Device,
    uniform_layout: &wgpu::BindGroupLayout,
) -> wgpu::PipelineLayout {
    device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("Scene Pipeline Layout"),
        bind_group_layouts: &[Some(uniform_layout)],
        immediate_size: 0,
    })
}

/// Builds the pipeline for one [`PipelineKey`]. Pick passes render into
/// [`PICK_FORMAT`], everything else into `color_format`.
pub fn mk_scene_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    shader: &wgpu::ShaderModule,
    key: PipelineKey,
    color_format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    let channels = channel_layouts(key.layer_kind);
    let mut buffers: Vec<wgpu::VertexBufferLayout> = channels.to_vec();
    if key.layer_kind == LayerKind::Instancing {
        buffers.push(InstanceRaw::desc());
    }
    let format = if key.pass.is_pick() {
        PICK_FORMAT
    } else {
        color_format
    };
    let blend = match key.pass.fragment_stage() {
        FragmentStage::PickMesh | FragmentStage::PackedDepth | FragmentStage::PackedNormal => None,
        _ => key.blend(),
    };

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        cache: None,
        label: Some("Scene Pipeline"),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some(key.vertex_entry_point()),
            buffers: &buffers,
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: Some(key.pass.fragment_stage().entry_point()),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: key.primitive_topology(),
            strip_index_format: None,
            front_face: if key.mirrored {
                wgpu::FrontFace::Cw
            } else {
                wgpu::FrontFace::Ccw
            },
            cull_mode: key.cull_backfaces.then_some(wgpu::Face::Back),
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: Some(wgpu::DepthStencilState {
            format: DEPTH_FORMAT,
            depth_write_enabled: Some(!key.pass.is_blended()),
            depth_compare: Some(wgpu::CompareFunction::LessEqual),
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        }),
        multisample: wgpu::MultisampleState {
            count: 1,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
        multiview_mask: None,
    })
}
