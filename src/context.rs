//! The contract between the scene core and whatever draws it.
//!
//! Layers never touch a graphics API directly. They allocate and patch buffers and
//! issue [`DrawCall`]s through a [`GpuBackend`]. The crate ships a wgpu implementation
//! in [`crate::resources::wgpu_backend`]; tests drive the core with a recording one.

use cgmath::{EuclideanSpace, Matrix4, Point3, SquareMatrix, Vector3, Vector4};

use crate::{camera::OPENGL_TO_WGPU_MATRIX, pipelines::DrawPass, section_plane::SectionPlane};

/// Most section planes a single draw can clip against.
pub const MAX_SECTION_PLANES: usize = 8;

/// Opaque id of a buffer owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// What a buffer holds, so the backend can pick usages and vertex formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// `[u16; 4]` quantized positions, decoded by the draw's decode matrix.
    Positions,
    /// `[i8; 4]` oct-encoded normals, two components plus padding.
    Normals,
    /// `[u8; 4]` RGBA per vertex (batching) or per instance (instancing).
    Colors,
    PickColors,
    /// `u32` portion flags.
    Flags,
    /// `[f32; 3]` world offsets.
    Offsets,
    /// [`InstanceRaw`](crate::data_structures::instance::InstanceRaw) records.
    Instances,
    Indices,
    EdgeIndices,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framebuffer {
    Screen,
    Pick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect(&self) -> f64 {
        self.width as f64 / self.height.max(1) as f64
    }

    /// Whether a canvas position falls on a pixel of the viewport.
    pub fn contains(&self, canvas_pos: [f64; 2]) -> bool {
        (0.0..self.width as f64).contains(&canvas_pos[0])
            && (0.0..self.height as f64).contains(&canvas_pos[1])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Batching,
    Instancing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    Points,
    Lines,
    Triangles,
}

/// Buffers bound for one draw. For instancing layers the color, pick color, flag
/// and offset buffers are stepped per instance, for batching layers per vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBuffers {
    pub positions: BufferHandle,
    pub normals: BufferHandle,
    pub colors: BufferHandle,
    pub pick_colors: BufferHandle,
    pub flags: BufferHandle,
    pub offsets: BufferHandle,
    pub instances: Option<BufferHandle>,
}

/// Uniform block shared by every pass, laid out for WGSL.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawUniforms {
    /// View matrix pre-multiplied with the translation to the layer's world origin,
    /// computed in double precision.
    pub view_rtc: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    /// Linear part of the scene model's world matrix.
    pub model_linear: [[f32; 4]; 4],
    pub decode: [[f32; 4]; 4],
    /// Plane positions relative to the layer's world origin.
    pub section_plane_pos: [[f32; 4]; MAX_SECTION_PLANES],
    pub section_plane_dir: [[f32; 4]; MAX_SECTION_PLANES],
    /// Fill or line color of silhouette and edge passes.
    pub material_color: [f32; 4],
    pub num_section_planes: u32,
    pub pass: u32,
    pub _padding: [u32; 2],
}

impl DrawUniforms {
    /// Builds the uniforms of one layer draw.
    ///
    /// `origin` is the layer origin in model space; it is moved to world space here
    /// and cancelled against the camera translation before anything is cast to `f32`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pass: DrawPass,
        view: &Matrix4<f64>,
        projection: &Matrix4<f64>,
        model_matrix: &Matrix4<f64>,
        origin: Vector3<f64>,
        decode: &Matrix4<f64>,
        section_planes: &[SectionPlane],
        material_color: [f32; 4],
    ) -> Self {
        let world_origin =
            Point3::from_homogeneous(model_matrix * Point3::from_vec(origin).to_homogeneous());
        let world_origin = Vector3::new(world_origin.x, world_origin.y, world_origin.z);
        let view_rtc = view * Matrix4::from_translation(world_origin);
        let mut model_linear = *model_matrix;
        model_linear.w = Vector4::new(0.0, 0.0, 0.0, 1.0);

        let mut section_plane_pos = [[0.0; 4]; MAX_SECTION_PLANES];
        let mut section_plane_dir = [[0.0; 4]; MAX_SECTION_PLANES];
        let mut num_section_planes = 0;
        for plane in section_planes
            .iter()
            .filter(|plane| plane.active)
            .take(MAX_SECTION_PLANES)
        {
            let relative = plane.pos - Point3::from_vec(world_origin);
            section_plane_pos[num_section_planes] =
                [relative.x as f32, relative.y as f32, relative.z as f32, 0.0];
            section_plane_dir[num_section_planes] =
                [plane.dir.x as f32, plane.dir.y as f32, plane.dir.z as f32, 0.0];
            num_section_planes += 1;
        }

        Self {
            view_rtc: to_f32(&view_rtc),
            projection: to_f32(&(OPENGL_TO_WGPU_MATRIX * projection)),
            model_linear: to_f32(&model_linear),
            decode: to_f32(decode),
            section_plane_pos,
            section_plane_dir,
            material_color,
            num_section_planes: num_section_planes as u32,
            pass: pass.id(),
            _padding: [0; 2],
        }
    }
}

fn to_f32(m: &Matrix4<f64>) -> [[f32; 4]; 4] {
    m.cast::<f32>().unwrap_or_else(Matrix4::identity).into()
}

/// One draw of a whole layer for one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub pass: DrawPass,
    pub layer_kind: LayerKind,
    pub topology: Topology,
    pub vertex_buffers: VertexBuffers,
    pub index_buffer: BufferHandle,
    pub element_count: u32,
    pub instance_count: u32,
    pub cull_backfaces: bool,
    /// Front faces wind clockwise on screen.
    pub mirrored: bool,
    pub uniforms: DrawUniforms,
}

/// Synchronous GPU collaborator. Buffer handles stay valid until freed.
pub trait GpuBackend {
    fn allocate_buffer(&mut self, kind: BufferKind, data: &[u8]) -> anyhow::Result<BufferHandle>;

    fn update_buffer_range(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> anyhow::Result<()>;

    fn free_buffer(&mut self, handle: BufferHandle);

    /// Starts a new set of draws into `target`, discarding the previous one.
    fn begin(&mut self, target: Framebuffer, viewport: Viewport) -> anyhow::Result<()>;

    fn draw(&mut self, call: &DrawCall) -> anyhow::Result<()>;

    /// Resolves the draws issued since `begin` and returns one RGBA pixel.
    fn read_pixel(&mut self, target: Framebuffer, pos: [u32; 2]) -> anyhow::Result<[u8; 4]>;
}

/// Two-phase re-upload hook for lost GPU devices or contexts.
pub trait ResourceManager {
    /// Forgets every GPU handle without freeing it; the backend already lost them.
    fn invalidate(&mut self);

    /// Uploads everything again from retained CPU copies.
    fn rebuild_all(&mut self, backend: &mut dyn GpuBackend) -> crate::error::Result<()>;
}
