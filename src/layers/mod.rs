//! GPU-resident groupings of mesh portions.
//!
//! - [`batching::BatchingLayer`] concatenates many geometries into shared buffers and
//!   bakes each mesh transform into the vertex positions.
//! - [`instancing::InstancingLayer`] draws one shared geometry once per portion, with
//!   the transform supplied per instance.
//!
//! Both expose the same [`Layer`] contract: portion state setters that only touch the
//! [`PortionStore`], a `finalize` gate after which the layer is read-only except for
//! that state, and one draw call per pass that is skipped when the layer counters
//! show nothing to draw.

use cgmath::{EuclideanSpace, InnerSpace, Matrix4, Point3, Vector3, Vector4};

use crate::{
    camera::CameraFrame,
    config::{BackfacePolicy, SceneDefaults},
    context::{BufferHandle, BufferKind, DrawCall, GpuBackend, LayerKind, Topology},
    data_structures::{
        aabb::Aabb,
        flags::PortionFlags,
        geometry::Primitive,
        portion::PortionStore,
        ray::Ray,
    },
    error::Result,
    pipelines::DrawPass,
    section_plane::SectionPlane,
};

pub mod batching;
pub mod instancing;

/// Everything a layer needs from the frame to build a draw call.
pub struct LayerDrawContext<'a> {
    pub camera: &'a CameraFrame,
    pub model_matrix: &'a Matrix4<f64>,
    /// Active section planes, empty when the layer is not clipped this frame.
    pub section_planes: &'a [SectionPlane],
    pub backface_policy: BackfacePolicy,
    pub defaults: &'a SceneDefaults,
}

/// Nearest ray/triangle hit inside one portion, in model space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub distance: f64,
    pub primitive_index: u32,
    pub position: Point3<f64>,
    pub normal: Vector3<f64>,
}

pub(crate) fn topology_of(primitive: Primitive) -> Topology {
    match primitive {
        Primitive::Points => Topology::Points,
        Primitive::Lines => Topology::Lines,
        _ => Topology::Triangles,
    }
}

/// Backfaces are culled only on solid triangles that no section plane cuts open.
pub(crate) fn cull_backfaces(primitive: Primitive, policy: BackfacePolicy, clipped: bool) -> bool {
    if clipped || !primitive.is_triangles() {
        return false;
    }
    match policy {
        BackfacePolicy::Infer => primitive == Primitive::Solid,
        BackfacePolicy::AlwaysShow => false,
        BackfacePolicy::AlwaysCull => true,
    }
}

/// Geometry in its uploaded encoding: quantized positions, oct-encoded normals.
/// Normals are padded to four bytes to keep the vertex stride aligned.
#[derive(Debug, Clone, Default)]
pub struct PackedArrays {
    pub positions: Vec<[u16; 4]>,
    pub normals: Vec<[i8; 4]>,
    pub indices: Vec<u32>,
    pub edge_indices: Vec<u32>,
}

impl PackedArrays {
    pub fn from_parts(quantized: &[u16], normals: Option<&[i8]>, indices: Vec<u32>, edge_indices: Vec<u32>) -> Self {
        let positions: Vec<[u16; 4]> = quantized
            .chunks_exact(3)
            .map(|q| [q[0], q[1], q[2], 0])
            .collect();
        let normals = match normals {
            Some(n) => n.chunks_exact(2).map(|n| [n[0], n[1], 0, 0]).collect(),
            None => vec![[0; 4]; positions.len()],
        };
        Self {
            positions,
            normals,
            indices,
            edge_indices,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn upload(&self, backend: &mut dyn GpuBackend) -> Result<GeometryBuffers> {
        let positions =
            backend.allocate_buffer(BufferKind::Positions, bytemuck::cast_slice(&self.positions))?;
        let normals =
            backend.allocate_buffer(BufferKind::Normals, bytemuck::cast_slice(&self.normals))?;
        let indices =
            backend.allocate_buffer(BufferKind::Indices, bytemuck::cast_slice(&self.indices))?;
        let edge_indices = if self.edge_indices.is_empty() {
            None
        } else {
            Some(backend.allocate_buffer(
                BufferKind::EdgeIndices,
                bytemuck::cast_slice(&self.edge_indices),
            )?)
        };
        Ok(GeometryBuffers {
            positions,
            normals,
            indices,
            edge_indices,
        })
    }

    /// Vertex `index` decoded into the space of `decode_matrix`.
    pub fn decoded_vertex(&self, index: u32, decode_matrix: &Matrix4<f64>) -> Point3<f64> {
        let q = self.positions[index as usize];
        let v = decode_matrix * Vector4::new(q[0] as f64, q[1] as f64, q[2] as f64, 1.0);
        Point3::new(v.x, v.y, v.z)
    }

    /// Nearest triangle hit among `indices[range]`, with vertices decoded through
    /// `to_model`. `ray` is in the same space.
    pub fn intersect_triangles(
        &self,
        range: std::ops::Range<usize>,
        to_model: &Matrix4<f64>,
        ray: &Ray,
    ) -> Option<RayHit> {
        let mut best: Option<RayHit> = None;
        let first_triangle = range.start / 3;
        for (k, tri) in self.indices[range].chunks_exact(3).enumerate() {
            let a = self.decoded_vertex(tri[0], to_model);
            let b = self.decoded_vertex(tri[1], to_model);
            let c = self.decoded_vertex(tri[2], to_model);
            let Some((t, _, _)) = ray.intersect_triangle(a, b, c) else {
                continue;
            };
            if best.is_some_and(|hit| hit.distance <= t) {
                continue;
            }
            let normal = (b - a).cross(c - a);
            let normal = if normal.magnitude2() > 0.0 {
                normal.normalize()
            } else {
                normal
            };
            best = Some(RayHit {
                distance: t,
                primitive_index: (first_triangle + k) as u32,
                position: ray.point_at(t),
                normal,
            });
        }
        best
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryBuffers {
    pub positions: BufferHandle,
    pub normals: BufferHandle,
    pub indices: BufferHandle,
    pub edge_indices: Option<BufferHandle>,
}

impl GeometryBuffers {
    pub fn free(&self, backend: &mut dyn GpuBackend) {
        backend.free_buffer(self.positions);
        backend.free_buffer(self.normals);
        backend.free_buffer(self.indices);
        if let Some(edges) = self.edge_indices {
            backend.free_buffer(edges);
        }
    }
}

/// Buffers holding the portion store channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBuffers {
    pub colors: BufferHandle,
    pub pick_colors: BufferHandle,
    pub flags: BufferHandle,
    pub offsets: BufferHandle,
}

impl ChannelBuffers {
    pub fn upload(
        backend: &mut dyn GpuBackend,
        colors: &[[u8; 4]],
        pick_colors: &[[u8; 4]],
        flags: &[u32],
        offsets: &[[f32; 3]],
    ) -> Result<Self> {
        Ok(Self {
            colors: backend.allocate_buffer(BufferKind::Colors, bytemuck::cast_slice(colors))?,
            pick_colors: backend
                .allocate_buffer(BufferKind::PickColors, bytemuck::cast_slice(pick_colors))?,
            flags: backend.allocate_buffer(BufferKind::Flags, bytemuck::cast_slice(flags))?,
            offsets: backend.allocate_buffer(BufferKind::Offsets, bytemuck::cast_slice(offsets))?,
        })
    }

    pub fn free(&self, backend: &mut dyn GpuBackend) {
        backend.free_buffer(self.colors);
        backend.free_buffer(self.pick_colors);
        backend.free_buffer(self.flags);
        backend.free_buffer(self.offsets);
    }
}

/// Common contract of batching and instancing layers.
pub trait Layer {
    fn kind(&self) -> LayerKind;

    fn primitive(&self) -> Primitive;

    /// Relative-to-center origin in model space.
    fn origin(&self) -> Vector3<f64>;

    fn portions(&self) -> &PortionStore;

    fn portions_mut(&mut self) -> &mut PortionStore;

    /// Model-space bounds of everything in the layer, offsets excluded.
    fn aabb(&self) -> Aabb;

    fn portion_aabb(&self, portion: u32) -> Option<Aabb>;

    fn is_finalized(&self) -> bool;

    fn is_destroyed(&self) -> bool;

    /// `false` when the layer is finalized or the portion would exceed its capacity.
    fn can_create_portion(&self, vertex_count: usize, index_count: usize) -> bool;

    /// Uploads all CPU data and closes the layer to new portions.
    fn finalize(&mut self, backend: &mut dyn GpuBackend) -> Result<()>;

    /// Writes pending portion state with one sub-range update per dirty channel.
    fn flush(&mut self, backend: &mut dyn GpuBackend) -> Result<()>;

    /// The draw call for `pass`, `None` when nothing is uploaded or the pass has no
    /// elements in this layer.
    fn draw_call(&self, pass: DrawPass, ctx: &LayerDrawContext) -> Option<DrawCall>;

    /// Frees every GPU buffer exactly once.
    fn destroy(&mut self, backend: &mut dyn GpuBackend);

    fn invalidate(&mut self);

    fn rebuild(&mut self, backend: &mut dyn GpuBackend) -> Result<()>;

    fn has_retained_geometry(&self) -> bool;

    /// Nearest triangle of `portion` hit by a model-space ray. Needs retained geometry.
    fn intersect_ray(&self, portion: u32, ray: &Ray) -> Option<RayHit>;

    /// `(vertices, primitives)` held by the layer.
    fn geometry_counts(&self) -> (usize, usize);

    /// Issues this layer's draw for `pass`, or nothing when its counters show no
    /// portion taking part. Returns the number of draw calls issued.
    fn draw(
        &self,
        pass: DrawPass,
        ctx: &LayerDrawContext,
        backend: &mut dyn GpuBackend,
    ) -> Result<u32> {
        if self.is_destroyed() || !pass.is_needed(self.portions().counters()) {
            return Ok(0);
        }
        match self.draw_call(pass, ctx) {
            Some(call) => {
                backend.draw(&call)?;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn set_visible(&mut self, portion: u32, visible: bool) {
        self.portions_mut().set_flag(portion, PortionFlags::VISIBLE, visible);
    }

    fn set_highlighted(&mut self, portion: u32, highlighted: bool) {
        self.portions_mut()
            .set_flag(portion, PortionFlags::HIGHLIGHTED, highlighted);
    }

    fn set_xrayed(&mut self, portion: u32, xrayed: bool) {
        self.portions_mut().set_flag(portion, PortionFlags::XRAYED, xrayed);
    }

    fn set_selected(&mut self, portion: u32, selected: bool) {
        self.portions_mut().set_flag(portion, PortionFlags::SELECTED, selected);
    }

    fn set_edges(&mut self, portion: u32, edges: bool) {
        self.portions_mut().set_flag(portion, PortionFlags::EDGES, edges);
    }

    fn set_clippable(&mut self, portion: u32, clippable: bool) {
        self.portions_mut()
            .set_flag(portion, PortionFlags::CLIPPABLE, clippable);
    }

    fn set_culled(&mut self, portion: u32, culled: bool) {
        self.portions_mut().set_flag(portion, PortionFlags::CULLED, culled);
    }

    fn set_collidable(&mut self, portion: u32, collidable: bool) {
        self.portions_mut()
            .set_flag(portion, PortionFlags::COLLIDABLE, collidable);
    }

    fn set_pickable(&mut self, portion: u32, pickable: bool) {
        self.portions_mut().set_flag(portion, PortionFlags::PICKABLE, pickable);
    }

    fn set_transparent(&mut self, portion: u32, transparent: bool) {
        self.portions_mut()
            .set_flag(portion, PortionFlags::TRANSPARENT, transparent);
    }

    fn set_color(&mut self, portion: u32, color: [u8; 4]) {
        self.portions_mut().set_color(portion, color);
    }

    fn set_offset(&mut self, portion: u32, offset: Vector3<f64>) {
        self.portions_mut()
            .set_offset(portion, [offset.x as f32, offset.y as f32, offset.z as f32]);
    }
}

/// A layer as stored by a scene model.
pub enum ModelLayer {
    Batching(batching::BatchingLayer),
    Instancing(instancing::InstancingLayer),
}

impl ModelLayer {
    pub fn layer(&self) -> &dyn Layer {
        match self {
            ModelLayer::Batching(layer) => layer,
            ModelLayer::Instancing(layer) => layer,
        }
    }

    pub fn layer_mut(&mut self) -> &mut dyn Layer {
        match self {
            ModelLayer::Batching(layer) => layer,
            ModelLayer::Instancing(layer) => layer,
        }
    }
}

/// Ray in model space, for a ray in world space and the model's world matrix.
pub(crate) fn ray_to_model(ray: &Ray, model_matrix: &Matrix4<f64>) -> Option<Ray> {
    use cgmath::SquareMatrix;
    let inverse = model_matrix.invert()?;
    Some(ray.transform(&inverse))
}

/// World point for a model-space point.
pub(crate) fn point_to_world(point: Point3<f64>, model_matrix: &Matrix4<f64>) -> Point3<f64> {
    Point3::from_homogeneous(model_matrix * point.to_vec().extend(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clipping_disables_culling() {
        assert!(cull_backfaces(Primitive::Solid, BackfacePolicy::Infer, false));
        assert!(!cull_backfaces(Primitive::Solid, BackfacePolicy::Infer, true));
        assert!(!cull_backfaces(Primitive::Surface, BackfacePolicy::Infer, false));
    }

    #[test]
    fn policy_overrides_inference() {
        assert!(cull_backfaces(Primitive::Surface, BackfacePolicy::AlwaysCull, false));
        assert!(!cull_backfaces(Primitive::Solid, BackfacePolicy::AlwaysShow, false));
        assert!(!cull_backfaces(Primitive::Lines, BackfacePolicy::AlwaysCull, false));
    }

    #[test]
    fn packed_arrays_pad_positions() {
        let packed = PackedArrays::from_parts(&[1, 2, 3, 4, 5, 6], None, vec![0, 1, 0], vec![]);
        assert_eq!(packed.positions, vec![[1, 2, 3, 0], [4, 5, 6, 0]]);
        assert_eq!(packed.normals, vec![[0; 4]; 2]);
    }
}
