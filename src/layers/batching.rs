//! Geometry batching: many meshes concatenated into one set of vertex buffers.
//!
//! Mesh transforms are baked into positions before they get here, and positions are
//! stored relative to the layer origin. At finalize they are quantized to 16 bits
//! against the layer's bounds (or kept verbatim when the layer was opened for
//! pre-quantized input with a fixed decode matrix) and uploaded in one go.
//!
//! Portion state is per portion on the CPU but per vertex on the GPU, so a dirty
//! portion range is expanded to the vertex range it covers when flushed.

use std::ops::Range;

use cgmath::{Matrix4, SquareMatrix, Vector3};

use crate::{
    context::{DrawCall, GpuBackend, LayerKind, VertexBuffers},
    data_structures::{
        aabb::Aabb,
        flags::PortionFlags,
        geometry::{Primitive, quantize_positions},
        portion::PortionStore,
        ray::Ray,
    },
    error::{Result, SceneError},
    layers::{
        ChannelBuffers, GeometryBuffers, Layer, LayerDrawContext, PackedArrays, RayHit,
        cull_backfaces, topology_of,
    },
    pipelines::DrawPass,
};

/// Vertex positions of one portion, already transformed and relative to the origin.
#[derive(Debug, Clone)]
pub enum BatchPositions {
    Float(Vec<f64>),
    /// Quantized against the layer's fixed decode matrix.
    Quantized(Vec<u16>),
}

impl BatchPositions {
    fn vertex_count(&self) -> usize {
        match self {
            BatchPositions::Float(p) => p.len() / 3,
            BatchPositions::Quantized(q) => q.len() / 3,
        }
    }
}

/// One mesh worth of data for [`BatchingLayer::create_portion`].
#[derive(Debug, Clone)]
pub struct BatchPortionInput {
    pub positions: BatchPositions,
    /// Oct-encoded, two per vertex.
    pub normals: Option<Vec<i8>>,
    pub indices: Vec<u32>,
    pub edge_indices: Vec<u32>,
    pub color: [u8; 4],
    pub pick_color: [u8; 4],
    pub flags: PortionFlags,
    /// Model-space bounds of the portion.
    pub aabb: Aabb,
}

#[derive(Debug, Clone)]
struct PortionRange {
    vertices: Range<u32>,
    indices: Range<u32>,
    aabb: Aabb,
}

/// CPU side arrays while the layer is still open.
#[derive(Debug, Default)]
struct BuildArrays {
    positions: Vec<f64>,
    quantized: Vec<u16>,
    normals: Vec<i8>,
    indices: Vec<u32>,
    edge_indices: Vec<u32>,
}

pub struct BatchingLayer {
    primitive: Primitive,
    origin: Vector3<f64>,
    /// Decode matrix of verbatim quantized input, fixed when the layer opens.
    fixed_decode: Option<Matrix4<f64>>,
    decode_matrix: Matrix4<f64>,
    max_vertices: usize,
    build: Option<BuildArrays>,
    retained: Option<PackedArrays>,
    retain: bool,
    portions: Vec<PortionRange>,
    store: PortionStore,
    aabb: Aabb,
    num_vertices: usize,
    num_indices: usize,
    num_edge_indices: usize,
    geometry_buffers: Option<GeometryBuffers>,
    channel_buffers: Option<ChannelBuffers>,
    finalized: bool,
    destroyed: bool,
}

impl BatchingLayer {
    pub fn new(
        primitive: Primitive,
        origin: Vector3<f64>,
        fixed_decode: Option<Matrix4<f64>>,
        max_vertices: usize,
        retain: bool,
    ) -> Self {
        log::debug!(
            "Opening batching layer for {primitive:?} at origin {:?}",
            (origin.x, origin.y, origin.z)
        );
        Self {
            primitive,
            origin,
            fixed_decode,
            decode_matrix: fixed_decode.unwrap_or_else(Matrix4::identity),
            max_vertices,
            build: Some(BuildArrays::default()),
            retained: None,
            retain,
            portions: Vec::new(),
            store: PortionStore::default(),
            aabb: Aabb::empty(),
            num_vertices: 0,
            num_indices: 0,
            num_edge_indices: 0,
            geometry_buffers: None,
            channel_buffers: None,
            finalized: false,
            destroyed: false,
        }
    }

    pub fn decode_matrix(&self) -> Matrix4<f64> {
        self.decode_matrix
    }

    pub fn max_vertices(&self) -> usize {
        self.max_vertices
    }

    pub fn num_vertices(&self) -> usize {
        self.num_vertices
    }

    /// Appends a portion and returns its offset.
    ///
    /// Callers check [`Layer::can_create_portion`] first; the checks here only guard
    /// the layer's own invariants.
    pub fn create_portion(&mut self, input: BatchPortionInput) -> Result<u32> {
        if self.finalized || self.destroyed {
            return Err(SceneError::LayerFinalized);
        }
        let vertex_count = input.positions.vertex_count();
        if self.num_vertices + vertex_count > self.max_vertices {
            return Err(SceneError::GeometryTooLarge {
                vertices: self.num_vertices + vertex_count,
                max: self.max_vertices,
            });
        }
        let Some(build) = self.build.as_mut() else {
            return Err(SceneError::LayerFinalized);
        };
        let base = self.num_vertices as u32;
        match input.positions {
            BatchPositions::Float(p) => build.positions.extend_from_slice(&p),
            BatchPositions::Quantized(q) => build.quantized.extend_from_slice(&q),
        }
        match input.normals {
            Some(n) => build.normals.extend_from_slice(&n),
            None => build
                .normals
                .extend(std::iter::repeat_n(0i8, vertex_count * 2)),
        }
        let index_start = build.indices.len() as u32;
        build.indices.extend(input.indices.iter().map(|i| i + base));
        build
            .edge_indices
            .extend(input.edge_indices.iter().map(|i| i + base));

        self.portions.push(PortionRange {
            vertices: base..base + vertex_count as u32,
            indices: index_start..build.indices.len() as u32,
            aabb: input.aabb,
        });
        self.num_vertices += vertex_count;
        self.num_indices = build.indices.len();
        self.num_edge_indices = build.edge_indices.len();
        self.aabb = self.aabb.merge(&input.aabb);
        Ok(self.store.push(input.flags, input.color, input.pick_color))
    }

    /// Repeats each portion's value once per vertex of that portion.
    fn per_vertex<T: Copy>(&self, values: &[T], portions: Range<usize>) -> Vec<T> {
        let mut out = Vec::new();
        for (range, value) in self.portions[portions.clone()].iter().zip(&values[portions]) {
            out.extend(std::iter::repeat_n(*value, range.vertices.len()));
        }
        out
    }

    fn flag_bits(&self) -> Vec<u32> {
        self.store.all_flags().iter().map(|f| f.bits()).collect()
    }

    fn upload(&mut self, packed: &PackedArrays, backend: &mut dyn GpuBackend) -> Result<()> {
        let all = 0..self.portions.len();
        let geometry = packed.upload(backend)?;
        let channels = ChannelBuffers::upload(
            backend,
            &self.per_vertex(self.store.all_colors(), all.clone()),
            &self.per_vertex(self.store.all_pick_colors(), all.clone()),
            &self.per_vertex(&self.flag_bits(), all.clone()),
            &self.per_vertex(self.store.all_offsets(), all),
        )?;
        self.geometry_buffers = Some(geometry);
        self.channel_buffers = Some(channels);
        self.store.clear_dirty();
        Ok(())
    }

    /// Vertex range covered by a range of portions.
    fn vertex_span(&self, portions: &Range<usize>) -> Range<u32> {
        let start = self.portions[portions.start].vertices.start;
        let end = self.portions[portions.end - 1].vertices.end;
        start..end
    }

    fn write_range<T: bytemuck::Pod>(
        &self,
        backend: &mut dyn GpuBackend,
        handle: crate::context::BufferHandle,
        values: &[T],
        portions: Range<usize>,
    ) -> Result<()> {
        let span = self.vertex_span(&portions);
        let data = self.per_vertex(values, portions);
        let offset = span.start as u64 * std::mem::size_of::<T>() as u64;
        backend.update_buffer_range(handle, offset, bytemuck::cast_slice(&data))?;
        Ok(())
    }
}

impl Layer for BatchingLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Batching
    }

    fn primitive(&self) -> Primitive {
        self.primitive
    }

    fn origin(&self) -> Vector3<f64> {
        self.origin
    }

    fn portions(&self) -> &PortionStore {
        &self.store
    }

    fn portions_mut(&mut self) -> &mut PortionStore {
        &mut self.store
    }

    fn aabb(&self) -> Aabb {
        self.aabb
    }

    fn portion_aabb(&self, portion: u32) -> Option<Aabb> {
        self.portions.get(portion as usize).map(|p| p.aabb)
    }

    fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn can_create_portion(&self, vertex_count: usize, _index_count: usize) -> bool {
        !self.finalized && !self.destroyed && self.num_vertices + vertex_count <= self.max_vertices
    }

    fn finalize(&mut self, backend: &mut dyn GpuBackend) -> Result<()> {
        if self.finalized {
            return Err(SceneError::LayerFinalized);
        }
        let build = self.build.take().unwrap_or_default();
        let packed = match self.fixed_decode {
            Some(decode) => {
                self.decode_matrix = decode;
                PackedArrays::from_parts(
                    &build.quantized,
                    Some(&build.normals),
                    build.indices,
                    build.edge_indices,
                )
            }
            None => {
                let bounds = Aabb::from_flat_positions(&build.positions);
                let (quantized, decode) = quantize_positions(&build.positions, &bounds);
                self.decode_matrix = decode;
                PackedArrays::from_parts(
                    &quantized,
                    Some(&build.normals),
                    build.indices,
                    build.edge_indices,
                )
            }
        };
        self.upload(&packed, backend)?;
        if self.retain {
            self.retained = Some(packed);
        }
        self.finalized = true;
        log::debug!(
            "Finalized batching layer: {} portions, {} vertices, {} indices",
            self.portions.len(),
            self.num_vertices,
            self.num_indices
        );
        Ok(())
    }

    fn flush(&mut self, backend: &mut dyn GpuBackend) -> Result<()> {
        let Some(channels) = self.channel_buffers else {
            return Ok(());
        };
        let mut dirty = self.store.take_dirty();
        if let Some(range) = dirty.flags.take() {
            self.write_range(backend, channels.flags, &self.flag_bits(), range)?;
        }
        if let Some(range) = dirty.colors.take() {
            self.write_range(backend, channels.colors, self.store.all_colors(), range)?;
        }
        if let Some(range) = dirty.offsets.take() {
            self.write_range(backend, channels.offsets, self.store.all_offsets(), range)?;
        }
        Ok(())
    }

    fn draw_call(&self, pass: DrawPass, ctx: &LayerDrawContext) -> Option<DrawCall> {
        let geometry = self.geometry_buffers?;
        let channels = self.channel_buffers?;
        let (topology, index_buffer, element_count) = if pass.uses_edges() {
            (
                crate::context::Topology::Lines,
                geometry.edge_indices?,
                self.num_edge_indices,
            )
        } else {
            (topology_of(self.primitive), geometry.indices, self.num_indices)
        };
        if element_count == 0 {
            return None;
        }
        let clipped = !ctx.section_planes.is_empty() && self.store.counters().clippable > 0;
        let planes = if clipped { ctx.section_planes } else { &[] };
        Some(DrawCall {
            pass,
            layer_kind: LayerKind::Batching,
            topology,
            vertex_buffers: VertexBuffers {
                positions: geometry.positions,
                normals: geometry.normals,
                colors: channels.colors,
                pick_colors: channels.pick_colors,
                flags: channels.flags,
                offsets: channels.offsets,
                instances: None,
            },
            index_buffer,
            element_count: element_count as u32,
            instance_count: 1,
            cull_backfaces: !pass.uses_edges()
                && cull_backfaces(self.primitive, ctx.backface_policy, clipped),
            // winding is flipped when mirrored transforms are baked
            mirrored: false,
            uniforms: crate::context::DrawUniforms::new(
                pass,
                &ctx.camera.view,
                &ctx.camera.projection,
                ctx.model_matrix,
                self.origin,
                &self.decode_matrix,
                planes,
                ctx.defaults.material_color(pass),
            ),
        })
    }

    fn destroy(&mut self, backend: &mut dyn GpuBackend) {
        if self.destroyed {
            return;
        }
        if let Some(geometry) = self.geometry_buffers.take() {
            geometry.free(backend);
        }
        if let Some(channels) = self.channel_buffers.take() {
            channels.free(backend);
        }
        self.build = None;
        self.retained = None;
        self.destroyed = true;
    }

    fn invalidate(&mut self) {
        self.geometry_buffers = None;
        self.channel_buffers = None;
    }

    fn rebuild(&mut self, backend: &mut dyn GpuBackend) -> Result<()> {
        if self.destroyed || !self.finalized {
            return Ok(());
        }
        let Some(packed) = self.retained.take() else {
            return Err(SceneError::GeometryNotRetained);
        };
        let uploaded = self.upload(&packed, backend);
        self.retained = Some(packed);
        uploaded
    }

    fn has_retained_geometry(&self) -> bool {
        self.retained.is_some()
    }

    fn intersect_ray(&self, portion: u32, ray: &Ray) -> Option<RayHit> {
        if !self.primitive.is_triangles() {
            return None;
        }
        let packed = self.retained.as_ref()?;
        let range = self.portions.get(portion as usize)?;
        let to_model = Matrix4::from_translation(self.origin) * self.decode_matrix;
        let mut hit = packed.intersect_triangles(
            range.indices.start as usize..range.indices.end as usize,
            &to_model,
            ray,
        )?;
        // primitive indices are reported per portion
        hit.primitive_index -= range.indices.start / 3;
        Some(hit)
    }

    fn geometry_counts(&self) -> (usize, usize) {
        let per_primitive = self.primitive.index_stride();
        (self.num_vertices, self.num_indices / per_primitive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle(offset: f64) -> BatchPortionInput {
        let positions = vec![offset, 0.0, 0.0, offset + 1.0, 0.0, 0.0, offset, 1.0, 0.0];
        BatchPortionInput {
            aabb: Aabb::from_flat_positions(&positions),
            positions: BatchPositions::Float(positions),
            normals: None,
            indices: vec![0, 1, 2],
            edge_indices: vec![0, 1, 1, 2, 2, 0],
            color: [255; 4],
            pick_color: [1, 0, 0, 1],
            flags: PortionFlags::INITIAL,
        }
    }

    #[test]
    fn capacity_is_checked_before_append() {
        let mut layer = BatchingLayer::new(Primitive::Surface, Vector3::new(0.0, 0.0, 0.0), None, 6, false);
        assert!(layer.can_create_portion(3, 3));
        layer.create_portion(triangle(0.0)).unwrap();
        layer.create_portion(triangle(2.0)).unwrap();
        assert!(!layer.can_create_portion(3, 3));
        assert!(matches!(
            layer.create_portion(triangle(4.0)),
            Err(SceneError::GeometryTooLarge { .. })
        ));
        assert_eq!(layer.num_vertices(), 6);
    }

    #[test]
    fn indices_are_rebased_per_portion() {
        let mut layer = BatchingLayer::new(Primitive::Surface, Vector3::new(0.0, 0.0, 0.0), None, 100, false);
        layer.create_portion(triangle(0.0)).unwrap();
        let second = layer.create_portion(triangle(2.0)).unwrap();
        assert_eq!(second, 1);
        let build = layer.build.as_ref().unwrap();
        assert_eq!(&build.indices[3..], &[3, 4, 5]);
        assert_eq!(layer.portions[1].vertices, 3..6);
    }

    #[test]
    fn layer_bounds_grow_with_portions() {
        let mut layer = BatchingLayer::new(Primitive::Surface, Vector3::new(0.0, 0.0, 0.0), None, 100, false);
        layer.create_portion(triangle(0.0)).unwrap();
        layer.create_portion(triangle(5.0)).unwrap();
        assert_eq!(layer.aabb().max.x, 6.0);
        assert_eq!(layer.aabb().min.x, 0.0);
    }
}
