//! Geometry instancing: one shared geometry drawn once per portion.
//!
//! Shared geometries are owned by the scene model's geometry table and reference
//! counted by the layers drawing them. The first layer to finalize uploads the
//! geometry, every later one reuses those buffers, and the last layer to be destroyed
//! frees them.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use cgmath::{Matrix4, Vector3};

use crate::{
    context::{BufferHandle, BufferKind, DrawCall, DrawUniforms, GpuBackend, LayerKind, Topology, VertexBuffers},
    data_structures::{
        aabb::Aabb,
        flags::PortionFlags,
        geometry::{Geometry, Positions, Primitive, oct_encode_normals, quantize_positions},
        instance::{InstanceRaw, is_mirrored},
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

/// A geometry registered with `create_geometry`, shared by reference count.
#[derive(Debug)]
pub struct SharedGeometry {
    pub id: String,
    pub index: u32,
    pub primitive: Primitive,
    pub decode_matrix: Matrix4<f64>,
    /// Local-space bounds.
    pub aabb: Aabb,
    vertex_count: usize,
    num_indices: usize,
    num_edge_indices: usize,
    arrays: RefCell<Option<PackedArrays>>,
    retain: bool,
    buffers: Cell<Option<GeometryBuffers>>,
    users: Cell<u32>,
}

impl SharedGeometry {
    /// Packs a validated geometry. Float positions are quantized against their own
    /// bounds, quantized ones are kept with their decode matrix.
    pub fn new(id: String, index: u32, geometry: Geometry, retain: bool) -> Self {
        let (quantized, decode_matrix, aabb) = match geometry.positions {
            Positions::Float(positions) => {
                let aabb = Aabb::from_flat_positions(&positions);
                let (quantized, decode) = quantize_positions(&positions, &aabb);
                (quantized, decode, aabb)
            }
            Positions::Compressed {
                values,
                decode_matrix,
            } => {
                let aabb = Aabb::from_flat_positions(
                    &crate::data_structures::geometry::decompress_positions(&values, &decode_matrix),
                );
                (values, decode_matrix, aabb)
            }
        };
        let normals = geometry.normals.as_deref().map(oct_encode_normals);
        let num_indices = geometry.indices.len();
        let num_edge_indices = geometry.edge_indices.len();
        let arrays = PackedArrays::from_parts(
            &quantized,
            normals.as_deref(),
            geometry.indices,
            geometry.edge_indices,
        );
        Self {
            id,
            index,
            primitive: geometry.primitive,
            decode_matrix,
            aabb,
            vertex_count: arrays.vertex_count(),
            num_indices,
            num_edge_indices,
            arrays: RefCell::new(Some(arrays)),
            retain,
            buffers: Cell::new(None),
            users: Cell::new(0),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    pub fn num_primitives(&self) -> usize {
        self.num_indices / self.primitive.index_stride()
    }

    /// Number of layers currently drawing this geometry.
    pub fn users(&self) -> u32 {
        self.users.get()
    }

    pub fn is_uploaded(&self) -> bool {
        self.buffers.get().is_some()
    }

    pub fn is_retained(&self) -> bool {
        self.arrays.borrow().is_some()
    }

    fn acquire(&self) {
        self.users.set(self.users.get() + 1);
    }

    /// Drops one user; the last one frees the GPU buffers.
    fn release(&self, backend: &mut dyn GpuBackend) {
        let users = self.users.get().saturating_sub(1);
        self.users.set(users);
        if users == 0 {
            if let Some(buffers) = self.buffers.take() {
                log::debug!("Freeing shared geometry {}", self.id);
                buffers.free(backend);
            }
        }
    }

    /// Uploads on first use and returns the shared buffers afterwards.
    fn ensure_uploaded(&self, backend: &mut dyn GpuBackend) -> Result<GeometryBuffers> {
        if let Some(buffers) = self.buffers.get() {
            return Ok(buffers);
        }
        let buffers = {
            let arrays = self.arrays.borrow();
            let Some(arrays) = arrays.as_ref() else {
                return Err(SceneError::GeometryNotRetained);
            };
            arrays.upload(backend)?
        };
        self.buffers.set(Some(buffers));
        if !self.retain {
            self.arrays.borrow_mut().take();
        }
        Ok(buffers)
    }

    fn invalidate(&self) {
        self.buffers.set(None);
    }

    fn intersect(&self, to_model: &Matrix4<f64>, ray: &Ray) -> Option<RayHit> {
        let arrays = self.arrays.borrow();
        arrays
            .as_ref()?
            .intersect_triangles(0..self.num_indices, to_model, ray)
    }
}

pub struct InstancingLayer {
    geometry: Rc<SharedGeometry>,
    origin: Vector3<f64>,
    max_instances: usize,
    /// Every instance has a negative determinant.
    mirrored: bool,
    /// Instance transforms relative to `origin`.
    matrices: Vec<Matrix4<f64>>,
    aabbs: Vec<Aabb>,
    store: PortionStore,
    aabb: Aabb,
    geometry_buffers: Option<GeometryBuffers>,
    instance_buffer: Option<BufferHandle>,
    channel_buffers: Option<ChannelBuffers>,
    finalized: bool,
    destroyed: bool,
}

impl InstancingLayer {
    /// Mirrored and unmirrored instances wind their triangles in opposite directions
    /// and live in separate layers.
    pub fn new(
        geometry: Rc<SharedGeometry>,
        origin: Vector3<f64>,
        max_instances: usize,
        mirrored: bool,
    ) -> Self {
        log::debug!(
            "Opening {}instancing layer for geometry {} at origin {:?}",
            if mirrored { "mirrored " } else { "" },
            geometry.id,
            (origin.x, origin.y, origin.z)
        );
        geometry.acquire();
        Self {
            geometry,
            origin,
            max_instances,
            mirrored,
            matrices: Vec::new(),
            aabbs: Vec::new(),
            store: PortionStore::default(),
            aabb: Aabb::empty(),
            geometry_buffers: None,
            instance_buffer: None,
            channel_buffers: None,
            finalized: false,
            destroyed: false,
        }
    }

    pub fn geometry(&self) -> &Rc<SharedGeometry> {
        &self.geometry
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    pub fn num_instances(&self) -> usize {
        self.matrices.len()
    }

    /// Appends an instance with model-space transform `matrix`.
    pub fn create_portion(
        &mut self,
        matrix: Matrix4<f64>,
        color: [u8; 4],
        pick_color: [u8; 4],
        flags: PortionFlags,
    ) -> Result<u32> {
        if self.finalized || self.destroyed {
            return Err(SceneError::LayerFinalized);
        }
        if is_mirrored(&matrix) != self.mirrored {
            return Err(SceneError::HandednessMismatch);
        }
        let aabb = self.geometry.aabb.transform(&matrix);
        self.matrices
            .push(Matrix4::from_translation(-self.origin) * matrix);
        self.aabbs.push(aabb);
        self.aabb = self.aabb.merge(&aabb);
        Ok(self.store.push(flags, color, pick_color))
    }

    fn instance_records(&self) -> Vec<InstanceRaw> {
        self.matrices.iter().map(InstanceRaw::from_matrix).collect()
    }

    fn upload(&mut self, backend: &mut dyn GpuBackend) -> Result<()> {
        let geometry = self.geometry.ensure_uploaded(backend)?;
        let instances = backend.allocate_buffer(
            BufferKind::Instances,
            bytemuck::cast_slice(&self.instance_records()),
        )?;
        let flags: Vec<u32> = self.store.all_flags().iter().map(|f| f.bits()).collect();
        let channels = ChannelBuffers::upload(
            backend,
            self.store.all_colors(),
            self.store.all_pick_colors(),
            &flags,
            self.store.all_offsets(),
        )?;
        self.geometry_buffers = Some(geometry);
        self.instance_buffer = Some(instances);
        self.channel_buffers = Some(channels);
        self.store.clear_dirty();
        Ok(())
    }

    fn write_range<T: bytemuck::Pod>(
        backend: &mut dyn GpuBackend,
        handle: BufferHandle,
        values: &[T],
        range: std::ops::Range<usize>,
    ) -> Result<()> {
        let offset = range.start as u64 * std::mem::size_of::<T>() as u64;
        backend.update_buffer_range(handle, offset, bytemuck::cast_slice(&values[range]))?;
        Ok(())
    }
}

impl Layer for InstancingLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Instancing
    }

    fn primitive(&self) -> Primitive {
        self.geometry.primitive
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
        self.aabbs.get(portion as usize).copied()
    }

    fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn can_create_portion(&self, _vertex_count: usize, _index_count: usize) -> bool {
        !self.finalized && !self.destroyed && self.matrices.len() < self.max_instances
    }

    fn finalize(&mut self, backend: &mut dyn GpuBackend) -> Result<()> {
        if self.finalized {
            return Err(SceneError::LayerFinalized);
        }
        self.upload(backend)?;
        self.finalized = true;
        log::debug!(
            "Finalized instancing layer for geometry {}: {} instances",
            self.geometry.id,
            self.matrices.len()
        );
        Ok(())
    }

    fn flush(&mut self, backend: &mut dyn GpuBackend) -> Result<()> {
        let Some(channels) = self.channel_buffers else {
            return Ok(());
        };
        let mut dirty = self.store.take_dirty();
        if let Some(range) = dirty.flags.take() {
            let flags: Vec<u32> = self.store.all_flags().iter().map(|f| f.bits()).collect();
            Self::write_range(backend, channels.flags, &flags, range)?;
        }
        if let Some(range) = dirty.colors.take() {
            Self::write_range(backend, channels.colors, self.store.all_colors(), range)?;
        }
        if let Some(range) = dirty.offsets.take() {
            Self::write_range(backend, channels.offsets, self.store.all_offsets(), range)?;
        }
        Ok(())
    }

    fn draw_call(&self, pass: DrawPass, ctx: &LayerDrawContext) -> Option<DrawCall> {
        let geometry = self.geometry_buffers?;
        let channels = self.channel_buffers?;
        let instances = self.instance_buffer?;
        let (topology, index_buffer, element_count) = if pass.uses_edges() {
            (
                Topology::Lines,
                geometry.edge_indices?,
                self.geometry.num_edge_indices,
            )
        } else {
            (
                topology_of(self.geometry.primitive),
                geometry.indices,
                self.geometry.num_indices,
            )
        };
        if element_count == 0 || self.matrices.is_empty() {
            return None;
        }
        let clipped = !ctx.section_planes.is_empty() && self.store.counters().clippable > 0;
        let planes = if clipped { ctx.section_planes } else { &[] };
        Some(DrawCall {
            pass,
            layer_kind: LayerKind::Instancing,
            topology,
            vertex_buffers: VertexBuffers {
                positions: geometry.positions,
                normals: geometry.normals,
                colors: channels.colors,
                pick_colors: channels.pick_colors,
                flags: channels.flags,
                offsets: channels.offsets,
                instances: Some(instances),
            },
            index_buffer,
            element_count: element_count as u32,
            instance_count: self.matrices.len() as u32,
            cull_backfaces: !pass.uses_edges()
                && cull_backfaces(self.geometry.primitive, ctx.backface_policy, clipped),
            mirrored: self.mirrored,
            uniforms: DrawUniforms::new(
                pass,
                &ctx.camera.view,
                &ctx.camera.projection,
                ctx.model_matrix,
                self.origin,
                &self.geometry.decode_matrix,
                planes,
                ctx.defaults.material_color(pass),
            ),
        })
    }

    fn destroy(&mut self, backend: &mut dyn GpuBackend) {
        if self.destroyed {
            return;
        }
        if let Some(instances) = self.instance_buffer.take() {
            backend.free_buffer(instances);
        }
        if let Some(channels) = self.channel_buffers.take() {
            channels.free(backend);
        }
        self.geometry_buffers = None;
        self.geometry.release(backend);
        self.destroyed = true;
    }

    fn invalidate(&mut self) {
        self.geometry.invalidate();
        self.geometry_buffers = None;
        self.instance_buffer = None;
        self.channel_buffers = None;
    }

    fn rebuild(&mut self, backend: &mut dyn GpuBackend) -> Result<()> {
        if self.destroyed || !self.finalized {
            return Ok(());
        }
        self.upload(backend)
    }

    fn has_retained_geometry(&self) -> bool {
        self.geometry.is_retained()
    }

    fn intersect_ray(&self, portion: u32, ray: &Ray) -> Option<RayHit> {
        if !self.geometry.primitive.is_triangles() {
            return None;
        }
        let relative = self.matrices.get(portion as usize)?;
        let to_model =
            Matrix4::from_translation(self.origin) * relative * self.geometry.decode_matrix;
        self.geometry.intersect(&to_model, ray)
    }

    fn geometry_counts(&self) -> (usize, usize) {
        let n = self.matrices.len();
        (
            self.geometry.vertex_count() * n,
            self.geometry.num_primitives() * n,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::geometry::GeometryData;

    fn shared() -> Rc<SharedGeometry> {
        let geometry = Geometry::build(
            GeometryData::triangles(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0], vec![0, 1, 2]),
            10.0,
            true,
        )
        .unwrap();
        Rc::new(SharedGeometry::new("tri".into(), 0, geometry, false))
    }

    #[test]
    fn layers_count_as_geometry_users() {
        let geometry = shared();
        let a = InstancingLayer::new(geometry.clone(), Vector3::new(0.0, 0.0, 0.0), 10, false);
        let _b = InstancingLayer::new(geometry.clone(), Vector3::new(1000.0, 0.0, 0.0), 10, false);
        assert_eq!(geometry.users(), 2);
        drop(a);
        // dropping without destroy keeps the count; only destroy releases
        assert_eq!(geometry.users(), 2);
    }

    #[test]
    fn instance_bounds_follow_transform() {
        let mut layer = InstancingLayer::new(shared(), Vector3::new(0.0, 0.0, 0.0), 10, false);
        let p = layer
            .create_portion(
                Matrix4::from_translation(Vector3::new(10.0, 0.0, 0.0)),
                [255; 4],
                [1, 0, 0, 1],
                PortionFlags::INITIAL,
            )
            .unwrap();
        let aabb = layer.portion_aabb(p).unwrap();
        assert_eq!(aabb.min.x, 10.0);
        assert_eq!(aabb.max.x, 11.0);
    }

    #[test]
    fn capacity_counts_instances() {
        let mut layer = InstancingLayer::new(shared(), Vector3::new(0.0, 0.0, 0.0), 1, false);
        assert!(layer.can_create_portion(3, 3));
        layer
            .create_portion(Matrix4::from_scale(1.0), [255; 4], [1, 0, 0, 1], PortionFlags::INITIAL)
            .unwrap();
        assert!(!layer.can_create_portion(3, 3));
    }

    #[test]
    fn mirrored_layers_only_take_mirrored_instances() {
        let mirror = Matrix4::from_nonuniform_scale(-1.0, 1.0, 1.0);
        let mut plain = InstancingLayer::new(shared(), Vector3::new(0.0, 0.0, 0.0), 4, false);
        assert!(matches!(
            plain.create_portion(mirror, [255; 4], [1, 0, 0, 1], PortionFlags::INITIAL),
            Err(SceneError::HandednessMismatch)
        ));

        let mut mirrored = InstancingLayer::new(shared(), Vector3::new(0.0, 0.0, 0.0), 4, true);
        assert!(mirrored.is_mirrored());
        mirrored
            .create_portion(mirror, [255; 4], [1, 0, 0, 1], PortionFlags::INITIAL)
            .unwrap();
        assert!(matches!(
            mirrored.create_portion(Matrix4::from_scale(1.0), [255; 4], [2, 0, 0, 1], PortionFlags::INITIAL),
            Err(SceneError::HandednessMismatch)
        ));
    }
}
