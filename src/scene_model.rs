//! The scene model: aggregate root of packed layers, meshes and entities.
//!
//! Building a model is a three stage affair:
//!
//! 1. [`SceneModel::create_geometry`] registers reusable geometry for instancing.
//! 2. [`SceneModel::create_mesh`] routes a mesh either to the instancing layer of its
//!    geometry or, for inline geometry, to the open batching layer matching its
//!    primitive, origin and decode matrix. A full or incompatible layer makes the
//!    model open a new one.
//! 3. [`SceneModel::create_entity`] binds meshes into named, independently
//!    controllable entities.
//!
//! [`SceneModel::finalize`] uploads every layer and closes the model to further
//! geometry. From then on only per-portion state changes, which is written back by
//! [`SceneModel::flush`] as sub-range buffer updates.

use std::{cell::Cell, rc::Rc};

use cgmath::{InnerSpace, Matrix4, SquareMatrix, Vector3};
use log::{debug, warn};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{
    config::{SceneDefaults, SceneModelConfig, auto_rtc_origin},
    context::{GpuBackend, LayerKind, ResourceManager},
    data_structures::{
        aabb::Aabb,
        flags::{LayerCounters, PortionFlags},
        geometry::{
            Geometry, GeometryData, Positions, Primitive, decompress_positions,
            oct_encode_normals, transform_positions,
        },
        instance::{MeshTransform, is_mirrored, normal_matrix},
        portion::PortionId,
    },
    entity::{EntityOps, PackedEntity, settable_flags, with_opacity},
    error::{Result, SceneError},
    layers::{
        Layer, ModelLayer,
        batching::{BatchPortionInput, BatchPositions, BatchingLayer},
        instancing::{InstancingLayer, SharedGeometry},
    },
    resources::pick::{MAX_PICK_INDEX, pick_color},
};

/// Where a mesh takes its geometry from.
#[derive(Debug, Clone)]
pub enum MeshGeometry {
    /// Own geometry, batched with other inline meshes.
    Inline(GeometryData),
    /// Id of a geometry registered with `create_geometry`, drawn instanced.
    Shared(String),
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub id: String,
    pub geometry: MeshGeometry,
    /// Explicit model-space matrix. Takes precedence over `transform`.
    pub matrix: Option<Matrix4<f64>>,
    pub transform: Option<MeshTransform>,
    /// Relative-to-center origin. Chosen automatically when absent.
    pub origin: Option<Vector3<f64>>,
    pub color: Option<[f32; 3]>,
    pub opacity: Option<f32>,
}

impl MeshConfig {
    pub fn batched(id: impl Into<String>, data: GeometryData) -> Self {
        Self::with_geometry(id, MeshGeometry::Inline(data))
    }

    pub fn instanced(id: impl Into<String>, geometry_id: impl Into<String>) -> Self {
        Self::with_geometry(id, MeshGeometry::Shared(geometry_id.into()))
    }

    fn with_geometry(id: impl Into<String>, geometry: MeshGeometry) -> Self {
        Self {
            id: id.into(),
            geometry,
            matrix: None,
            transform: None,
            origin: None,
            color: None,
            opacity: None,
        }
    }

    pub fn with_matrix(mut self, matrix: Matrix4<f64>) -> Self {
        self.matrix = Some(matrix);
        self
    }

    pub fn with_transform(mut self, transform: MeshTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_origin(mut self, origin: Vector3<f64>) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_color(mut self, color: [f32; 3]) -> Self {
        self.color = Some(color);
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = Some(opacity);
        self
    }

    fn matrix(&self) -> Matrix4<f64> {
        self.matrix
            .or_else(|| self.transform.map(|t| t.to_matrix()))
            .unwrap_or_else(Matrix4::identity)
    }
}

#[derive(Debug, Clone)]
pub struct EntityConfig {
    pub id: String,
    pub mesh_ids: Vec<String>,
    pub is_object: bool,
}

impl EntityConfig {
    pub fn new(id: impl Into<String>, mesh_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: id.into(),
            mesh_ids: mesh_ids.into_iter().map(Into::into).collect(),
            is_object: true,
        }
    }

    pub fn not_object(mut self) -> Self {
        self.is_object = false;
        self
    }
}

/// Entity totals of one model, summed by the scene for its object views.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityCounters {
    pub objects: u32,
    pub visible: u32,
    pub xrayed: u32,
    pub highlighted: u32,
    pub selected: u32,
    pub colorized: u32,
    pub culled: u32,
    pub pickable: u32,
}

impl EntityCounters {
    pub(crate) fn add(&mut self, flags: PortionFlags, colorized: bool) {
        self.objects += 1;
        self.visible += flags.contains(PortionFlags::VISIBLE) as u32;
        self.xrayed += flags.contains(PortionFlags::XRAYED) as u32;
        self.highlighted += flags.contains(PortionFlags::HIGHLIGHTED) as u32;
        self.selected += flags.contains(PortionFlags::SELECTED) as u32;
        self.colorized += colorized as u32;
        self.culled += flags.contains(PortionFlags::CULLED) as u32;
        self.pickable += flags.contains(PortionFlags::PICKABLE) as u32;
    }

    fn remove(&mut self, flags: PortionFlags, colorized: bool) {
        let dec = |counter: &mut u32, on: bool| *counter = counter.saturating_sub(on as u32);
        dec(&mut self.objects, true);
        dec(&mut self.visible, flags.contains(PortionFlags::VISIBLE));
        dec(&mut self.xrayed, flags.contains(PortionFlags::XRAYED));
        dec(&mut self.highlighted, flags.contains(PortionFlags::HIGHLIGHTED));
        dec(&mut self.selected, flags.contains(PortionFlags::SELECTED));
        dec(&mut self.colorized, colorized);
        dec(&mut self.culled, flags.contains(PortionFlags::CULLED));
        dec(&mut self.pickable, flags.contains(PortionFlags::PICKABLE));
    }
}

impl std::ops::AddAssign for EntityCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.objects += rhs.objects;
        self.visible += rhs.visible;
        self.xrayed += rhs.xrayed;
        self.highlighted += rhs.highlighted;
        self.selected += rhs.selected;
        self.colorized += rhs.colorized;
        self.culled += rhs.culled;
        self.pickable += rhs.pickable;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SceneModelStats {
    pub layers: usize,
    pub batching_layers: usize,
    pub instancing_layers: usize,
    pub geometries: usize,
    pub meshes: usize,
    pub entities: usize,
    pub vertices: usize,
    pub triangles: usize,
    pub lines: usize,
    pub points: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct MeshRecord {
    pub id: String,
    pub portion: PortionId,
    pub entity: Option<u32>,
    /// Color the mesh was created with.
    pub color: [u8; 4],
    /// Set once the owning entity is destroyed.
    pub retired: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct EntityRecord {
    pub id: String,
    pub is_object: bool,
    pub meshes: SmallVec<[u32; 1]>,
    pub flags: PortionFlags,
    pub colorize: Option<[f32; 3]>,
    pub opacity: f32,
    pub offset: Vector3<f64>,
    aabb: Cell<Option<Aabb>>,
}

/// Key of an open batching layer. Float bits make origins and decode matrices
/// hashable; they only ever compare equal when copied from the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BatchKey {
    primitive: Primitive,
    origin: [u64; 3],
    decode: Option<[u64; 16]>,
}

fn vector_bits(v: Vector3<f64>) -> [u64; 3] {
    [v.x.to_bits(), v.y.to_bits(), v.z.to_bits()]
}

fn matrix_bits(m: &Matrix4<f64>) -> [u64; 16] {
    let cols: [[f64; 4]; 4] = (*m).into();
    let mut bits = [0; 16];
    for (slot, value) in bits.iter_mut().zip(cols.iter().flatten()) {
        *slot = value.to_bits();
    }
    bits
}

fn to_rgba8(rgb: [f32; 3], opacity: f32) -> [u8; 4] {
    let c = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    [c(rgb[0]), c(rgb[1]), c(rgb[2]), c(opacity)]
}

fn transform_normals(normals: &[f32], matrix: &Matrix4<f64>) -> Vec<f32> {
    let normal_matrix = normal_matrix(matrix);
    normals
        .chunks_exact(3)
        .flat_map(|n| {
            let v = normal_matrix * Vector3::new(n[0] as f64, n[1] as f64, n[2] as f64);
            let v = if v.magnitude2() > 0.0 { v.normalize() } else { v };
            [v.x as f32, v.y as f32, v.z as f32]
        })
        .collect()
}

/// Mean of per-vertex RGBA colors, used as the portion color of meshes without one.
fn average_color(colors: &[u8]) -> Option<[f32; 3]> {
    let n = colors.len() / 4;
    if n == 0 {
        return None;
    }
    let mut sum = [0.0f64; 3];
    for rgba in colors.chunks_exact(4) {
        for (s, c) in sum.iter_mut().zip(rgba) {
            *s += *c as f64;
        }
    }
    Some(sum.map(|s| (s / n as f64 / 255.0) as f32))
}

pub struct SceneModel {
    config: SceneModelConfig,
    matrix: Matrix4<f64>,
    base_color: [f32; 3],
    base_opacity: f32,
    layers: Vec<ModelLayer>,
    open_batches: FxHashMap<BatchKey, usize>,
    open_instances: FxHashMap<(u32, [u64; 3], bool), usize>,
    geometries: Vec<Rc<SharedGeometry>>,
    geometry_ids: FxHashMap<String, u32>,
    inline_geometries: usize,
    meshes: Vec<MeshRecord>,
    mesh_ids: FxHashMap<String, u32>,
    entities: Vec<Option<EntityRecord>>,
    entity_ids: FxHashMap<String, u32>,
    entity_counters: EntityCounters,
    model_flags: PortionFlags,
    model_colorize: Option<[f32; 3]>,
    model_opacity: f32,
    model_offset: Vector3<f64>,
    aabb: Cell<Option<Aabb>>,
    finalized: bool,
    destroyed: bool,
}

impl SceneModel {
    pub fn new(config: SceneModelConfig, defaults: &SceneDefaults) -> Self {
        debug!("Creating scene model {}", config.id);
        Self {
            matrix: config.matrix(),
            config,
            base_color: defaults.color,
            base_opacity: defaults.opacity,
            layers: Vec::new(),
            open_batches: FxHashMap::default(),
            open_instances: FxHashMap::default(),
            geometries: Vec::new(),
            geometry_ids: FxHashMap::default(),
            inline_geometries: 0,
            meshes: Vec::new(),
            mesh_ids: FxHashMap::default(),
            entities: Vec::new(),
            entity_ids: FxHashMap::default(),
            entity_counters: EntityCounters::default(),
            model_flags: PortionFlags::INITIAL,
            model_colorize: None,
            model_opacity: 1.0,
            model_offset: Vector3::new(0.0, 0.0, 0.0),
            aabb: Cell::new(None),
            finalized: false,
            destroyed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &SceneModelConfig {
        &self.config
    }

    /// Static world matrix of the model.
    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    pub fn pick_slot(&self) -> u8 {
        self.config.pick_slot
    }

    pub(crate) fn set_pick_slot(&mut self, slot: u8) {
        self.config.pick_slot = slot;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn layers(&self) -> &[ModelLayer] {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [ModelLayer] {
        &mut self.layers
    }

    fn check_open(&self) -> Result<()> {
        if self.destroyed {
            return Err(SceneError::Destroyed);
        }
        if self.finalized {
            return Err(SceneError::Finalized);
        }
        Ok(())
    }

    /// Registers a geometry that meshes can instance by id.
    pub fn create_geometry(&mut self, id: impl Into<String>, data: GeometryData) -> Result<()> {
        self.check_open()?;
        let id = id.into();
        if self.geometry_ids.contains_key(&id) {
            return Err(SceneError::DuplicateId {
                kind: "geometry",
                id,
            });
        }
        let geometry = Geometry::build(data, self.config.edge_threshold_degrees, true)?;
        let index = self.geometries.len() as u32;
        self.geometries.push(Rc::new(SharedGeometry::new(
            id.clone(),
            index,
            geometry,
            self.config.retains_geometry(),
        )));
        self.geometry_ids.insert(id, index);
        Ok(())
    }

    pub fn geometry(&self, id: &str) -> Option<&Rc<SharedGeometry>> {
        let index = *self.geometry_ids.get(id)?;
        self.geometries.get(index as usize)
    }

    pub fn create_mesh(&mut self, cfg: MeshConfig) -> Result<PortionId> {
        self.check_open()?;
        if self.mesh_ids.contains_key(&cfg.id) {
            return Err(SceneError::DuplicateId {
                kind: "mesh",
                id: cfg.id,
            });
        }
        let pick_index = self.meshes.len() as u32 + 1;
        if pick_index > MAX_PICK_INDEX {
            warn!("Mesh {} exceeds the pick id range and cannot be picked on the GPU", cfg.id);
        }
        let pick = pick_color(pick_index, self.config.pick_slot);
        let matrix = cfg.matrix();
        let opacity = cfg.opacity.unwrap_or(self.base_opacity);

        let (portion, color) = match cfg.geometry {
            MeshGeometry::Inline(data) => {
                let geometry = Geometry::build(data, self.config.edge_threshold_degrees, true)?;
                let vertices = geometry.vertex_count();
                if vertices > self.config.max_batch_vertices {
                    return Err(SceneError::GeometryTooLarge {
                        vertices,
                        max: self.config.max_batch_vertices,
                    });
                }
                let rgb = cfg
                    .color
                    .or_else(|| geometry.colors.as_deref().and_then(average_color))
                    .unwrap_or(self.base_color);
                let color = to_rgba8(rgb, opacity);
                let portion = self.create_batched_portion(geometry, &matrix, cfg.origin, color, pick)?;
                self.inline_geometries += 1;
                (portion, color)
            }
            MeshGeometry::Shared(geometry_id) => {
                let index = *self
                    .geometry_ids
                    .get(&geometry_id)
                    .ok_or(SceneError::UnknownGeometry(geometry_id))?;
                let color = to_rgba8(cfg.color.unwrap_or(self.base_color), opacity);
                let portion = self.create_instanced_portion(index, matrix, cfg.origin, color, pick)?;
                (portion, color)
            }
        };

        self.mesh_ids.insert(cfg.id.clone(), self.meshes.len() as u32);
        self.meshes.push(MeshRecord {
            id: cfg.id,
            portion,
            entity: None,
            color,
            retired: false,
        });
        self.aabb.set(None);
        Ok(portion)
    }

    fn create_batched_portion(
        &mut self,
        geometry: Geometry,
        matrix: &Matrix4<f64>,
        origin: Option<Vector3<f64>>,
        color: [u8; 4],
        pick: [u8; 4],
    ) -> Result<PortionId> {
        let primitive = geometry.primitive;
        let vertices = geometry.vertex_count();
        let index_count = geometry.indices.len();
        let mut indices = geometry.indices;

        let (key, origin, fixed_decode, positions, normals, aabb) = match geometry.positions {
            Positions::Compressed {
                values,
                decode_matrix,
            } if *matrix == Matrix4::identity() && origin.is_none() => {
                let aabb = Aabb::from_flat_positions(&decompress_positions(&values, &decode_matrix));
                let origin = Vector3::new(0.0, 0.0, 0.0);
                let key = BatchKey {
                    primitive,
                    origin: vector_bits(origin),
                    decode: Some(matrix_bits(&decode_matrix)),
                };
                let normals = geometry.normals.as_deref().map(oct_encode_normals);
                (key, origin, Some(decode_matrix), BatchPositions::Quantized(values), normals, aabb)
            }
            positions => {
                let mut positions = positions.to_f64();
                transform_positions(&mut positions, matrix);
                let normals = geometry
                    .normals
                    .as_deref()
                    .map(|n| oct_encode_normals(&transform_normals(n, matrix)));
                if primitive.is_triangles() && is_mirrored(matrix) {
                    for tri in indices.chunks_exact_mut(3) {
                        tri.swap(1, 2);
                    }
                }
                let aabb = Aabb::from_flat_positions(&positions);
                let origin = origin
                    .or_else(|| {
                        let c = aabb.center();
                        auto_rtc_origin(Vector3::new(c.x, c.y, c.z), self.config.auto_rtc_cell_size)
                    })
                    .unwrap_or(Vector3::new(0.0, 0.0, 0.0));
                for p in positions.chunks_exact_mut(3) {
                    p[0] -= origin.x;
                    p[1] -= origin.y;
                    p[2] -= origin.z;
                }
                let key = BatchKey {
                    primitive,
                    origin: vector_bits(origin),
                    decode: None,
                };
                (key, origin, None, BatchPositions::Float(positions), normals, aabb)
            }
        };

        let open = self.open_batches.get(&key).copied();
        let layer_index = match open {
            Some(i) if self.layers[i].layer().can_create_portion(vertices, index_count) => i,
            open => {
                if open.is_some() {
                    debug!("Batching layer for {primitive:?} is full, opening another");
                }
                let i = self.layers.len();
                self.layers.push(ModelLayer::Batching(BatchingLayer::new(
                    primitive,
                    origin,
                    fixed_decode,
                    self.config.max_batch_vertices,
                    self.config.retains_geometry(),
                )));
                self.open_batches.insert(key, i);
                i
            }
        };
        let ModelLayer::Batching(layer) = &mut self.layers[layer_index] else {
            return Err(SceneError::LayerFinalized);
        };
        let offset = layer.create_portion(BatchPortionInput {
            positions,
            normals,
            indices,
            edge_indices: geometry.edge_indices,
            color,
            pick_color: pick,
            flags: PortionFlags::INITIAL,
            aabb,
        })?;
        Ok(PortionId {
            layer_index: layer_index as u32,
            offset,
        })
    }

    fn create_instanced_portion(
        &mut self,
        geometry_index: u32,
        matrix: Matrix4<f64>,
        origin: Option<Vector3<f64>>,
        color: [u8; 4],
        pick: [u8; 4],
    ) -> Result<PortionId> {
        let geometry = self.geometries[geometry_index as usize].clone();
        let origin = origin
            .or_else(|| {
                let c = geometry.aabb.transform(&matrix).center();
                auto_rtc_origin(Vector3::new(c.x, c.y, c.z), self.config.auto_rtc_cell_size)
            })
            .unwrap_or(Vector3::new(0.0, 0.0, 0.0));
        let mirrored = is_mirrored(&matrix);
        let key = (geometry_index, vector_bits(origin), mirrored);
        let open = self.open_instances.get(&key).copied();
        let layer_index = match open {
            Some(i) if self.layers[i].layer().can_create_portion(0, 0) => i,
            open => {
                if open.is_some() {
                    debug!("Instancing layer for geometry {} is full, opening another", geometry.id);
                }
                let i = self.layers.len();
                self.layers.push(ModelLayer::Instancing(InstancingLayer::new(
                    geometry,
                    origin,
                    self.config.max_instances_per_layer,
                    mirrored,
                )));
                self.open_instances.insert(key, i);
                i
            }
        };
        let ModelLayer::Instancing(layer) = &mut self.layers[layer_index] else {
            return Err(SceneError::LayerFinalized);
        };
        let offset = layer.create_portion(matrix, color, pick, PortionFlags::INITIAL)?;
        Ok(PortionId {
            layer_index: layer_index as u32,
            offset,
        })
    }

    pub fn create_entity(&mut self, cfg: EntityConfig) -> Result<()> {
        self.check_open()?;
        if self.entity_ids.contains_key(&cfg.id) {
            return Err(SceneError::DuplicateId {
                kind: "entity",
                id: cfg.id,
            });
        }
        let mut meshes: SmallVec<[u32; 1]> = SmallVec::new();
        for mesh_id in &cfg.mesh_ids {
            let index = *self
                .mesh_ids
                .get(mesh_id)
                .ok_or_else(|| SceneError::UnknownMesh(mesh_id.clone()))?;
            if let Some(owner) = self.meshes[index as usize].entity {
                let owner = self
                    .entity_record(owner)
                    .map_or_else(String::new, |r| r.id.clone());
                return Err(SceneError::MeshAlreadyOwned {
                    mesh: mesh_id.clone(),
                    owner,
                });
            }
            if meshes.contains(&index) {
                return Err(SceneError::MeshAlreadyOwned {
                    mesh: mesh_id.clone(),
                    owner: cfg.id.clone(),
                });
            }
            meshes.push(index);
        }

        let entity_index = self.entities.len() as u32;
        for &m in &meshes {
            self.meshes[m as usize].entity = Some(entity_index);
        }
        let opacity = meshes
            .first()
            .map_or(1.0, |&m| self.meshes[m as usize].color[3] as f32 / 255.0);
        let flags = PortionFlags::INITIAL;
        if cfg.is_object {
            self.entity_counters.add(flags, false);
        }
        self.entity_ids.insert(cfg.id.clone(), entity_index);
        self.entities.push(Some(EntityRecord {
            id: cfg.id,
            is_object: cfg.is_object,
            meshes,
            flags,
            colorize: None,
            opacity,
            offset: Vector3::new(0.0, 0.0, 0.0),
            aabb: Cell::new(None),
        }));
        Ok(())
    }

    /// Uploads every layer and closes the model to new geometry, meshes and entities.
    pub fn finalize(&mut self, backend: &mut dyn GpuBackend) -> Result<()> {
        self.check_open()?;
        for layer in self.layers.iter_mut() {
            layer.layer_mut().finalize(backend)?;
        }
        self.open_batches.clear();
        self.open_instances.clear();
        self.finalized = true;
        log::info!(
            "Finalized scene model {}: {} layers, {} meshes, {} entities",
            self.config.id,
            self.layers.len(),
            self.meshes.len(),
            self.entity_ids.len()
        );
        Ok(())
    }

    /// Writes state changed since the last flush to the GPU.
    pub fn flush(&mut self, backend: &mut dyn GpuBackend) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        for layer in self.layers.iter_mut() {
            let layer = layer.layer_mut();
            if layer.is_finalized() && !layer.is_destroyed() {
                layer.flush(backend)?;
            }
        }
        Ok(())
    }

    /// Releases every GPU buffer. Entities of the model are gone afterwards.
    pub fn destroy(&mut self, backend: &mut dyn GpuBackend) {
        if self.destroyed {
            return;
        }
        for layer in self.layers.iter_mut() {
            layer.layer_mut().destroy(backend);
        }
        self.entities.clear();
        self.entity_ids.clear();
        self.entity_counters = EntityCounters::default();
        self.destroyed = true;
        debug!("Destroyed scene model {}", self.config.id);
    }

    pub fn stats(&self) -> SceneModelStats {
        let mut stats = SceneModelStats {
            geometries: self.geometries.len() + self.inline_geometries,
            meshes: self.meshes.len(),
            entities: self.entity_ids.len(),
            ..Default::default()
        };
        for layer in self.layers.iter().map(ModelLayer::layer) {
            if layer.is_destroyed() {
                continue;
            }
            stats.layers += 1;
            match layer.kind() {
                LayerKind::Batching => stats.batching_layers += 1,
                LayerKind::Instancing => stats.instancing_layers += 1,
            }
            let (vertices, primitives) = layer.geometry_counts();
            stats.vertices += vertices;
            match layer.primitive() {
                Primitive::Points => stats.points += primitives,
                Primitive::Lines => stats.lines += primitives,
                _ => stats.triangles += primitives,
            }
        }
        stats
    }

    /// Sum of the counters of all live layers.
    pub fn counters(&self) -> LayerCounters {
        let mut counters = LayerCounters::default();
        for layer in self.layers.iter().map(ModelLayer::layer) {
            if !layer.is_destroyed() {
                counters.merge(layer.portions().counters());
            }
        }
        counters
    }

    pub fn entity_counters(&self) -> EntityCounters {
        self.entity_counters
    }

    pub fn num_entities(&self) -> usize {
        self.entity_ids.len()
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().flatten().map(|r| r.id.as_str())
    }

    pub fn entity_mut(&mut self, id: &str) -> Option<PackedEntity<'_>> {
        let index = *self.entity_ids.get(id)?;
        Some(PackedEntity::new(self, index))
    }

    /// Ids of live object entities with `flag` set.
    pub fn object_ids_with(&self, flag: PortionFlags) -> Vec<String> {
        self.entities
            .iter()
            .flatten()
            .filter(|e| e.is_object && e.flags.contains(flag))
            .map(|e| e.id.clone())
            .collect()
    }

    /// Portion of a mesh, by mesh id.
    pub fn mesh_portion(&self, id: &str) -> Option<PortionId> {
        let index = *self.mesh_ids.get(id)?;
        Some(self.meshes[index as usize].portion)
    }

    pub(crate) fn entity_index(&self, id: &str) -> Option<u32> {
        self.entity_ids.get(id).copied()
    }

    pub(crate) fn entity_record(&self, index: u32) -> Option<&EntityRecord> {
        self.entities.get(index as usize)?.as_ref()
    }

    pub(crate) fn mesh_record(&self, index: u32) -> Option<&MeshRecord> {
        self.meshes.get(index as usize)
    }

    pub(crate) fn num_meshes(&self) -> usize {
        self.meshes.len()
    }

    /// Mesh behind a pick index, unless its layer is gone.
    pub(crate) fn mesh_for_pick_index(&self, pick_index: u32) -> Option<u32> {
        let mesh = pick_index.checked_sub(1)?;
        let record = self.meshes.get(mesh as usize)?;
        let layer = self.layers.get(record.portion.layer_index as usize)?.layer();
        (!record.retired && !layer.is_destroyed()).then_some(mesh)
    }

    pub(crate) fn mesh_layer(&self, mesh: u32) -> Option<&dyn Layer> {
        let record = self.meshes.get(mesh as usize)?;
        let layer = self.layers.get(record.portion.layer_index as usize)?.layer();
        (!layer.is_destroyed()).then_some(layer)
    }

    pub(crate) fn mesh_flags(&self, mesh: u32) -> Option<PortionFlags> {
        let record = self.meshes.get(mesh as usize)?;
        self.mesh_layer(mesh)?.portions().flags(record.portion.offset)
    }

    pub(crate) fn set_mesh_flag(&mut self, mesh: u32, flag: PortionFlags, on: bool) {
        let Some(record) = self.meshes.get(mesh as usize) else {
            return;
        };
        let PortionId {
            layer_index,
            offset,
        } = record.portion;
        if let Some(layer) = self.layers.get_mut(layer_index as usize) {
            let layer = layer.layer_mut();
            if !layer.is_destroyed() {
                layer.portions_mut().set_flag(offset, flag, on);
            }
        }
    }

    /// World bounds of a mesh including its entity offset.
    pub(crate) fn mesh_world_aabb(&self, mesh: u32) -> Option<Aabb> {
        let record = self.meshes.get(mesh as usize)?;
        let aabb = self
            .mesh_layer(mesh)?
            .portion_aabb(record.portion.offset)?
            .transform(&self.matrix);
        Some(aabb.translate(self.mesh_offset(mesh)))
    }

    pub(crate) fn entity_mesh_ids(&self, index: u32) -> Vec<&str> {
        self.entity_record(index).map_or_else(Vec::new, |r| {
            r.meshes
                .iter()
                .map(|&m| self.meshes[m as usize].id.as_str())
                .collect()
        })
    }

    pub(crate) fn set_entity_flag(&mut self, index: u32, flag: PortionFlags, on: bool) {
        let flag = settable_flags(flag);
        if flag.is_empty() {
            return;
        }
        let Some(record) = self.entities.get_mut(index as usize).and_then(Option::as_mut) else {
            warn!("Ignoring state change on destroyed entity {index} of {}", self.config.id);
            return;
        };
        let old = record.flags;
        let mut new = old;
        new.set(flag, on);
        if new == old {
            return;
        }
        if record.is_object {
            let colorized = record.colorize.is_some();
            self.entity_counters.remove(old, colorized);
            self.entity_counters.add(new, colorized);
        }
        record.flags = new;
        let meshes = record.meshes.clone();
        for m in meshes {
            self.set_mesh_flag(m, flag, on);
        }
    }

    pub(crate) fn entity_colorize(&self, index: u32) -> [f32; 3] {
        let Some(record) = self.entity_record(index) else {
            return [1.0, 1.0, 1.0];
        };
        record.colorize.unwrap_or_else(|| {
            record.meshes.first().map_or([1.0, 1.0, 1.0], |&m| {
                let c = self.meshes[m as usize].color;
                [c[0] as f32 / 255.0, c[1] as f32 / 255.0, c[2] as f32 / 255.0]
            })
        })
    }

    pub(crate) fn set_entity_colorize(&mut self, index: u32, color: Option<[f32; 3]>) {
        let Some(record) = self.entities.get_mut(index as usize).and_then(Option::as_mut) else {
            warn!("Ignoring colorize on destroyed entity {index} of {}", self.config.id);
            return;
        };
        if record.is_object && record.colorize.is_some() != color.is_some() {
            if color.is_some() {
                self.entity_counters.colorized += 1;
            } else {
                self.entity_counters.colorized = self.entity_counters.colorized.saturating_sub(1);
            }
        }
        record.colorize = color;
        self.apply_entity_colors(index);
    }

    pub(crate) fn set_entity_opacity(&mut self, index: u32, opacity: f32) {
        let Some(record) = self.entities.get_mut(index as usize).and_then(Option::as_mut) else {
            warn!("Ignoring opacity on destroyed entity {index} of {}", self.config.id);
            return;
        };
        record.opacity = opacity.clamp(0.0, 1.0);
        self.apply_entity_colors(index);
    }

    /// Writes colorize and opacity of an entity into its portions. Transparency of
    /// each portion follows the written alpha.
    fn apply_entity_colors(&mut self, index: u32) {
        let Some(record) = self.entity_record(index) else {
            return;
        };
        let (colorize, opacity) = (record.colorize, record.opacity);
        let meshes = record.meshes.clone();
        for m in meshes {
            self.apply_mesh_color(m, colorize, opacity);
        }
    }

    /// Writes the mesh's creation color, tinted by `colorize`, with alpha `opacity`.
    fn apply_mesh_color(&mut self, mesh: u32, colorize: Option<[f32; 3]>, opacity: f32) {
        let Some(record) = self.meshes.get(mesh as usize) else {
            return;
        };
        let base = record.color;
        let rgb = colorize.map_or([base[0], base[1], base[2]], |c| {
            let [r, g, b, _] = to_rgba8(c, 1.0);
            [r, g, b]
        });
        let color = [rgb[0], rgb[1], rgb[2], to_rgba8([0.0; 3], opacity)[3]];
        let PortionId {
            layer_index,
            offset,
        } = record.portion;
        if let Some(layer) = self.layers.get_mut(layer_index as usize) {
            let layer = layer.layer_mut();
            if !layer.is_destroyed() {
                layer.set_color(offset, color);
            }
        }
    }

    fn apply_mesh_offset(&mut self, mesh: u32, offset: Vector3<f64>) {
        let Some(record) = self.meshes.get(mesh as usize) else {
            return;
        };
        let PortionId {
            layer_index,
            offset: portion,
        } = record.portion;
        if let Some(layer) = self.layers.get_mut(layer_index as usize) {
            let layer = layer.layer_mut();
            if !layer.is_destroyed() {
                layer.set_offset(portion, offset);
            }
        }
    }

    /// World offset of a mesh: its entity's offset, or the model offset for loose meshes.
    pub(crate) fn mesh_offset(&self, mesh: u32) -> Vector3<f64> {
        match self.meshes.get(mesh as usize).and_then(|r| r.entity) {
            Some(entity) => self
                .entity_record(entity)
                .map_or(Vector3::new(0.0, 0.0, 0.0), |r| r.offset),
            None => self.model_offset,
        }
    }

    pub(crate) fn set_entity_offset(&mut self, index: u32, offset: Vector3<f64>) {
        let Some(record) = self.entities.get_mut(index as usize).and_then(Option::as_mut) else {
            warn!("Ignoring offset on destroyed entity {index} of {}", self.config.id);
            return;
        };
        record.offset = offset;
        record.aabb.set(None);
        let meshes = record.meshes.clone();
        for m in meshes {
            self.apply_mesh_offset(m, offset);
        }
        self.aabb.set(None);
    }

    /// World bounds of an entity, recomputed after its offset changes.
    pub(crate) fn entity_aabb(&self, index: u32) -> Aabb {
        let Some(record) = self.entity_record(index) else {
            return Aabb::empty();
        };
        if let Some(aabb) = record.aabb.get() {
            return aabb;
        }
        let aabb = record
            .meshes
            .iter()
            .filter_map(|&m| self.mesh_world_aabb(m))
            .fold(Aabb::empty(), |acc, aabb| acc.merge(&aabb));
        record.aabb.set(Some(aabb));
        aabb
    }

    /// Hides the entity's portions for good and forgets its id.
    pub(crate) fn destroy_entity(&mut self, index: u32) {
        let Some(record) = self.entities.get_mut(index as usize).and_then(Option::take) else {
            return;
        };
        if record.is_object {
            self.entity_counters
                .remove(record.flags, record.colorize.is_some());
        }
        self.entity_ids.remove(&record.id);
        for &m in &record.meshes {
            self.set_mesh_flag(m, PortionFlags::VISIBLE, false);
            self.set_mesh_flag(m, PortionFlags::PICKABLE, false);
            self.set_mesh_flag(m, PortionFlags::CULLED, true);
            let mesh = &mut self.meshes[m as usize];
            mesh.entity = None;
            mesh.retired = true;
        }
        self.aabb.set(None);
        debug!("Destroyed entity {} of {}", record.id, self.config.id);
    }

    fn live_entities(&self) -> Vec<u32> {
        self.entities
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_some())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Meshes not bound to any entity and not retired.
    fn loose_meshes(&self) -> Vec<u32> {
        self.meshes
            .iter()
            .enumerate()
            .filter(|(_, m)| m.entity.is_none() && !m.retired)
            .map(|(i, _)| i as u32)
            .collect()
    }
}

/// The model as a whole is an entity too. Its flag, colorize and opacity setters fan
/// out to every entity and loose mesh; its offset shifts them all by the change.
impl EntityOps for SceneModel {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn is_object(&self) -> bool {
        false
    }

    fn is_model(&self) -> bool {
        self.config.is_model
    }

    fn flag(&self, flag: PortionFlags) -> bool {
        with_opacity(self.model_flags, self.model_opacity).contains(flag)
    }

    fn set_flag(&mut self, flag: PortionFlags, on: bool) {
        let flag = settable_flags(flag);
        if flag.is_empty() {
            return;
        }
        if self.destroyed {
            warn!("Ignoring state change on destroyed model {}", self.config.id);
            return;
        }
        self.model_flags.set(flag, on);
        for entity in self.live_entities() {
            self.set_entity_flag(entity, flag, on);
        }
        for mesh in self.loose_meshes() {
            self.set_mesh_flag(mesh, flag, on);
        }
    }

    fn colorize(&self) -> [f32; 3] {
        self.model_colorize.unwrap_or([1.0, 1.0, 1.0])
    }

    fn set_colorize(&mut self, color: Option<[f32; 3]>) {
        self.model_colorize = color;
        for entity in self.live_entities() {
            self.set_entity_colorize(entity, color);
        }
        for mesh in self.loose_meshes() {
            self.apply_mesh_color(mesh, color, self.model_opacity);
        }
    }

    fn opacity(&self) -> f32 {
        self.model_opacity
    }

    fn set_opacity(&mut self, opacity: f32) {
        self.model_opacity = opacity.clamp(0.0, 1.0);
        for entity in self.live_entities() {
            self.set_entity_opacity(entity, opacity);
        }
        for mesh in self.loose_meshes() {
            self.apply_mesh_color(mesh, self.model_colorize, self.model_opacity);
        }
    }

    fn offset(&self) -> Vector3<f64> {
        self.model_offset
    }

    fn set_offset(&mut self, offset: Vector3<f64>) {
        let delta = offset - self.model_offset;
        self.model_offset = offset;
        for entity in self.live_entities() {
            let own = self
                .entity_record(entity)
                .map_or(Vector3::new(0.0, 0.0, 0.0), |r| r.offset);
            self.set_entity_offset(entity, own + delta);
        }
        for mesh in self.loose_meshes() {
            self.apply_mesh_offset(mesh, offset);
        }
        self.aabb.set(None);
    }

    fn aabb(&self) -> Aabb {
        if let Some(aabb) = self.aabb.get() {
            return aabb;
        }
        let aabb = (0..self.meshes.len() as u32)
            .filter(|&m| !self.meshes[m as usize].retired)
            .filter_map(|m| self.mesh_world_aabb(m))
            .fold(Aabb::empty(), |acc, aabb| acc.merge(&aabb));
        self.aabb.set(Some(aabb));
        aabb
    }
}

impl ResourceManager for SceneModel {
    fn invalidate(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.layer_mut().invalidate();
        }
    }

    fn rebuild_all(&mut self, backend: &mut dyn GpuBackend) -> Result<()> {
        for layer in self.layers.iter_mut() {
            layer.layer_mut().rebuild(backend)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> GeometryData {
        GeometryData::triangles(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0], vec![0, 1, 2])
    }

    fn model() -> SceneModel {
        SceneModel::new(SceneModelConfig::new("m"), &SceneDefaults::default())
    }

    #[test]
    fn meshes_share_a_batching_layer() {
        let mut model = model();
        let a = model.create_mesh(MeshConfig::batched("a", triangle())).unwrap();
        let b = model
            .create_mesh(MeshConfig::batched("b", triangle()).with_transform(Vector3::new(5.0, 0.0, 0.0).into()))
            .unwrap();
        assert_eq!(a.layer_index, b.layer_index);
        assert_eq!(b.offset, 1);
        assert_eq!(model.stats().batching_layers, 1);
    }

    #[test]
    fn distant_meshes_get_their_own_origin() {
        let mut model = model();
        let near = model.create_mesh(MeshConfig::batched("near", triangle())).unwrap();
        let far = model
            .create_mesh(
                MeshConfig::batched("far", triangle())
                    .with_transform(Vector3::new(5_000_000.0, 0.0, 0.0).into()),
            )
            .unwrap();
        assert_ne!(near.layer_index, far.layer_index);
        let origin = model.layers()[far.layer_index as usize].layer().origin();
        assert_eq!(origin, Vector3::new(5_000_000.0, 0.0, 0.0));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut model = model();
        model.create_mesh(MeshConfig::batched("a", triangle())).unwrap();
        let err = model.create_mesh(MeshConfig::batched("a", triangle())).unwrap_err();
        assert!(matches!(err, SceneError::DuplicateId { kind: "mesh", .. }));
    }

    #[test]
    fn meshes_belong_to_one_entity() {
        let mut model = model();
        model.create_mesh(MeshConfig::batched("a", triangle())).unwrap();
        model.create_entity(EntityConfig::new("e1", ["a"])).unwrap();
        let err = model.create_entity(EntityConfig::new("e2", ["a"])).unwrap_err();
        assert!(matches!(err, SceneError::MeshAlreadyOwned { ref owner, .. } if owner == "e1"));
        assert!(matches!(
            model.create_entity(EntityConfig::new("e3", ["missing"])),
            Err(SceneError::UnknownMesh(_))
        ));
    }

    #[test]
    fn entity_counters_follow_flags() {
        let mut model = model();
        model.create_mesh(MeshConfig::batched("a", triangle())).unwrap();
        model.create_entity(EntityConfig::new("e", ["a"])).unwrap();
        assert_eq!(model.entity_counters().visible, 1);
        let mut entity = model.entity_mut("e").unwrap();
        entity.set_selected(true);
        entity.set_visible(false);
        entity.set_colorize(Some([1.0, 0.0, 0.0]));
        let counters = model.entity_counters();
        assert_eq!(counters.selected, 1);
        assert_eq!(counters.visible, 0);
        assert_eq!(counters.colorized, 1);
        assert_eq!(model.counters().selected, 1);
    }

    #[test]
    fn opacity_marks_portions_transparent() {
        let mut model = model();
        model.create_mesh(MeshConfig::batched("a", triangle())).unwrap();
        model.create_entity(EntityConfig::new("e", ["a"])).unwrap();
        model.entity_mut("e").unwrap().set_opacity(0.5);
        assert_eq!(model.counters().transparent, 1);
        model.entity_mut("e").unwrap().set_opacity(1.0);
        assert_eq!(model.counters().transparent, 0);
    }

    #[test]
    fn entity_aabb_includes_offset() {
        let mut model = model();
        model.create_mesh(MeshConfig::batched("a", triangle())).unwrap();
        model.create_entity(EntityConfig::new("e", ["a"])).unwrap();
        let mut entity = model.entity_mut("e").unwrap();
        assert_eq!(entity.aabb().max.x, 1.0);
        entity.set_offset(Vector3::new(2.0, 0.0, 0.0));
        assert_eq!(entity.aabb().max.x, 3.0);
        assert_eq!(model.aabb().max.x, 3.0);
    }

    #[test]
    fn destroyed_entities_release_their_id() {
        let mut model = model();
        model.create_mesh(MeshConfig::batched("a", triangle())).unwrap();
        model.create_entity(EntityConfig::new("e", ["a"])).unwrap();
        model.entity_mut("e").unwrap().destroy();
        assert!(model.entity_mut("e").is_none());
        assert_eq!(model.entity_counters(), EntityCounters::default());
        let counters = model.counters();
        assert_eq!(counters.visible, 0);
        assert_eq!(counters.culled, 1);
        // whole-model show does not bring destroyed meshes back
        model.set_visible(true);
        assert_eq!(model.counters().visible, 0);
    }

    #[test]
    fn negative_scale_keeps_bounds() {
        let mut model = model();
        let id = model
            .create_mesh(
                MeshConfig::batched("a", triangle())
                    .with_matrix(Matrix4::from_nonuniform_scale(-1.0, 1.0, 1.0)),
            )
            .unwrap();
        let aabb = model.layers()[id.layer_index as usize]
            .layer()
            .portion_aabb(id.offset)
            .unwrap();
        assert_eq!(aabb.min.x, -1.0);
        assert_eq!(aabb.max.x, 0.0);
    }
}
