//! The entity contract shared by every representation of a scene object.
//!
//! Application code toggles visual state through [`EntityOps`] without knowing
//! whether the object is a scene-graph node ([`GraphEntity`]), a set of packed
//! portions inside a scene model ([`PackedEntity`]) or a whole model. [`AnyEntity`]
//! dispatches over the three with a plain `match`.

use cgmath::Vector3;

use crate::{
    context::GpuBackend,
    data_structures::{aabb::Aabb, flags::PortionFlags, scene_graph::GraphEntity},
    scene_model::SceneModel,
};

/// The part of `flag` an entity can set directly. Transparency follows opacity.
pub(crate) fn settable_flags(flag: PortionFlags) -> PortionFlags {
    flag - PortionFlags::TRANSPARENT
}

/// `flags` with `TRANSPARENT` taken from `opacity`.
pub(crate) fn with_opacity(mut flags: PortionFlags, opacity: f32) -> PortionFlags {
    flags.set(PortionFlags::TRANSPARENT, opacity < 1.0);
    flags
}

pub trait EntityOps {
    fn id(&self) -> &str;

    /// Objects are the entities counted in the scene-wide object views.
    fn is_object(&self) -> bool;

    fn is_model(&self) -> bool;

    fn flag(&self, flag: PortionFlags) -> bool;

    /// Sets one state flag. Transparency follows opacity and is not set here.
    fn set_flag(&mut self, flag: PortionFlags, on: bool);

    fn colorize(&self) -> [f32; 3];

    /// `None` restores the colors the meshes were created with.
    fn set_colorize(&mut self, color: Option<[f32; 3]>);

    fn opacity(&self) -> f32;

    fn set_opacity(&mut self, opacity: f32);

    fn offset(&self) -> Vector3<f64>;

    fn set_offset(&mut self, offset: Vector3<f64>);

    /// World-space bounds, offset included.
    fn aabb(&self) -> Aabb;

    fn visible(&self) -> bool {
        self.flag(PortionFlags::VISIBLE)
    }

    fn set_visible(&mut self, visible: bool) {
        self.set_flag(PortionFlags::VISIBLE, visible);
    }

    fn xrayed(&self) -> bool {
        self.flag(PortionFlags::XRAYED)
    }

    fn set_xrayed(&mut self, xrayed: bool) {
        self.set_flag(PortionFlags::XRAYED, xrayed);
    }

    fn highlighted(&self) -> bool {
        self.flag(PortionFlags::HIGHLIGHTED)
    }

    fn set_highlighted(&mut self, highlighted: bool) {
        self.set_flag(PortionFlags::HIGHLIGHTED, highlighted);
    }

    fn selected(&self) -> bool {
        self.flag(PortionFlags::SELECTED)
    }

    fn set_selected(&mut self, selected: bool) {
        self.set_flag(PortionFlags::SELECTED, selected);
    }

    fn edges(&self) -> bool {
        self.flag(PortionFlags::EDGES)
    }

    fn set_edges(&mut self, edges: bool) {
        self.set_flag(PortionFlags::EDGES, edges);
    }

    fn culled(&self) -> bool {
        self.flag(PortionFlags::CULLED)
    }

    fn set_culled(&mut self, culled: bool) {
        self.set_flag(PortionFlags::CULLED, culled);
    }

    fn pickable(&self) -> bool {
        self.flag(PortionFlags::PICKABLE)
    }

    fn set_pickable(&mut self, pickable: bool) {
        self.set_flag(PortionFlags::PICKABLE, pickable);
    }

    fn clippable(&self) -> bool {
        self.flag(PortionFlags::CLIPPABLE)
    }

    fn set_clippable(&mut self, clippable: bool) {
        self.set_flag(PortionFlags::CLIPPABLE, clippable);
    }

    fn collidable(&self) -> bool {
        self.flag(PortionFlags::COLLIDABLE)
    }

    fn set_collidable(&mut self, collidable: bool) {
        self.set_flag(PortionFlags::COLLIDABLE, collidable);
    }
}

/// Handle to one entity of a [`SceneModel`]. Borrowing the model keeps the handle
/// from outliving it.
pub struct PackedEntity<'a> {
    model: &'a mut SceneModel,
    index: u32,
}

impl<'a> PackedEntity<'a> {
    pub(crate) fn new(model: &'a mut SceneModel, index: u32) -> Self {
        Self { model, index }
    }

    pub fn model_id(&self) -> &str {
        self.model.id()
    }

    /// Ids of the meshes bound to this entity.
    pub fn mesh_ids(&self) -> Vec<&str> {
        self.model.entity_mesh_ids(self.index)
    }

    /// Hides the entity for good and releases its id.
    pub fn destroy(self) {
        self.model.destroy_entity(self.index);
    }
}

impl EntityOps for PackedEntity<'_> {
    fn id(&self) -> &str {
        self.model.entity_record(self.index).map_or("", |r| r.id.as_str())
    }

    fn is_object(&self) -> bool {
        self.model
            .entity_record(self.index)
            .is_some_and(|r| r.is_object)
    }

    fn is_model(&self) -> bool {
        false
    }

    fn flag(&self, flag: PortionFlags) -> bool {
        self.model
            .entity_record(self.index)
            .is_some_and(|r| with_opacity(r.flags, r.opacity).contains(flag))
    }

    fn set_flag(&mut self, flag: PortionFlags, on: bool) {
        self.model.set_entity_flag(self.index, flag, on);
    }

    fn colorize(&self) -> [f32; 3] {
        self.model.entity_colorize(self.index)
    }

    fn set_colorize(&mut self, color: Option<[f32; 3]>) {
        self.model.set_entity_colorize(self.index, color);
    }

    fn opacity(&self) -> f32 {
        self.model
            .entity_record(self.index)
            .map_or(1.0, |r| r.opacity)
    }

    fn set_opacity(&mut self, opacity: f32) {
        self.model.set_entity_opacity(self.index, opacity);
    }

    fn offset(&self) -> Vector3<f64> {
        self.model
            .entity_record(self.index)
            .map_or(Vector3::new(0.0, 0.0, 0.0), |r| r.offset)
    }

    fn set_offset(&mut self, offset: Vector3<f64>) {
        self.model.set_entity_offset(self.index, offset);
    }

    fn aabb(&self) -> Aabb {
        self.model.entity_aabb(self.index)
    }
}

/// Any entity of a scene, whatever backs it.
pub enum AnyEntity<'a> {
    Graph(&'a mut GraphEntity),
    Packed(PackedEntity<'a>),
    Model(&'a mut SceneModel),
}

macro_rules! dispatch {
    ($self:ident, $entity:ident => $body:expr) => {
        match $self {
            AnyEntity::Graph($entity) => $body,
            AnyEntity::Packed($entity) => $body,
            AnyEntity::Model($entity) => $body,
        }
    };
}

impl AnyEntity<'_> {
    /// Graph nodes and packed entities are hidden for good, models release their
    /// GPU buffers.
    pub fn destroy(self, backend: &mut dyn GpuBackend) {
        match self {
            AnyEntity::Graph(entity) => entity.destroy(),
            AnyEntity::Packed(entity) => entity.destroy(),
            AnyEntity::Model(model) => model.destroy(backend),
        }
    }
}

impl EntityOps for AnyEntity<'_> {
    fn id(&self) -> &str {
        dispatch!(self, e => e.id())
    }

    fn is_object(&self) -> bool {
        dispatch!(self, e => e.is_object())
    }

    fn is_model(&self) -> bool {
        dispatch!(self, e => e.is_model())
    }

    fn flag(&self, flag: PortionFlags) -> bool {
        dispatch!(self, e => e.flag(flag))
    }

    fn set_flag(&mut self, flag: PortionFlags, on: bool) {
        dispatch!(self, e => e.set_flag(flag, on))
    }

    fn colorize(&self) -> [f32; 3] {
        dispatch!(self, e => e.colorize())
    }

    fn set_colorize(&mut self, color: Option<[f32; 3]>) {
        dispatch!(self, e => e.set_colorize(color))
    }

    fn opacity(&self) -> f32 {
        dispatch!(self, e => e.opacity())
    }

    fn set_opacity(&mut self, opacity: f32) {
        dispatch!(self, e => e.set_opacity(opacity))
    }

    fn offset(&self) -> Vector3<f64> {
        dispatch!(self, e => e.offset())
    }

    fn set_offset(&mut self, offset: Vector3<f64>) {
        dispatch!(self, e => e.set_offset(offset))
    }

    fn aabb(&self) -> Aabb {
        dispatch!(self, e => e.aabb())
    }
}
