//! Scene-graph backed entities.
//!
//! Small hand-authored scenes are kept as a node hierarchy instead of packed layers.
//! Each [`GraphEntity`] carries a local transform, a world transform derived from its
//! parent, optional bounds in node space and the same state as a packed entity, so
//! code driving entities never needs to know which kind it holds.
//!
//! Graph entities are not drawn by this crate; they take part in picking through
//! their bounds only.

use cgmath::{Matrix4, SquareMatrix, Vector3};
use log::warn;

use crate::{
    data_structures::{aabb::Aabb, flags::PortionFlags, instance::MeshTransform, ray::Ray},
    entity::{EntityOps, settable_flags},
};

#[derive(Debug, Clone)]
pub struct GraphEntity {
    id: String,
    is_object: bool,
    local: MeshTransform,
    world: MeshTransform,
    /// Geometry bounds in node space.
    bounds: Option<Aabb>,
    flags: PortionFlags,
    colorize: [f32; 3],
    opacity: f32,
    offset: Vector3<f64>,
    destroyed: bool,
    children: Vec<GraphEntity>,
}

impl GraphEntity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_object: true,
            local: MeshTransform::default(),
            world: MeshTransform::default(),
            bounds: None,
            flags: PortionFlags::INITIAL,
            colorize: [1.0, 1.0, 1.0],
            opacity: 1.0,
            offset: Vector3::new(0.0, 0.0, 0.0),
            destroyed: false,
            children: Vec::new(),
        }
    }

    pub fn with_bounds(mut self, bounds: Aabb) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_transform(mut self, transform: MeshTransform) -> Self {
        self.local = transform;
        self.world = transform;
        self
    }

    /// Container nodes group children without being objects themselves.
    pub fn as_container(mut self) -> Self {
        self.is_object = false;
        self
    }

    pub fn add_child(&mut self, mut child: GraphEntity) {
        child.update_world_transforms(&self.world);
        self.children.push(child);
    }

    pub fn children(&self) -> &[GraphEntity] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut Vec<GraphEntity> {
        &mut self.children
    }

    pub fn local_transform(&self) -> MeshTransform {
        self.local
    }

    pub fn world_transform(&self) -> MeshTransform {
        self.world
    }

    pub fn world_matrix(&self) -> Matrix4<f64> {
        self.world.to_matrix()
    }

    /// Sets the local transform. World transforms of the subtree follow on the next
    /// [`update_world_transforms`](Self::update_world_transforms) from the parent.
    pub fn set_local_transform(&mut self, transform: MeshTransform) {
        self.local = transform;
    }

    /**
     * Recomputes the world transform of this node and its whole subtree from the
     * parent's world transform. Roots pass the identity transform.
     */
    pub fn update_world_transforms(&mut self, parent: &MeshTransform) {
        self.world = parent * &self.local;
        let world = self.world;
        for child in self.children.iter_mut() {
            child.update_world_transforms(&world);
        }
    }

    pub fn update_world_transform_all(&mut self) {
        self.update_world_transforms(&MeshTransform::default());
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Hides the subtree and takes it out of picking for good.
    pub fn destroy(&mut self) {
        self.set_flag(PortionFlags::VISIBLE, false);
        self.set_flag(PortionFlags::PICKABLE, false);
        self.destroyed = true;
        for child in self.children.iter_mut() {
            child.destroy();
        }
    }

    /// Depth-first search through this node and its descendants.
    pub fn find(&self, id: &str) -> Option<&GraphEntity> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut GraphEntity> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| child.find_mut(id))
    }

    /// Visits this node and all descendants, parents first.
    pub fn for_each(&self, f: &mut dyn FnMut(&GraphEntity)) {
        f(self);
        for child in &self.children {
            child.for_each(f);
        }
    }

    /// Bounds of this node's own geometry in world space, without children.
    pub fn own_aabb(&self) -> Option<Aabb> {
        let bounds = self.bounds?;
        if bounds.is_empty() {
            return None;
        }
        let matrix = self.world.to_matrix();
        if matrix.determinant() == 0.0 {
            warn!("Entity {} has a singular world transform", self.id);
        }
        Some(bounds.transform(&matrix).translate(self.offset))
    }

    /// Distance along `ray` to this node's own bounds, if it can be picked at all.
    pub fn pick_distance(&self, ray: &Ray) -> Option<f64> {
        if self.destroyed || !self.flags.contains(PortionFlags::VISIBLE | PortionFlags::PICKABLE)
        {
            return None;
        }
        self.own_aabb()?.intersects_ray(ray)
    }
}

impl EntityOps for GraphEntity {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_object(&self) -> bool {
        self.is_object
    }

    fn is_model(&self) -> bool {
        false
    }

    fn flag(&self, flag: PortionFlags) -> bool {
        self.flags.contains(flag)
    }

    fn set_flag(&mut self, flag: PortionFlags, on: bool) {
        let flag = settable_flags(flag);
        if flag.is_empty() {
            return;
        }
        if self.destroyed && on {
            warn!("Ignoring state change on destroyed entity {}", self.id);
            return;
        }
        self.flags.set(flag, on);
        for child in self.children.iter_mut() {
            child.set_flag(flag, on);
        }
    }

    fn colorize(&self) -> [f32; 3] {
        self.colorize
    }

    fn set_colorize(&mut self, color: Option<[f32; 3]>) {
        self.colorize = color.unwrap_or([1.0, 1.0, 1.0]);
        for child in self.children.iter_mut() {
            child.set_colorize(color);
        }
    }

    fn opacity(&self) -> f32 {
        self.opacity
    }

    fn set_opacity(&mut self, opacity: f32) {
        self.opacity = opacity.clamp(0.0, 1.0);
        self.flags.set(PortionFlags::TRANSPARENT, self.opacity < 1.0);
        for child in self.children.iter_mut() {
            child.set_opacity(opacity);
        }
    }

    fn offset(&self) -> Vector3<f64> {
        self.offset
    }

    fn set_offset(&mut self, offset: Vector3<f64>) {
        self.offset = offset;
        for child in self.children.iter_mut() {
            child.set_offset(offset);
        }
    }

    fn aabb(&self) -> Aabb {
        self.children
            .iter()
            .map(|child| child.aabb())
            .fold(self.own_aabb().unwrap_or_default(), |acc, aabb| {
                acc.merge(&aabb)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Point3, Quaternion, Rad, Rotation3};

    fn unit_box() -> Aabb {
        Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0))
    }

    #[test]
    fn children_inherit_world_transform() {
        let mut root = GraphEntity::new("root")
            .as_container()
            .with_transform(MeshTransform::from(Vector3::new(10.0, 0.0, 0.0)));
        root.update_world_transform_all();
        root.add_child(
            GraphEntity::new("child")
                .with_transform(MeshTransform::from(Vector3::new(0.0, 5.0, 0.0)))
                .with_bounds(unit_box()),
        );
        let child = root.find("child").unwrap();
        assert_eq!(child.world_transform().position, Vector3::new(10.0, 5.0, 0.0));
        let aabb = root.aabb();
        assert_eq!(aabb.min, Point3::new(10.0, 5.0, 0.0));
    }

    #[test]
    fn rotation_is_applied_before_child_translation() {
        let mut root = GraphEntity::new("root").with_transform(
            MeshTransform::new().with_rotation(Quaternion::from_angle_z(Rad(std::f64::consts::FRAC_PI_2))),
        );
        root.add_child(GraphEntity::new("child").with_transform(MeshTransform::from(Vector3::new(1.0, 0.0, 0.0))));
        root.update_world_transform_all();
        let p = root.find("child").unwrap().world_transform().position;
        assert!((p.x).abs() < 1e-9);
        assert!((p.y - 1.0).abs() < 1e-9);
    }

    #[test]
    fn state_propagates_to_subtree() {
        let mut root = GraphEntity::new("root").as_container();
        root.add_child(GraphEntity::new("a"));
        root.set_highlighted(true);
        assert!(root.find("a").unwrap().highlighted());
        root.set_opacity(0.5);
        assert!(root.find("a").unwrap().flag(PortionFlags::TRANSPARENT));
    }

    #[test]
    fn destroyed_entities_cannot_be_picked() {
        let mut entity = GraphEntity::new("e").with_bounds(unit_box());
        let ray = Ray::new(Point3::new(0.5, 0.5, -5.0), Vector3::new(0.0, 0.0, 1.0));
        assert!(entity.pick_distance(&ray).is_some());
        entity.destroy();
        assert!(entity.pick_distance(&ray).is_none());
        entity.set_visible(true);
        assert!(!entity.visible());
    }
}
