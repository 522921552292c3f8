//! The scene: every model, graph entity and section plane a viewer draws together.
//!
//! `Scene` builds the [`SceneDefaults`] once and hands them to each model it creates.
//! It assigns pick slots, looks entities up by id across all representations and
//! sums the per-model entity counters into scene-wide object counts.

use log::{debug, warn};

use crate::{
    camera::CameraFrame,
    config::{SceneDefaults, SceneModelConfig},
    context::{Framebuffer, GpuBackend, ResourceManager},
    data_structures::{flags::PortionFlags, scene_graph::GraphEntity},
    entity::{AnyEntity, EntityOps},
    error::{PickError, Result, SceneError},
    pick::{PickParams, PickResult, pick},
    pipelines::DrawPass,
    render::{FrameContext, FrameRenderer, FrameStats},
    scene_model::{EntityCounters, SceneModel},
    section_plane::SectionPlane,
};

#[derive(Default)]
pub struct Scene {
    defaults: SceneDefaults,
    models: Vec<SceneModel>,
    graph: Vec<GraphEntity>,
    section_planes: Vec<SectionPlane>,
    renderer: FrameRenderer,
}

impl Scene {
    pub fn new(defaults: SceneDefaults) -> Self {
        Self {
            defaults,
            ..Default::default()
        }
    }

    pub fn defaults(&self) -> &SceneDefaults {
        &self.defaults
    }

    /// Creates an empty model. Its pick slot is the lowest one no live model uses.
    pub fn create_model(&mut self, config: SceneModelConfig) -> Result<&mut SceneModel> {
        if self.model(&config.id).is_some() {
            return Err(SceneError::DuplicateId {
                kind: "model",
                id: config.id,
            });
        }
        let slot = (0..=u8::MAX)
            .find(|slot| !self.models.iter().any(|m| !m.is_destroyed() && m.pick_slot() == *slot))
            .unwrap_or_else(|| {
                warn!("All pick slots in use, model {} shares the last one", config.id);
                u8::MAX
            });
        let mut model = SceneModel::new(config, &self.defaults);
        model.set_pick_slot(slot);
        debug!("Scene model {} uses pick slot {slot}", model.id());
        self.models.push(model);
        let last = self.models.len() - 1;
        Ok(&mut self.models[last])
    }

    /// Model with default configuration.
    pub fn create_default_model(&mut self, id: impl Into<String>) -> Result<&mut SceneModel> {
        let config = SceneModelConfig {
            id: id.into(),
            ..self.defaults.model.clone()
        };
        self.create_model(config)
    }

    pub fn model(&self, id: &str) -> Option<&SceneModel> {
        self.models.iter().find(|m| m.id() == id)
    }

    pub fn model_mut(&mut self, id: &str) -> Option<&mut SceneModel> {
        self.models.iter_mut().find(|m| m.id() == id)
    }

    pub fn models(&self) -> &[SceneModel] {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut [SceneModel] {
        &mut self.models
    }

    /// Destroys a model and drops it from the scene. `false` if there was no such model.
    pub fn destroy_model(&mut self, id: &str, backend: &mut dyn GpuBackend) -> bool {
        let Some(index) = self.models.iter().position(|m| m.id() == id) else {
            return false;
        };
        let mut model = self.models.remove(index);
        model.destroy(backend);
        true
    }

    /// Finalizes every model still open.
    pub fn finalize_all(&mut self, backend: &mut dyn GpuBackend) -> Result<()> {
        for model in self.models.iter_mut().filter(|m| !m.is_finalized() && !m.is_destroyed()) {
            model.finalize(backend)?;
        }
        Ok(())
    }

    /// Adds a graph root and computes the world transforms of its subtree.
    pub fn add_graph_entity(&mut self, mut root: GraphEntity) -> Result<()> {
        if self.graph.iter().any(|r| r.find(root.id()).is_some()) {
            return Err(SceneError::DuplicateId {
                kind: "entity",
                id: root.id().to_string(),
            });
        }
        root.update_world_transform_all();
        self.graph.push(root);
        Ok(())
    }

    pub fn graph_entities(&self) -> &[GraphEntity] {
        &self.graph
    }

    pub fn add_section_plane(&mut self, plane: SectionPlane) -> Result<()> {
        if self.section_plane(&plane.id).is_some() {
            return Err(SceneError::DuplicateId {
                kind: "section plane",
                id: plane.id,
            });
        }
        self.section_planes.push(plane);
        Ok(())
    }

    pub fn remove_section_plane(&mut self, id: &str) -> Option<SectionPlane> {
        let index = self.section_planes.iter().position(|p| p.id == id)?;
        Some(self.section_planes.remove(index))
    }

    pub fn section_plane(&self, id: &str) -> Option<&SectionPlane> {
        self.section_planes.iter().find(|p| p.id == id)
    }

    pub fn section_plane_mut(&mut self, id: &str) -> Option<&mut SectionPlane> {
        self.section_planes.iter_mut().find(|p| p.id == id)
    }

    pub fn section_planes(&self) -> &[SectionPlane] {
        &self.section_planes
    }

    /// Entity with `id`, searched in packed entities, then graph nodes, then models.
    pub fn entity_mut(&mut self, id: &str) -> Option<AnyEntity<'_>> {
        if let Some(index) = self.models.iter().position(|m| m.entity_index(id).is_some()) {
            return self.models[index].entity_mut(id).map(AnyEntity::Packed);
        }
        if let Some(node) = self.graph.iter_mut().find_map(|root| root.find_mut(id)) {
            return Some(AnyEntity::Graph(node));
        }
        self.models
            .iter_mut()
            .find(|m| m.id() == id)
            .map(AnyEntity::Model)
    }

    /// Object totals over every model and graph entity.
    pub fn object_counters(&self) -> EntityCounters {
        let mut counters = EntityCounters::default();
        for model in self.models.iter().filter(|m| !m.is_destroyed()) {
            counters += model.entity_counters();
        }
        for root in &self.graph {
            root.for_each(&mut |node| {
                if node.is_object() && !node.is_destroyed() {
                    let flags = [
                        PortionFlags::VISIBLE,
                        PortionFlags::XRAYED,
                        PortionFlags::HIGHLIGHTED,
                        PortionFlags::SELECTED,
                        PortionFlags::CULLED,
                        PortionFlags::PICKABLE,
                    ]
                    .into_iter()
                    .filter(|f| node.flag(*f))
                    .fold(PortionFlags::empty(), |acc, f| acc | f);
                    counters.add(flags, node.colorize() != [1.0, 1.0, 1.0]);
                }
            });
        }
        counters
    }

    /// Ids of objects whose `flag` is set, packed entities first.
    pub fn object_ids_with(&self, flag: PortionFlags) -> Vec<String> {
        let mut ids: Vec<String> = self
            .models
            .iter()
            .filter(|m| !m.is_destroyed())
            .flat_map(|m| m.object_ids_with(flag))
            .collect();
        for root in &self.graph {
            root.for_each(&mut |node| {
                if node.is_object() && !node.is_destroyed() && node.flag(flag) {
                    ids.push(node.id().to_string());
                }
            });
        }
        ids
    }

    /// Sets `flag` on every listed entity. Returns how many were found.
    pub fn set_objects_flag<S: AsRef<str>>(&mut self, ids: &[S], flag: PortionFlags, on: bool) -> usize {
        let mut found = 0;
        for id in ids {
            if let Some(mut entity) = self.entity_mut(id.as_ref()) {
                entity.set_flag(flag, on);
                found += 1;
            }
        }
        found
    }

    /// Draws one screen frame.
    pub fn render(&mut self, camera: &CameraFrame, backend: &mut dyn GpuBackend) -> Result<FrameStats> {
        let frame = FrameContext {
            camera,
            section_planes: &self.section_planes,
            defaults: &self.defaults,
        };
        self.renderer.render_frame(&mut self.models, &frame, backend)
    }

    /// Draws one pass outside the regular frame, such as depth or shadows.
    pub fn render_pass(
        &mut self,
        camera: &CameraFrame,
        pass: DrawPass,
        target: Framebuffer,
        backend: &mut dyn GpuBackend,
    ) -> Result<u32> {
        let frame = FrameContext {
            camera,
            section_planes: &self.section_planes,
            defaults: &self.defaults,
        };
        self.renderer
            .render_pass(&mut self.models, pass, target, &frame, backend)
    }

    pub fn frames(&self) -> u64 {
        self.renderer.frames()
    }

    pub fn pick(
        &mut self,
        camera: &CameraFrame,
        params: &PickParams,
        backend: &mut dyn GpuBackend,
    ) -> std::result::Result<Option<PickResult>, PickError> {
        let frame = FrameContext {
            camera,
            section_planes: &self.section_planes,
            defaults: &self.defaults,
        };
        pick(&mut self.models, &self.graph, &frame, params, backend)
    }

    /// Destroys every model and drops all graph entities.
    pub fn clear(&mut self, backend: &mut dyn GpuBackend) {
        for model in self.models.iter_mut() {
            model.destroy(backend);
        }
        self.models.clear();
        self.graph.clear();
    }
}

impl ResourceManager for Scene {
    fn invalidate(&mut self) {
        for model in self.models.iter_mut() {
            model.invalidate();
        }
    }

    fn rebuild_all(&mut self, backend: &mut dyn GpuBackend) -> Result<()> {
        for model in self.models.iter_mut().filter(|m| !m.is_destroyed()) {
            model.rebuild_all(backend)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_structures::{aabb::Aabb, geometry::GeometryData},
        scene_model::{EntityConfig, MeshConfig},
    };
    use cgmath::Point3;

    fn triangle() -> GeometryData {
        GeometryData::triangles(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0], vec![0, 1, 2])
    }

    #[test]
    fn models_get_distinct_pick_slots() {
        let mut scene = Scene::default();
        let a = scene.create_default_model("a").unwrap().pick_slot();
        let b = scene.create_default_model("b").unwrap().pick_slot();
        assert_ne!(a, b);
        assert!(matches!(
            scene.create_default_model("a"),
            Err(SceneError::DuplicateId { .. })
        ));
    }

    #[test]
    fn entities_resolve_across_representations() {
        let mut scene = Scene::default();
        let model = scene.create_default_model("m").unwrap();
        model.create_mesh(MeshConfig::batched("mesh", triangle())).unwrap();
        model.create_entity(EntityConfig::new("packed", ["mesh"])).unwrap();
        scene
            .add_graph_entity(GraphEntity::new("node").with_bounds(Aabb::new(
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 1.0),
            )))
            .unwrap();

        assert!(matches!(scene.entity_mut("packed"), Some(AnyEntity::Packed(_))));
        assert!(matches!(scene.entity_mut("node"), Some(AnyEntity::Graph(_))));
        assert!(matches!(scene.entity_mut("m"), Some(AnyEntity::Model(_))));
        assert!(scene.entity_mut("nope").is_none());

        assert_eq!(scene.object_counters().objects, 2);
        assert_eq!(scene.set_objects_flag(&["packed", "node"], PortionFlags::SELECTED, true), 2);
        assert_eq!(scene.object_counters().selected, 2);
        assert_eq!(scene.object_ids_with(PortionFlags::SELECTED), vec!["packed", "node"]);
    }

    #[test]
    fn section_plane_ids_are_unique() {
        use cgmath::Vector3;
        let mut scene = Scene::default();
        let plane = SectionPlane::new("p", Point3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 1.0));
        scene.add_section_plane(plane.clone()).unwrap();
        assert!(scene.add_section_plane(plane).is_err());
        scene.section_plane_mut("p").unwrap().active = false;
        assert!(!scene.section_planes()[0].active);
        assert!(scene.remove_section_plane("p").is_some());
        assert!(scene.section_planes().is_empty());
    }
}
