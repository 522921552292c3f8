//! Object picking.
//!
//! A pick is stateless and works in three steps:
//!
//! 1. Resolve a world ray, either given explicitly or through a canvas position.
//! 2. Broad phase: test the ray against model and mesh bounds, skipping anything
//!    hidden, culled, unpickable or filtered out. An empty shortlist is a miss.
//! 3. Narrow phase: either cast the ray against retained CPU triangles
//!    ([`PickStrategy::RayCast`]) or render the shortlisted layers with unique per-mesh
//!    colors into the pick target and read back the single pixel under the ray
//!    ([`PickStrategy::Gpu`]).
//!
//! A canvas position off the viewport is a miss.
//!
//! Surface position and normal come from the retained triangles when a layer kept
//! them, otherwise from two more pick renders that encode depth and normals.
//!
//! Graph entities have no triangles on the GPU. They are picked by their bounds.

use cgmath::{InnerSpace, Point3, Vector3};
use log::{debug, error};
use rustc_hash::FxHashSet;

use crate::{
    camera::CameraFrame,
    context::{Framebuffer, GpuBackend},
    data_structures::{
        flags::PortionFlags, instance::normal_matrix, ray::Ray, scene_graph::GraphEntity,
    },
    entity::EntityOps,
    error::PickError,
    layers::{RayHit, point_to_world, ray_to_model},
    pipelines::DrawPass,
    render::{FrameContext, RenderFlags, draw_model_pass},
    resources::pick::{decode_normal, decode_pick_color, unpack_depth},
    scene_model::SceneModel,
};

/// Half width in world units of the beam an explicit ray is rendered with.
const PICK_BEAM_HALF_WIDTH: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PickStrategy {
    /// Render the pick passes and read back one pixel.
    #[default]
    Gpu,
    /// Intersect retained CPU triangles, falling back to the GPU for layers that
    /// released theirs.
    RayCast,
}

#[derive(Debug, Clone, Default)]
pub struct PickParams {
    pub canvas_pos: Option<[f64; 2]>,
    pub ray: Option<Ray>,
    /// Also recover the world position of the hit.
    pub pick_surface: bool,
    /// Also recover the world normal of the hit.
    pub pick_surface_normal: bool,
    /// When set, only these entities can be picked.
    pub include_entities: Option<Vec<String>>,
    pub exclude_entities: Vec<String>,
    pub strategy: PickStrategy,
}

impl PickParams {
    pub fn at_canvas(canvas_pos: [f64; 2]) -> Self {
        Self {
            canvas_pos: Some(canvas_pos),
            ..Default::default()
        }
    }

    pub fn along_ray(ray: Ray) -> Self {
        Self {
            ray: Some(ray),
            ..Default::default()
        }
    }

    pub fn with_surface(mut self) -> Self {
        self.pick_surface = true;
        self
    }

    pub fn with_surface_normal(mut self) -> Self {
        self.pick_surface = true;
        self.pick_surface_normal = true;
        self
    }

    pub fn including(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.include_entities = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclude_entities = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_strategy(mut self, strategy: PickStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    fn admits(&self, entity_id: Option<&str>) -> bool {
        match entity_id {
            Some(id) => {
                self.include_entities
                    .as_ref()
                    .is_none_or(|ids| ids.iter().any(|i| i == id))
                    && !self.exclude_entities.iter().any(|e| e == id)
            }
            None => self.include_entities.is_none(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PickResult {
    pub entity_id: Option<String>,
    /// `None` for graph entities.
    pub model_id: Option<String>,
    pub mesh_id: Option<String>,
    /// Triangle index inside the mesh, when the hit was resolved on triangles.
    pub primitive_index: Option<u32>,
    pub world_pos: Option<Point3<f64>>,
    pub world_normal: Option<Vector3<f64>>,
    pub canvas_pos: Option<[f64; 2]>,
}

/// `(model, layer)` pairs holding at least one broad phase survivor.
type Shortlist = FxHashSet<(usize, usize)>;

/// Broad phase survivor.
#[derive(Debug, Clone, Copy)]
struct MeshCandidate {
    model: usize,
    mesh: u32,
    distance: f64,
}

struct SurfaceHit {
    distance: f64,
    primitive_index: u32,
    position: Point3<f64>,
    normal: Vector3<f64>,
}

fn entity_of(model: &SceneModel, mesh: u32) -> Option<&str> {
    let entity = model.mesh_record(mesh)?.entity?;
    model.entity_record(entity).map(|r| r.id.as_str())
}

fn pickable(flags: PortionFlags) -> bool {
    flags.contains(PortionFlags::VISIBLE | PortionFlags::PICKABLE)
        && !flags.contains(PortionFlags::CULLED)
}

fn broad_phase(models: &[SceneModel], ray: &Ray, params: &PickParams) -> Vec<MeshCandidate> {
    let mut candidates = Vec::new();
    for (model_index, model) in models.iter().enumerate() {
        if model.is_destroyed() || !model.is_finalized() {
            continue;
        }
        if model.aabb().intersects_ray(ray).is_none() {
            continue;
        }
        for mesh in 0..model.num_meshes() as u32 {
            if !model.mesh_flags(mesh).is_some_and(pickable) {
                continue;
            }
            if !params.admits(entity_of(model, mesh)) {
                continue;
            }
            if let Some(distance) = model.mesh_world_aabb(mesh).and_then(|a| a.intersects_ray(ray)) {
                candidates.push(MeshCandidate {
                    model: model_index,
                    mesh,
                    distance,
                });
            }
        }
    }
    candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    candidates
}

/// Nearest pickable graph entity whose bounds the ray enters.
fn pick_graph(graph: &[GraphEntity], ray: &Ray, params: &PickParams) -> Option<(f64, String)> {
    let mut best: Option<(f64, String)> = None;
    for root in graph {
        root.for_each(&mut |node| {
            if !params.admits(Some(node.id())) {
                return;
            }
            if let Some(t) = node.pick_distance(ray) {
                if best.as_ref().is_none_or(|(b, _)| t < *b) {
                    best = Some((t, node.id().to_string()));
                }
            }
        });
    }
    best
}

/// Casts `ray` against the retained triangles of one mesh, in world space.
fn intersect_mesh(model: &SceneModel, mesh: u32, ray: &Ray) -> Option<SurfaceHit> {
    let record = model.mesh_record(mesh)?;
    let layer = model.mesh_layer(mesh)?;
    let offset = model.mesh_offset(mesh);
    let shifted = Ray::new(ray.origin - offset, ray.direction);
    let model_ray = ray_to_model(&shifted, model.matrix())?;
    let RayHit {
        primitive_index,
        position,
        normal,
        ..
    } = layer.intersect_ray(record.portion.offset, &model_ray)?;
    let world_pos = point_to_world(position, model.matrix()) + offset;
    let world_normal = normal_matrix(model.matrix()) * normal;
    let world_normal = if world_normal.magnitude2() > 0.0 {
        world_normal.normalize()
    } else {
        world_normal
    };
    Some(SurfaceHit {
        distance: (world_pos - ray.origin).magnitude(),
        primitive_index,
        position: world_pos,
        normal: world_normal,
    })
}

fn can_ray_cast(model: &SceneModel, mesh: u32) -> bool {
    model
        .mesh_layer(mesh)
        .is_some_and(|layer| layer.has_retained_geometry() && layer.primitive().is_triangles())
}

fn mesh_result(model: &SceneModel, mesh: u32, hit: Option<&SurfaceHit>, params: &PickParams) -> PickResult {
    PickResult {
        entity_id: entity_of(model, mesh).map(str::to_string),
        model_id: Some(model.id().to_string()),
        mesh_id: model.mesh_record(mesh).map(|r| r.id.clone()),
        primitive_index: hit.map(|h| h.primitive_index),
        world_pos: hit.filter(|_| params.pick_surface).map(|h| h.position),
        world_normal: hit.filter(|_| params.pick_surface_normal).map(|h| h.normal),
        canvas_pos: params.canvas_pos,
    }
}

/// Farthest distance along `ray` at which any model can be hit.
fn far_distance(models: &[SceneModel], ray: &Ray) -> f64 {
    models
        .iter()
        .filter(|m| !m.is_destroyed())
        .map(|m| m.aabb())
        .filter(|aabb| !aabb.is_empty())
        .flat_map(|aabb| aabb.corners())
        .map(|corner| (corner - ray.origin).magnitude())
        .fold(1.0, f64::max)
        * 1.01
}

/// Picks the nearest entity under a canvas position or along a ray.
///
/// A miss is `Ok(None)`. Hits whose layer was destroyed are treated as misses.
pub fn pick(
    models: &mut [SceneModel],
    graph: &[GraphEntity],
    frame: &FrameContext,
    params: &PickParams,
    backend: &mut dyn GpuBackend,
) -> Result<Option<PickResult>, PickError> {
    let ray = match (params.ray, params.canvas_pos) {
        (Some(ray), _) => ray,
        (None, Some(canvas)) if !frame.camera.viewport.contains(canvas) => {
            debug!("Pick canvas position {canvas:?} is outside the viewport");
            return Ok(None);
        }
        (None, Some(canvas)) => frame.camera.ray_through(canvas).ok_or(PickError::NoRay)?,
        (None, None) => return Err(PickError::NoRay),
    };

    let candidates = broad_phase(models, &ray, params);
    let graph_hit = pick_graph(graph, &ray, params);
    if candidates.is_empty() {
        debug!("Pick broad phase found no mesh candidates");
        return Ok(graph_hit.map(|(t, id)| graph_result(id, &ray, t, params)));
    }

    let ray_cast = params.strategy == PickStrategy::RayCast
        && candidates.iter().all(|c| can_ray_cast(&models[c.model], c.mesh));
    let mesh_hit = if ray_cast {
        candidates
            .iter()
            .filter_map(|c| {
                intersect_mesh(&models[c.model], c.mesh, &ray).map(|hit| (c.model, c.mesh, hit))
            })
            .min_by(|a, b| a.2.distance.total_cmp(&b.2.distance))
            .map(|(model, mesh, hit)| {
                let result = mesh_result(&models[model], mesh, Some(&hit), params);
                (hit.distance, result)
            })
    } else {
        if params.strategy == PickStrategy::RayCast {
            debug!("Retained geometry missing for some pick candidates, picking on the GPU");
        }
        let shortlist: Shortlist = candidates
            .iter()
            .filter_map(|c| {
                let layer = models[c.model].mesh_record(c.mesh)?.portion.layer_index as usize;
                Some((c.model, layer))
            })
            .collect();
        gpu_pick(models, frame, &ray, params, &shortlist, backend)?
    };

    Ok(match (mesh_hit, graph_hit) {
        (Some((d, _)), Some((t, id))) if t < d => Some(graph_result(id, &ray, t, params)),
        (Some((_, mesh)), _) => Some(mesh),
        (None, graph) => graph.map(|(t, id)| graph_result(id, &ray, t, params)),
    })
}

fn graph_result(id: String, ray: &Ray, t: f64, params: &PickParams) -> PickResult {
    PickResult {
        entity_id: Some(id),
        world_pos: params.pick_surface.then(|| ray.point_at(t)),
        canvas_pos: params.canvas_pos,
        ..Default::default()
    }
}

/// Renders `pass` for the shortlisted layers into the pick target and reads the pixel
/// under the ray.
fn read_pick_pass(
    models: &[SceneModel],
    frame: &FrameContext,
    pass: DrawPass,
    pixel: [u32; 2],
    shortlist: &Shortlist,
    backend: &mut dyn GpuBackend,
) -> Result<[u8; 4], PickError> {
    backend.begin(Framebuffer::Pick, frame.camera.viewport)?;
    for (model_index, model) in models.iter().enumerate() {
        let mut flags = RenderFlags::rebuild(model, frame.section_planes);
        flags
            .layers
            .retain(|l| shortlist.contains(&(model_index, l.layer_index)));
        if flags.layers.is_empty() {
            continue;
        }
        draw_model_pass(model, &flags, pass, frame, backend)?;
    }
    backend.read_pixel(Framebuffer::Pick, pixel).map_err(|e| {
        error!("Pick readback failed: {e}");
        PickError::Readback(e)
    })
}

fn gpu_pick(
    models: &mut [SceneModel],
    frame: &FrameContext,
    ray: &Ray,
    params: &PickParams,
    shortlist: &Shortlist,
    backend: &mut dyn GpuBackend,
) -> Result<Option<(f64, PickResult)>, PickError> {
    let ray_camera;
    let (camera, pixel) = match (params.ray, params.canvas_pos) {
        (None, Some(canvas)) => (frame.camera, [canvas[0] as u32, canvas[1] as u32]),
        _ => {
            ray_camera = CameraFrame::along_ray(ray, PICK_BEAM_HALF_WIDTH, far_distance(models, ray));
            (&ray_camera, [0, 0])
        }
    };
    let pick_frame = FrameContext {
        camera,
        section_planes: frame.section_planes,
        defaults: frame.defaults,
    };

    // Filtered-out meshes are made unpickable for the pick draw only.
    let mut suppressed = Vec::new();
    for (model_index, model) in models.iter_mut().enumerate() {
        for mesh in 0..model.num_meshes() as u32 {
            let pickable_now = model
                .mesh_flags(mesh)
                .is_some_and(|f| f.contains(PortionFlags::PICKABLE));
            if pickable_now && !params.admits(entity_of(model, mesh)) {
                model.set_mesh_flag(mesh, PortionFlags::PICKABLE, false);
                suppressed.push((model_index, mesh));
            }
        }
    }

    let outcome = gpu_pick_filtered(models, &pick_frame, ray, pixel, params, shortlist, backend);

    for (model_index, mesh) in suppressed {
        models[model_index].set_mesh_flag(mesh, PortionFlags::PICKABLE, true);
    }
    outcome
}

fn gpu_pick_filtered(
    models: &mut [SceneModel],
    frame: &FrameContext,
    ray: &Ray,
    pixel: [u32; 2],
    params: &PickParams,
    shortlist: &Shortlist,
    backend: &mut dyn GpuBackend,
) -> Result<Option<(f64, PickResult)>, PickError> {
    for model in models.iter_mut() {
        model.flush(backend)?;
    }
    let pixel_value =
        read_pick_pass(models, frame, DrawPass::PickMesh, pixel, shortlist, backend)?;
    let Some(id) = decode_pick_color(pixel_value) else {
        return Ok(None);
    };
    let Some((model, mesh)) = models
        .iter()
        .filter(|m| !m.is_destroyed() && m.pick_slot() == id.slot)
        .find_map(|m| m.mesh_for_pick_index(id.index).map(|mesh| (m, mesh)))
    else {
        debug!("Pick id {id:?} resolves to no live mesh");
        return Ok(None);
    };

    if !params.pick_surface {
        let distance = model
            .mesh_world_aabb(mesh)
            .and_then(|a| a.intersects_ray(ray))
            .unwrap_or(f64::MAX);
        return Ok(Some((distance, mesh_result(model, mesh, None, params))));
    }

    if can_ray_cast(model, mesh) {
        if let Some(hit) = intersect_mesh(model, mesh, ray) {
            return Ok(Some((hit.distance, mesh_result(model, mesh, Some(&hit), params))));
        }
    }

    let depth = read_pick_pass(models, frame, DrawPass::PickDepths, pixel, shortlist, backend)?;
    let depth = unpack_depth(depth);
    let (x, y) = frame
        .camera
        .canvas_to_ndc([pixel[0] as f64 + 0.5, pixel[1] as f64 + 0.5]);
    let Some(position) = frame
        .camera
        .unproject(Vector3::new(x, y, depth * 2.0 - 1.0))
    else {
        return Ok(Some((f64::MAX, mesh_result(model, mesh, None, params))));
    };
    let normal = if params.pick_surface_normal {
        let n = read_pick_pass(models, frame, DrawPass::PickNormals, pixel, shortlist, backend)?;
        let n = decode_normal(n);
        let n = Vector3::new(n[0], n[1], n[2]);
        (n.magnitude2() > 0.0).then(|| n.normalize())
    } else {
        None
    };
    let mut result = mesh_result(model, mesh, None, params);
    result.world_pos = Some(position);
    result.world_normal = normal;
    Ok(Some(((position - ray.origin).magnitude(), result)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_filter_rejects_loose_meshes() {
        let params = PickParams::at_canvas([0.0, 0.0]).including(["a"]);
        assert!(params.admits(Some("a")));
        assert!(!params.admits(Some("b")));
        assert!(!params.admits(None));
    }

    #[test]
    fn exclude_filter_wins() {
        let params = PickParams::at_canvas([0.0, 0.0]).including(["a"]).excluding(["a"]);
        assert!(!params.admits(Some("a")));
        assert!(PickParams::default().admits(None));
    }

    #[test]
    fn graph_entities_pick_by_bounds() {
        use crate::data_structures::aabb::Aabb;
        let near = GraphEntity::new("near").with_bounds(Aabb::new(
            Point3::new(-1.0, -1.0, 4.0),
            Point3::new(1.0, 1.0, 5.0),
        ));
        let far = GraphEntity::new("far").with_bounds(Aabb::new(
            Point3::new(-1.0, -1.0, 9.0),
            Point3::new(1.0, 1.0, 10.0),
        ));
        let ray = Ray::new(Point3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 1.0));
        let (t, id) = pick_graph(&[far, near], &ray, &PickParams::default()).unwrap();
        assert_eq!(id, "near");
        assert!((t - 4.0).abs() < 1e-9);
    }
}
