use approx::assert_abs_diff_eq;
use packed_scene::{
    EntityConfig, EntityOps, GeometryData, MeshConfig, MeshTransform, PortionFlags, Scene,
    SceneError, SceneModel, SceneModelConfig,
    cgmath::{Deg, Matrix4, Point3, Transform, Vector3},
    context::BufferKind,
    data_structures::ray::Ray,
    pipelines::DrawPass,
};

use crate::common::test_utils::{Lcg, RecordingBackend, cube, front_camera, init_test_logging, triangle};

mod common;

#[test]
fn batching_opens_a_new_layer_at_the_vertex_ceiling() {
    init_test_logging();
    let mut scene = Scene::default();
    // one unwelded triangle is three vertices, two fit a layer
    let model = scene
        .create_model(SceneModelConfig::new("m").with_max_batch_vertices(6))
        .unwrap();
    let ids: Vec<_> = (0..3)
        .map(|i| model.create_mesh(MeshConfig::batched(format!("t{i}"), triangle())).unwrap())
        .collect();
    assert_eq!(ids[0].layer_index, ids[1].layer_index);
    assert_ne!(ids[1].layer_index, ids[2].layer_index);
    assert_eq!(model.stats().batching_layers, 2);

    assert!(matches!(
        model.create_mesh(MeshConfig::batched("big", cube())),
        Err(SceneError::GeometryTooLarge { .. })
    ));
}

#[test]
fn inline_mesh_transform_is_baked() {
    let mut scene = Scene::default();
    let model = scene.create_default_model("m").unwrap();
    model
        .create_mesh(
            MeshConfig::batched("t", triangle())
                .with_matrix(Matrix4::from_translation(Vector3::new(5.0, 0.0, 0.0))),
        )
        .unwrap();
    model.create_entity(EntityConfig::new("e", ["t"])).unwrap();
    let mut backend = RecordingBackend::new();
    model.finalize(&mut backend).unwrap();

    let aabb = model.entity_mut("e").unwrap().aabb();
    assert_abs_diff_eq!(aabb.center().x, 5.0, epsilon = 1e-3);
    assert_abs_diff_eq!(aabb.min.x, 4.0, epsilon = 1e-3);
}

fn skewed_transform() -> Matrix4<f64> {
    Matrix4::from_translation(Vector3::new(1.0, 2.0, 3.0))
        * Matrix4::from_angle_z(Deg(30.0))
        * Matrix4::from_nonuniform_scale(2.0, 1.0, 1.0)
}

/// Casts straight down -z through `(x, y)` against one mesh, in model space.
fn hit_from_above(
    scene: &Scene,
    model_id: &str,
    mesh_id: &str,
    x: f64,
    y: f64,
) -> (Point3<f64>, Vector3<f64>) {
    let model = scene.model(model_id).unwrap();
    let portion = model.mesh_portion(mesh_id).unwrap();
    let layer = model.layers()[portion.layer_index as usize].layer();
    let ray = Ray::new(Point3::new(x, y, 10.0), Vector3::new(0.0, 0.0, -1.0));
    let hit = layer.intersect_ray(portion.offset, &ray).unwrap();
    (hit.position, hit.normal)
}

#[test]
fn baking_a_transform_matches_pretransformed_geometry() {
    let mut scene = Scene::default();
    let mut backend = RecordingBackend::new();
    let t = skewed_transform();

    let baked = scene
        .create_model(SceneModelConfig::new("baked").with_retained_geometry(true))
        .unwrap();
    baked.create_mesh(MeshConfig::batched("tri", triangle()).with_matrix(t)).unwrap();
    baked.finalize(&mut backend).unwrap();

    let mut positions = Vec::new();
    for corner in [[-1.0, -1.0, 0.0], [1.0, -1.0, 0.0], [0.0, 1.0, 0.0]] {
        let p = t.transform_point(Point3::new(corner[0], corner[1], corner[2]));
        positions.extend([p.x, p.y, p.z]);
    }
    let centroid = Point3::new(
        (positions[0] + positions[3] + positions[6]) / 3.0,
        (positions[1] + positions[4] + positions[7]) / 3.0,
        (positions[2] + positions[5] + positions[8]) / 3.0,
    );
    let pre = scene
        .create_model(SceneModelConfig::new("pre").with_retained_geometry(true))
        .unwrap();
    pre.create_mesh(MeshConfig::batched("tri", GeometryData::triangles(positions, vec![0, 1, 2])))
        .unwrap();
    pre.finalize(&mut backend).unwrap();

    let a = scene.model("baked").unwrap().layers()[0].layer().aabb();
    let b = scene.model("pre").unwrap().layers()[0].layer().aabb();
    for (x, y) in [(a.min.x, b.min.x), (a.min.y, b.min.y), (a.max.x, b.max.x), (a.max.y, b.max.y)] {
        assert_abs_diff_eq!(x, y, epsilon = 1e-9);
    }
    assert_abs_diff_eq!(a.min.z, 3.0, epsilon = 1e-9);

    // same surface under the quantization step
    for (dx, dy) in [(0.0, 0.0), (0.2, 0.1), (-0.3, -0.1)] {
        let (x, y) = (centroid.x + dx, centroid.y + dy);
        let (pa, na) = hit_from_above(&scene, "baked", "tri", x, y);
        let (pb, nb) = hit_from_above(&scene, "pre", "tri", x, y);
        assert_abs_diff_eq!(pa.z, pb.z, epsilon = 1e-3);
        assert_abs_diff_eq!(na.z, nb.z, epsilon = 1e-6);
        assert_abs_diff_eq!(na.z, 1.0, epsilon = 1e-6);
    }
}

#[test]
fn mirrored_bake_keeps_triangles_front_facing() {
    let mut scene = Scene::default();
    let mut backend = RecordingBackend::new();
    let model = scene
        .create_model(SceneModelConfig::new("m").with_retained_geometry(true))
        .unwrap();
    model
        .create_mesh(
            MeshConfig::batched("mirrored", triangle())
                .with_matrix(Matrix4::from_nonuniform_scale(-1.0, 1.0, 1.0)),
        )
        .unwrap();
    model.finalize(&mut backend).unwrap();

    let (position, normal) = hit_from_above(&scene, "m", "mirrored", 0.0, -0.3);
    assert_abs_diff_eq!(position.z, 0.0, epsilon = 1e-6);
    // without the winding flip the face would point down -z
    assert_abs_diff_eq!(normal.z, 1.0, epsilon = 1e-6);
}

#[test]
fn mirrored_instances_draw_with_clockwise_front_faces() {
    let mut scene = Scene::default();
    let mut backend = RecordingBackend::new();
    let model = scene.create_default_model("m").unwrap();
    model.create_geometry("cube", cube()).unwrap();
    model.create_mesh(MeshConfig::instanced("plain", "cube")).unwrap();
    model
        .create_mesh(
            MeshConfig::instanced("mirrored", "cube")
                .with_matrix(Matrix4::from_nonuniform_scale(-1.0, 1.0, 1.0)),
        )
        .unwrap();
    model
        .create_mesh(
            MeshConfig::instanced("flipped twice", "cube")
                .with_matrix(Matrix4::from_nonuniform_scale(-1.0, -1.0, 1.0)),
        )
        .unwrap();
    model
        .create_entity(EntityConfig::new("e", ["plain", "mirrored", "flipped twice"]))
        .unwrap();
    assert_eq!(model.stats().instancing_layers, 2);
    model.finalize(&mut backend).unwrap();

    scene.render(&front_camera(), &mut backend).unwrap();
    let draws = backend.draws_for(DrawPass::ColorOpaque);
    assert_eq!(draws.len(), 2);
    // both keep backface culling, one with the opposite front face
    assert!(draws.iter().all(|d| d.cull_backfaces));
    let plain = draws.iter().find(|d| !d.mirrored).unwrap();
    let mirrored = draws.iter().find(|d| d.mirrored).unwrap();
    assert_eq!(plain.instance_count, 2);
    assert_eq!(mirrored.instance_count, 1);
}

#[test]
fn creation_after_finalize_is_rejected_and_buffers_stay_put() {
    let mut scene = Scene::default();
    let mut backend = RecordingBackend::new();
    let model = scene.create_default_model("m").unwrap();
    model.create_geometry("g", triangle()).unwrap();
    model.create_mesh(MeshConfig::batched("a", triangle())).unwrap();
    model.create_entity(EntityConfig::new("e", ["a"])).unwrap();
    model.finalize(&mut backend).unwrap();
    let allocations = backend.allocations.len();
    let counters = model.counters();

    assert!(matches!(
        model.create_mesh(MeshConfig::batched("b", triangle())),
        Err(SceneError::Finalized)
    ));
    assert!(matches!(
        model.create_mesh(MeshConfig::instanced("c", "g")),
        Err(SceneError::Finalized)
    ));
    assert!(matches!(model.create_geometry("h", triangle()), Err(SceneError::Finalized)));
    assert!(matches!(
        model.create_entity(EntityConfig::new("f", ["a"])),
        Err(SceneError::Finalized)
    ));
    assert!(matches!(model.finalize(&mut backend), Err(SceneError::Finalized)));
    assert_eq!(backend.allocations.len(), allocations);
    assert_eq!(model.counters(), counters);
}

#[test]
fn instanced_geometry_is_uploaded_once() {
    let mut scene = Scene::default();
    let mut backend = RecordingBackend::new();
    let model = scene
        .create_model(SceneModelConfig {
            max_instances_per_layer: 2,
            ..SceneModelConfig::new("m")
        })
        .unwrap();
    model.create_geometry("cube", cube()).unwrap();
    for i in 0..5 {
        model
            .create_mesh(
                MeshConfig::instanced(format!("c{i}"), "cube")
                    .with_transform(MeshTransform::from(Vector3::new(i as f64 * 2.0, 0.0, 0.0))),
            )
            .unwrap();
    }
    assert_eq!(model.stats().instancing_layers, 3);
    model.finalize(&mut backend).unwrap();

    assert_eq!(backend.allocations_of(BufferKind::Positions), 1);
    assert_eq!(backend.allocations_of(BufferKind::Instances), 3);
    let geometry = model.geometry("cube").unwrap();
    assert_eq!(geometry.users(), 3);
    assert!(geometry.is_uploaded());

    model.destroy(&mut backend);
    assert!(backend.double_frees.is_empty());
    assert_eq!(backend.live_buffers(), 0);
}

#[test]
fn five_instanced_triangles_round_trip() {
    init_test_logging();
    let mut scene = Scene::default();
    let mut backend = RecordingBackend::new();
    let positions = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(3.0, 0.0, 0.0),
        Vector3::new(0.0, 3.0, 0.0),
        Vector3::new(-3.0, 0.0, 0.0),
        Vector3::new(0.0, -3.0, 1.0),
    ];
    let colors = [
        [1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 1.0, 0.0],
        [0.0, 1.0, 1.0],
    ];
    let model = scene.create_default_model("m").unwrap();
    model.create_geometry("tri", triangle()).unwrap();
    for (i, (position, color)) in positions.iter().zip(colors).enumerate() {
        model
            .create_mesh(
                MeshConfig::instanced(format!("mesh{i}"), "tri")
                    .with_transform(MeshTransform::from(*position))
                    .with_color(color),
            )
            .unwrap();
        model
            .create_entity(EntityConfig::new(format!("entity{i}"), [format!("mesh{i}")]))
            .unwrap();
    }
    model.finalize(&mut backend).unwrap();
    assert_eq!(model.num_entities(), 5);

    for (i, position) in positions.iter().enumerate() {
        let center = model.entity_mut(&format!("entity{i}")).unwrap().aabb().center();
        assert_abs_diff_eq!(center.x, position.x, epsilon = 1e-3);
        assert_abs_diff_eq!(center.y, position.y, epsilon = 1e-3);
        assert_abs_diff_eq!(center.z, position.z, epsilon = 1e-3);
    }

    let camera = front_camera();
    scene.entity_mut("entity3").unwrap().set_highlighted(true);
    assert_eq!(scene.model("m").unwrap().counters().highlighted, 1);
    let stats = scene.render(&camera, &mut backend).unwrap();
    assert_eq!(stats.draw_calls(DrawPass::SilhouetteHighlighted), 1);
    assert_eq!(backend.draws_for(DrawPass::SilhouetteHighlighted)[0].instance_count, 5);

    backend.clear_log();
    scene.entity_mut("entity3").unwrap().set_highlighted(false);
    assert_eq!(scene.model("m").unwrap().counters().highlighted, 0);
    let stats = scene.render(&camera, &mut backend).unwrap();
    assert_eq!(stats.draw_calls(DrawPass::SilhouetteHighlighted), 0);
}

#[test]
fn counters_match_portion_flags_under_random_updates() {
    let mut scene = Scene::default();
    let mut backend = RecordingBackend::new();
    let model = scene
        .create_model(SceneModelConfig::new("m").with_max_batch_vertices(9))
        .unwrap();
    model.create_geometry("cube", cube()).unwrap();
    for i in 0..6 {
        model.create_mesh(MeshConfig::batched(format!("b{i}"), triangle())).unwrap();
        model.create_mesh(MeshConfig::instanced(format!("i{i}"), "cube")).unwrap();
        model
            .create_entity(EntityConfig::new(format!("e{i}"), [format!("b{i}"), format!("i{i}")]))
            .unwrap();
    }
    model.finalize(&mut backend).unwrap();

    let flags = [
        PortionFlags::VISIBLE,
        PortionFlags::XRAYED,
        PortionFlags::HIGHLIGHTED,
        PortionFlags::SELECTED,
        PortionFlags::EDGES,
        PortionFlags::CULLED,
        PortionFlags::CLIPPABLE,
        PortionFlags::COLLIDABLE,
        PortionFlags::PICKABLE,
    ];
    let mut rng = Lcg(42);
    for _ in 0..500 {
        let entity = format!("e{}", rng.below(6));
        let flag = flags[rng.below(flags.len() as u64) as usize];
        let on = rng.below(2) == 1;
        let mut handle = model.entity_mut(&entity).unwrap();
        if rng.below(10) == 0 {
            handle.set_opacity(if on { 0.5 } else { 1.0 });
        } else {
            handle.set_flag(flag, on);
        }

        for layer in model.layers() {
            let portions = layer.layer().portions();
            let counters = portions.counters();
            for flag in flags.iter().chain([&PortionFlags::TRANSPARENT]) {
                let expected = portions.all_flags().iter().filter(|f| f.contains(*flag)).count();
                assert_eq!(counters.count(*flag) as usize, expected, "{flag:?}");
            }
        }
    }

    let entity_counters = model.entity_counters();
    let visible = (0..6)
        .filter(|i| model.entity_mut(&format!("e{i}")).unwrap().visible())
        .count();
    assert_eq!(entity_counters.visible as usize, visible);
}

#[test]
fn destroyed_entities_stay_hidden_and_release_their_id() {
    let mut scene = Scene::default();
    let mut backend = RecordingBackend::new();
    let model = scene.create_default_model("m").unwrap();
    model.create_mesh(MeshConfig::batched("a", triangle())).unwrap();
    model.create_mesh(MeshConfig::batched("b", triangle())).unwrap();
    model.create_entity(EntityConfig::new("ea", ["a"])).unwrap();
    model.create_entity(EntityConfig::new("eb", ["b"])).unwrap();
    model.finalize(&mut backend).unwrap();

    model.entity_mut("ea").unwrap().destroy();
    assert!(model.entity_mut("ea").is_none());
    assert_eq!(model.entity_counters().objects, 1);

    // whole-model setters leave retired portions alone
    model.set_visible(true);
    let portion = model.mesh_portion("a").unwrap();
    let flags = model.layers()[portion.layer_index as usize]
        .layer()
        .portions()
        .flags(portion.offset)
        .unwrap();
    assert!(!flags.contains(PortionFlags::VISIBLE));
    assert!(!flags.contains(PortionFlags::PICKABLE));
}

#[test]
fn stats_count_geometry_and_primitives() {
    let mut scene = Scene::default();
    let model = scene.create_default_model("m").unwrap();
    model.create_geometry("cube", cube()).unwrap();
    model.create_mesh(MeshConfig::instanced("c1", "cube")).unwrap();
    model.create_mesh(MeshConfig::instanced("c2", "cube")).unwrap();
    model.create_mesh(MeshConfig::batched("t", triangle())).unwrap();
    model.create_entity(EntityConfig::new("e", ["c1", "c2", "t"])).unwrap();

    let stats = model.stats();
    assert_eq!(stats.geometries, 2);
    assert_eq!(stats.meshes, 3);
    assert_eq!(stats.entities, 1);
    assert_eq!(stats.triangles, 25);
    assert_eq!(stats.layers, 2);
}

#[test]
fn transparency_follows_opacity_only() {
    let mut scene = Scene::default();
    let mut backend = RecordingBackend::new();
    let model = scene.create_default_model("m").unwrap();
    model.create_mesh(MeshConfig::batched("a", triangle())).unwrap();
    model.create_entity(EntityConfig::new("e", ["a"])).unwrap();
    model.finalize(&mut backend).unwrap();
    fn transparent(model: &SceneModel) -> u32 {
        model.layers()[0].layer().portions().counters().count(PortionFlags::TRANSPARENT)
    }

    let mut entity = model.entity_mut("e").unwrap();
    entity.set_flag(PortionFlags::TRANSPARENT, true);
    assert!(!entity.flag(PortionFlags::TRANSPARENT));
    entity.set_opacity(0.5);
    assert!(entity.flag(PortionFlags::TRANSPARENT));
    entity.set_flag(PortionFlags::TRANSPARENT, false);
    assert!(entity.flag(PortionFlags::TRANSPARENT));
    assert_eq!(transparent(model), 1);

    model.set_flag(PortionFlags::TRANSPARENT, false);
    assert_eq!(transparent(model), 1);
    model.set_opacity(0.25);
    assert!(model.flag(PortionFlags::TRANSPARENT));
    model.set_opacity(1.0);
    assert!(!model.flag(PortionFlags::TRANSPARENT));
    assert_eq!(transparent(model), 0);
}

#[test]
fn model_setters_reach_loose_meshes_and_compose_offsets() {
    let mut scene = Scene::default();
    let mut backend = RecordingBackend::new();
    let model = scene.create_default_model("m").unwrap();
    model.create_mesh(MeshConfig::batched("owned", triangle())).unwrap();
    model.create_mesh(MeshConfig::batched("loose", triangle())).unwrap();
    model.create_entity(EntityConfig::new("e", ["owned"])).unwrap();
    model.finalize(&mut backend).unwrap();
    let loose = model.mesh_portion("loose").unwrap();
    let owned = model.mesh_portion("owned").unwrap();

    model.set_colorize(Some([1.0, 0.0, 0.0]));
    model.set_opacity(0.5);
    let portions = model.layers()[loose.layer_index as usize].layer().portions();
    let color = portions.color(loose.offset).unwrap();
    assert_eq!(&color[..3], &[255, 0, 0]);
    assert!(color[3] < 255);
    assert!(portions.flags(loose.offset).unwrap().contains(PortionFlags::TRANSPARENT));

    model.entity_mut("e").unwrap().set_offset(Vector3::new(0.0, 1.0, 0.0));
    model.set_offset(Vector3::new(5.0, 0.0, 0.0));
    model.set_offset(Vector3::new(6.0, 0.0, 0.0));
    // the entity keeps its own offset on top of the model's
    assert_eq!(model.entity_mut("e").unwrap().offset(), Vector3::new(6.0, 1.0, 0.0));
    let portions = model.layers()[loose.layer_index as usize].layer().portions();
    assert_eq!(portions.offset(loose.offset), Some([6.0, 0.0, 0.0]));
    assert_eq!(portions.offset(owned.offset), Some([6.0, 1.0, 0.0]));

    let aabb = model.aabb();
    assert_abs_diff_eq!(aabb.min.x, 5.0, epsilon = 1e-3);
    assert_abs_diff_eq!(aabb.max.y, 2.0, epsilon = 1e-3);
}
