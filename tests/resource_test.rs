use packed_scene::{
    EntityConfig, EntityOps, MeshConfig, MeshTransform, ResourceManager, Scene, SceneError,
    SceneModelConfig,
    cgmath::Vector3,
    context::BufferKind,
    pipelines::DrawPass,
};

use crate::common::test_utils::{RecordingBackend, cube, front_camera, init_test_logging, triangle};

mod common;

fn mixed_scene(config: SceneModelConfig, backend: &mut RecordingBackend) -> Scene {
    let mut scene = Scene::default();
    let model = scene
        .create_model(SceneModelConfig {
            max_instances_per_layer: 1,
            ..config
        })
        .unwrap();
    model.create_geometry("cube", cube()).unwrap();
    model.create_mesh(MeshConfig::batched("t", triangle())).unwrap();
    for i in 0..2 {
        model
            .create_mesh(
                MeshConfig::instanced(format!("c{i}"), "cube")
                    .with_transform(MeshTransform::from(Vector3::new(i as f64 * 3.0, 0.0, 0.0))),
            )
            .unwrap();
    }
    model.create_entity(EntityConfig::new("e", ["t", "c0", "c1"])).unwrap();
    model.finalize(backend).unwrap();
    scene
}

#[test]
fn retained_models_rebuild_after_context_loss() {
    init_test_logging();
    let mut backend = RecordingBackend::new();
    let mut scene = mixed_scene(SceneModelConfig::new("m").with_retained_geometry(true), &mut backend);
    let uploaded = backend.allocations.len();
    scene.entity_mut("e").unwrap().set_selected(true);

    // the lost device took every buffer with it
    scene.invalidate();
    let mut fresh = RecordingBackend::new();
    scene.rebuild_all(&mut fresh).unwrap();
    assert_eq!(fresh.allocations.len(), uploaded);
    // two instancing layers, one shared geometry upload
    assert_eq!(fresh.allocations_of(BufferKind::Instances), 2);
    assert_eq!(fresh.allocations_of(BufferKind::Positions), 2);

    // state set before the loss travels with the rebuild
    let stats = scene.render(&front_camera(), &mut fresh).unwrap();
    assert!(fresh.updates.is_empty());
    assert_eq!(stats.draw_calls(DrawPass::SilhouetteSelected), 3);
    assert!(fresh.draws.iter().all(|d| fresh
        .allocations
        .iter()
        .any(|(handle, _, _)| *handle == d.index_buffer)));
}

#[test]
fn rebuild_without_retained_geometry_fails() {
    let mut backend = RecordingBackend::new();
    let mut scene = mixed_scene(SceneModelConfig::new("m"), &mut backend);
    assert!(!scene.model("m").unwrap().geometry("cube").unwrap().is_retained());

    scene.invalidate();
    let mut fresh = RecordingBackend::new();
    assert!(matches!(
        scene.rebuild_all(&mut fresh),
        Err(SceneError::GeometryNotRetained)
    ));
}

#[test]
fn destroy_frees_every_buffer_exactly_once() {
    let mut backend = RecordingBackend::new();
    let mut scene = mixed_scene(SceneModelConfig::new("m"), &mut backend);
    assert!(backend.live_buffers() > 0);

    assert!(scene.destroy_model("m", &mut backend));
    assert!(backend.double_frees.is_empty());
    assert_eq!(backend.live_buffers(), 0);
    assert!(scene.model("m").is_none());
    assert!(!scene.destroy_model("m", &mut backend));

    let stats = scene.render(&front_camera(), &mut backend).unwrap();
    assert_eq!(stats.total_draw_calls(), 0);
}

#[test]
fn clearing_the_scene_releases_all_models() {
    let mut backend = RecordingBackend::new();
    let mut scene = mixed_scene(SceneModelConfig::new("a"), &mut backend);
    let model = scene.create_default_model("b").unwrap();
    model.create_mesh(MeshConfig::batched("t", triangle())).unwrap();
    model.finalize(&mut backend).unwrap();

    scene.clear(&mut backend);
    assert!(scene.models().is_empty());
    assert!(backend.double_frees.is_empty());
    assert_eq!(backend.live_buffers(), 0);
}
