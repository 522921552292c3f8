//! packed-scene
//!
//! A GPU-packed scene representation for large BIM and CAD models. Hundreds of
//! thousands of objects are packed into a few large vertex buffers (batching) or
//! drawn from one shared geometry many times (instancing), while every object stays
//! individually addressable for visibility, emphasis, color, offset and picking.
//! The crate compiles natively and to WASM.
//!
//! High-level modules
//! - `scene`: the scene owning models, graph entities and section planes
//! - `scene_model`: packed models, their meshes and entities
//! - `entity`: the entity contract shared by graph, packed and model entities
//! - `layers`: batching and instancing layers that own the GPU buffers
//! - `render`: render flags and the per-frame pass driver
//! - `pick`: ray and canvas picking
//! - `camera`: double precision camera frames and unprojection
//! - `context`: the GPU backend contract the core draws through
//! - `pipelines`: draw passes and the wgpu pipelines that execute them
//! - `resources`: pick encodings and the wgpu backend
//! - `data_structures`: bounds, rays, geometry, portion stores and scene graph nodes
//!

pub mod camera;
pub mod config;
pub mod context;
pub mod data_structures;
pub mod entity;
pub mod error;
pub mod layers;
pub mod pick;
pub mod pipelines;
pub mod render;
pub mod resources;
pub mod scene;
pub mod scene_model;
pub mod section_plane;

// Re-exports commonly used types for convenience in downstream code.
pub use cgmath;
pub use camera::CameraFrame;
pub use config::{BackfacePolicy, SceneDefaults, SceneModelConfig};
pub use context::{GpuBackend, ResourceManager, Viewport};
pub use data_structures::{
    aabb::Aabb, flags::PortionFlags, geometry::GeometryData, instance::MeshTransform, ray::Ray,
    scene_graph::GraphEntity,
};
pub use entity::{AnyEntity, EntityOps, PackedEntity};
pub use error::{PickError, SceneError};
pub use pick::{PickParams, PickResult, PickStrategy};
pub use resources::wgpu_backend::WgpuBackend;
pub use scene::Scene;
pub use scene_model::{EntityConfig, MeshConfig, SceneModel};
pub use section_plane::SectionPlane;

/// Installs the platform logger: `env_logger` natively, the browser console on wasm.
#[cfg_attr(target_arch = "wasm32", wasm_bindgen::prelude::wasm_bindgen)]
pub fn init_logging() {
    #[cfg(not(target_arch = "wasm32"))]
    {
        if let Err(e) = env_logger::try_init() {
            eprintln!("Warning: Could not initialize logger: {}", e);
        };
    }

    #[cfg(target_arch = "wasm32")]
    {
        if let Err(e) = console_log::init_with_level(log::Level::Info) {
            web_log_failure(&e.to_string());
        }
    }
}

#[cfg(target_arch = "wasm32")]
fn web_log_failure(message: &str) {
    wasm_bindgen::throw_str(&format!("Could not initialize logger: {message}"));
}
