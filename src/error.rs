use thiserror::Error;

/// Result type for scene construction and state updates
pub type Result<T> = std::result::Result<T, SceneError>;

/// Errors surfaced synchronously by the creation API and by GPU uploads.
///
/// Running out of room in a layer is not an error: layers answer
/// [`can_create_portion`](crate::layers::Layer::can_create_portion) with `false`
/// and the model opens a new layer instead.
#[derive(Error, Debug)]
pub enum SceneError {
    #[error("Scene model is finalized, no more geometry can be added")]
    Finalized,

    #[error("Scene model has been destroyed")]
    Destroyed,

    #[error("Layer is finalized, no more portions can be added")]
    LayerFinalized,

    #[error("Duplicate {kind} id: {id}")]
    DuplicateId { kind: &'static str, id: String },

    #[error("Unknown geometry: {0}")]
    UnknownGeometry(String),

    #[error("Unknown mesh: {0}")]
    UnknownMesh(String),

    #[error("Mesh {mesh} is already owned by entity {owner}")]
    MeshAlreadyOwned { mesh: String, owner: String },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Instance handedness does not match its layer")]
    HandednessMismatch,

    #[error("Geometry has {vertices} vertices, a single layer holds at most {max}")]
    GeometryTooLarge { vertices: usize, max: usize },

    #[error("CPU geometry was released after upload and cannot be rebuilt")]
    GeometryNotRetained,

    #[error("GPU backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Failures of the pick subsystem itself. A pick that hits nothing is `Ok(None)`.
#[derive(Error, Debug)]
pub enum PickError {
    #[error("Pick needs a canvas position or an explicit ray")]
    NoRay,

    #[error("Pick target could not be read: {0}")]
    Readback(#[from] anyhow::Error),

    #[error("Pick draw failed: {0}")]
    Draw(#[from] SceneError),
}
