//! Scene model construction options and the scene-wide defaults handed to every model.

use cgmath::{Matrix4, One, Quaternion, Vector3};

use crate::pipelines::DrawPass;

/// How triangle layers decide on backface culling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackfacePolicy {
    /// Cull on watertight geometry, show on open geometry.
    #[default]
    Infer,
    AlwaysShow,
    AlwaysCull,
}

#[derive(Debug, Clone)]
pub struct SceneModelConfig {
    pub id: String,
    /// Vertex ceiling of one batching layer.
    pub max_batch_vertices: usize,
    /// Instance ceiling of one instancing layer.
    pub max_instances_per_layer: usize,
    pub edge_threshold_degrees: f64,
    pub backface_policy: BackfacePolicy,
    /// Keep CPU geometry after upload for exact ray picking.
    pub pick_surface_precision: bool,
    /// Keep CPU geometry after upload so `rebuild_all` can re-upload it.
    pub retain_geometry: bool,
    /// Grid cell used to snap automatic relative-to-center origins. `None` disables them.
    pub auto_rtc_cell_size: Option<f64>,
    pub position: Vector3<f64>,
    pub rotation: Quaternion<f64>,
    pub scale: Vector3<f64>,
    pub is_model: bool,
    /// Model slot written into the alpha channel of pick colors, assigned by the scene.
    pub pick_slot: u8,
}

impl SceneModelConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_max_batch_vertices(mut self, max: usize) -> Self {
        self.max_batch_vertices = max;
        self
    }

    pub fn with_position(mut self, position: Vector3<f64>) -> Self {
        self.position = position;
        self
    }

    pub fn with_pick_surface_precision(mut self, enabled: bool) -> Self {
        self.pick_surface_precision = enabled;
        self
    }

    pub fn with_retained_geometry(mut self, enabled: bool) -> Self {
        self.retain_geometry = enabled;
        self
    }

    pub fn with_backface_policy(mut self, policy: BackfacePolicy) -> Self {
        self.backface_policy = policy;
        self
    }

    /// Static world matrix of the model.
    pub fn matrix(&self) -> Matrix4<f64> {
        Matrix4::from_translation(self.position)
            * Matrix4::from(self.rotation)
            * Matrix4::from_nonuniform_scale(self.scale.x, self.scale.y, self.scale.z)
    }

    /// Whether CPU geometry must outlive the GPU upload.
    pub fn retains_geometry(&self) -> bool {
        self.retain_geometry || self.pick_surface_precision
    }
}

impl Default for SceneModelConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            max_batch_vertices: 1 << 20,
            max_instances_per_layer: 1 << 16,
            edge_threshold_degrees: 10.0,
            backface_policy: BackfacePolicy::Infer,
            pick_surface_precision: false,
            retain_geometry: false,
            auto_rtc_cell_size: Some(1000.0),
            position: Vector3::new(0.0, 0.0, 0.0),
            rotation: Quaternion::one(),
            scale: Vector3::new(1.0, 1.0, 1.0),
            is_model: true,
            pick_slot: 1,
        }
    }
}

/// Values every model of a scene starts from. Built once by the scene and passed
/// down explicitly.
#[derive(Debug, Clone)]
pub struct SceneDefaults {
    pub color: [f32; 3],
    pub opacity: f32,
    pub xray_color: [f32; 4],
    pub highlight_color: [f32; 4],
    pub selected_color: [f32; 4],
    pub edge_color: [f32; 4],
    pub model: SceneModelConfig,
}

impl Default for SceneDefaults {
    fn default() -> Self {
        Self {
            color: [1.0, 1.0, 1.0],
            opacity: 1.0,
            xray_color: [0.6, 0.6, 0.7, 0.15],
            highlight_color: [1.0, 1.0, 0.0, 0.5],
            selected_color: [0.0, 1.0, 0.0, 0.5],
            edge_color: [0.2, 0.2, 0.2, 1.0],
            model: SceneModelConfig::default(),
        }
    }
}

impl SceneDefaults {
    /// Flat color of the emphasis passes. Passes shading with portion colors get white.
    pub fn material_color(&self, pass: DrawPass) -> [f32; 4] {
        match pass {
            DrawPass::SilhouetteXRayed | DrawPass::EdgesXRayed => self.xray_color,
            DrawPass::SilhouetteHighlighted | DrawPass::EdgesHighlighted => self.highlight_color,
            DrawPass::SilhouetteSelected | DrawPass::EdgesSelected => self.selected_color,
            DrawPass::EdgesColorOpaque | DrawPass::EdgesColorTransparent => self.edge_color,
            _ => [1.0; 4],
        }
    }

    /// Base color as an RGBA8 portion color.
    pub fn base_color_rgba8(&self) -> [u8; 4] {
        let c = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        [c(self.color[0]), c(self.color[1]), c(self.color[2]), c(self.opacity)]
    }
}

/// Snaps `center` to the nearest cell corner, or `None` if that corner is the origin.
pub(crate) fn auto_rtc_origin(center: Vector3<f64>, cell_size: Option<f64>) -> Option<Vector3<f64>> {
    let cell = cell_size.filter(|cell| *cell > 0.0)?;
    let snap = |v: f64| (v / cell).round() * cell;
    let origin = Vector3::new(snap(center.x), snap(center.y), snap(center.z));
    (origin != Vector3::new(0.0, 0.0, 0.0)).then_some(origin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_models_stay_at_origin() {
        assert_eq!(auto_rtc_origin(Vector3::new(12.0, -300.0, 5.0), Some(1000.0)), None);
    }

    #[test]
    fn distant_models_snap_to_cell() {
        let origin = auto_rtc_origin(Vector3::new(2_400_310.5, 1_200.0, -7.0), Some(1000.0));
        assert_eq!(origin, Some(Vector3::new(2_400_000.0, 1_000.0, 0.0)));
    }

    #[test]
    fn emphasis_passes_use_their_colors() {
        let defaults = SceneDefaults::default();
        assert_eq!(defaults.material_color(DrawPass::SilhouetteHighlighted), defaults.highlight_color);
        assert_eq!(defaults.material_color(DrawPass::EdgesColorOpaque), defaults.edge_color);
        assert_eq!(defaults.material_color(DrawPass::ColorOpaque), [1.0; 4]);
        assert_eq!(defaults.base_color_rgba8(), [255; 4]);
    }

    #[test]
    fn disabled_cell_never_snaps() {
        assert_eq!(auto_rtc_origin(Vector3::new(5e6, 0.0, 0.0), None), None);
    }
}
