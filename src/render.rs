//! Per-frame render driving.
//!
//! [`RenderFlags`] is rebuilt from the layer counters of one model and tells the
//! frame which layers are worth visiting and which of the draw passes have anything
//! to draw at all. [`FrameRenderer`] walks the passes in frame order over every model
//! and lets each layer issue its single draw call per pass.
//!
//! # Pass order
//!
//! - opaque color, then opaque edges
//! - transparent color, then transparent edges
//! - x-ray, highlight and selection silhouettes, each followed by its edges
//!
//! Depth, normals, occlusion and shadow passes are not part of the regular frame
//! and are driven on demand through [`FrameRenderer::render_pass`].

use std::time::Duration;

use crate::{
    camera::CameraFrame,
    config::SceneDefaults,
    context::{Framebuffer, GpuBackend},
    entity::EntityOps,
    error::Result,
    layers::{Layer, LayerDrawContext},
    pipelines::{DrawPass, PassMask},
    scene_model::SceneModel,
    section_plane::SectionPlane,
};

/// What one frame needs from its owner.
pub struct FrameContext<'a> {
    pub camera: &'a CameraFrame,
    pub section_planes: &'a [SectionPlane],
    pub defaults: &'a SceneDefaults,
}

/// Draw state of one layer for the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerFlags {
    pub layer_index: usize,
    pub passes: PassMask,
    /// Whether the active section planes apply to this layer.
    pub clipped: bool,
}

/// Which layers and passes of a model take part in a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderFlags {
    pub layers: Vec<LayerFlags>,
    /// Union of the passes needed by any layer.
    pub passes: PassMask,
    /// Every portion of the model is culled.
    pub culled: bool,
}

impl RenderFlags {
    pub fn rebuild(model: &SceneModel, section_planes: &[SectionPlane]) -> Self {
        if model.is_destroyed() || !model.is_finalized() {
            return Self {
                culled: true,
                ..Default::default()
            };
        }
        let any_plane = section_planes.iter().any(|plane| plane.active);
        let mut flags = RenderFlags::default();
        for (layer_index, layer) in model.layers().iter().enumerate() {
            let layer = layer.layer();
            if layer.is_destroyed() {
                continue;
            }
            let counters = layer.portions().counters();
            let passes = PassMask::for_counters(counters);
            if passes.is_empty() {
                continue;
            }
            flags.passes |= passes;
            flags.layers.push(LayerFlags {
                layer_index,
                passes,
                clipped: any_plane && counters.clippable > 0,
            });
        }
        flags.culled = flags.layers.is_empty() || model.culled();
        flags
    }

    pub fn needs(&self, pass: DrawPass) -> bool {
        !self.culled && self.passes.needs(pass)
    }
}

/// Draw calls issued by one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    pub draw_calls: [u32; DrawPass::ALL.len()],
    pub elapsed: Duration,
}

impl FrameStats {
    pub fn draw_calls(&self, pass: DrawPass) -> u32 {
        self.draw_calls[pass.id() as usize]
    }

    pub fn total_draw_calls(&self) -> u32 {
        self.draw_calls.iter().sum()
    }
}

/// Draws `pass` for every layer of `model` that needs it. Returns the draw calls
/// issued.
pub(crate) fn draw_model_pass(
    model: &SceneModel,
    flags: &RenderFlags,
    pass: DrawPass,
    frame: &FrameContext,
    backend: &mut dyn GpuBackend,
) -> Result<u32> {
    if !flags.needs(pass) {
        return Ok(0);
    }
    let mut calls = 0;
    for layer_flags in flags.layers.iter().filter(|l| l.passes.needs(pass)) {
        let Some(layer) = model.layers().get(layer_flags.layer_index) else {
            continue;
        };
        let ctx = LayerDrawContext {
            camera: frame.camera,
            model_matrix: model.matrix(),
            section_planes: if layer_flags.clipped {
                frame.section_planes
            } else {
                &[]
            },
            backface_policy: model.config().backface_policy,
            defaults: frame.defaults,
        };
        calls += layer.layer().draw(pass, &ctx, backend)?;
    }
    Ok(calls)
}

#[derive(Debug, Default)]
pub struct FrameRenderer {
    frames: u64,
    last_stats: FrameStats,
}

impl FrameRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn last_stats(&self) -> &FrameStats {
        &self.last_stats
    }

    /// Flushes pending state of every model and draws one screen frame.
    pub fn render_frame(
        &mut self,
        models: &mut [SceneModel],
        frame: &FrameContext,
        backend: &mut dyn GpuBackend,
    ) -> Result<FrameStats> {
        let start = instant::Instant::now();
        for model in models.iter_mut() {
            model.flush(backend)?;
        }
        backend.begin(Framebuffer::Screen, frame.camera.viewport)?;
        let flags: Vec<RenderFlags> = models
            .iter()
            .map(|model| RenderFlags::rebuild(model, frame.section_planes))
            .collect();

        let mut stats = FrameStats::default();
        for pass in DrawPass::FRAME_ORDER {
            for (model, flags) in models.iter().zip(&flags) {
                stats.draw_calls[pass.id() as usize] +=
                    draw_model_pass(model, flags, pass, frame, backend)?;
            }
        }
        stats.elapsed = start.elapsed();
        self.frames += 1;
        log::trace!(
            "Frame {} issued {} draw calls in {:?}",
            self.frames,
            stats.total_draw_calls(),
            stats.elapsed
        );
        self.last_stats = stats.clone();
        Ok(stats)
    }

    /// Draws a single pass into `target`, for passes outside the regular frame.
    pub fn render_pass(
        &mut self,
        models: &mut [SceneModel],
        pass: DrawPass,
        target: Framebuffer,
        frame: &FrameContext,
        backend: &mut dyn GpuBackend,
    ) -> Result<u32> {
        for model in models.iter_mut() {
            model.flush(backend)?;
        }
        backend.begin(target, frame.camera.viewport)?;
        let mut calls = 0;
        for model in models.iter() {
            let flags = RenderFlags::rebuild(model, frame.section_planes);
            calls += draw_model_pass(model, &flags, pass, frame, backend)?;
        }
        Ok(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SceneModelConfig,
        data_structures::geometry::GeometryData,
        scene_model::{EntityConfig, MeshConfig},
    };

    fn model() -> SceneModel {
        let mut model = SceneModel::new(SceneModelConfig::new("m"), &SceneDefaults::default());
        model
            .create_mesh(MeshConfig::batched(
                "a",
                GeometryData::triangles(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0], vec![0, 1, 2]),
            ))
            .unwrap();
        model.create_entity(EntityConfig::new("e", ["a"])).unwrap();
        model
    }

    #[test]
    fn open_models_draw_nothing() {
        let flags = RenderFlags::rebuild(&model(), &[]);
        assert!(flags.culled);
        assert!(!flags.needs(DrawPass::ColorOpaque));
    }

    /// Hands out handles and accepts everything.
    #[derive(Default)]
    struct NullBackend(u64);

    impl GpuBackend for NullBackend {
        fn allocate_buffer(
            &mut self,
            _kind: crate::context::BufferKind,
            _data: &[u8],
        ) -> anyhow::Result<crate::context::BufferHandle> {
            self.0 += 1;
            Ok(crate::context::BufferHandle(self.0))
        }

        fn update_buffer_range(
            &mut self,
            _handle: crate::context::BufferHandle,
            _offset: u64,
            _data: &[u8],
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn free_buffer(&mut self, _handle: crate::context::BufferHandle) {}

        fn begin(&mut self, _target: Framebuffer, _viewport: crate::context::Viewport) -> anyhow::Result<()> {
            Ok(())
        }

        fn draw(&mut self, _call: &crate::context::DrawCall) -> anyhow::Result<()> {
            Ok(())
        }

        fn read_pixel(&mut self, _target: Framebuffer, _pos: [u32; 2]) -> anyhow::Result<[u8; 4]> {
            Ok([0; 4])
        }
    }

    #[test]
    fn clipping_needs_clippable_portions_and_active_planes() {
        use cgmath::{Point3, Vector3};
        let mut model = model();
        model.finalize(&mut NullBackend::default()).unwrap();
        let mut plane = SectionPlane::new("p", Point3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0));
        assert!(RenderFlags::rebuild(&model, std::slice::from_ref(&plane)).layers[0].clipped);
        plane.active = false;
        assert!(!RenderFlags::rebuild(&model, std::slice::from_ref(&plane)).layers[0].clipped);
        model.entity_mut("e").unwrap().set_clippable(false);
        plane.active = true;
        assert!(!RenderFlags::rebuild(&model, std::slice::from_ref(&plane)).layers[0].clipped);
    }

    #[test]
    fn culled_models_are_skipped() {
        let mut model = model();
        model.finalize(&mut NullBackend::default()).unwrap();
        assert!(RenderFlags::rebuild(&model, &[]).needs(DrawPass::ColorOpaque));
        model.set_culled(true);
        assert!(!RenderFlags::rebuild(&model, &[]).needs(DrawPass::ColorOpaque));
    }
}
