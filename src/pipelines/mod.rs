//! Draw passes and the wgpu pipelines that execute them.
//!
//! Every layer can be drawn in each [`DrawPass`]. Whether a pass is worth a draw
//! call at all is decided from the layer's [`LayerCounters`] alone, see
//! [`DrawPass::is_needed`]. Which portions inside the layer take part is decided per
//! vertex on the GPU from the portion flags, see `scene.wgsl`.

use crate::data_structures::flags::LayerCounters;

pub mod scene;

/// As we store vertex data directly in GPU memory we need to tell wgpu what the
/// bytes refer to.
pub trait Vertex {
    fn desc() -> wgpu::VertexBufferLayout<'static>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DrawPass {
    ColorOpaque = 0,
    ColorTransparent = 1,
    SilhouetteXRayed = 2,
    SilhouetteHighlighted = 3,
    SilhouetteSelected = 4,
    EdgesColorOpaque = 5,
    EdgesColorTransparent = 6,
    EdgesXRayed = 7,
    EdgesHighlighted = 8,
    EdgesSelected = 9,
    Depth = 10,
    Normals = 11,
    Occlusion = 12,
    Shadow = 13,
    PickMesh = 14,
    PickDepths = 15,
    PickNormals = 16,
}

/// Fragment stage a pass renders with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentStage {
    Color,
    Flat,
    PickMesh,
    PackedDepth,
    PackedNormal,
}

impl FragmentStage {
    pub fn entry_point(&self) -> &'static str {
        match self {
            FragmentStage::Color => "fs_color",
            FragmentStage::Flat => "fs_flat",
            FragmentStage::PickMesh => "fs_pick_mesh",
            FragmentStage::PackedDepth => "fs_packed_depth",
            FragmentStage::PackedNormal => "fs_packed_normal",
        }
    }
}

impl DrawPass {
    pub const ALL: [DrawPass; 17] = [
        DrawPass::ColorOpaque,
        DrawPass::ColorTransparent,
        DrawPass::SilhouetteXRayed,
        DrawPass::SilhouetteHighlighted,
        DrawPass::SilhouetteSelected,
        DrawPass::EdgesColorOpaque,
        DrawPass::EdgesColorTransparent,
        DrawPass::EdgesXRayed,
        DrawPass::EdgesHighlighted,
        DrawPass::EdgesSelected,
        DrawPass::Depth,
        DrawPass::Normals,
        DrawPass::Occlusion,
        DrawPass::Shadow,
        DrawPass::PickMesh,
        DrawPass::PickDepths,
        DrawPass::PickNormals,
    ];

    /// Order of the regular screen frame. Transparent geometry follows everything
    /// opaque, emphasis effects come last so they stay on top.
    pub const FRAME_ORDER: [DrawPass; 10] = [
        DrawPass::ColorOpaque,
        DrawPass::EdgesColorOpaque,
        DrawPass::ColorTransparent,
        DrawPass::EdgesColorTransparent,
        DrawPass::SilhouetteXRayed,
        DrawPass::EdgesXRayed,
        DrawPass::SilhouetteHighlighted,
        DrawPass::EdgesHighlighted,
        DrawPass::SilhouetteSelected,
        DrawPass::EdgesSelected,
    ];

    pub fn id(&self) -> u32 {
        *self as u32
    }

    /// Whether a layer with `counters` has anything to draw in this pass.
    pub fn is_needed(&self, counters: &LayerCounters) -> bool {
        if counters.all_culled() || counters.visible == 0 {
            return false;
        }
        match self {
            DrawPass::ColorOpaque
            | DrawPass::Depth
            | DrawPass::Normals
            | DrawPass::Occlusion
            | DrawPass::Shadow => !counters.all_transparent() && !counters.all_xrayed(),
            DrawPass::ColorTransparent => counters.transparent > 0 && !counters.all_xrayed(),
            DrawPass::SilhouetteXRayed | DrawPass::EdgesXRayed => counters.xrayed > 0,
            DrawPass::SilhouetteHighlighted | DrawPass::EdgesHighlighted => {
                counters.highlighted > 0
            }
            DrawPass::SilhouetteSelected | DrawPass::EdgesSelected => counters.selected > 0,
            DrawPass::EdgesColorOpaque => counters.edges > 0,
            DrawPass::EdgesColorTransparent => counters.edges > 0 && counters.transparent > 0,
            DrawPass::PickMesh | DrawPass::PickDepths | DrawPass::PickNormals => {
                counters.pickable > 0
            }
        }
    }

    /// Edge passes draw the layer's edge index buffer as lines.
    pub fn uses_edges(&self) -> bool {
        matches!(
            self,
            DrawPass::EdgesColorOpaque
                | DrawPass::EdgesColorTransparent
                | DrawPass::EdgesXRayed
                | DrawPass::EdgesHighlighted
                | DrawPass::EdgesSelected
        )
    }

    pub fn is_pick(&self) -> bool {
        matches!(
            self,
            DrawPass::PickMesh | DrawPass::PickDepths | DrawPass::PickNormals
        )
    }

    /// Blended passes never write depth.
    pub fn is_blended(&self) -> bool {
        matches!(
            self,
            DrawPass::ColorTransparent
                | DrawPass::EdgesColorTransparent
                | DrawPass::SilhouetteXRayed
                | DrawPass::SilhouetteHighlighted
                | DrawPass::SilhouetteSelected
        )
    }

    pub fn fragment_stage(&self) -> FragmentStage {
        match self {
            DrawPass::ColorOpaque | DrawPass::ColorTransparent => FragmentStage::Color,
            DrawPass::PickMesh => FragmentStage::PickMesh,
            DrawPass::Depth | DrawPass::Occlusion | DrawPass::Shadow | DrawPass::PickDepths => {
                FragmentStage::PackedDepth
            }
            DrawPass::Normals | DrawPass::PickNormals => FragmentStage::PackedNormal,
            _ => FragmentStage::Flat,
        }
    }
}

bitflags::bitflags! {
    /// Set of passes, one bit per [`DrawPass`] id.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PassMask: u32 {
        const COLOR_OPAQUE = 1 << 0;
        const COLOR_TRANSPARENT = 1 << 1;
        const SILHOUETTE_XRAYED = 1 << 2;
        const SILHOUETTE_HIGHLIGHTED = 1 << 3;
        const SILHOUETTE_SELECTED = 1 << 4;
        const EDGES_COLOR_OPAQUE = 1 << 5;
        const EDGES_COLOR_TRANSPARENT = 1 << 6;
        const EDGES_XRAYED = 1 << 7;
        const EDGES_HIGHLIGHTED = 1 << 8;
        const EDGES_SELECTED = 1 << 9;
        const DEPTH = 1 << 10;
        const NORMALS = 1 << 11;
        const OCCLUSION = 1 << 12;
        const SHADOW = 1 << 13;
        const PICK_MESH = 1 << 14;
        const PICK_DEPTHS = 1 << 15;
        const PICK_NORMALS = 1 << 16;
    }
}

impl From<DrawPass> for PassMask {
    fn from(pass: DrawPass) -> Self {
        PassMask::from_bits_truncate(1 << pass.id())
    }
}

impl PassMask {
    pub fn for_counters(counters: &LayerCounters) -> Self {
        DrawPass::ALL
            .iter()
            .filter(|pass| pass.is_needed(counters))
            .fold(PassMask::empty(), |mask, pass| mask | PassMask::from(*pass))
    }

    pub fn needs(&self, pass: DrawPass) -> bool {
        self.contains(PassMask::from(pass))
    }
}
