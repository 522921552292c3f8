//! Geometry input, validation and the vertex encodings shared by both layer kinds.
//!
//! Positions arrive either as doubles or as 16-bit quantized integers plus a decode
//! matrix. Normals are oct-encoded into two signed bytes. Missing triangle normals
//! are generated face-aligned, which un-welds the vertices of each triangle.

use cgmath::{InnerSpace, Matrix4, SquareMatrix, Vector3, Vector4};
use rustc_hash::FxHashMap;

use crate::{
    data_structures::aabb::Aabb,
    error::{Result, SceneError},
};

/// Largest quantized coordinate value.
const QUANTIZE_RANGE: f64 = 65535.0;

/// How vertices are assembled into primitives.
///
/// `Triangles` is a request, not a layer kind: mesh creation resolves it to
/// `Solid` (closed surface) or `Surface` (open) for backface handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Points,
    Lines,
    Triangles,
    Solid,
    Surface,
}

impl Primitive {
    pub fn is_triangles(&self) -> bool {
        matches!(self, Primitive::Triangles | Primitive::Solid | Primitive::Surface)
    }

    /// Number of indices per element.
    pub fn index_stride(&self) -> usize {
        match self {
            Primitive::Points => 1,
            Primitive::Lines => 2,
            _ => 3,
        }
    }
}

/// Vertex positions as supplied by the caller.
#[derive(Debug, Clone)]
pub enum Positions {
    /// `[x, y, z, ...]` in model space.
    Float(Vec<f64>),
    /// Quantized `[x, y, z, ...]` decoded by `decode_matrix`.
    Compressed {
        values: Vec<u16>,
        decode_matrix: Matrix4<f64>,
    },
}

impl Positions {
    pub fn vertex_count(&self) -> usize {
        match self {
            Positions::Float(p) => p.len() / 3,
            Positions::Compressed { values, .. } => values.len() / 3,
        }
    }

    fn component_count(&self) -> usize {
        match self {
            Positions::Float(p) => p.len(),
            Positions::Compressed { values, .. } => values.len(),
        }
    }

    /// Full precision positions, decompressing if needed.
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            Positions::Float(p) => p.clone(),
            Positions::Compressed {
                values,
                decode_matrix,
            } => decompress_positions(values, decode_matrix),
        }
    }
}

/// Raw arrays describing one geometry, as handed to `create_geometry` or inlined
/// into `create_mesh`.
#[derive(Debug, Clone)]
pub struct GeometryData {
    pub primitive: Primitive,
    pub positions: Positions,
    pub normals: Option<Vec<f32>>,
    /// RGBA per vertex in `0.0..=1.0`.
    pub colors: Option<Vec<f32>>,
    /// RGBA per vertex, already in bytes.
    pub colors_compressed: Option<Vec<u8>>,
    pub uvs: Option<Vec<f32>>,
    pub indices: Option<Vec<u32>>,
    pub edge_indices: Option<Vec<u32>>,
}

impl GeometryData {
    /// Triangle geometry from float positions and indices.
    pub fn triangles(positions: Vec<f64>, indices: Vec<u32>) -> Self {
        Self {
            primitive: Primitive::Triangles,
            positions: Positions::Float(positions),
            normals: None,
            colors: None,
            colors_compressed: None,
            uvs: None,
            indices: Some(indices),
            edge_indices: None,
        }
    }

    pub fn lines(positions: Vec<f64>, indices: Vec<u32>) -> Self {
        Self {
            primitive: Primitive::Lines,
            ..Self::triangles(positions, indices)
        }
    }

    pub fn points(positions: Vec<f64>) -> Self {
        Self {
            primitive: Primitive::Points,
            indices: None,
            ..Self::triangles(positions, Vec::new())
        }
    }

    pub fn with_normals(mut self, normals: Vec<f32>) -> Self {
        self.normals = Some(normals);
        self
    }

    pub fn with_colors(mut self, colors: Vec<f32>) -> Self {
        self.colors = Some(colors);
        self
    }

    pub fn with_edge_indices(mut self, edge_indices: Vec<u32>) -> Self {
        self.edge_indices = Some(edge_indices);
        self
    }

    pub fn with_compressed_positions(
        mut self,
        values: Vec<u16>,
        decode_matrix: Matrix4<f64>,
    ) -> Self {
        self.positions = Positions::Compressed {
            values,
            decode_matrix,
        };
        self
    }
}

/// Validated geometry with every optional channel resolved to the primitive's needs.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub primitive: Primitive,
    pub positions: Positions,
    pub normals: Option<Vec<f32>>,
    pub colors: Option<Vec<u8>>,
    pub uvs: Option<Vec<f32>>,
    pub indices: Vec<u32>,
    pub edge_indices: Vec<u32>,
}

impl Geometry {
    /// Validates `data`, resolves the primitive, derives edges and face normals.
    ///
    /// Rejects degenerate input as a whole; nothing is partially ingested.
    pub fn build(
        data: GeometryData,
        edge_threshold_degrees: f64,
        infer_solid: bool,
    ) -> Result<Self> {
        let vertex_count = data.positions.vertex_count();
        let components = data.positions.component_count();
        if components == 0 {
            return Err(SceneError::InvalidGeometry("no positions".into()));
        }
        if components % 3 != 0 {
            return Err(SceneError::InvalidGeometry(format!(
                "positions length {components} is not a multiple of 3"
            )));
        }
        if let Some(normals) = &data.normals {
            if normals.len() != components {
                return Err(SceneError::InvalidGeometry(format!(
                    "normals length {} does not match positions length {components}",
                    normals.len()
                )));
            }
        }
        let colors = match (data.colors, data.colors_compressed) {
            (_, Some(bytes)) => Some(bytes),
            (Some(floats), None) => Some(
                floats
                    .iter()
                    .map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
                    .collect(),
            ),
            (None, None) => None,
        };
        if let Some(colors) = &colors {
            if colors.len() != vertex_count * 4 {
                return Err(SceneError::InvalidGeometry(format!(
                    "expected {} RGBA color components, got {}",
                    vertex_count * 4,
                    colors.len()
                )));
            }
        }
        if let Some(uvs) = &data.uvs {
            if uvs.len() != vertex_count * 2 {
                return Err(SceneError::InvalidGeometry(format!(
                    "expected {} uv components, got {}",
                    vertex_count * 2,
                    uvs.len()
                )));
            }
        }

        let indices = match (data.primitive, data.indices) {
            (Primitive::Points, None) => (0..vertex_count as u32).collect(),
            (_, Some(indices)) => indices,
            (_, None) => {
                return Err(SceneError::InvalidGeometry(
                    "indices are required for lines and triangles".into(),
                ));
            }
        };
        if indices.is_empty() {
            return Err(SceneError::InvalidGeometry("indices are empty".into()));
        }
        validate_indices(&indices, data.primitive.index_stride(), vertex_count, "indices")?;
        if let Some(edges) = &data.edge_indices {
            validate_indices(edges, 2, vertex_count, "edge indices")?;
        }

        let mut geometry = Self {
            primitive: data.primitive,
            positions: data.positions,
            normals: data.normals,
            colors,
            uvs: data.uvs,
            indices,
            edge_indices: Vec::new(),
        };

        if geometry.primitive.is_triangles() {
            let positions = geometry.positions.to_f64();
            geometry.edge_indices = match data.edge_indices {
                Some(edges) => edges,
                None => crate::data_structures::edges::build_edge_indices(
                    &positions,
                    &geometry.indices,
                    edge_threshold_degrees,
                ),
            };
            if geometry.primitive == Primitive::Triangles {
                geometry.primitive = if infer_solid && is_watertight(&positions, &geometry.indices)
                {
                    Primitive::Solid
                } else {
                    Primitive::Surface
                };
            }
            if geometry.normals.is_none() {
                geometry.unweld_with_face_normals(&positions);
            }
        } else if let Some(edges) = data.edge_indices {
            geometry.edge_indices = edges;
        }
        Ok(geometry)
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.vertex_count()
    }

    pub fn num_primitives(&self) -> usize {
        self.indices.len() / self.primitive.index_stride()
    }

    /// Replaces shared vertices by one vertex per triangle corner, each carrying the
    /// face normal. Edge indices are remapped onto the first copy of each vertex.
    /// Edges touching a vertex that no triangle uses are dropped.
    fn unweld_with_face_normals(&mut self, positions: &[f64]) {
        let corner_count = self.indices.len();
        let mut first_copy = vec![u32::MAX; self.vertex_count()];
        let mut normals = Vec::with_capacity(corner_count * 3);
        let mut colors = self.colors.as_ref().map(|_| Vec::with_capacity(corner_count * 4));
        let mut uvs = self.uvs.as_ref().map(|_| Vec::with_capacity(corner_count * 2));

        for (tri, corners) in self.indices.chunks_exact(3).enumerate() {
            let normal = face_normal(positions, corners);
            for (k, &i) in corners.iter().enumerate() {
                let i = i as usize;
                if first_copy[i] == u32::MAX {
                    first_copy[i] = (tri * 3 + k) as u32;
                }
                normals.extend_from_slice(&[normal.x as f32, normal.y as f32, normal.z as f32]);
                if let (Some(out), Some(src)) = (colors.as_mut(), self.colors.as_ref()) {
                    out.extend_from_slice(&src[i * 4..i * 4 + 4]);
                }
                if let (Some(out), Some(src)) = (uvs.as_mut(), self.uvs.as_ref()) {
                    out.extend_from_slice(&src[i * 2..i * 2 + 2]);
                }
            }
        }

        self.positions = match &self.positions {
            Positions::Float(p) => Positions::Float(gather(p, &self.indices, 3)),
            Positions::Compressed {
                values,
                decode_matrix,
            } => Positions::Compressed {
                values: gather(values, &self.indices, 3),
                decode_matrix: *decode_matrix,
            },
        };
        self.edge_indices = self
            .edge_indices
            .chunks_exact(2)
            .map(|edge| [first_copy[edge[0] as usize], first_copy[edge[1] as usize]])
            .filter(|edge| !edge.contains(&u32::MAX))
            .flatten()
            .collect();
        self.indices = (0..corner_count as u32).collect();
        self.normals = Some(normals);
        self.colors = colors;
        self.uvs = uvs;
    }
}

fn gather<T: Copy>(src: &[T], indices: &[u32], stride: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(indices.len() * stride);
    for &i in indices {
        let i = i as usize * stride;
        out.extend_from_slice(&src[i..i + stride]);
    }
    out
}

fn validate_indices(indices: &[u32], stride: usize, vertex_count: usize, what: &str) -> Result<()> {
    if indices.len() % stride != 0 {
        return Err(SceneError::InvalidGeometry(format!(
            "{what} length {} is not a multiple of {stride}",
            indices.len()
        )));
    }
    if let Some(bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
        return Err(SceneError::InvalidGeometry(format!(
            "{what} reference vertex {bad}, but there are only {vertex_count} vertices"
        )));
    }
    Ok(())
}

pub(crate) fn vertex(positions: &[f64], index: u32) -> Vector3<f64> {
    let i = index as usize * 3;
    Vector3::new(positions[i], positions[i + 1], positions[i + 2])
}

/// Unit normal of a triangle, zero for degenerate triangles.
pub fn face_normal(positions: &[f64], corners: &[u32]) -> Vector3<f64> {
    let a = vertex(positions, corners[0]);
    let b = vertex(positions, corners[1]);
    let c = vertex(positions, corners[2]);
    let n = (b - a).cross(c - a);
    if n.magnitude2() > 0.0 {
        n.normalize()
    } else {
        n
    }
}

/// A triangle mesh is watertight when, after welding coincident vertices, every
/// undirected edge is shared by exactly two triangles.
pub fn is_watertight(positions: &[f64], indices: &[u32]) -> bool {
    if indices.len() < 12 {
        return false;
    }
    let welded = crate::data_structures::edges::weld_vertices(positions);
    let mut edge_uses: FxHashMap<(u32, u32), u32> = FxHashMap::default();
    for tri in indices.chunks_exact(3) {
        for (a, b) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
            let (a, b) = (welded[a as usize], welded[b as usize]);
            if a == b {
                continue;
            }
            *edge_uses.entry((a.min(b), a.max(b))).or_insert(0) += 1;
        }
    }
    !edge_uses.is_empty() && edge_uses.values().all(|&uses| uses == 2)
}

/// Applies `matrix` to flat positions in place.
pub fn transform_positions(positions: &mut [f64], matrix: &Matrix4<f64>) {
    for p in positions.chunks_exact_mut(3) {
        let v = matrix * Vector4::new(p[0], p[1], p[2], 1.0);
        p[0] = v.x;
        p[1] = v.y;
        p[2] = v.z;
    }
}

/// Quantizes positions to 16 bits against `aabb`.
///
/// Returns the quantized values and the matrix that decodes them back into the
/// space of `positions`.
pub fn quantize_positions(positions: &[f64], aabb: &Aabb) -> (Vec<u16>, Matrix4<f64>) {
    let decode_matrix = decode_matrix_for(aabb);
    let min = aabb.min;
    let size = aabb.size();
    let scale = |extent: f64| {
        if extent > 0.0 {
            QUANTIZE_RANGE / extent
        } else {
            0.0
        }
    };
    let (sx, sy, sz) = (scale(size.x), scale(size.y), scale(size.z));
    let quantized = positions
        .chunks_exact(3)
        .flat_map(|p| {
            [
                ((p[0] - min.x) * sx).round().clamp(0.0, QUANTIZE_RANGE) as u16,
                ((p[1] - min.y) * sy).round().clamp(0.0, QUANTIZE_RANGE) as u16,
                ((p[2] - min.z) * sz).round().clamp(0.0, QUANTIZE_RANGE) as u16,
            ]
        })
        .collect();
    (quantized, decode_matrix)
}

/// Decode matrix mapping `0..=65535` onto the extent of `aabb` on each axis.
pub fn decode_matrix_for(aabb: &Aabb) -> Matrix4<f64> {
    if aabb.is_empty() {
        return Matrix4::identity();
    }
    let size = aabb.size();
    let step = |extent: f64| if extent > 0.0 { extent / QUANTIZE_RANGE } else { 1.0 };
    Matrix4::from_translation(Vector3::new(aabb.min.x, aabb.min.y, aabb.min.z))
        * Matrix4::from_nonuniform_scale(step(size.x), step(size.y), step(size.z))
}

pub fn decompress_positions(values: &[u16], decode_matrix: &Matrix4<f64>) -> Vec<f64> {
    values
        .chunks_exact(3)
        .flat_map(|q| {
            let v = decode_matrix * Vector4::new(q[0] as f64, q[1] as f64, q[2] as f64, 1.0);
            [v.x, v.y, v.z]
        })
        .collect()
}

/// Octahedral encoding of a unit normal into two signed bytes.
pub fn oct_encode_normal(normal: [f32; 3]) -> [i8; 2] {
    let [x, y, z] = normal;
    let l1 = x.abs() + y.abs() + z.abs();
    if l1 == 0.0 {
        return [0, 0];
    }
    let (mut u, mut v) = (x / l1, y / l1);
    if z < 0.0 {
        let (pu, pv) = (u, v);
        u = (1.0 - pv.abs()) * pu.signum();
        v = (1.0 - pu.abs()) * pv.signum();
    }
    [
        (u.clamp(-1.0, 1.0) * 127.0).round() as i8,
        (v.clamp(-1.0, 1.0) * 127.0).round() as i8,
    ]
}

pub fn oct_decode_normal(encoded: [i8; 2]) -> [f32; 3] {
    let u = encoded[0] as f32 / 127.0;
    let v = encoded[1] as f32 / 127.0;
    let z = 1.0 - u.abs() - v.abs();
    let (x, y) = if z < 0.0 {
        ((1.0 - v.abs()) * u.signum(), (1.0 - u.abs()) * v.signum())
    } else {
        (u, v)
    };
    let n = Vector3::new(x, y, z);
    if n.magnitude2() == 0.0 {
        return [0.0, 0.0, 0.0];
    }
    n.normalize().into()
}

pub fn oct_encode_normals(normals: &[f32]) -> Vec<i8> {
    normals
        .chunks_exact(3)
        .flat_map(|n| oct_encode_normal([n[0], n[1], n[2]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Point3;

    fn quad() -> GeometryData {
        GeometryData::triangles(
            vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0],
            vec![0, 1, 2, 0, 2, 3],
        )
    }

    #[test]
    fn rejects_empty_indices() {
        let data = GeometryData::triangles(vec![0.0; 9], vec![]);
        assert!(matches!(
            Geometry::build(data, 10.0, true),
            Err(SceneError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn rejects_mismatched_normals() {
        let data = quad().with_normals(vec![0.0, 0.0, 1.0]);
        assert!(Geometry::build(data, 10.0, true).is_err());
    }

    #[test]
    fn rejects_out_of_range_indices() {
        let data = GeometryData::triangles(vec![0.0; 9], vec![0, 1, 3]);
        assert!(Geometry::build(data, 10.0, true).is_err());
    }

    #[test]
    fn open_quad_resolves_to_surface_with_face_normals() {
        let geometry = Geometry::build(quad(), 10.0, true).unwrap();
        assert_eq!(geometry.primitive, Primitive::Surface);
        assert_eq!(geometry.vertex_count(), 6);
        let normals = geometry.normals.unwrap();
        for n in normals.chunks_exact(3) {
            assert_eq!(n, [0.0, 0.0, 1.0]);
        }
    }

    #[test]
    fn empty_edge_list_means_no_edges() {
        let geometry = Geometry::build(quad().with_edge_indices(vec![]), 10.0, true).unwrap();
        assert!(geometry.edge_indices.is_empty());
    }

    #[test]
    fn edges_on_unused_vertices_are_dropped_when_unwelding() {
        let data = GeometryData::triangles(
            vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 5.0, 5.0, 5.0],
            vec![0, 1, 2],
        )
        .with_edge_indices(vec![0, 1, 2, 3]);
        let geometry = Geometry::build(data, 10.0, true).unwrap();
        assert_eq!(geometry.vertex_count(), 3);
        assert_eq!(geometry.edge_indices, vec![0, 1]);
    }

    #[test]
    fn points_get_implicit_indices() {
        let geometry =
            Geometry::build(GeometryData::points(vec![0.0; 12]), 10.0, true).unwrap();
        assert_eq!(geometry.indices, vec![0, 1, 2, 3]);
        assert!(geometry.edge_indices.is_empty());
    }

    #[test]
    fn quantization_round_trips_within_step() {
        let positions = vec![-10.0, 0.0, 5.0, 10.0, 2.0, 7.5, 3.0, 1.0, 6.0];
        let aabb = Aabb::from_flat_positions(&positions);
        let (q, decode) = quantize_positions(&positions, &aabb);
        let back = decompress_positions(&q, &decode);
        for (a, b) in positions.iter().zip(back.iter()) {
            assert!((a - b).abs() < 20.0 / 65535.0);
        }
    }

    #[test]
    fn flat_axis_quantizes_without_nan() {
        let positions = vec![0.0, 1.0, 2.0, 4.0, 1.0, 2.0];
        let aabb = Aabb::new(Point3::new(0.0, 1.0, 2.0), Point3::new(4.0, 1.0, 2.0));
        let (q, decode) = quantize_positions(&positions, &aabb);
        let back = decompress_positions(&q, &decode);
        assert!((back[1] - 1.0).abs() < 1e-12);
        assert!((back[5] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn oct_encoding_preserves_axis_normals() {
        for n in [
            [1.0, 0.0, 0.0],
            [0.0, -1.0, 0.0],
            [0.0, 0.0, 1.0],
            [0.0, 0.0, -1.0],
        ] {
            let decoded = oct_decode_normal(oct_encode_normal(n));
            for k in 0..3 {
                assert!((decoded[k] - n[k]).abs() < 0.02, "{n:?} -> {decoded:?}");
            }
        }
    }
}
