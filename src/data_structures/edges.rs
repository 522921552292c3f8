//! Feature-edge extraction for triangle geometry.
//!
//! Vertices are first welded by position so that meshes split per face (hard
//! normals, per-face colors) still expose their adjacency. An edge is kept when it
//! borders a single triangle, is shared by more than two triangles, or separates two
//! triangles whose normals differ by more than the threshold angle.

use cgmath::{InnerSpace, Vector3};
use rustc_hash::FxHashMap;

use crate::data_structures::geometry::face_normal;

/// Positions closer than this on every axis weld into one vertex.
const WELD_PRECISION: f64 = 1e-6;

/// Maps every vertex to the index of the first vertex sharing its position.
pub fn weld_vertices(positions: &[f64]) -> Vec<u32> {
    let mut first_at: FxHashMap<(i64, i64, i64), u32> = FxHashMap::default();
    positions
        .chunks_exact(3)
        .enumerate()
        .map(|(i, p)| {
            let key = (
                (p[0] / WELD_PRECISION).round() as i64,
                (p[1] / WELD_PRECISION).round() as i64,
                (p[2] / WELD_PRECISION).round() as i64,
            );
            *first_at.entry(key).or_insert(i as u32)
        })
        .collect()
}

struct EdgeFaces {
    /// Unwelded vertex indices as first seen, emitted as-is.
    a: u32,
    b: u32,
    normals: smallvec::SmallVec<[Vector3<f64>; 2]>,
}

/// Builds line-pair edge indices for an indexed triangle list.
///
/// Output order follows the first triangle that references each edge.
pub fn build_edge_indices(positions: &[f64], indices: &[u32], threshold_degrees: f64) -> Vec<u32> {
    let welded = weld_vertices(positions);
    let threshold = threshold_degrees.to_radians();

    let mut lookup: FxHashMap<(u32, u32), usize> = FxHashMap::default();
    let mut edges: Vec<EdgeFaces> = Vec::new();

    for tri in indices.chunks_exact(3) {
        let normal = face_normal(positions, tri);
        for (a, b) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
            let (wa, wb) = (welded[a as usize], welded[b as usize]);
            if wa == wb {
                continue;
            }
            let key = (wa.min(wb), wa.max(wb));
            let slot = *lookup.entry(key).or_insert_with(|| {
                edges.push(EdgeFaces {
                    a,
                    b,
                    normals: smallvec::SmallVec::new(),
                });
                edges.len() - 1
            });
            edges[slot].normals.push(normal);
        }
    }

    let mut out = Vec::new();
    for edge in &edges {
        let keep = match edge.normals.as_slice() {
            [_] => true,
            [n0, n1] => {
                let dot = n0.dot(*n1).clamp(-1.0, 1.0);
                dot.acos() > threshold
            }
            _ => true,
        };
        if keep {
            out.push(edge.a);
            out.push(edge.b);
        }
    }
    out
}
