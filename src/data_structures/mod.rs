//! Scene data structures.
//!
//! - `aabb` and `ray` hold the double precision bounds and ray math
//! - `geometry` validates, bakes, quantizes and encodes mesh input
//! - `edges` derives feature edges from triangle meshes
//! - `flags` holds portion state bits and the layer counters derived from them
//! - `portion` is the struct-of-arrays store of per-portion GPU channels
//! - `instance` holds mesh transforms and the per-instance GPU record
//! - `scene_graph` enables hierarchical scene organization

pub mod aabb;
pub mod edges;
pub mod flags;
pub mod geometry;
pub mod instance;
pub mod portion;
pub mod ray;
pub mod scene_graph;
