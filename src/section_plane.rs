use cgmath::{InnerSpace, Point3, Vector3};

/// A clip plane. Fragments on the side `dir` points to are discarded from portions
/// flagged `CLIPPABLE`.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionPlane {
    pub id: String,
    pub pos: Point3<f64>,
    pub dir: Vector3<f64>,
    pub active: bool,
}

impl SectionPlane {
    pub fn new(id: impl Into<String>, pos: Point3<f64>, dir: Vector3<f64>) -> Self {
        Self {
            id: id.into(),
            pos,
            dir: dir.normalize(),
            active: true,
        }
    }

    /// Signed distance of `point`, positive on the clipped side.
    pub fn distance(&self, point: Point3<f64>) -> f64 {
        (point - self.pos).dot(self.dir)
    }

    pub fn clips(&self, point: Point3<f64>) -> bool {
        self.active && self.distance(point) > 0.0
    }
}
