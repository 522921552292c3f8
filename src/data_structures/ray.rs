use cgmath::{InnerSpace, Matrix4, Point3, Vector3};

const EPSILON: f64 = 1e-12;

/// A world-space ray. The direction is kept normalized.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Ray {
    pub origin: Point3<f64>,
    pub direction: Vector3<f64>,
}

impl Ray {
    pub fn new(origin: Point3<f64>, direction: Vector3<f64>) -> Self {
        Self {
            origin,
            direction: direction.normalize(),
        }
    }

    pub fn point_at(&self, t: f64) -> Point3<f64> {
        self.origin + self.direction * t
    }

    /// Transforms origin as a point and direction as a vector.
    pub fn transform(&self, matrix: &Matrix4<f64>) -> Self {
        let origin = Point3::from_homogeneous(matrix * self.origin.to_homogeneous());
        let dir = matrix * self.direction.extend(0.0);
        Self::new(origin, Vector3::new(dir.x, dir.y, dir.z))
    }

    /// Double-sided Möller-Trumbore. Returns `(t, u, v)` for hits in front of the
    /// origin, with `(u, v)` the barycentric weights of `v1` and `v2`.
    pub fn intersect_triangle(
        &self,
        v0: Point3<f64>,
        v1: Point3<f64>,
        v2: Point3<f64>,
    ) -> Option<(f64, f64, f64)> {
        let edge1 = v1 - v0;
        let edge2 = v2 - v0;
        let h = self.direction.cross(edge2);
        let det = edge1.dot(h);
        if det.abs() < EPSILON {
            return None;
        }
        let inv_det = 1.0 / det;
        let s = self.origin - v0;
        let u = inv_det * s.dot(h);
        if !(0.0..=1.0).contains(&u) {
            return None;
        }
        let q = s.cross(edge1);
        let v = inv_det * self.direction.dot(q);
        if v < 0.0 || u + v > 1.0 {
            return None;
        }
        let t = inv_det * edge2.dot(q);
        (t > EPSILON).then_some((t, u, v))
    }
}
