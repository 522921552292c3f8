//! World-space axis-aligned bounding boxes.

use cgmath::{Matrix4, Point3, Vector3};

use crate::data_structures::ray::Ray;

const EPSILON: f64 = 1e-12;

/// An axis-aligned bounding box in double precision.
///
/// An empty box has `min > max` on every axis, so that expanding it by the first
/// point yields a degenerate box around that point.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Aabb {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Aabb {
    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self { min, max }
    }

    pub fn empty() -> Self {
        Self {
            min: Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
            max: Point3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Bounding box of a flat `[x, y, z, x, y, z, ...]` array.
    pub fn from_flat_positions(positions: &[f64]) -> Self {
        positions
            .chunks_exact(3)
            .fold(Self::empty(), |aabb, p| aabb.expand(Point3::new(p[0], p[1], p[2])))
    }

    /// Returns the 8 corner points of the box.
    pub fn corners(&self) -> [Point3<f64>; 8] {
        [
            Point3::new(self.min.x, self.min.y, self.min.z),
            Point3::new(self.max.x, self.min.y, self.min.z),
            Point3::new(self.min.x, self.max.y, self.min.z),
            Point3::new(self.max.x, self.max.y, self.min.z),
            Point3::new(self.min.x, self.min.y, self.max.z),
            Point3::new(self.max.x, self.min.y, self.max.z),
            Point3::new(self.min.x, self.max.y, self.max.z),
            Point3::new(self.max.x, self.max.y, self.max.z),
        ]
    }

    /// Transforms all 8 corners and re-fits an axis-aligned box around them.
    pub fn transform(&self, matrix: &Matrix4<f64>) -> Self {
        if self.is_empty() {
            return *self;
        }
        self.corners().iter().fold(Self::empty(), |aabb, corner| {
            aabb.expand(Point3::from_homogeneous(matrix * corner.to_homogeneous()))
        })
    }

    pub fn translate(&self, offset: Vector3<f64>) -> Self {
        if self.is_empty() {
            return *self;
        }
        Self {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    pub fn expand(&self, point: Point3<f64>) -> Self {
        Self {
            min: Point3::new(
                self.min.x.min(point.x),
                self.min.y.min(point.y),
                self.min.z.min(point.z),
            ),
            max: Point3::new(
                self.max.x.max(point.x),
                self.max.y.max(point.y),
                self.max.z.max(point.z),
            ),
        }
    }

    pub fn merge(&self, other: &Aabb) -> Self {
        if other.is_empty() {
            return *self;
        }
        self.expand(other.min).expand(other.max)
    }

    pub fn center(&self) -> Point3<f64> {
        Point3::new(
            (self.min.x + self.max.x) / 2.0,
            (self.min.y + self.max.y) / 2.0,
            (self.min.z + self.max.z) / 2.0,
        )
    }

    pub fn size(&self) -> Vector3<f64> {
        self.max - self.min
    }

    pub fn contains_point(&self, point: Point3<f64>) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Slab test. Returns the distance along the ray to the entry point, `0.0`
    /// when the origin is inside the box, `None` on a miss.
    pub fn intersects_ray(&self, ray: &Ray) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let mut tmin = f64::NEG_INFINITY;
        let mut tmax = f64::INFINITY;
        let axes = [
            (ray.origin.x, ray.direction.x, self.min.x, self.max.x),
            (ray.origin.y, ray.direction.y, self.min.y, self.max.y),
            (ray.origin.z, ray.direction.z, self.min.z, self.max.z),
        ];
        for (origin, dir, min, max) in axes {
            if dir.abs() < EPSILON {
                if origin < min || origin > max {
                    return None;
                }
                continue;
            }
            let inv_dir = 1.0 / dir;
            let mut t1 = (min - origin) * inv_dir;
            let mut t2 = (max - origin) * inv_dir;
            if t1 > t2 {
                std::mem::swap(&mut t1, &mut t2);
            }
            tmin = tmin.max(t1);
            tmax = tmax.min(t2);
            if tmin > tmax {
                return None;
            }
        }
        if tmin >= 0.0 {
            Some(tmin)
        } else if tmax >= 0.0 {
            Some(0.0)
        } else {
            None
        }
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Vector3;

    #[test]
    fn empty_box_absorbs_first_point() {
        let aabb = Aabb::empty().expand(Point3::new(1.0, 2.0, 3.0));
        assert!(!aabb.is_empty());
        assert_eq!(aabb.min, aabb.max);
    }

    #[test]
    fn merge_ignores_empty() {
        let a = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        assert_eq!(a.merge(&Aabb::empty()), a);
        assert_eq!(Aabb::empty().merge(&a), a);
    }

    #[test]
    fn transform_translation_moves_center() {
        let a = Aabb::new(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0));
        let moved = a.transform(&Matrix4::from_translation(Vector3::new(10.0, 0.0, -5.0)));
        assert_eq!(moved.center(), Point3::new(10.0, 0.0, -5.0));
    }

    #[test]
    fn ray_hits_box_in_front() {
        let a = Aabb::new(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0));
        let ray = Ray::new(Point3::new(0.0, 0.0, -10.0), Vector3::new(0.0, 0.0, 1.0));
        let t = a.intersects_ray(&ray).unwrap();
        assert!((t - 9.0).abs() < 1e-9);
    }

    #[test]
    fn ray_misses_box_behind() {
        let a = Aabb::new(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0));
        let ray = Ray::new(Point3::new(0.0, 0.0, 10.0), Vector3::new(0.0, 0.0, 1.0));
        assert!(a.intersects_ray(&ray).is_none());
    }

    #[test]
    fn ray_from_inside_reports_zero() {
        let a = Aabb::new(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0));
        let ray = Ray::new(Point3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(a.intersects_ray(&ray), Some(0.0));
    }
}
