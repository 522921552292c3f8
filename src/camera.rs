//! Read-only camera state handed to the core each frame.
//!
//! Camera control and navigation live outside this crate. The core only needs the
//! current view and projection (OpenGL clip conventions, as `cgmath` builds them)
//! and the viewport, to project and unproject canvas positions for picking.

use cgmath::{
    EuclideanSpace, InnerSpace, Matrix4, Point3, SquareMatrix, Vector3, Vector4, ortho,
};

use crate::{context::Viewport, data_structures::ray::Ray};

/// Maps OpenGL clip depth `-1..1` to the `0..1` range wgpu expects.
#[rustfmt::skip]
pub const OPENGL_TO_WGPU_MATRIX: Matrix4<f64> = Matrix4::new(
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 0.5, 0.0,
    0.0, 0.0, 0.5, 1.0,
);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraFrame {
    pub view: Matrix4<f64>,
    pub projection: Matrix4<f64>,
    pub viewport: Viewport,
}

impl CameraFrame {
    pub fn new(view: Matrix4<f64>, projection: Matrix4<f64>, viewport: Viewport) -> Self {
        Self {
            view,
            projection,
            viewport,
        }
    }

    /// Perspective camera at `eye` looking at `target`, y up.
    pub fn look_at(
        eye: Point3<f64>,
        target: Point3<f64>,
        fovy_degrees: f64,
        near: f64,
        far: f64,
        viewport: Viewport,
    ) -> Self {
        let view = Matrix4::look_at_rh(eye, target, Vector3::unit_y());
        let projection =
            cgmath::perspective(cgmath::Deg(fovy_degrees), viewport.aspect(), near, far);
        Self::new(view, projection, viewport)
    }

    /// Orthographic 1x1 camera looking down `ray`, used to pick along explicit rays.
    /// `half_extent` is the half width of the single pixel in world units.
    pub fn along_ray(ray: &Ray, half_extent: f64, far: f64) -> Self {
        let up = if ray.direction.y.abs() > 0.99 {
            Vector3::unit_z()
        } else {
            Vector3::unit_y()
        };
        let view = Matrix4::look_at_rh(ray.origin, ray.origin + ray.direction, up);
        let projection = ortho(
            -half_extent,
            half_extent,
            -half_extent,
            half_extent,
            0.0,
            far.max(f64::EPSILON),
        );
        Self::new(view, projection, Viewport::new(1, 1))
    }

    pub fn view_projection(&self) -> Matrix4<f64> {
        self.projection * self.view
    }

    /// Eye position recovered from the inverse view matrix.
    pub fn eye(&self) -> Point3<f64> {
        self.view
            .invert()
            .map(|inverse| Point3::from_vec(inverse.w.truncate()))
            .unwrap_or_else(Point3::origin)
    }

    /// Normalized device coordinates of a canvas position (pixel centers at `.5`).
    pub fn canvas_to_ndc(&self, canvas_pos: [f64; 2]) -> (f64, f64) {
        let w = self.viewport.width.max(1) as f64;
        let h = self.viewport.height.max(1) as f64;
        (2.0 * canvas_pos[0] / w - 1.0, 1.0 - 2.0 * canvas_pos[1] / h)
    }

    /// World point for NDC `(x, y)` and OpenGL depth `z` in `-1..1`.
    pub fn unproject(&self, ndc: Vector3<f64>) -> Option<Point3<f64>> {
        let inverse = self.view_projection().invert()?;
        let p = inverse * Vector4::new(ndc.x, ndc.y, ndc.z, 1.0);
        if p.w.abs() < f64::EPSILON {
            return None;
        }
        Some(Point3::new(p.x / p.w, p.y / p.w, p.z / p.w))
    }

    /// Canvas position and OpenGL depth of a world point.
    pub fn project(&self, point: Point3<f64>) -> Option<([f64; 2], f64)> {
        let clip = self.view_projection() * point.to_homogeneous();
        if clip.w.abs() < f64::EPSILON {
            return None;
        }
        let ndc = clip.truncate() / clip.w;
        let w = self.viewport.width as f64;
        let h = self.viewport.height as f64;
        Some(([(ndc.x + 1.0) * 0.5 * w, (1.0 - ndc.y) * 0.5 * h], ndc.z))
    }

    /// Ray from the near plane through `canvas_pos` towards the far plane.
    pub fn ray_through(&self, canvas_pos: [f64; 2]) -> Option<Ray> {
        let (x, y) = self.canvas_to_ndc(canvas_pos);
        let near = self.unproject(Vector3::new(x, y, -1.0))?;
        let far = self.unproject(Vector3::new(x, y, 1.0))?;
        let direction = far - near;
        (direction.magnitude2() > 0.0).then(|| Ray::new(near, direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> CameraFrame {
        CameraFrame::look_at(
            Point3::new(0.0, 0.0, 10.0),
            Point3::new(0.0, 0.0, 0.0),
            60.0,
            0.1,
            100.0,
            Viewport::new(200, 100),
        )
    }

    #[test]
    fn center_ray_points_at_target() {
        let ray = camera().ray_through([100.0, 50.0]).unwrap();
        assert!((ray.direction - Vector3::new(0.0, 0.0, -1.0)).magnitude() < 1e-9);
    }

    #[test]
    fn project_then_ray_passes_through_point() {
        let camera = camera();
        let point = Point3::new(1.5, -0.5, 2.0);
        let (canvas, _) = camera.project(point).unwrap();
        let ray = camera.ray_through(canvas).unwrap();
        let to_point = point - ray.origin;
        let off_axis = to_point - ray.direction * to_point.dot(ray.direction);
        assert!(off_axis.magnitude() < 1e-9);
    }

    #[test]
    fn eye_is_recovered_from_view() {
        let eye = camera().eye();
        assert!((eye - Point3::new(0.0, 0.0, 10.0)).magnitude() < 1e-9);
    }

    #[test]
    fn ray_camera_projects_ray_to_its_single_pixel() {
        let ray = Ray::new(Point3::new(5.0, 5.0, 5.0), Vector3::new(-1.0, -1.0, -1.0));
        let camera = CameraFrame::along_ray(&ray, 0.01, 100.0);
        let (canvas, _) = camera.project(ray.point_at(3.0)).unwrap();
        assert!((canvas[0] - 0.5).abs() < 1e-9);
        assert!((canvas[1] - 0.5).abs() < 1e-9);
    }
}
