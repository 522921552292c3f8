//! Mesh transforms and the per-instance attribute record of instancing layers.
//!
//! Batching layers bake a mesh transform into vertex positions. Instancing layers keep
//! it per instance: the transform (relative to the layer origin) is packed into an
//! [`InstanceRaw`] and stepped once per instance by the vertex shader.

use std::ops::Mul;

use cgmath::{Matrix, Matrix3, Matrix4, One, Quaternion, SquareMatrix, Vector3};

/// Position, rotation (as quaternion) and scale of a mesh in model space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshTransform {
    pub position: Vector3<f64>,
    pub rotation: Quaternion<f64>,
    pub scale: Vector3<f64>,
}

impl MeshTransform {
    /// Identity transformation (no move, rotate, or scale).
    pub fn new() -> Self {
        Self {
            position: Vector3::new(0.0, 0.0, 0.0),
            rotation: Quaternion::one(),
            scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }

    pub fn with_rotation(mut self, rotation: Quaternion<f64>) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_scale(mut self, scale: Vector3<f64>) -> Self {
        self.scale = scale;
        self
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        Matrix4::from_translation(self.position)
            * Matrix4::from(self.rotation)
            * Matrix4::from_nonuniform_scale(self.scale.x, self.scale.y, self.scale.z)
    }
}

impl Default for MeshTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vector3<f64>> for MeshTransform {
    fn from(position: Vector3<f64>) -> Self {
        MeshTransform {
            position,
            ..Default::default()
        }
    }
}

/// Composes `self` as parent of `rhs`.
impl<'a, 'b> Mul<&'b MeshTransform> for &'a MeshTransform {
    type Output = MeshTransform;

    fn mul(self, rhs: &'b MeshTransform) -> Self::Output {
        let scaled_rhs_pos = Vector3::new(
            self.scale.x * rhs.position.x,
            self.scale.y * rhs.position.y,
            self.scale.z * rhs.position.z,
        );
        MeshTransform {
            position: self.position + (self.rotation * scaled_rhs_pos),
            rotation: self.rotation * rhs.rotation,
            scale: Vector3::new(
                self.scale.x * rhs.scale.x,
                self.scale.y * rhs.scale.y,
                self.scale.z * rhs.scale.z,
            ),
        }
    }
}

impl Mul<MeshTransform> for MeshTransform {
    type Output = Self;

    fn mul(self, rhs: MeshTransform) -> Self::Output {
        &self * &rhs
    }
}

/// Upper 3x3 of `matrix`, inverted and transposed, for transforming normals.
/// Falls back to the plain linear part for singular matrices.
pub fn normal_matrix(matrix: &Matrix4<f64>) -> Matrix3<f64> {
    let linear = Matrix3::from_cols(
        matrix.x.truncate(),
        matrix.y.truncate(),
        matrix.z.truncate(),
    );
    linear
        .invert()
        .map(|inverse| inverse.transpose())
        .unwrap_or(linear)
}

/**
 * The raw instance is the actual data stored on the GPU.
 *
 * `model` is relative to the layer origin, so its translation stays small enough
 * for 32-bit floats even in geo-referenced models.
 */
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRaw {
    pub model: [[f32; 4]; 4],
    pub normal: [[f32; 3]; 3],
}

impl InstanceRaw {
    pub fn from_matrix(relative: &Matrix4<f64>) -> Self {
        let model = relative.cast::<f32>().unwrap_or_else(Matrix4::identity);
        let normal = normal_matrix(relative)
            .cast::<f32>()
            .unwrap_or_else(Matrix3::identity);
        Self {
            model: model.into(),
            normal: normal.into(),
        }
    }
}

/// A negative determinant turns counter-clockwise triangles clockwise.
pub fn is_mirrored(matrix: &Matrix4<f64>) -> bool {
    matrix.determinant() < 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Deg, Rotation3};

    #[test]
    fn composed_transform_matches_matrix_product() {
        let parent = MeshTransform::from(Vector3::new(1.0, 2.0, 3.0))
            .with_rotation(Quaternion::from_angle_z(Deg(90.0)))
            .with_scale(Vector3::new(2.0, 2.0, 2.0));
        let child = MeshTransform::from(Vector3::new(1.0, 0.0, 0.0));
        let composed = (&parent * &child).to_matrix();
        let expected = parent.to_matrix() * child.to_matrix();
        for c in 0..4 {
            for r in 0..4 {
                assert!((composed[c][r] - expected[c][r]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn single_axis_flip_is_mirrored() {
        assert!(is_mirrored(&Matrix4::from_nonuniform_scale(-1.0, 1.0, 1.0)));
        assert!(!is_mirrored(&Matrix4::from_nonuniform_scale(-1.0, -1.0, 1.0)));
        assert!(!is_mirrored(&Matrix4::identity()));
    }

    #[test]
    fn normal_matrix_undoes_nonuniform_scale() {
        let m = Matrix4::from_nonuniform_scale(2.0, 1.0, 1.0);
        let n = normal_matrix(&m);
        assert!((n.x.x - 0.5).abs() < 1e-12);
        assert!((n.y.y - 1.0).abs() < 1e-12);
    }
}
