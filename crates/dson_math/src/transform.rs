// Transform utilities for Mat4
//
// Extends glam::Mat4 with convenience methods for scene composition.
// Note: glam::Mat4 already provides transform_point3() and inverse()

use glam::{Mat4, Vec3, Vec4};

/// Extension trait for Mat4 to provide additional transform utilities
pub trait Mat4Ext {
    /// Transform a vector in 3D space (applies rotation and scale, but NOT translation).
    /// Vectors have an implicit w=0 component.
    fn transform_vector3(&self, vector: Vec3) -> Vec3;

    /// Whether this matrix is within `eps` of the identity in its upper 3x4 block.
    fn is_near_identity(&self, eps: f32) -> bool;
}

impl Mat4Ext for Mat4 {
    fn transform_vector3(&self, vector: Vec3) -> Vec3 {
        // Transform as direction (w=0) - translation should not affect vectors
        let v4 = Vec4::new(vector.x, vector.y, vector.z, 0.0);
        let transformed = *self * v4;
        Vec3::new(transformed.x, transformed.y, transformed.z)
    }

    fn is_near_identity(&self, eps: f32) -> bool {
        let diff = *self - Mat4::IDENTITY;
        let mut maxelt = 0.0f32;
        for col in 0..4 {
            let c = diff.col(col);
            for row in 0..3 {
                maxelt = maxelt.max(c[row].abs());
            }
        }
        maxelt < eps
    }
}

/// Build a non-uniform scale matrix from per-axis factors.
pub fn scale_matrix(scale: Vec3) -> Mat4 {
    Mat4::from_scale(scale)
}
