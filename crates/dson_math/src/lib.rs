// Re-export glam for convenience
pub use glam::*;

// DSON math types
mod euler;
mod roll;
mod transform;

pub use euler::RotationOrder;
pub use roll::{mat3_to_vec_roll, roll_from_quat, vec_roll_to_mat3, wrap_angle};
pub use transform::{scale_matrix, Mat4Ext};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec3_creation() {
        let v = Vec3::new(1.0, 2.0, 3.0);
        assert_eq!(v.x, 1.0);
        assert_eq!(v.y, 2.0);
        assert_eq!(v.z, 3.0);
    }

    #[test]
    fn test_rotation_order_roundtrip() {
        for name in ["XYZ", "XZY", "YXZ", "YZX", "ZXY", "ZYX"] {
            let order = RotationOrder::parse(name).unwrap();
            assert_eq!(order.as_str(), name);
        }
    }
}
