//! Rotation-order aware Euler angle composition.
//!
//! DSON nodes declare a per-joint `rotation_order` (one of six axis
//! permutations). An order of `XYZ` means the X rotation is applied first,
//! then Y, then Z, so the composed matrix is `Rz * Ry * Rx` for column
//! vectors. Using the wrong order produces a subtly wrong pose, so the
//! order travels with every node instance rather than being assumed global.

use glam::{Mat3, Mat4, Vec3};

/// The six Euler axis orders recognized by the source format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum RotationOrder {
    #[default]
    Xyz,
    Xzy,
    Yxz,
    Yzx,
    Zxy,
    Zyx,
}

impl RotationOrder {
    /// Parse an order from its document spelling (e.g. `"YZX"`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "XYZ" => Some(Self::Xyz),
            "XZY" => Some(Self::Xzy),
            "YXZ" => Some(Self::Yxz),
            "YZX" => Some(Self::Yzx),
            "ZXY" => Some(Self::Zxy),
            "ZYX" => Some(Self::Zyx),
            _ => None,
        }
    }

    /// The document spelling of this order.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Xyz => "XYZ",
            Self::Xzy => "XZY",
            Self::Yxz => "YXZ",
            Self::Yzx => "YZX",
            Self::Zxy => "ZXY",
            Self::Zyx => "ZYX",
        }
    }

    /// Build a rotation matrix from Euler angles in radians.
    ///
    /// The first axis in the order name is applied first, so for `XYZ`
    /// the result is `Rz * Ry * Rx`.
    pub fn to_mat3(self, angles: Vec3) -> Mat3 {
        let rx = Mat3::from_rotation_x(angles.x);
        let ry = Mat3::from_rotation_y(angles.y);
        let rz = Mat3::from_rotation_z(angles.z);
        match self {
            Self::Xyz => rz * ry * rx,
            Self::Xzy => ry * rz * rx,
            Self::Yxz => rz * rx * ry,
            Self::Yzx => rx * rz * ry,
            Self::Zxy => ry * rx * rz,
            Self::Zyx => rx * ry * rz,
        }
    }

    /// Same as [`to_mat3`](Self::to_mat3) but as a 4x4 matrix.
    pub fn to_mat4(self, angles: Vec3) -> Mat4 {
        Mat4::from_mat3(self.to_mat3(angles))
    }
}
