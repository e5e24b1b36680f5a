//! Bone roll math.
//!
//! A bone's rest orientation is a rotation matrix whose Y axis points from
//! head to tail; the remaining degree of freedom (the twist about that axis)
//! is the roll. These helpers convert between the matrix form and the
//! (direction, roll) form.

use glam::{Mat3, Quat, Vec3};
use std::f32::consts::PI;

/// Build a bone orientation matrix whose Y axis is `vec`, twisted by `roll`.
///
/// The untwisted frame is the minimal rotation taking +Y onto `vec`; a
/// vector anti-parallel to +Y uses a 180 degree turn about X so the result
/// is deterministic.
pub fn vec_roll_to_mat3(vec: Vec3, roll: f32) -> Mat3 {
    let nor = vec.normalize_or_zero();
    if nor == Vec3::ZERO {
        return Mat3::IDENTITY;
    }
    let align = if nor.y < -1.0 + 1e-6 {
        Quat::from_rotation_x(PI)
    } else {
        Quat::from_rotation_arc(Vec3::Y, nor)
    };
    Mat3::from_quat(Quat::from_axis_angle(nor, roll) * align)
}

/// Decompose a bone orientation matrix into its Y axis and roll angle.
pub fn mat3_to_vec_roll(mat: Mat3) -> (Vec3, f32) {
    let vec = mat.y_axis;
    let vecmat = vec_roll_to_mat3(vec, 0.0);
    let rollmat = vecmat.inverse() * mat;
    // rollmat is a twist about Y: element (0,2) is sin, (0,0) is cos.
    let roll = rollmat.z_axis.x.atan2(rollmat.x_axis.x);
    (vec, roll)
}

/// Extract the twist-about-Y angle from a rotation.
///
/// Degenerates to pi when the rotation is a half turn with no usable
/// scalar part.
pub fn roll_from_quat(quat: Quat) -> f32 {
    if quat.w.abs() < 1e-4 {
        PI
    } else {
        2.0 * (quat.y / quat.w).atan()
    }
}

/// Wrap an angle into the half-open interval `(-pi, pi]`.
pub fn wrap_angle(mut angle: f32) -> f32 {
    while angle > PI {
        angle -= 2.0 * PI;
    }
    while angle <= -PI {
        angle += 2.0 * PI;
    }
    angle
}
