//! 3D vectors, quaternions, and oriented poses
//!
//! Coordinate convention follows OpenGL: the default view direction is -Z and
//! the default up direction is +Y. Right is view × up.

use serde::{Deserialize, Serialize};

/// 3D vector (also used as a position)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn length(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Normalize to unit length; falls back to -Z when degenerate
    pub fn normalized(&self) -> Self {
        let len = self.length();
        if len < 1e-12 {
            return Self::new(0.0, 0.0, -1.0);
        }
        Self::new(self.x / len, self.y / len, self.z / len)
    }

    #[inline]
    pub fn dot(&self, other: &Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    #[inline]
    pub fn cross(&self, other: &Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn distance_to(&self, other: &Self) -> f64 {
        (*other - *self).length()
    }

    pub fn lerp(&self, other: &Self, t: f64) -> Self {
        Self::new(
            self.x + (other.x - self.x) * t,
            self.y + (other.y - self.y) * t,
            self.z + (other.z - self.z) * t,
        )
    }
}

impl std::ops::Add for Vec3 {
    type Output = Vec3;
    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::ops::Mul<f64> for Vec3 {
    type Output = Vec3;
    fn mul(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Unit quaternion orientation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    /// Rotation of `angle_deg` degrees around an axis
    pub fn from_axis_angle(axis: Vec3, angle_deg: f64) -> Self {
        let half = angle_deg.to_radians() * 0.5;
        let a = axis.normalized();
        let s = half.sin();
        Self::new(a.x * s, a.y * s, a.z * s, half.cos())
    }

    pub fn normalized(&self) -> Self {
        let n = (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt();
        if n < 1e-12 {
            return Self::IDENTITY;
        }
        Self::new(self.x / n, self.y / n, self.z / n, self.w / n)
    }

    /// Rotate a vector by this quaternion
    pub fn rotate(&self, v: Vec3) -> Vec3 {
        // v' = v + 2*q_vec x (q_vec x v + w*v)
        let q = Vec3::new(self.x, self.y, self.z);
        let t = q.cross(&v) * 2.0;
        v + t * self.w + q.cross(&t)
    }

    /// Build the orientation whose view/up frame matches the given vectors
    ///
    /// View and up are renormalized defensively; up is re-orthogonalized
    /// against view.
    pub fn from_view_up(view: Vec3, up: Vec3) -> Self {
        let v = view.normalized();
        let mut u = up.normalized();

        // Remove any view component from up
        let proj = v * u.dot(&v);
        u = (u - proj).normalized();
        if u.length() < 1e-12 {
            u = Vec3::new(0.0, 1.0, 0.0);
        }

        let r = v.cross(&u); // right-hand frame: right = view x up

        // Column-major rotation matrix [right, up, -view]
        let (m00, m01, m02) = (r.x, u.x, -v.x);
        let (m10, m11, m12) = (r.y, u.y, -v.y);
        let (m20, m21, m22) = (r.z, u.z, -v.z);

        // Shepperd's method
        let trace = m00 + m11 + m22;
        let q = if trace > 0.0 {
            let s = (trace + 1.0).sqrt() * 2.0;
            Self::new((m21 - m12) / s, (m02 - m20) / s, (m10 - m01) / s, 0.25 * s)
        } else if m00 > m11 && m00 > m22 {
            let s = (1.0 + m00 - m11 - m22).sqrt() * 2.0;
            Self::new(0.25 * s, (m01 + m10) / s, (m02 + m20) / s, (m21 - m12) / s)
        } else if m11 > m22 {
            let s = (1.0 + m11 - m00 - m22).sqrt() * 2.0;
            Self::new((m01 + m10) / s, 0.25 * s, (m12 + m21) / s, (m02 - m20) / s)
        } else {
            let s = (1.0 + m22 - m00 - m11).sqrt() * 2.0;
            Self::new((m02 + m20) / s, (m12 + m21) / s, 0.25 * s, (m10 - m01) / s)
        };
        q.normalized()
    }

    /// Extract the view/up frame of this orientation
    pub fn to_view_up(&self) -> (Vec3, Vec3) {
        let view = self.rotate(Vec3::new(0.0, 0.0, -1.0));
        let up = self.rotate(Vec3::new(0.0, 1.0, 0.0));
        (view.normalized(), up.normalized())
    }

    /// Yaw angle of the head-above-torso rotation in degrees
    ///
    /// Decomposes the rotation around the +Y axis, the only component that
    /// HATO-aware HRIR data resolves.
    pub fn yaw_deg(&self) -> f64 {
        let (view, _) = self.to_view_up();
        // Angle of the view projection in the horizontal plane, relative to -Z
        (-view.x).atan2(-view.z).to_degrees()
    }
}

/// Oriented pose: position plus orientation
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quat,
}

impl Pose {
    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
        }
    }

    pub fn from_view_up(position: Vec3, view: Vec3, up: Vec3) -> Self {
        Self {
            position,
            orientation: Quat::from_view_up(view, up),
        }
    }

    pub fn view(&self) -> Vec3 {
        self.orientation.to_view_up().0
    }

    pub fn up(&self) -> Vec3 {
        self.orientation.to_view_up().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_vec_close(a: Vec3, b: Vec3) {
        assert!((a.x - b.x).abs() < 1e-9, "{a:?} vs {b:?}");
        assert!((a.y - b.y).abs() < 1e-9, "{a:?} vs {b:?}");
        assert!((a.z - b.z).abs() < 1e-9, "{a:?} vs {b:?}");
    }

    #[test]
    fn test_identity_view_up() {
        let q = Quat::from_view_up(Vec3::new(0.0, 0.0, -1.0), Vec3::new(0.0, 1.0, 0.0));
        let (view, up) = q.to_view_up();
        assert_vec_close(view, Vec3::new(0.0, 0.0, -1.0));
        assert_vec_close(up, Vec3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn test_view_up_round_trip() {
        let view = Vec3::new(1.0, 0.0, -1.0).normalized();
        let up = Vec3::new(0.0, 1.0, 0.0);
        let q = Quat::from_view_up(view, up);
        let (v2, u2) = q.to_view_up();
        assert_vec_close(v2, view);
        // Up gets re-orthogonalized but stays in the view/up plane
        assert!(u2.dot(&v2).abs() < 1e-9);
        assert!(u2.dot(&up) > 0.9);
    }

    #[test]
    fn test_rotate_yaw() {
        // 90 degrees around +Y turns -Z view into -X
        let q = Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), 90.0);
        let v = q.rotate(Vec3::new(0.0, 0.0, -1.0));
        assert_vec_close(v, Vec3::new(-1.0, 0.0, 0.0));
        assert!((q.yaw_deg() - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_cross_right_hand() {
        let view = Vec3::new(0.0, 0.0, -1.0);
        let up = Vec3::new(0.0, 1.0, 0.0);
        assert_vec_close(view.cross(&up), Vec3::new(1.0, 0.0, 0.0));
    }
}
