//! Relative geometry between two oriented entities
//!
//! Angles follow the directivity-data convention: azimuth in [0°, 360°)
//! measured from the view direction toward the right (view × up), elevation in
//! [-90°, 90°] from the horizontal plane toward up.

use crate::{Pose, Vec3};

/// Azimuth of `point` as seen from an oriented observer, degrees in [0, 360)
pub fn azimuth_on_target_deg(pos: &Vec3, view: &Vec3, up: &Vec3, point: &Vec3) -> f64 {
    let dir = (*point - *pos).normalized();
    let v = view.normalized();
    let u = up.normalized();
    let right = v.cross(&u);

    let az = dir.dot(&right).atan2(dir.dot(&v)).to_degrees();
    if az < 0.0 { az + 360.0 } else { az }
}

/// Elevation of `point` as seen from an observer, degrees in [-90, 90]
pub fn elevation_on_target_deg(pos: &Vec3, up: &Vec3, point: &Vec3) -> f64 {
    let dir = (*point - *pos).normalized();
    let u = up.normalized();
    dir.dot(&u).clamp(-1.0, 1.0).asin().to_degrees()
}

/// Relative metrics of a source-receiver pair
///
/// Both viewing directions are evaluated: the receiver-side angles select the
/// HRIR record, the source-side angles select the directivity record.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RelativeMetrics {
    /// Distance between source and receiver positions, meters
    pub distance: f64,
    /// Azimuth of the source in the receiver's frame, degrees
    pub azimuth_receiver_to_source: f64,
    /// Elevation of the source in the receiver's frame, degrees
    pub elevation_receiver_to_source: f64,
    /// Azimuth of the receiver in the source's frame, degrees
    pub azimuth_source_to_receiver: f64,
    /// Elevation of the receiver in the source's frame, degrees
    pub elevation_source_to_receiver: f64,
}

impl RelativeMetrics {
    /// Compute all metrics from two oriented poses
    pub fn calc(source: &Pose, receiver: &Pose) -> Self {
        let (s_view, s_up) = source.orientation.to_view_up();
        let (r_view, r_up) = receiver.orientation.to_view_up();

        Self {
            distance: source.position.distance_to(&receiver.position),
            azimuth_receiver_to_source: azimuth_on_target_deg(
                &receiver.position,
                &r_view,
                &r_up,
                &source.position,
            ),
            elevation_receiver_to_source: elevation_on_target_deg(
                &receiver.position,
                &r_up,
                &source.position,
            ),
            azimuth_source_to_receiver: azimuth_on_target_deg(
                &source.position,
                &s_view,
                &s_up,
                &receiver.position,
            ),
            elevation_source_to_receiver: elevation_on_target_deg(
                &source.position,
                &s_up,
                &receiver.position,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Quat;

    fn pose(x: f64, y: f64, z: f64) -> Pose {
        // Default frame: view -Z, up +Y
        Pose::new(Vec3::new(x, y, z), Quat::IDENTITY)
    }

    #[test]
    fn test_source_straight_ahead() {
        let receiver = pose(0.0, 0.0, 0.0);
        let source = pose(0.0, 0.0, -2.0);
        let m = RelativeMetrics::calc(&source, &receiver);
        assert!((m.distance - 2.0).abs() < 1e-9);
        assert!(m.azimuth_receiver_to_source.abs() < 1e-6);
        assert!(m.elevation_receiver_to_source.abs() < 1e-6);
    }

    #[test]
    fn test_source_to_the_right() {
        let receiver = pose(0.0, 0.0, 0.0);
        let source = pose(1.0, 0.0, 0.0);
        let m = RelativeMetrics::calc(&source, &receiver);
        assert!((m.azimuth_receiver_to_source - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_source_to_the_left_wraps() {
        let receiver = pose(0.0, 0.0, 0.0);
        let source = pose(-1.0, 0.0, 0.0);
        let m = RelativeMetrics::calc(&source, &receiver);
        assert!((m.azimuth_receiver_to_source - 270.0).abs() < 1e-6);
    }

    #[test]
    fn test_source_above() {
        let receiver = pose(0.0, 0.0, 0.0);
        let source = pose(0.0, 3.0, 0.0);
        let m = RelativeMetrics::calc(&source, &receiver);
        assert!((m.elevation_receiver_to_source - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_symmetry_facing_each_other() {
        // Receiver looks -Z at origin; source at (0,0,-2) looking back (+Z)
        let receiver = pose(0.0, 0.0, 0.0);
        let source = Pose::from_view_up(
            Vec3::new(0.0, 0.0, -2.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(0.0, 1.0, 0.0),
        );
        let m = RelativeMetrics::calc(&source, &receiver);
        assert!(m.azimuth_receiver_to_source.abs() < 1e-6);
        assert!(m.azimuth_source_to_receiver.abs() < 1e-6);
    }
}
