//! Directivity and HRIR data contract
//!
//! Renderers consume directional filter data through this trait. Real
//! deployments load measured datasets on the control thread; the
//! `SphericalGridDirectivity` implementation synthesizes a plausible dataset
//! in memory for tests and demos.

use std::sync::Arc;

use crate::{AurError, AurResult, NUM_THIRD_OCTAVE_BANDS, Sample, SampleFrame};

/// Directional filter dataset (directivity or HRIR)
///
/// Record indices are stable for the lifetime of the handle, so callers can
/// detect "the direction moved to another record" by index comparison alone.
pub trait DirectivityData: Send + Sync {
    /// Record index closest to the given direction
    fn nearest_neighbour(&self, azimuth_deg: f64, elevation_deg: f64) -> usize;

    /// Third-octave magnitude spectrum of a record
    fn magnitudes(&self, record: usize) -> Option<[Sample; NUM_THIRD_OCTAVE_BANDS]>;

    /// Impulse response of a record into a (typically two-channel) frame
    fn hrir_by_index(&self, frame: &mut SampleFrame, record: usize, distance: f64)
    -> AurResult<()>;

    /// Impulse response for an arbitrary direction
    fn hrir(
        &self,
        frame: &mut SampleFrame,
        azimuth_deg: f64,
        elevation_deg: f64,
        distance: f64,
    ) -> AurResult<()> {
        let record = self.nearest_neighbour(azimuth_deg, elevation_deg);
        self.hrir_by_index(frame, record, distance)
    }

    /// Impulse response resolving head-above-torso orientation
    fn hrir_by_index_and_hato(
        &self,
        _frame: &mut SampleFrame,
        _record: usize,
        _hato_deg: f64,
    ) -> AurResult<()> {
        Err(AurError::NotImplemented(
            "dataset carries no head-above-torso dimension".into(),
        ))
    }

    /// Whether directions are a discrete grid (true) or continuous
    fn is_space_discrete(&self) -> bool;

    /// Impulse response length in samples
    fn filter_length(&self) -> usize;

    /// Number of output channels per record
    fn num_channels(&self) -> usize {
        2
    }
}

/// Shared handle to a loaded dataset
pub type DirectivityHandle = Arc<dyn DirectivityData>;

/// Synthetic dataset on a regular azimuth/elevation grid
///
/// HRIRs are modeled as a delayed impulse per ear: the interaural time
/// difference follows the Woodworth approximation for a spherical head, the
/// level difference is a broadband shadow term. Directivity magnitudes fall
/// off with the angle to the main axis. Good enough to make gains, delays,
/// and record switching observable in tests.
pub struct SphericalGridDirectivity {
    azimuth_step_deg: f64,
    elevation_step_deg: f64,
    num_azimuth: usize,
    num_elevation: usize,
    filter_length: usize,
    sample_rate: f64,
    /// Head radius in meters for the ITD model
    head_radius: f64,
    /// When false, all records are identity (omnidirectional)
    directional: bool,
}

impl SphericalGridDirectivity {
    /// Dataset with direction-dependent HRIRs
    pub fn binaural(sample_rate: f64, filter_length: usize) -> Arc<Self> {
        Arc::new(Self {
            azimuth_step_deg: 5.0,
            elevation_step_deg: 10.0,
            num_azimuth: 72,
            num_elevation: 19, // -90..=90 in 10 degree steps
            filter_length,
            sample_rate,
            head_radius: 0.0875,
            directional: true,
        })
    }

    /// Omnidirectional dataset: unit impulse on every channel, flat magnitudes
    pub fn omnidirectional(sample_rate: f64, filter_length: usize) -> Arc<Self> {
        Arc::new(Self {
            azimuth_step_deg: 5.0,
            elevation_step_deg: 10.0,
            num_azimuth: 72,
            num_elevation: 19,
            filter_length,
            sample_rate,
            head_radius: 0.0875,
            directional: false,
        })
    }

    fn record_direction(&self, record: usize) -> (f64, f64) {
        let az_idx = record % self.num_azimuth;
        let el_idx = record / self.num_azimuth;
        let azimuth = az_idx as f64 * self.azimuth_step_deg;
        let elevation = -90.0 + el_idx as f64 * self.elevation_step_deg;
        (azimuth, elevation)
    }

    /// Interaural time difference in seconds, positive when the right ear
    /// leads (source on the right)
    fn itd_seconds(&self, azimuth_deg: f64) -> f64 {
        let az = azimuth_deg.to_radians();
        // Woodworth: dt = r/c * (sin(theta) + theta) with theta folded to the
        // lateral angle
        let lateral = az.sin().asin();
        self.head_radius / crate::DEFAULT_SOUND_SPEED * (lateral.sin() + lateral)
    }
}

impl DirectivityData for SphericalGridDirectivity {
    fn nearest_neighbour(&self, azimuth_deg: f64, elevation_deg: f64) -> usize {
        let az = azimuth_deg.rem_euclid(360.0);
        let az_idx = ((az / self.azimuth_step_deg).round() as usize) % self.num_azimuth;
        let el = elevation_deg.clamp(-90.0, 90.0);
        let el_idx = (((el + 90.0) / self.elevation_step_deg).round() as usize)
            .min(self.num_elevation - 1);
        el_idx * self.num_azimuth + az_idx
    }

    fn magnitudes(&self, record: usize) -> Option<[Sample; NUM_THIRD_OCTAVE_BANDS]> {
        if record >= self.num_azimuth * self.num_elevation {
            return None;
        }
        if !self.directional {
            return Some([1.0; NUM_THIRD_OCTAVE_BANDS]);
        }

        let (azimuth, elevation) = self.record_direction(record);
        // Cosine lobe toward the main axis, stronger attenuation in the
        // higher bands
        let az = azimuth.to_radians();
        let el = elevation.to_radians();
        let on_axis = (az.cos() * el.cos()).clamp(-1.0, 1.0);
        let base = 0.5 + 0.5 * on_axis;

        let mut mags = [0.0; NUM_THIRD_OCTAVE_BANDS];
        for (band, slot) in mags.iter_mut().enumerate() {
            let tilt = band as f64 / (NUM_THIRD_OCTAVE_BANDS - 1) as f64;
            *slot = (base.powf(0.5 + tilt)) as Sample;
        }
        Some(mags)
    }

    fn hrir_by_index(
        &self,
        frame: &mut SampleFrame,
        record: usize,
        _distance: f64,
    ) -> AurResult<()> {
        if record >= self.num_azimuth * self.num_elevation {
            return Err(AurError::InvalidParameter(format!(
                "record index {record} out of range"
            )));
        }
        if frame.num_channels() < 2 || frame.len() < self.filter_length {
            frame.reinit(2, self.filter_length);
        }
        frame.zero();

        if !self.directional {
            frame.channel_mut(0).data_mut()[0] = 1.0;
            frame.channel_mut(1).data_mut()[0] = 1.0;
            return Ok(());
        }

        let (azimuth, _) = self.record_direction(record);
        let itd = self.itd_seconds(azimuth);
        let itd_samples = (itd.abs() * self.sample_rate).round() as usize;

        // Head shadow: the far ear is attenuated up to ~6 dB
        let az = azimuth.to_radians();
        let shadow = (0.5 + 0.5 * az.sin().abs()) as Sample;
        let near_gain: Sample = 1.0;
        let far_gain = 1.0 - 0.5 * shadow;

        let max_tap = self.filter_length - 1;
        let (left_delay, right_delay, left_gain, right_gain) = if itd >= 0.0 {
            // Source to the right: right ear leads
            (itd_samples.min(max_tap), 0, far_gain, near_gain)
        } else {
            (0, itd_samples.min(max_tap), near_gain, far_gain)
        };

        frame.channel_mut(0).data_mut()[left_delay] = left_gain;
        frame.channel_mut(1).data_mut()[right_delay] = right_gain;
        Ok(())
    }

    fn hrir_by_index_and_hato(
        &self,
        frame: &mut SampleFrame,
        record: usize,
        hato_deg: f64,
    ) -> AurResult<()> {
        // Rotating the head over the torso shifts the effective azimuth
        let (azimuth, elevation) = self.record_direction(record);
        let rotated = self.nearest_neighbour(azimuth - hato_deg, elevation);
        self.hrir_by_index(frame, rotated, 1.0)
    }

    fn is_space_discrete(&self) -> bool {
        true
    }

    fn filter_length(&self) -> usize {
        self.filter_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_neighbour_wraps() {
        let d = SphericalGridDirectivity::binaural(44100.0, 128);
        let front = d.nearest_neighbour(0.0, 0.0);
        let wrapped = d.nearest_neighbour(360.0, 0.0);
        assert_eq!(front, wrapped);
        let near = d.nearest_neighbour(2.0, 1.0);
        assert_eq!(front, near);
    }

    #[test]
    fn test_record_changes_with_direction() {
        let d = SphericalGridDirectivity::binaural(44100.0, 128);
        let front = d.nearest_neighbour(0.0, 0.0);
        let right = d.nearest_neighbour(90.0, 0.0);
        assert_ne!(front, right);
    }

    #[test]
    fn test_itd_sign() {
        let d = SphericalGridDirectivity::binaural(44100.0, 256);
        let mut frame = SampleFrame::new(2, 256);

        // Source to the right: left ear is delayed
        let record = d.nearest_neighbour(90.0, 0.0);
        d.hrir_by_index(&mut frame, record, 1.0).unwrap();
        let left_peak = frame
            .channel(0)
            .data()
            .iter()
            .position(|&s| s != 0.0)
            .unwrap();
        let right_peak = frame
            .channel(1)
            .data()
            .iter()
            .position(|&s| s != 0.0)
            .unwrap();
        assert!(left_peak > right_peak);
    }

    #[test]
    fn test_omnidirectional_identity() {
        let d = SphericalGridDirectivity::omnidirectional(44100.0, 64);
        let mags = d.magnitudes(0).unwrap();
        assert!(mags.iter().all(|&m| m == 1.0));

        let mut frame = SampleFrame::new(2, 64);
        d.hrir_by_index(&mut frame, 0, 1.0).unwrap();
        assert_eq!(frame.channel(0).data()[0], 1.0);
        assert_eq!(frame.channel(1).data()[0], 1.0);
        assert!(frame.channel(0).data()[1..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_directivity_magnitudes_fall_off_axis() {
        let d = SphericalGridDirectivity::binaural(44100.0, 128);
        let front = d.magnitudes(d.nearest_neighbour(0.0, 0.0)).unwrap();
        let back = d.magnitudes(d.nearest_neighbour(180.0, 0.0)).unwrap();
        assert!(front[10] > back[10]);
    }
}
