//! Third-octave magnitude filter bank
//!
//! Operates on a magnitude spectrum of 31 third-octave bands. Two
//! realizations exist: a linear-phase FIR designed by frequency sampling with
//! log-frequency interpolation between band centers, and a chain of five
//! peaking biquads (10th order) fitted to octave-wide magnitude averages.
//! Either way, magnitude updates crossfade internally over one block.

use num_complex::Complex;
use realfft::RealFftPlanner;
use std::f64::consts::PI;

use aur_core::{
    AurError, AurResult, NUM_THIRD_OCTAVE_BANDS, Sample, THIRD_OCTAVE_CENTER_FREQUENCIES,
};

use crate::fade;

/// Requested filter-bank realization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterBankType {
    #[default]
    FirSplineLinearPhase,
    IirBurgOrder4,
    IirBurgOrder10,
    IirBiquadsOrder10,
}

impl FilterBankType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "fir_spline_linear_phase" => Some(Self::FirSplineLinearPhase),
            "iir_burg_order4" => Some(Self::IirBurgOrder4),
            "iir_burg_order10" => Some(Self::IirBurgOrder10),
            "iir_biquads_order10" => Some(Self::IirBiquadsOrder10),
            _ => None,
        }
    }
}

/// FIR tap count of the linear-phase realization
const FIR_LENGTH: usize = 128;
/// Frequency-sampling grid size for the FIR design
const FIR_DESIGN_SIZE: usize = 512;
/// Number of biquad sections in the IIR realization
const NUM_BIQUADS: usize = 5;

/// Third-octave magnitude filter
pub enum ThirdOctaveFilterBank {
    Fir(FirFilterBank),
    Iir(IirFilterBank),
}

impl ThirdOctaveFilterBank {
    pub fn new(
        bank_type: FilterBankType,
        sample_rate: f64,
        block_length: usize,
    ) -> AurResult<Self> {
        match bank_type {
            FilterBankType::FirSplineLinearPhase => {
                Ok(Self::Fir(FirFilterBank::new(sample_rate, block_length)))
            }
            FilterBankType::IirBiquadsOrder10 => {
                Ok(Self::Iir(IirFilterBank::new(sample_rate, block_length)))
            }
            FilterBankType::IirBurgOrder4 | FilterBankType::IirBurgOrder10 => {
                Err(AurError::NotImplemented(
                    "Burg IIR filter bank realizations are not available".into(),
                ))
            }
        }
    }

    /// Flat unit magnitudes
    pub fn set_identity(&mut self) {
        self.set_magnitudes(&[1.0; NUM_THIRD_OCTAVE_BANDS]);
    }

    /// Stage new band magnitudes; applied with a crossfade on the next block
    pub fn set_magnitudes(&mut self, magnitudes: &[Sample; NUM_THIRD_OCTAVE_BANDS]) {
        match self {
            Self::Fir(f) => f.set_magnitudes(magnitudes),
            Self::Iir(f) => f.set_magnitudes(magnitudes),
        }
    }

    pub fn process(&mut self, input: &[Sample], output: &mut [Sample]) {
        match self {
            Self::Fir(f) => f.process(input, output),
            Self::Iir(f) => f.process(input, output),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Self::Fir(f) => f.reset(),
            Self::Iir(f) => f.reset(),
        }
    }
}

/// Interpolate 31 band magnitudes onto an arbitrary frequency, linear over
/// log-frequency between band centers, flat beyond the outermost bands
fn interpolate_magnitude(magnitudes: &[Sample; NUM_THIRD_OCTAVE_BANDS], freq: f64) -> f64 {
    let centers = &THIRD_OCTAVE_CENTER_FREQUENCIES;
    if freq <= centers[0] {
        return magnitudes[0] as f64;
    }
    if freq >= centers[NUM_THIRD_OCTAVE_BANDS - 1] {
        return magnitudes[NUM_THIRD_OCTAVE_BANDS - 1] as f64;
    }
    for band in 0..NUM_THIRD_OCTAVE_BANDS - 1 {
        if freq <= centers[band + 1] {
            let t = (freq.ln() - centers[band].ln()) / (centers[band + 1].ln() - centers[band].ln());
            return magnitudes[band] as f64 * (1.0 - t) + magnitudes[band + 1] as f64 * t;
        }
    }
    magnitudes[NUM_THIRD_OCTAVE_BANDS - 1] as f64
}

// ═══════════════════════════════════════════════════════════════════════════
// FIR REALIZATION
// ═══════════════════════════════════════════════════════════════════════════

pub struct FirFilterBank {
    sample_rate: f64,
    block_length: usize,
    taps_current: Vec<f64>,
    taps_next: Option<Vec<f64>>,
    /// Input history for the direct convolution, newest first
    history: Vec<f64>,
    // Design scratch kept to avoid re-planning per update
    design_scratch: DesignScratch,
}

struct DesignScratch {
    ifft: std::sync::Arc<dyn realfft::ComplexToReal<f64>>,
    spectrum: Vec<Complex<f64>>,
    time: Vec<f64>,
}

impl FirFilterBank {
    pub fn new(sample_rate: f64, block_length: usize) -> Self {
        let mut planner = RealFftPlanner::<f64>::new();
        let ifft = planner.plan_fft_inverse(FIR_DESIGN_SIZE);
        let mut bank = Self {
            sample_rate,
            block_length,
            taps_current: vec![0.0; FIR_LENGTH],
            taps_next: None,
            history: vec![0.0; FIR_LENGTH],
            design_scratch: DesignScratch {
                spectrum: vec![Complex::new(0.0, 0.0); FIR_DESIGN_SIZE / 2 + 1],
                time: vec![0.0; FIR_DESIGN_SIZE],
                ifft,
            },
        };
        // Start as identity
        let identity = bank.design(&[1.0; NUM_THIRD_OCTAVE_BANDS]);
        bank.taps_current = identity;
        bank
    }

    /// Frequency-sampling design: zero-phase magnitude response, IFFT,
    /// circular shift to linear phase, Hann window
    fn design(&mut self, magnitudes: &[Sample; NUM_THIRD_OCTAVE_BANDS]) -> Vec<f64> {
        let scratch = &mut self.design_scratch;
        let bins = scratch.spectrum.len();
        for (bin, slot) in scratch.spectrum.iter_mut().enumerate() {
            let freq = bin as f64 * self.sample_rate / FIR_DESIGN_SIZE as f64;
            *slot = Complex::new(interpolate_magnitude(magnitudes, freq), 0.0);
        }
        // realfft requires Im == 0 at DC and Nyquist, already satisfied
        let _ = scratch
            .ifft
            .process(&mut scratch.spectrum, &mut scratch.time);

        let norm = 1.0 / FIR_DESIGN_SIZE as f64;
        let half = FIR_LENGTH / 2;
        let mut taps = vec![0.0; FIR_LENGTH];
        for (k, tap) in taps.iter_mut().enumerate() {
            // Shift the zero-phase response so the peak sits at the center tap
            let src = (k + FIR_DESIGN_SIZE - half) % FIR_DESIGN_SIZE;
            let window = 0.5 - 0.5 * (2.0 * PI * k as f64 / (FIR_LENGTH - 1) as f64).cos();
            *tap = scratch.time[src] * norm * window;
        }
        taps
    }

    pub fn set_magnitudes(&mut self, magnitudes: &[Sample; NUM_THIRD_OCTAVE_BANDS]) {
        let taps = self.design(magnitudes);
        self.taps_next = Some(taps);
    }

    pub fn process(&mut self, input: &[Sample], output: &mut [Sample]) {
        let n = self.block_length.min(input.len()).min(output.len());
        let fade_pending = self.taps_next.is_some();

        for i in 0..n {
            self.history.rotate_right(1);
            self.history[0] = input[i] as f64;

            let mut acc = 0.0;
            for (tap, h) in self.taps_current.iter().zip(&self.history) {
                acc += tap * h;
            }

            if fade_pending {
                let mut acc_next = 0.0;
                if let Some(next) = &self.taps_next {
                    for (tap, h) in next.iter().zip(&self.history) {
                        acc_next += tap * h;
                    }
                }
                let a = fade::cosine_square_in(i, n) as f64;
                acc = acc * (1.0 - a) + acc_next * a;
            }
            output[i] = acc as Sample;
        }

        if let Some(next) = self.taps_next.take() {
            self.taps_current = next;
        }
    }

    pub fn reset(&mut self) {
        self.history.fill(0.0);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// IIR REALIZATION
// ═══════════════════════════════════════════════════════════════════════════

/// TDF-II biquad section
#[derive(Debug, Clone, Copy, Default)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    pub fn identity() -> Self {
        Self {
            b0: 1.0,
            ..Default::default()
        }
    }

    pub fn lowpass(freq: f64, q: f64, sample_rate: f64) -> Self {
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = (1.0 - cos_omega) / 2.0;
        let b1 = 1.0 - cos_omega;
        let b2 = (1.0 - cos_omega) / 2.0;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    pub fn highpass(freq: f64, q: f64, sample_rate: f64) -> Self {
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = (1.0 + cos_omega) / 2.0;
        let b1 = -(1.0 + cos_omega);
        let b2 = (1.0 + cos_omega) / 2.0;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// Constant-peak-gain bandpass
    pub fn bandpass(freq: f64, q: f64, sample_rate: f64) -> Self {
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = alpha;
        let b1 = 0.0;
        let b2 = -alpha;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// Filter a buffer in place
    pub fn process_buffer(&mut self, data: &mut [Sample]) {
        for sample in data {
            *sample = self.tick(*sample as f64) as Sample;
        }
    }

    pub fn peaking(freq: f64, q: f64, gain_db: f64, sample_rate: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = 1.0 + alpha * a;
        let b1 = -2.0 * cos_omega;
        let b2 = 1.0 - alpha * a;
        let a0 = 1.0 + alpha / a;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha / a;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    fn tick(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    fn clear(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// Five peaking sections, two chains crossfaded on magnitude changes
pub struct IirFilterBank {
    sample_rate: f64,
    block_length: usize,
    chains: [[Biquad; NUM_BIQUADS]; 2],
    /// Broadband gain per chain (median band magnitude)
    gains: [f64; 2],
    active: usize,
    fade_pending: bool,
}

impl IirFilterBank {
    pub fn new(sample_rate: f64, block_length: usize) -> Self {
        Self {
            sample_rate,
            block_length,
            chains: [[Biquad::identity(); NUM_BIQUADS]; 2],
            gains: [1.0; 2],
            active: 0,
            fade_pending: false,
        }
    }

    /// Section center frequencies: one per two-octave region
    const SECTION_CENTERS: [f64; NUM_BIQUADS] = [62.5, 250.0, 1000.0, 4000.0, 16000.0];

    fn fit(&self, magnitudes: &[Sample; NUM_THIRD_OCTAVE_BANDS]) -> ([Biquad; NUM_BIQUADS], f64) {
        // Reference gain: magnitude at the middle of the spectrum
        let reference = interpolate_magnitude(magnitudes, 500.0).max(1e-6);

        let mut sections = [Biquad::identity(); NUM_BIQUADS];
        for (section, center) in sections.iter_mut().zip(Self::SECTION_CENTERS) {
            let mag = interpolate_magnitude(magnitudes, center).max(1e-6);
            let gain_db = 20.0 * (mag / reference).log10();
            // Wide sections covering two octaves each
            *section = Biquad::peaking(center, 0.6, gain_db, self.sample_rate);
        }
        (sections, reference)
    }

    pub fn set_magnitudes(&mut self, magnitudes: &[Sample; NUM_THIRD_OCTAVE_BANDS]) {
        let standby = 1 - self.active;
        let (sections, gain) = self.fit(magnitudes);
        self.chains[standby] = sections;
        self.gains[standby] = gain;
        self.fade_pending = true;
    }

    pub fn process(&mut self, input: &[Sample], output: &mut [Sample]) {
        let n = self.block_length.min(input.len()).min(output.len());
        let standby = 1 - self.active;

        for i in 0..n {
            let x = input[i] as f64;

            let mut y_active = x;
            for section in &mut self.chains[self.active] {
                y_active = section.tick(y_active);
            }
            y_active *= self.gains[self.active];

            // Keep the standby chain warm so exchanges start from settled state
            let mut y_standby = x;
            for section in &mut self.chains[standby] {
                y_standby = section.tick(y_standby);
            }
            y_standby *= self.gains[standby];

            output[i] = if self.fade_pending {
                let a = fade::cosine_square_in(i, n) as f64;
                (y_active * (1.0 - a) + y_standby * a) as Sample
            } else {
                y_active as Sample
            };
        }

        if self.fade_pending {
            self.active = standby;
            self.fade_pending = false;
        }
    }

    pub fn reset(&mut self) {
        for chain in &mut self.chains {
            for section in chain {
                section.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sample_rate: f64, n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / sample_rate).sin() as Sample)
            .collect()
    }

    fn rms(data: &[Sample]) -> f64 {
        (data.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / data.len() as f64).sqrt()
    }

    #[test]
    fn test_burg_types_not_implemented() {
        assert!(ThirdOctaveFilterBank::new(FilterBankType::IirBurgOrder10, 44100.0, 128).is_err());
    }

    #[test]
    fn test_interpolate_magnitude_at_centers() {
        let mut mags = [1.0; NUM_THIRD_OCTAVE_BANDS];
        mags[17] = 0.25; // 1 kHz band
        assert!((interpolate_magnitude(&mags, 1000.0) - 0.25).abs() < 1e-9);
        assert!((interpolate_magnitude(&mags, 20.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fir_identity_passes_signal() {
        let mut bank =
            ThirdOctaveFilterBank::new(FilterBankType::FirSplineLinearPhase, 44100.0, 256).unwrap();
        bank.set_identity();

        let input = sine(1000.0, 44100.0, 256);
        let mut output = vec![0.0; 256];
        // Run several blocks to pass the group delay
        for _ in 0..4 {
            bank.process(&input, &mut output);
        }
        let gain = rms(&output) / rms(&input);
        assert!((gain - 1.0).abs() < 0.15, "identity gain was {gain}");
    }

    #[test]
    fn test_fir_attenuation_applies() {
        let mut bank =
            ThirdOctaveFilterBank::new(FilterBankType::FirSplineLinearPhase, 44100.0, 256).unwrap();
        // Attenuate everything to -20 dB
        bank.set_magnitudes(&[0.1; NUM_THIRD_OCTAVE_BANDS]);

        let input = sine(1000.0, 44100.0, 256);
        let mut output = vec![0.0; 256];
        for _ in 0..4 {
            bank.process(&input, &mut output);
        }
        let gain = rms(&output) / rms(&input);
        assert!((gain - 0.1).abs() < 0.05, "attenuated gain was {gain}");
    }

    #[test]
    fn test_crossfade_is_bounded() {
        let mut bank =
            ThirdOctaveFilterBank::new(FilterBankType::FirSplineLinearPhase, 44100.0, 256).unwrap();
        bank.set_identity();

        let input = vec![0.5; 256];
        let mut output = vec![0.0; 256];
        for _ in 0..2 {
            bank.process(&input, &mut output);
        }

        // Violent magnitude change mid-stream
        bank.set_magnitudes(&[0.01; NUM_THIRD_OCTAVE_BANDS]);
        bank.process(&input, &mut output);
        for &s in &output {
            assert!(s.abs() <= 0.75, "transition sample {s} exceeds input bound");
        }
    }

    #[test]
    fn test_iir_identity_and_attenuation() {
        let mut bank =
            ThirdOctaveFilterBank::new(FilterBankType::IirBiquadsOrder10, 44100.0, 256).unwrap();
        bank.set_identity();

        let input = sine(1000.0, 44100.0, 256);
        let mut output = vec![0.0; 256];
        for _ in 0..4 {
            bank.process(&input, &mut output);
        }
        let gain = rms(&output) / rms(&input);
        assert!((gain - 1.0).abs() < 0.2, "identity gain was {gain}");

        bank.set_magnitudes(&[0.1; NUM_THIRD_OCTAVE_BANDS]);
        for _ in 0..4 {
            bank.process(&input, &mut output);
        }
        let gain = rms(&output) / rms(&input);
        assert!((gain - 0.1).abs() < 0.08, "attenuated gain was {gain}");
    }
}
