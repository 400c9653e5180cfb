//! Uniformly-partitioned FIR convolver with a pooled filter store
//!
//! Overlap-save convolution with a partition size equal to the audio block
//! length. Filters live in a preallocated pool of frequency-domain slots:
//! `request_filter` -> `load` -> `exchange_filter` swaps the active impulse
//! response with a cosine-square crossfade, `release_filter` returns unused
//! slots. Gain changes ramp linearly across one block. All mutators are safe
//! on the audio thread: loading transforms into preallocated buffers and the
//! exchange itself is just an index swap.

use num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use std::sync::Arc;

use aur_core::Sample;

use crate::fade;

/// How `process` writes into the output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MixMode {
    #[default]
    Overwrite,
    /// Mix-add onto the existing content
    Add,
}

/// Handle to a filter slot inside a convolver's pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterHandle(usize);

/// One preallocated frequency-domain filter
struct FilterSlot {
    /// Partition spectra, each `block_length + 1` bins
    partitions: Vec<Vec<Complex<f32>>>,
    /// Valid partitions of the currently loaded response
    partitions_used: usize,
    in_use: bool,
}

/// Uniformly-partitioned overlap-save convolver
pub struct PartitionedConvolver {
    block_length: usize,
    fft_size: usize,
    max_partitions: usize,
    fft: Arc<dyn RealToComplex<f32>>,
    ifft: Arc<dyn ComplexToReal<f32>>,

    /// Frequency-delay line of recent input spectra (ring, newest at fdl_pos)
    fdl: Vec<Vec<Complex<f32>>>,
    fdl_pos: usize,
    /// Sliding input: previous block then current block
    input_window: Vec<f32>,

    filters: Vec<FilterSlot>,
    active: Option<FilterHandle>,
    /// Filter being faded out during an exchange
    fading_out: Option<FilterHandle>,
    exchange_fade_samples: usize,

    gain_current: f32,
    gain_target: f32,

    // Preallocated scratch
    fft_in: Vec<f32>,
    spectrum_acc: Vec<Complex<f32>>,
    ifft_out: Vec<f32>,
    block_old: Vec<f32>,
    fade_scratch: Vec<f32>,

    crop_warned: bool,
}

impl PartitionedConvolver {
    /// Convolver for `block_length`-sized blocks holding filters of up to
    /// `max_filter_length` samples in a pool of `num_filters` slots
    pub fn new(block_length: usize, max_filter_length: usize, num_filters: usize) -> Self {
        let fft_size = block_length * 2;
        let max_partitions = max_filter_length.div_ceil(block_length).max(1);

        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);
        let ifft = planner.plan_fft_inverse(fft_size);
        let bins = fft_size / 2 + 1;

        let filters = (0..num_filters.max(2))
            .map(|_| FilterSlot {
                partitions: (0..max_partitions)
                    .map(|_| vec![Complex::new(0.0, 0.0); bins])
                    .collect(),
                partitions_used: 0,
                in_use: false,
            })
            .collect();

        Self {
            block_length,
            fft_size,
            max_partitions,
            fft,
            ifft,
            fdl: (0..max_partitions)
                .map(|_| vec![Complex::new(0.0, 0.0); bins])
                .collect(),
            fdl_pos: 0,
            input_window: vec![0.0; fft_size],
            filters,
            active: None,
            fading_out: None,
            exchange_fade_samples: block_length,
            gain_current: 1.0,
            gain_target: 1.0,
            fft_in: vec![0.0; fft_size],
            spectrum_acc: vec![Complex::new(0.0, 0.0); bins],
            ifft_out: vec![0.0; fft_size],
            block_old: vec![0.0; block_length],
            fade_scratch: vec![0.0; block_length],
            crop_warned: false,
        }
    }

    pub fn block_length(&self) -> usize {
        self.block_length
    }

    /// Longest loadable impulse response in samples
    pub fn max_filter_length(&self) -> usize {
        self.max_partitions * self.block_length
    }

    /// Crossfade length for filter exchanges, clamped to one block
    pub fn set_exchange_fade_samples(&mut self, samples: usize) {
        self.exchange_fade_samples = samples.clamp(1, self.block_length);
    }

    /// Claim a free filter slot; None when the pool is exhausted
    pub fn request_filter(&mut self) -> Option<FilterHandle> {
        let active = self.active;
        let fading = self.fading_out;
        let idx = self.filters.iter().position(|f| !f.in_use).filter(|&i| {
            active != Some(FilterHandle(i)) && fading != Some(FilterHandle(i))
        })?;
        self.filters[idx].in_use = true;
        Some(FilterHandle(idx))
    }

    /// Transform an impulse response into a requested slot
    ///
    /// Longer responses than the convolver supports are cropped with one
    /// warning per convolver.
    pub fn load(&mut self, handle: FilterHandle, samples: &[Sample]) {
        let max_len = self.max_filter_length();
        let use_len = samples.len().min(max_len);
        if samples.len() > max_len && !self.crop_warned {
            log::warn!(
                "impulse response of {} samples cropped to {max_len}",
                samples.len()
            );
            self.crop_warned = true;
        }

        let slot = &mut self.filters[handle.0];
        let num_partitions = use_len.div_ceil(self.block_length).max(1);
        slot.partitions_used = num_partitions;

        for p in 0..num_partitions {
            let start = p * self.block_length;
            let end = (start + self.block_length).min(use_len);
            self.fft_in.fill(0.0);
            for (dst, &src) in self.fft_in[..end - start].iter_mut().zip(&samples[start..end]) {
                *dst = src;
            }
            let _ = self.fft.process(&mut self.fft_in, &mut slot.partitions[p]);
        }
    }

    /// Make a loaded filter the active one, crossfading from the old
    pub fn exchange_filter(&mut self, handle: FilterHandle) {
        // A still-fading previous filter is dropped immediately
        if let Some(old_fade) = self.fading_out.take() {
            self.filters[old_fade.0].in_use = false;
        }
        if let Some(old) = self.active.take() {
            self.fading_out = Some(old);
        }
        self.active = Some(handle);
    }

    /// Return an unused slot to the pool
    pub fn release_filter(&mut self, handle: FilterHandle) {
        if self.active == Some(handle) {
            self.active = None;
        }
        if self.fading_out == Some(handle) {
            self.fading_out = None;
        }
        self.filters[handle.0].in_use = false;
    }

    /// Stage a gain; applied as a linear ramp over the next block
    pub fn set_gain(&mut self, gain: f32) {
        self.gain_target = gain;
    }

    pub fn gain(&self) -> f32 {
        self.gain_target
    }

    /// Spectra sum for one filter over the current frequency-delay line
    fn accumulate(&mut self, handle: FilterHandle, out_block: &mut [f32]) {
        let slot = &self.filters[handle.0];
        self.spectrum_acc.fill(Complex::new(0.0, 0.0));

        for p in 0..slot.partitions_used {
            let fdl_idx = (self.fdl_pos + self.max_partitions - p) % self.max_partitions;
            let input_spec = &self.fdl[fdl_idx];
            for ((acc, &x), &h) in self
                .spectrum_acc
                .iter_mut()
                .zip(input_spec)
                .zip(&slot.partitions[p])
            {
                *acc += x * h;
            }
        }

        let _ = self
            .ifft
            .process(&mut self.spectrum_acc, &mut self.ifft_out);
        let norm = 1.0 / self.fft_size as f32;
        // Overlap-save: the second half is the valid convolution output
        for (dst, &src) in out_block
            .iter_mut()
            .zip(&self.ifft_out[self.block_length..])
        {
            *dst = src * norm;
        }
    }

    /// Convolve one block
    pub fn process(&mut self, input: &[Sample], output: &mut [Sample], mix: MixMode) {
        let n = self.block_length;

        // Slide the input window: previous block, then this block
        self.input_window.copy_within(n.., 0);
        for (dst, &src) in self.input_window[n..].iter_mut().zip(input.iter().take(n)) {
            *dst = src;
        }

        // Advance the FDL and store the new input spectrum
        self.fdl_pos = (self.fdl_pos + 1) % self.max_partitions;
        self.fft_in.copy_from_slice(&self.input_window);
        let mut spectrum = std::mem::take(&mut self.fdl[self.fdl_pos]);
        let _ = self.fft.process(&mut self.fft_in, &mut spectrum);
        self.fdl[self.fdl_pos] = spectrum;

        // New filter contribution
        let mut current = std::mem::take(&mut self.block_old);
        match self.active {
            Some(handle) => self.accumulate(handle, &mut current),
            None => current.fill(0.0),
        }

        // Crossfade against the outgoing filter during an exchange
        if let Some(old_handle) = self.fading_out.take() {
            let mut old_block = std::mem::take(&mut self.fade_scratch);
            self.accumulate(old_handle, &mut old_block);
            let fade_len = self.exchange_fade_samples.min(n);
            for i in 0..n {
                let (a_in, a_out) = if i < fade_len {
                    (
                        fade::cosine_square_in(i, fade_len),
                        fade::cosine_square_out(i, fade_len),
                    )
                } else {
                    (1.0, 0.0)
                };
                current[i] = current[i] * a_in + old_block[i] * a_out;
            }
            self.fade_scratch = old_block;
            self.filters[old_handle.0].in_use = false;
        }

        // Gain envelope and mixing
        let g0 = self.gain_current;
        let g1 = self.gain_target;
        for (i, out) in output.iter_mut().take(n).enumerate() {
            let g = g0 + (g1 - g0) * ((i + 1) as f32 / n as f32);
            let y = current[i] * g;
            match mix {
                MixMode::Overwrite => *out = y,
                MixMode::Add => *out += y,
            }
        }
        self.gain_current = self.gain_target;
        self.block_old = current;
    }

    /// Clear signal history, keep loaded filters
    pub fn reset_history(&mut self) {
        self.input_window.fill(0.0);
        for spec in &mut self.fdl {
            spec.fill(Complex::new(0.0, 0.0));
        }
        self.fdl_pos = 0;
        self.gain_current = self.gain_target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(len: usize, at: usize, amp: f32) -> Vec<Sample> {
        let mut v = vec![0.0; len];
        v[at] = amp;
        v
    }

    fn load_active(conv: &mut PartitionedConvolver, ir: &[Sample]) -> FilterHandle {
        let h = conv.request_filter().unwrap();
        conv.load(h, ir);
        conv.exchange_filter(h);
        h
    }

    #[test]
    fn test_dirac_ir_is_identity() {
        let mut conv = PartitionedConvolver::new(64, 256, 4);
        load_active(&mut conv, &delta(64, 0, 1.0));

        let input: Vec<Sample> = (0..64).map(|i| (i as Sample * 0.31).sin()).collect();
        let mut output = vec![0.0; 64];
        conv.process(&input, &mut output, MixMode::Overwrite);

        for (o, i) in output.iter().zip(&input) {
            assert!((o - i).abs() < 1e-4, "{o} vs {i}");
        }
    }

    #[test]
    fn test_delayed_dirac_shifts() {
        let mut conv = PartitionedConvolver::new(64, 256, 4);
        load_active(&mut conv, &delta(96, 80, 1.0)); // delay into second partition

        let mut output = vec![0.0; 64];
        let impulse = delta(64, 0, 1.0);
        let silence = vec![0.0; 64];

        conv.process(&impulse, &mut output, MixMode::Overwrite);
        conv.process(&silence, &mut output, MixMode::Overwrite);
        // Impulse delayed by 80 lands at sample 16 of block 1
        assert!((output[16] - 1.0).abs() < 1e-3, "got {}", output[16]);
    }

    #[test]
    fn test_gain_ramp_applies() {
        let mut conv = PartitionedConvolver::new(64, 64, 4);
        load_active(&mut conv, &delta(64, 0, 1.0));

        let input = vec![1.0; 64];
        let mut output = vec![0.0; 64];
        conv.process(&input, &mut output, MixMode::Overwrite);
        conv.process(&input, &mut output, MixMode::Overwrite);

        conv.set_gain(0.5);
        conv.process(&input, &mut output, MixMode::Overwrite);
        // Ramp ends at the target gain
        assert!((output[63] - 0.5).abs() < 1e-3);
        // Ramp starts near the old gain
        assert!(output[0] > 0.9);

        conv.process(&input, &mut output, MixMode::Overwrite);
        assert!(output.iter().all(|&s| (s - 0.5).abs() < 1e-3));
    }

    #[test]
    fn test_exchange_crossfade_bounded() {
        let mut conv = PartitionedConvolver::new(64, 64, 4);
        load_active(&mut conv, &delta(64, 0, 1.0));

        let input = vec![0.8; 64];
        let mut output = vec![0.0; 64];
        for _ in 0..2 {
            conv.process(&input, &mut output, MixMode::Overwrite);
        }

        // Exchange to a half-gain filter: the transition must stay within the
        // envelope of both filters
        let h = conv.request_filter().unwrap();
        conv.load(h, &delta(64, 0, 0.5));
        conv.exchange_filter(h);
        conv.process(&input, &mut output, MixMode::Overwrite);
        for &s in &output {
            assert!(s <= 0.8 + 1e-4 && s >= 0.4 - 1e-4, "transition sample {s}");
        }
        // Settles on the new filter
        conv.process(&input, &mut output, MixMode::Overwrite);
        assert!(output.iter().all(|&s| (s - 0.4).abs() < 1e-3));
    }

    #[test]
    fn test_filter_pool_exhaustion_and_release() {
        let mut conv = PartitionedConvolver::new(64, 64, 2);
        let a = conv.request_filter().unwrap();
        let b = conv.request_filter().unwrap();
        assert!(conv.request_filter().is_none());

        conv.release_filter(a);
        let c = conv.request_filter().unwrap();
        assert_eq!(c, a);
        conv.release_filter(b);
        conv.release_filter(c);
    }

    #[test]
    fn test_mix_add_accumulates() {
        let mut conv = PartitionedConvolver::new(64, 64, 4);
        load_active(&mut conv, &delta(64, 0, 1.0));

        let input = vec![0.25; 64];
        let mut output = vec![0.0; 64];
        for _ in 0..2 {
            conv.process(&input, &mut output, MixMode::Overwrite);
        }
        let mut mixed = vec![0.5; 64];
        conv.process(&input, &mut mixed, MixMode::Add);
        assert!(mixed.iter().all(|&s| (s - 0.75).abs() < 1e-3));
    }

    #[test]
    fn test_long_ir_cropped() {
        let mut conv = PartitionedConvolver::new(64, 128, 4);
        let h = conv.request_filter().unwrap();
        // 300 samples exceeds the 128-sample maximum
        conv.load(h, &vec![0.1; 300]);
        assert_eq!(conv.max_filter_length(), 128);
        conv.release_filter(h);
    }
}
