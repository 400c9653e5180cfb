//! Crossfade envelopes
//!
//! Cosine-square pairs sum to exactly one at every point, which keeps the
//! blended signal free of level dips during exchanges.

use aur_core::Sample;

/// Fade-in weight at position `i` of a ramp of `length` samples
#[inline]
pub fn cosine_square_in(i: usize, length: usize) -> Sample {
    if length == 0 {
        return 1.0;
    }
    let phase = (i + 1) as f64 / length as f64 * std::f64::consts::FRAC_PI_2;
    let s = phase.sin();
    (s * s) as Sample
}

/// Fade-out weight at position `i`; complement of `cosine_square_in`
#[inline]
pub fn cosine_square_out(i: usize, length: usize) -> Sample {
    1.0 - cosine_square_in(i, length)
}

/// Linear fade-in weight
#[inline]
pub fn linear_in(i: usize, length: usize) -> Sample {
    if length == 0 {
        return 1.0;
    }
    ((i + 1) as f64 / length as f64) as Sample
}

/// Linear fade-out weight
#[inline]
pub fn linear_out(i: usize, length: usize) -> Sample {
    1.0 - linear_in(i, length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_pair_sums_to_one() {
        for i in 0..64 {
            let sum = cosine_square_in(i, 64) + cosine_square_out(i, 64);
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_fade_endpoints() {
        assert!((cosine_square_in(63, 64) - 1.0).abs() < 1e-6);
        assert!(cosine_square_in(0, 64) < 0.01);
        assert!((linear_in(63, 64) - 1.0).abs() < 1e-6);
    }
}
