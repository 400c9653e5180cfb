//! Real spherical harmonics for ambisonics encoding
//!
//! ACN channel ordering with SN3D normalization: channel index is
//! n·(n+1)+m for degree n and order m. An order-N basis spans (N+1)² channels.

/// Number of ambisonics channels for a given order
pub fn num_ambisonics_channels(order: usize) -> usize {
    (order + 1) * (order + 1)
}

/// Highest supported ambisonics order
pub const MAX_AMBISONICS_ORDER: usize = 7;

fn factorial(n: usize) -> f64 {
    (1..=n).map(|i| i as f64).product()
}

/// Associated Legendre P_n^m(x) without the Condon-Shortley phase
fn legendre(n: usize, m: usize, x: f64) -> f64 {
    // P_m^m by the standard recurrence
    let mut pmm = 1.0;
    if m > 0 {
        let somx2 = ((1.0 - x) * (1.0 + x)).max(0.0).sqrt();
        let mut fact = 1.0;
        for _ in 0..m {
            pmm *= fact * somx2;
            fact += 2.0;
        }
    }
    if n == m {
        return pmm;
    }

    let mut pmmp1 = x * (2.0 * m as f64 + 1.0) * pmm;
    if n == m + 1 {
        return pmmp1;
    }

    let mut pnm = 0.0;
    for k in (m + 2)..=n {
        pnm = (x * (2.0 * k as f64 - 1.0) * pmmp1 - (k as f64 + m as f64 - 1.0) * pmm)
            / (k as f64 - m as f64);
        pmm = pmmp1;
        pmmp1 = pnm;
    }
    pnm
}

/// SN3D normalization factor for degree n, order m
fn sn3d(n: usize, m: usize) -> f64 {
    let delta = if m == 0 { 1.0 } else { 0.0 };
    ((2.0 - delta) * factorial(n - m) / factorial(n + m)).sqrt()
}

/// Evaluate the real SH basis for a direction into `out`
///
/// `out` must hold (order+1)² values. Azimuth counts from the front toward
/// the right, elevation from the horizontal plane upward, both in degrees.
pub fn evaluate_sh_into(order: usize, azimuth_deg: f64, elevation_deg: f64, out: &mut [f64]) {
    let order = order.min(MAX_AMBISONICS_ORDER);
    debug_assert!(out.len() >= num_ambisonics_channels(order));

    let az = azimuth_deg.to_radians();
    let el = elevation_deg.to_radians();
    let sin_el = el.sin();

    for n in 0..=order {
        for m in -(n as i64)..=(n as i64) {
            let acn = n * (n + 1) + (n as i64 + m) as usize - n;
            let abs_m = m.unsigned_abs() as usize;
            let norm = sn3d(n, abs_m);
            let leg = legendre(n, abs_m, sin_el);
            let azimuthal = if m >= 0 {
                (abs_m as f64 * az).cos()
            } else {
                (abs_m as f64 * az).sin()
            };
            out[acn] = norm * leg * azimuthal;
        }
    }
}

/// Evaluate the real SH basis for a direction (allocating convenience form)
pub fn evaluate_sh(order: usize, azimuth_deg: f64, elevation_deg: f64) -> Vec<f64> {
    let mut out = vec![0.0; num_ambisonics_channels(order.min(MAX_AMBISONICS_ORDER))];
    evaluate_sh_into(order, azimuth_deg, elevation_deg, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_counts() {
        assert_eq!(num_ambisonics_channels(0), 1);
        assert_eq!(num_ambisonics_channels(1), 4);
        assert_eq!(num_ambisonics_channels(3), 16);
    }

    #[test]
    fn test_order_zero_is_constant() {
        for az in [0.0, 90.0, 215.0] {
            let sh = evaluate_sh(0, az, 30.0);
            assert!((sh[0] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_first_order_directions() {
        // ACN 1 = Y (left/right sine), ACN 2 = Z (up), ACN 3 = X (front)
        let front = evaluate_sh(1, 0.0, 0.0);
        assert!((front[3] - 1.0).abs() < 1e-9);
        assert!(front[1].abs() < 1e-9);
        assert!(front[2].abs() < 1e-9);

        let up = evaluate_sh(1, 0.0, 90.0);
        assert!((up[2] - 1.0).abs() < 1e-9);

        let right = evaluate_sh(1, 90.0, 0.0);
        assert!((right[1] - 1.0).abs() < 1e-9);
        assert!(right[3].abs() < 1e-9);
    }

    #[test]
    fn test_sn3d_bounded_by_one() {
        // SN3D-normalized components never exceed the W channel
        for order in 1..=4 {
            for az in (0..360).step_by(30) {
                for el in (-90..=90).step_by(30) {
                    let sh = evaluate_sh(order, az as f64, el as f64);
                    for v in &sh {
                        assert!(v.abs() <= 1.0 + 1e-9);
                    }
                }
            }
        }
    }
}
