//! Forward and inverse discrete wavelet transforms.
//!
//! Both filter banks operate in place on a packed resolution pyramid: after each
//! decomposition level the low band occupies the leading rows/columns of the
//! level rectangle and the three detail bands the remainder, so the same tile
//! buffer serves every level. Line parity (`cas`) follows the subsampled grid
//! origin, which is how odd tile origins keep even/odd sample roles straight.
//!
//! The module also owns the subband weighting norms and the quantization step
//! synthesis derived from them.

use crate::params::{ComponentParameters, QuantizationStyle, StepSize, WaveletFilter};
use crate::{ceil_div_pow2, floor_log2};

/// L2 norms of the 5/3 synthesis basis vectors, per orientation and level.
const NORMS_53: [[f64; 10]; 4] = [
    [1.000, 1.500, 2.750, 5.375, 10.68, 21.34, 42.67, 85.33, 170.7, 341.3],
    [1.038, 1.592, 2.919, 5.703, 11.33, 22.64, 45.25, 90.48, 180.9, 0.0],
    [1.038, 1.592, 2.919, 5.703, 11.33, 22.64, 45.25, 90.48, 180.9, 0.0],
    [0.7186, 0.9218, 1.586, 3.043, 6.019, 12.01, 24.00, 47.97, 95.93, 0.0],
];

/// L2 norms of the 9/7 synthesis basis vectors, per orientation and level.
const NORMS_97: [[f64; 10]; 4] = [
    [1.000, 1.965, 4.177, 8.403, 16.90, 33.84, 67.69, 135.3, 270.6, 540.9],
    [2.022, 3.989, 8.355, 17.04, 34.27, 68.63, 137.3, 274.6, 549.0, 0.0],
    [2.022, 3.989, 8.355, 17.04, 34.27, 68.63, 137.3, 274.6, 549.0, 0.0],
    [2.080, 3.865, 8.307, 17.18, 34.71, 69.59, 139.3, 278.6, 557.2, 0.0],
];

/// Bounds of resolution `resno` of a component rectangle with `num_res` levels.
pub fn resolution_bounds(
    x0: i32,
    y0: i32,
    x1: i32,
    y1: i32,
    num_res: u32,
    resno: u32,
) -> (i32, i32, i32, i32) {
    let shift = (num_res - 1 - resno) as i32;
    (
        ceil_div_pow2(x0, shift),
        ceil_div_pow2(y0, shift),
        ceil_div_pow2(x1, shift),
        ceil_div_pow2(y1, shift),
    )
}

/// Log2 gain of a subband: detail bands of the reversible filter grow by one
/// bit per high-pass direction, the normalized 9/7 bands do not.
pub fn band_gain(reversible: bool, orient: u32) -> u32 {
    if !reversible {
        return 0;
    }
    match orient {
        0 => 0,
        1 | 2 => 1,
        _ => 2,
    }
}

/// Synthesis basis norm for a subband, used as the distortion weight of one
/// quantization step in that band.
pub fn band_norm(reversible: bool, orient: u32, level: u32) -> f64 {
    let table = if reversible { &NORMS_53 } else { &NORMS_97 };
    let cap = if orient == 0 { 9 } else { 8 };
    table[orient as usize][(level as usize).min(cap)]
}

/// Derives the per-band quantization step sizes for one component.
///
/// Reversible components carry no quantization and encode step 1.0; the 9/7
/// path scales each band by the reciprocal of its basis norm so a unit error
/// contributes roughly equal distortion everywhere.
pub fn explicit_step_sizes(tccp: &ComponentParameters, prec: u32) -> Vec<StepSize> {
    let reversible = tccp.filter == WaveletFilter::Reversible53;
    let num_bands = tccp.num_bands() as u32;
    let mut sizes = Vec::with_capacity(num_bands as usize);
    for bandno in 0..num_bands {
        let resno = if bandno == 0 { 0 } else { (bandno - 1) / 3 + 1 };
        let orient = if bandno == 0 { 0 } else { (bandno - 1) % 3 + 1 };
        let level = tccp.num_resolutions - 1 - resno;
        let gain = band_gain(reversible, orient);
        let step = if tccp.quant_style == QuantizationStyle::None {
            1.0
        } else {
            (1u32 << gain) as f64 / band_norm(false, orient, level)
        };
        sizes.push(encode_stepsize(
            (step * 8192.0).floor() as i32,
            (prec + gain) as i32,
        ));
    }
    sizes
}

/// Packs a step size into the 11-bit mantissa / 5-bit exponent form.
fn encode_stepsize(stepsize: i32, numbps: i32) -> StepSize {
    let p = floor_log2(stepsize) - 13;
    let n = 11 - floor_log2(stepsize);
    let mant = (if n < 0 { stepsize >> -n } else { stepsize << n }) & 0x7ff;
    StepSize {
        expn: numbps - p,
        mant,
    }
}

/// Reconstructs the real step size from its packed form. `numbps` is the
/// nominal band depth, component precision plus band gain.
pub fn decode_stepsize(step: StepSize, numbps: i32) -> f32 {
    ((1.0 + step.mant as f64 / 2048.0) * ((numbps - step.expn) as f64).exp2()) as f32
}

/// Reversible 5/3 integer filter bank.
pub struct Dwt53;

impl Dwt53 {
    /// Full forward transform of one tile component, `num_res - 1` levels.
    ///
    /// `data` holds the component samples row-major with stride `x1 - x0`.
    pub fn forward(data: &mut [i32], x0: i32, y0: i32, x1: i32, y1: i32, num_res: u32) {
        forward_levels(data, x0, y0, x1, y1, num_res, Self::lift_forward);
    }

    /// Inverse transform synthesizing `decoded_res` of the `num_res` levels.
    pub fn inverse(
        data: &mut [i32],
        x0: i32,
        y0: i32,
        x1: i32,
        y1: i32,
        num_res: u32,
        decoded_res: u32,
    ) {
        inverse_levels(data, x0, y0, x1, y1, num_res, decoded_res, Self::lift_inverse);
    }

    fn lift_forward(a: &mut [i32], dn: i32, sn: i32, cas: i32) {
        if cas == 0 {
            if dn > 0 || sn > 1 {
                for i in 0..dn {
                    let t = (even(a, i, sn) + even(a, i + 1, sn)) >> 1;
                    a[(2 * i + 1) as usize] -= t;
                }
                for i in 0..sn {
                    let t = (odd(a, i - 1, dn) + odd(a, i, dn) + 2) >> 2;
                    a[(2 * i) as usize] += t;
                }
            }
        } else if sn == 0 && dn == 1 {
            // Lone detail sample on an odd-anchored line.
            a[0] *= 2;
        } else {
            for i in 0..dn {
                let t = (odd(a, i, sn) + odd(a, i - 1, sn)) >> 1;
                a[(2 * i) as usize] -= t;
            }
            for i in 0..sn {
                let t = (even(a, i, dn) + even(a, i + 1, dn) + 2) >> 2;
                a[(2 * i + 1) as usize] += t;
            }
        }
    }

    fn lift_inverse(a: &mut [i32], dn: i32, sn: i32, cas: i32) {
        if cas == 0 {
            if dn > 0 || sn > 1 {
                for i in 0..sn {
                    let t = (odd(a, i - 1, dn) + odd(a, i, dn) + 2) >> 2;
                    a[(2 * i) as usize] -= t;
                }
                for i in 0..dn {
                    let t = (even(a, i, sn) + even(a, i + 1, sn)) >> 1;
                    a[(2 * i + 1) as usize] += t;
                }
            }
        } else if sn == 0 && dn == 1 {
            a[0] /= 2;
        } else {
            for i in 0..sn {
                let t = (even(a, i, dn) + even(a, i + 1, dn) + 2) >> 2;
                a[(2 * i + 1) as usize] -= t;
            }
            for i in 0..dn {
                let t = (odd(a, i, sn) + odd(a, i - 1, sn)) >> 1;
                a[(2 * i) as usize] += t;
            }
        }
    }
}

/// Irreversible 9/7 floating-point filter bank.
pub struct Dwt97;

impl Dwt97 {
    const ALPHA: f32 = 1.586_134_3;
    const BETA: f32 = 0.052_980_118;
    const GAMMA: f32 = -0.882_911_1;
    const DELTA: f32 = -0.443_506_85;
    const K: f32 = 1.230_174_1;
    const INV_K: f32 = 0.812_893_07;

    /// Full forward transform of one tile component, `num_res - 1` levels.
    pub fn forward(data: &mut [f32], x0: i32, y0: i32, x1: i32, y1: i32, num_res: u32) {
        forward_levels(data, x0, y0, x1, y1, num_res, Self::lift_forward);
    }

    /// Inverse transform synthesizing `decoded_res` of the `num_res` levels.
    pub fn inverse(
        data: &mut [f32],
        x0: i32,
        y0: i32,
        x1: i32,
        y1: i32,
        num_res: u32,
        decoded_res: u32,
    ) {
        inverse_levels(data, x0, y0, x1, y1, num_res, decoded_res, Self::lift_inverse);
    }

    fn lift_forward(a: &mut [f32], dn: i32, sn: i32, cas: i32) {
        if cas == 0 {
            if dn > 0 || sn > 1 {
                for i in 0..dn {
                    let t = Self::ALPHA * (even(a, i, sn) + even(a, i + 1, sn));
                    a[(2 * i + 1) as usize] -= t;
                }
                for i in 0..sn {
                    let t = Self::BETA * (odd(a, i - 1, dn) + odd(a, i, dn));
                    a[(2 * i) as usize] -= t;
                }
                for i in 0..dn {
                    let t = Self::GAMMA * (even(a, i, sn) + even(a, i + 1, sn));
                    a[(2 * i + 1) as usize] -= t;
                }
                for i in 0..sn {
                    let t = Self::DELTA * (odd(a, i - 1, dn) + odd(a, i, dn));
                    a[(2 * i) as usize] -= t;
                }
                for i in 0..sn {
                    a[(2 * i) as usize] *= Self::INV_K;
                }
                for i in 0..dn {
                    a[(2 * i + 1) as usize] *= Self::K;
                }
            }
        } else if sn > 0 || dn > 1 {
            // Odd-anchored line: even positions hold details.
            for i in 0..dn {
                let t = Self::ALPHA * (odd(a, i, sn) + odd(a, i - 1, sn));
                a[(2 * i) as usize] -= t;
            }
            for i in 0..sn {
                let t = Self::BETA * (even(a, i, dn) + even(a, i + 1, dn));
                a[(2 * i + 1) as usize] -= t;
            }
            for i in 0..dn {
                let t = Self::GAMMA * (odd(a, i, sn) + odd(a, i - 1, sn));
                a[(2 * i) as usize] -= t;
            }
            for i in 0..sn {
                let t = Self::DELTA * (even(a, i, dn) + even(a, i + 1, dn));
                a[(2 * i + 1) as usize] -= t;
            }
            for i in 0..sn {
                a[(2 * i + 1) as usize] *= Self::INV_K;
            }
            for i in 0..dn {
                a[(2 * i) as usize] *= Self::K;
            }
        }
    }

    fn lift_inverse(a: &mut [f32], dn: i32, sn: i32, cas: i32) {
        if cas == 0 {
            if dn > 0 || sn > 1 {
                for i in 0..sn {
                    a[(2 * i) as usize] *= Self::K;
                }
                for i in 0..dn {
                    a[(2 * i + 1) as usize] *= Self::INV_K;
                }
                for i in 0..sn {
                    let t = Self::DELTA * (odd(a, i - 1, dn) + odd(a, i, dn));
                    a[(2 * i) as usize] += t;
                }
                for i in 0..dn {
                    let t = Self::GAMMA * (even(a, i, sn) + even(a, i + 1, sn));
                    a[(2 * i + 1) as usize] += t;
                }
                for i in 0..sn {
                    let t = Self::BETA * (odd(a, i - 1, dn) + odd(a, i, dn));
                    a[(2 * i) as usize] += t;
                }
                for i in 0..dn {
                    let t = Self::ALPHA * (even(a, i, sn) + even(a, i + 1, sn));
                    a[(2 * i + 1) as usize] += t;
                }
            }
        } else if sn > 0 || dn > 1 {
            for i in 0..sn {
                a[(2 * i + 1) as usize] *= Self::K;
            }
            for i in 0..dn {
                a[(2 * i) as usize] *= Self::INV_K;
            }
            for i in 0..sn {
                let t = Self::DELTA * (even(a, i, dn) + even(a, i + 1, dn));
                a[(2 * i + 1) as usize] += t;
            }
            for i in 0..dn {
                let t = Self::GAMMA * (odd(a, i, sn) + odd(a, i - 1, sn));
                a[(2 * i) as usize] += t;
            }
            for i in 0..sn {
                let t = Self::BETA * (even(a, i, dn) + even(a, i + 1, dn));
                a[(2 * i + 1) as usize] += t;
            }
            for i in 0..dn {
                let t = Self::ALPHA * (odd(a, i, sn) + odd(a, i - 1, sn));
                a[(2 * i) as usize] += t;
            }
        }
    }
}

/// Interleaved line access. Even slots are smooth samples on even-anchored
/// lines and details on odd-anchored ones; `n` is the count of the accessed
/// role and indices clamp to the line for boundary extension.
#[inline]
fn even<T: Copy>(a: &[T], i: i32, n: i32) -> T {
    a[(2 * i.clamp(0, n - 1)) as usize]
}

#[inline]
fn odd<T: Copy>(a: &[T], i: i32, n: i32) -> T {
    a[(2 * i.clamp(0, n - 1) + 1) as usize]
}

/// Runs the analysis levels finest to coarsest, columns before rows.
fn forward_levels<T: Copy + Default>(
    data: &mut [T],
    x0: i32,
    y0: i32,
    x1: i32,
    y1: i32,
    num_res: u32,
    lift: impl Fn(&mut [T], i32, i32, i32),
) {
    let w = (x1 - x0).max(0) as usize;
    let levels = num_res as i32 - 1;
    let mut line = vec![T::default(); (x1 - x0).max(y1 - y0).max(0) as usize];

    for i in 0..levels {
        let cur = (levels - i) as u32;
        let (cx0, cy0, cx1, cy1) = resolution_bounds(x0, y0, x1, y1, num_res, cur);
        let (px0, py0, px1, py1) = resolution_bounds(x0, y0, x1, y1, num_res, cur - 1);
        let rw = cx1 - cx0;
        let rh = cy1 - cy0;
        let cas_row = cx0 & 1;
        let cas_col = cy0 & 1;

        let sn = py1 - py0;
        let dn = rh - sn;
        for j in 0..rw as usize {
            for (k, slot) in line[..rh as usize].iter_mut().enumerate() {
                *slot = data[k * w + j];
            }
            lift(&mut line[..rh as usize], dn, sn, cas_col);
            for i in 0..sn {
                data[i as usize * w + j] = line[(2 * i + cas_col) as usize];
            }
            for i in 0..dn {
                data[(sn + i) as usize * w + j] = line[(2 * i + 1 - cas_col) as usize];
            }
        }

        let sn = px1 - px0;
        let dn = rw - sn;
        for j in 0..rh as usize {
            line[..rw as usize].copy_from_slice(&data[j * w..j * w + rw as usize]);
            lift(&mut line[..rw as usize], dn, sn, cas_row);
            for i in 0..sn {
                data[j * w + i as usize] = line[(2 * i + cas_row) as usize];
            }
            for i in 0..dn {
                data[j * w + (sn + i) as usize] = line[(2 * i + 1 - cas_row) as usize];
            }
        }
    }
}

/// Runs the synthesis levels coarsest to finest, rows before columns. Only the
/// first `decoded_res` resolutions are reconstructed; the rest of the pyramid
/// is left untouched.
fn inverse_levels<T: Copy + Default>(
    data: &mut [T],
    x0: i32,
    y0: i32,
    x1: i32,
    y1: i32,
    num_res: u32,
    decoded_res: u32,
    lift: impl Fn(&mut [T], i32, i32, i32),
) {
    let w = (x1 - x0).max(0) as usize;
    let (mut rx0, mut ry0, mut rx1, mut ry1) = resolution_bounds(x0, y0, x1, y1, num_res, 0);
    let mut rw = rx1 - rx0;
    let mut rh = ry1 - ry0;

    let (fx0, fy0, fx1, fy1) =
        resolution_bounds(x0, y0, x1, y1, num_res, decoded_res.saturating_sub(1));
    let mut line = vec![T::default(); (fx1 - fx0).max(fy1 - fy0).max(0) as usize];

    for resno in 1..decoded_res {
        (rx0, ry0, rx1, ry1) = resolution_bounds(x0, y0, x1, y1, num_res, resno);
        let sn_h = rw;
        let sn_v = rh;
        rw = rx1 - rx0;
        rh = ry1 - ry0;
        let dn_h = rw - sn_h;
        let dn_v = rh - sn_v;
        let cas_row = rx0 & 1;
        let cas_col = ry0 & 1;

        for j in 0..rh as usize {
            for i in 0..sn_h {
                line[(2 * i + cas_row) as usize] = data[j * w + i as usize];
            }
            for i in 0..dn_h {
                line[(2 * i + 1 - cas_row) as usize] = data[j * w + (sn_h + i) as usize];
            }
            lift(&mut line[..rw as usize], dn_h, sn_h, cas_row);
            data[j * w..j * w + rw as usize].copy_from_slice(&line[..rw as usize]);
        }

        for j in 0..rw as usize {
            for i in 0..sn_v {
                line[(2 * i + cas_col) as usize] = data[i as usize * w + j];
            }
            for i in 0..dn_v {
                line[(2 * i + 1 - cas_col) as usize] = data[(sn_v + i) as usize * w + j];
            }
            lift(&mut line[..rh as usize], dn_v, sn_v, cas_col);
            for (k, v) in line[..rh as usize].iter().enumerate() {
                data[k * w + j] = *v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ComponentParameters;

    fn next_sample(state: &mut u32) -> i32 {
        *state = state.wrapping_mul(1103515245).wrapping_add(12345);
        ((*state >> 16) & 0xFF) as i32 - 128
    }

    fn round_trip_53(x0: i32, y0: i32, x1: i32, y1: i32, num_res: u32) {
        let n = ((x1 - x0) * (y1 - y0)) as usize;
        let mut state = 0x1234_5678u32 ^ (x0 as u32) << 8 ^ y1 as u32;
        let original: Vec<i32> = (0..n).map(|_| next_sample(&mut state)).collect();
        let mut data = original.clone();
        Dwt53::forward(&mut data, x0, y0, x1, y1, num_res);
        Dwt53::inverse(&mut data, x0, y0, x1, y1, num_res, num_res);
        assert_eq!(data, original, "{x0},{y0},{x1},{y1} x{num_res}");
    }

    #[test]
    fn reversible_round_trips_even_grid() {
        round_trip_53(0, 0, 16, 16, 3);
        round_trip_53(0, 0, 64, 32, 5);
    }

    #[test]
    fn reversible_round_trips_odd_origins() {
        round_trip_53(3, 5, 16, 12, 3);
        round_trip_53(1, 1, 14, 14, 4);
        round_trip_53(7, 2, 20, 3, 2);
    }

    #[test]
    fn reversible_round_trips_degenerate_lines() {
        // Single row, single column, and a lone sample on an odd origin,
        // which exercises the doubled detail-sample path.
        round_trip_53(0, 3, 9, 4, 3);
        round_trip_53(7, 0, 8, 9, 3);
        round_trip_53(5, 5, 6, 6, 2);
        round_trip_53(5, 5, 7, 6, 2);
    }

    #[test]
    fn reversible_survives_full_depth_decomposition() {
        // 32 resolution levels on a line: the rectangles collapse to 1x1
        // well before the last level and the remainder must be no-ops.
        round_trip_53(0, 0, 1024, 1, 32);
        round_trip_53(1, 0, 514, 1, 32);
    }

    #[test]
    fn constant_signal_collects_in_low_band() {
        let mut data = vec![7i32; 64];
        Dwt53::forward(&mut data, 0, 0, 8, 8, 3);
        for y in 0..8 {
            for x in 0..8 {
                let expected = if x < 2 && y < 2 { 7 } else { 0 };
                assert_eq!(data[y * 8 + x], expected, "({x},{y})");
            }
        }
    }

    #[test]
    fn irreversible_round_trips_within_tolerance() {
        let mut state = 0xBEEF_CAFEu32;
        let original: Vec<f32> = (0..33 * 27).map(|_| next_sample(&mut state) as f32).collect();
        let mut data = original.clone();
        Dwt97::forward(&mut data, 3, 1, 36, 28, 4);
        Dwt97::inverse(&mut data, 3, 1, 36, 28, 4, 4);
        for (got, want) in data.iter().zip(&original) {
            assert!((got - want).abs() < 0.1, "{got} vs {want}");
        }
    }

    #[test]
    fn partial_synthesis_leaves_detail_bands_untouched() {
        let mut state = 1u32;
        let original: Vec<i32> = (0..16 * 16).map(|_| next_sample(&mut state)).collect();
        let mut data = original.clone();
        Dwt53::forward(&mut data, 0, 0, 16, 16, 3);
        let analyzed = data.clone();
        Dwt53::inverse(&mut data, 0, 0, 16, 16, 3, 2);
        // Everything outside the second resolution rectangle is still raw
        // analysis output.
        for y in 0..16 {
            for x in 0..16 {
                if x >= 8 || y >= 8 {
                    assert_eq!(data[y * 16 + x], analyzed[y * 16 + x]);
                }
            }
        }
    }

    #[test]
    fn reversible_step_sizes_have_empty_mantissa() {
        let tccp = ComponentParameters {
            num_resolutions: 2,
            ..ComponentParameters::default()
        };
        let sizes = explicit_step_sizes(&tccp, 8);
        let packed: Vec<(i32, i32)> = sizes.iter().map(|s| (s.expn, s.mant)).collect();
        assert_eq!(packed, [(8, 0), (9, 0), (9, 0), (10, 0)]);
    }

    #[test]
    fn irreversible_step_sizes_follow_band_norms() {
        let tccp = ComponentParameters {
            num_resolutions: 2,
            filter: WaveletFilter::Irreversible97,
            quant_style: QuantizationStyle::ScalarExpounded,
            ..ComponentParameters::default()
        };
        let sizes = explicit_step_sizes(&tccp, 8);
        let packed: Vec<(i32, i32)> = sizes.iter().map(|s| (s.expn, s.mant)).collect();
        assert_eq!(packed, [(9, 36), (10, 2003), (10, 2003), (10, 1890)]);

        let ll = decode_stepsize(sizes[0], 8);
        assert!((ll - 1.0 / 1.965).abs() < 1e-3);
    }

    #[test]
    fn gains_and_norms() {
        assert_eq!(band_gain(true, 0), 0);
        assert_eq!(band_gain(true, 1), 1);
        assert_eq!(band_gain(true, 2), 1);
        assert_eq!(band_gain(true, 3), 2);
        assert_eq!(band_gain(false, 3), 0);
        // Lookups past the table reuse the deepest entry.
        assert_eq!(band_norm(true, 0, 42), band_norm(true, 0, 9));
        assert_eq!(band_norm(false, 3, 42), band_norm(false, 3, 8));
    }
}
