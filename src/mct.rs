//! Multiple component transforms (ISO/IEC 15444-1 G.2).
//!
//! Applied across the first three tile components before the wavelet
//! stage: the reversible transform (RCT) on integers for the 5/3 path,
//! the irreversible BT.601 transform (ICT) on floats for the 9/7 path.

/// Norms of the reversible transform basis, per output component.
const RCT_NORMS: [f64; 3] = [1.732, 0.8292, 0.8292];

/// Norms of the irreversible transform basis, per output component.
const ICT_NORMS: [f64; 3] = [1.732, 1.805, 1.573];

/// Forward reversible transform, in place. Exactly invertible in
/// integer arithmetic for any input.
pub fn rct_forward(c0: &mut [i32], c1: &mut [i32], c2: &mut [i32]) {
    for ((r, g), b) in c0.iter_mut().zip(c1.iter_mut()).zip(c2.iter_mut()) {
        let y = (*r + 2 * *g + *b) >> 2;
        let u = *b - *g;
        let v = *r - *g;
        *r = y;
        *g = u;
        *b = v;
    }
}

/// Inverse reversible transform, in place.
pub fn rct_inverse(c0: &mut [i32], c1: &mut [i32], c2: &mut [i32]) {
    for ((y, u), v) in c0.iter_mut().zip(c1.iter_mut()).zip(c2.iter_mut()) {
        let g = *y - ((*u + *v) >> 2);
        let r = *v + g;
        let b = *u + g;
        *y = r;
        *u = g;
        *v = b;
    }
}

/// Forward irreversible transform, in place.
pub fn ict_forward(c0: &mut [f32], c1: &mut [f32], c2: &mut [f32]) {
    for ((r, g), b) in c0.iter_mut().zip(c1.iter_mut()).zip(c2.iter_mut()) {
        let y = 0.299 * *r + 0.587 * *g + 0.114 * *b;
        let u = -0.16875 * *r - 0.331260 * *g + 0.5 * *b;
        let v = 0.5 * *r - 0.41869 * *g - 0.08131 * *b;
        *r = y;
        *g = u;
        *b = v;
    }
}

/// Inverse irreversible transform, in place.
pub fn ict_inverse(c0: &mut [f32], c1: &mut [f32], c2: &mut [f32]) {
    for ((y, u), v) in c0.iter_mut().zip(c1.iter_mut()).zip(c2.iter_mut()) {
        let r = *y + 1.402 * *v;
        let g = *y - 0.34413 * *u - 0.71414 * *v;
        let b = *y + 1.772 * *u;
        *y = r;
        *u = g;
        *v = b;
    }
}

/// Norm of the transform basis for a component, used when weighting
/// distortion estimates.
pub fn norm(compno: usize, reversible: bool) -> f64 {
    debug_assert!(compno < 3);
    if reversible {
        RCT_NORMS[compno]
    } else {
        ICT_NORMS[compno]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg_values(n: usize, range: i32) -> Vec<i32> {
        let mut state = 0x2F9E_u32;
        (0..n)
            .map(|_| {
                state = state.wrapping_mul(1103515245).wrapping_add(12345);
                (state >> 8) as i32 % range - range / 2
            })
            .collect()
    }

    #[test]
    fn test_rct_round_trip_is_exact() {
        let mut r = lcg_values(512, 512);
        let mut g = lcg_values(512, 300);
        let mut b = lcg_values(512, 700);
        let (r0, g0, b0) = (r.clone(), g.clone(), b.clone());
        rct_forward(&mut r, &mut g, &mut b);
        rct_inverse(&mut r, &mut g, &mut b);
        assert_eq!(r, r0);
        assert_eq!(g, g0);
        assert_eq!(b, b0);
    }

    #[test]
    fn test_rct_decorrelates_grey() {
        // A grey pixel maps to luma only.
        let mut r = vec![100];
        let mut g = vec![100];
        let mut b = vec![100];
        rct_forward(&mut r, &mut g, &mut b);
        assert_eq!((r[0], g[0], b[0]), (100, 0, 0));
    }

    #[test]
    fn test_ict_round_trip_is_close() {
        let src = lcg_values(512, 512);
        let mut r: Vec<f32> = src.iter().map(|&v| v as f32).collect();
        let mut g: Vec<f32> = src.iter().rev().map(|&v| v as f32 * 0.5).collect();
        let mut b: Vec<f32> = src.iter().map(|&v| v as f32 * -0.25).collect();
        let (r0, g0, b0) = (r.clone(), g.clone(), b.clone());
        ict_forward(&mut r, &mut g, &mut b);
        ict_inverse(&mut r, &mut g, &mut b);
        for i in 0..r.len() {
            assert!((r[i] - r0[i]).abs() < 1e-2);
            assert!((g[i] - g0[i]).abs() < 1e-2);
            assert!((b[i] - b0[i]).abs() < 1e-2);
        }
    }

    #[test]
    fn test_norms() {
        assert!((norm(0, true) - 1.732).abs() < 1e-9);
        assert!((norm(2, false) - 1.573).abs() < 1e-9);
    }
}
