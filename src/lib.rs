//! JPEG 2000 Part 1 core coding system: wavelet transforms, context
//! coding and post-compression rate allocation, without the codestream
//! marker and container syntax around them.
//!
//! [`Encoder`] turns an [`Image`] into one packet stream per tile under
//! [`CodingParameters`]; [`Decoder`] reverses it, optionally discarding
//! resolution levels or quality layers on the way.

pub mod bio;
pub mod dwt;
pub mod error;
pub mod image;
pub mod mct;
pub mod mqc;
pub mod params;
pub mod raw;
pub mod t1;
pub mod t2;
pub mod tcd;
pub mod tgt;
pub mod tile;

pub use error::J2kError;
pub use image::{Image, ImageComponent};
pub use params::{
    CodingParameters, ComponentParameters, DecoderOptions, QuantizationStyle, RateControl,
    WaveletFilter,
};
pub use tcd::{DecodeStatus, Decoder, Encoder};

/// `a / b` rounded up, `b` nonzero.
pub(crate) fn ceil_div(a: u32, b: u32) -> u32 {
    a.div_ceil(b)
}

/// `a / 2^b` rounded up; exact for negative `a` as well.
pub(crate) fn ceil_div_pow2(a: i32, b: i32) -> i32 {
    (a + (1 << b) - 1) >> b
}

/// `a / 2^b` rounded toward negative infinity.
pub(crate) fn floor_div_pow2(a: i32, b: i32) -> i32 {
    a >> b
}

/// Position of the highest set bit, `a > 0`.
pub(crate) fn floor_log2(a: i32) -> i32 {
    debug_assert!(a > 0);
    31 - a.leading_zeros() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_helpers() {
        assert_eq!(ceil_div(7, 2), 4);
        assert_eq!(ceil_div(8, 2), 4);
        assert_eq!(ceil_div_pow2(5, 1), 3);
        assert_eq!(ceil_div_pow2(9, 0), 9);
        assert_eq!(ceil_div_pow2(-4, 3), 0);
        assert_eq!(floor_div_pow2(7, 1), 3);
        assert_eq!(floor_div_pow2(-1, 1), -1);
        assert_eq!(floor_log2(1), 0);
        assert_eq!(floor_log2(511), 8);
        assert_eq!(floor_log2(512), 9);
    }
}
