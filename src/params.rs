//! Coding parameters for the tile pipeline.
//!
//! These structs stand in for the content of already-parsed SIZ/COD/QCD
//! marker segments: whoever owns the container hands them over as plain
//! data, and the decoder treats them as read-only input.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::image::Image;
use crate::{J2kError, dwt};

/// Wavelet filter selection, ISO/IEC 15444-1 SPcod transformation byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum WaveletFilter {
    /// 9/7 irreversible filter (lossy path).
    Irreversible97 = 0,
    /// 5/3 reversible integer filter (lossless path).
    Reversible53 = 1,
}

/// Quantization style, ISO/IEC 15444-1 Sqcd low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum QuantizationStyle {
    /// No quantization (reversible path; exponents only).
    None = 0,
    /// Scalar quantization with an explicit step size per subband.
    ScalarExpounded = 2,
}

/// How quality layers are sized during rate allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RateControl {
    /// Each layer targets a compressed size in bytes (`layer_bytes`).
    DistoAlloc = 0,
    /// Each layer targets a distortion ratio in dB (`layer_ratios`).
    FixedQuality = 1,
}

/// Code-block style bits, ISO/IEC 15444-1 SPcod code-block style byte.
pub const CBLKSTY_LAZY: u8 = 0x01;
pub const CBLKSTY_RESET: u8 = 0x02;
pub const CBLKSTY_TERMALL: u8 = 0x04;
pub const CBLKSTY_VSC: u8 = 0x08;
pub const CBLKSTY_PTERM: u8 = 0x10;
pub const CBLKSTY_SEGSYM: u8 = 0x20;

/// Quantization step size as signalled in QCD/QCC: an exponent and an
/// 11-bit mantissa.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepSize {
    pub expn: i32,
    pub mant: i32,
}

/// Per-component coding parameters (the SPcod/SPcoc content).
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentParameters {
    /// Number of resolution levels (decomposition count + 1), 1..=32.
    pub num_resolutions: u32,
    /// log2 of the nominal code-block width, 2..=10.
    pub cblk_w_exp: u32,
    /// log2 of the nominal code-block height, 2..=10 (w+h <= 12).
    pub cblk_h_exp: u32,
    /// Code-block style bits (`CBLKSTY_*`).
    pub cblk_style: u8,
    pub filter: WaveletFilter,
    pub quant_style: QuantizationStyle,
    /// Guard bits in the magnitude budget, 1..=7.
    pub num_guard_bits: u32,
    /// Per-resolution log2 precinct widths; empty means maximal (15).
    pub precinct_w_exps: Vec<u32>,
    /// Per-resolution log2 precinct heights; empty means maximal (15).
    pub precinct_h_exps: Vec<u32>,
    /// Explicit per-band step sizes (LL, then HL/LH/HH per level).
    /// Left empty on the encode side, they are synthesized by `setup`.
    pub step_sizes: Vec<StepSize>,
}

impl Default for ComponentParameters {
    fn default() -> Self {
        Self {
            num_resolutions: 6,
            cblk_w_exp: 6,
            cblk_h_exp: 6,
            cblk_style: 0,
            filter: WaveletFilter::Reversible53,
            quant_style: QuantizationStyle::None,
            num_guard_bits: 2,
            precinct_w_exps: Vec::new(),
            precinct_h_exps: Vec::new(),
            step_sizes: Vec::new(),
        }
    }
}

impl ComponentParameters {
    /// log2 precinct width at a resolution level (15 when unspecified).
    pub fn precinct_w_exp(&self, resno: u32) -> u32 {
        self.precinct_w_exps
            .get(resno as usize)
            .copied()
            .unwrap_or(15)
    }

    /// log2 precinct height at a resolution level (15 when unspecified).
    pub fn precinct_h_exp(&self, resno: u32) -> u32 {
        self.precinct_h_exps
            .get(resno as usize)
            .copied()
            .unwrap_or(15)
    }

    /// Number of subbands across all resolution levels.
    pub fn num_bands(&self) -> usize {
        (3 * self.num_resolutions - 2) as usize
    }

    /// Fills `step_sizes` for the given component precision if the caller
    /// did not supply them.
    pub fn setup_step_sizes(&mut self, prec: u32) {
        if self.step_sizes.len() == self.num_bands() {
            return;
        }
        self.step_sizes = dwt::explicit_step_sizes(self, prec);
    }

    fn validate(&self) -> Result<(), J2kError> {
        if self.num_resolutions < 1 || self.num_resolutions > 32 {
            return Err(J2kError::InvalidParameter(
                "num_resolutions must be in 1..=32",
            ));
        }
        if self.cblk_w_exp < 2
            || self.cblk_w_exp > 10
            || self.cblk_h_exp < 2
            || self.cblk_h_exp > 10
            || self.cblk_w_exp + self.cblk_h_exp > 12
        {
            return Err(J2kError::InvalidParameter(
                "code-block exponents must be 2..=10 with w+h <= 12",
            ));
        }
        if self.num_guard_bits < 1 || self.num_guard_bits > 7 {
            return Err(J2kError::InvalidParameter("guard bits must be in 1..=7"));
        }
        for exps in [&self.precinct_w_exps, &self.precinct_h_exps] {
            if !exps.is_empty() && exps.len() != self.num_resolutions as usize {
                return Err(J2kError::InvalidParameter(
                    "precinct exponent list must cover every resolution",
                ));
            }
            for (resno, &e) in exps.iter().enumerate() {
                // Resolution 0 has no code-block subdivision of the
                // precinct, so exponent 0 is allowed there only.
                let min = if resno == 0 { 0 } else { 1 };
                if e < min || e > 15 {
                    return Err(J2kError::InvalidParameter(
                        "precinct exponents must be in 1..=15 (0 allowed at resolution 0)",
                    ));
                }
            }
        }
        if !self.step_sizes.is_empty() && self.step_sizes.len() != self.num_bands() {
            return Err(J2kError::InvalidParameter(
                "step size count must be 3 * num_resolutions - 2",
            ));
        }
        match (self.filter, self.quant_style) {
            (WaveletFilter::Reversible53, QuantizationStyle::ScalarExpounded) => Err(
                J2kError::InvalidParameter("reversible filter cannot use scalar quantization"),
            ),
            (WaveletFilter::Irreversible97, QuantizationStyle::None) => Err(
                J2kError::InvalidParameter("irreversible filter requires scalar quantization"),
            ),
            _ => Ok(()),
        }
    }
}

/// Image-wide coding parameters (the COD content plus the tile grid).
#[derive(Debug, Clone, PartialEq)]
pub struct CodingParameters {
    /// Horizontal offset of the tile grid on the reference grid.
    pub tx0: u32,
    /// Vertical offset of the tile grid on the reference grid.
    pub ty0: u32,
    /// Nominal tile width (0 means one tile covering the image).
    pub tdx: u32,
    /// Nominal tile height (0 means one tile covering the image).
    pub tdy: u32,
    /// Number of quality layers, 1..=100.
    pub num_layers: u32,
    pub rate_control: RateControl,
    /// DistoAlloc: target bytes per layer; 0 means "everything left".
    pub layer_bytes: Vec<f64>,
    /// FixedQuality: target PSNR-style ratio in dB per layer; 0 means
    /// "everything left".
    pub layer_ratios: Vec<f64>,
    /// Multiple-component transform on the first three components.
    pub mct: bool,
    /// One entry per image component.
    pub comps: Vec<ComponentParameters>,
}

impl Default for CodingParameters {
    fn default() -> Self {
        Self {
            tx0: 0,
            ty0: 0,
            tdx: 0,
            tdy: 0,
            num_layers: 1,
            rate_control: RateControl::DistoAlloc,
            layer_bytes: vec![0.0],
            layer_ratios: Vec::new(),
            mct: false,
            comps: vec![ComponentParameters::default()],
        }
    }
}

impl CodingParameters {
    /// Resolves the tile grid against the image and checks every field,
    /// synthesizing missing step sizes. Called once before encoding.
    pub fn setup(&mut self, image: &Image) -> Result<(), J2kError> {
        image.validate()?;
        if self.tdx == 0 {
            self.tx0 = image.x0;
            self.tdx = image.x1 - image.x0;
        }
        if self.tdy == 0 {
            self.ty0 = image.y0;
            self.tdy = image.y1 - image.y0;
        }
        if self.comps.len() == 1 && image.comps.len() > 1 {
            let proto = self.comps[0].clone();
            self.comps = vec![proto; image.comps.len()];
        }
        for (tccp, comp) in self.comps.iter_mut().zip(&image.comps) {
            tccp.setup_step_sizes(comp.prec);
        }
        self.validate(image)
    }

    /// Checks field ranges and cross-field consistency against an image.
    pub fn validate(&self, image: &Image) -> Result<(), J2kError> {
        if self.tdx == 0 || self.tdy == 0 {
            return Err(J2kError::InvalidParameter("tile size must be nonzero"));
        }
        if self.tx0 > image.x0
            || self.ty0 > image.y0
            || self.tx0 + self.tdx <= image.x0
            || self.ty0 + self.tdy <= image.y0
        {
            return Err(J2kError::InvalidParameter(
                "tile grid must start at or before the image origin and overlap it",
            ));
        }
        if self.num_layers < 1 || self.num_layers > 100 {
            return Err(J2kError::InvalidParameter("num_layers must be in 1..=100"));
        }
        let targets = match self.rate_control {
            RateControl::DistoAlloc => &self.layer_bytes,
            RateControl::FixedQuality => &self.layer_ratios,
        };
        if targets.len() != self.num_layers as usize {
            return Err(J2kError::InvalidParameter(
                "one rate target required per layer",
            ));
        }
        if targets.iter().any(|&t| t < 0.0) {
            return Err(J2kError::InvalidParameter("rate targets must be >= 0"));
        }
        if self.comps.len() != image.comps.len() {
            return Err(J2kError::InvalidParameter(
                "one component parameter set required per image component",
            ));
        }
        if self.mct {
            if image.comps.len() < 3 {
                return Err(J2kError::InvalidParameter(
                    "multiple-component transform requires at least 3 components",
                ));
            }
            let c0 = &image.comps[0];
            if image.comps[1..3]
                .iter()
                .any(|c| c.dx != c0.dx || c.dy != c0.dy)
            {
                return Err(J2kError::InvalidParameter(
                    "transformed components must share one sampling grid",
                ));
            }
            if self.comps[1..3]
                .iter()
                .any(|t| t.filter != self.comps[0].filter)
            {
                return Err(J2kError::InvalidParameter(
                    "transformed components must share one wavelet filter",
                ));
            }
        }
        for tccp in &self.comps {
            tccp.validate()?;
        }
        Ok(())
    }

    /// Number of tile columns and rows over the image area.
    pub fn tile_grid(&self, image: &Image) -> (u32, u32) {
        let tw = crate::ceil_div(image.x1 - self.tx0, self.tdx);
        let th = crate::ceil_div(image.y1 - self.ty0, self.tdy);
        (tw, th)
    }
}

/// Knobs for partial decoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderOptions {
    /// Number of highest resolution levels to discard.
    pub reduce: u32,
    /// Decode only the first `max_layers` quality layers (0 = all).
    pub max_layers: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters_validate() {
        let image = Image::new(64, 64, 1, 8, false);
        let mut cp = CodingParameters::default();
        assert!(cp.setup(&image).is_ok());
        assert_eq!(cp.tdx, 64);
        assert_eq!(cp.tile_grid(&image), (1, 1));
        assert_eq!(cp.comps[0].step_sizes.len(), 16);
    }

    #[test]
    fn test_component_sets_are_broadcast() {
        let image = Image::new(32, 32, 3, 8, false);
        let mut cp = CodingParameters {
            mct: true,
            ..Default::default()
        };
        cp.setup(&image).unwrap();
        assert_eq!(cp.comps.len(), 3);
    }

    #[test]
    fn test_filter_quantization_pairing() {
        let image = Image::new(32, 32, 1, 8, false);
        let mut cp = CodingParameters::default();
        cp.comps[0].filter = WaveletFilter::Irreversible97;
        // 9/7 without scalar quantization is rejected
        assert!(cp.setup(&image).is_err());
        let mut cp = CodingParameters::default();
        cp.comps[0].filter = WaveletFilter::Irreversible97;
        cp.comps[0].quant_style = QuantizationStyle::ScalarExpounded;
        assert!(cp.setup(&image).is_ok());
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        let image = Image::new(32, 32, 1, 8, false);

        let mut cp = CodingParameters::default();
        cp.comps[0].num_resolutions = 0;
        assert!(cp.setup(&image).is_err());

        let mut cp = CodingParameters::default();
        cp.comps[0].cblk_w_exp = 7;
        cp.comps[0].cblk_h_exp = 7;
        assert!(cp.setup(&image).is_err());

        let mut cp = CodingParameters::default();
        cp.num_layers = 2; // only one layer_bytes entry
        assert!(cp.setup(&image).is_err());
    }

    #[test]
    fn test_enum_byte_round_trip() {
        assert_eq!(WaveletFilter::try_from(1u8), Ok(WaveletFilter::Reversible53));
        assert_eq!(u8::from(WaveletFilter::Irreversible97), 0);
        assert!(QuantizationStyle::try_from(1u8).is_err());
        assert_eq!(
            RateControl::try_from(1u8),
            Ok(RateControl::FixedQuality)
        );
    }
}
