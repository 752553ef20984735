//! Raster image model on the JPEG 2000 reference grid.
//!
//! The encoder consumes and the decoder produces [`Image`] values. Sample
//! buffers are always `i32`, independent of the declared precision, so the
//! same model covers 8..16 bit, signed and unsigned, subsampled components.

use crate::J2kError;
use crate::ceil_div;

/// An image (or the decoded result of one) positioned on the reference grid.
#[derive(Debug, Clone, Default)]
pub struct Image {
    /// Horizontal offset of the image area on the reference grid.
    pub x0: u32,
    /// Vertical offset of the image area on the reference grid.
    pub y0: u32,
    /// Exclusive right edge of the image area.
    pub x1: u32,
    /// Exclusive bottom edge of the image area.
    pub y1: u32,
    /// Colour or data components, in codestream order.
    pub comps: Vec<ImageComponent>,
}

/// A single component plane.
#[derive(Debug, Clone, Default)]
pub struct ImageComponent {
    /// Horizontal subsampling factor relative to the reference grid.
    pub dx: u32,
    /// Vertical subsampling factor relative to the reference grid.
    pub dy: u32,
    /// Bit depth of a sample (1..=16).
    pub prec: u32,
    /// True if samples are signed.
    pub sgnd: bool,
    /// Width of the component plane in samples.
    pub w: u32,
    /// Height of the component plane in samples.
    pub h: u32,
    /// Samples, row-major, length `w * h`.
    pub data: Vec<i32>,
}

impl Image {
    /// An image with origin (0,0) and identical full-resolution components.
    pub fn new(width: u32, height: u32, numcomps: usize, prec: u32, sgnd: bool) -> Self {
        let comps = (0..numcomps)
            .map(|_| ImageComponent {
                dx: 1,
                dy: 1,
                prec,
                sgnd,
                w: width,
                h: height,
                data: vec![0; (width * height) as usize],
            })
            .collect();
        Self {
            x0: 0,
            y0: 0,
            x1: width,
            y1: height,
            comps,
        }
    }

    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    /// Checks that the grid, subsampling and buffer sizes agree.
    pub fn validate(&self) -> Result<(), J2kError> {
        if self.x1 <= self.x0 || self.y1 <= self.y0 {
            return Err(J2kError::InvalidImage("empty image area"));
        }
        if self.comps.is_empty() {
            return Err(J2kError::InvalidImage("no components"));
        }
        for comp in &self.comps {
            if comp.dx == 0 || comp.dx > 255 || comp.dy == 0 || comp.dy > 255 {
                return Err(J2kError::InvalidImage("subsampling factor out of range"));
            }
            if comp.prec == 0 || comp.prec > 16 {
                return Err(J2kError::InvalidImage("precision out of range"));
            }
            let (w, h) = comp.expected_size(self);
            if comp.w != w || comp.h != h {
                return Err(J2kError::InvalidImage("component size mismatch"));
            }
            if comp.data.len() != (comp.w as usize) * (comp.h as usize) {
                return Err(J2kError::InvalidImage("sample buffer size mismatch"));
            }
        }
        Ok(())
    }
}

impl ImageComponent {
    /// Plane size implied by the image area and this component's subsampling.
    pub fn expected_size(&self, image: &Image) -> (u32, u32) {
        let w = ceil_div(image.x1, self.dx) - ceil_div(image.x0, self.dx);
        let h = ceil_div(image.y1, self.dy) - ceil_div(image.y0, self.dy);
        (w, h)
    }

    /// Representable sample range for this component's precision.
    pub fn sample_range(&self) -> (i32, i32) {
        if self.sgnd {
            (-(1 << (self.prec - 1)), (1 << (self.prec - 1)) - 1)
        } else {
            (0, (1 << self.prec) - 1)
        }
    }

    /// Bias subtracted before coding to centre unsigned samples around zero.
    pub fn dc_offset(&self) -> i32 {
        if self.sgnd { 0 } else { 1 << (self.prec - 1) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_image_dimensions() {
        let img = Image::new(64, 48, 3, 8, false);
        assert_eq!(img.width(), 64);
        assert_eq!(img.height(), 48);
        assert_eq!(img.comps.len(), 3);
        assert_eq!(img.comps[0].data.len(), 64 * 48);
        assert!(img.validate().is_ok());
    }

    #[test]
    fn test_subsampled_component_size() {
        let mut img = Image::new(65, 33, 1, 8, false);
        img.comps[0].dx = 2;
        img.comps[0].dy = 2;
        let (w, h) = img.comps[0].expected_size(&img);
        assert_eq!((w, h), (33, 17));
        // stale buffer is rejected
        assert!(img.validate().is_err());
    }

    #[test]
    fn test_sample_range_and_offset() {
        let img = Image::new(4, 4, 1, 8, false);
        assert_eq!(img.comps[0].sample_range(), (0, 255));
        assert_eq!(img.comps[0].dc_offset(), 128);

        let img = Image::new(4, 4, 1, 12, true);
        assert_eq!(img.comps[0].sample_range(), (-2048, 2047));
        assert_eq!(img.comps[0].dc_offset(), 0);
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let mut img = Image::new(8, 8, 1, 8, false);
        img.x1 = img.x0;
        assert!(img.validate().is_err());

        let mut img = Image::new(8, 8, 1, 8, false);
        img.comps[0].prec = 17;
        assert!(img.validate().is_err());

        let img = Image {
            x0: 0,
            y0: 0,
            x1: 8,
            y1: 8,
            comps: vec![],
        };
        assert!(img.validate().is_err());
    }
}
