//! Tile geometry: resolutions, bands, precincts and code-blocks.
//!
//! The same arena is built on both sides of the codec so packet iteration,
//! tag trees and code-block bookkeeping always agree. Encoder and decoder
//! differ only in the per-code-block state, selected through [`CodeBlock`].
//!
//! All rectangles are half-open `[x0, x1) x [y0, y1)` on the reference grid
//! of their own coordinate space: tiles and components on the image grid,
//! resolutions on the subsampled grid of their level, bands on the once-more
//! halved band grid.

use crate::dwt;
use crate::image::Image;
use crate::params::{CodingParameters, WaveletFilter};
use crate::tgt::TagTree;
use crate::{ceil_div, ceil_div_pow2, floor_div_pow2};

/// Sample storage of one tile component: integers on the reversible path,
/// floats on the 9/7 path.
#[derive(Debug, Clone)]
pub enum TileData {
    Int(Vec<i32>),
    Real(Vec<f32>),
}

impl TileData {
    pub fn len(&self) -> usize {
        match self {
            TileData::Int(v) => v.len(),
            TileData::Real(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One coding pass as recorded by the encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pass {
    /// Cumulative truncation length in bytes after this pass.
    pub rate: usize,
    /// Cumulative weighted distortion decrease after this pass.
    pub distortion: f64,
    /// Whether the codeword was terminated after this pass.
    pub term: bool,
    /// Bytes contributed by this pass alone.
    pub len: usize,
}

/// Slice of a code-block codeword assigned to one quality layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Layer {
    pub numpasses: u32,
    pub len: usize,
    /// Offset of the layer bytes within the code-block data.
    pub start: usize,
    pub distortion: f64,
}

/// One codeword segment of a code-block being decoded. Segments are the
/// units between coder terminations; selective bypass and per-pass
/// termination split a code-block into several.
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    pub start: usize,
    pub len: usize,
    pub numpasses: u32,
    pub maxpasses: u32,
    /// Passes announced for this segment by the packet header being read.
    pub numnewpasses: u32,
    /// Bytes announced for this segment by the packet header being read.
    pub newlen: usize,
}

/// Per-code-block state, instantiated for one side of the codec.
pub trait CodeBlock {
    fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self;
}

/// Encoder-side code-block: the coded bytes plus the pass and layer tables
/// that rate allocation and packet emission work from.
#[derive(Debug, Clone, Default)]
pub struct CodeBlockEnc {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
    pub data: Vec<u8>,
    pub passes: Vec<Pass>,
    pub layers: Vec<Layer>,
    pub numbps: i32,
    pub numlenbits: u32,
    /// Passes already committed to emitted packets.
    pub numpasses: u32,
    /// Passes assigned to finished layers by rate allocation.
    pub numpassesinlayers: u32,
}

/// Decoder-side code-block: accumulated codeword bytes and their segments.
#[derive(Debug, Clone, Default)]
pub struct CodeBlockDec {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
    pub data: Vec<u8>,
    pub segs: Vec<Segment>,
    pub numbps: i32,
    pub numlenbits: u32,
}

impl CodeBlock for CodeBlockEnc {
    fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self {
            x0,
            y0,
            x1,
            y1,
            ..Self::default()
        }
    }
}

impl CodeBlock for CodeBlockDec {
    fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self {
            x0,
            y0,
            x1,
            y1,
            ..Self::default()
        }
    }
}

impl CodeBlockEnc {
    pub fn width(&self) -> usize {
        (self.x1 - self.x0) as usize
    }

    pub fn height(&self) -> usize {
        (self.y1 - self.y0) as usize
    }
}

impl CodeBlockDec {
    pub fn width(&self) -> usize {
        (self.x1 - self.x0) as usize
    }

    pub fn height(&self) -> usize {
        (self.y1 - self.y0) as usize
    }
}

/// A precinct of one band with its code-block grid and the two tag trees
/// driving packet headers.
#[derive(Debug)]
pub struct Precinct<B> {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
    /// Code-blocks across and down.
    pub cw: u32,
    pub ch: u32,
    pub cblks: Vec<B>,
    pub incltree: TagTree,
    pub imsbtree: TagTree,
}

/// A subband of one resolution level.
#[derive(Debug)]
pub struct Band<B> {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
    /// 0 = smooth, 1 = horizontal detail, 2 = vertical detail, 3 = diagonal.
    pub orient: u32,
    /// Maximum magnitude bit-planes of the band (exponent + guard bits - 1).
    pub numbps: i32,
    pub stepsize: f32,
    pub precincts: Vec<Precinct<B>>,
}

/// A resolution level: the lowest holds only the smooth band, every other
/// level its three detail bands.
#[derive(Debug)]
pub struct Resolution<B> {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
    /// Precincts across and down, shared by all bands of the level.
    pub pw: u32,
    pub ph: u32,
    pub bands: Vec<Band<B>>,
}

impl<B> Resolution<B> {
    pub fn width(&self) -> i32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> i32 {
        self.y1 - self.y0
    }
}

/// One component of a tile with its resolution pyramid and sample buffer.
#[derive(Debug)]
pub struct TileComponent<B> {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
    pub num_resolutions: u32,
    pub resolutions: Vec<Resolution<B>>,
    pub data: TileData,
    /// Total code-block area, the pixel count rate allocation normalizes by.
    pub numpix: usize,
}

impl<B> TileComponent<B> {
    pub fn width(&self) -> usize {
        (self.x1 - self.x0) as usize
    }

    pub fn height(&self) -> usize {
        (self.y1 - self.y0) as usize
    }

    /// Offset of a band's origin inside the packed tile buffer. Detail bands
    /// sit to the right of / below the previous resolution rectangle.
    pub fn band_origin(&self, resno: usize, orient: u32) -> (i32, i32) {
        let mut x = 0;
        let mut y = 0;
        if orient & 1 != 0 {
            x = self.resolutions[resno - 1].width();
        }
        if orient & 2 != 0 {
            y = self.resolutions[resno - 1].height();
        }
        (x, y)
    }
}

/// One tile of the grid, the unit the coder works on.
#[derive(Debug)]
pub struct Tile<B> {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
    pub comps: Vec<TileComponent<B>>,
    pub numpix: usize,
    /// Total weighted distortion of the tile, accumulated while coding.
    pub distortion: f64,
}

pub type EncTile = Tile<CodeBlockEnc>;
pub type DecTile = Tile<CodeBlockDec>;

impl<B: CodeBlock> Tile<B> {
    /// Builds the geometry arena for tile `tileno`. Parameters must have been
    /// resolved by [`CodingParameters::setup`] (or validated on load).
    pub fn build(image: &Image, cp: &CodingParameters, tileno: u32) -> Self {
        let (tiles_w, _) = cp.tile_grid(image);
        let p = (tileno % tiles_w) as i32;
        let q = (tileno / tiles_w) as i32;

        let tx0 = (cp.tx0 as i32 + p * cp.tdx as i32).max(image.x0 as i32);
        let ty0 = (cp.ty0 as i32 + q * cp.tdy as i32).max(image.y0 as i32);
        let tx1 = (cp.tx0 as i32 + (p + 1) * cp.tdx as i32).min(image.x1 as i32);
        let ty1 = (cp.ty0 as i32 + (q + 1) * cp.tdy as i32).min(image.y1 as i32);

        let mut tile = Tile {
            x0: tx0,
            y0: ty0,
            x1: tx1,
            y1: ty1,
            comps: Vec::with_capacity(image.comps.len()),
            numpix: 0,
            distortion: 0.0,
        };

        for (comp, tccp) in image.comps.iter().zip(&cp.comps) {
            let cx0 = ceil_div(tx0 as u32, comp.dx) as i32;
            let cy0 = ceil_div(ty0 as u32, comp.dy) as i32;
            let cx1 = ceil_div(tx1 as u32, comp.dx) as i32;
            let cy1 = ceil_div(ty1 as u32, comp.dy) as i32;
            let num_res = tccp.num_resolutions;
            let reversible = tccp.filter == WaveletFilter::Reversible53;

            let area = ((cx1 - cx0).max(0) * (cy1 - cy0).max(0)) as usize;
            let mut tilec = TileComponent {
                x0: cx0,
                y0: cy0,
                x1: cx1,
                y1: cy1,
                num_resolutions: num_res,
                resolutions: Vec::with_capacity(num_res as usize),
                data: if reversible {
                    TileData::Int(vec![0; area])
                } else {
                    TileData::Real(vec![0.0; area])
                },
                numpix: 0,
            };

            for resno in 0..num_res {
                let levelno = (num_res - 1 - resno) as i32;
                let (rx0, ry0, rx1, ry1) =
                    dwt::resolution_bounds(cx0, cy0, cx1, cy1, num_res, resno);

                let pdx = tccp.precinct_w_exp(resno) as i32;
                let pdy = tccp.precinct_h_exp(resno) as i32;
                let tlprcx = floor_div_pow2(rx0, pdx) << pdx;
                let tlprcy = floor_div_pow2(ry0, pdy) << pdy;
                let brprcx = ceil_div_pow2(rx1, pdx) << pdx;
                let brprcy = ceil_div_pow2(ry1, pdy) << pdy;
                let pw = if rx0 == rx1 {
                    0
                } else {
                    ((brprcx - tlprcx) >> pdx) as u32
                };
                let ph = if ry0 == ry1 {
                    0
                } else {
                    ((brprcy - tlprcy) >> pdy) as u32
                };

                // Code-block groups live on band coordinates, one halving
                // finer than the precinct grid except at the lowest level.
                let halve = if resno == 0 { 0 } else { 1 };
                let cbg_w_exp = pdx - halve;
                let cbg_h_exp = pdy - halve;
                let tlcbgx = ceil_div_pow2(tlprcx, halve);
                let tlcbgy = ceil_div_pow2(tlprcy, halve);
                let cblk_w_exp = (tccp.cblk_w_exp as i32).min(cbg_w_exp);
                let cblk_h_exp = (tccp.cblk_h_exp as i32).min(cbg_h_exp);

                let num_bands = if resno == 0 { 1 } else { 3 };
                let mut bands = Vec::with_capacity(num_bands);
                for bandno in 0..num_bands as u32 {
                    let orient = if resno == 0 { 0 } else { bandno + 1 };
                    let x0b = (orient & 1) as i32;
                    let y0b = (orient >> 1) as i32;
                    let (bx0, by0, bx1, by1) = if orient == 0 {
                        (
                            ceil_div_pow2(cx0, levelno),
                            ceil_div_pow2(cy0, levelno),
                            ceil_div_pow2(cx1, levelno),
                            ceil_div_pow2(cy1, levelno),
                        )
                    } else {
                        (
                            ceil_div_pow2(cx0 - (x0b << levelno), levelno + 1),
                            ceil_div_pow2(cy0 - (y0b << levelno), levelno + 1),
                            ceil_div_pow2(cx1 - (x0b << levelno), levelno + 1),
                            ceil_div_pow2(cy1 - (y0b << levelno), levelno + 1),
                        )
                    };

                    let bandno_global = if resno == 0 {
                        0
                    } else {
                        (3 * (resno - 1) + bandno + 1) as usize
                    };
                    let step = tccp.step_sizes[bandno_global];
                    let gain = dwt::band_gain(reversible, orient);
                    let stepsize = dwt::decode_stepsize(step, (comp.prec + gain) as i32);
                    let numbps = step.expn + tccp.num_guard_bits as i32 - 1;

                    let mut precincts = Vec::with_capacity((pw * ph) as usize);
                    for precno in 0..pw * ph {
                        let cbgx = tlcbgx + (((precno % pw) as i32) << cbg_w_exp);
                        let cbgy = tlcbgy + (((precno / pw) as i32) << cbg_h_exp);
                        let px0 = cbgx.max(bx0);
                        let py0 = cbgy.max(by0);
                        let px1 = (cbgx + (1 << cbg_w_exp)).min(bx1);
                        let py1 = (cbgy + (1 << cbg_h_exp)).min(by1);

                        let tlcblkx = floor_div_pow2(px0, cblk_w_exp) << cblk_w_exp;
                        let tlcblky = floor_div_pow2(py0, cblk_h_exp) << cblk_h_exp;
                        let brcblkx = ceil_div_pow2(px1, cblk_w_exp) << cblk_w_exp;
                        let brcblky = ceil_div_pow2(py1, cblk_h_exp) << cblk_h_exp;
                        let cw = if px0 >= px1 {
                            0
                        } else {
                            ((brcblkx - tlcblkx) >> cblk_w_exp) as u32
                        };
                        let ch = if py0 >= py1 {
                            0
                        } else {
                            ((brcblky - tlcblky) >> cblk_h_exp) as u32
                        };

                        let mut cblks = Vec::with_capacity((cw * ch) as usize);
                        for cblkno in 0..cw * ch {
                            let cbx = tlcblkx + (((cblkno % cw) as i32) << cblk_w_exp);
                            let cby = tlcblky + (((cblkno / cw) as i32) << cblk_h_exp);
                            let kx0 = cbx.max(px0);
                            let ky0 = cby.max(py0);
                            let kx1 = (cbx + (1 << cblk_w_exp)).min(px1);
                            let ky1 = (cby + (1 << cblk_h_exp)).min(py1);
                            tilec.numpix += ((kx1 - kx0) * (ky1 - ky0)) as usize;
                            cblks.push(B::new(kx0, ky0, kx1, ky1));
                        }

                        precincts.push(Precinct {
                            x0: px0,
                            y0: py0,
                            x1: px1,
                            y1: py1,
                            cw,
                            ch,
                            cblks,
                            incltree: TagTree::new(cw as usize, ch as usize),
                            imsbtree: TagTree::new(cw as usize, ch as usize),
                        });
                    }

                    bands.push(Band {
                        x0: bx0,
                        y0: by0,
                        x1: bx1,
                        y1: by1,
                        orient,
                        numbps,
                        stepsize,
                        precincts,
                    });
                }

                tilec.resolutions.push(Resolution {
                    x0: rx0,
                    y0: ry0,
                    x1: rx1,
                    y1: ry1,
                    pw,
                    ph,
                    bands,
                });
            }

            tile.numpix += tilec.numpix;
            tile.comps.push(tilec);
        }

        tile
    }

    /// The deepest resolution count over all components, the outer bound of
    /// resolution-position iteration.
    pub fn max_resolutions(&self) -> u32 {
        self.comps
            .iter()
            .map(|c| c.num_resolutions)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::CodingParameters;

    fn tiny_image() -> Image {
        // 8x7 area placed at x0 = 1, so band splits see an odd origin.
        let mut image = Image::new(8, 7, 1, 8, false);
        image.x0 = 1;
        image.x1 = 9;
        image
    }

    #[test]
    fn band_bounds_on_odd_origin() {
        let image = tiny_image();
        let mut cp = CodingParameters::default();
        cp.comps[0].num_resolutions = 2;
        cp.setup(&image).unwrap();

        let tile: EncTile = Tile::build(&image, &cp, 0);
        assert_eq!(
            (tile.x0, tile.y0, tile.x1, tile.y1),
            (1, 0, 9, 7),
            "tile covers the image"
        );

        let tilec = &tile.comps[0];
        let r0 = &tilec.resolutions[0];
        let r1 = &tilec.resolutions[1];
        assert_eq!((r0.x0, r0.y0, r0.x1, r0.y1), (1, 0, 5, 4));
        assert_eq!((r1.x0, r1.y0, r1.x1, r1.y1), (1, 0, 9, 7));

        let ll = &r0.bands[0];
        assert_eq!((ll.x0, ll.y0, ll.x1, ll.y1), (1, 0, 5, 4));
        assert_eq!(ll.orient, 0);

        let hl = &r1.bands[0];
        let lh = &r1.bands[1];
        let hh = &r1.bands[2];
        assert_eq!((hl.x0, hl.y0, hl.x1, hl.y1), (0, 0, 4, 4));
        assert_eq!((lh.x0, lh.y0, lh.x1, lh.y1), (1, 0, 5, 3));
        assert_eq!((hh.x0, hh.y0, hh.x1, hh.y1), (0, 0, 4, 3));

        // The four bands together cover the finest level.
        let area = |b: &Band<CodeBlockEnc>| ((b.x1 - b.x0) * (b.y1 - b.y0)) as usize;
        assert_eq!(
            area(ll) + area(hl) + area(lh) + area(hh),
            tilec.width() * tilec.height()
        );
        assert_eq!(tilec.band_origin(1, 1), (4, 0));
        assert_eq!(tilec.band_origin(1, 2), (0, 4));
        assert_eq!(tilec.band_origin(1, 3), (4, 4));
    }

    #[test]
    fn precinct_and_code_block_grids() {
        let image = tiny_image();
        let mut cp = CodingParameters::default();
        cp.comps[0].num_resolutions = 2;
        cp.comps[0].precinct_w_exps = vec![3, 2];
        cp.comps[0].precinct_h_exps = vec![3, 2];
        cp.setup(&image).unwrap();

        let tile: DecTile = Tile::build(&image, &cp, 0);
        let tilec = &tile.comps[0];

        let r0 = &tilec.resolutions[0];
        assert_eq!((r0.pw, r0.ph), (1, 1));
        let prc = &r0.bands[0].precincts[0];
        assert_eq!((prc.x0, prc.y0, prc.x1, prc.y1), (1, 0, 5, 4));
        assert_eq!((prc.cw, prc.ch), (1, 1));
        let cblk = &prc.cblks[0];
        assert_eq!((cblk.x0, cblk.y0, cblk.x1, cblk.y1), (1, 0, 5, 4));

        // Resolution 1: 4-wide precincts on the resolution grid become
        // 2-wide code-block groups on band coordinates.
        let r1 = &tilec.resolutions[1];
        assert_eq!((r1.pw, r1.ph), (3, 2));
        let hl = &r1.bands[0];
        let p0 = &hl.precincts[0];
        assert_eq!((p0.x0, p0.y0, p0.x1, p0.y1), (0, 0, 2, 2));
        assert_eq!((p0.cw, p0.ch), (1, 1));
        // The band is 4 wide, so the third precinct column is empty.
        let p2 = &hl.precincts[2];
        assert!(p2.x0 >= p2.x1);
        assert_eq!((p2.cw, p2.ch), (0, 0));
    }

    #[test]
    fn multi_tile_grid_clamps_to_image() {
        let image = Image::new(50, 30, 1, 8, false);
        let mut cp = CodingParameters {
            tdx: 32,
            tdy: 32,
            ..CodingParameters::default()
        };
        cp.setup(&image).unwrap();
        assert_eq!(cp.tile_grid(&image), (2, 1));

        let t0: EncTile = Tile::build(&image, &cp, 0);
        let t1: EncTile = Tile::build(&image, &cp, 1);
        assert_eq!((t0.x0, t0.x1, t0.y0, t0.y1), (0, 32, 0, 30));
        assert_eq!((t1.x0, t1.x1, t1.y0, t1.y1), (32, 50, 0, 30));
        assert_eq!(t1.comps[0].width(), 18);
    }

    #[test]
    fn numpix_counts_code_block_area() {
        let image = Image::new(16, 16, 1, 8, false);
        let mut cp = CodingParameters::default();
        cp.comps[0].num_resolutions = 2;
        cp.setup(&image).unwrap();
        let tile: EncTile = Tile::build(&image, &cp, 0);
        // Bands partition the component exactly, so the code-block areas sum
        // to the component area.
        assert_eq!(tile.comps[0].numpix, 256);
        assert_eq!(tile.numpix, 256);
    }
}
