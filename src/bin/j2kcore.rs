//! j2kcore CLI - JPEG 2000 core coding system utility.
//!
//! Encodes PGM/PPM images into per-tile packet streams and back. The
//! streams are wrapped in a small envelope carrying the image geometry
//! and coding parameters, standing in for the codestream markers the
//! core coder deliberately leaves out.

use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;

use j2kcore_rs::{
    CodingParameters, ComponentParameters, Decoder, DecoderOptions, Encoder, Image,
    QuantizationStyle, RateControl, WaveletFilter,
};

/// JPEG 2000 core coding system: encode, decode and inspect packet streams
#[derive(Parser)]
#[command(name = "j2kcore")]
#[command(author = "j2kcore-rs contributors")]
#[command(version)]
#[command(about = "JPEG 2000 core coder for PGM/PPM images", long_about = None)]
#[command(after_help = "EXAMPLES:
    j2kcore encode -i image.pgm -o image.j2c
    j2kcore encode -i image.ppm -o image.j2c -r 40,20,10
    j2kcore encode -i scan.pgm -o scan.j2c -I -q 35,40,0 -t 512x512
    j2kcore decode -i image.j2c -o image.pgm
    j2kcore decode -i image.j2c -o preview.pgm -r 2 -l 1
    j2kcore info -i image.j2c

SUPPORTED FORMATS:
    Input:  binary PGM (P5, 8 or 16 bit), binary PPM (P6, 8 bit)
    Output: J2KC envelope (encode), PGM/PPM (decode)

For more information, visit: https://github.com/rad-medica/j2kcore-rs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a PGM/PPM image to a packet-stream envelope
    ///
    /// Without rate or quality targets a single lossless layer is
    /// produced. Three-component images get the colour transform unless
    /// --no-mct is given.
    #[command(visible_alias = "e")]
    Encode {
        /// Input image (binary PGM or PPM)
        #[arg(short, long, help = "Path to the input image file")]
        input: PathBuf,

        /// Output envelope file
        #[arg(short, long, help = "Path for the encoded output file")]
        output: PathBuf,

        /// Compression ratios per layer, best last (e.g. 40,20,10; 0 = lossless)
        #[arg(short, long)]
        rates: Option<String>,

        /// Quality targets in dB per layer, best last (e.g. 30,35,40; 0 = lossless)
        #[arg(short, long)]
        quality: Option<String>,

        /// Number of resolution levels
        #[arg(short = 'n', long, default_value = "6")]
        resolutions: u32,

        /// Tile size as WxH (default: single tile covering the image)
        #[arg(short, long)]
        tile: Option<String>,

        /// Code-block size as WxH (powers of two, 4..=64 per side)
        #[arg(short, long)]
        block: Option<String>,

        /// Use the irreversible 9/7 filter instead of the reversible 5/3
        #[arg(short = 'I', long)]
        irreversible: bool,

        /// Code-block style bits (1=bypass 2=reset 4=termall 8=vsc 16=pterm 32=segsym)
        #[arg(short = 'M', long, default_value = "0")]
        mode: u8,

        /// Disable the multiple-component transform
        #[arg(long)]
        no_mct: bool,
    },

    /// Decode a packet-stream envelope back to PGM/PPM
    #[command(visible_alias = "d")]
    Decode {
        /// Input envelope file
        #[arg(short, long, help = "Path to the encoded input file")]
        input: PathBuf,

        /// Output image (PGM for one component, PPM for three)
        #[arg(short, long, help = "Path for the decoded image")]
        output: PathBuf,

        /// Discard this many highest resolution levels
        #[arg(short, long, default_value = "0")]
        reduce: u32,

        /// Decode only the first N quality layers (0 = all)
        #[arg(short, long, default_value = "0")]
        layers: u32,
    },

    /// Display envelope metadata
    #[command(visible_alias = "i")]
    Info {
        /// Input envelope file
        #[arg(short, long, help = "Path to the file to inspect")]
        input: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Encode {
            input,
            output,
            rates,
            quality,
            resolutions,
            tile,
            block,
            irreversible,
            mode,
            no_mct,
        } => encode_image(
            &input,
            &output,
            rates.as_deref(),
            quality.as_deref(),
            resolutions,
            tile.as_deref(),
            block.as_deref(),
            irreversible,
            mode,
            no_mct,
        ),
        Commands::Decode {
            input,
            output,
            reduce,
            layers,
        } => decode_image(&input, &output, reduce, layers),
        Commands::Info { input } => show_info(&input),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
fn encode_image(
    input: &PathBuf,
    output: &PathBuf,
    rates: Option<&str>,
    quality: Option<&str>,
    resolutions: u32,
    tile: Option<&str>,
    block: Option<&str>,
    irreversible: bool,
    mode: u8,
    no_mct: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = fs::read(input)?;
    let image = read_pnm(&data)?;

    let mut tccp = ComponentParameters {
        num_resolutions: resolutions,
        ..Default::default()
    };
    if let Some(block) = block {
        let (bw, bh) = parse_pair(block)?;
        if !bw.is_power_of_two() || !bh.is_power_of_two() {
            return Err("code-block sides must be powers of two".into());
        }
        tccp.cblk_w_exp = 31 - bw.leading_zeros();
        tccp.cblk_h_exp = 31 - bh.leading_zeros();
    }
    if irreversible {
        tccp.filter = WaveletFilter::Irreversible97;
        tccp.quant_style = QuantizationStyle::ScalarExpounded;
    }
    if mode > 0x3F {
        return Err("unknown code-block style bits".into());
    }
    tccp.cblk_style = mode;

    let mut cp = CodingParameters {
        comps: vec![tccp],
        mct: image.comps.len() >= 3 && !no_mct,
        ..Default::default()
    };
    if let Some(tile) = tile {
        let (tdx, tdy) = parse_pair(tile)?;
        cp.tdx = tdx;
        cp.tdy = tdy;
    }

    match (rates, quality) {
        (Some(_), Some(_)) => {
            return Err("use either --rates or --quality, not both".into());
        }
        (Some(rates), None) => {
            let ratios = parse_list(rates)?;
            if ratios.windows(2).any(|w| w[1] > w[0] && w[0] > 0.0) {
                return Err("compression ratios must decrease from layer to layer".into());
            }
            cp.rate_control = RateControl::DistoAlloc;
            cp.num_layers = ratios.len() as u32;
            cp.layer_bytes = ratio_to_bytes(&image, &cp, &ratios);
        }
        (None, Some(quality)) => {
            let targets = parse_list(quality)?;
            if targets.windows(2).any(|w| w[1] < w[0] && w[1] > 0.0) {
                return Err("quality targets must increase from layer to layer".into());
            }
            cp.rate_control = RateControl::FixedQuality;
            cp.num_layers = targets.len() as u32;
            cp.layer_ratios = targets;
        }
        (None, None) => {}
    }

    let encoder = Encoder::new(&image, cp)?;
    let tiles = encoder.encode()?;
    let envelope = write_envelope(&image, encoder.coding_parameters(), &tiles);
    let raw: usize = image.comps.iter().map(|c| c.data.len()).sum();

    fs::write(output, &envelope)?;
    println!(
        "✓ Encoded {}x{} image ({} components, {} tiles) to {:?} ({:.2}:1)",
        image.width(),
        image.height(),
        image.comps.len(),
        tiles.len(),
        output,
        raw as f64 / envelope.len() as f64
    );
    Ok(())
}

fn decode_image(
    input: &PathBuf,
    output: &PathBuf,
    reduce: u32,
    layers: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = fs::read(input)?;
    let (template, cp, tiles) = read_envelope(&data)?;

    let opts = DecoderOptions {
        reduce,
        max_layers: layers,
    };
    let decoder = Decoder::new(template, cp, opts)?;
    let (image, statuses) = decoder.decode(&tiles)?;
    for (tileno, status) in statuses.iter().enumerate() {
        if let Some(warning) = &status.warning {
            eprintln!("warning: tile {}: {}", tileno, warning);
        }
    }

    write_pnm(output, &image)?;
    println!(
        "✓ Decoded {}x{} image ({} components) to {:?}",
        image.width(),
        image.height(),
        image.comps.len(),
        output
    );
    Ok(())
}

fn show_info(input: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let data = fs::read(input)?;
    let (template, cp, tiles) = read_envelope(&data)?;

    println!("File: {:?}", input);
    println!("Size: {} bytes", data.len());
    println!();
    println!("Format: J2KC packet-stream envelope");
    println!(
        "  Grid:        ({},{}) - ({},{})",
        template.x0, template.y0, template.x1, template.y1
    );
    println!("  Components:  {}", template.comps.len());
    for (i, comp) in template.comps.iter().enumerate() {
        println!(
            "    [{}] {}x{}, {} bit{}, sampling {}x{}",
            i,
            comp.w,
            comp.h,
            comp.prec,
            if comp.sgnd { " signed" } else { "" },
            comp.dx,
            comp.dy
        );
    }
    if cp.tdx == 0 || cp.tdy == 0 {
        return Err("envelope carries no tile grid".into());
    }
    let tiles_w = (template.x1 - cp.tx0).div_ceil(cp.tdx);
    let tiles_h = (template.y1 - cp.ty0).div_ceil(cp.tdy);
    println!(
        "  Tiles:       {} ({}x{} grid of {}x{})",
        tiles.len(),
        tiles_w,
        tiles_h,
        cp.tdx,
        cp.tdy
    );
    println!(
        "  Layers:      {} ({})",
        cp.num_layers,
        match cp.rate_control {
            RateControl::DistoAlloc => "byte targets",
            RateControl::FixedQuality => "quality targets",
        }
    );
    println!("  Progression: LRCP");
    println!(
        "  Filter:      {}",
        match cp.comps[0].filter {
            WaveletFilter::Reversible53 => "5/3 reversible",
            WaveletFilter::Irreversible97 => "9/7 irreversible",
        }
    );
    println!("  DWT levels:  {}", cp.comps[0].num_resolutions - 1);
    println!("  MCT:         {}", if cp.mct { "Yes" } else { "No" });
    let total: usize = tiles.iter().map(Vec::len).sum();
    println!("  Packet data: {} bytes", total);

    Ok(())
}

// Internal helpers

/// Converts compression ratios into the per-tile byte budgets the rate
/// allocator works with, against the raw size of one full tile.
fn ratio_to_bytes(image: &Image, cp: &CodingParameters, ratios: &[f64]) -> Vec<f64> {
    let tdx = if cp.tdx != 0 { cp.tdx } else { image.width() };
    let tdy = if cp.tdy != 0 { cp.tdy } else { image.height() };
    let c0 = &image.comps[0];
    let raw_bytes = tdx as f64 * tdy as f64 * image.comps.len() as f64 * c0.prec as f64
        / (8.0 * (c0.dx * c0.dy) as f64);
    ratios
        .iter()
        .map(|&r| if r > 0.0 { raw_bytes / r } else { 0.0 })
        .collect()
}

fn parse_pair(s: &str) -> Result<(u32, u32), Box<dyn std::error::Error>> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or("expected a WxH pair, e.g. 512x512")?;
    Ok((w.trim().parse()?, h.trim().parse()?))
}

fn parse_list(s: &str) -> Result<Vec<f64>, Box<dyn std::error::Error>> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()?;
    if values.is_empty() || values.len() > 100 {
        return Err("expected between 1 and 100 layer targets".into());
    }
    if values.iter().any(|&v| v < 0.0 || !v.is_finite()) {
        return Err("layer targets must be finite and non-negative".into());
    }
    Ok(values)
}

// Envelope format, version 1: magic, geometry and coding parameters,
// then one length-prefixed packet stream per tile. All integers are
// little-endian.

const MAGIC: &[u8; 4] = b"J2KC";
const VERSION: u8 = 1;

fn write_envelope(image: &Image, cp: &CodingParameters, tiles: &[Vec<u8>]) -> Vec<u8> {
    let mut dest = Vec::new();
    dest.extend_from_slice(MAGIC);
    dest.push(VERSION);

    for v in [image.x0, image.y0, image.x1, image.y1] {
        put_u32(&mut dest, v);
    }
    put_u16(&mut dest, image.comps.len() as u16);
    for comp in &image.comps {
        dest.push(comp.dx as u8);
        dest.push(comp.dy as u8);
        dest.push(comp.prec as u8);
        dest.push(comp.sgnd as u8);
    }

    for v in [cp.tx0, cp.ty0, cp.tdx, cp.tdy] {
        put_u32(&mut dest, v);
    }
    put_u16(&mut dest, cp.num_layers as u16);
    dest.push(u8::from(cp.rate_control));
    dest.push(cp.mct as u8);
    let targets = match cp.rate_control {
        RateControl::DistoAlloc => &cp.layer_bytes,
        RateControl::FixedQuality => &cp.layer_ratios,
    };
    for &t in targets {
        put_f64(&mut dest, t);
    }
    for tccp in &cp.comps {
        dest.push(tccp.num_resolutions as u8);
        dest.push(tccp.cblk_w_exp as u8);
        dest.push(tccp.cblk_h_exp as u8);
        dest.push(tccp.cblk_style);
        dest.push(u8::from(tccp.filter));
        dest.push(u8::from(tccp.quant_style));
        dest.push(tccp.num_guard_bits as u8);
        dest.push(tccp.precinct_w_exps.len() as u8);
        for (&w, &h) in tccp.precinct_w_exps.iter().zip(&tccp.precinct_h_exps) {
            dest.push(w as u8);
            dest.push(h as u8);
        }
        put_u16(&mut dest, tccp.step_sizes.len() as u16);
        for step in &tccp.step_sizes {
            put_i16(&mut dest, step.expn as i16);
            put_u16(&mut dest, step.mant as u16);
        }
    }

    put_u32(&mut dest, tiles.len() as u32);
    for tile in tiles {
        put_u32(&mut dest, tile.len() as u32);
        dest.extend_from_slice(tile);
    }
    dest
}

type Envelope = (Image, CodingParameters, Vec<Vec<u8>>);

fn read_envelope(data: &[u8]) -> Result<Envelope, Box<dyn std::error::Error>> {
    let mut r = Reader::new(data);
    if r.bytes(4)? != MAGIC {
        return Err("not a J2KC envelope".into());
    }
    if r.u8()? != VERSION {
        return Err("unsupported envelope version".into());
    }

    let mut template = Image {
        x0: r.u32()?,
        y0: r.u32()?,
        x1: r.u32()?,
        y1: r.u32()?,
        comps: Vec::new(),
    };
    let numcomps = r.u16()? as usize;
    for _ in 0..numcomps {
        let mut comp = j2kcore_rs::ImageComponent {
            dx: r.u8()? as u32,
            dy: r.u8()? as u32,
            prec: r.u8()? as u32,
            sgnd: r.u8()? != 0,
            w: 0,
            h: 0,
            data: Vec::new(),
        };
        let (w, h) = comp.expected_size(&template);
        comp.w = w;
        comp.h = h;
        comp.data = vec![0; (w as usize) * (h as usize)];
        template.comps.push(comp);
    }

    let mut cp = CodingParameters {
        tx0: r.u32()?,
        ty0: r.u32()?,
        tdx: r.u32()?,
        tdy: r.u32()?,
        ..Default::default()
    };
    cp.num_layers = r.u16()? as u32;
    cp.rate_control = RateControl::try_from(r.u8()?)?;
    cp.mct = r.u8()? != 0;
    let mut targets = Vec::with_capacity(cp.num_layers as usize);
    for _ in 0..cp.num_layers {
        targets.push(r.f64()?);
    }
    match cp.rate_control {
        RateControl::DistoAlloc => cp.layer_bytes = targets,
        RateControl::FixedQuality => cp.layer_ratios = targets,
    }

    cp.comps = Vec::with_capacity(numcomps);
    for _ in 0..numcomps {
        let mut tccp = ComponentParameters {
            num_resolutions: r.u8()? as u32,
            cblk_w_exp: r.u8()? as u32,
            cblk_h_exp: r.u8()? as u32,
            cblk_style: r.u8()?,
            filter: WaveletFilter::try_from(r.u8()?)?,
            quant_style: QuantizationStyle::try_from(r.u8()?)?,
            num_guard_bits: r.u8()? as u32,
            ..Default::default()
        };
        let precincts = r.u8()? as usize;
        for _ in 0..precincts {
            tccp.precinct_w_exps.push(r.u8()? as u32);
            tccp.precinct_h_exps.push(r.u8()? as u32);
        }
        let steps = r.u16()? as usize;
        for _ in 0..steps {
            tccp.step_sizes.push(j2kcore_rs::params::StepSize {
                expn: r.i16()? as i32,
                mant: r.u16()? as i32,
            });
        }
        cp.comps.push(tccp);
    }

    let count = r.u32()? as usize;
    let mut tiles = Vec::with_capacity(count);
    for _ in 0..count {
        let len = r.u32()? as usize;
        tiles.push(r.bytes(len)?.to_vec());
    }
    Ok((template, cp, tiles))
}

fn put_u16(dest: &mut Vec<u8>, v: u16) {
    dest.extend_from_slice(&v.to_le_bytes());
}

fn put_i16(dest: &mut Vec<u8>, v: i16) {
    dest.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(dest: &mut Vec<u8>, v: u32) {
    dest.extend_from_slice(&v.to_le_bytes());
}

fn put_f64(dest: &mut Vec<u8>, v: f64) {
    dest.extend_from_slice(&v.to_le_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], Box<dyn std::error::Error>> {
        if self.data.len() - self.pos < n {
            return Err("envelope ends unexpectedly".into());
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, Box<dyn std::error::Error>> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Box<dyn std::error::Error>> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16, Box<dyn std::error::Error>> {
        let b = self.bytes(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, Box<dyn std::error::Error>> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> Result<f64, Box<dyn std::error::Error>> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_le_bytes(raw))
    }
}

fn read_pnm(data: &[u8]) -> Result<Image, Box<dyn std::error::Error>> {
    let numcomps = match data.get(..2) {
        Some(b"P5") => 1,
        Some(b"P6") => 3,
        _ => return Err("only binary PGM (P5) and PPM (P6) input is supported".into()),
    };
    let mut pos = 2;
    let width = pnm_int(data, &mut pos)?;
    let height = pnm_int(data, &mut pos)?;
    let maxval = pnm_int(data, &mut pos)?;
    pos += 1; // single whitespace after maxval

    if width == 0 || height == 0 {
        return Err("empty image".into());
    }
    if maxval == 0 || maxval > 65535 {
        return Err("maxval out of range".into());
    }
    if numcomps == 3 && maxval > 255 {
        return Err("16-bit PPM input is not supported".into());
    }

    let prec = 32 - maxval.leading_zeros();
    let mut image = Image::new(width, height, numcomps, prec, false);
    let n = (width as usize) * (height as usize);

    if maxval < 256 {
        let samples = data
            .get(pos..pos + n * numcomps)
            .ok_or("PNM sample data ends unexpectedly")?;
        for i in 0..n {
            for (c, comp) in image.comps.iter_mut().enumerate() {
                comp.data[i] = samples[i * numcomps + c] as i32;
            }
        }
    } else {
        let samples = data
            .get(pos..pos + n * 2)
            .ok_or("PNM sample data ends unexpectedly")?;
        for i in 0..n {
            image.comps[0].data[i] =
                u16::from_be_bytes([samples[2 * i], samples[2 * i + 1]]) as i32;
        }
    }
    Ok(image)
}

fn pnm_int(data: &[u8], pos: &mut usize) -> Result<u32, Box<dyn std::error::Error>> {
    loop {
        match data.get(*pos) {
            Some(b' ' | b'\t' | b'\r' | b'\n') => *pos += 1,
            Some(b'#') => {
                while !matches!(data.get(*pos), None | Some(b'\n')) {
                    *pos += 1;
                }
            }
            _ => break,
        }
    }
    let start = *pos;
    let mut value: u32 = 0;
    while let Some(&b @ b'0'..=b'9') = data.get(*pos) {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u32))
            .ok_or("PNM header value overflows")?;
        *pos += 1;
    }
    if *pos == start {
        return Err("malformed PNM header".into());
    }
    Ok(value)
}

fn write_pnm(path: &PathBuf, image: &Image) -> Result<(), Box<dyn std::error::Error>> {
    use std::io::Write;

    if image.comps.iter().any(|c| c.sgnd) {
        return Err("signed components cannot be written as PNM".into());
    }
    let mut file = fs::File::create(path)?;
    match image.comps.len() {
        1 => {
            let comp = &image.comps[0];
            let maxval = (1u32 << comp.prec) - 1;
            writeln!(file, "P5")?;
            writeln!(file, "{} {}", comp.w, comp.h)?;
            writeln!(file, "{}", maxval)?;
            if maxval < 256 {
                let bytes: Vec<u8> = comp.data.iter().map(|&v| v as u8).collect();
                file.write_all(&bytes)?;
            } else {
                let mut bytes = Vec::with_capacity(comp.data.len() * 2);
                for &v in &comp.data {
                    bytes.extend_from_slice(&(v as u16).to_be_bytes());
                }
                file.write_all(&bytes)?;
            }
        }
        3 => {
            let c = &image.comps;
            if c.iter().any(|x| x.w != c[0].w || x.h != c[0].h || x.prec > 8) {
                return Err("PPM output needs three matched 8-bit components".into());
            }
            writeln!(file, "P6")?;
            writeln!(file, "{} {}", c[0].w, c[0].h)?;
            writeln!(file, "{}", (1u32 << c[0].prec) - 1)?;
            let n = (c[0].w as usize) * (c[0].h as usize);
            let mut bytes = Vec::with_capacity(n * 3);
            for i in 0..n {
                bytes.push(c[0].data[i] as u8);
                bytes.push(c[1].data[i] as u8);
                bytes.push(c[2].data[i] as u8);
            }
            file.write_all(&bytes)?;
        }
        _ => return Err("PNM output supports 1 or 3 components".into()),
    }
    Ok(())
}
