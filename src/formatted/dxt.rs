//! Mip-chain container holding raw RGB8/RGBA8 levels or DXT1/DXT5 blocks.
//!
//! Layout (little endian):
//!
//! ```text
//! magic "DXTM" | version u8 | format u8 | levels u8 | reserved u8 | width u32 | height u32
//! level[levels - 1] .. level[0]
//! ```
//!
//! Levels are stored coarsest first, so any prefix that ends on a level boundary decodes at that
//! level.

use std::time::Duration;

use super::{DecodeStatus, FormattedCodec, FormattedData, ImageCodec, select_channels};
use crate::foundation::error::{TexError, TexResult};
use crate::raw::{MAX_IMAGE_MIP, PixelBuffer, generate_mip};

const MAGIC: &[u8; 4] = b"DXTM";
const VERSION: u8 = 1;
const HEADER_SIZE: usize = 16;

/// Pixel layout of each stored level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DxtFormat {
    /// Uncompressed 3-byte pixels.
    Rgb8,
    /// Uncompressed 4-byte pixels.
    Rgba8,
    /// 8-byte blocks, 1-bit alpha.
    Dxt1,
    /// 16-byte blocks, interpolated alpha.
    Dxt5,
}

impl DxtFormat {
    fn to_byte(self) -> u8 {
        match self {
            Self::Rgb8 => 0,
            Self::Rgba8 => 1,
            Self::Dxt1 => 2,
            Self::Dxt5 => 3,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Rgb8),
            1 => Some(Self::Rgba8),
            2 => Some(Self::Dxt1),
            3 => Some(Self::Dxt5),
            _ => None,
        }
    }

    /// Components of a decoded level.
    pub fn components(self) -> u8 {
        match self {
            Self::Rgb8 => 3,
            _ => 4,
        }
    }

    /// Stored bytes for a `w × h` level.
    pub fn level_size(self, w: u32, h: u32) -> usize {
        let (w, h) = (w.max(1) as usize, h.max(1) as usize);
        let blocks = w.div_ceil(4) * h.div_ceil(4);
        match self {
            Self::Rgb8 => w * h * 3,
            Self::Rgba8 => w * h * 4,
            Self::Dxt1 => blocks * 8,
            Self::Dxt5 => blocks * 16,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct DxtHeader {
    format: DxtFormat,
    levels: u8,
    width: u32,
    height: u32,
}

impl DxtHeader {
    fn parse(data: &[u8]) -> TexResult<Self> {
        if data.len() < HEADER_SIZE || &data[0..4] != MAGIC {
            return Err(TexError::uninitialized("missing DXT container magic"));
        }
        if data[4] != VERSION {
            return Err(TexError::uninitialized(format!(
                "unsupported DXT container version {}",
                data[4]
            )));
        }
        let format = DxtFormat::from_byte(data[5])
            .ok_or_else(|| TexError::uninitialized(format!("unknown DXT format {}", data[5])))?;
        let levels = data[6];
        let width = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        let height = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
        if width == 0 || height == 0 || levels == 0 || levels as u32 > MAX_IMAGE_MIP + 1 {
            return Err(TexError::uninitialized(format!(
                "bad DXT header {width}x{height} with {levels} levels"
            )));
        }
        Ok(Self {
            format,
            levels,
            width,
            height,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&[VERSION, self.format.to_byte(), self.levels, 0]);
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
    }

    fn dims(&self, level: u8) -> (u32, u32) {
        (
            (self.width >> level).max(1),
            (self.height >> level).max(1),
        )
    }

    fn level_size(&self, level: u8) -> usize {
        let (w, h) = self.dims(level);
        self.format.level_size(w, h)
    }

    /// Header plus every level from the coarsest down to `level`.
    fn bytes_through(&self, level: u8) -> usize {
        let level = level.min(self.levels - 1);
        HEADER_SIZE
            + (level..self.levels)
                .map(|l| self.level_size(l))
                .sum::<usize>()
    }
}

/// Mip levels needed to reach 1×1 from `w × h`.
fn full_chain_levels(w: u32, h: u32) -> u8 {
    let levels = 32 - w.max(h).leading_zeros();
    levels.min(MAX_IMAGE_MIP + 1) as u8
}

/// DXT container codec.
#[derive(Debug, Default)]
pub struct DxtCodec {
    encode_format: Option<DxtFormat>,
    header: Option<DxtHeader>,
}

impl DxtCodec {
    /// Encode levels as `format`. Without one, levels are stored uncompressed.
    pub fn with_format(format: DxtFormat) -> Self {
        Self {
            encode_format: Some(format),
            header: None,
        }
    }

    /// Stored format of the parsed container.
    pub fn format(&self) -> Option<DxtFormat> {
        self.header.map(|h| h.format)
    }
}

impl FormattedCodec for DxtCodec {
    fn codec(&self) -> ImageCodec {
        ImageCodec::Dxt
    }

    fn update_data(&mut self, img: &mut FormattedData) -> TexResult<()> {
        let header = DxtHeader::parse(&img.data)?;
        img.set_header(header.width, header.height, header.format.components());
        self.header = Some(header);
        let available = (0..header.levels).find(|&l| header.bytes_through(l) <= img.data.len());
        img.discard_level = Some(available.unwrap_or(header.levels - 1));
        Ok(())
    }

    fn max_discard_level(&self) -> u8 {
        self.header
            .map(|h| h.levels - 1)
            .unwrap_or(MAX_IMAGE_MIP as u8)
    }

    fn calc_data_size(&mut self, img: &FormattedData, level: u8) -> usize {
        match self.header {
            Some(h) => h.bytes_through(level),
            None => super::default_data_size(img.width, img.height, img.components, level),
        }
    }

    fn decode_channels(
        &mut self,
        img: &mut FormattedData,
        raw: &mut PixelBuffer,
        _budget: Duration,
        first_channel: u8,
        max_channels: u8,
    ) -> TexResult<DecodeStatus> {
        let header = DxtHeader::parse(&img.data)?;
        self.header = Some(header);
        let wanted = img.discard_level.unwrap_or(0).min(header.levels - 1);
        let level = (wanted..header.levels)
            .find(|&l| header.bytes_through(l) <= img.data.len())
            .ok_or_else(|| TexError::decode("DXT container truncated before its coarsest level"))?;

        let offset = header.bytes_through(level) - header.level_size(level);
        let stored = &img.data[offset..offset + header.level_size(level)];
        let (w, h) = header.dims(level);
        let pixels = match header.format {
            DxtFormat::Rgb8 | DxtFormat::Rgba8 => stored.to_vec(),
            DxtFormat::Dxt1 => decode_blocks(stored, w, h, false),
            DxtFormat::Dxt5 => decode_blocks(stored, w, h, true),
        };

        let c = header.format.components();
        img.set_header(header.width, header.height, c);
        img.discard_level = Some(level);
        select_channels(raw, pixels, w, h, c, first_channel, max_channels)?;
        Ok(DecodeStatus::Done)
    }

    fn encode(
        &mut self,
        img: &mut FormattedData,
        raw: &PixelBuffer,
        _comment: Option<&str>,
        _budget: Duration,
    ) -> TexResult<()> {
        let format = match (self.encode_format, raw.components()) {
            (Some(f), 3 | 4) => f,
            (None, 3) => DxtFormat::Rgb8,
            (None, 4) => DxtFormat::Rgba8,
            (_, c) => {
                return Err(TexError::encode(format!(
                    "DXT container needs 3 or 4 components, got {c}"
                )));
            }
        };
        let header = DxtHeader {
            format,
            levels: full_chain_levels(raw.width(), raw.height()),
            width: raw.width(),
            height: raw.height(),
        };

        let mut chain = Vec::with_capacity(header.levels as usize);
        let mut level = to_components(raw, format.components())?;
        for l in 0..header.levels {
            let (w, h) = header.dims(l);
            if l > 0 {
                level = downsample(&level, w, h)?;
            }
            chain.push(match format {
                DxtFormat::Rgb8 | DxtFormat::Rgba8 => level.data().to_vec(),
                DxtFormat::Dxt1 => encode_blocks(level.data(), w, h, false),
                DxtFormat::Dxt5 => encode_blocks(level.data(), w, h, true),
            });
        }

        let mut out = Vec::with_capacity(header.bytes_through(0));
        header.write(&mut out);
        for stored in chain.iter().rev() {
            out.extend_from_slice(stored);
        }

        img.data = out;
        img.set_header(header.width, header.height, format.components());
        img.discard_level = Some(0);
        self.header = Some(header);
        Ok(())
    }

    fn reset_decode(&mut self) {
        self.header = None;
    }
}

fn to_components(raw: &PixelBuffer, components: u8) -> TexResult<PixelBuffer> {
    let mut out = PixelBuffer::with_size(raw.width(), raw.height(), components)?;
    out.copy_from(raw)?;
    Ok(out)
}

fn downsample(prev: &PixelBuffer, w: u32, h: u32) -> TexResult<PixelBuffer> {
    if prev.width() == w * 2 && prev.height() == h * 2 {
        let mut next = PixelBuffer::with_size(w, h, prev.components())?;
        generate_mip(prev.data(), next.data_mut(), w, h, prev.components())?;
        Ok(next)
    } else {
        let mut next = prev.clone();
        next.scale(w, h, true)?;
        Ok(next)
    }
}

fn unpack_565(c: u16) -> [u8; 3] {
    let r = ((c >> 11) & 31) as u8;
    let g = ((c >> 5) & 63) as u8;
    let b = (c & 31) as u8;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
}

fn pack_565(rgb: [u8; 3]) -> u16 {
    let r = (rgb[0] as u16 * 31 + 127) / 255;
    let g = (rgb[1] as u16 * 63 + 127) / 255;
    let b = (rgb[2] as u16 * 31 + 127) / 255;
    (r << 11) | (g << 5) | b
}

fn color_palette(c0: u16, c1: u16, four_color: bool) -> [[u8; 4]; 4] {
    let (a, b) = (unpack_565(c0), unpack_565(c1));
    let mix = |wa: u16, wb: u16, d: u16| -> [u8; 4] {
        [
            ((a[0] as u16 * wa + b[0] as u16 * wb) / d) as u8,
            ((a[1] as u16 * wa + b[1] as u16 * wb) / d) as u8,
            ((a[2] as u16 * wa + b[2] as u16 * wb) / d) as u8,
            255,
        ]
    };
    let p0 = [a[0], a[1], a[2], 255];
    let p1 = [b[0], b[1], b[2], 255];
    if four_color {
        [p0, p1, mix(2, 1, 3), mix(1, 2, 3)]
    } else {
        [p0, p1, mix(1, 1, 2), [0, 0, 0, 0]]
    }
}

fn alpha_palette(a0: u8, a1: u8) -> [u8; 8] {
    let (a, b) = (a0 as u16, a1 as u16);
    let mut p = [a0, a1, 0, 0, 0, 0, 0, 0];
    if a0 > a1 {
        for i in 1..7u16 {
            p[i as usize + 1] = (((7 - i) * a + i * b) / 7) as u8;
        }
    } else {
        for i in 1..5u16 {
            p[i as usize + 1] = (((5 - i) * a + i * b) / 5) as u8;
        }
        p[6] = 0;
        p[7] = 255;
    }
    p
}

/// Expand DXT1 (`with_alpha == false`) or DXT5 blocks into RGBA pixels.
fn decode_blocks(stored: &[u8], w: u32, h: u32, with_alpha: bool) -> Vec<u8> {
    let (w, h) = (w as usize, h as usize);
    let block_bytes = if with_alpha { 16 } else { 8 };
    let blocks_x = w.div_ceil(4);
    let mut out = vec![0u8; w * h * 4];

    for (bi, block) in stored.chunks_exact(block_bytes).enumerate() {
        let (bx, by) = (bi % blocks_x * 4, bi / blocks_x * 4);
        let (alpha, color) = if with_alpha {
            (Some(&block[..8]), &block[8..])
        } else {
            (None, block)
        };

        let c0 = u16::from_le_bytes([color[0], color[1]]);
        let c1 = u16::from_le_bytes([color[2], color[3]]);
        let palette = color_palette(c0, c1, with_alpha || c0 > c1);
        let indices = u32::from_le_bytes([color[4], color[5], color[6], color[7]]);

        let alpha_bits = alpha.map(|a| {
            let mut bits = 0u64;
            for (i, &b) in a[2..8].iter().enumerate() {
                bits |= (b as u64) << (8 * i);
            }
            (alpha_palette(a[0], a[1]), bits)
        });

        for py in 0..4 {
            for px in 0..4 {
                let (x, y) = (bx + px, by + py);
                if x >= w || y >= h {
                    continue;
                }
                let i = py * 4 + px;
                let mut rgba = palette[((indices >> (2 * i)) & 3) as usize];
                if let Some((ap, bits)) = alpha_bits {
                    rgba[3] = ap[((bits >> (3 * i)) & 7) as usize];
                }
                let o = (y * w + x) * 4;
                out[o..o + 4].copy_from_slice(&rgba);
            }
        }
    }
    out
}

fn distance(a: &[u8], b: &[u8]) -> u32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as i32 - y as i32;
            (d * d) as u32
        })
        .sum()
}

fn nearest(palette: &[[u8; 4]], px: &[u8], usable: usize) -> u32 {
    (0..usable)
        .min_by_key(|&i| distance(&palette[i][..3], &px[..3]))
        .unwrap_or(0) as u32
}

/// Range-fit block compression of an RGBA level.
fn encode_blocks(rgba: &[u8], w: u32, h: u32, with_alpha: bool) -> Vec<u8> {
    let (w, h) = (w as usize, h as usize);
    let mut out = Vec::new();

    for by in (0..h).step_by(4) {
        for bx in (0..w).step_by(4) {
            let mut block = [[0u8; 4]; 16];
            for (i, px) in block.iter_mut().enumerate() {
                let x = (bx + i % 4).min(w - 1);
                let y = (by + i / 4).min(h - 1);
                let o = (y * w + x) * 4;
                px.copy_from_slice(&rgba[o..o + 4]);
            }

            if with_alpha {
                encode_alpha(&block, &mut out);
            }

            let mut lo = [255u8; 3];
            let mut hi = [0u8; 3];
            let mut transparent = false;
            for px in &block {
                if !with_alpha && px[3] < 128 {
                    transparent = true;
                    continue;
                }
                for c in 0..3 {
                    lo[c] = lo[c].min(px[c]);
                    hi[c] = hi[c].max(px[c]);
                }
            }
            if lo[0] > hi[0] {
                lo = [0; 3];
                hi = [0; 3];
            }

            let (mut c0, mut c1) = (pack_565(hi), pack_565(lo));
            let four_color = with_alpha || !transparent;
            // Endpoint order selects the block mode: c0 > c1 is four-color.
            if (four_color && c0 < c1) || (!four_color && c0 > c1) {
                std::mem::swap(&mut c0, &mut c1);
            }
            let palette = color_palette(c0, c1, with_alpha || c0 > c1);
            let usable = if with_alpha || c0 > c1 { 4 } else { 3 };

            let mut indices = 0u32;
            for (i, px) in block.iter().enumerate() {
                let idx = if !with_alpha && px[3] < 128 {
                    3
                } else if c0 == c1 {
                    0
                } else {
                    nearest(&palette, px, usable)
                };
                indices |= idx << (2 * i);
            }

            out.extend_from_slice(&c0.to_le_bytes());
            out.extend_from_slice(&c1.to_le_bytes());
            out.extend_from_slice(&indices.to_le_bytes());
        }
    }
    out
}

fn encode_alpha(block: &[[u8; 4]; 16], out: &mut Vec<u8>) {
    let a0 = block.iter().map(|p| p[3]).max().unwrap_or(255);
    let a1 = block.iter().map(|p| p[3]).min().unwrap_or(255);
    let palette = alpha_palette(a0, a1);

    let mut bits = 0u64;
    if a0 != a1 {
        for (i, px) in block.iter().enumerate() {
            let idx = (0..8)
                .min_by_key(|&k| (palette[k] as i32 - px[3] as i32).unsigned_abs())
                .unwrap_or(0) as u64;
            bits |= idx << (3 * i);
        }
    }
    out.push(a0);
    out.push(a1);
    out.extend_from_slice(&bits.to_le_bytes()[..6]);
}

#[cfg(test)]
#[path = "../../tests/unit/formatted/dxt.rs"]
mod tests;
