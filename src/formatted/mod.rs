//! Compressed ("formatted") images and the codec registry.
//!
//! A [`FormattedImage`] owns the codec-specific byte representation of a texture together with
//! the header metadata parsed from it. Codec behavior sits behind [`FormattedCodec`]; the
//! extension table maps file names onto [`ImageCodec`] variants.

mod dxt;
mod formatted_image;
mod raster;

use std::sync::Mutex;
use std::time::Duration;

use crate::foundation::error::{TexError, TexResult};
use crate::raw::{MAX_IMAGE_MIP, PixelBuffer};

pub use dxt::{DxtCodec, DxtFormat};
pub use formatted_image::FormattedImage;
pub use raster::RasterCodec;

/// Smallest buffer that can carry a meaningful header.
pub const MIN_FORMATTED_SIZE: usize = 16;

/// Supported codecs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageCodec {
    /// Windows bitmap.
    Bmp,
    /// Truevision TGA.
    Tga,
    /// Progressive, resolution-layered JPEG2000-style codestream.
    J2c,
    /// Baseline JPEG.
    Jpeg,
    /// Mip-chain container of raw or block-compressed levels.
    Dxt,
    /// Portable network graphics.
    Png,
}

const EXTENSIONS: &[(&str, ImageCodec)] = &[
    ("bmp", ImageCodec::Bmp),
    ("tga", ImageCodec::Tga),
    ("j2k", ImageCodec::J2c),
    ("j2c", ImageCodec::J2c),
    ("jp2", ImageCodec::J2c),
    ("texture", ImageCodec::J2c),
    ("jpg", ImageCodec::Jpeg),
    ("jpeg", ImageCodec::Jpeg),
    ("mip", ImageCodec::Dxt),
    ("dxt", ImageCodec::Dxt),
    ("png", ImageCodec::Png),
];

impl ImageCodec {
    /// Look up the codec for a bare extension (no dot). Matching is case-insensitive.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        EXTENSIONS
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, codec)| *codec)
    }

    /// Look up the codec for a file name or path by its final extension.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        Self::from_extension(ext)
    }

    /// Canonical extension written when saving.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Bmp => "bmp",
            Self::Tga => "tga",
            Self::J2c => "j2c",
            Self::Jpeg => "jpg",
            Self::Dxt => "dxt",
            Self::Png => "png",
        }
    }
}

/// Progress reported by a decode call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The time budget ran out; call again to resume.
    Pending,
    /// Decoding finished.
    Done,
}

/// Header fields and compressed bytes shared by every codec.
#[derive(Debug, Default)]
pub struct FormattedData {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) components: u8,
    pub(crate) data: Vec<u8>,
    pub(crate) discard_level: Option<u8>,
}

impl FormattedData {
    /// Width parsed from the header.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height parsed from the header.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Component count parsed from the header.
    pub fn components(&self) -> u8 {
        self.components
    }

    /// Compressed bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Current discard level, `None` when unknown.
    pub fn discard_level(&self) -> Option<u8> {
        self.discard_level
    }

    pub(crate) fn set_header(&mut self, width: u32, height: u32, components: u8) {
        self.width = width;
        self.height = height;
        self.components = components;
    }
}

/// Codec-specific behavior of a [`FormattedImage`].
pub trait FormattedCodec: Send + std::fmt::Debug {
    /// Which codec this is.
    fn codec(&self) -> ImageCodec;

    /// Parse header metadata from `img.data` without a full decode.
    fn update_data(&mut self, img: &mut FormattedData) -> TexResult<()>;

    /// Decode into `raw`, keeping `max_channels` components starting at `first_channel`.
    ///
    /// Returns [`DecodeStatus::Pending`] only when `budget` expired mid-decode; an error ends the
    /// decode just like [`DecodeStatus::Done`].
    fn decode_channels(
        &mut self,
        img: &mut FormattedData,
        raw: &mut PixelBuffer,
        budget: Duration,
        first_channel: u8,
        max_channels: u8,
    ) -> TexResult<DecodeStatus>;

    /// Replace `img.data` with the encoding of `raw`.
    fn encode(
        &mut self,
        img: &mut FormattedData,
        raw: &PixelBuffer,
        comment: Option<&str>,
        budget: Duration,
    ) -> TexResult<()>;

    /// Largest discard level this codec can report.
    fn max_discard_level(&self) -> u8 {
        MAX_IMAGE_MIP as u8
    }

    /// Bytes required to decode at `level`.
    fn calc_data_size(&mut self, img: &FormattedData, level: u8) -> usize {
        default_data_size(img.width, img.height, img.components, level)
    }

    /// Finest discard level decodable from `bytes`, or `None` when nothing fits.
    fn calc_discard_level_bytes(&mut self, img: &FormattedData, bytes: usize) -> Option<u8> {
        (0..=MAX_IMAGE_MIP as u8).find(|&level| self.calc_data_size(img, level) <= bytes)
    }

    /// Forget any resumable decode state.
    fn reset_decode(&mut self) {}
}

/// Uncompressed size of an image at `level`: `(w >> level).max(1) * (h >> level).max(1) * c`.
pub fn default_data_size(width: u32, height: u32, components: u8, level: u8) -> usize {
    let shift = (level as u32).min(31);
    let w = (width >> shift).max(1) as usize;
    let h = (height >> shift).max(1) as usize;
    w * h * components as usize
}

/// Copy the channel window `[first, first + max)` of `src` into `raw`.
pub(crate) fn select_channels(
    raw: &mut PixelBuffer,
    src: Vec<u8>,
    width: u32,
    height: u32,
    components: u8,
    first_channel: u8,
    max_channels: u8,
) -> TexResult<()> {
    if first_channel >= components {
        return Err(TexError::decode(format!(
            "first channel {first_channel} outside {components} components"
        )));
    }
    let n = max_channels.min(components - first_channel).max(1);
    if first_channel == 0 && n == components {
        return raw.assign(src, width, height, components);
    }
    let (f, n_us, c) = (first_channel as usize, n as usize, components as usize);
    let mut out = Vec::with_capacity(width as usize * height as usize * n_us);
    for px in src.chunks_exact(c) {
        out.extend_from_slice(&px[f..f + n_us]);
    }
    raw.assign(out, width, height, n)
}

static LAST_ERROR: Mutex<String> = Mutex::new(String::new());

/// Most recent error reported by any formatted image in the process.
pub fn last_error() -> String {
    LAST_ERROR
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

pub(crate) fn set_global_last_error(msg: &str) {
    let mut slot = LAST_ERROR.lock().unwrap_or_else(|e| e.into_inner());
    slot.clear();
    slot.push_str(msg);
}

#[cfg(test)]
#[path = "../../tests/unit/formatted/registry.rs"]
mod tests;
