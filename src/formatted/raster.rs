use std::io::Cursor;
use std::time::Duration;

use anyhow::Context;
use image::{ColorType, DynamicImage, ImageDecoder, ImageFormat};

use super::{DecodeStatus, FormattedCodec, FormattedData, ImageCodec, select_channels};
use crate::foundation::error::{TexError, TexResult};
use crate::raw::PixelBuffer;

/// BMP, TGA, JPEG and PNG through the `image` crate. These codecs are not progressive: a decode
/// always runs to completion and yields discard level 0.
#[derive(Debug, Clone, Copy)]
pub struct RasterCodec {
    codec: ImageCodec,
}

impl RasterCodec {
    /// Codec for `codec`. Non-raster codecs are mapped to PNG.
    pub fn new(codec: ImageCodec) -> Self {
        let codec = match codec {
            ImageCodec::Bmp | ImageCodec::Tga | ImageCodec::Jpeg | ImageCodec::Png => codec,
            other => {
                tracing::warn!(?other, "not a raster codec, using png");
                ImageCodec::Png
            }
        };
        Self { codec }
    }

    fn format(&self) -> ImageFormat {
        match self.codec {
            ImageCodec::Bmp => ImageFormat::Bmp,
            ImageCodec::Tga => ImageFormat::Tga,
            ImageCodec::Jpeg => ImageFormat::Jpeg,
            _ => ImageFormat::Png,
        }
    }
}

/// Components a decoded image is delivered with. Luminance-alpha widens to RGBA.
fn components_for(color: ColorType) -> u8 {
    match color.channel_count() {
        1 => 1,
        3 => 3,
        _ => 4,
    }
}

fn into_pixels(img: DynamicImage) -> (Vec<u8>, u32, u32, u8) {
    let (w, h) = (img.width(), img.height());
    match components_for(img.color()) {
        1 => (img.into_luma8().into_raw(), w, h, 1),
        3 => (img.into_rgb8().into_raw(), w, h, 3),
        _ => (img.into_rgba8().into_raw(), w, h, 4),
    }
}

fn to_dynamic(raw: &PixelBuffer) -> TexResult<DynamicImage> {
    let (w, h) = (raw.width(), raw.height());
    let data = raw.data().to_vec();
    let img = match raw.components() {
        1 => image::GrayImage::from_raw(w, h, data).map(DynamicImage::ImageLuma8),
        3 => image::RgbImage::from_raw(w, h, data).map(DynamicImage::ImageRgb8),
        4 => image::RgbaImage::from_raw(w, h, data).map(DynamicImage::ImageRgba8),
        c => {
            return Err(TexError::encode(format!(
                "cannot encode {c}-component pixels"
            )));
        }
    };
    img.ok_or_else(|| TexError::encode("pixel buffer shorter than its dimensions"))
}

impl FormattedCodec for RasterCodec {
    fn codec(&self) -> ImageCodec {
        self.codec
    }

    fn update_data(&mut self, img: &mut FormattedData) -> TexResult<()> {
        let ((w, h), color) = {
            let decoder = image::ImageReader::with_format(Cursor::new(&img.data), self.format())
                .into_decoder()
                .map_err(|e| TexError::uninitialized(format!("{:?} header: {e}", self.codec)))?;
            (decoder.dimensions(), decoder.color_type())
        };
        if w == 0 || h == 0 {
            return Err(TexError::uninitialized(format!(
                "{:?} header reports {w}x{h}",
                self.codec
            )));
        }
        img.set_header(w, h, components_for(color));
        img.discard_level = Some(0);
        Ok(())
    }

    fn decode_channels(
        &mut self,
        img: &mut FormattedData,
        raw: &mut PixelBuffer,
        _budget: Duration,
        first_channel: u8,
        max_channels: u8,
    ) -> TexResult<DecodeStatus> {
        let decoded = image::load_from_memory_with_format(&img.data, self.format())
            .with_context(|| format!("decode {:?} image", self.codec))
            .map_err(|e| TexError::decode(format!("{e:#}")))?;
        let (pixels, w, h, c) = into_pixels(decoded);
        img.set_header(w, h, c);
        img.discard_level = Some(0);
        select_channels(raw, pixels, w, h, c, first_channel, max_channels)?;
        Ok(DecodeStatus::Done)
    }

    fn encode(
        &mut self,
        img: &mut FormattedData,
        raw: &PixelBuffer,
        comment: Option<&str>,
        _budget: Duration,
    ) -> TexResult<()> {
        if comment.is_some() {
            tracing::debug!(codec = ?self.codec, "comment dropped by raster encoder");
        }
        let mut dynamic = to_dynamic(raw)?;
        if self.codec == ImageCodec::Jpeg && raw.components() == 4 {
            dynamic = DynamicImage::ImageRgb8(dynamic.into_rgb8());
        }

        let mut out = Vec::new();
        dynamic
            .write_to(&mut Cursor::new(&mut out), self.format())
            .with_context(|| format!("encode {:?} image", self.codec))
            .map_err(|e| TexError::encode(format!("{e:#}")))?;

        img.data = out;
        img.set_header(raw.width(), raw.height(), dynamic_components(raw, self.codec));
        img.discard_level = Some(0);
        Ok(())
    }
}

fn dynamic_components(raw: &PixelBuffer, codec: ImageCodec) -> u8 {
    if codec == ImageCodec::Jpeg && raw.components() == 4 {
        3
    } else {
        raw.components()
    }
}

#[cfg(test)]
#[path = "../../tests/unit/formatted/raster.rs"]
mod tests;
