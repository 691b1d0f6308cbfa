use std::io::Read;
use std::path::Path;
use std::time::Duration;

use super::{
    DecodeStatus, DxtCodec, FormattedCodec, FormattedData, ImageCodec, MIN_FORMATTED_SIZE,
    RasterCodec, set_global_last_error,
};
use crate::foundation::error::{TexError, TexResult};
use crate::foundation::memory;
use crate::j2c::{J2cCodec, J2cConfig};
use crate::raw::PixelBuffer;

/// A compressed image: codec, bytes, header metadata and decode state.
///
/// The byte buffer is reported to the process-wide formatted-memory counter for as long as the
/// image holds it.
#[derive(Debug)]
pub struct FormattedImage {
    codec: Box<dyn FormattedCodec>,
    body: FormattedData,
    decoding: bool,
    decoded: bool,
    last_error: Option<String>,
}

impl Drop for FormattedImage {
    fn drop(&mut self) {
        memory::global().add_formatted(-(self.body.data.len() as i64));
    }
}

impl FormattedImage {
    /// Wrap a codec implementation with an empty buffer.
    pub fn new(codec: Box<dyn FormattedCodec>) -> Self {
        Self {
            codec,
            body: FormattedData::default(),
            decoding: false,
            decoded: false,
            last_error: None,
        }
    }

    /// Instantiate the codec for `codec`, using the default J2C configuration.
    pub fn create_from_type(codec: ImageCodec) -> Self {
        match codec {
            ImageCodec::Bmp | ImageCodec::Tga | ImageCodec::Jpeg | ImageCodec::Png => {
                Self::new(Box::new(RasterCodec::new(codec)))
            }
            ImageCodec::Dxt => Self::new(Box::new(DxtCodec::default())),
            ImageCodec::J2c => Self::create_j2c(J2cConfig::default()),
        }
    }

    /// Instantiate the codec matching a file name or bare extension. `None` for unknown
    /// extensions.
    pub fn create_from_extension(name: &str) -> Option<Self> {
        let codec = ImageCodec::from_file_name(name).or_else(|| ImageCodec::from_extension(name));
        if codec.is_none() {
            tracing::debug!(name, "no codec registered for extension");
        }
        codec.map(Self::create_from_type)
    }

    /// A J2C image using the process-wide engine and `config`.
    pub fn create_j2c(config: J2cConfig) -> Self {
        Self::new(Box::new(J2cCodec::new(config)))
    }

    /// Codec identifier.
    pub fn codec(&self) -> ImageCodec {
        self.codec.codec()
    }

    /// Canonical file extension for the codec.
    pub fn extension(&self) -> &'static str {
        self.codec().extension()
    }

    /// Width parsed from the header.
    pub fn width(&self) -> u32 {
        self.body.width
    }

    /// Height parsed from the header.
    pub fn height(&self) -> u32 {
        self.body.height
    }

    /// Component count parsed from the header.
    pub fn components(&self) -> u8 {
        self.body.components
    }

    /// Compressed bytes.
    pub fn data(&self) -> &[u8] {
        &self.body.data
    }

    /// Compressed byte count.
    pub fn data_size(&self) -> usize {
        self.body.data.len()
    }

    /// Discard level of the last decode or header parse, `None` when unknown.
    pub fn discard_level(&self) -> Option<u8> {
        self.body.discard_level
    }

    /// Request a discard level, clamped to the codec maximum.
    pub fn set_discard_level(&mut self, level: Option<u8>) {
        let max = self.codec.max_discard_level();
        self.body.discard_level = level.map(|l| l.min(max));
    }

    /// Largest discard level the codec can report.
    pub fn max_discard_level(&self) -> u8 {
        self.codec.max_discard_level()
    }

    /// A decode is suspended mid-way.
    pub fn is_decoding(&self) -> bool {
        self.decoding
    }

    /// The last decode completed successfully.
    pub fn is_decoded(&self) -> bool {
        self.decoded
    }

    /// The last error this image reported.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn record<T>(&mut self, result: TexResult<T>) -> TexResult<T> {
        if let Err(e) = &result {
            let msg = e.to_string();
            set_global_last_error(&msg);
            self.last_error = Some(msg);
        }
        result
    }

    fn set_bytes(&mut self, data: Vec<u8>) {
        let delta = data.len() as i64 - self.body.data.len() as i64;
        self.body.data = data;
        memory::global().add_formatted(delta);
        self.decoded = false;
        self.decoding = false;
        self.codec.reset_decode();
    }

    /// Take ownership of `data` as the compressed buffer.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.set_bytes(data);
    }

    /// Copy `data` into the compressed buffer.
    pub fn copy_data(&mut self, data: &[u8]) {
        self.set_bytes(data.to_vec());
    }

    /// Append a progressively fetched chunk.
    pub fn append_data(&mut self, more: &[u8]) {
        if more.is_empty() {
            return;
        }
        self.body.data.extend_from_slice(more);
        memory::global().add_formatted(more.len() as i64);
        self.decoded = false;
        self.codec.reset_decode();
    }

    /// Drop the compressed bytes, keeping the header metadata.
    pub fn delete_data(&mut self) {
        self.set_bytes(Vec::new());
    }

    /// Take the compressed bytes out of the image.
    pub fn take_data(&mut self) -> Vec<u8> {
        let data = std::mem::take(&mut self.body.data);
        memory::global().add_formatted(-(data.len() as i64));
        self.codec.reset_decode();
        data
    }

    /// Parse header metadata from the current bytes.
    pub fn update_data(&mut self) -> TexResult<()> {
        let result = if self.body.data.len() < MIN_FORMATTED_SIZE {
            Err(TexError::uninitialized(format!(
                "{} image holds {} bytes",
                self.extension(),
                self.body.data.len()
            )))
        } else {
            self.codec.update_data(&mut self.body)
        };
        self.record(result)
    }

    /// Decode every channel into `raw`.
    pub fn decode(&mut self, raw: &mut PixelBuffer, budget: Duration) -> TexResult<DecodeStatus> {
        self.decode_channels(raw, budget, 0, crate::raw::MAX_IMAGE_COMPONENTS)
    }

    /// Decode `max_channels` channels starting at `first_channel` into `raw`.
    ///
    /// A zero `budget` means no time limit. On failure the decode is finished, `raw` is emptied
    /// and the error is recorded.
    pub fn decode_channels(
        &mut self,
        raw: &mut PixelBuffer,
        budget: Duration,
        first_channel: u8,
        max_channels: u8,
    ) -> TexResult<DecodeStatus> {
        let result = if self.body.data.len() < MIN_FORMATTED_SIZE {
            Err(TexError::uninitialized(format!(
                "decode of {} image with {} bytes",
                self.extension(),
                self.body.data.len()
            )))
        } else {
            self.decoding = true;
            self.codec
                .decode_channels(&mut self.body, raw, budget, first_channel, max_channels)
        };

        match &result {
            Ok(DecodeStatus::Pending) => {}
            Ok(DecodeStatus::Done) => {
                self.decoding = false;
                self.decoded = true;
            }
            Err(e) => {
                tracing::debug!(codec = ?self.codec(), error = %e, "decode failed");
                self.decoding = false;
                self.decoded = false;
                self.codec.reset_decode();
                raw.delete_data();
            }
        }
        self.record(result)
    }

    /// Encode `raw` into this image's codec, replacing the current bytes.
    pub fn encode(
        &mut self,
        raw: &PixelBuffer,
        comment: Option<&str>,
        budget: Duration,
    ) -> TexResult<()> {
        let before = self.body.data.len() as i64;
        self.codec.reset_decode();
        let result = self.codec.encode(&mut self.body, raw, comment, budget);
        memory::global().add_formatted(self.body.data.len() as i64 - before);
        self.decoded = false;
        self.decoding = false;
        self.record(result)
    }

    /// Bytes needed to decode at `level`.
    pub fn calc_data_size(&mut self, level: u8) -> usize {
        self.codec.calc_data_size(&self.body, level)
    }

    /// Finest discard level decodable from `bytes`.
    pub fn calc_discard_level_bytes(&mut self, bytes: usize) -> Option<u8> {
        self.codec.calc_discard_level_bytes(&self.body, bytes)
    }

    /// Read the codec's native bytes from `path`, at most `load_size` of them, and parse the
    /// header.
    pub fn load(&mut self, path: &Path, load_size: Option<usize>) -> TexResult<()> {
        let read = || -> std::io::Result<Vec<u8>> {
            let file = std::fs::File::open(path)?;
            let mut buf = Vec::new();
            match load_size {
                Some(n) => file.take(n as u64).read_to_end(&mut buf)?,
                None => (&file).read_to_end(&mut buf)?,
            };
            Ok(buf)
        };
        let data = match read() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read image file");
                return self.record(Err(TexError::Io(e)));
            }
        };
        self.set_data(data);
        self.update_data()
    }

    /// Write the compressed bytes to `path` unmodified.
    pub fn save(&mut self, path: &Path) -> TexResult<()> {
        let result = std::fs::write(path, &self.body.data).map_err(TexError::Io);
        self.record(result)
    }
}

#[cfg(test)]
#[path = "../../tests/unit/formatted/image.rs"]
mod tests;
