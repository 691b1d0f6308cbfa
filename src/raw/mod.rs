//! Decoded pixel buffers.
//!
//! [`PixelBuffer`] owns a tightly packed, row-major byte buffer plus its dimensions and component
//! count. Every byte it holds is reported to the process-wide raw-memory counter, and released
//! again when the buffer shrinks or drops.

mod blend;
mod mip;
mod scale;

use std::sync::Arc;

use crate::foundation::error::{TexError, TexResult};
use crate::foundation::memory;

pub use blend::fast_fractional_mult;
pub use mip::generate_mip;
pub(crate) use scale::copy_line_scaled;

/// Largest buffer accepted without `allow_oversize` (4096 × 4096 × 16 bytes).
pub const MAX_BUFFER_SIZE: usize = 4096 * 4096 * 16;
/// Smallest mip level exponent produced by power-of-two fitting.
pub const MIN_IMAGE_MIP: u32 = 2;
/// Largest mip level exponent.
pub const MAX_IMAGE_MIP: u32 = 11;
/// Smallest edge produced by power-of-two fitting.
pub const MIN_IMAGE_SIZE: u32 = 1 << MIN_IMAGE_MIP;
/// Largest edge accepted by [`PixelBuffer::sanity_check`].
pub const MAX_IMAGE_SIZE: u32 = 1 << MAX_IMAGE_MIP;
/// Largest component count a buffer may carry.
pub const MAX_IMAGE_COMPONENTS: u8 = 4;

/// An 8-bit RGBA color.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rgba8 {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
    /// Alpha channel.
    pub a: u8,
}

impl Rgba8 {
    /// Build a color from its channels.
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Channels in RGBA order.
    pub const fn to_array(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// Decoded image bytes with width, height and component count.
///
/// Invariant: unless [`PixelBuffer::is_buffer_invalid`] reports a failed allocation, `data().len()`
/// is exactly the size last passed to an allocation call; after a failed allocation the size and
/// both dimensions are zero.
#[derive(Debug)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    components: u8,
    data: Vec<u8>,
    bad_allocation: bool,
    allow_oversize: bool,
}

impl Default for PixelBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for PixelBuffer {
    fn clone(&self) -> Self {
        let mut out = Self::new();
        out.set_size(self.width, self.height, self.components);
        out.allow_oversize = self.allow_oversize;
        out.bad_allocation = self.bad_allocation;
        out.replace_data(self.data.clone());
        out
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        let g = memory::global();
        g.add_raw(-(self.data.len() as i64));
        g.raw_image_dropped();
    }
}

/// Reject component counts outside `{1, 3, 4}`.
pub(crate) fn check_pixel_components(components: u8) -> TexResult<()> {
    match components {
        1 | 3 | 4 => Ok(()),
        c => Err(TexError::invariant(format!(
            "pixel operation on unsupported component count {c}"
        ))),
    }
}

impl PixelBuffer {
    /// An empty buffer with no dimensions.
    pub fn new() -> Self {
        memory::global().raw_image_created();
        Self {
            width: 0,
            height: 0,
            components: 0,
            data: Vec::new(),
            bad_allocation: false,
            allow_oversize: false,
        }
    }

    /// Allocate a zeroed `width × height × components` buffer.
    pub fn with_size(width: u32, height: u32, components: u8) -> TexResult<Self> {
        let mut out = Self::new();
        out.allocate_for(width, height, components)?;
        Ok(out)
    }

    /// Copy `data` into a new buffer of the given shape.
    pub fn from_data(data: &[u8], width: u32, height: u32, components: u8) -> TexResult<Self> {
        let mut out = Self::with_size(width, height, components)?;
        let n = out.data.len();
        if data.len() < n {
            return Err(TexError::invariant(format!(
                "source holds {} bytes, {width}x{height}x{components} needs {n}",
                data.len()
            )));
        }
        out.data.copy_from_slice(&data[..n]);
        Ok(out)
    }

    /// Take ownership of `data` without copying.
    pub fn from_vec(data: Vec<u8>, width: u32, height: u32, components: u8) -> TexResult<Self> {
        let expected = width as usize * height as usize * components as usize;
        if data.len() != expected {
            return Err(TexError::invariant(format!(
                "buffer of {} bytes does not match {width}x{height}x{components}",
                data.len()
            )));
        }
        let mut out = Self::new();
        out.set_size(width, height, components);
        out.replace_data(data);
        Ok(out)
    }

    /// Copy a `width × height` window of `src` starting at `offset` along one axis.
    ///
    /// With `vertical`, `width` must equal the source width and `offset` is a row; otherwise
    /// `height` must equal the source height and `offset` is a column.
    pub fn crop(
        src: &PixelBuffer,
        width: u32,
        height: u32,
        offset: u32,
        vertical: bool,
    ) -> TexResult<Self> {
        let c = src.components as usize;
        let fits = |extent: u32, limit: u32| {
            offset.checked_add(extent).is_some_and(|end| end <= limit)
        };
        if vertical {
            if width != src.width || !fits(height, src.height) {
                return Err(TexError::invariant("vertical crop outside source"));
            }
        } else if height != src.height || !fits(width, src.width) {
            return Err(TexError::invariant("horizontal crop outside source"));
        }

        let mut out = Self::with_size(width, height, src.components)?;
        if vertical {
            let start = width as usize * offset as usize * c;
            let n = out.data.len();
            out.data.copy_from_slice(&src.data[start..start + n]);
        } else {
            let row_bytes = width as usize * c;
            for row in 0..height as usize {
                let from = (src.width as usize * row + offset as usize) * c;
                out.data[row * row_bytes..(row + 1) * row_bytes]
                    .copy_from_slice(&src.data[from..from + row_bytes]);
            }
        }
        Ok(out)
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per pixel.
    pub fn components(&self) -> u8 {
        self.components
    }

    /// Size of the allocated buffer in bytes.
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// Pixel bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable pixel bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// True after a failed allocation, or when nothing is allocated.
    pub fn is_buffer_invalid(&self) -> bool {
        self.bad_allocation || self.data.is_empty()
    }

    /// True after a failed allocation.
    pub fn allocation_failed(&self) -> bool {
        self.bad_allocation
    }

    /// Permit allocations above [`MAX_BUFFER_SIZE`], degrading to an empty flagged buffer if the
    /// allocator refuses.
    pub fn set_allow_oversize(&mut self, allow: bool) {
        self.allow_oversize = allow;
    }

    /// Bytes implied by the current dimensions.
    pub fn expected_size(&self) -> usize {
        self.width as usize * self.height as usize * self.components as usize
    }

    pub(crate) fn set_size(&mut self, width: u32, height: u32, components: u8) {
        self.width = width;
        self.height = height;
        self.components = components;
    }

    /// Replace shape and contents in one step.
    pub(crate) fn assign(
        &mut self,
        data: Vec<u8>,
        width: u32,
        height: u32,
        components: u8,
    ) -> TexResult<()> {
        if data.len() != width as usize * height as usize * components as usize {
            return Err(TexError::invariant(format!(
                "buffer of {} bytes does not match {width}x{height}x{components}",
                data.len()
            )));
        }
        self.set_size(width, height, components);
        self.replace_data(data);
        self.bad_allocation = false;
        Ok(())
    }

    /// Install `data` as the buffer, keeping the raw counter in step.
    pub(crate) fn replace_data(&mut self, data: Vec<u8>) {
        let delta = data.len() as i64 - self.data.len() as i64;
        self.data = data;
        memory::global().add_raw(delta);
    }

    fn check_size(&self, size: usize, op: &str) -> TexResult<()> {
        if (size < 1 || size > MAX_BUFFER_SIZE) && !self.allow_oversize {
            return Err(TexError::allocation(format!("{op}: bad size {size}")));
        }
        Ok(())
    }

    fn degrade_allocation(&mut self, size: usize) {
        tracing::warn!(size, "failed to allocate image data");
        self.replace_data(Vec::new());
        self.width = 0;
        self.height = 0;
        self.bad_allocation = true;
    }

    /// Allocate a zeroed buffer of `size` bytes, discarding the previous contents.
    ///
    /// Sizes outside `[1, MAX_BUFFER_SIZE]` fail with [`TexError::Allocation`] unless oversize is
    /// allowed, in which case an allocator refusal leaves an empty buffer with the failure flag
    /// set and still returns `Ok`.
    pub fn allocate(&mut self, size: usize) -> TexResult<()> {
        self.check_size(size, "allocate")?;
        if !self.data.is_empty() && self.data.len() == size && !self.bad_allocation {
            return Ok(());
        }
        self.replace_data(Vec::new());
        self.bad_allocation = false;
        if size == 0 {
            self.degrade_allocation(size);
            return Ok(());
        }

        let mut buf = Vec::new();
        if buf.try_reserve_exact(size).is_err() {
            if self.allow_oversize {
                self.degrade_allocation(size);
                return Ok(());
            }
            return Err(TexError::allocation(format!(
                "allocator refused {size} bytes"
            )));
        }
        buf.resize(size, 0);
        self.replace_data(buf);
        Ok(())
    }

    /// Resize the buffer to `size` bytes, keeping the overlapping prefix of the old contents.
    pub fn reallocate(&mut self, size: usize) -> TexResult<()> {
        if size == 0 || (size > MAX_BUFFER_SIZE && !self.allow_oversize) {
            return Err(TexError::allocation(format!("reallocate: bad size {size}")));
        }
        if self.data.len() == size {
            return Ok(());
        }

        let mut buf = Vec::new();
        if buf.try_reserve_exact(size).is_err() {
            return Err(TexError::allocation(format!(
                "out of memory reallocating to {size} bytes"
            )));
        }
        let keep = self.data.len().min(size);
        buf.extend_from_slice(&self.data[..keep]);
        buf.resize(size, 0);
        self.replace_data(buf);
        self.bad_allocation = false;
        Ok(())
    }

    /// Set dimensions and allocate exactly their product.
    pub fn allocate_for(&mut self, width: u32, height: u32, components: u8) -> TexResult<()> {
        if components == 0 || components > MAX_IMAGE_COMPONENTS {
            return Err(TexError::invariant(format!(
                "bad component count {components}"
            )));
        }
        let size = width as usize * height as usize * components as usize;
        if size == 0 {
            return Err(TexError::allocation(format!(
                "bad dimensions {width}x{height}x{components}"
            )));
        }
        self.set_size(width, height, components);
        self.allocate(size)
    }

    /// Reshape the buffer, reallocating only when the shape changes. Contents are discarded.
    pub fn resize(&mut self, width: u32, height: u32, components: u8) -> TexResult<()> {
        if self.width == width
            && self.height == height
            && self.components == components
            && !self.is_buffer_invalid()
        {
            return Ok(());
        }
        self.delete_data();
        self.allocate_for(width, height, components)
    }

    /// Free the pixel bytes, keeping the dimensions.
    pub fn delete_data(&mut self) {
        self.replace_data(Vec::new());
    }

    /// Take the pixel bytes out of the buffer.
    pub fn release(&mut self) -> Vec<u8> {
        let data = std::mem::take(&mut self.data);
        memory::global().add_raw(-(data.len() as i64));
        data
    }

    /// Verify the buffer against the global image limits.
    pub fn sanity_check(&self) -> TexResult<()> {
        if self.width > MAX_IMAGE_SIZE
            || self.height > MAX_IMAGE_SIZE
            || (self.data.len() > MAX_BUFFER_SIZE && !self.allow_oversize)
            || self.components > MAX_IMAGE_COMPONENTS
        {
            return Err(TexError::invariant(format!(
                "failed sanity check: {}x{}x{} with {} bytes",
                self.width,
                self.height,
                self.components,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Copy `h` rows of `w` pixels from `data` to `(x, y)`.
    ///
    /// Bounds are the caller's responsibility. `stride` of `0` means tightly packed source rows;
    /// with `reverse_rows` the source is read bottom-to-top.
    #[allow(clippy::too_many_arguments)]
    pub fn set_region(
        &mut self,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        data: &[u8],
        stride: usize,
        reverse_rows: bool,
    ) -> TexResult<()> {
        if self.data.is_empty() {
            return Err(TexError::invariant("set_region on unallocated buffer"));
        }
        let c = self.components as usize;
        let row_bytes = w as usize * c;
        let stride = if stride == 0 { row_bytes } else { stride };
        for i in 0..h as usize {
            let row = if reverse_rows { h as usize - 1 - i } else { i };
            let from = row * stride;
            let to = ((y as usize + i) * self.width as usize + x as usize) * c;
            self.data[to..to + row_bytes].copy_from_slice(&data[from..from + row_bytes]);
        }
        Ok(())
    }

    /// Write `r, g, b, a` into each pixel, stopping at the component count.
    pub fn clear(&mut self, r: u8, g: u8, b: u8, a: u8) {
        let c = self.components as usize;
        if c == 0 {
            return;
        }
        let color = [r, g, b, a];
        for px in self.data.chunks_exact_mut(c) {
            let n = c.min(4);
            px[..n].copy_from_slice(&color[..n]);
        }
    }

    /// Fill every pixel with a constant color.
    pub fn fill(&mut self, color: Rgba8) -> TexResult<()> {
        check_pixel_components(self.components)?;
        match self.components {
            4 => {
                let rgba = color.to_array();
                for px in self.data.chunks_exact_mut(4) {
                    px.copy_from_slice(&rgba);
                }
            }
            3 => {
                let rgb = [color.r, color.g, color.b];
                for px in self.data.chunks_exact_mut(3) {
                    px.copy_from_slice(&rgb);
                }
            }
            _ => self.data.fill(color.r),
        }
        Ok(())
    }

    /// Reverse the row order in place.
    pub fn vertical_flip(&mut self) -> TexResult<()> {
        let row_bytes = self.width as usize * self.components as usize;
        if row_bytes == 0 {
            return Err(TexError::invariant("vertical_flip on empty buffer"));
        }
        let height = self.height as usize;
        let mut line = vec![0u8; row_bytes];
        for row in 0..height / 2 {
            let a = row * row_bytes;
            let b = (height - 1 - row) * row_bytes;
            line.copy_from_slice(&self.data[a..a + row_bytes]);
            self.data.copy_within(b..b + row_bytes, a);
            self.data[b..b + row_bytes].copy_from_slice(&line);
        }
        Ok(())
    }

    /// Share-or-copy: returns `this` when no one else holds it, otherwise a private copy.
    pub fn duplicate(this: &Arc<PixelBuffer>) -> Arc<PixelBuffer> {
        if Arc::strong_count(this) < 2 {
            return Arc::clone(this);
        }
        Arc::new(PixelBuffer::clone(this))
    }
}

#[cfg(test)]
#[path = "../../tests/unit/raw/buffer.rs"]
mod tests;
