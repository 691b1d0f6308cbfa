use crate::foundation::error::{TexError, TexResult};

/// Box-filter a `2w × 2h` image into a `w × h` mip.
///
/// `width` and `height` are the output dimensions. Each output pixel is the rounded-down mean of
/// its 2×2 source block, channel by channel.
pub fn generate_mip(
    src: &[u8],
    dst: &mut [u8],
    width: u32,
    height: u32,
    components: u8,
) -> TexResult<()> {
    if !(1..=4).contains(&components) {
        return Err(TexError::invariant(format!(
            "generate_mip with {components} components"
        )));
    }
    let (w, h, c) = (width as usize, height as usize, components as usize);
    let src_row = 2 * w * c;
    if src.len() < src_row * 2 * h || dst.len() < w * h * c {
        return Err(TexError::invariant("generate_mip buffers too small"));
    }

    for y in 0..h {
        let top = 2 * y * src_row;
        let bottom = top + src_row;
        for x in 0..w {
            let l = 2 * x * c;
            let r = l + c;
            let out = (y * w + x) * c;
            for k in 0..c {
                let sum = src[top + l + k] as u32
                    + src[top + r + k] as u32
                    + src[bottom + l + k] as u32
                    + src[bottom + r + k] as u32;
                dst[out + k] = (sum >> 2) as u8;
            }
        }
    }
    Ok(())
}
