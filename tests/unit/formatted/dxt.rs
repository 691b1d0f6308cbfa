use super::*;
use crate::formatted::FormattedImage;
use crate::raw::Rgba8;

fn dxt_image(format: Option<DxtFormat>) -> FormattedImage {
    let codec = match format {
        Some(f) => DxtCodec::with_format(f),
        None => DxtCodec::default(),
    };
    FormattedImage::new(Box::new(codec))
}

fn solid(w: u32, h: u32, c: u8, color: Rgba8) -> PixelBuffer {
    let mut b = PixelBuffer::with_size(w, h, c).unwrap();
    b.fill(color).unwrap();
    b
}

#[test]
fn uncompressed_chain_round_trips_level_zero() {
    let data: Vec<u8> = (0..32 * 16 * 4).map(|i| (i % 256) as u8).collect();
    let src = PixelBuffer::from_data(&data, 32, 16, 4).unwrap();
    let mut img = dxt_image(None);
    img.encode(&src, None, Duration::ZERO).unwrap();
    img.update_data().unwrap();
    assert_eq!(img.max_discard_level(), 5);
    assert_eq!(img.discard_level(), Some(0));

    let mut out = PixelBuffer::new();
    img.decode(&mut out, Duration::ZERO).unwrap();
    assert_eq!(out.data(), src.data());
}

#[test]
fn size_math_matches_stored_prefixes() {
    let src = solid(16, 16, 3, Rgba8::new(1, 2, 3, 255));
    let mut img = dxt_image(None);
    img.encode(&src, None, Duration::ZERO).unwrap();
    img.update_data().unwrap();

    assert_eq!(img.calc_data_size(0), img.data_size());
    // 1x1 + 2x2 + 4x4 RGB levels after the header.
    assert_eq!(img.calc_data_size(2), HEADER_SIZE + 3 * (1 + 4 + 16));
    for level in 0..=img.max_discard_level() {
        let bytes = img.calc_data_size(level);
        assert_eq!(img.calc_discard_level_bytes(bytes), Some(level));
    }
}

#[test]
fn truncated_prefix_decodes_coarser_level() {
    let src = solid(16, 16, 4, Rgba8::new(9, 8, 7, 6));
    let mut img = dxt_image(None);
    img.encode(&src, None, Duration::ZERO).unwrap();
    img.update_data().unwrap();
    let prefix = img.calc_data_size(2);
    let full = img.data().to_vec();

    let mut partial = dxt_image(None);
    partial.copy_data(&full[..prefix + 5]);
    partial.update_data().unwrap();
    assert_eq!(partial.discard_level(), Some(2));

    let mut out = PixelBuffer::new();
    partial.decode(&mut out, Duration::ZERO).unwrap();
    assert_eq!((out.width(), out.height()), (4, 4));
    assert_eq!(partial.discard_level(), Some(2));
    assert!(out.data().chunks_exact(4).all(|p| p == [9, 8, 7, 6]));
}

#[test]
fn dxt1_keeps_representable_colors() {
    let src = solid(8, 8, 3, Rgba8::new(255, 0, 255, 255));
    let mut img = dxt_image(Some(DxtFormat::Dxt1));
    img.encode(&src, None, Duration::ZERO).unwrap();
    img.update_data().unwrap();
    assert_eq!(img.components(), 4);

    let mut out = PixelBuffer::new();
    img.decode(&mut out, Duration::ZERO).unwrap();
    assert!(out.data().chunks_exact(4).all(|p| p == [255, 0, 255, 255]));
}

#[test]
fn dxt1_two_color_block_hits_endpoints() {
    let mut data = Vec::new();
    for i in 0..16 {
        if i % 2 == 0 {
            data.extend_from_slice(&[255, 255, 255, 255]);
        } else {
            data.extend_from_slice(&[0, 0, 0, 255]);
        }
    }
    let src = PixelBuffer::from_data(&data, 4, 4, 4).unwrap();
    let mut img = dxt_image(Some(DxtFormat::Dxt1));
    img.encode(&src, None, Duration::ZERO).unwrap();
    img.update_data().unwrap();
    let mut out = PixelBuffer::new();
    img.decode(&mut out, Duration::ZERO).unwrap();
    assert_eq!(out.data(), src.data());
}

#[test]
fn dxt5_keeps_alpha() {
    let src = solid(4, 8, 4, Rgba8::new(0, 255, 0, 128));
    let mut img = dxt_image(Some(DxtFormat::Dxt5));
    img.encode(&src, None, Duration::ZERO).unwrap();
    img.update_data().unwrap();
    let mut out = PixelBuffer::new();
    img.decode(&mut out, Duration::ZERO).unwrap();
    assert!(out.data().chunks_exact(4).all(|p| p == [0, 255, 0, 128]));
}

#[test]
fn bad_magic_is_uninitialized() {
    let mut img = dxt_image(None);
    img.set_data(vec![0u8; 32]);
    assert!(matches!(img.update_data(), Err(TexError::Uninitialized(_))));
}

#[test]
fn luminance_cannot_be_stored() {
    let src = solid(4, 4, 1, Rgba8::default());
    let mut img = dxt_image(None);
    assert!(matches!(
        img.encode(&src, None, Duration::ZERO),
        Err(TexError::Encode(_))
    ));
}
