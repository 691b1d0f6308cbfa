use super::*;
use crate::formatted::FormattedImage;

fn gradient(w: u32, h: u32, c: u8) -> PixelBuffer {
    let data: Vec<u8> = (0..w * h * c as u32).map(|i| (i * 7 % 251) as u8).collect();
    PixelBuffer::from_data(&data, w, h, c).unwrap()
}

fn round_trip(codec: ImageCodec, src: &PixelBuffer) -> (FormattedImage, PixelBuffer) {
    let mut img = FormattedImage::create_from_type(codec);
    img.encode(src, None, Duration::ZERO).unwrap();
    img.update_data().unwrap();
    let mut out = PixelBuffer::new();
    assert_eq!(
        img.decode(&mut out, Duration::ZERO).unwrap(),
        DecodeStatus::Done
    );
    (img, out)
}

#[test]
fn lossless_codecs_round_trip() {
    for codec in [ImageCodec::Png, ImageCodec::Bmp, ImageCodec::Tga] {
        for c in [3u8, 4] {
            let src = gradient(13, 9, c);
            let (img, out) = round_trip(codec, &src);
            assert_eq!((img.width(), img.height()), (13, 9), "{codec:?}");
            assert_eq!(out.components(), c, "{codec:?}");
            assert_eq!(out.data(), src.data(), "{codec:?} with {c} components");
            assert_eq!(img.discard_level(), Some(0));
        }
    }
}

#[test]
fn png_keeps_luminance() {
    let src = gradient(8, 8, 1);
    let (_, out) = round_trip(ImageCodec::Png, &src);
    assert_eq!(out.components(), 1);
    assert_eq!(out.data(), src.data());
}

#[test]
fn jpeg_drops_alpha_and_stays_close() {
    let mut src = PixelBuffer::with_size(16, 16, 4).unwrap();
    src.fill(crate::raw::Rgba8::new(200, 100, 50, 7)).unwrap();
    let (img, out) = round_trip(ImageCodec::Jpeg, &src);
    assert_eq!(img.components(), 3);
    assert_eq!(out.components(), 3);
    for px in out.data().chunks_exact(3) {
        assert!((px[0] as i32 - 200).abs() <= 4);
        assert!((px[1] as i32 - 100).abs() <= 4);
        assert!((px[2] as i32 - 50).abs() <= 4);
    }
}

#[test]
fn header_parse_reports_dimensions() {
    let src = gradient(21, 5, 4);
    let mut enc = FormattedImage::create_from_type(ImageCodec::Png);
    enc.encode(&src, None, Duration::ZERO).unwrap();

    let mut img = FormattedImage::create_from_type(ImageCodec::Png);
    img.copy_data(enc.data());
    img.update_data().unwrap();
    assert_eq!((img.width(), img.height(), img.components()), (21, 5, 4));
}

#[test]
fn garbage_is_uninitialized() {
    let mut img = FormattedImage::create_from_type(ImageCodec::Png);
    img.set_data(vec![0xAB; 64]);
    assert!(matches!(img.update_data(), Err(TexError::Uninitialized(_))));
    let mut out = PixelBuffer::new();
    assert!(matches!(
        img.decode(&mut out, Duration::ZERO),
        Err(TexError::Decode(_))
    ));
    assert!(!img.is_decoded());
    assert!(out.data().is_empty());
}
