//! Base64 / data-URI image payloads and JPEG encoding.

use crate::error::FaceError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;

/// JPEG quality used for stored reference images.
pub const REFERENCE_JPEG_QUALITY: u8 = 95;

/// Decode a base64 image payload, optionally prefixed with a `scheme,` header
/// such as `data:image/jpeg;base64,`.
pub fn decode(encoded: &str) -> Result<DynamicImage, FaceError> {
    let payload = match encoded.split_once(',') {
        Some((_, rest)) => rest,
        None => encoded,
    };
    let payload: String = payload
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if payload.is_empty() {
        return Err(FaceError::InvalidImage("empty image payload".into()));
    }

    let bytes = BASE64
        .decode(payload.as_bytes())
        .map_err(|e| FaceError::InvalidImage(format!("base64: {e}")))?;
    decode_bytes(&bytes)
}

/// Decode an encoded image container (JPEG, PNG, ...) already in memory.
pub fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage, FaceError> {
    image::load_from_memory(bytes).map_err(|e| FaceError::InvalidImage(e.to_string()))
}

/// Encode as baseline JPEG. Alpha is dropped; JPEG has no alpha channel.
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, FaceError> {
    let rgb = image.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&rgb)
        .map_err(|e| FaceError::InvalidImage(format!("jpeg encode: {e}")))?;
    Ok(out)
}

/// Wrap encoded image bytes as a `data:` URI.
pub fn to_data_uri(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(w, h, |x, y| image::Rgb([(x * 7) as u8, (y * 5) as u8, 90]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_with_data_uri_prefix() {
        let uri = to_data_uri(&png_bytes(12, 9), "image/png");
        let img = decode(&uri).unwrap();
        assert_eq!((img.width(), img.height()), (12, 9));
    }

    #[test]
    fn test_decode_bare_base64() {
        let raw = BASE64.encode(png_bytes(4, 3));
        let img = decode(&raw).unwrap();
        assert_eq!((img.width(), img.height()), (4, 3));
    }

    #[test]
    fn test_decode_only_first_comma_is_header() {
        // Everything after the first comma is payload; a second comma is invalid base64.
        let raw = format!("data:image/png;base64,{},junk", BASE64.encode(png_bytes(2, 2)));
        assert!(matches!(decode(&raw), Err(FaceError::InvalidImage(_))));
    }

    #[test]
    fn test_decode_ignores_line_breaks() {
        let raw = BASE64.encode(png_bytes(8, 8));
        let wrapped: String = raw
            .as_bytes()
            .chunks(16)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(decode(&wrapped).is_ok());
    }

    #[test]
    fn test_decode_malformed_base64() {
        let err = decode("data:image/jpeg;base64,@@not-base64@@").unwrap_err();
        assert!(matches!(err, FaceError::InvalidImage(_)));
        assert!(err.to_string().contains("base64"));
    }

    #[test]
    fn test_decode_not_an_image() {
        let raw = BASE64.encode(b"hello, this is not an image");
        assert!(matches!(decode(&raw), Err(FaceError::InvalidImage(_))));
    }

    #[test]
    fn test_decode_empty_payload() {
        assert!(matches!(decode("data:image/png;base64,"), Err(FaceError::InvalidImage(_))));
        assert!(matches!(decode(""), Err(FaceError::InvalidImage(_))));
    }

    #[test]
    fn test_jpeg_reencode_keeps_dimensions() {
        for (w, h) in [(1, 1), (31, 17), (64, 48)] {
            let first = decode(&to_data_uri(&png_bytes(w, h), "image/png")).unwrap();
            let jpeg = encode_jpeg(&first, REFERENCE_JPEG_QUALITY).unwrap();
            let second = decode(&to_data_uri(&jpeg, "image/jpeg")).unwrap();
            assert_eq!((second.width(), second.height()), (w, h));
        }
    }

    #[test]
    fn test_encode_jpeg_drops_alpha() {
        let rgba = DynamicImage::ImageRgba8(image::RgbaImage::new(5, 5));
        let jpeg = encode_jpeg(&rgba, 90).unwrap();
        let back = decode_bytes(&jpeg).unwrap();
        assert_eq!((back.width(), back.height()), (5, 5));
    }
}
