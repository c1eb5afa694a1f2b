//! Image encoding: page image files → base64 PNG wrapped in `ImageData`.
//!
//! VLM APIs accept images as base64 data embedded in the JSON request
//! body. Pages are re-encoded as PNG whatever their source format (photos
//! of printed variants are usually JPEG) so that every request carries the
//! same MIME type. `detail: "high"` asks GPT-4-class models for the full
//! tile budget; attacked pages depend on fine structure.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Encode a page image as a base64 PNG ready for the VLM API.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Decode a page image from disk and encode it for the API.
///
/// Decoding is CPU-bound; callers on the async runtime should wrap this in
/// `spawn_blocking`.
pub fn encode_page_file(path: &Path) -> Result<ImageData, image::ImageError> {
    let img = image::open(path)?;
    encode_page(&img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let data = encode_page(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert!(!decoded.is_empty());
    }

    #[test]
    fn encode_from_jpeg_file_becomes_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(8, 8, image::Rgb([200, 200, 200])));
        img.save(&path).unwrap();
        let data = encode_page_file(&path).unwrap();
        assert_eq!(data.mime_type, "image/png");
    }
}
