//! Menu image thumbnails for offline display.
//!
//! Remote menu images are decoded, downscaled and re-encoded as JPEG until
//! the resulting `data:` URL fits the configured byte budget.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::trace;

use crate::error::{PosError, Result};
use crate::remote::RemoteBackend;

/// Default thumbnail budget: 30 KB of encoded data URL.
pub const DEFAULT_THUMBNAIL_BUDGET: usize = 30 * 1024;

const DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// Longest edge of the first encoding attempt.
const MAX_EDGE: u32 = 320;
/// Give up once the longest edge would drop below this.
const MIN_EDGE: u32 = 32;

const QUALITY_STEPS: [u8; 5] = [80, 65, 50, 35, 20];

pub fn is_data_url(source: &str) -> bool {
    source.trim_start().starts_with("data:")
}

/// Decode the payload of a base64 `data:image/...` URL.
pub fn decode_data_url(source: &str) -> Option<Vec<u8>> {
    let trimmed = source.trim();
    if !trimmed.starts_with("data:image/") {
        return None;
    }
    let (_, payload) = trimmed.split_once(',')?;
    BASE64_STANDARD.decode(payload).ok()
}

/// Re-encode raw image bytes into a JPEG data URL no larger than `budget`
/// bytes.
pub fn compress_thumbnail(bytes: &[u8], budget: usize) -> Result<String> {
    let decoded = image::load_from_memory(bytes)?;
    let (src_w, src_h) = (decoded.width(), decoded.height());
    if src_w == 0 || src_h == 0 {
        return Err(PosError::Image("image has invalid dimensions".into()));
    }

    let mut edge = MAX_EDGE.min(src_w.max(src_h));
    while edge >= MIN_EDGE {
        let scaled = scale_to_edge(&decoded, edge);
        for quality in QUALITY_STEPS {
            let url = encode_data_url(&scaled, quality)?;
            if url.len() <= budget {
                trace!(
                    edge,
                    quality,
                    bytes = url.len(),
                    "Thumbnail fits budget"
                );
                return Ok(url);
            }
        }
        edge /= 2;
    }

    Err(PosError::Image(format!(
        "cannot fit {src_w}x{src_h} image into {budget} bytes"
    )))
}

/// Download `url` through the backend and compress it.
pub async fn fetch_thumbnail(
    backend: &dyn RemoteBackend,
    url: &str,
    budget: usize,
) -> Result<String> {
    let bytes = backend.fetch_bytes(url).await?;
    // Decoding and resizing is CPU-bound; keep it off the async workers.
    tokio::task::spawn_blocking(move || compress_thumbnail(&bytes, budget))
        .await
        .map_err(|e| PosError::Image(format!("thumbnail task failed: {e}")))?
}

fn scale_to_edge(img: &DynamicImage, edge: u32) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    if w.max(h) <= edge {
        return img.clone();
    }
    let (target_w, target_h) = if w >= h {
        (edge, ((h as f32 * edge as f32 / w as f32).round() as u32).max(1))
    } else {
        (((w as f32 * edge as f32 / h as f32).round() as u32).max(1), edge)
    };
    img.resize_exact(target_w, target_h, FilterType::Triangle)
}

fn encode_data_url(img: &DynamicImage, quality: u8) -> Result<String> {
    let rgb = img.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(&rgb)?;
    Ok(format!("{DATA_URL_PREFIX}{}", BASE64_STANDARD.encode(&jpeg)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let noise = (x.wrapping_mul(31) ^ y.wrapping_mul(17)) % 64;
            Rgb([
                ((x * 255) / width) as u8,
                ((y * 255) / height) as u8,
                (noise * 3) as u8,
            ])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .expect("encode png");
        out.into_inner()
    }

    #[test]
    fn test_large_image_fits_default_budget() {
        let png = sample_png(1200, 900);
        let url = compress_thumbnail(&png, DEFAULT_THUMBNAIL_BUDGET).unwrap();

        assert!(url.len() <= DEFAULT_THUMBNAIL_BUDGET);
        assert!(url.starts_with(DATA_URL_PREFIX));
        let jpeg = decode_data_url(&url).expect("valid base64 payload");
        let thumb = image::load_from_memory(&jpeg).expect("valid jpeg");
        assert!(thumb.width() <= MAX_EDGE && thumb.height() <= MAX_EDGE);
    }

    #[test]
    fn test_small_image_is_not_upscaled() {
        let png = sample_png(40, 20);
        let url = compress_thumbnail(&png, DEFAULT_THUMBNAIL_BUDGET).unwrap();
        let thumb = image::load_from_memory(&decode_data_url(&url).unwrap()).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (40, 20));
    }

    #[test]
    fn test_impossible_budget_is_an_error() {
        let png = sample_png(200, 200);
        let err = compress_thumbnail(&png, 100).unwrap_err();
        assert!(matches!(err, PosError::Image(_)));
    }

    #[test]
    fn test_garbage_bytes_are_an_error() {
        assert!(compress_thumbnail(b"not an image", DEFAULT_THUMBNAIL_BUDGET).is_err());
    }

    #[test]
    fn test_data_url_helpers() {
        assert!(is_data_url("data:image/png;base64,AAAA"));
        assert!(!is_data_url("https://cdn.example.com/a.png"));
        assert_eq!(decode_data_url("data:image/png;base64,AAEC"), Some(vec![0, 1, 2]));
        assert_eq!(decode_data_url("https://cdn.example.com/a.png"), None);
    }
}
