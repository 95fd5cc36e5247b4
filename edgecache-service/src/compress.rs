//! Recompression of images to fit a byte budget.
//!
//! [`fit_to_budget`] decodes an image, caps its width, and searches for the first encoding that
//! fits the budget:
//!
//! - JPEG: quality 90 down to 30 in steps of 10.
//! - PNG: maximum lossless compression, then width scales 0.8 down to 0.3 in steps of 0.1.
//! - WEBP: re-encoded as JPEG using the JPEG search, since no lossy WEBP encoder is available.
//!
//! Vector and icon formats are returned unchanged. The search is deterministic: the same input
//! always yields the same output. Decoding and encoding are CPU-bound, so async callers should
//! run this on the blocking thread pool.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ImageError};
use thiserror::Error;

/// JPEG qualities tried in order.
const JPEG_QUALITIES: [u8; 7] = [90, 80, 70, 60, 50, 40, 30];

/// PNG width scales tried in order after the full-size encoding, in tenths.
const PNG_SCALES: [u32; 6] = [8, 7, 6, 5, 4, 3];

/// An image format that can be fitted to a budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    /// `image/jpeg`
    Jpeg,
    /// `image/png`
    Png,
    /// `image/webp`
    Webp,
}

impl ImageFormat {
    /// Determines the format from a declared content type.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.contains("jpeg") || content_type.contains("jpg") {
            Some(Self::Jpeg)
        } else if content_type.contains("png") {
            Some(Self::Png)
        } else if content_type.contains("webp") {
            Some(Self::Webp)
        } else {
            None
        }
    }

    /// The content type of encodings in this format.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }
}

/// Returns `true` for content types that are never recompressed.
pub fn is_passthrough(content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    content_type.contains("svg") || content_type.contains("icon")
}

/// The outcome of [`fit_to_budget`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compression {
    /// The encoded image.
    pub bytes: Bytes,
    /// The content type of `bytes`, which differs from the input if `changed_format` is set.
    pub content_type: String,
    /// The image was encoded in a different format than its input.
    pub changed_format: bool,
    /// The image was decoded and encoded again, as opposed to passed through.
    pub reencoded: bool,
}

/// Errors from [`fit_to_budget`].
#[derive(Debug, Error)]
pub enum CompressError {
    /// The content type is not an image format that can be recompressed.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    /// The input could not be decoded.
    #[error("failed to decode image")]
    Decode(#[source] ImageError),
    /// An encoder failed.
    #[error("failed to encode image")]
    Encode(#[source] ImageError),
    /// No step of the search produced an encoding within the budget.
    #[error("cannot compress image under {budget} bytes")]
    CannotFit {
        /// The budget that could not be met.
        budget: u64,
    },
}

/// Searches for an encoding of `raw` that is at most `budget` bytes long.
///
/// Images wider than `max_width` are first downscaled to `max_width`, preserving the aspect
/// ratio. Never returns an encoding larger than `budget`.
pub fn fit_to_budget(
    raw: &[u8],
    content_type: &str,
    budget: u64,
    max_width: u32,
) -> Result<Compression, CompressError> {
    if is_passthrough(content_type) {
        return Ok(Compression {
            bytes: Bytes::copy_from_slice(raw),
            content_type: content_type.to_owned(),
            changed_format: false,
            reencoded: false,
        });
    }

    let format = ImageFormat::from_content_type(content_type)
        .ok_or_else(|| CompressError::UnsupportedFormat(content_type.to_owned()))?;

    let image = image::load_from_memory(raw).map_err(CompressError::Decode)?;
    let image = limit_width(image, max_width);

    let (bytes, target) = match format {
        ImageFormat::Jpeg => (search_jpeg(&image, budget)?, ImageFormat::Jpeg),
        ImageFormat::Png => (search_png(&image, budget)?, ImageFormat::Png),
        ImageFormat::Webp => (search_jpeg(&image, budget)?, ImageFormat::Jpeg),
    };

    Ok(Compression {
        bytes: bytes.into(),
        content_type: target.content_type().to_owned(),
        changed_format: target != format,
        reencoded: true,
    })
}

fn limit_width(image: DynamicImage, max_width: u32) -> DynamicImage {
    if max_width == 0 || image.width() <= max_width {
        return image;
    }
    let height = scaled(image.height(), max_width, image.width());
    image.resize_exact(max_width, height, FilterType::Lanczos3)
}

/// Computes `value * numerator / denominator`, rounded and at least 1.
fn scaled(value: u32, numerator: u32, denominator: u32) -> u32 {
    let result = (u64::from(value) * u64::from(numerator) * 2 + u64::from(denominator))
        / (u64::from(denominator) * 2);
    u32::try_from(result).unwrap_or(u32::MAX).max(1)
}

fn fits(bytes: &[u8], budget: u64) -> bool {
    bytes.len() as u64 <= budget
}

fn search_jpeg(image: &DynamicImage, budget: u64) -> Result<Vec<u8>, CompressError> {
    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    for quality in JPEG_QUALITIES {
        let encoded = encode_jpeg(&rgb, quality)?;
        if fits(&encoded, budget) {
            tracing::debug!(quality, size = encoded.len(), "fitted jpeg");
            return Ok(encoded);
        }
    }
    Err(CompressError::CannotFit { budget })
}

fn search_png(image: &DynamicImage, budget: u64) -> Result<Vec<u8>, CompressError> {
    let encoded = encode_png(image)?;
    if fits(&encoded, budget) {
        return Ok(encoded);
    }

    for tenths in PNG_SCALES {
        let width = scaled(image.width(), tenths, 10);
        let height = scaled(image.height(), tenths, 10);
        let resized = image.resize_exact(width, height, FilterType::Lanczos3);

        let encoded = encode_png(&resized)?;
        if fits(&encoded, budget) {
            tracing::debug!(width, height, size = encoded.len(), "fitted png");
            return Ok(encoded);
        }
    }
    Err(CompressError::CannotFit { budget })
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, CompressError> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    image
        .write_with_encoder(encoder)
        .map_err(CompressError::Encode)?;
    Ok(buf)
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, CompressError> {
    let mut buf = Cursor::new(Vec::new());
    let encoder =
        PngEncoder::new_with_quality(&mut buf, CompressionType::Best, PngFilter::Adaptive);
    image
        .write_with_encoder(encoder)
        .map_err(CompressError::Encode)?;
    Ok(buf.into_inner())
}
