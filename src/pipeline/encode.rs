//! Image encoding: one lossless PNG for archival and one lossy JPEG sized
//! for the inference API.
//!
//! ## Why two renditions?
//!
//! PNG keeps text crisp and is what a human reviewer should see. Vision APIs
//! cap the request payload, and a 144 DPI PNG of a dense scan easily exceeds
//! it, so the model gets a JPEG squeezed under the ceiling instead.
//!
//! ## Compression ladder
//!
//! The JPEG is encoded at each quality step of [`CompressionPolicy::quality_ladder`]
//! in turn until one fits under the ceiling. If none does, the image is
//! downscaled once and encoded at [`CompressionPolicy::fallback_quality`].
//! That is at most `ladder.len() + 1` encodes; if the last one still does not
//! fit the caller marks the page `ERROR`.

use crate::error::PipelineError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionPolicy {
    /// JPEG qualities tried in order; the first is the default quality.
    pub quality_ladder: Vec<u8>,
    /// Largest acceptable encoded size in bytes.
    pub ceiling_bytes: usize,
    /// Spatial factor applied for the final attempt.
    pub downscale_factor: f32,
    /// JPEG quality for the downscaled attempt.
    pub fallback_quality: u8,
}

impl CompressionPolicy {
    /// 4.5 MiB, under the 5 MB image limit common to vision APIs.
    pub const DEFAULT_CEILING_BYTES: usize = 4_718_592;

    /// Upper bound on encodes per page.
    pub fn max_attempts(&self) -> usize {
        self.quality_ladder.len() + 1
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.quality_ladder.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "Compression quality ladder must not be empty".into(),
            ));
        }
        if self.quality_ladder.windows(2).any(|w| w[1] >= w[0]) {
            return Err(PipelineError::InvalidConfig(format!(
                "Compression quality ladder must be strictly descending, got {:?}",
                self.quality_ladder
            )));
        }
        if self
            .quality_ladder
            .iter()
            .chain(std::iter::once(&self.fallback_quality))
            .any(|q| *q == 0 || *q > 100)
        {
            return Err(PipelineError::InvalidConfig(
                "JPEG qualities must be 1–100".into(),
            ));
        }
        if !(self.downscale_factor > 0.0 && self.downscale_factor < 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "Downscale factor must be in (0, 1), got {}",
                self.downscale_factor
            )));
        }
        if self.ceiling_bytes == 0 {
            return Err(PipelineError::InvalidConfig(
                "Payload ceiling must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Same policy with a different ceiling.
    pub fn with_ceiling(&self, ceiling_bytes: usize) -> Self {
        Self {
            ceiling_bytes,
            ..self.clone()
        }
    }
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            quality_ladder: vec![85, 75, 65, 55, 45],
            ceiling_bytes: Self::DEFAULT_CEILING_BYTES,
            downscale_factor: 0.5,
            fallback_quality: 40,
        }
    }
}

/// A lossy encoding that fits under the ceiling.
#[derive(Debug, Clone)]
pub struct Compressed {
    pub bytes: Vec<u8>,
    pub quality: u8,
    pub downscaled: bool,
    /// Encodes performed, including the successful one.
    pub attempts: usize,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("smallest encoding was {smallest} bytes, ceiling {ceiling} bytes, after {attempts} attempts")]
    OverCeiling {
        smallest: usize,
        ceiling: usize,
        attempts: usize,
    },
}

pub fn encode_lossless(img: &DynamicImage) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

/// JPEG has no alpha channel, so the image is flattened to RGB first.
pub fn encode_lossy(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    rgb.write_with_encoder(encoder)?;
    Ok(buf)
}

/// Walk the ladder with `encode` until the result fits.
pub fn compress_with<F>(img: &DynamicImage, policy: &CompressionPolicy, mut encode: F) -> Result<Compressed, EncodeError>
where
    F: FnMut(&DynamicImage, u8) -> Result<Vec<u8>, EncodeError>,
{
    let mut attempts = 0;
    let mut smallest = usize::MAX;

    for &quality in &policy.quality_ladder {
        attempts += 1;
        let bytes = encode(img, quality)?;
        debug!("lossy q={} → {} bytes", quality, bytes.len());
        if bytes.len() <= policy.ceiling_bytes {
            return Ok(Compressed {
                bytes,
                quality,
                downscaled: false,
                attempts,
                width: img.width(),
                height: img.height(),
            });
        }
        smallest = smallest.min(bytes.len());
    }

    let width = ((img.width() as f32 * policy.downscale_factor).round() as u32).max(1);
    let height = ((img.height() as f32 * policy.downscale_factor).round() as u32).max(1);
    let small = img.resize_exact(width, height, FilterType::Triangle);
    attempts += 1;
    let bytes = encode(&small, policy.fallback_quality)?;
    debug!(
        "lossy downscaled {}x{} q={} → {} bytes",
        width,
        height,
        policy.fallback_quality,
        bytes.len()
    );
    if bytes.len() <= policy.ceiling_bytes {
        return Ok(Compressed {
            bytes,
            quality: policy.fallback_quality,
            downscaled: true,
            attempts,
            width,
            height,
        });
    }

    Err(EncodeError::OverCeiling {
        smallest: smallest.min(bytes.len()),
        ceiling: policy.ceiling_bytes,
        attempts,
    })
}

pub fn compress_to_ceiling(img: &DynamicImage, policy: &CompressionPolicy) -> Result<Compressed, EncodeError> {
    compress_with(img, policy, encode_lossy)
}

/// Decode a stored rendition and run it through the ladder again.
pub fn recompress(stored: &[u8], policy: &CompressionPolicy) -> Result<Compressed, EncodeError> {
    let img = image::load_from_memory(stored)?;
    compress_to_ceiling(&img, policy)
}

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
