//! Size-triggered downscaling of fetched content.

use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

/// Resize settings; absent when resizing is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeConfig {
    pub width: u32,
    pub height: u32,
    /// Bodies strictly larger than this are resized.
    pub threshold_bytes: u64,
}

impl ResizeConfig {
    pub fn applies_to(&self, len: u64) -> bool {
        len > self.threshold_bytes
    }
}

/// Scale `data` to fit inside `width`×`height` keeping its aspect ratio,
/// centre it on a transparent canvas of exactly that size, and encode the
/// result as PNG.
pub fn pad_to_png(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, image::ImageError> {
    let source = image::load_from_memory(data)?;
    let fitted = source.resize(width, height, FilterType::Triangle).to_rgba8();

    let mut canvas = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]));
    let x = width.saturating_sub(fitted.width()) / 2;
    let y = height.saturating_sub(fitted.height()) / 2;
    imageops::overlay(&mut canvas, &fitted, i64::from(x), i64::from(y));

    let mut out = Vec::new();
    DynamicImage::ImageRgba8(canvas).write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}
