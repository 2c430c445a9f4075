use std::io::Cursor;

use anyhow::{anyhow, bail, Result};
use image::{imageops::FilterType, DynamicImage, ImageFormat, RgbImage};

/// Largest width or height of a frame handed to the vision model.
pub const MAX_FRAME_DIMENSION: u32 = 1536;

/// Shrinks `image` to fit into `max_dimension` on both sides, keeping its aspect ratio. Images
/// that already fit are returned untouched.
pub fn downscale(image: DynamicImage, max_dimension: u32) -> DynamicImage {
    if image.width() <= max_dimension && image.height() <= max_dimension {
        return image;
    }
    image.resize(max_dimension, max_dimension, FilterType::Triangle)
}

/// Converts 32 bits per pixel BGRX rows, the layout both X11 ZPixmaps and GDI DIBs use, into
/// an RGB image.
pub fn bgrx_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let pixels = width as usize * height as usize;
    if data.len() < pixels * 4 {
        bail!(
            "Unsupported pixel layout: {} bytes for {width}x{height}",
            data.len()
        );
    }
    let mut rgb = Vec::with_capacity(pixels * 3);
    for pixel in data[..pixels * 4].chunks_exact(4) {
        rgb.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
    }
    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| anyhow!("Pixel buffer doesn't match {width}x{height}"))
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}
