//! Pixel-buffer primitives shared by the face pipeline.
//!
//! Decoding, channel normalization, cropping, grayscale conversion and
//! in-plane rotation. Everything here is in-memory; callers own file I/O.

use crate::types::BoundingBox;
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use thiserror::Error;

// BT.601 luma weights.
const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("unreadable image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image has no pixels")]
    Empty,
}

/// Decode encoded image bytes (JPEG, PNG, ...) into an RGB8 buffer.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, InputError> {
    let decoded = image::load_from_memory(bytes)?;
    let rgb = normalize_rgb(decoded);
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(InputError::Empty);
    }
    Ok(rgb)
}

/// Normalize any channel layout to 3-channel 8-bit contiguous pixels.
///
/// Grayscale is promoted, alpha is dropped, 16-bit and float samples are
/// rescaled to 8 bits.
pub fn normalize_rgb(image: DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => rgb,
        other => other.to_rgb8(),
    }
}

/// Convert RGB to 8-bit grayscale.
pub fn to_gray(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let Rgb([r, g, b]) = *image.get_pixel(x, y);
        let y = LUMA_R * r as f32 + LUMA_G * g as f32 + LUMA_B * b as f32;
        Luma([y.round().clamp(0.0, 255.0) as u8])
    })
}

/// Copy the region under `face`, clipped to the image bounds.
///
/// Returns `None` when the clipped region is empty.
pub fn crop(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let x0 = face.x.max(0.0).floor();
    let y0 = face.y.max(0.0).floor();
    let x1 = (face.x + face.width).min(w).ceil();
    let y1 = (face.y + face.height).min(h).ceil();
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    let view = image::imageops::crop_imm(
        image,
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    );
    Some(view.to_image())
}

/// Rotate an image about its center by `angle` radians.
///
/// Positive angles turn content clockwise on screen (y axis pointing down).
/// Output keeps the input size; uncovered pixels are black. Bilinear sampling.
pub fn rotate_about_center(image: &RgbImage, angle: f32) -> RgbImage {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let cx = w as f32 / 2.0;
    let cy = h as f32 / 2.0;
    let (sin, cos) = angle.sin_cos();

    let sample = |x: i32, y: i32, c: usize| -> f32 {
        if x >= 0 && x < w as i32 && y >= 0 && y < h as i32 {
            image.get_pixel(x as u32, y as u32)[c] as f32
        } else {
            0.0
        }
    };

    let mut output = RgbImage::new(w as u32, h as u32);
    for (ox, oy, pixel) in output.enumerate_pixels_mut() {
        // Inverse map: src = R(-angle) * (dst - c) + c
        let dx = ox as f32 - cx;
        let dy = oy as f32 - cy;
        let sx = cos * dx + sin * dy + cx;
        let sy = -sin * dx + cos * dy + cy;

        let x0 = sx.floor() as i32;
        let y0 = sy.floor() as i32;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        for c in 0..3 {
            let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            pixel[c] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
    output
}
