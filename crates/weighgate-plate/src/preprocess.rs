//! Plate image preprocessing: area downscale, grayscale, CLAHE, bilateral
//! smoothing and unsharp masking. Pure in-memory transform.

use image::{imageops, GrayImage, Luma, RgbImage};
use imageproc::filter::bilateral_filter;
use weighgate_core::imaging::to_gray;

const CLAHE_TILES: u32 = 8;
const CLAHE_CLIP_LIMIT: f32 = 2.5;

const BILATERAL_WINDOW: u32 = 7;
const BILATERAL_SIGMA_COLOR: f32 = 60.0;
const BILATERAL_SIGMA_SPACE: f32 = 60.0;

const UNSHARP_SIGMA: f32 = 1.0;
const UNSHARP_AMOUNT: f32 = 1.5;

/// Full plate preprocessing chain. Output is single-channel 8-bit.
pub fn preprocess(image: &RgbImage, max_width: u32) -> GrayImage {
    let resized = limit_width(image, max_width);
    let mut gray = to_gray(&resized);
    clahe_enhance(&mut gray, CLAHE_TILES, CLAHE_CLIP_LIMIT);
    let smoothed = smooth(&gray);
    unsharp_mask(&smoothed, UNSHARP_SIGMA, UNSHARP_AMOUNT)
}

/// Downscale with area averaging when wider than `max_width`, keeping aspect ratio.
pub fn limit_width(image: &RgbImage, max_width: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    if w <= max_width || w == 0 {
        return image.clone();
    }
    let scale = max_width as f64 / w as f64;
    let new_w = max_width.max(1);
    let new_h = ((h as f64 * scale) as u32).max(1);
    resize_area(image, new_w, new_h)
}

/// Box-filter downscale: each output pixel is the mean of the source pixels it covers.
fn resize_area(image: &RgbImage, new_w: u32, new_h: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let fx = w as f64 / new_w as f64;
    let fy = h as f64 / new_h as f64;

    RgbImage::from_fn(new_w, new_h, |x, y| {
        let x0 = (x as f64 * fx).floor() as u32;
        let x1 = (((x + 1) as f64 * fx).ceil() as u32).clamp(x0 + 1, w);
        let y0 = (y as f64 * fy).floor() as u32;
        let y1 = (((y + 1) as f64 * fy).ceil() as u32).clamp(y0 + 1, h);

        let mut sum = [0u64; 3];
        for sy in y0..y1 {
            for sx in x0..x1 {
                let p = image.get_pixel(sx, sy);
                for c in 0..3 {
                    sum[c] += p[c] as u64;
                }
            }
        }
        let n = ((x1 - x0) * (y1 - y0)) as u64;
        image::Rgb([
            ((sum[0] + n / 2) / n) as u8,
            ((sum[1] + n / 2) / n) as u8,
            ((sum[2] + n / 2) / n) as u8,
        ])
    })
}

/// Apply Contrast-Limited Adaptive Histogram Equalization (CLAHE) in-place.
///
/// `clip_limit` is relative to a uniform histogram: each bin is clipped at
/// `clip_limit × tile_pixels / 256`. Tile CDFs are blended bilinearly.
pub fn clahe_enhance(gray: &mut GrayImage, tiles: u32, clip_limit: f32) {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let t = tiles as usize;
    if w == 0 || h == 0 || t == 0 {
        return;
    }
    let tile_w = w / t;
    let tile_h = h / t;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(t * t);
    for row in 0..t {
        for col in 0..t {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for x in col * tile_w..(col + 1) * tile_w {
                    hist[gray.get_pixel(x as u32, y as u32)[0] as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist + u32::from(i < leftover);
            }

            let mut cdf = [0f32; 256];
            let mut acc = 0f32;
            for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
                acc += count as f32;
                *slot = acc;
            }
            let cdf_min = cdf.iter().find(|&&v| v > 0.0).copied().unwrap_or(0.0);
            let denom = tile_pixels as f32 - cdf_min;
            if denom > 0.0 {
                for v in cdf.iter_mut() {
                    *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
                }
            }
            cdfs.push(cdf);
        }
    }

    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (t - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(t - 1);
        let dy = fy - r0 as f32;
        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (t - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(t - 1);
            let dx = fx - c0 as f32;

            let pixel = gray.get_pixel(x as u32, y as u32)[0] as usize;
            let top = cdfs[r0 * t + c0][pixel] * (1.0 - dx) + cdfs[r0 * t + c1][pixel] * dx;
            let bot = cdfs[r1 * t + c0][pixel] * (1.0 - dx) + cdfs[r1 * t + c1][pixel] * dx;
            let val = top * (1.0 - dy) + bot * dy;
            gray.put_pixel(x as u32, y as u32, Luma([val.round().clamp(0.0, 255.0) as u8]));
        }
    }
}

/// Edge-preserving bilateral smoothing. Empty images pass through.
fn smooth(gray: &GrayImage) -> GrayImage {
    if gray.width() == 0 || gray.height() == 0 {
        return gray.clone();
    }
    bilateral_filter(gray, BILATERAL_WINDOW, BILATERAL_SIGMA_COLOR, BILATERAL_SIGMA_SPACE)
}

/// `amount × image − (amount − 1) × gaussian(image)`, saturated.
pub fn unsharp_mask(gray: &GrayImage, sigma: f32, amount: f32) -> GrayImage {
    let blurred = imageops::blur(gray, sigma);
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let g = gray.get_pixel(x, y)[0] as f32;
        let b = blurred.get_pixel(x, y)[0] as f32;
        Luma([(amount * g - (amount - 1.0) * b).round().clamp(0.0, 255.0) as u8])
    })
}
