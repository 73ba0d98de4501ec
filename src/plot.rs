//! Draws a spectrum as a PNG line plot.
//!
//! No labels, just a frame and the trace, scaled to fill the plot area. The
//! identifier and axis values live in the `.spec` file next to it.

use crate::spectrum::Spectrum;

use image::{ImageResult, Rgb, RgbImage};
use std::path::Path;

/// Output size in pixels.
pub const WIDTH: u32 = 800;
/// Output height in pixels.
pub const HEIGHT: u32 = 400;

const MARGIN: u32 = 20;
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const FRAME: Rgb<u8> = Rgb([160, 160, 160]);
const TRACE: Rgb<u8> = Rgb([31, 119, 180]);

/// Renders `spectrum` into an image.
pub fn render(spectrum: &Spectrum) -> RgbImage {
    let mut img = RgbImage::from_pixel(WIDTH, HEIGHT, BACKGROUND);
    let (left, right) = (MARGIN, WIDTH - MARGIN - 1);
    let (top, bottom) = (MARGIN, HEIGHT - MARGIN - 1);

    for x in left..=right {
        img.put_pixel(x, top, FRAME);
        img.put_pixel(x, bottom, FRAME);
    }
    for y in top..=bottom {
        img.put_pixel(left, y, FRAME);
        img.put_pixel(right, y, FRAME);
    }

    let values: Vec<f32> = spectrum.power.iter().copied().filter(|p| p.is_finite()).collect();
    if values.len() < 2 {
        return img;
    }
    let low = values.iter().copied().fold(f32::INFINITY, f32::min);
    let high = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let span = if high > low { high - low } else { 1.0 };

    let inner_w = (right - left - 2) as f32;
    let inner_h = (bottom - top - 2) as f32;
    let last = (values.len() - 1) as f32;
    let point = |i: usize, v: f32| -> (f32, f32) {
        let x = (left + 1) as f32 + inner_w * i as f32 / last;
        let y = (bottom - 1) as f32 - inner_h * (v - low) / span;
        (x, y)
    };

    for (i, pair) in values.windows(2).enumerate() {
        let (x0, y0) = point(i, pair[0]);
        let (x1, y1) = point(i + 1, pair[1]);
        let steps = (x1 - x0).abs().max((y1 - y0).abs()).ceil().max(1.0) as u32;
        for s in 0..=steps {
            let t = s as f32 / steps as f32;
            let x = (x0 + (x1 - x0) * t).round() as u32;
            let y = (y0 + (y1 - y0) * t).round() as u32;
            img.put_pixel(x, y, TRACE);
        }
    }
    img
}

/// Renders `spectrum` and saves it as a PNG at `path`.
pub fn write_png(spectrum: &Spectrum, path: &Path) -> ImageResult<()> {
    render(spectrum).save_with_format(path, image::ImageFormat::Png)
}
