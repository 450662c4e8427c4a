//! Pixel filters shared by the engines
//!
//! Filters work on single-channel `f32` planes in `[0, 1]`, shaped
//! `(height, width)`. Passing `parallel = true` spreads per-pixel work over the
//! rayon pool.

use ndarray::{array, Array2, Zip};

use common::error::Result;
use common::types::{ImageBuffer, ProcessingOptions};

/// Single-channel image plane
pub type Plane = Array2<f32>;

/// Luminance plane of an RGBA image, composited over white
pub fn luminance(image: &ImageBuffer) -> Plane {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let pixels = image.pixels();

    Array2::from_shape_fn((height, width), |(y, x)| {
        let idx = (y * width + x) * 4;
        let [r, g, b, a] = [pixels[idx], pixels[idx + 1], pixels[idx + 2], pixels[idx + 3]];
        let luma = (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32) / 255.0;
        let alpha = a as f32 / 255.0;
        luma * alpha + (1.0 - alpha)
    })
}

/// 2-D convolution with clamped edges
pub fn convolve(plane: &Plane, kernel: &Array2<f32>, parallel: bool) -> Plane {
    let (height, width) = plane.dim();
    let (kh, kw) = kernel.dim();
    let (ry, rx) = (kh / 2, kw / 2);

    let cell = |(y, x): (usize, usize)| -> f32 {
        let mut acc = 0.0;
        for ky in 0..kh {
            let sy = (y + ky).saturating_sub(ry).min(height - 1);
            for kx in 0..kw {
                let sx = (x + kx).saturating_sub(rx).min(width - 1);
                acc += plane[[sy, sx]] * kernel[[ky, kx]];
            }
        }
        acc
    };

    let mut out = Plane::zeros((height, width));
    let zip = Zip::indexed(&mut out);
    if parallel {
        zip.par_for_each(|idx, value| *value = cell(idx));
    } else {
        zip.for_each(|idx, value| *value = cell(idx));
    }
    out
}

/// Box blur of the given radius; radius 0 returns a copy
pub fn box_blur(plane: &Plane, radius: usize, parallel: bool) -> Plane {
    if radius == 0 {
        return plane.clone();
    }
    let side = radius * 2 + 1;
    let kernel = Array2::from_elem((side, side), 1.0 / (side * side) as f32);
    convolve(plane, &kernel, parallel)
}

/// Sobel gradient magnitude, normalized to `[0, 1]`
pub fn sobel(plane: &Plane, parallel: bool) -> Plane {
    let gx_kernel = array![[-1.0f32, 0.0, 1.0], [-2.0, 0.0, 2.0], [-1.0, 0.0, 1.0]];
    let gy_kernel = array![[-1.0f32, -2.0, -1.0], [0.0, 0.0, 0.0], [1.0, 2.0, 1.0]];

    let gx = convolve(plane, &gx_kernel, parallel);
    let gy = convolve(plane, &gy_kernel, parallel);

    let mut magnitude = Plane::zeros(plane.dim());
    Zip::from(&mut magnitude)
        .and(&gx)
        .and(&gy)
        .for_each(|m, &x, &y| *m = (x * x + y * y).sqrt());
    normalize(&magnitude)
}

/// Rescales values to `[0, 1]`; a flat plane becomes all zeros
pub fn normalize(plane: &Plane) -> Plane {
    let max = plane.iter().fold(f32::MIN, |m, v| m.max(*v));
    let min = plane.iter().fold(f32::MAX, |m, v| m.min(*v));
    let range = max - min;
    if !range.is_finite() || range <= f32::EPSILON {
        return Plane::zeros(plane.dim());
    }
    plane.mapv(|v| (v - min) / range)
}

/// 1.0 where the value reaches `level`, else 0.0
pub fn threshold(plane: &Plane, level: f32) -> Plane {
    plane.mapv(|v| if v >= level { 1.0 } else { 0.0 })
}

pub fn invert(plane: &Plane) -> Plane {
    plane.mapv(|v| 1.0 - v)
}

/// Quantizes values to `levels` evenly spaced steps
pub fn posterize(plane: &Plane, levels: u8) -> Plane {
    let steps = levels.max(2) as f32 - 1.0;
    plane.mapv(|v| (v.clamp(0.0, 1.0) * steps).round() / steps)
}

/// `plane * (1 - alpha) + other * alpha`
pub fn blend(plane: &Plane, other: &Plane, alpha: f32) -> Plane {
    let alpha = alpha.clamp(0.0, 1.0);
    let mut out = plane.clone();
    Zip::from(&mut out)
        .and(other)
        .for_each(|o, &b| *o = *o * (1.0 - alpha) + b * alpha);
    out
}

/// Renders an edge plane as a grey RGBA sketch
///
/// Strokes are scaled by the intensity option; with `invert` set they are drawn
/// dark on a light background.
pub fn render(edges: &Plane, options: &ProcessingOptions) -> Result<ImageBuffer> {
    let (height, width) = edges.dim();
    let gain = 0.5 + options.clamped_intensity() * 1.5;

    let mut pixels = Vec::with_capacity(width * height * 4);
    for &edge in edges.iter() {
        let stroke = (edge * gain).clamp(0.0, 1.0);
        let value = if options.invert { 1.0 - stroke } else { stroke };
        let byte = (value * 255.0).round() as u8;
        pixels.extend_from_slice(&[byte, byte, byte, 255]);
    }

    ImageBuffer::new(width as u32, height as u32, pixels)
}
