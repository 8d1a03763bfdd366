//! Image decoding and the two preprocessing pipelines: stochastic
//! augmentation for training and a deterministic resize/center-crop for
//! inference. Both end in ImageNet per-channel standardization.

use crate::config::{IMAGENET_MEAN, IMAGENET_STD};
use crate::error::{CarStateError, Result};
use image::{imageops::FilterType, DynamicImage, ImageReader, Rgb, RgbImage};
use rand::Rng;
use std::fmt::Debug;
use std::path::Path;

/// Turns a decoded image into normalized CHW data of `3 * resolution²` floats.
pub trait ImageTransform: Send + Sync + Debug {
    fn apply(&self, image: DynamicImage) -> Vec<f32>;

    /// Side length of the square output.
    fn resolution(&self) -> usize;
}

/// Decodes `path`, picking the format from the file's leading bytes so a
/// mislabelled extension still decodes.
pub fn decode_image(path: &Path) -> Result<DynamicImage> {
    let decode_error = |source| CarStateError::Decode {
        path: path.to_path_buf(),
        source,
    };
    ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| decode_error(image::ImageError::IoError(e)))?
        .decode()
        .map_err(decode_error)
}

/// RGB bytes to CHW floats, scaled to `[0, 1]` then standardized.
pub fn to_normalized_chw(image: &RgbImage) -> Vec<f32> {
    let frame_size = (image.width() * image.height()) as usize;
    let mut chw_data = vec![0.0; frame_size * 3];

    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..3 {
            chw_data[i + c * frame_size] =
                (pixel[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }

    chw_data
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceTransform {
    pub resize_size: usize,
    pub image_size: usize,
}

impl InferenceTransform {
    pub fn new(resize_size: usize, image_size: usize) -> Self {
        Self {
            resize_size,
            image_size,
        }
    }

    /// Shorter side to `resize_size`, then a centered `image_size` square.
    pub fn prepare(&self, image: &DynamicImage) -> RgbImage {
        let (width, height) = (image.width(), image.height());
        let short = width.min(height).max(1) as f64;
        let scale = self.resize_size as f64 / short;
        let new_width = ((width as f64 * scale).round() as u32).max(self.image_size as u32);
        let new_height = ((height as f64 * scale).round() as u32).max(self.image_size as u32);

        let resized = image.resize_exact(new_width, new_height, FilterType::Triangle);

        let size = self.image_size as u32;
        let left = ((new_width - size) as f64 / 2.0).round() as u32;
        let top = ((new_height - size) as f64 / 2.0).round() as u32;

        resized.crop_imm(left, top, size, size).to_rgb8()
    }
}

impl ImageTransform for InferenceTransform {
    fn apply(&self, image: DynamicImage) -> Vec<f32> {
        to_normalized_chw(&self.prepare(&image))
    }

    fn resolution(&self) -> usize {
        self.image_size
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainTransform {
    pub image_size: usize,
    pub flip_probability: f64,
    pub max_rotation_degrees: f32,
    pub crop_scale: (f32, f32),
    pub crop_ratio: (f32, f32),
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub hue: f32,
}

impl TrainTransform {
    pub fn new(image_size: usize) -> Self {
        Self {
            image_size,
            flip_probability: 0.5,
            max_rotation_degrees: 15.0,
            crop_scale: (0.8, 1.0),
            crop_ratio: (3.0 / 4.0, 4.0 / 3.0),
            brightness: 0.2,
            contrast: 0.2,
            saturation: 0.2,
            hue: 0.1,
        }
    }

    pub fn prepare_with_rng<R: Rng + ?Sized>(&self, image: &DynamicImage, rng: &mut R) -> RgbImage {
        let mut rgb = image.to_rgb8();

        if rng.random_bool(self.flip_probability) {
            rgb = image::imageops::flip_horizontal(&rgb);
        }

        let angle = rng.random_range(-self.max_rotation_degrees..=self.max_rotation_degrees);
        let rotated = rotate_about_center(&rgb, angle);

        let (left, top, width, height) = self.sample_crop(rotated.width(), rotated.height(), rng);
        let cropped = image::imageops::crop_imm(&rotated, left, top, width, height).to_image();
        let size = self.image_size as u32;
        let mut resized = image::imageops::resize(&cropped, size, size, FilterType::Triangle);

        self.jitter(&mut resized, rng);
        resized
    }

    fn sample_crop<R: Rng + ?Sized>(&self, width: u32, height: u32, rng: &mut R) -> (u32, u32, u32, u32) {
        let area = (width * height) as f32;
        let (log_min, log_max) = (self.crop_ratio.0.ln(), self.crop_ratio.1.ln());

        for _ in 0..10 {
            let target_area = area * rng.random_range(self.crop_scale.0..=self.crop_scale.1);
            let ratio = rng.random_range(log_min..=log_max).exp();

            let w = (target_area * ratio).sqrt().round() as u32;
            let h = (target_area / ratio).sqrt().round() as u32;

            if w > 0 && h > 0 && w <= width && h <= height {
                let left = rng.random_range(0..=width - w);
                let top = rng.random_range(0..=height - h);
                return (left, top, w, h);
            }
        }

        // Center crop with the ratio clamped into range.
        let in_ratio = width as f32 / height.max(1) as f32;
        let (w, h) = if in_ratio < self.crop_ratio.0 {
            (width, ((width as f32 / self.crop_ratio.0).round() as u32).min(height))
        } else if in_ratio > self.crop_ratio.1 {
            (((height as f32 * self.crop_ratio.1).round() as u32).min(width), height)
        } else {
            (width, height)
        };
        ((width - w) / 2, (height - h) / 2, w.max(1), h.max(1))
    }

    fn jitter<R: Rng + ?Sized>(&self, image: &mut RgbImage, rng: &mut R) {
        let brightness = rng.random_range(1.0 - self.brightness..=1.0 + self.brightness);
        let contrast = rng.random_range(1.0 - self.contrast..=1.0 + self.contrast);
        let saturation = rng.random_range(1.0 - self.saturation..=1.0 + self.saturation);
        let hue_shift = rng.random_range(-self.hue..=self.hue);

        let mut pixels: Vec<[f32; 3]> = image
            .pixels()
            .map(|p| [p[0] as f32 / 255.0, p[1] as f32 / 255.0, p[2] as f32 / 255.0])
            .collect();

        for p in pixels.iter_mut() {
            for c in p.iter_mut() {
                *c = (*c * brightness).clamp(0.0, 1.0);
            }
        }

        let mean_gray = pixels.iter().map(|p| grayscale(*p)).sum::<f32>() / pixels.len().max(1) as f32;
        for p in pixels.iter_mut() {
            for c in p.iter_mut() {
                *c = blend(*c, mean_gray, contrast);
            }
        }

        for p in pixels.iter_mut() {
            let gray = grayscale(*p);
            for c in p.iter_mut() {
                *c = blend(*c, gray, saturation);
            }
        }

        for p in pixels.iter_mut() {
            *p = shift_hue(*p, hue_shift);
        }

        for (dst, src) in image.pixels_mut().zip(pixels) {
            *dst = Rgb(src.map(|c| (c * 255.0).round().clamp(0.0, 255.0) as u8));
        }
    }
}

impl ImageTransform for TrainTransform {
    fn apply(&self, image: DynamicImage) -> Vec<f32> {
        to_normalized_chw(&self.prepare_with_rng(&image, &mut rand::rng()))
    }

    fn resolution(&self) -> usize {
        self.image_size
    }
}

/// Rotates counter-clockwise by `degrees` on the same canvas, bilinear, black fill.
fn rotate_about_center(image: &RgbImage, degrees: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    let (cx, cy) = ((width as f32 - 1.0) / 2.0, (height as f32 - 1.0) / 2.0);
    let (sin, cos) = degrees.to_radians().sin_cos();

    RgbImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let sx = cos * dx - sin * dy + cx;
        let sy = sin * dx + cos * dy + cy;
        sample_bilinear(image, sx, sy)
    })
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    if x < -0.5 || y < -0.5 || x > width as f32 - 0.5 || y > height as f32 - 0.5 {
        return Rgb([0, 0, 0]);
    }

    let x = x.clamp(0.0, width as f32 - 1.0);
    let y = y.clamp(0.0, height as f32 - 1.0);
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(width - 1), (y0 + 1).min(height - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

fn grayscale([r, g, b]: [f32; 3]) -> f32 {
    0.299 * r + 0.587 * g + 0.114 * b
}

fn blend(value: f32, reference: f32, factor: f32) -> f32 {
    (factor * value + (1.0 - factor) * reference).clamp(0.0, 1.0)
}

/// Shifts hue by `shift` turns through HSV.
fn shift_hue([r, g, b]: [f32; 3], shift: f32) -> [f32; 3] {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    if delta <= f32::EPSILON {
        return [r, g, b];
    }

    let sector = if max == r {
        ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        (b - r) / delta + 2.0
    } else {
        (r - g) / delta + 4.0
    };

    let hue = (sector / 6.0 + shift).rem_euclid(1.0);
    let saturation = delta / max;
    hsv_to_rgb(hue, saturation, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [f32; 3] {
    let sector = h * 6.0;
    let i = sector.floor();
    let f = sector - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    match (i as i32).rem_euclid(6) {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}
