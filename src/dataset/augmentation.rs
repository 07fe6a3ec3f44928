//! Data augmentation for training patches.
//!
//! The pipeline extracts an oversized patch, optionally blends it with a
//! recently produced patch (mixup), applies geometric and color augmentations,
//! then center-crops to the final size. Extracting 1.5x the target edge before
//! rotating and cropping keeps rotation fill artifacts out of the final patch.

use image::{imageops, ImageBuffer, Rgb, RgbImage};
use rand::Rng;
use rand_distr::{Beta, Distribution};

/// Augmentation policy for the sample pipeline.
#[derive(Debug, Clone)]
pub struct Augmentor {
    target_size: u32,
    extraction_size: u32,
}

impl Augmentor {
    /// Policy producing `target_size` x `target_size` patches. Patches are
    /// extracted at 1.5x that edge length to leave room for rotation.
    pub fn new(target_size: u32) -> Self {
        Self {
            target_size,
            extraction_size: (target_size as f32 * 1.5) as u32,
        }
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    pub fn extraction_size(&self) -> u32 {
        self.extraction_size
    }

    /// Extract an oversized square patch at a uniformly random offset.
    ///
    /// If the source is too small on either axis, it is center-cropped/padded
    /// to a square of its smaller dimension and upscaled to extraction size
    /// instead.
    pub fn extract_patch<R: Rng>(&self, img: &RgbImage, rng: &mut R) -> RgbImage {
        let (width, height) = img.dimensions();
        let size = self.extraction_size;

        if width > size && height > size {
            let x = rng.gen_range(0..width - size);
            let y = rng.gen_range(0..height - size);
            imageops::crop_imm(img, x, y, size, size).to_image()
        } else {
            let min_dim = width.min(height).max(1);
            let square = center_crop_or_pad(img, min_dim);
            imageops::resize(&square, size, size, imageops::FilterType::Triangle)
        }
    }

    /// Random flips, rotation and color jitter, in that order.
    pub fn apply<R: Rng>(&self, patch: &RgbImage, rng: &mut R) -> RgbImage {
        let mut out = patch.clone();

        if rng.gen_bool(0.5) {
            out = imageops::flip_horizontal(&out);
        }
        if rng.gen_bool(0.5) {
            out = imageops::flip_vertical(&out);
        }
        if rng.gen_bool(0.7) {
            let angle = rng.gen_range(-45.0f32..45.0);
            out = rotate_bilinear(&out, angle);
        }

        let brightness = rng.gen_range(0.7f32..1.3);
        out = adjust_brightness(&out, brightness);
        let contrast = rng.gen_range(0.7f32..1.3);
        out = adjust_contrast(&out, contrast);
        let saturation = rng.gen_range(0.7f32..1.3);
        out = adjust_saturation(&out, saturation);

        out
    }

    /// Final center crop/pad to the exact target size.
    pub fn finalize(&self, patch: &RgbImage) -> RgbImage {
        center_crop_or_pad(patch, self.target_size)
    }
}

/// Blend two patches with a Beta(0.2, 0.2)-distributed weight.
///
/// The partner is resized to the primary's dimensions first, so the output
/// shape always equals the primary's shape.
pub fn mixup<R: Rng>(primary: &RgbImage, partner: &RgbImage, rng: &mut R) -> RgbImage {
    let lam = Beta::new(0.2, 0.2)
        .expect("valid beta parameters")
        .sample(rng) as f32;

    let (width, height) = primary.dimensions();
    let partner = if partner.dimensions() != (width, height) {
        imageops::resize(partner, width, height, imageops::FilterType::Triangle)
    } else {
        partner.clone()
    };

    ImageBuffer::from_fn(width, height, |x, y| {
        let a = primary.get_pixel(x, y);
        let b = partner.get_pixel(x, y);
        Rgb([
            blend(a[0], b[0], lam),
            blend(a[1], b[1], lam),
            blend(a[2], b[2], lam),
        ])
    })
}

fn blend(a: u8, b: u8, lam: f32) -> u8 {
    (lam * a as f32 + (1.0 - lam) * b as f32).clamp(0.0, 255.0) as u8
}

/// Rotate by an arbitrary angle (degrees) around the image center, sampling
/// bilinearly, with black fill outside the source.
pub fn rotate_bilinear(img: &RgbImage, angle_deg: f32) -> RgbImage {
    let (width, height) = img.dimensions();
    let theta = angle_deg.to_radians();
    let (sin, cos) = theta.sin_cos();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    ImageBuffer::from_fn(width, height, |x, y| {
        // Inverse mapping: rotate the destination coordinate back into the
        // source image.
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let src_x = cos * dx + sin * dy + cx;
        let src_y = -sin * dx + cos * dy + cy;
        sample_bilinear(img, src_x, src_y)
    })
}

fn sample_bilinear(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    if x < 0.0 || y < 0.0 || x > (width - 1) as f32 || y > (height - 1) as f32 {
        return Rgb([0, 0, 0]);
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Center crop or pad to a square of the given edge, black fill.
pub fn center_crop_or_pad(img: &RgbImage, size: u32) -> RgbImage {
    let (width, height) = img.dimensions();
    if width == size && height == size {
        return img.clone();
    }

    let mut out = RgbImage::new(size, size);

    let copy_w = width.min(size);
    let copy_h = height.min(size);
    let src_x = (width.saturating_sub(size)) / 2;
    let src_y = (height.saturating_sub(size)) / 2;
    let dst_x = (size.saturating_sub(width)) / 2;
    let dst_y = (size.saturating_sub(height)) / 2;

    for y in 0..copy_h {
        for x in 0..copy_w {
            out.put_pixel(dst_x + x, dst_y + y, *img.get_pixel(src_x + x, src_y + y));
        }
    }
    out
}

/// Scale each channel by a brightness factor.
pub fn adjust_brightness(img: &RgbImage, factor: f32) -> RgbImage {
    let (width, height) = img.dimensions();
    ImageBuffer::from_fn(width, height, |x, y| {
        let pixel = img.get_pixel(x, y);
        Rgb([
            (pixel[0] as f32 * factor).clamp(0.0, 255.0) as u8,
            (pixel[1] as f32 * factor).clamp(0.0, 255.0) as u8,
            (pixel[2] as f32 * factor).clamp(0.0, 255.0) as u8,
        ])
    })
}

/// Scale the distance from the mean intensity by a contrast factor.
pub fn adjust_contrast(img: &RgbImage, factor: f32) -> RgbImage {
    let (width, height) = img.dimensions();

    let mut sum = 0.0f64;
    for pixel in img.pixels() {
        sum += (pixel[0] as f64 + pixel[1] as f64 + pixel[2] as f64) / 3.0;
    }
    let mean = (sum / (width as f64 * height as f64)) as f32;

    ImageBuffer::from_fn(width, height, |x, y| {
        let pixel = img.get_pixel(x, y);
        Rgb([
            (mean + factor * (pixel[0] as f32 - mean)).clamp(0.0, 255.0) as u8,
            (mean + factor * (pixel[1] as f32 - mean)).clamp(0.0, 255.0) as u8,
            (mean + factor * (pixel[2] as f32 - mean)).clamp(0.0, 255.0) as u8,
        ])
    })
}

/// Interpolate between grayscale and the original by a saturation factor.
pub fn adjust_saturation(img: &RgbImage, factor: f32) -> RgbImage {
    let (width, height) = img.dimensions();
    ImageBuffer::from_fn(width, height, |x, y| {
        let pixel = img.get_pixel(x, y);
        let gray = 0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32;
        Rgb([
            (gray + factor * (pixel[0] as f32 - gray)).clamp(0.0, 255.0) as u8,
            (gray + factor * (pixel[1] as f32 - gray)).clamp(0.0, 255.0) as u8,
            (gray + factor * (pixel[2] as f32 - gray)).clamp(0.0, 255.0) as u8,
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn checkerboard(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([220, 40, 40])
            } else {
                Rgb([40, 220, 40])
            }
        })
    }

    #[test]
    fn test_extraction_size_is_one_and_a_half_target() {
        let aug = Augmentor::new(64);
        assert_eq!(aug.extraction_size(), 96);
    }

    #[test]
    fn test_extract_patch_from_large_image() {
        let aug = Augmentor::new(16);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let img = checkerboard(100);
        let patch = aug.extract_patch(&img, &mut rng);
        assert_eq!(patch.dimensions(), (24, 24));
    }

    #[test]
    fn test_extract_patch_from_small_image_upscales() {
        let aug = Augmentor::new(64);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        // Smaller than the 96px extraction size on one axis.
        let img = checkerboard(40);
        let patch = aug.extract_patch(&img, &mut rng);
        assert_eq!(patch.dimensions(), (96, 96));
    }

    #[test]
    fn test_mixup_output_matches_primary_shape() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let primary = checkerboard(24);
        let partner = checkerboard(64);
        let mixed = mixup(&primary, &partner, &mut rng);
        assert_eq!(mixed.dimensions(), primary.dimensions());

        // Same-size partner too.
        let partner_same = checkerboard(24);
        let mixed_same = mixup(&primary, &partner_same, &mut rng);
        assert_eq!(mixed_same.dimensions(), primary.dimensions());
    }

    #[test]
    fn test_rotation_preserves_dimensions_and_fills_black() {
        let img = RgbImage::from_pixel(32, 32, Rgb([255, 255, 255]));
        let rotated = rotate_bilinear(&img, 45.0);
        assert_eq!(rotated.dimensions(), (32, 32));
        // Corners fall outside the rotated source and must be black fill.
        assert_eq!(*rotated.get_pixel(0, 0), Rgb([0, 0, 0]));
        // The center stays inside the source.
        assert_eq!(*rotated.get_pixel(16, 16), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_zero_rotation_is_identity() {
        let img = checkerboard(16);
        let rotated = rotate_bilinear(&img, 0.0);
        assert_eq!(rotated, img);
    }

    #[test]
    fn test_center_crop() {
        let img = checkerboard(32);
        let cropped = center_crop_or_pad(&img, 16);
        assert_eq!(cropped.dimensions(), (16, 16));
        // Crop is centered: pixel (0,0) of the crop is pixel (8,8) of the
        // original.
        assert_eq!(cropped.get_pixel(0, 0), img.get_pixel(8, 8));
    }

    #[test]
    fn test_center_pad() {
        let img = RgbImage::from_pixel(8, 8, Rgb([100, 100, 100]));
        let padded = center_crop_or_pad(&img, 16);
        assert_eq!(padded.dimensions(), (16, 16));
        assert_eq!(*padded.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*padded.get_pixel(8, 8), Rgb([100, 100, 100]));
    }

    #[test]
    fn test_brightness_extremes() {
        let img = RgbImage::from_pixel(4, 4, Rgb([100, 150, 200]));
        let dark = adjust_brightness(&img, 0.5);
        assert_eq!(*dark.get_pixel(0, 0), Rgb([50, 75, 100]));
        let bright = adjust_brightness(&img, 2.0);
        assert_eq!(*bright.get_pixel(0, 0), Rgb([200, 255, 255]));
    }

    #[test]
    fn test_saturation_zero_is_grayscale() {
        let img = RgbImage::from_pixel(4, 4, Rgb([200, 50, 50]));
        let gray = adjust_saturation(&img, 0.0);
        let p = gray.get_pixel(0, 0);
        assert_eq!(p[0], p[1]);
        assert_eq!(p[1], p[2]);
    }

    #[test]
    fn test_apply_preserves_dimensions() {
        let aug = Augmentor::new(16);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let patch = checkerboard(24);
        for _ in 0..10 {
            let out = aug.apply(&patch, &mut rng);
            assert_eq!(out.dimensions(), patch.dimensions());
        }
    }
}
