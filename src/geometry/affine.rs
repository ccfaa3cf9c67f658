//! Alignment between the stereo model's working image and the original image.
//!
//! The model consumes images whose longer side is resized to a fixed square
//! size and then center-cropped to patch-aligned extents. Predictions live in
//! that working space; `AffineTransform` maps them back to original pixels.

use std::path::Path;

use anyhow::Result;
use nalgebra::{Matrix2x3, Point2, Vector3};

use crate::io::image::image_dimensions;

/// Crop half-extents are `(2 * c / PATCH_ALIGN) * (PATCH_ALIGN / 2)`, so the
/// full crop is a multiple of the model's patch size.
pub const PATCH_ALIGN: u32 = 16;

/// Resampling filter used when producing the working image.
///
/// Does not affect the transform, only pixel values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    /// Downscaling (original longer side exceeds the target).
    Lanczos,
    /// Upscaling or identity.
    Cubic,
}

/// Longer-side resize from original dimensions to the working size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResizePlan {
    pub original_width: u32,
    pub original_height: u32,
    pub width: u32,
    pub height: u32,
    pub interpolation: Interpolation,
}

impl ResizePlan {
    pub fn new(original_width: u32, original_height: u32, size: u32) -> Self {
        let longest = original_width.max(original_height).max(1) as f64;
        let resize = |v: u32| (v as f64 * size as f64 / longest).round_ties_even() as u32;
        let interpolation = if longest > size as f64 {
            Interpolation::Lanczos
        } else {
            Interpolation::Cubic
        };
        Self {
            original_width,
            original_height,
            width: resize(original_width),
            height: resize(original_height),
            interpolation,
        }
    }

    /// Effective horizontal scale (resized / original).
    pub fn scale_x(&self) -> f64 {
        self.width as f64 / self.original_width as f64
    }

    /// Effective vertical scale (resized / original).
    pub fn scale_y(&self) -> f64 {
        self.height as f64 / self.original_height as f64
    }

    pub fn is_square(&self) -> bool {
        self.width == self.height
    }
}

/// Center crop expressed as a center point and half extents (pixels).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    pub cx: u32,
    pub cy: u32,
    pub half_width: u32,
    pub half_height: u32,
}

impl CropWindow {
    /// Patch-aligned window around `(cx, cy)`.
    ///
    /// When `square_ok` is false and the resized image is square, the window
    /// height shrinks to 3/4 of its width.
    pub fn centered(cx: u32, cy: u32, square_ok: bool, resized_is_square: bool) -> Self {
        let half = PATCH_ALIGN / 2;
        let half_width = ((2 * cx) / PATCH_ALIGN) * half;
        let mut half_height = ((2 * cy) / PATCH_ALIGN) * half;
        if !square_ok && resized_is_square {
            half_height = 3 * half_width / 4;
        }
        Self {
            cx,
            cy,
            half_width,
            half_height,
        }
    }

    pub fn left(&self) -> i64 {
        self.cx as i64 - self.half_width as i64
    }

    pub fn top(&self) -> i64 {
        self.cy as i64 - self.half_height as i64
    }

    pub fn width(&self) -> u32 {
        2 * self.half_width
    }

    pub fn height(&self) -> u32 {
        2 * self.half_height
    }
}

/// 2x3 affine map from working-image pixels to original-image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    pub matrix: Matrix2x3<f64>,
}

impl AffineTransform {
    /// Transform for an image of the given original dimensions.
    ///
    /// The crop window is anchored at the target square's center
    /// `(size / 2, size / 2)` and the translation is expressed in original
    /// pixels: `t = (center - half_extent) / scale` per axis.
    pub fn crop_to_original(
        original_width: u32,
        original_height: u32,
        size: u32,
        square_ok: bool,
    ) -> Self {
        let plan = ResizePlan::new(original_width, original_height, size);
        let window = CropWindow::centered(size / 2, size / 2, square_ok, plan.is_square());

        let scale_x = plan.scale_x();
        let scale_y = plan.scale_y();
        let translate_x = window.left() as f64 / scale_x;
        let translate_y = window.top() as f64 / scale_y;

        Self {
            matrix: Matrix2x3::new(
                1.0 / scale_x, 0.0, translate_x,
                0.0, 1.0 / scale_y, translate_y,
            ),
        }
    }

    pub fn apply(&self, point: &Point2<f64>) -> Point2<f64> {
        let mapped = self.matrix * Vector3::new(point.x, point.y, 1.0);
        Point2::new(mapped.x, mapped.y)
    }

    /// Row-major `[[a, b, tx], [c, d, ty]]`.
    pub fn to_rows(&self) -> [[f64; 3]; 2] {
        let m = &self.matrix;
        [
            [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
            [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
        ]
    }
}

/// Reads the image header/pixels at `path` and computes its transform.
///
/// Fails with `DataError::ImageNotFound` or `DataError::ImageDecode`.
pub fn affine_for_image(path: &Path, size: u32, square_ok: bool) -> Result<AffineTransform> {
    let (width, height) = image_dimensions(path)?;
    Ok(AffineTransform::crop_to_original(width, height, size, square_ok))
}
