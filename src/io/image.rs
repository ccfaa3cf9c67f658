//! Raster image loading for the stereo model's working representation.

use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array3;
use opencv::core::{Mat, Rect, Size, Vec3f, CV_32FC3};
use opencv::prelude::*;
use opencv::{imgcodecs, imgproc};

use crate::error::DataError;
use crate::geometry::{CropWindow, Interpolation, ResizePlan};

/// Resized, center-cropped and normalized image as fed to the model.
#[derive(Debug, Clone)]
pub struct WorkingImage {
    /// RGB, CHW, values in [-1, 1].
    pub tensor: Array3<f32>,
    /// (height, width) of `tensor`.
    pub true_shape: [u32; 2],
    /// (width, height) of the file before resizing.
    pub original_size: (u32, u32),
}

impl WorkingImage {
    pub fn height(&self) -> usize {
        self.tensor.shape()[1]
    }

    pub fn width(&self) -> usize {
        self.tensor.shape()[2]
    }
}

/// Reads an 8-bit BGR image.
pub fn read_color(path: &Path) -> Result<Mat> {
    if !path.exists() {
        return Err(DataError::ImageNotFound(path.to_path_buf()).into());
    }
    let path_str = path
        .to_str()
        .ok_or_else(|| DataError::ImageDecode(path.to_path_buf()))?;
    let image = imgcodecs::imread(path_str, imgcodecs::IMREAD_COLOR)
        .with_context(|| format!("Failed to read image {:?}", path))?;
    if image.empty() {
        return Err(DataError::ImageDecode(path.to_path_buf()).into());
    }
    Ok(image)
}

/// Original (width, height) of the image at `path`.
pub fn image_dimensions(path: &Path) -> Result<(u32, u32)> {
    let image = read_color(path)?;
    Ok((image.cols() as u32, image.rows() as u32))
}

/// Loads `path` into the model's working representation.
///
/// Longer side resized to `size`, then cropped around the resized image's
/// center with patch-aligned extents.
pub fn load_working_image(path: &Path, size: u32, square_ok: bool) -> Result<WorkingImage> {
    let bgr = read_color(path)?;
    let original_size = (bgr.cols() as u32, bgr.rows() as u32);
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(&bgr, &mut rgb, imgproc::COLOR_BGR2RGB)?;

    let plan = ResizePlan::new(original_size.0, original_size.1, size);
    let flag = match plan.interpolation {
        Interpolation::Lanczos => imgproc::INTER_LANCZOS4,
        Interpolation::Cubic => imgproc::INTER_CUBIC,
    };
    let mut resized = Mat::default();
    imgproc::resize(
        &rgb,
        &mut resized,
        Size::new(plan.width as i32, plan.height as i32),
        0.0,
        0.0,
        flag,
    )
    .with_context(|| format!("Failed to resize {:?}", path))?;

    let window = CropWindow::centered(plan.width / 2, plan.height / 2, square_ok, plan.is_square());
    let roi = Rect::new(
        window.left() as i32,
        window.top() as i32,
        window.width() as i32,
        window.height() as i32,
    );
    let cropped = Mat::roi(&resized, roi)?.try_clone()?;

    let mut float_mat = Mat::default();
    cropped.convert_to(&mut float_mat, CV_32FC3, 1.0, 0.0)?;

    let (h, w) = (window.height() as usize, window.width() as usize);
    let mut tensor = Array3::<f32>::zeros((3, h, w));
    for y in 0..h {
        for x in 0..w {
            let pixel = float_mat.at_2d::<Vec3f>(y as i32, x as i32)?;
            for c in 0..3 {
                tensor[[c, y, x]] = (pixel[c] / 255.0 - 0.5) / 0.5;
            }
        }
    }

    Ok(WorkingImage {
        tensor,
        true_shape: [h as u32, w as u32],
        original_size,
    })
}
