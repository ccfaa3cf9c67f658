//! Geometry utilities: working-image resize/crop plans and their affine
//! alignment with original images.

pub mod affine;

pub use affine::{
    AffineTransform, CropWindow, Interpolation, PATCH_ALIGN, ResizePlan, affine_for_image,
};
