//! Sample descriptors (index entries) and fully materialized sample records.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::geometry::AffineTransform;
use crate::io::{NumericArray, WorkingImage, WorldAnnotation};

/// Annotation and image locations of one camera for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraPaths {
    pub pose2d: PathBuf,
    /// `None` when the sequence has no bbox annotations for this camera.
    pub bbox: Option<PathBuf>,
    /// Derived from `pose2d` by the layout convention.
    pub image: PathBuf,
}

/// One (sequence, frame) entry of the index. Cheap: paths and the frame's
/// world annotation only.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleDescriptor {
    pub sequence: String,
    pub frame: usize,
    /// Human name -> world-space body parameters for this frame.
    pub world: WorldAnnotation,
    /// Selected cameras, sorted.
    pub cameras: Vec<String>,
    /// Keyed by camera name; same key set as `cameras`.
    pub paths: BTreeMap<String, CameraPaths>,
}

/// 2D annotation of one human seen by one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct HumanAnnotation2d {
    pub pose2d: NumericArray,
    pub bbox: NumericArray,
}

/// Human name -> 2D annotation.
pub type CameraAnnotation2d = BTreeMap<String, HumanAnnotation2d>;

/// Everything the inference stage needs for one multi-view sample.
#[derive(Debug, Clone)]
pub struct SampleRecord {
    pub sequence: String,
    pub frame: usize,
    pub images: BTreeMap<String, WorkingImage>,
    pub affine_transforms: BTreeMap<String, AffineTransform>,
    /// Subset of the cameras in `images`.
    pub annotations_2d: BTreeMap<String, CameraAnnotation2d>,
    pub world: WorldAnnotation,
}

impl SampleRecord {
    /// Camera names in sorted order.
    pub fn camera_names(&self) -> Vec<String> {
        self.images.keys().cloned().collect()
    }

    /// Transforms in sorted camera order.
    pub fn ordered_transforms(&self) -> Vec<AffineTransform> {
        self.images
            .keys()
            .filter_map(|cam| self.affine_transforms.get(cam).copied())
            .collect()
    }
}
