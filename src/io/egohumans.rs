//! EgoHumans annotation schema.
//!
//! Per-sequence metadata (`parsed_annot_hongsuk.pkl`):
//!
//! ```text
//! num_frames: int
//! cameras: { cam_name: { cam2world_R, cam2world_t, K, img_width, img_height } }
//! frame_data: [ { world_data: { human_name: { global_orient, transl, betas, body_pose } } } ]
//! per_view_2d_annot: { cam_name: { pose2d_annot_path_list: [..], bbox_annot_path_list: [..] } }
//! ```
//!
//! Path lists are index-aligned with frame numbers. The bbox list may be empty.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use super::layout::SEQUENCE_ANNOTATION_FILE;
use super::numeric::NumericArray;
use super::pickle::read_pickle;
use crate::error::DataError;

/// Calibration of one camera. Read-only after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCamera", into = "RawCamera")]
pub struct CameraParameters {
    /// Camera-to-world rotation.
    pub rotation: Matrix3<f64>,
    /// Camera-to-world translation.
    pub translation: Vector3<f64>,
    /// Intrinsic matrix K.
    pub intrinsics: Matrix3<f64>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCamera {
    #[serde(rename = "cam2world_R")]
    rotation: NumericArray,
    #[serde(rename = "cam2world_t")]
    translation: NumericArray,
    #[serde(rename = "K")]
    intrinsics: NumericArray,
    img_width: u32,
    img_height: u32,
}

fn matrix3(name: &str, array: &NumericArray) -> Result<Matrix3<f64>, DataError> {
    if array.len() != 9 {
        return Err(DataError::InvalidSchema(format!(
            "{} must have 9 entries, got shape {:?}",
            name,
            array.shape()
        )));
    }
    Ok(Matrix3::from_row_slice(array.data()))
}

impl TryFrom<RawCamera> for CameraParameters {
    type Error = DataError;

    fn try_from(raw: RawCamera) -> Result<Self, Self::Error> {
        if raw.translation.len() != 3 {
            return Err(DataError::InvalidSchema(format!(
                "cam2world_t must have 3 entries, got shape {:?}",
                raw.translation.shape()
            )));
        }
        Ok(Self {
            rotation: matrix3("cam2world_R", &raw.rotation)?,
            translation: Vector3::from_column_slice(raw.translation.data()),
            intrinsics: matrix3("K", &raw.intrinsics)?,
            width: raw.img_width,
            height: raw.img_height,
        })
    }
}

impl From<CameraParameters> for RawCamera {
    fn from(camera: CameraParameters) -> Self {
        let rows = |m: &Matrix3<f64>| {
            let mut out = [[0.0; 3]; 3];
            for (r, row) in out.iter_mut().enumerate() {
                for (c, v) in row.iter_mut().enumerate() {
                    *v = m[(r, c)];
                }
            }
            NumericArray::from_rows(&out)
        };
        Self {
            rotation: rows(&camera.rotation),
            translation: NumericArray::from_vec(camera.translation.iter().copied().collect()),
            intrinsics: rows(&camera.intrinsics),
            img_width: camera.width,
            img_height: camera.height,
        }
    }
}

/// World-space body model parameters of one human in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanBodyParams {
    pub global_orient: NumericArray,
    pub transl: NumericArray,
    pub betas: NumericArray,
    pub body_pose: NumericArray,
}

/// Human name -> body parameters.
pub type WorldAnnotation = BTreeMap<String, HumanBodyParams>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameData {
    pub world_data: WorldAnnotation,
}

/// Per-camera annotation file lists, index-aligned with frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewAnnotationPaths {
    #[serde(rename = "pose2d_annot_path_list")]
    pub pose2d: Vec<String>,
    #[serde(rename = "bbox_annot_path_list", default)]
    pub bbox: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceAnnotation {
    pub num_frames: usize,
    pub cameras: BTreeMap<String, CameraParameters>,
    pub frame_data: Vec<FrameData>,
    pub per_view_2d_annot: BTreeMap<String, ViewAnnotationPaths>,
}

impl SequenceAnnotation {
    /// Checks that every frame-indexed list covers `num_frames`.
    pub fn validate(&self) -> Result<(), DataError> {
        if self.frame_data.len() < self.num_frames {
            return Err(DataError::InvalidSchema(format!(
                "frame_data has {} entries for {} frames",
                self.frame_data.len(),
                self.num_frames
            )));
        }
        for (camera, paths) in &self.per_view_2d_annot {
            if paths.pose2d.len() < self.num_frames {
                return Err(DataError::InvalidSchema(format!(
                    "{}: {} pose2d paths for {} frames",
                    camera,
                    paths.pose2d.len(),
                    self.num_frames
                )));
            }
            if !paths.bbox.is_empty() && paths.bbox.len() < self.num_frames {
                return Err(DataError::InvalidSchema(format!(
                    "{}: {} bbox paths for {} frames",
                    camera,
                    paths.bbox.len(),
                    self.num_frames
                )));
            }
        }
        Ok(())
    }

    pub fn world_data(&self, frame: usize) -> Result<&WorldAnnotation, DataError> {
        self.frame_data
            .get(frame)
            .map(|f| &f.world_data)
            .ok_or_else(|| DataError::FrameOutOfRange {
                what: "frame_data".to_string(),
                frame,
                len: self.frame_data.len(),
            })
    }

    fn view(&self, sequence: &str, camera: &str) -> Result<&ViewAnnotationPaths, DataError> {
        self.per_view_2d_annot
            .get(camera)
            .ok_or_else(|| DataError::MissingCamera {
                sequence: sequence.to_string(),
                camera: camera.to_string(),
            })
    }

    pub fn pose2d_path(&self, sequence: &str, camera: &str, frame: usize) -> Result<&str, DataError> {
        let paths = &self.view(sequence, camera)?.pose2d;
        paths
            .get(frame)
            .map(String::as_str)
            .ok_or_else(|| DataError::FrameOutOfRange {
                what: format!("{}/{} pose2d", sequence, camera),
                frame,
                len: paths.len(),
            })
    }

    /// `None` when the camera has no bbox annotations at all.
    pub fn bbox_path(
        &self,
        sequence: &str,
        camera: &str,
        frame: usize,
    ) -> Result<Option<&str>, DataError> {
        let paths = &self.view(sequence, camera)?.bbox;
        if paths.is_empty() {
            return Ok(None);
        }
        paths
            .get(frame)
            .map(|p| Some(p.as_str()))
            .ok_or_else(|| DataError::FrameOutOfRange {
                what: format!("{}/{} bbox", sequence, camera),
                frame,
                len: paths.len(),
            })
    }
}

/// Loads and validates the metadata blob of a small-sequence directory.
pub fn load_sequence_annotation(small_seq_dir: &Path) -> Result<SequenceAnnotation> {
    let annotation: SequenceAnnotation = read_pickle(&small_seq_dir.join(SEQUENCE_ANNOTATION_FILE))?;
    annotation.validate()?;
    Ok(annotation)
}

/// One human entry of a per-frame 2D pose annotation file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose2dRecord {
    #[serde(alias = "human_id")]
    pub human_name: String,
    pub keypoints: NumericArray,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<NumericArray>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_valid: Option<bool>,
}

impl Pose2dRecord {
    /// Entries are valid unless explicitly flagged otherwise.
    pub fn is_valid(&self) -> bool {
        self.is_valid != Some(false)
    }
}

/// One entry of a per-frame bbox annotation file, index-aligned with the
/// pose records of the same frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BboxRecord {
    pub bbox: NumericArray,
}
