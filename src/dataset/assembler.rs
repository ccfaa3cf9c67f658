//! Turns a sample descriptor into a fully loaded multi-view record.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::index::{CameraCatalog, select_cameras};
use super::sample::{CameraAnnotation2d, HumanAnnotation2d, SampleDescriptor, SampleRecord};
use crate::error::DataError;
use crate::geometry::AffineTransform;
use crate::io::pickle::read_record_list;
use crate::io::{BboxRecord, Pose2dRecord, load_working_image};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblerOptions {
    /// Working image size (longer side before cropping).
    pub image_size: u32,
    pub square_ok: bool,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            image_size: 512,
            square_ok: false,
        }
    }
}

/// Loads sample records. Holds only shared, read-only state, so one
/// assembler can serve several loader threads.
#[derive(Debug, Clone)]
pub struct SampleAssembler {
    catalog: Arc<CameraCatalog>,
    camera_names: Vec<String>,
    options: AssemblerOptions,
}

impl SampleAssembler {
    pub fn new(catalog: Arc<CameraCatalog>, camera_names: Vec<String>, options: AssemblerOptions) -> Self {
        Self {
            catalog,
            camera_names,
            options,
        }
    }

    pub fn options(&self) -> AssemblerOptions {
        self.options
    }

    /// Loads images, transforms and annotations of one sample.
    ///
    /// A missing image fails the whole sample with `DataError::ImageNotFound`.
    /// Malformed annotation files fail with `DataError::MalformedAnnotation`.
    pub fn load_sample(&self, descriptor: &SampleDescriptor) -> Result<SampleRecord> {
        let cameras = self
            .catalog
            .get(&descriptor.sequence)
            .ok_or_else(|| DataError::InvalidSchema(format!("unknown sequence {}", descriptor.sequence)))?;
        let selected = select_cameras(cameras.keys(), &self.camera_names);

        let mut images = BTreeMap::new();
        let mut affine_transforms = BTreeMap::new();
        let mut annotations_2d = BTreeMap::new();

        for camera in &selected {
            let paths = descriptor
                .paths
                .get(camera)
                .ok_or_else(|| DataError::MissingCamera {
                    sequence: descriptor.sequence.clone(),
                    camera: camera.clone(),
                })?;

            let image = load_working_image(&paths.image, self.options.image_size, self.options.square_ok)?;
            let (width, height) = image.original_size;
            let transform =
                AffineTransform::crop_to_original(width, height, self.options.image_size, self.options.square_ok);
            images.insert(camera.clone(), image);
            affine_transforms.insert(camera.clone(), transform);

            if paths.image.exists() {
                let humans = load_camera_annotations(&paths.pose2d, paths.bbox.as_deref())
                    .with_context(|| {
                        format!("{} frame {} {}", descriptor.sequence, descriptor.frame, camera)
                    })?;
                annotations_2d.insert(camera.clone(), humans);
            }
        }

        Ok(SampleRecord {
            sequence: descriptor.sequence.clone(),
            frame: descriptor.frame,
            images,
            affine_transforms,
            annotations_2d,
            world: descriptor.world.clone(),
        })
    }
}

/// Per-human 2D annotations of one camera, invalid entries removed.
///
/// The bbox comes from the bbox file (index-aligned with the pose entries)
/// when one is recorded, otherwise from the pose entry itself.
fn load_camera_annotations(pose2d_path: &Path, bbox_path: Option<&Path>) -> Result<CameraAnnotation2d> {
    let poses: Vec<Pose2dRecord> = read_record_list(pose2d_path)?;
    let boxes = bbox_path.map(read_record_list::<BboxRecord>).transpose()?;

    let mut humans = BTreeMap::new();
    for (i, pose) in poses.into_iter().enumerate() {
        if !pose.is_valid() {
            continue;
        }
        let bbox = match &boxes {
            Some(boxes) => boxes.get(i).map(|b| b.bbox.clone()),
            None => pose.bbox.clone(),
        };
        let bbox = bbox.ok_or_else(|| DataError::MalformedAnnotation {
            path: bbox_path.unwrap_or(pose2d_path).to_path_buf(),
            reason: format!("no bbox for entry {} ({})", i, pose.human_name),
        })?;

        humans.insert(
            pose.human_name,
            HumanAnnotation2d {
                pose2d: pose.keypoints,
                bbox,
            },
        );
    }
    Ok(humans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::index::DatasetIndex;
    use crate::dataset::index::tests::{options, pose2d_path, pose_record, write_sequence};
    use crate::geometry::affine_for_image;
    use crate::io::NumericArray;
    use crate::io::image::tests::write_test_image;
    use crate::io::image_path_for_pose2d;
    use crate::io::pickle::write_pickle;
    use approx::assert_relative_eq;
    use std::fs;
    use tempfile::tempdir;

    fn write_images(seq_dir: &Path, cameras: &[&str], frames: usize) {
        for camera in cameras {
            for frame in 0..frames {
                let pose = pose2d_path(seq_dir, camera, frame);
                write_test_image(&image_path_for_pose2d(pose.to_str().unwrap()), 96, 54);
            }
        }
    }

    fn assembler(index: &DatasetIndex) -> SampleAssembler {
        SampleAssembler::new(
            index.catalog(),
            index.options().camera_names.clone(),
            AssemblerOptions::default(),
        )
    }

    #[test]
    fn test_load_sample_images_transforms_and_annotations() {
        let root = tempdir().unwrap();
        let seq_dir = write_sequence(root.path(), "big01", "seq01", 10, &["cam01", "cam02", "cam03"]);
        write_images(&seq_dir, &["cam01", "cam02", "cam03"], 10);

        let index = DatasetIndex::build(root.path(), options(&["cam02", "cam01"], 5)).unwrap();
        let record = assembler(&index).load_sample(index.get(1).unwrap()).unwrap();

        assert_eq!(record.sequence, "seq01");
        assert_eq!(record.frame, 5);
        assert_eq!(record.camera_names(), vec!["cam01", "cam02"]);
        // 96x54 -> 512x288
        assert_eq!(record.images["cam01"].true_shape, [288, 512]);
        let rows = record.affine_transforms["cam02"].to_rows();
        assert_relative_eq!(rows[0][0], 96.0 / 512.0, epsilon = 1e-12);
        assert_relative_eq!(rows[1][1], 54.0 / 288.0, epsilon = 1e-12);

        let human = &record.annotations_2d["cam01"]["aria01"];
        assert_eq!(human.pose2d.shape(), &[2, 3]);
        assert_eq!(human.bbox.data(), &[5.0, 6.0, 50.0, 60.0, 1.0]);
        assert!(record.world.contains_key("aria01"));
    }

    #[test]
    fn test_invalid_human_is_dropped() {
        let root = tempdir().unwrap();
        let seq_dir = write_sequence(root.path(), "big01", "seq01", 1, &["cam01"]);
        write_images(&seq_dir, &["cam01"], 1);
        write_pickle(
            &pose2d_path(&seq_dir, "cam01", 0),
            &vec![pose_record("aria01", Some(false)), pose_record("aria02", Some(true))],
        )
        .unwrap();

        let index = DatasetIndex::build(root.path(), options(&["cam01"], 1)).unwrap();
        let record = assembler(&index).load_sample(index.get(0).unwrap()).unwrap();
        let humans = &record.annotations_2d["cam01"];
        assert!(!humans.contains_key("aria01"));
        assert!(humans.contains_key("aria02"));
    }

    #[test]
    fn test_bbox_file_takes_precedence() {
        let root = tempdir().unwrap();
        let seq_dir = write_sequence(root.path(), "big01", "seq01", 1, &["cam01"]);
        write_images(&seq_dir, &["cam01"], 1);
        let bbox_path = seq_dir.join("processed_data/bboxes/cam01/rgb/00000.npy");
        fs::create_dir_all(bbox_path.parent().unwrap()).unwrap();
        write_pickle(
            &bbox_path,
            &vec![BboxRecord {
                bbox: NumericArray::from_vec(vec![1.0, 2.0, 3.0, 4.0, 0.5]),
            }],
        )
        .unwrap();

        let index = DatasetIndex::build(root.path(), options(&["cam01"], 1)).unwrap();
        let mut descriptor = index.get(0).unwrap().clone();
        descriptor.paths.get_mut("cam01").unwrap().bbox = Some(bbox_path);

        let record = assembler(&index).load_sample(&descriptor).unwrap();
        assert_eq!(
            record.annotations_2d["cam01"]["aria01"].bbox.data(),
            &[1.0, 2.0, 3.0, 4.0, 0.5]
        );
    }

    #[test]
    fn test_missing_image_fails_fast() {
        let root = tempdir().unwrap();
        let seq_dir = write_sequence(root.path(), "big01", "seq01", 1, &["cam01", "cam02"]);
        write_images(&seq_dir, &["cam01"], 1);

        let index = DatasetIndex::build(root.path(), options(&["cam01", "cam02"], 1)).unwrap();
        let err = assembler(&index).load_sample(index.get(0).unwrap()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DataError>(),
            Some(DataError::ImageNotFound(_))
        ));
    }

    #[test]
    fn test_malformed_annotation_fails_sample() {
        let root = tempdir().unwrap();
        let seq_dir = write_sequence(root.path(), "big01", "seq01", 1, &["cam01"]);
        write_images(&seq_dir, &["cam01"], 1);
        fs::write(pose2d_path(&seq_dir, "cam01", 0), b"garbage").unwrap();

        let index = DatasetIndex::build(root.path(), options(&["cam01"], 1)).unwrap();
        let err = assembler(&index).load_sample(index.get(0).unwrap()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DataError>(),
            Some(DataError::MalformedAnnotation { .. })
        ));
    }

    #[test]
    fn test_annotated_cameras_subset_of_images() {
        let root = tempdir().unwrap();
        let seq_dir = write_sequence(root.path(), "big01", "seq01", 4, &["cam01", "cam02"]);
        write_images(&seq_dir, &["cam01", "cam02"], 4);

        let index = DatasetIndex::build(root.path(), options(&["cam01", "cam02"], 1)).unwrap();
        let assembler = assembler(&index);
        for descriptor in index.samples() {
            let record = assembler.load_sample(descriptor).unwrap();
            assert!(record.annotations_2d.keys().all(|c| record.images.contains_key(c)));
            assert_eq!(record.ordered_transforms().len(), record.images.len());
        }
    }

    #[test]
    fn test_transform_matches_standalone_affine() {
        let root = tempdir().unwrap();
        let seq_dir = write_sequence(root.path(), "big01", "seq01", 1, &["cam01", "cam02"]);
        let cam01 = image_path_for_pose2d(pose2d_path(&seq_dir, "cam01", 0).to_str().unwrap());
        let cam02 = image_path_for_pose2d(pose2d_path(&seq_dir, "cam02", 0).to_str().unwrap());
        write_test_image(&cam01, 96, 54);
        write_test_image(&cam02, 40, 40);

        let index = DatasetIndex::build(root.path(), options(&["cam01", "cam02"], 1)).unwrap();
        let record = assembler(&index).load_sample(index.get(0).unwrap()).unwrap();

        for (camera, path) in [("cam01", &cam01), ("cam02", &cam02)] {
            let expected = affine_for_image(path, 512, false).unwrap();
            assert_eq!(record.affine_transforms[camera], expected);
        }
        assert_eq!(record.images["cam02"].original_size, (40, 40));
    }
}
