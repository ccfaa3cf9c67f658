//! Sequence/camera indexer.
//!
//! Walks `<root>/<big_seq>/<small_seq>` in lexicographic order, loads each
//! sequence's metadata once and keeps every subsampled frame whose camera
//! set covers all requested cameras.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::sample::{CameraPaths, SampleDescriptor};
use crate::error::DataError;
use crate::io::{CameraParameters, SequenceAnnotation, image_path_for_pose2d, load_sequence_annotation};

/// Cameras used when no camera filter is configured.
pub const DEFAULT_CAMERAS: [&str; 4] = ["cam01", "cam02", "cam03", "cam04"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    #[default]
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        };
        f.write_str(name)
    }
}

impl FromStr for Split {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            "test" => Ok(Split::Test),
            other => Err(DataError::InvalidConfig(format!("unknown split '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexOptions {
    pub split: Split,
    /// Keep frames with `frame % subsample_rate == 0`.
    pub subsample_rate: usize,
    pub camera_names: Vec<String>,
    /// Index only the small sequence with this name.
    pub sequence_filter: Option<String>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            split: Split::Test,
            subsample_rate: 10,
            camera_names: DEFAULT_CAMERAS.iter().map(|c| c.to_string()).collect(),
            sequence_filter: None,
        }
    }
}

/// Camera name -> calibration.
pub type CameraSet = BTreeMap<String, CameraParameters>;

/// Read-only camera calibration of every loaded sequence.
#[derive(Debug, Default)]
pub struct CameraCatalog {
    sequences: BTreeMap<String, Arc<CameraSet>>,
}

impl CameraCatalog {
    pub fn get(&self, sequence: &str) -> Option<&Arc<CameraSet>> {
        self.sequences.get(sequence)
    }

    pub fn contains(&self, sequence: &str) -> bool {
        self.sequences.contains_key(sequence)
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn sequence_names(&self) -> impl Iterator<Item = &str> {
        self.sequences.keys().map(String::as_str)
    }
}

/// Sorted cameras of `available` that were requested.
///
/// Shared by indexing and assembly so both agree on the camera order.
pub fn select_cameras<'a, I>(available: I, requested: &[String]) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut selected: Vec<String> = available
        .into_iter()
        .filter(|camera| requested.contains(*camera))
        .cloned()
        .collect();
    selected.sort();
    selected
}

#[derive(Debug)]
pub struct DatasetIndex {
    root: PathBuf,
    options: IndexOptions,
    catalog: Arc<CameraCatalog>,
    samples: Vec<SampleDescriptor>,
}

impl DatasetIndex {
    /// Scans `root` and builds the sample list.
    ///
    /// Sequences whose metadata cannot be loaded, and big sequences that
    /// cannot be listed, are skipped with a warning. Only an unreadable
    /// `root` is an error.
    pub fn build<P: AsRef<Path>>(root: P, options: IndexOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut catalog = CameraCatalog::default();
        let mut samples = Vec::new();

        for small_seq_dir in small_sequence_dirs(&sorted_subdirs(&root)?) {
            let name = dir_name(&small_seq_dir);
            if let Some(filter) = &options.sequence_filter {
                if &name != filter {
                    continue;
                }
            }
            if catalog.contains(&name) {
                warn!("Duplicate sequence name {}, skipping {:?}", name, small_seq_dir);
                continue;
            }

            match index_sequence(&small_seq_dir, &name, &options) {
                Ok((cameras, entries)) => {
                    debug!("Sequence {}: {} samples", name, entries.len());
                    catalog.sequences.insert(name, Arc::new(cameras));
                    samples.extend(entries);
                }
                Err(e) => warn!("Error loading sequence {}: {:#}", name, e),
            }
        }

        info!(
            "Indexed {} samples from {} sequences (split: {}, cameras: {:?}, every {} frames)",
            samples.len(),
            catalog.len(),
            options.split,
            options.camera_names,
            options.subsample_rate
        );

        Ok(Self {
            root,
            options,
            catalog: Arc::new(catalog),
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Shared handle to the camera catalog.
    pub fn catalog(&self) -> Arc<CameraCatalog> {
        Arc::clone(&self.catalog)
    }

    pub fn samples(&self) -> &[SampleDescriptor] {
        &self.samples
    }

    pub fn get(&self, index: usize) -> Option<&SampleDescriptor> {
        self.samples.get(index)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Writes one CSV row per (sample, camera).
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        writer.write_record(["sequence", "frame", "camera", "pose2d", "bbox", "image"])?;

        for sample in &self.samples {
            for (camera, paths) in &sample.paths {
                let bbox = paths
                    .bbox
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                writer.write_record([
                    sample.sequence.clone(),
                    sample.frame.to_string(),
                    camera.clone(),
                    paths.pose2d.display().to_string(),
                    bbox,
                    paths.image.display().to_string(),
                ])?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory {}", dir.display()))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() && !dir_name(&path).starts_with('.') {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Small-sequence directories of every big sequence, in order.
fn small_sequence_dirs(big_seq_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for big_seq_dir in big_seq_dirs {
        match sorted_subdirs(big_seq_dir) {
            Ok(small) => dirs.extend(small),
            Err(e) => warn!("Skipping big sequence {}: {:#}", big_seq_dir.display(), e),
        }
    }
    dirs
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Loads one small sequence and returns its cameras and retained samples.
fn index_sequence(
    dir: &Path,
    name: &str,
    options: &IndexOptions,
) -> Result<(CameraSet, Vec<SampleDescriptor>)> {
    let annotation = load_sequence_annotation(dir)?;
    let selected = select_cameras(annotation.cameras.keys(), &options.camera_names);

    let mut samples = Vec::new();
    if selected.len() != options.camera_names.len() {
        debug!(
            "Sequence {}: cameras {:?} do not cover {:?}, dropping all {} frames",
            name,
            annotation.cameras.keys().collect::<Vec<_>>(),
            options.camera_names,
            annotation.num_frames
        );
        return Ok((annotation.cameras, samples));
    }

    for frame in (0..annotation.num_frames).step_by(options.subsample_rate.max(1)) {
        samples.push(describe_frame(&annotation, name, frame, &selected)?);
    }
    Ok((annotation.cameras, samples))
}

fn describe_frame(
    annotation: &SequenceAnnotation,
    name: &str,
    frame: usize,
    cameras: &[String],
) -> Result<SampleDescriptor> {
    let mut paths = BTreeMap::new();
    for camera in cameras {
        let pose2d = annotation.pose2d_path(name, camera, frame)?;
        let bbox = annotation.bbox_path(name, camera, frame)?;
        paths.insert(
            camera.clone(),
            CameraPaths {
                pose2d: PathBuf::from(pose2d),
                bbox: bbox.map(PathBuf::from),
                image: image_path_for_pose2d(pose2d),
            },
        );
    }

    Ok(SampleDescriptor {
        sequence: name.to_string(),
        frame,
        world: annotation.world_data(frame)?.clone(),
        cameras: cameras.to_vec(),
        paths,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::egohumans::tests::{test_body, test_camera};
    use crate::io::egohumans::{FrameData, ViewAnnotationPaths};
    use crate::io::layout::SEQUENCE_ANNOTATION_FILE;
    use crate::io::pickle::write_pickle;
    use crate::io::{NumericArray, Pose2dRecord};
    use tempfile::tempdir;

    /// Pose annotation path of `camera`/`frame` inside a fixture sequence.
    pub(crate) fn pose2d_path(seq_dir: &Path, camera: &str, frame: usize) -> PathBuf {
        seq_dir
            .join("processed_data/poses2d")
            .join(camera)
            .join("rgb")
            .join(format!("{:05}.npy", frame))
    }

    pub(crate) fn pose_record(name: &str, is_valid: Option<bool>) -> Pose2dRecord {
        Pose2dRecord {
            human_name: name.to_string(),
            keypoints: NumericArray::from_rows(&[[10.0, 20.0, 0.9], [30.0, 40.0, 0.8]]),
            bbox: Some(NumericArray::from_vec(vec![5.0, 6.0, 50.0, 60.0, 1.0])),
            is_valid,
        }
    }

    /// Writes `<root>/<big>/<small>` with metadata and one pose file per
    /// (camera, frame) holding a single valid human `aria01`.
    pub(crate) fn write_sequence(
        root: &Path,
        big: &str,
        small: &str,
        num_frames: usize,
        cameras: &[&str],
    ) -> PathBuf {
        let seq_dir = root.join(big).join(small);
        fs::create_dir_all(&seq_dir).unwrap();

        let mut per_view = BTreeMap::new();
        for camera in cameras {
            let mut pose_paths = Vec::new();
            for frame in 0..num_frames {
                let path = pose2d_path(&seq_dir, camera, frame);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                write_pickle(&path, &vec![pose_record("aria01", None)]).unwrap();
                pose_paths.push(path.to_str().unwrap().to_string());
            }
            per_view.insert(
                camera.to_string(),
                ViewAnnotationPaths {
                    pose2d: pose_paths,
                    bbox: Vec::new(),
                },
            );
        }

        let annotation = SequenceAnnotation {
            num_frames,
            cameras: cameras.iter().map(|c| (c.to_string(), test_camera())).collect(),
            frame_data: (0..num_frames)
                .map(|_| FrameData {
                    world_data: BTreeMap::from([("aria01".to_string(), test_body())]),
                })
                .collect(),
            per_view_2d_annot: per_view,
        };
        write_pickle(&seq_dir.join(SEQUENCE_ANNOTATION_FILE), &annotation).unwrap();
        seq_dir
    }

    pub(crate) fn options(cameras: &[&str], rate: usize) -> IndexOptions {
        IndexOptions {
            subsample_rate: rate,
            camera_names: cameras.iter().map(|c| c.to_string()).collect(),
            ..IndexOptions::default()
        }
    }

    #[test]
    fn test_full_coverage_keeps_subsampled_frames() {
        let root = tempdir().unwrap();
        write_sequence(root.path(), "big01", "seq01", 20, &["cam01", "cam02", "cam03"]);

        let index = DatasetIndex::build(root.path(), options(&["cam01", "cam02"], 10)).unwrap();
        let frames: Vec<usize> = index.samples().iter().map(|s| s.frame).collect();
        assert_eq!(frames, vec![0, 10]);
        assert_eq!(index.samples()[0].sequence, "seq01");
        assert_eq!(index.samples()[0].cameras, vec!["cam01", "cam02"]);
        assert!(index.catalog().get("seq01").unwrap().contains_key("cam03"));
    }

    #[test]
    fn test_missing_requested_camera_drops_every_frame() {
        let root = tempdir().unwrap();
        write_sequence(root.path(), "big01", "seq01", 20, &["cam01", "cam02", "cam03"]);

        let index = DatasetIndex::build(root.path(), options(&["cam01", "cam99"], 10)).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_frames_obey_subsample_rate() {
        let root = tempdir().unwrap();
        write_sequence(root.path(), "big01", "seq01", 17, &["cam01"]);

        for rate in [1, 2, 3, 5, 16, 17, 40] {
            let index = DatasetIndex::build(root.path(), options(&["cam01"], rate)).unwrap();
            assert!(index.samples().iter().all(|s| s.frame % rate == 0));
            assert_eq!(index.len(), (17 + rate - 1) / rate);
        }
    }

    #[test]
    fn test_paths_are_derived_per_camera() {
        let root = tempdir().unwrap();
        let seq_dir = write_sequence(root.path(), "big01", "seq01", 3, &["cam01", "cam02"]);

        let index = DatasetIndex::build(root.path(), options(&["cam02", "cam01"], 1)).unwrap();
        let sample = index.get(2).unwrap();
        let paths = &sample.paths["cam02"];
        assert_eq!(paths.pose2d, pose2d_path(&seq_dir, "cam02", 2));
        assert_eq!(paths.bbox, None);
        assert_eq!(paths.image, seq_dir.join("exo/cam02/images/00002.jpg"));
        assert_eq!(sample.world["aria01"], test_body());
    }

    #[test]
    fn test_corrupt_metadata_skips_sequence() {
        let root = tempdir().unwrap();
        write_sequence(root.path(), "big01", "seq01", 4, &["cam01"]);
        let broken = root.path().join("big01/seq02");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join(SEQUENCE_ANNOTATION_FILE), b"not a pickle").unwrap();
        fs::create_dir_all(root.path().join("big02/seq03")).unwrap();

        let index = DatasetIndex::build(root.path(), options(&["cam01"], 1)).unwrap();
        assert_eq!(index.len(), 4);
        assert_eq!(index.catalog().sequence_names().collect::<Vec<_>>(), vec!["seq01"]);
    }

    #[test]
    fn test_ordering_and_sequence_filter() {
        let root = tempdir().unwrap();
        write_sequence(root.path(), "big02", "seq_b", 2, &["cam01"]);
        write_sequence(root.path(), "big01", "seq_c", 2, &["cam01"]);
        write_sequence(root.path(), "big01", "seq_a", 2, &["cam01"]);

        let index = DatasetIndex::build(root.path(), options(&["cam01"], 1)).unwrap();
        let order: Vec<(&str, usize)> = index
            .samples()
            .iter()
            .map(|s| (s.sequence.as_str(), s.frame))
            .collect();
        assert_eq!(
            order,
            vec![("seq_a", 0), ("seq_a", 1), ("seq_c", 0), ("seq_c", 1), ("seq_b", 0), ("seq_b", 1)]
        );

        let mut filtered = options(&["cam01"], 1);
        filtered.sequence_filter = Some("seq_c".to_string());
        let index = DatasetIndex::build(root.path(), filtered).unwrap();
        assert!(index.samples().iter().all(|s| s.sequence == "seq_c"));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_select_cameras_sorted_intersection() {
        let available: Vec<String> = ["cam03", "cam01", "cam02"].iter().map(|c| c.to_string()).collect();
        let requested: Vec<String> = ["cam02", "cam03", "cam07"].iter().map(|c| c.to_string()).collect();
        assert_eq!(select_cameras(&available, &requested), vec!["cam02", "cam03"]);
    }

    #[test]
    fn test_split_parsing() {
        assert_eq!("val".parse::<Split>().unwrap(), Split::Val);
        assert_eq!(Split::Train.to_string(), "train");
        assert!("holdout".parse::<Split>().is_err());
    }

    #[test]
    fn test_index_csv_dump() {
        let root = tempdir().unwrap();
        write_sequence(root.path(), "big01", "seq01", 2, &["cam01", "cam02"]);
        let index = DatasetIndex::build(root.path(), options(&["cam01", "cam02"], 1)).unwrap();

        let csv_path = root.path().join("index.csv");
        index.write_csv(&csv_path).unwrap();

        let mut reader = csv::Reader::from_path(&csv_path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 4);
        assert_eq!(&rows[1][0], "seq01");
        assert_eq!(&rows[1][2], "cam02");
        assert!(rows[1][5].ends_with("exo/cam02/images/00000.jpg"));
    }

    #[test]
    fn test_unlistable_big_sequence_is_skipped() {
        let root = tempdir().unwrap();
        write_sequence(root.path(), "big01", "seq01", 2, &["cam01"]);
        write_sequence(root.path(), "big03", "seq03", 2, &["cam01"]);

        let big_seqs = vec![
            root.path().join("big01"),
            root.path().join("big02"),
            root.path().join("big03"),
        ];
        let small = small_sequence_dirs(&big_seqs);
        assert_eq!(small, vec![root.path().join("big01/seq01"), root.path().join("big03/seq03")]);
    }

    #[test]
    fn test_numpy_pickled_metadata_is_indexed() {
        use crate::io::pickle::tests::{NumpyPickler, Py, py_dict, py_str};

        let root = tempdir().unwrap();
        let seq_dir = root.path().join("big01/seq01");
        fs::create_dir_all(&seq_dir).unwrap();

        let camera = py_dict(vec![
            ("cam2world_R", Py::F64Array(vec![3, 3], vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])),
            ("cam2world_t", Py::F64Array(vec![3], vec![0.1, 0.2, 0.3])),
            (
                "K",
                Py::F64Array(vec![3, 3], vec![1000.0, 0.0, 960.0, 0.0, 1000.0, 540.0, 0.0, 0.0, 1.0]),
            ),
            ("img_width", Py::Int(1920)),
            ("img_height", Py::Int(1080)),
        ]);
        let body = || {
            py_dict(vec![
                ("global_orient", Py::F32Array(vec![3], vec![0.0, 0.5, 0.25])),
                ("transl", Py::F32Array(vec![3], vec![1.0, 2.0, 3.0])),
                ("betas", Py::F32Array(vec![10], vec![0.0; 10])),
                ("body_pose", Py::F32Array(vec![23, 3], vec![0.125; 69])),
            ])
        };
        let frames = (0..3)
            .map(|_| py_dict(vec![("world_data", py_dict(vec![("aria01", body())]))]))
            .collect();
        let pose_paths = (0..3)
            .map(|f| py_str(pose2d_path(&seq_dir, "cam01", f).to_str().unwrap()))
            .collect();
        let meta = py_dict(vec![
            ("num_frames", Py::Int(3)),
            ("cameras", py_dict(vec![("cam01", camera)])),
            ("frame_data", Py::List(frames)),
            (
                "per_view_2d_annot",
                py_dict(vec![(
                    "cam01",
                    py_dict(vec![
                        ("pose2d_annot_path_list", Py::List(pose_paths)),
                        ("bbox_annot_path_list", Py::List(Vec::new())),
                    ]),
                )]),
            ),
        ]);
        fs::write(seq_dir.join(SEQUENCE_ANNOTATION_FILE), NumpyPickler::dumps(&meta)).unwrap();

        let index = DatasetIndex::build(root.path(), options(&["cam01"], 2)).unwrap();
        assert_eq!(index.len(), 2);
        let catalog = index.catalog();
        let camera = &catalog.get("seq01").unwrap()["cam01"];
        assert_eq!(camera.intrinsics[(1, 2)], 540.0);
        assert_eq!(camera.width, 1920);
        let body = &index.get(1).unwrap().world["aria01"];
        assert_eq!(body.global_orient.data(), &[0.0, 0.5, 0.25]);
        assert_eq!(body.body_pose.shape(), &[23, 3]);
    }
}
