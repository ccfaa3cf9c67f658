//! Inference driver: one model call per assembled sample.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use tracing::{info, warn};

use super::model::{StereoModel, View};
use super::output::InferenceArtifact;
use super::pairs::SceneGraph;
use crate::dataset::{LoadedSample, SampleRecord};

/// Outcome of a full run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSummary {
    pub processed: usize,
    pub failed: usize,
    pub written: Vec<PathBuf>,
}

pub struct InferenceDriver<M> {
    model: M,
    scene_graph: SceneGraph,
    output_dir: PathBuf,
}

/// Views in sorted camera order. A single view is duplicated so the model
/// always receives a pair.
pub fn views_for(record: SampleRecord) -> Vec<View> {
    let mut views: Vec<View> = record
        .images
        .into_values()
        .enumerate()
        .map(|(idx, image)| View {
            image,
            idx,
            instance: idx.to_string(),
        })
        .collect();

    if views.len() == 1 {
        let mut copy = views[0].clone();
        copy.idx = 1;
        views.push(copy);
    }
    views
}

impl<M: StereoModel> InferenceDriver<M> {
    pub fn new<P: AsRef<Path>>(model: M, scene_graph: SceneGraph, output_dir: P) -> Self {
        Self {
            model,
            scene_graph,
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Runs the model on one sample and writes its artifact.
    pub fn process(&mut self, record: SampleRecord) -> Result<PathBuf> {
        let sequence = record.sequence.clone();
        let frame = record.frame;
        let camera_names = record.camera_names();
        let affine_matrices = record
            .ordered_transforms()
            .iter()
            .map(|t| t.to_rows())
            .collect();

        let views = views_for(record);
        if views.is_empty() {
            bail!("{} frame {} has no views", sequence, frame);
        }
        let pairs = self.scene_graph.make_pairs(views.len())?;
        info!(
            "Running inference on {} frame {} with {} images, scene graph {}, {} pairs",
            sequence,
            frame,
            views.len(),
            self.scene_graph,
            pairs.len()
        );
        let output = self.model.infer(&views, &pairs)?;

        let artifact = InferenceArtifact {
            affine_matrices,
            output,
            img_names: (sequence, frame, camera_names),
        };
        let path = artifact.write(&self.output_dir)?;
        info!("Saved output to {}", path.display());
        Ok(path)
    }

    /// Processes samples in order. Failed samples are logged and skipped.
    pub fn run<I>(&mut self, samples: I) -> RunSummary
    where
        I: IntoIterator<Item = LoadedSample>,
    {
        let samples = samples.into_iter();
        let total = samples.size_hint().0;
        let mut summary = RunSummary::default();

        for (n, sample) in samples.enumerate() {
            let outcome = sample.result.and_then(|record| self.process(record));
            match outcome {
                Ok(path) => {
                    summary.processed += 1;
                    summary.written.push(path);
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!("Skipping {} frame {}: {:#}", sample.sequence, sample.frame, e);
                }
            }
            if (n + 1) % 10 == 0 {
                info!("Progress: {}/{} samples", n + 1, total);
            }
        }

        info!(
            "Finished: {} samples written, {} failed, outputs in {}",
            summary.processed,
            summary.failed,
            self.output_dir.display()
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::AffineTransform;
    use crate::inference::model::{ModelOutput, RawTensor};
    use crate::io::WorkingImage;
    use ndarray::Array3;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    /// Records calls and returns a constant confidence map per pair.
    #[derive(Default)]
    struct FakeModel {
        calls: Vec<(Vec<usize>, Vec<(usize, usize)>)>,
        fail_on_call: Option<usize>,
    }

    impl StereoModel for FakeModel {
        fn infer(&mut self, views: &[View], pairs: &[(usize, usize)]) -> Result<ModelOutput> {
            self.calls
                .push((views.iter().map(|v| v.idx).collect(), pairs.to_vec()));
            if self.fail_on_call == Some(self.calls.len()) {
                bail!("model failure");
            }
            let mut output = ModelOutput::default();
            for &(a, b) in pairs {
                let conf = |v: f32| {
                    BTreeMap::from([("conf".to_string(), RawTensor::new(vec![1, 1], vec![v]).unwrap())])
                };
                output
                    .push_pair(&views[a], &views[b], conf(a as f32), conf(b as f32))
                    .unwrap();
            }
            Ok(output)
        }
    }

    fn record(frame: usize, cameras: &[&str]) -> SampleRecord {
        let image = WorkingImage {
            tensor: Array3::zeros((3, 2, 2)),
            true_shape: [2, 2],
            original_size: (4, 4),
        };
        SampleRecord {
            sequence: "seq01".to_string(),
            frame,
            images: cameras.iter().map(|c| (c.to_string(), image.clone())).collect(),
            affine_transforms: cameras
                .iter()
                .map(|c| (c.to_string(), AffineTransform::crop_to_original(1920, 1080, 512, false)))
                .collect(),
            annotations_2d: BTreeMap::new(),
            world: BTreeMap::new(),
        }
    }

    fn loaded(index: usize, result: Result<SampleRecord>) -> LoadedSample {
        LoadedSample {
            index,
            sequence: "seq01".to_string(),
            frame: index * 10,
            result,
        }
    }

    #[test]
    fn test_single_view_is_duplicated() {
        let views = views_for(record(0, &["cam01"]));
        assert_eq!(views.len(), 2);
        assert_eq!(views[1].idx, 1);
        assert_eq!(views[0].image.tensor, views[1].image.tensor);
    }

    #[test]
    fn test_one_model_call_per_sample() {
        let out = tempdir().unwrap();
        let mut driver = InferenceDriver::new(FakeModel::default(), SceneGraph::Complete, out.path());

        let path = driver.process(record(10, &["cam02", "cam01", "cam03"])).unwrap();
        assert!(path.ends_with("seq01_10.pkl"));
        assert!(path.exists());

        let calls = &driver.model().calls;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, vec![0, 1, 2]);
        assert_eq!(calls[0].1.len(), 6);
    }

    #[test]
    fn test_single_camera_runs_self_pair() {
        let out = tempdir().unwrap();
        let mut driver = InferenceDriver::new(FakeModel::default(), SceneGraph::Complete, out.path());
        driver.process(record(0, &["cam01"])).unwrap();
        assert_eq!(driver.model().calls[0].1, vec![(1, 0), (0, 1)]);
    }

    #[test]
    fn test_failures_are_skipped_without_output() {
        let out = tempdir().unwrap();
        let model = FakeModel {
            fail_on_call: Some(2),
            ..FakeModel::default()
        };
        let mut driver = InferenceDriver::new(model, SceneGraph::Complete, out.path());

        let samples = vec![
            loaded(0, Ok(record(0, &["cam01", "cam02"]))),
            loaded(1, Err(anyhow::anyhow!("missing image"))),
            loaded(2, Ok(record(20, &["cam01", "cam02"]))),
            loaded(3, Ok(record(30, &["cam01", "cam02"]))),
        ];
        let summary = driver.run(samples);

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 2);
        assert!(out.path().join("seq01_0.pkl").exists());
        assert!(!out.path().join("seq01_20.pkl").exists());
        assert!(out.path().join("seq01_30.pkl").exists());
        // The load failure never reached the model.
        assert_eq!(driver.model().calls.len(), 3);
    }
}
