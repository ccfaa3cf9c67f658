//! Stereo-model inference over assembled samples.

pub mod driver;
pub mod model;
pub mod output;
pub mod pairs;

pub use driver::{InferenceDriver, RunSummary, views_for};
pub use model::{Device, ModelOutput, OnnxStereoModel, RawTensor, StereoModel, View, ViewBatch};
pub use output::{InferenceArtifact, artifact_dir, artifact_file_name};
pub use pairs::SceneGraph;
