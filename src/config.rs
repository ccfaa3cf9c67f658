//! Pipeline configuration, loadable from YAML.
//!
//! Every field has a default, so a config file only needs the values that
//! differ:
//!
//! ```yaml
//! root: /data/egohumans
//! camera_names: [cam01, cam02]
//! device: cuda:1
//! ```

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dataset::{AssemblerOptions, DEFAULT_CAMERAS, IndexOptions, Split};
use crate::error::DataError;
use crate::geometry::PATCH_ALIGN;
use crate::inference::{Device, SceneGraph, artifact_dir};

fn default_root() -> PathBuf {
    PathBuf::from("./data/egohumans_data")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./outputs/egohumans")
}

fn default_subsample_rate() -> usize {
    10
}

fn default_image_size() -> u32 {
    512
}

fn default_scene_graph() -> String {
    "complete".to_string()
}

fn default_model_path() -> PathBuf {
    PathBuf::from("./checkpoints/DUSt3R_ViTLarge_BaseDecoder_512_dpt.onnx")
}

fn default_num_workers() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Capture root holding `<big_seq>/<small_seq>` directories.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub split: Split,
    #[serde(default = "default_subsample_rate")]
    pub subsample_rate: usize,
    /// `None` selects cam01..cam04.
    #[serde(default)]
    pub camera_names: Option<Vec<String>>,
    /// Restrict indexing to one small sequence.
    #[serde(default)]
    pub sequence: Option<String>,
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    #[serde(default)]
    pub square_ok: bool,
    #[serde(default = "default_scene_graph")]
    pub scene_graph: String,
    #[serde(default)]
    pub device: Device,
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    /// Loader threads; 0 loads samples on the main thread.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            output_dir: default_output_dir(),
            split: Split::default(),
            subsample_rate: default_subsample_rate(),
            camera_names: None,
            sequence: None,
            image_size: default_image_size(),
            square_ok: false,
            scene_graph: default_scene_graph(),
            device: Device::default(),
            model_path: default_model_path(),
            num_workers: default_num_workers(),
        }
    }
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let config: Self =
            serde_yaml::from_reader(file).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DataError> {
        if self.subsample_rate == 0 {
            return Err(DataError::InvalidConfig("subsample_rate must be at least 1".into()));
        }
        if self.image_size == 0 || self.image_size % PATCH_ALIGN != 0 {
            return Err(DataError::InvalidConfig(format!(
                "image_size must be a positive multiple of {}, got {}",
                PATCH_ALIGN, self.image_size
            )));
        }
        let cameras = self.camera_names();
        if cameras.is_empty() {
            return Err(DataError::InvalidConfig("camera_names is empty".into()));
        }
        let unique: BTreeSet<&String> = cameras.iter().collect();
        if unique.len() != cameras.len() {
            return Err(DataError::InvalidConfig(format!(
                "camera_names has duplicates: {:?}",
                cameras
            )));
        }
        self.scene_graph()?;
        Ok(())
    }

    /// Requested cameras, falling back to the default four.
    pub fn camera_names(&self) -> Vec<String> {
        match &self.camera_names {
            Some(names) => names.clone(),
            None => DEFAULT_CAMERAS.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn scene_graph(&self) -> Result<SceneGraph, DataError> {
        self.scene_graph.parse()
    }

    pub fn index_options(&self) -> IndexOptions {
        IndexOptions {
            split: self.split,
            subsample_rate: self.subsample_rate,
            camera_names: self.camera_names(),
            sequence_filter: self.sequence.clone(),
        }
    }

    pub fn assembler_options(&self) -> AssemblerOptions {
        AssemblerOptions {
            image_size: self.image_size,
            square_ok: self.square_ok,
        }
    }

    /// Directory the per-sample artifacts are written to.
    pub fn artifact_dir(&self) -> PathBuf {
        artifact_dir(&self.output_dir, self.camera_names().len())
    }
}
