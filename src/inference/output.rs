//! Per-sample inference artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use super::model::ModelOutput;
use crate::io::pickle::write_pickle;

/// Subdirectory of the output root holding raw model outputs.
pub const RAW_OUTPUT_DIR: &str = "dust3r_raw_outputs";

/// `<output_root>/dust3r_raw_outputs/num_of_cams<N>`.
pub fn artifact_dir(output_root: &Path, num_cameras: usize) -> PathBuf {
    output_root
        .join(RAW_OUTPUT_DIR)
        .join(format!("num_of_cams{}", num_cameras))
}

/// `<sequence>_<frame>.pkl`, unique per sample.
pub fn artifact_file_name(sequence: &str, frame: usize) -> String {
    format!("{}_{}.pkl", sequence, frame)
}

/// Everything persisted for one sample.
#[derive(Debug, Serialize)]
pub struct InferenceArtifact {
    /// One 2x3 working-to-original transform per camera, sorted by camera.
    pub affine_matrices: Vec<[[f64; 3]; 2]>,
    pub output: ModelOutput,
    /// (sequence, frame, sorted camera names).
    pub img_names: (String, usize, Vec<String>),
}

impl InferenceArtifact {
    pub fn sequence(&self) -> &str {
        &self.img_names.0
    }

    pub fn frame(&self) -> usize {
        self.img_names.1
    }

    /// Serializes in memory, then writes `dir/<sequence>_<frame>.pkl`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(artifact_file_name(self.sequence(), self.frame()));
        write_pickle(&path, self)?;
        Ok(path)
    }
}
