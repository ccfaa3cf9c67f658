//! Boundary to the pairwise stereo reconstruction model.
//!
//! The model sees two working images at a time and predicts per-pixel 3D
//! points and confidences for both. `StereoModel::infer` is called once per
//! sample with all of that sample's pairs; the ONNX implementation runs the
//! pairs one by one (batch size 1) and concatenates the results.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use ndarray::{Array2, Axis};
use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::DataError;
use crate::io::WorkingImage;

/// ONNX input names.
pub const INPUT_IMG1: &str = "img1";
pub const INPUT_IMG2: &str = "img2";
pub const INPUT_TRUE_SHAPE1: &str = "true_shape1";
pub const INPUT_TRUE_SHAPE2: &str = "true_shape2";

/// ONNX outputs are routed to `pred1`/`pred2` by these name prefixes.
pub const PRED1_PREFIX: &str = "pred1_";
pub const PRED2_PREFIX: &str = "pred2_";

/// One model input view.
#[derive(Debug, Clone)]
pub struct View {
    pub image: WorkingImage,
    /// Position in the sample's view list.
    pub idx: usize,
    pub instance: String,
}

/// Dense f32 array, row-major.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl RawTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            bail!("shape {:?} needs {} values, got {}", shape, expected, data.len());
        }
        Ok(Self { shape, data })
    }

    /// Concatenates `other` along the leading axis.
    pub fn append(&mut self, other: RawTensor) -> Result<()> {
        if self.shape.is_empty() {
            *self = other;
            return Ok(());
        }
        if other.shape.len() != self.shape.len() || other.shape[1..] != self.shape[1..] {
            bail!("cannot concatenate shape {:?} onto {:?}", other.shape, self.shape);
        }
        self.shape[0] += other.shape[0];
        self.data.extend(other.data);
        Ok(())
    }

    fn from_image(image: &WorkingImage) -> Self {
        let batched = image.tensor.view().insert_axis(Axis(0));
        Self {
            shape: batched.shape().to_vec(),
            data: batched.iter().copied().collect(),
        }
    }
}

/// First or second view of every pair, stacked in pair order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ViewBatch {
    pub img: RawTensor,
    pub true_shape: Vec<[u32; 2]>,
    pub idx: Vec<usize>,
    pub instance: Vec<String>,
}

impl ViewBatch {
    fn push(&mut self, view: &View) -> Result<()> {
        self.img.append(RawTensor::from_image(&view.image))?;
        self.true_shape.push(view.image.true_shape);
        self.idx.push(view.idx);
        self.instance.push(view.instance.clone());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx.is_empty()
    }
}

/// Predictions for all pairs of one sample, concatenated along the pair axis.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelOutput {
    pub view1: ViewBatch,
    pub view2: ViewBatch,
    pub pred1: BTreeMap<String, RawTensor>,
    pub pred2: BTreeMap<String, RawTensor>,
}

impl ModelOutput {
    /// Appends the prediction of one pair.
    pub fn push_pair(
        &mut self,
        first: &View,
        second: &View,
        pred1: BTreeMap<String, RawTensor>,
        pred2: BTreeMap<String, RawTensor>,
    ) -> Result<()> {
        self.view1.push(first)?;
        self.view2.push(second)?;
        for (name, tensor) in pred1 {
            self.pred1.entry(name).or_default().append(tensor)?;
        }
        for (name, tensor) in pred2 {
            self.pred2.entry(name).or_default().append(tensor)?;
        }
        Ok(())
    }

    pub fn num_pairs(&self) -> usize {
        self.view1.len()
    }
}

/// Pairwise reconstruction model.
pub trait StereoModel {
    /// Predicts every `(first, second)` pair of view indices in `pairs`.
    fn infer(&mut self, views: &[View], pairs: &[(usize, usize)]) -> Result<ModelOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl Default for Device {
    fn default() -> Self {
        Device::Cuda(0)
    }
}

impl FromStr for Device {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DataError::InvalidConfig(format!("unknown device '{}'", s));
        match s {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(invalid),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = DataError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(id) => write!(f, "cuda:{}", id),
        }
    }
}

#[cfg(feature = "cuda")]
fn with_device(builder: SessionBuilder, device: Device) -> Result<SessionBuilder> {
    match device {
        Device::Cpu => Ok(builder),
        Device::Cuda(id) => {
            info!("Using CUDA execution provider on device {}", id);
            let provider = ort::execution_providers::CUDAExecutionProvider::default()
                .with_device_id(id as i32)
                .build();
            Ok(builder.with_execution_providers([provider])?)
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn with_device(builder: SessionBuilder, device: Device) -> Result<SessionBuilder> {
    if let Device::Cuda(_) = device {
        tracing::warn!("Built without the `cuda` feature, running {} on CPU", device);
    }
    Ok(builder)
}

fn build_session(model_path: &Path, device: Device) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    with_device(builder, device)?
        .commit_from_file(model_path)
        .with_context(|| format!("Failed to load ONNX model {}", model_path.display()))
}

/// Stereo model exported to ONNX with inputs `img1`, `img2` (1x3xHxW),
/// `true_shape1`, `true_shape2` (1x2, i64) and outputs prefixed `pred1_` or
/// `pred2_`.
pub struct OnnxStereoModel {
    session: Session,
    model_path: PathBuf,
    output_names: Vec<String>,
}

impl OnnxStereoModel {
    pub fn new<P: AsRef<Path>>(model_path: P, device: Device) -> Result<Self> {
        let model_path = model_path.as_ref().to_path_buf();
        let session = build_session(&model_path, device)?;
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        info!("Loaded {} with outputs {:?}", model_path.display(), output_names);
        Ok(Self {
            session,
            model_path,
            output_names,
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn run_pair(
        &mut self,
        first: &View,
        second: &View,
    ) -> Result<(BTreeMap<String, RawTensor>, BTreeMap<String, RawTensor>)> {
        let img1 = Tensor::from_array(first.image.tensor.clone().insert_axis(Axis(0)))?;
        let img2 = Tensor::from_array(second.image.tensor.clone().insert_axis(Axis(0)))?;
        let shape1 = Tensor::from_array(true_shape_array(&first.image))?;
        let shape2 = Tensor::from_array(true_shape_array(&second.image))?;

        let outputs = self
            .session
            .run(ort::inputs![
                INPUT_IMG1 => img1,
                INPUT_IMG2 => img2,
                INPUT_TRUE_SHAPE1 => shape1,
                INPUT_TRUE_SHAPE2 => shape2
            ])
            .context("Inference failed")?;

        let mut pred1 = BTreeMap::new();
        let mut pred2 = BTreeMap::new();
        for name in &self.output_names {
            let (target, key) = if let Some(key) = name.strip_prefix(PRED1_PREFIX) {
                (&mut pred1, key)
            } else if let Some(key) = name.strip_prefix(PRED2_PREFIX) {
                (&mut pred2, key)
            } else {
                debug!("Ignoring model output {}", name);
                continue;
            };
            let array: ndarray::ArrayViewD<f32> = outputs[name.as_str()]
                .try_extract_array()
                .with_context(|| format!("Failed to extract {}", name))?;
            target.insert(
                key.to_string(),
                RawTensor {
                    shape: array.shape().to_vec(),
                    data: array.iter().copied().collect(),
                },
            );
        }
        Ok((pred1, pred2))
    }
}

fn true_shape_array(image: &WorkingImage) -> Array2<i64> {
    let [h, w] = image.true_shape;
    Array2::from_shape_fn((1, 2), |(_, c)| if c == 0 { h as i64 } else { w as i64 })
}

impl StereoModel for OnnxStereoModel {
    fn infer(&mut self, views: &[View], pairs: &[(usize, usize)]) -> Result<ModelOutput> {
        let mut output = ModelOutput::default();
        for &(a, b) in pairs {
            let (first, second) = match (views.get(a), views.get(b)) {
                (Some(first), Some(second)) => (first, second),
                _ => bail!("pair ({}, {}) out of range for {} views", a, b, views.len()),
            };
            let (pred1, pred2) = self.run_pair(first, second)?;
            output.push_pair(first, second, pred1, pred2)?;
        }
        Ok(output)
    }
}
