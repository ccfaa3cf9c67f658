use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use egohumans_mvs::config::PipelineConfig;
use egohumans_mvs::dataset::{DatasetIndex, SampleAssembler, SampleLoader, Split};
use egohumans_mvs::inference::{Device, InferenceDriver, OnnxStereoModel};

/// Run the stereo model over every indexed EgoHumans sample.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML config; command-line values override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Capture root
    #[arg(long)]
    root: Option<PathBuf>,

    /// Output root
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    split: Option<Split>,

    /// Keep every N-th frame
    #[arg(long)]
    subsample_rate: Option<usize>,

    /// Requested cameras, comma separated
    #[arg(long, value_delimiter = ',')]
    cameras: Option<Vec<String>>,

    /// Only index this small sequence
    #[arg(long)]
    sequence: Option<String>,

    #[arg(long)]
    image_size: Option<u32>,

    /// complete, swin-<k>[-noncyclic], logwin-<k>[-noncyclic] or oneref-<r>
    #[arg(long)]
    scene_graph: Option<String>,

    /// cpu, cuda or cuda:<id>
    #[arg(long)]
    device: Option<Device>,

    /// ONNX model weights
    #[arg(long)]
    model: Option<PathBuf>,

    /// Loader threads (0 loads on the main thread)
    #[arg(long)]
    workers: Option<usize>,

    /// Write the index as CSV and exit
    #[arg(long)]
    dump_index: Option<PathBuf>,
}

impl Cli {
    fn resolve(self) -> Result<(PipelineConfig, Option<PathBuf>)> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(root) = self.root {
            config.root = root;
        }
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        if let Some(split) = self.split {
            config.split = split;
        }
        if let Some(rate) = self.subsample_rate {
            config.subsample_rate = rate;
        }
        if self.cameras.is_some() {
            config.camera_names = self.cameras;
        }
        if self.sequence.is_some() {
            config.sequence = self.sequence;
        }
        if let Some(size) = self.image_size {
            config.image_size = size;
        }
        if let Some(scene_graph) = self.scene_graph {
            config.scene_graph = scene_graph;
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(model) = self.model {
            config.model_path = model;
        }
        if let Some(workers) = self.workers {
            config.num_workers = workers;
        }
        config.validate()?;
        Ok((config, self.dump_index))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config, dump_index) = Cli::parse().resolve()?;
    info!("Loading EgoHumans data from {}", config.root.display());

    let index = Arc::new(DatasetIndex::build(&config.root, config.index_options())?);
    if let Some(path) = dump_index {
        index.write_csv(&path)?;
        info!("Wrote {} samples to {}", index.len(), path.display());
        return Ok(());
    }

    let assembler = Arc::new(SampleAssembler::new(
        index.catalog(),
        config.camera_names(),
        config.assembler_options(),
    ));
    let loader = SampleLoader::new(Arc::clone(&index), assembler, config.num_workers);

    let model = OnnxStereoModel::new(&config.model_path, config.device)?;
    let mut driver = InferenceDriver::new(model, config.scene_graph()?, config.artifact_dir());
    let summary = driver.run(loader);

    println!(
        "Processed {} of {} samples ({} failed)",
        summary.processed,
        index.len(),
        summary.failed
    );
    Ok(())
}
