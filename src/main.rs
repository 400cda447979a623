//! schedcost CLI
//!
//! Offline tooling around the learned cost model.
//!
//! # Usage
//!
//! ## Retrain from benchmark samples
//! ```bash
//! find samples/ -name '*.sample' > files.txt
//! cargo run --bin schedcost -- retrain \
//!   --samples-list files.txt \
//!   --initial-weights baseline.weights \
//!   --weights-out trained.weights \
//!   --epochs 10 --rates 0.0001
//! ```
//!
//! Add `--best-benchmark best.txt --best-schedule best.schedule.h` to record
//! the fastest measured schedule.
//!
//! ## Convert a legacy weights directory to a binary file
//! ```bash
//! cargo run --bin schedcost -- convert --input weights_dir/ --output model.weights
//! ```
//!
//! ## Inspect weights
//! ```bash
//! cargo run --bin schedcost -- inspect --weights model.weights
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use schedcost::cost_model::CostModel;
use schedcost::predictor::{self, BatchView, CostBreakdown};
use schedcost::retrain::{self, RetrainConfig};
use schedcost::samples;
use schedcost::weights;
use schedcost::{CostModelConfig, LearnedCostModel, Weights};

#[derive(Parser)]
#[clap(name = "schedcost")]
#[clap(about = "schedcost - Learned cost model for ranking loop schedules")]
#[clap(version = "0.1")]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Retrain the model on measured `.sample` files
    ///
    /// Sample paths are read one per line from a list file. Pipelines are
    /// grouped by feature hash; with more than 16 pipelines a fixed eighth of
    /// them is held out for validation. One JSON report is printed per epoch.
    Retrain {
        /// File listing `.sample` paths, one per line
        #[clap(long = "samples-list", value_name = "FILE")]
        samples_list: PathBuf,

        /// Weights to start from (`.weights` file or legacy directory)
        #[clap(long = "initial-weights", value_name = "PATH")]
        initial_weights: Option<PathBuf>,

        /// Where to save weights after every epoch
        #[clap(long = "weights-out", value_name = "PATH")]
        weights_out: PathBuf,

        /// Start from random weights
        #[clap(long = "randomize-weights", conflicts_with = "initial_weights")]
        randomize_weights: bool,

        /// Epochs per learning rate
        #[clap(long = "epochs", default_value = "1")]
        epochs: usize,

        /// Comma-separated learning rates
        #[clap(long = "rates", default_value = "0.0001", value_delimiter = ',')]
        rates: Vec<f32>,

        /// Core count of the benchmarking machine
        #[clap(long = "num-cores", default_value = "32")]
        num_cores: usize,

        /// Seed for random weights and batch windows
        #[clap(long = "seed")]
        seed: Option<u64>,

        /// Write the best-runtime line to this file
        #[clap(long = "best-benchmark", value_name = "FILE")]
        best_benchmark: Option<PathBuf>,

        /// Copy the `.schedule.h` beside the fastest sample to this file
        #[clap(long = "best-schedule", value_name = "FILE")]
        best_schedule: Option<PathBuf>,
    },

    /// Convert weights between the legacy directory and binary formats
    ///
    /// The format of each side is chosen by its suffix: `.weights` is a binary
    /// file, anything else a directory.
    Convert {
        #[clap(long = "input", short = 'i', value_name = "PATH")]
        input: PathBuf,

        #[clap(long = "output", short = 'o', value_name = "PATH")]
        output: PathBuf,
    },

    /// Write freshly randomized weights
    Randomize {
        #[clap(long = "output", short = 'o', value_name = "PATH")]
        output: PathBuf,

        #[clap(long = "seed")]
        seed: Option<u64>,
    },

    /// Print tensor shapes and statistics, optionally explaining one sample
    Inspect {
        /// Weights to inspect; the embedded baseline when omitted
        #[clap(long = "weights", value_name = "PATH")]
        weights: Option<PathBuf>,

        /// A `.sample` file to break down by cost term
        #[clap(long = "sample", value_name = "FILE")]
        sample: Option<PathBuf>,

        #[clap(long = "num-cores", default_value = "32")]
        num_cores: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();

    match args.command {
        Commands::Retrain {
            samples_list,
            initial_weights,
            weights_out,
            randomize_weights,
            epochs,
            rates,
            num_cores,
            seed,
            best_benchmark,
            best_schedule,
        } => {
            let model_config = CostModelConfig {
                weights_in: initial_weights,
                weights_out: Some(weights_out),
                randomize_weights,
                seed,
            };
            let retrain_config = RetrainConfig {
                epochs,
                rates,
                num_cores,
                seed,
            };
            let outputs = BestOutputs {
                benchmark: best_benchmark,
                schedule: best_schedule,
            };
            retrain_command(&samples_list, model_config, &retrain_config, &outputs)
        }
        Commands::Convert { input, output } => {
            let mut w = Weights::zeros();
            if !weights::load_path(&mut w, &input) {
                return Err(format!("unable to load weights from {}", input.display()).into());
            }
            if !weights::save_path(&w, &output) {
                return Err(format!("unable to save weights to {}", output.display()).into());
            }
            info!("Converted {} -> {}", input.display(), output.display());
            Ok(())
        }
        Commands::Randomize { output, seed } => {
            let config = CostModelConfig {
                seed,
                ..Default::default()
            };
            let seed = config.seed_or_clock();
            let mut w = Weights::zeros();
            w.randomize(seed);
            if !weights::save_path(&w, &output) {
                return Err(format!("unable to save weights to {}", output.display()).into());
            }
            info!("Wrote random weights (seed {}) to {}", seed, output.display());
            Ok(())
        }
        Commands::Inspect {
            weights,
            sample,
            num_cores,
        } => inspect_command(weights, sample, num_cores),
    }
}

/// Route `log` records to stderr, filtered by `RUST_LOG` (default `info`)
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    Registry::default().with(filter).with(fmt_layer).init();
}

/// Optional files describing the fastest sample
struct BestOutputs {
    benchmark: Option<PathBuf>,
    schedule: Option<PathBuf>,
}

fn retrain_command(
    samples_list: &Path,
    model_config: CostModelConfig,
    config: &RetrainConfig,
    outputs: &BestOutputs,
) -> Result<(), Box<dyn std::error::Error>> {
    let listing = fs::read_to_string(samples_list)?;
    let paths: Vec<PathBuf> = listing
        .split_whitespace()
        .map(PathBuf::from)
        .collect();

    let mut training = samples::load_samples(&paths);
    match training.noise_level {
        Some(noise) => info!("Noise level: {}", noise),
        None => info!("Noise level: no repeated measurements"),
    }
    if let Some(best) = &training.best {
        if let Some(out) = &outputs.benchmark {
            best.write_summary(out)?;
        }
        if let Some(out) = &outputs.schedule {
            best.copy_schedule(out)?;
        }
    } else if outputs.benchmark.is_some() || outputs.schedule.is_some() {
        warn!("No usable samples, skipping best benchmark outputs");
    }

    let validation = training.split_validation();
    info!(
        "Number of unique schedules: {} training, {} validation",
        training.num_schedules(),
        validation.num_schedules()
    );

    let mut model = LearnedCostModel::new(model_config);
    for report in retrain::retrain(&mut model, &training, &validation, config) {
        println!("{}", serde_json::to_string(&report)?);
    }
    Ok(())
}

#[derive(Serialize)]
struct TensorSummary {
    name: &'static str,
    shape: Vec<usize>,
    min: f32,
    max: f32,
    mean: f32,
    non_finite: usize,
}

#[derive(Serialize)]
struct SampleExplanation {
    path: String,
    measured_ms: f32,
    predicted_ms: f32,
    stages: Vec<CostBreakdown>,
}

fn inspect_command(
    path: Option<PathBuf>,
    sample: Option<PathBuf>,
    num_cores: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut w = Weights::baseline();
    if let Some(path) = &path {
        if !weights::load_path(&mut w, path) {
            return Err(format!("unable to load weights from {}", path.display()).into());
        }
    }

    let summaries: Vec<TensorSummary> = w
        .iter()
        .map(|(id, t)| {
            let finite: Vec<f32> = t.data().iter().copied().filter(|v| v.is_finite()).collect();
            let (min, max) = finite
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            TensorSummary {
                name: id.name(),
                shape: t.shape().to_vec(),
                min,
                max,
                mean: finite.iter().sum::<f32>() / finite.len().max(1) as f32,
                non_finite: t.len() - finite.len(),
            }
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&summaries)?);

    if let Some(sample_path) = sample {
        let s = samples::read_sample(&sample_path)?;
        let batch = BatchView {
            pipeline: &s.pipeline_features,
            schedules: &s.schedule_features,
            stage_capacity: s.num_stages,
            batch_size: 1,
            num_stages: s.num_stages,
            num_cores,
        };
        let embedding = predictor::embed_pipeline(&w, &s.pipeline_features, s.num_stages);
        let stages = predictor::trace_item(&w, &embedding, &batch, 0);

        let mut model = LearnedCostModel::from_weights(w.clone());
        model.set_pipeline_features(&s.pipeline_features, num_cores);
        let slot = schedcost::CostSlot::new();
        model
            .enqueue(s.num_stages, slot.clone())
            .copy_from(&s.schedule_features);
        model.evaluate_costs();

        let explanation = SampleExplanation {
            path: sample_path.display().to_string(),
            measured_ms: s.runtime_ms,
            predicted_ms: slot.get().unwrap_or(0.0) as f32 * 1000.0,
            stages: stages.iter().map(CostBreakdown::of).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&explanation)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_and_random_weights_are_exclusive() {
        let both = Args::try_parse_from([
            "schedcost",
            "retrain",
            "--samples-list",
            "files.txt",
            "--weights-out",
            "out.weights",
            "--initial-weights",
            "in.weights",
            "--randomize-weights",
        ]);
        assert!(both.is_err());

        let one = Args::try_parse_from([
            "schedcost",
            "retrain",
            "--samples-list",
            "files.txt",
            "--weights-out",
            "out.weights",
            "--randomize-weights",
            "--best-benchmark",
            "best.txt",
        ]);
        match one.map(|a| a.command) {
            Ok(Commands::Retrain {
                randomize_weights,
                initial_weights,
                best_benchmark,
                ..
            }) => {
                assert!(randomize_weights);
                assert_eq!(initial_weights, None);
                assert_eq!(best_benchmark, Some(PathBuf::from("best.txt")));
            }
            _ => panic!("expected a retrain command"),
        }
    }
}
